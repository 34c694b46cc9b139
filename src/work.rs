// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Work items exchanged with the media framework.

use std::os::fd::OwnedFd;

use crate::block_pool::GraphicBlock;
use crate::component::C2Status;
use crate::Rect;

/// The work carries no frame payload and marks the end of the stream.
pub const FLAG_END_OF_STREAM: u32 = 1 << 0;
/// The input buffer holds codec configuration data rather than a frame.
pub const FLAG_CODEC_CONFIG: u32 = 1 << 1;

/// Per-frame counters stamped by the framework and copied through to the
/// output unmodified.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkOrdinal {
    pub frame_index: u64,
    pub timestamp: u64,
}

/// Mask against 30 bits so the identifier stays a positive value after
/// truncation to the signed integer the accelerator ABI expects.
pub fn frame_index_to_bitstream_id(frame_index: u64) -> i32 {
    (frame_index & 0x3FFF_FFFF) as i32
}

/// A compressed input buffer shared by the framework.
#[derive(Debug)]
pub struct LinearBlock {
    pub fd: OwnedFd,
    pub offset: u32,
    pub size: u32,
}

/// A decoded frame handed to the client, cropped to the visible rectangle.
#[derive(Debug)]
pub struct GraphicBuffer {
    pub block: GraphicBlock,
    pub crop: Rect,
}

#[derive(Debug, Default)]
pub struct InputFrame {
    pub flags: u32,
    pub ordinal: WorkOrdinal,
    /// At most one entry. `Some(None)` is the placeholder for an input that
    /// either never existed (EOS, codec config) or has been returned by the
    /// accelerator; the two are deliberately indistinguishable.
    pub buffers: Vec<Option<LinearBlock>>,
}

#[derive(Debug, Default)]
pub struct OutputFrame {
    pub flags: u32,
    pub ordinal: WorkOrdinal,
    pub buffers: Vec<GraphicBuffer>,
}

/// The single output slot of a work item.
#[derive(Debug, Default)]
pub struct Worklet {
    pub output: OutputFrame,
}

/// One unit of work submitted by the framework: at most one compressed input
/// buffer, one output slot, and a result filled in on completion.
#[derive(Debug)]
pub struct C2Work {
    pub input: InputFrame,
    pub worklet: Worklet,
    pub worklets_processed: u32,
    pub result: Option<C2Status>,
}

impl C2Work {
    pub fn new(flags: u32, ordinal: WorkOrdinal, buffer: Option<LinearBlock>) -> Self {
        Self {
            input: InputFrame { flags, ordinal, buffers: buffer.into_iter().map(Some).collect() },
            worklet: Worklet::default(),
            worklets_processed: 0,
            result: None,
        }
    }

    pub fn bitstream_id(&self) -> i32 {
        frame_index_to_bitstream_id(self.input.ordinal.frame_index)
    }

    pub fn is_eos(&self) -> bool {
        self.input.flags & FLAG_END_OF_STREAM != 0
    }

    pub fn is_codec_config(&self) -> bool {
        self.input.flags & FLAG_CODEC_CONFIG != 0
    }

    /// True once the input slot holds the placeholder, i.e. the accelerator
    /// has returned the buffer or there never was one.
    pub(crate) fn input_returned(&self) -> bool {
        matches!(self.input.buffers.first(), Some(None))
    }

    /// Drops the input buffer, leaving the placeholder behind.
    pub(crate) fn clear_input_buffer(&mut self) {
        if let Some(slot) = self.input.buffers.first_mut() {
            *slot = None;
        }
    }
}

/// How a drain request terminates the stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrainMode {
    NoDrain,
    /// Emit all in-flight output, then report an end-of-stream work.
    WithEos,
    /// Emit all in-flight output without an end-of-stream marker.
    NoEos,
}

/// A work item waiting in the incoming queue, possibly marking a drain point.
#[derive(Debug)]
pub struct QueuedWork {
    pub work: C2Work,
    pub drain_mode: DrainMode,
}
