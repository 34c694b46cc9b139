// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The boundary to the video decode accelerator: the command interface the
//! component calls, and the callback interface the accelerator drives.

use std::os::fd::OwnedFd;
use std::sync::Arc;

use thiserror::Error;

use crate::component::C2Status;
use crate::intf::VideoCodec;
use crate::HalPixelFormat;
use crate::Rect;
use crate::Resolution;

/// Codec profiles the accelerator can be opened with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VideoCodecProfile {
    H264Baseline,
    H264Main,
    H264High,
    Vp8Profile0,
    Vp9Profile0,
}

/// One entry of the accelerator's capability report.
#[derive(Copy, Clone, Debug)]
pub struct SupportedProfile {
    pub profile: VideoCodecProfile,
    pub min_resolution: Resolution,
    pub max_resolution: Resolution,
}

/// Offset and stride of one plane, as passed on first-time buffer import.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FramePlane {
    pub offset: u32,
    pub stride: u32,
}

#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum VdaError {
    #[error("illegal state for the requested operation")]
    IllegalState,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("unreadable input buffer")]
    UnreadableInput,
    #[error("platform failure")]
    PlatformFailure,
    #[error("insufficient resources")]
    InsufficientResources,
}

impl VdaError {
    /// The status surfaced to the framework when the accelerator reports
    /// this error.
    pub fn to_status(self) -> C2Status {
        match self {
            VdaError::IllegalState => C2Status::BadState,
            VdaError::InvalidArgument | VdaError::UnreadableInput => C2Status::BadValue,
            VdaError::PlatformFailure => C2Status::Corrupted,
            VdaError::InsufficientResources => C2Status::NoMemory,
        }
    }
}

pub type VdaResult<T> = std::result::Result<T, VdaError>;

/// Callbacks delivered by the accelerator. Implementations must tolerate
/// calls from any thread; the component bounces them onto its own thread.
pub trait VdaClient: Send + Sync {
    /// The stream needs `min_num_buffers` output buffers of `coded_size`.
    /// Previously assigned buffers are implicitly released.
    fn provide_picture_buffers(&self, min_num_buffers: u32, coded_size: Resolution);

    /// The accelerator will no longer write into this buffer.
    fn dismiss_picture_buffer(&self, picture_buffer_id: i32);

    /// A decoded frame for `bitstream_id` landed in the given buffer.
    /// `visible_rect` is the portion of the coded frame to display.
    fn picture_ready(&self, picture_buffer_id: i32, bitstream_id: i32, visible_rect: Rect);

    /// The input buffer submitted under `bitstream_id` has been consumed.
    fn notify_end_of_bitstream_buffer(&self, bitstream_id: i32);

    /// All queued decodes have produced their output.
    fn notify_flush_done(&self);

    /// A reset has completed; all in-flight work was dropped.
    fn notify_reset_done(&self);

    fn notify_error(&self, error: VdaError);
}

/// The command interface of the decode accelerator. One instance serves one
/// streaming session; `destroy` must be the last call.
pub trait VdaAdaptor: Send {
    fn initialize(
        &mut self,
        profile: VideoCodecProfile,
        secure_mode: bool,
        client: Arc<dyn VdaClient>,
    ) -> VdaResult<()>;

    /// Decode the compressed bytes at `offset`..`offset + bytes_used` of
    /// `fd`. The accelerator owns the descriptor from here on and emits
    /// `notify_end_of_bitstream_buffer` once the input is consumed.
    fn decode(&mut self, bitstream_id: i32, fd: OwnedFd, offset: u32, bytes_used: u32)
        -> VdaResult<()>;

    /// Announce how many picture buffers the coming imports will provide.
    fn assign_picture_buffers(&mut self, count: u32);

    /// Hand a buffer to the accelerator for the first time. The descriptor
    /// ownership moves to the accelerator.
    fn import_buffer_for_picture(
        &mut self,
        picture_buffer_id: i32,
        format: HalPixelFormat,
        fd: OwnedFd,
        planes: Vec<FramePlane>,
    ) -> VdaResult<()>;

    /// Return a previously imported buffer for another decode.
    fn reuse_picture_buffer(&mut self, picture_buffer_id: i32) -> VdaResult<()>;

    /// Finish all queued decodes, then signal `notify_flush_done`.
    fn flush(&mut self) -> VdaResult<()>;

    /// Drop all queued decodes, then signal `notify_reset_done`.
    fn reset(&mut self) -> VdaResult<()>;

    fn destroy(&mut self);
}

/// Builds adaptor instances and answers capability probes. One adaptor is
/// created per component start.
pub trait VdaFactory: Send + Sync {
    fn supported_profiles(&self, codec: VideoCodec) -> Vec<SupportedProfile>;

    fn create(&self) -> Box<dyn VdaAdaptor>;
}
