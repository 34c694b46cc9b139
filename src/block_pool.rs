// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The graphic block pool boundary. The pool owns the output frame memory;
//! the component only borrows blocks and identifies them by pool ID.

use std::os::fd::OwnedFd;

use thiserror::Error;

use crate::HalPixelFormat;
use crate::MemoryUsage;
use crate::PlaneLayout;
use crate::Resolution;

/// One output frame buffer lent out by the pool.
#[derive(Debug)]
pub struct GraphicBlock {
    pub handle: OwnedFd,
    pub size: Resolution,
    pub planes: Vec<PlaneLayout>,
}

impl GraphicBlock {
    pub fn width(&self) -> u32 {
        self.size.width
    }

    pub fn height(&self) -> u32 {
        self.size.height
    }
}

#[derive(Debug, Error)]
pub enum FetchBlockError {
    #[error("timed out waiting for a free block")]
    TimedOut,
    #[error("the pool cannot satisfy the request")]
    NoMemory,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Allocator of output graphic blocks. `fetch_graphic_block` blocks with a
/// pool-defined timeout; a released block resurfaces under the same pool ID.
pub trait BlockPool: Send + Sync {
    fn allocator_id(&self) -> u32;

    /// Size the pool for a session circulating `count` buffers.
    fn request_new_buffer_set(&self, count: u32) -> Result<(), FetchBlockError>;

    fn fetch_graphic_block(
        &self,
        width: u32,
        height: u32,
        format: HalPixelFormat,
        usage: MemoryUsage,
    ) -> Result<GraphicBlock, FetchBlockError>;

    /// The stable identifier of the pool slot backing `block`, surviving
    /// release and reacquisition.
    fn pool_id_of(&self, block: &GraphicBlock) -> Option<u32>;

    /// The concrete output format in secure mode, where plane layouts cannot
    /// be inspected by mapping memory. `None` when the platform has no
    /// secure backend.
    fn secure_pixel_format(&self) -> Option<HalPixelFormat> {
        None
    }
}
