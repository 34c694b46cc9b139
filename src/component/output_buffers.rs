// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The output buffer registry: every decoded-frame buffer is owned by
//! exactly one of the component, the accelerator, or the client, and all
//! transitions between those owners run through here.

use std::os::fd::AsFd;
use std::os::fd::OwnedFd;

use crate::block_pool::GraphicBlock;
use crate::component::C2Status;
use crate::resolve_buffer_format;
use crate::vda::FramePlane;
use crate::vda::VdaAdaptor;
use crate::HalPixelFormat;
use crate::Rect;
use crate::Resolution;

/// Extra picture buffers on top of the accelerator's minimum, covering
/// reorder and framework-side padding.
pub(crate) const DPB_OUTPUT_BUFFER_EXTRA_COUNT: u32 = 3;

/// Current owner of an output buffer slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum BlockOwner {
    Component,
    Accelerator,
    Client,
}

/// Bookkeeping for one output buffer slot. `graphic_block` is present unless
/// the client holds the buffer; `import_handle` is present until the first
/// hand-off to the accelerator, which takes ownership of the descriptor.
#[derive(Debug)]
pub(crate) struct GraphicBlockInfo {
    pub block_id: i32,
    pub pool_id: u32,
    pub state: BlockOwner,
    pub graphic_block: Option<GraphicBlock>,
    pub pixel_format: HalPixelFormat,
    pub import_handle: Option<OwnedFd>,
    pub planes: Vec<FramePlane>,
}

/// The negotiated output geometry.
#[derive(Clone, Debug)]
pub struct VideoFormat {
    pub pixel_format: HalPixelFormat,
    pub min_num_buffers: u32,
    pub coded_size: Resolution,
    pub visible_rect: Rect,
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self {
            pixel_format: HalPixelFormat::YCbCr420Flexible,
            min_num_buffers: 0,
            coded_size: Resolution::default(),
            visible_rect: Rect::default(),
        }
    }
}

#[derive(Default)]
pub(crate) struct OutputBufferRegistry {
    blocks: Vec<GraphicBlockInfo>,
    output_format: VideoFormat,
    pending_output_format: Option<VideoFormat>,
}

impl OutputBufferRegistry {
    pub fn output_format(&self) -> &VideoFormat {
        &self.output_format
    }

    pub fn pending_format(&self) -> Option<&VideoFormat> {
        self.pending_output_format.as_ref()
    }

    pub fn block_ids(&self) -> Vec<i32> {
        self.blocks.iter().map(|info| info.block_id).collect()
    }

    #[cfg(test)]
    pub fn info(&self, block_id: i32) -> &GraphicBlockInfo {
        &self.blocks[block_id as usize]
    }

    #[cfg(test)]
    pub fn owner_of(&self, block_id: i32) -> Option<BlockOwner> {
        self.blocks.get(block_id as usize).map(|info| info.state)
    }

    #[cfg(test)]
    pub fn client_owned_count(&self) -> usize {
        self.blocks.iter().filter(|info| info.state == BlockOwner::Client).count()
    }

    fn get_mut(&mut self, block_id: i32) -> Option<&mut GraphicBlockInfo> {
        if block_id < 0 || block_id as usize >= self.blocks.len() {
            log::error!("no graphic block with id={}", block_id);
            return None;
        }
        Some(&mut self.blocks[block_id as usize])
    }

    fn get_mut_by_pool_id(&mut self, pool_id: u32) -> Option<&mut GraphicBlockInfo> {
        let found = self.blocks.iter_mut().find(|info| info.pool_id == pool_id);
        if found.is_none() {
            log::error!("no graphic block with pool id={}", pool_id);
        }
        found
    }

    /// Starts an output format change. The accelerator has implicitly
    /// released every buffer it held, so those slots come back to the
    /// component; the new format stays pending until it can be applied.
    pub fn begin_format_change(&mut self, format: VideoFormat) -> Result<(), C2Status> {
        if self.pending_output_format.is_some() {
            log::error!("output format change requested while another is pending");
            return Err(C2Status::BadState);
        }
        for info in &mut self.blocks {
            if info.state == BlockOwner::Accelerator {
                info.state = BlockOwner::Component;
            }
        }
        self.pending_output_format = Some(format);
        Ok(())
    }

    /// Whether the pending format still waits for client-held buffers. No
    /// accelerator-owned buffer may remain at this point.
    pub fn pending_change_blocked_on_client(&self) -> Result<bool, C2Status> {
        if self.blocks.iter().any(|info| info.state == BlockOwner::Accelerator) {
            log::error!("accelerator still owns buffers during a format change");
            return Err(C2Status::BadState);
        }
        Ok(self.blocks.iter().any(|info| info.state == BlockOwner::Client))
    }

    /// Makes the pending format current and returns it. The caller
    /// reallocates the buffer set against the new geometry.
    pub fn commit_pending_format(&mut self) -> VideoFormat {
        let format = self.pending_output_format.take().unwrap_or_default();
        self.output_format.pixel_format = format.pixel_format;
        self.output_format.min_num_buffers = format.min_num_buffers;
        self.output_format.coded_size = format.coded_size;
        self.set_visible_rect(format.visible_rect);
        format
    }

    /// The visible rectangle crops every graphic buffer passed to the client.
    pub fn set_visible_rect(&mut self, visible_rect: Rect) {
        log::debug!("output crop set to {}", visible_rect);
        self.output_format.visible_rect = visible_rect;
    }

    pub fn set_min_num_buffers(&mut self, count: u32) {
        self.output_format.min_num_buffers = count;
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn clear_pending_format(&mut self) {
        self.pending_output_format = None;
    }

    /// Registers a freshly fetched block, deriving the import descriptor
    /// from its mapped plane layout.
    pub fn append_output_buffer(
        &mut self,
        block: GraphicBlock,
        pool_id: u32,
    ) -> Result<(), C2Status> {
        let layout = &block.planes;
        let mut offsets: Vec<u32> = layout.iter().map(|plane| plane.offset as u32).collect();

        let mut crcb = false;
        if layout.len() == 3 && offsets[1] > offsets[2] {
            // Chroma planes are ordered Cr then Cb.
            offsets.swap(1, 2);
            crcb = true;
        }

        let mut passed_num_planes = layout.len();
        let mut semiplanar = false;
        if layout.len() >= 2 && layout[1].col_inc == 2 {
            // Interleaved chroma; the trailing plane is not passed.
            passed_num_planes -= 1;
            semiplanar = true;
        }

        let pixel_format = resolve_buffer_format(crcb, semiplanar);

        let mut planes = Vec::with_capacity(passed_num_planes);
        for i in 0..passed_num_planes {
            if layout[i].row_stride == 0 {
                log::error!("plane {} of block {} has no stride", i, pool_id);
                return Err(C2Status::BadValue);
            }
            planes.push(FramePlane { offset: offsets[i], stride: layout[i].row_stride as u32 });
        }

        let import_handle = match block.handle.as_fd().try_clone_to_owned() {
            Ok(fd) => fd,
            Err(e) => {
                log::error!("failed to dup handle of block {}: {}", pool_id, e);
                return Err(C2Status::Corrupted);
            }
        };

        let block_id = self.blocks.len() as i32;
        log::debug!(
            "allocated graphic buffer id={}, pool id={}, size={}, format={:?}",
            block_id,
            pool_id,
            block.size,
            pixel_format
        );

        self.blocks.push(GraphicBlockInfo {
            block_id,
            pool_id,
            state: BlockOwner::Component,
            graphic_block: Some(block),
            pixel_format,
            import_handle: Some(import_handle),
            planes,
        });
        Ok(())
    }

    /// Registers a block whose memory must not be mapped. The pixel format
    /// comes from the platform and the plane vector stays empty.
    pub fn append_secure_output_buffer(
        &mut self,
        block: GraphicBlock,
        pool_id: u32,
        platform_format: Option<HalPixelFormat>,
    ) -> Result<(), C2Status> {
        let Some(pixel_format) = platform_format else {
            log::error!("no secure pixel format available on this platform");
            return Err(C2Status::Omitted);
        };

        let import_handle = match block.handle.as_fd().try_clone_to_owned() {
            Ok(fd) => fd,
            Err(e) => {
                log::error!("failed to dup handle of block {}: {}", pool_id, e);
                return Err(C2Status::Corrupted);
            }
        };

        let block_id = self.blocks.len() as i32;
        self.blocks.push(GraphicBlockInfo {
            block_id,
            pool_id,
            state: BlockOwner::Component,
            graphic_block: Some(block),
            pixel_format,
            import_handle: Some(import_handle),
            planes: Vec::new(),
        });
        Ok(())
    }

    /// Hands a component-owned buffer to the accelerator: an import on first
    /// use, a reuse afterwards.
    pub fn send_to_accelerator(
        &mut self,
        vda: &mut dyn VdaAdaptor,
        block_id: i32,
    ) -> Result<(), C2Status> {
        let Some(info) = self.get_mut(block_id) else {
            return Err(C2Status::Corrupted);
        };
        if info.state != BlockOwner::Component {
            log::error!("block {} sent to accelerator while {:?}-owned", block_id, info.state);
            return Err(C2Status::BadState);
        }
        info.state = BlockOwner::Accelerator;

        let result = match info.import_handle.take() {
            Some(handle) => {
                vda.import_buffer_for_picture(
                    info.block_id,
                    info.pixel_format,
                    handle,
                    info.planes.clone(),
                )
            }
            None => vda.reuse_picture_buffer(info.block_id),
        };
        result.map_err(|e| e.to_status())
    }

    /// Moves an accelerator-owned buffer to the client and yields the block
    /// to attach to the finished work.
    pub fn take_block_for_client(&mut self, block_id: i32) -> Result<GraphicBlock, C2Status> {
        let Some(info) = self.get_mut(block_id) else {
            return Err(C2Status::Corrupted);
        };
        if info.state != BlockOwner::Accelerator {
            log::error!("picture ready for block {} while {:?}-owned", block_id, info.state);
            return Err(C2Status::BadState);
        }
        let Some(block) = info.graphic_block.take() else {
            log::error!("accelerator-owned block {} has no graphic block", block_id);
            return Err(C2Status::Corrupted);
        };
        info.state = BlockOwner::Client;
        Ok(block)
    }

    /// Re-attaches a block the client released back to the pool. Returns the
    /// block ID for resubmission.
    pub fn return_block(&mut self, block: GraphicBlock, pool_id: u32) -> Result<i32, C2Status> {
        let Some(info) = self.get_mut_by_pool_id(pool_id) else {
            return Err(C2Status::Corrupted);
        };
        if info.state != BlockOwner::Client {
            log::error!("block with pool id {} returned while {:?}-owned", pool_id, info.state);
            return Err(C2Status::BadState);
        }
        info.graphic_block = Some(block);
        info.state = BlockOwner::Component;
        Ok(info.block_id)
    }
}
