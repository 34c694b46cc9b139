// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The read-only component interface: the name-derived codec selection and
//! the configuration values the framework can query.

use crate::component::C2Status;
use crate::vda::SupportedProfile;
use crate::vda::VdaFactory;
use crate::vda::VideoCodecProfile;
use crate::Resolution;

pub const H264_DECODER_NAME: &str = "c2.vda.avc.decoder";
pub const VP8_DECODER_NAME: &str = "c2.vda.vp8.decoder";
pub const VP9_DECODER_NAME: &str = "c2.vda.vp9.decoder";
pub const H264_SECURE_DECODER_NAME: &str = "c2.vda.avc.decoder.secure";
pub const VP8_SECURE_DECODER_NAME: &str = "c2.vda.vp8.decoder.secure";
pub const VP9_SECURE_DECODER_NAME: &str = "c2.vda.vp9.decoder.secure";

/// Picture sizes are negotiated in steps of 16 in both dimensions.
const PICTURE_SIZE_ALIGNMENT: u32 = 16;

const DEFAULT_PICTURE_SIZE: Resolution = Resolution { width: 176, height: 144 };

/// Output block pool the component asks for by default: the basic graphic
/// pool of the platform store.
const DEFAULT_OUTPUT_BLOCK_POOL: u64 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Vp8,
    Vp9,
}

impl VideoCodec {
    pub fn mime(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/avc",
            VideoCodec::Vp8 => "video/x-vnd.on2.vp8",
            VideoCodec::Vp9 => "video/x-vnd.on2.vp9",
        }
    }
}

/// Buffer kind advertised for a port.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamBufferType {
    Compressed,
    RawVideo,
}

/// Allocators surfaced to the framework. Secure variants swap the linear and
/// graphic allocators for their protected counterparts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocatorId {
    Ion,
    SecureLinear,
    V4l2BufferPool,
    V4l2BufferQueue,
    SecureGraphic,
}

fn parse_component_name(name: &str) -> Option<(VideoCodec, bool)> {
    match name {
        H264_DECODER_NAME => Some((VideoCodec::H264, false)),
        H264_SECURE_DECODER_NAME => Some((VideoCodec::H264, true)),
        VP8_DECODER_NAME => Some((VideoCodec::Vp8, false)),
        VP8_SECURE_DECODER_NAME => Some((VideoCodec::Vp8, true)),
        VP9_DECODER_NAME => Some((VideoCodec::Vp9, false)),
        VP9_SECURE_DECODER_NAME => Some((VideoCodec::Vp9, true)),
        _ => None,
    }
}

pub struct ComponentIntf {
    name: String,
    codec: VideoCodec,
    secure_mode: bool,
    codec_profile: VideoCodecProfile,
    picture_size: Resolution,
    min_picture_size: Resolution,
    max_picture_size: Resolution,
}

impl ComponentIntf {
    /// Builds the interface for `name`, probing the accelerator for the
    /// supported profiles of the selected codec. The first reported profile
    /// becomes the configured one.
    pub fn new(name: &str, factory: &dyn VdaFactory) -> Result<Self, C2Status> {
        let Some((codec, secure_mode)) = parse_component_name(name) else {
            log::error!("invalid component name: {}", name);
            return Err(C2Status::BadValue);
        };

        let profiles: Vec<SupportedProfile> = factory.supported_profiles(codec);
        let Some(first) = profiles.first() else {
            log::error!("no supported profile for codec {:?}", codec);
            return Err(C2Status::BadValue);
        };

        Ok(Self {
            name: name.to_owned(),
            codec,
            secure_mode,
            codec_profile: first.profile,
            picture_size: DEFAULT_PICTURE_SIZE,
            min_picture_size: first.min_resolution,
            max_picture_size: first.max_resolution,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn is_secure(&self) -> bool {
        self.secure_mode
    }

    pub fn codec_profile(&self) -> VideoCodecProfile {
        self.codec_profile
    }

    pub fn input_stream_buffer_type(&self) -> StreamBufferType {
        StreamBufferType::Compressed
    }

    pub fn output_stream_buffer_type(&self) -> StreamBufferType {
        StreamBufferType::RawVideo
    }

    pub fn input_mime(&self) -> &'static str {
        self.codec.mime()
    }

    pub fn output_mime(&self) -> &'static str {
        "video/raw"
    }

    pub fn picture_size(&self) -> Resolution {
        self.picture_size
    }

    /// Whether `size` fits the codec-reported bounds on the 16-aligned grid.
    pub fn is_supported_picture_size(&self, size: Resolution) -> bool {
        let aligned = size.width % PICTURE_SIZE_ALIGNMENT == 0
            && size.height % PICTURE_SIZE_ALIGNMENT == 0;
        aligned
            && size.width >= self.min_picture_size.width
            && size.height >= self.min_picture_size.height
            && size.width <= self.max_picture_size.width
            && size.height <= self.max_picture_size.height
    }

    pub fn input_allocators(&self) -> [AllocatorId; 1] {
        [if self.secure_mode { AllocatorId::SecureLinear } else { AllocatorId::Ion }]
    }

    pub fn output_allocators(&self) -> [AllocatorId; 1] {
        [AllocatorId::V4l2BufferPool]
    }

    pub fn output_surface_allocator(&self) -> AllocatorId {
        if self.secure_mode {
            AllocatorId::SecureGraphic
        } else {
            AllocatorId::V4l2BufferQueue
        }
    }

    pub fn output_block_pool_ids(&self) -> [u64; 1] {
        [DEFAULT_OUTPUT_BLOCK_POOL]
    }
}
