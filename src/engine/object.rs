/*
    plume_advect - GPU particle advection through a 3D velocity field.
    Copyright (C) 2023  Ryan Andersen

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use std::sync::Arc;

use bytemuck::Zeroable;
use vulkano::buffer::{Buffer, BufferCreateInfo, BufferUsage, Subbuffer};
use vulkano::command_buffer::CopyBufferToImageInfo;
use vulkano::descriptor_set::layout::DescriptorSetLayout;
use vulkano::descriptor_set::{PersistentDescriptorSet, WriteDescriptorSet};
use vulkano::device::physical::PhysicalDevice;
use vulkano::device::Queue;
use vulkano::format::{Format, FormatFeatures};
use vulkano::image::sampler::{Filter, Sampler, SamplerAddressMode, SamplerCreateInfo};
use vulkano::image::view::ImageView;
use vulkano::image::{Image, ImageCreateInfo, ImageType, ImageUsage};
use vulkano::memory::allocator::{AllocationCreateInfo, MemoryTypeFilter};

use super::program::Program;
use super::utils::{self, Allocators};
use super::vertex::Particle;
use crate::error::{EngineError, ProgramError};
use crate::feedback::FeedbackPair;
use crate::field::{SampleFilter, VelocityField};

/// Descriptor set holding the velocity volume sampler.
pub const FIELD_SET: usize = 0;
/// Descriptor set holding the capture storage block.
pub const CAPTURE_SET: usize = 1;

const FIELD_FORMAT: Format = Format::R32G32B32A32_SFLOAT;

fn set_layout(program: &Program, set: usize) -> Result<&Arc<DescriptorSetLayout>, EngineError> {
    program.layout().set_layouts().get(set).ok_or_else(|| {
        EngineError::Program(ProgramError::link(format!(
            "kernel declares no descriptor set {set}"
        )))
    })
}

/// One particle buffer plus the descriptor set that lets the kernel capture into it.
pub struct ParticleBuffer {
    data: Subbuffer<[Particle]>,
    capture_set: Arc<PersistentDescriptorSet>,
}
impl ParticleBuffer {
    pub fn data(&self) -> &Subbuffer<[Particle]> {
        &self.data
    }
    pub fn capture_set(&self) -> &Arc<PersistentDescriptorSet> {
        &self.capture_set
    }
}

pub struct Particles {
    pair: FeedbackPair<ParticleBuffer>,
}

impl Particles {
    pub fn new(
        allocators: &Allocators,
        queue: &Arc<Queue>,
        program: &Program,
        count: usize,
    ) -> Result<Self, EngineError> {
        let layout = set_layout(program, CAPTURE_SET)?;

        // Both slots start zeroed so every particle is seeded on its first pass
        let create = || -> Result<ParticleBuffer, EngineError> {
            let data = utils::local_buffer_from_iter(
                allocators,
                queue,
                (0..count).map(|_| Particle::zeroed()),
                BufferUsage::VERTEX_BUFFER | BufferUsage::STORAGE_BUFFER | BufferUsage::TRANSFER_SRC,
            )?;
            let capture_set = PersistentDescriptorSet::new(
                &allocators.descriptor_set,
                layout.clone(),
                [WriteDescriptorSet::buffer(0, data.clone())],
                [],
            )
            .map_err(EngineError::device("capture descriptor set"))?;
            Ok(ParticleBuffer { data, capture_set })
        };
        let first = create()?;
        let second = create()?;

        log::info!("Allocated two buffers of {count} particles");
        Ok(Self {
            pair: FeedbackPair::new(first, second),
        })
    }

    pub fn pair_mut(&mut self) -> &mut FeedbackPair<ParticleBuffer> {
        &mut self.pair
    }

    /// Buffer holding the most recent particle state.
    pub fn latest(&self) -> &Subbuffer<[Particle]> {
        &self.pair.latest().data
    }

    pub fn frame(&self) -> u64 {
        self.pair.frame()
    }
}

/// The velocity field uploaded to a 3D image, bound with its sampler.
pub struct VelocityVolume {
    field_set: Arc<PersistentDescriptorSet>,
    size: [u32; 3],
}

impl VelocityVolume {
    // Linear filtering of float textures is optional in Vulkan
    pub fn supported_filter(physical_device: &PhysicalDevice) -> SampleFilter {
        match physical_device.format_properties(FIELD_FORMAT) {
            Ok(properties)
                if properties
                    .optimal_tiling_features
                    .intersects(FormatFeatures::SAMPLED_IMAGE_FILTER_LINEAR) =>
            {
                SampleFilter::Linear
            }
            _ => SampleFilter::Nearest,
        }
    }

    pub fn new(
        allocators: &Allocators,
        queue: &Arc<Queue>,
        program: &Program,
        field: &VelocityField,
    ) -> Result<Self, EngineError> {
        let size = field.size();
        let staging = Buffer::from_iter(
            allocators.memory.clone(),
            BufferCreateInfo {
                usage: BufferUsage::TRANSFER_SRC,
                ..Default::default()
            },
            AllocationCreateInfo {
                memory_type_filter: MemoryTypeFilter::PREFER_HOST | MemoryTypeFilter::HOST_SEQUENTIAL_WRITE,
                ..Default::default()
            },
            field.texels().iter().map(|&texel| <[f32; 4]>::from(texel)),
        )
        .map_err(EngineError::device("field staging buffer"))?;

        let image = Image::new(
            allocators.memory.clone(),
            ImageCreateInfo {
                image_type: ImageType::Dim3d,
                format: FIELD_FORMAT,
                extent: size,
                usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
                ..Default::default()
            },
            AllocationCreateInfo::default(),
        )
        .map_err(EngineError::device("field image"))?;

        let mut builder = utils::one_time_builder(allocators, queue)?;
        builder
            .copy_buffer_to_image(CopyBufferToImageInfo::buffer_image(staging, image.clone()))
            .map_err(EngineError::device("field upload"))?;
        utils::submit_and_wait(builder, queue, "field upload")?;

        let filter = match field.filter() {
            SampleFilter::Linear => Filter::Linear,
            SampleFilter::Nearest => Filter::Nearest,
        };
        let sampler = Sampler::new(
            queue.device().clone(),
            SamplerCreateInfo {
                mag_filter: filter,
                min_filter: filter,
                address_mode: [SamplerAddressMode::ClampToEdge; 3],
                ..Default::default()
            },
        )
        .map_err(EngineError::device("field sampler"))?;

        let view = ImageView::new_default(image).map_err(EngineError::device("field image view"))?;
        let field_set = PersistentDescriptorSet::new(
            &allocators.descriptor_set,
            set_layout(program, FIELD_SET)?.clone(),
            [WriteDescriptorSet::image_view_sampler(0, view, sampler)],
            [],
        )
        .map_err(EngineError::device("field descriptor set"))?;

        log::info!(
            "Uploaded {}x{}x{} velocity field ({:?} filtering)",
            size[0],
            size[1],
            size[2],
            field.filter()
        );
        Ok(Self { field_set, size })
    }

    pub fn field_set(&self) -> &Arc<PersistentDescriptorSet> {
        &self.field_set
    }
    pub fn size(&self) -> [u32; 3] {
        self.size
    }
}
