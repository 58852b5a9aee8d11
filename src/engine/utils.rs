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

use vulkano::buffer::{Buffer, BufferContents, BufferCreateInfo, BufferUsage, Subbuffer};
use vulkano::command_buffer::allocator::StandardCommandBufferAllocator;
use vulkano::command_buffer::{
    AutoCommandBufferBuilder, CommandBufferUsage, CopyBufferInfo, PrimaryAutoCommandBuffer,
};
use vulkano::descriptor_set::allocator::StandardDescriptorSetAllocator;
use vulkano::device::{Device, Queue};
use vulkano::memory::allocator::{AllocationCreateInfo, MemoryTypeFilter, StandardMemoryAllocator};
use vulkano::sync::{self, GpuFuture};

use crate::error::EngineError;

pub struct Allocators {
    pub command_buffer: StandardCommandBufferAllocator,
    pub descriptor_set: StandardDescriptorSetAllocator,
    pub memory: Arc<StandardMemoryAllocator>,
}

impl Allocators {
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            command_buffer: StandardCommandBufferAllocator::new(device.clone(), Default::default()),
            descriptor_set: StandardDescriptorSetAllocator::new(device.clone(), Default::default()),
            memory: Arc::new(StandardMemoryAllocator::new_default(device.clone())),
        }
    }
}

pub fn one_time_builder(
    allocators: &Allocators,
    queue: &Arc<Queue>,
) -> Result<AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>, EngineError> {
    AutoCommandBufferBuilder::primary(
        &allocators.command_buffer,
        queue.queue_family_index(),
        CommandBufferUsage::OneTimeSubmit,
    )
    .map_err(EngineError::device("command buffer allocation"))
}

// Submit a finished builder and block until the device is done with it
pub fn submit_and_wait(
    builder: AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>,
    queue: &Arc<Queue>,
    context: &'static str,
) -> Result<(), EngineError> {
    let command_buffer = builder.build().map_err(EngineError::device(context))?;
    sync::now(queue.device().clone())
        .then_execute(queue.clone(), command_buffer)
        .map_err(EngineError::device(context))?
        .then_signal_fence_and_flush()
        .map_err(EngineError::device(context))?
        .wait(None)
        .map_err(EngineError::device(context))
}

// Create a device-local buffer initialized with the data from the iterator
pub fn local_buffer_from_iter<T, I>(
    allocators: &Allocators,
    queue: &Arc<Queue>,
    data_iter: I,
    usage: BufferUsage,
) -> Result<Subbuffer<[T]>, EngineError>
where
    T: BufferContents,
    I: ExactSizeIterator<Item = T>,
{
    let count = data_iter.len() as u64;

    // Create simple buffer type that we can write data to
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
        data_iter,
    )
    .map_err(EngineError::device("staging buffer allocation"))?;

    // Create device-local buffer for optimal GPU access
    let local = Buffer::new_slice::<T>(
        allocators.memory.clone(),
        BufferCreateInfo {
            usage: usage | BufferUsage::TRANSFER_DST,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_DEVICE,
            ..Default::default()
        },
        count,
    )
    .map_err(EngineError::device("device-local buffer allocation"))?;

    let mut builder = one_time_builder(allocators, queue)?;
    builder
        .copy_buffer(CopyBufferInfo::buffers(staging, local.clone()))
        .map_err(EngineError::device("buffer upload"))?;
    submit_and_wait(builder, queue, "buffer upload")?;

    Ok(local)
}

// Copy a device buffer back to host memory
pub fn read_buffer<T>(
    allocators: &Allocators,
    queue: &Arc<Queue>,
    source: &Subbuffer<[T]>,
) -> Result<Vec<T>, EngineError>
where
    T: BufferContents + Clone,
{
    let readback = Buffer::new_slice::<T>(
        allocators.memory.clone(),
        BufferCreateInfo {
            usage: BufferUsage::TRANSFER_DST,
            ..Default::default()
        },
        AllocationCreateInfo {
            memory_type_filter: MemoryTypeFilter::PREFER_HOST | MemoryTypeFilter::HOST_RANDOM_ACCESS,
            ..Default::default()
        },
        source.len(),
    )
    .map_err(EngineError::device("readback buffer allocation"))?;

    let mut builder = one_time_builder(allocators, queue)?;
    builder
        .copy_buffer(CopyBufferInfo::buffers(source.clone(), readback.clone()))
        .map_err(EngineError::device("buffer readback"))?;
    submit_and_wait(builder, queue, "buffer readback")?;

    let contents = readback.read().map_err(EngineError::device("buffer readback"))?;
    Ok(contents.to_vec())
}
