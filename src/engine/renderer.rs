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

use vulkano::command_buffer::{
    AutoCommandBufferBuilder, PrimaryAutoCommandBuffer, RenderPassBeginInfo, SubpassBeginInfo,
    SubpassContents, SubpassEndInfo,
};
use vulkano::device::Queue;
use vulkano::pipeline::graphics::viewport::Viewport;
use vulkano::pipeline::{Pipeline, PipelineBindPoint};
use vulkano::render_pass::Framebuffer;

use super::object::{ParticleBuffer, VelocityVolume};
use super::program::Program;
use super::utils::{self, Allocators};
use crate::error::EngineError;
use crate::feedback::{Capture, Source};
use crate::kernel::KernelParams;

/// The presented target is cleared to this before the kernel runs.
pub const CLEAR_COLOR: [f32; 4] = [1., 0., 0., 1.];

/// Everything one advection pass reads or writes.
pub struct AdvectionPass<'a> {
    pub program: &'a Program,
    pub volume: &'a VelocityVolume,
    pub source: &'a Source<'a, ParticleBuffer>,
    pub capture: &'a Capture<'a, ParticleBuffer>,
    pub params: KernelParams,
}

// Helper for initializing the rendering of a frame. Must specify clear value of each attachment
fn begin_render_pass(
    builder: &mut AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>,
    framebuffer: &Arc<Framebuffer>,
) -> Result<(), EngineError> {
    builder
        .begin_render_pass(
            RenderPassBeginInfo {
                clear_values: vec![Some(CLEAR_COLOR.into())],
                ..RenderPassBeginInfo::framebuffer(framebuffer.clone())
            },
            SubpassBeginInfo {
                contents: SubpassContents::Inline,
                ..SubpassBeginInfo::default()
            },
        )
        .map_err(EngineError::device("begin render pass"))?;
    Ok(())
}

pub fn create_advection_commands(
    allocators: &Allocators,
    queue: &Arc<Queue>,
    framebuffer: &Arc<Framebuffer>,
    viewport: Viewport,
    pass: &AdvectionPass,
) -> Result<Arc<PrimaryAutoCommandBuffer>, EngineError> {
    let mut builder = utils::one_time_builder(allocators, queue)?;

    begin_render_pass(&mut builder, framebuffer)?;
    inline_advection_cmds(&mut builder, viewport, pass)?;
    builder
        .end_render_pass(SubpassEndInfo::default())
        .map_err(EngineError::device("end render pass"))?;

    builder.build().map_err(EngineError::device("command buffer build"))
}

fn inline_advection_cmds(
    builder: &mut AutoCommandBufferBuilder<PrimaryAutoCommandBuffer>,
    viewport: Viewport,
    pass: &AdvectionPass,
) -> Result<(), EngineError> {
    let pipeline = pass.program.pipeline().clone();
    let layout = pipeline.layout().clone();
    let source = pass.source.buffer().data();
    let vertex_count = source.len() as u32;

    // Set 0 holds the field sampler, set 1 the capture block of the write buffer
    let descriptor_sets = vec![
        pass.volume.field_set().clone(),
        pass.capture.buffer().capture_set().clone(),
    ];

    builder
        .bind_pipeline_graphics(pipeline)
        .map_err(EngineError::device("bind pipeline"))?
        .set_viewport(0, [viewport].into_iter().collect())
        .map_err(EngineError::device("set viewport"))?
        .push_constants(layout.clone(), 0, pass.params)
        .map_err(EngineError::device("push constants"))?
        .bind_descriptor_sets(PipelineBindPoint::Graphics, layout, 0, descriptor_sets)
        .map_err(EngineError::device("bind descriptor sets"))?
        .bind_vertex_buffers(0, source.clone())
        .map_err(EngineError::device("bind vertex buffers"))?
        // One point per particle, gl_VertexIndex is the particle ID
        .draw(vertex_count, 1, 0, 0)
        .map_err(EngineError::device("advection draw"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clears_to_opaque_red() {
        assert_eq!(CLEAR_COLOR, [1., 0., 0., 1.]);
    }
}
