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

use vulkano::device::{Device, Queue};
use vulkano::format::Format;
use vulkano::image::view::ImageView;
use vulkano::image::{Image, ImageCreateInfo, ImageType, ImageUsage};
use vulkano::instance::InstanceExtensions;
use vulkano::memory::allocator::AllocationCreateInfo;
use vulkano::pipeline::graphics::viewport::Viewport;
use vulkano::render_pass::{Framebuffer, FramebufferCreateInfo, RenderPass, Subpass};
use vulkano::swapchain::{PresentMode, Surface, SwapchainPresentInfo};
use vulkano::sync::{self, GpuFuture};
use vulkano::{Validated, VulkanError};
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::event_loop::EventLoop;
use winit::window::{Fullscreen, Window, WindowBuilder};

pub mod core;
pub mod object;
pub mod program;
pub mod renderer;
pub mod swapchain;
pub mod utils;
pub mod vertex;

use self::core::Hardware;
use crate::app_config::{AppConfig, SimulationConfig};
use crate::error::EngineError;
use crate::field::VelocityField;
use crate::kernel::{KernelParams, SimulationClock, PARAM_MEMBERS};
use object::{Particles, VelocityVolume};
use program::{KernelSources, Program, ProgramBuilder, KERNEL_DESCRIPTORS, PARTICLE_ATTRIBUTES, PARTICLE_CAPTURES};
use renderer::AdvectionPass;
use swapchain::{EngineSwapchain, RecreateSwapchainResult};
use utils::Allocators;
use vertex::Particle;

const DEFAULT_WIDTH: u32 = 800;
const DEFAULT_HEIGHT: u32 = 450;
const OFFSCREEN_EXTENT: [u32; 2] = [64, 64];
const OFFSCREEN_FORMAT: Format = Format::R8G8B8A8_UNORM;

/// Outcome of one windowed frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
    /// Nothing was drawn, the swapchain must be recreated first.
    OutOfDate,
}

enum Target {
    Window {
        window: Arc<Window>,
        swapchain: EngineSwapchain,
        framebuffers: Vec<Arc<Framebuffer>>,
    },
    Offscreen {
        framebuffer: Arc<Framebuffer>,
    },
}

pub struct Engine {
    allocators: Allocators,
    clock: SimulationClock,
    device: Arc<Device>,
    field: VelocityField,
    particles: Particles,
    previous_frame_end: Option<Box<dyn GpuFuture>>,
    program: Program,
    queue: Arc<Queue>,
    render_pass: Arc<RenderPass>,
    simulation: SimulationConfig,
    target: Target,
    viewport: Viewport,
    volume: VelocityVolume,
}

impl Engine {
    pub fn new_windowed(event_loop: &EventLoop<()>, app_config: &AppConfig) -> Result<Self, EngineError> {
        let instance = core::create_instance(Surface::required_extensions(event_loop))?;

        // Create a window! Set some basic window properties and get a vulkan surface
        let window = Arc::new(
            WindowBuilder::new()
                .with_inner_size(LogicalSize::new(DEFAULT_WIDTH, DEFAULT_HEIGHT))
                .with_title("plume_advect")
                .with_fullscreen(if app_config.launch_fullscreen {
                    Some(Fullscreen::Borderless(None))
                } else {
                    None
                })
                .build(event_loop)
                .map_err(EngineError::context("window"))?,
        );
        let surface = Surface::from_window(instance.clone(), window.clone())
            .map_err(EngineError::context("surface"))?;

        let hardware = core::select_hardware(&instance, Some(&surface))?;
        let dimensions = window.inner_size();
        let swapchain = EngineSwapchain::new(
            &hardware.physical_device,
            hardware.device.clone(),
            surface,
            dimensions,
            PresentMode::Fifo,
        )?;
        let render_pass = create_app_render_pass(&hardware.device, swapchain.image_format())?;
        let framebuffers = create_framebuffers(&render_pass, swapchain.images())?;

        let target = Target::Window {
            window,
            swapchain,
            framebuffers,
        };
        let allocators = Allocators::new(&hardware.device);
        Self::with_target(hardware, allocators, render_pass, target, dimensions.into(), app_config)
    }

    pub fn new_headless(app_config: &AppConfig) -> Result<Self, EngineError> {
        let instance = core::create_instance(InstanceExtensions::empty())?;
        let hardware = core::select_hardware(&instance, None)?;
        let allocators = Allocators::new(&hardware.device);

        // The pass still needs an attachment to render into, its contents are never read
        let render_pass = create_app_render_pass(&hardware.device, OFFSCREEN_FORMAT)?;
        let image = Image::new(
            allocators.memory.clone(),
            ImageCreateInfo {
                image_type: ImageType::Dim2d,
                format: OFFSCREEN_FORMAT,
                extent: [OFFSCREEN_EXTENT[0], OFFSCREEN_EXTENT[1], 1],
                usage: ImageUsage::COLOR_ATTACHMENT,
                ..Default::default()
            },
            AllocationCreateInfo::default(),
        )
        .map_err(EngineError::context("offscreen image"))?;
        let framebuffer = create_framebuffers(&render_pass, &[image])?
            .pop()
            .ok_or_else(|| EngineError::ContextCreation("offscreen framebuffer".to_owned()))?;

        Self::with_target(
            hardware,
            allocators,
            render_pass,
            Target::Offscreen { framebuffer },
            OFFSCREEN_EXTENT,
            app_config,
        )
    }

    fn with_target(
        hardware: Hardware,
        allocators: Allocators,
        render_pass: Arc<RenderPass>,
        target: Target,
        dimensions: [u32; 2],
        app_config: &AppConfig,
    ) -> Result<Self, EngineError> {
        let Hardware {
            physical_device,
            device,
            queue,
        } = hardware;

        let sources = KernelSources::load(app_config.kernel_dir.as_deref())?;
        let subpass = Subpass::from(render_pass.clone(), 0)
            .ok_or_else(|| EngineError::ContextCreation("render pass has no subpass".to_owned()))?;
        let program = ProgramBuilder::new(&sources)
            .attributes(&PARTICLE_ATTRIBUTES)
            .captures(&PARTICLE_CAPTURES)
            .descriptor_names(&KERNEL_DESCRIPTORS)
            .push_constant_members(&PARAM_MEMBERS)
            .build(&device, subpass)?;
        log::info!(
            "Linked advection program: {} bound attributes, {} captured outputs, {} active uniforms",
            program.attributes().len(),
            program.captures().len(),
            program.uniforms().len()
        );

        let simulation = app_config.simulation;
        let field = VelocityField::from_config(&app_config.field, simulation.extent)
            .with_filter(VelocityVolume::supported_filter(&physical_device));
        let volume = VelocityVolume::new(&allocators, &queue, &program, &field)?;
        let particles = Particles::new(&allocators, &queue, &program, app_config.particle_count)?;

        Ok(Self {
            allocators,
            clock: SimulationClock::new(simulation.time_step),
            device,
            field,
            particles,
            previous_frame_end: None,
            program,
            queue,
            render_pass,
            simulation,
            target,
            viewport: create_viewport(dimensions),
            volume,
        })
    }

    // Recreate swapchain and necessary follow-up structures (often for window resizing)
    pub fn recreate_swapchain(
        &mut self,
        dimensions: PhysicalSize<u32>,
    ) -> Result<RecreateSwapchainResult, EngineError> {
        let Target::Window {
            swapchain,
            framebuffers,
            ..
        } = &mut self.target
        else {
            return Ok(RecreateSwapchainResult::Success);
        };

        if dimensions.width == 0 || dimensions.height == 0 {
            // Vulkan rejects zero-sized swapchains, wait for a real size
            return Ok(RecreateSwapchainResult::ExtentNotSupported);
        }
        if let RecreateSwapchainResult::ExtentNotSupported = swapchain.recreate(dimensions)? {
            return Ok(RecreateSwapchainResult::ExtentNotSupported);
        }

        // Framebuffers are tied to the swapchain images, the viewport is dynamic state
        *framebuffers = create_framebuffers(&self.render_pass, swapchain.images())?;
        self.viewport = create_viewport(dimensions.into());
        Ok(RecreateSwapchainResult::Success)
    }

    /// Run one advection pass into the next swapchain image and present it.
    ///
    /// On error the particle roles and the clock are left untouched, so the
    /// caller may simply skip the frame.
    pub fn render(&mut self) -> Result<FrameStatus, EngineError> {
        if let Some(previous) = self.previous_frame_end.as_mut() {
            previous.cleanup_finished();
        }

        let Target::Window {
            swapchain,
            framebuffers,
            ..
        } = &self.target
        else {
            return Err(EngineError::Device {
                context: "render",
                message: "engine has no window to present to".to_owned(),
            });
        };

        let Some(acquired) = swapchain.acquire_next_image()? else {
            return Ok(FrameStatus::OutOfDate);
        };
        let framebuffer = &framebuffers[acquired.image_index as usize];

        let params = KernelParams::new(&self.simulation, self.volume.size(), self.clock.time());
        let command_buffer = {
            let (source, capture) = self.particles.pair_mut().roles();
            renderer::create_advection_commands(
                &self.allocators,
                &self.queue,
                framebuffer,
                self.viewport.clone(),
                &AdvectionPass {
                    program: &self.program,
                    volume: &self.volume,
                    source: &source,
                    capture: &capture,
                    params,
                },
            )?
        };

        let future = self
            .previous_frame_end
            .take()
            .unwrap_or_else(|| sync::now(self.device.clone()).boxed())
            .join(acquired.future)
            .then_execute(self.queue.clone(), command_buffer)
            .map_err(EngineError::device("advection pass"))?
            .then_swapchain_present(
                self.queue.clone(),
                SwapchainPresentInfo::swapchain_image_index(
                    swapchain.swapchain().clone(),
                    acquired.image_index,
                ),
            )
            .then_signal_fence_and_flush();

        match future.map_err(Validated::unwrap) {
            Ok(future) => {
                self.previous_frame_end = Some(future.boxed());
                self.finish_pass();
                Ok(if acquired.suboptimal {
                    FrameStatus::Suboptimal
                } else {
                    FrameStatus::Presented
                })
            }

            // The pass was submitted, only the present missed
            Err(VulkanError::OutOfDate) => {
                self.previous_frame_end = Some(sync::now(self.device.clone()).boxed());
                self.finish_pass();
                Ok(FrameStatus::OutOfDate)
            }

            Err(e) => {
                self.previous_frame_end = Some(sync::now(self.device.clone()).boxed());
                Err(EngineError::device("advection pass")(e))
            }
        }
    }

    /// Run one advection pass off screen and wait for it to finish.
    pub fn advect(&mut self) -> Result<(), EngineError> {
        let Target::Offscreen { framebuffer } = &self.target else {
            return Err(EngineError::Device {
                context: "advect",
                message: "windowed engines advance through render()".to_owned(),
            });
        };

        let params = KernelParams::new(&self.simulation, self.volume.size(), self.clock.time());
        let command_buffer = {
            let (source, capture) = self.particles.pair_mut().roles();
            renderer::create_advection_commands(
                &self.allocators,
                &self.queue,
                framebuffer,
                self.viewport.clone(),
                &AdvectionPass {
                    program: &self.program,
                    volume: &self.volume,
                    source: &source,
                    capture: &capture,
                    params,
                },
            )?
        };

        sync::now(self.device.clone())
            .then_execute(self.queue.clone(), command_buffer)
            .map_err(EngineError::device("advection pass"))?
            .then_signal_fence_and_flush()
            .map_err(EngineError::device("advection pass"))?
            .wait(None)
            .map_err(EngineError::device("advection pass"))?;

        self.finish_pass();
        Ok(())
    }

    // The capture target becomes next frame's source
    fn finish_pass(&mut self) {
        self.particles.pair_mut().swap();
        self.clock.advance();
        log::trace!("Pass {} done, time is now {}", self.particles.frame(), self.clock.time());
    }

    /// Copy the most recent particle state back to the host.
    pub fn read_particles(&mut self) -> Result<Vec<Particle>, EngineError> {
        if let Some(previous) = self.previous_frame_end.take() {
            previous
                .then_signal_fence_and_flush()
                .map_err(EngineError::device("frame wait"))?
                .wait(None)
                .map_err(EngineError::device("frame wait"))?;
        }
        utils::read_buffer(&self.allocators, &self.queue, self.particles.latest())
    }

    /// Kernel parameters the next pass will run with.
    pub fn params(&self) -> KernelParams {
        KernelParams::new(&self.simulation, self.volume.size(), self.clock.time())
    }

    // Engine getters
    pub fn field(&self) -> &VelocityField {
        &self.field
    }
    pub fn time(&self) -> f32 {
        self.clock.time()
    }
    pub fn window(&self) -> Option<&Window> {
        match &self.target {
            Target::Window { window, .. } => Some(window),
            Target::Offscreen { .. } => None,
        }
    }
}

fn create_viewport([width, height]: [u32; 2]) -> Viewport {
    Viewport {
        offset: [0., 0.],
        extent: [width as f32, height as f32],
        depth_range: 0.0..=1.0,
    }
}

// Helper for (re)creating framebuffers
fn create_framebuffers(
    render_pass: &Arc<RenderPass>,
    images: &[Arc<Image>],
) -> Result<Vec<Arc<Framebuffer>>, EngineError> {
    images
        .iter()
        .map(|image| {
            let view = ImageView::new_default(image.clone()).map_err(EngineError::context("image view"))?;
            Framebuffer::new(
                render_pass.clone(),
                FramebufferCreateInfo {
                    attachments: vec![view],
                    ..Default::default()
                },
            )
            .map_err(EngineError::context("framebuffer"))
        })
        .collect()
}

// Helper for initializing the app render pass
fn create_app_render_pass(device: &Arc<Device>, image_format: Format) -> Result<Arc<RenderPass>, EngineError> {
    vulkano::single_pass_renderpass!(
        device.clone(),
        attachments: {
            color: {
                format: image_format,
                samples: 1,
                load_op: Clear,
                store_op: Store,
            },
        },
        pass: {
            color: [color],
            depth_stencil: {},
        },
    )
    .map_err(EngineError::context("render pass"))
}
