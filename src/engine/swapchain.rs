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

use vulkano::device::physical::PhysicalDevice;
use vulkano::device::Device;
use vulkano::format::Format;
use vulkano::image::{Image, ImageUsage};
use vulkano::swapchain::{
    self, PresentMode, Surface, SurfaceInfo, Swapchain, SwapchainAcquireFuture,
    SwapchainCreateInfo,
};
use vulkano::{Validated, VulkanError};
use winit::dpi::PhysicalSize;

use crate::error::EngineError;

pub struct EngineSwapchain {
    swapchain: Arc<Swapchain>,
    images: Vec<Arc<Image>>,
}

pub enum RecreateSwapchainResult {
    Success,
    ExtentNotSupported,
}

pub struct AcquiredImage {
    pub image_index: u32,
    pub suboptimal: bool,
    pub future: SwapchainAcquireFuture,
}

impl EngineSwapchain {
    pub fn new(
        physical_device: &Arc<PhysicalDevice>,
        device: Arc<Device>,
        surface: Arc<Surface>,
        dimensions: PhysicalSize<u32>,
        desired_present_mode: PresentMode,
    ) -> Result<Self, EngineError> {
        // Determine what features our surface can support
        let surface_capabilities = physical_device
            .surface_capabilities(&surface, SurfaceInfo::default())
            .map_err(EngineError::context("surface capabilities"))?;

        let composite_alpha = surface_capabilities
            .supported_composite_alpha
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ContextCreation("surface supports no composite alpha".to_owned()))?;
        let image_format = {
            let desired_formats = [Format::R8G8B8A8_UNORM, Format::B8G8R8A8_UNORM];
            physical_device
                .surface_formats(&surface, SurfaceInfo::default())
                .map_err(EngineError::context("surface formats"))?
                .into_iter()
                .map(|(format, _)| format)
                .find(|format| desired_formats.contains(format))
                .ok_or_else(|| EngineError::ContextCreation("no suitable surface format".to_owned()))?
        };

        // Get preferred present mode with fallback to FIFO (which any Vulkan instance must support)
        let present_mode = if physical_device
            .surface_present_modes(&surface, SurfaceInfo::default())
            .map_err(EngineError::context("surface present modes"))?
            .into_iter()
            .any(|p| p == desired_present_mode)
        {
            desired_present_mode
        } else {
            log::info!("Fallback to default present mode FIFO");
            PresentMode::Fifo
        };

        // Attempt to create one more image buffer than the minimum required, but constrained by optional maximum count
        let image_count = {
            let desired_count = surface_capabilities.min_image_count + 1;
            match surface_capabilities.max_image_count {
                Some(max_count) if max_count > 0 => desired_count.min(max_count),
                _ => desired_count,
            }
        };

        let (swapchain, images) = Swapchain::new(
            device,
            surface,
            SwapchainCreateInfo {
                min_image_count: image_count,
                image_format,
                image_extent: dimensions.into(),
                image_usage: ImageUsage::COLOR_ATTACHMENT,
                composite_alpha,
                present_mode,
                ..Default::default()
            },
        )
        .map_err(EngineError::context("swapchain"))?;

        Ok(Self { swapchain, images })
    }

    // Recreate swapchain using new dimensions
    pub fn recreate(
        &mut self,
        new_dimensions: PhysicalSize<u32>,
    ) -> Result<RecreateSwapchainResult, EngineError> {
        let recreated = self.swapchain.recreate(SwapchainCreateInfo {
            image_extent: new_dimensions.into(),
            ..self.swapchain.create_info()
        });
        match recreated {
            Ok((new_swapchain, new_images)) => {
                self.swapchain = new_swapchain;
                self.images = new_images;
                Ok(RecreateSwapchainResult::Success)
            }

            // Tends to happen while the user is manually resizing the window; retry next frame
            Err(Validated::ValidationError(e)) => {
                log::debug!("Swapchain extent rejected: {e}");
                Ok(RecreateSwapchainResult::ExtentNotSupported)
            }

            Err(Validated::Error(e)) => Err(EngineError::device("swapchain recreation")(e)),
        }
    }

    // `None` when the swapchain is out of date and must be recreated
    pub fn acquire_next_image(&self) -> Result<Option<AcquiredImage>, EngineError> {
        match swapchain::acquire_next_image(self.swapchain.clone(), None).map_err(Validated::unwrap) {
            Ok((image_index, suboptimal, future)) => Ok(Some(AcquiredImage {
                image_index,
                suboptimal,
                future,
            })),
            Err(VulkanError::OutOfDate) => Ok(None),
            Err(e) => Err(EngineError::device("image acquisition")(e)),
        }
    }

    pub fn swapchain(&self) -> &Arc<Swapchain> {
        &self.swapchain
    }
    pub fn images(&self) -> &[Arc<Image>] {
        &self.images
    }
    pub fn image_format(&self) -> Format {
        self.swapchain.image_format()
    }
}
