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

use vulkano::device::physical::{PhysicalDevice, PhysicalDeviceType};
use vulkano::device::{
    Device, DeviceCreateInfo, DeviceExtensions, Features, Queue, QueueCreateInfo, QueueFlags,
};
use vulkano::instance::{Instance, InstanceCreateFlags, InstanceCreateInfo, InstanceExtensions};
use vulkano::swapchain::Surface;
use vulkano::VulkanLibrary;

use crate::error::EngineError;

const DEBUG_VULKAN: bool = false;

pub struct Hardware {
    pub physical_device: Arc<PhysicalDevice>,
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
}

// Features the advection kernel can't run without
fn required_features() -> Features {
    Features {
        // The kernel writes its capture block from the vertex stage
        vertex_pipeline_stores_and_atomics: true,
        ..Features::empty()
    }
}

pub fn create_instance(enabled_extensions: InstanceExtensions) -> Result<Arc<Instance>, EngineError> {
    let library = VulkanLibrary::new().map_err(EngineError::context("Vulkan library"))?;
    Instance::new(
        library,
        InstanceCreateInfo {
            // Allows for non-conformant devices to be considered when searching for the best graphics device
            flags: InstanceCreateFlags::ENUMERATE_PORTABILITY,
            enabled_extensions,
            enabled_layers: if DEBUG_VULKAN {
                vec!["VK_LAYER_KHRONOS_validation".to_owned()]
            } else {
                vec![]
            },
            ..Default::default()
        },
    )
    .map_err(EngineError::context("Vulkan instance"))
}

// Select the best physical device for performing Vulkan operations
fn select_best_physical_device(
    instance: &Arc<Instance>,
    surface: Option<&Arc<Surface>>,
    device_extensions: &DeviceExtensions,
) -> Result<(Arc<PhysicalDevice>, u32), EngineError> {
    let features = required_features();
    instance
        .enumerate_physical_devices()
        .map_err(EngineError::context("physical device enumeration"))?
        // Require device contain at least our desired extensions and features
        .filter(|p| p.supported_extensions().contains(device_extensions))
        .filter(|p| p.supported_features().contains(&features))
        // Require device to have compatible queues and find one
        .filter_map(|p| {
            p.queue_family_properties()
                .iter()
                .enumerate()
                .position(|(i, q)| {
                    // Graphics, and presentation when there is a window to present to
                    q.queue_flags.intersects(QueueFlags::GRAPHICS)
                        && surface.map_or(true, |s| p.surface_support(i as u32, s).unwrap_or(false))
                })
                .map(|q| (p, q as u32))
        })
        // Preference from most dedicated graphics hardware to least
        .min_by_key(|(p, _)| match p.properties().device_type {
            PhysicalDeviceType::DiscreteGpu => 0,
            PhysicalDeviceType::IntegratedGpu => 1,
            PhysicalDeviceType::VirtualGpu => 2,
            PhysicalDeviceType::Cpu => 3,
            _ => 4,
        })
        .ok_or_else(|| {
            EngineError::ContextCreation(
                "no GPU with a graphics queue and vertex-stage storage writes".to_owned(),
            )
        })
}

// Retrieve resources best suited for the advection pass, optionally presenting to `surface`
pub fn select_hardware(
    instance: &Arc<Instance>,
    surface: Option<&Arc<Surface>>,
) -> Result<Hardware, EngineError> {
    let device_extensions = DeviceExtensions {
        khr_swapchain: surface.is_some(),
        ..DeviceExtensions::empty()
    };
    let (physical_device, queue_family_index) =
        select_best_physical_device(instance, surface, &device_extensions)?;

    log::info!(
        "Using device: {} (type: {:?})",
        physical_device.properties().device_name,
        physical_device.properties().device_type
    );

    // Create a logical Vulkan device object
    let (device, mut queues) = Device::new(
        physical_device.clone(),
        DeviceCreateInfo {
            queue_create_infos: vec![QueueCreateInfo {
                queue_family_index,
                ..Default::default()
            }],
            enabled_extensions: device_extensions,
            enabled_features: required_features(),
            ..Default::default()
        },
    )
    .map_err(EngineError::context("logical device"))?;

    let queue = queues
        .next()
        .ok_or_else(|| EngineError::ContextCreation("device returned no queue".to_owned()))?;

    Ok(Hardware {
        physical_device,
        device,
        queue,
    })
}
