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

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use winit::event::{ElementState, Event, KeyboardInput, VirtualKeyCode, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::window::Window;

mod app_config;
mod cli;
mod engine;
mod error;
mod feedback;
mod field;
mod headless;
mod kernel;
mod my_math;

use app_config::AppConfig;
use cli::Cli;
use engine::swapchain::RecreateSwapchainResult;
use engine::{Engine, FrameStatus};

const DEFAULT_CONFIG_PATH: &str = "app_config.toml";

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level().as_str()))
        .init();

    let app_config = load_config(&cli)?;
    if cli.headless {
        run_headless(&app_config, &cli)
    } else {
        run_windowed(&app_config)
    }
}

// An explicit config must load, the default one is optional
fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    match &cli.config {
        Some(path) => app_config::parse_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            app_config::parse_file(Path::new(DEFAULT_CONFIG_PATH))
                .with_context(|| format!("failed to load config {DEFAULT_CONFIG_PATH}"))
        }
        None => {
            log::info!("No {DEFAULT_CONFIG_PATH} found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

fn run_headless(app_config: &AppConfig, cli: &Cli) -> anyhow::Result<()> {
    let mut engine = Engine::new_headless(app_config).context("failed to initialise the engine")?;
    let report = headless::run(&mut engine, cli.frames, cli.verify)?;

    log::info!(
        "{} passes ({} skipped, {} verified, max error {}), time {}",
        report.passes,
        report.skipped,
        report.verified,
        report.max_error,
        report.time
    );
    log::info!(
        "{} particles, heights [{}, {}], max speed {}",
        report.stats.count,
        report.stats.min_height,
        report.stats.max_height,
        report.stats.max_speed
    );
    if !report.stats.all_finite {
        anyhow::bail!("particle state contains non-finite values");
    }
    Ok(())
}

fn run_windowed(app_config: &AppConfig) -> anyhow::Result<()> {
    // First, create global event loop to manage window events
    let event_loop = EventLoop::new();
    let mut engine = Engine::new_windowed(&event_loop, app_config).context("failed to initialise the engine")?;

    let mut recreate_swapchain = false;

    log::info!("Begin window loop...");
    event_loop.run(move |event, _, control_flow| match event {
        Event::WindowEvent {
            event: WindowEvent::CloseRequested,
            ..
        } => {
            log::info!("The close button was pressed, exiting");
            *control_flow = ControlFlow::Exit;
        }

        Event::WindowEvent {
            event:
                WindowEvent::KeyboardInput {
                    input:
                        KeyboardInput {
                            state: ElementState::Pressed,
                            virtual_keycode: Some(VirtualKeyCode::Escape),
                            ..
                        },
                    ..
                },
            ..
        } => {
            log::info!("The Escape key was pressed, exiting");
            *control_flow = ControlFlow::Exit;
        }

        Event::WindowEvent {
            event: WindowEvent::Resized(_),
            ..
        } => recreate_swapchain = true,

        // All UI events have been handled (ie., executes once per frame)
        Event::MainEventsCleared => {
            if recreate_swapchain {
                let Some(dimensions) = engine.window().map(Window::inner_size) else {
                    return;
                };
                match engine.recreate_swapchain(dimensions) {
                    Ok(RecreateSwapchainResult::Success) => recreate_swapchain = false,
                    Ok(RecreateSwapchainResult::ExtentNotSupported) => return,
                    Err(e) => {
                        log::error!("Failed to recreate swapchain: {e}");
                        *control_flow = ControlFlow::Exit;
                        return;
                    }
                }
            }

            match engine.render() {
                Ok(FrameStatus::Presented) => {}
                Ok(FrameStatus::Suboptimal | FrameStatus::OutOfDate) => recreate_swapchain = true,
                Err(e) => log::warn!("Skipping frame: {e}"),
            }
        }

        _ => {}
    })
}
