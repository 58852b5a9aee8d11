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

use std::fmt::Debug;
use std::path::PathBuf;

use thiserror::Error;

use crate::engine::program::Stage;

/// Failures while turning kernel sources into a usable program.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("the GLSL compiler could not be initialised")]
    CompilerUnavailable,

    #[error("can't compile {stage} stage:\n{log}")]
    Compile { stage: Stage, log: String },

    #[error("can't link program:\n{log}")]
    Link { log: String },
}

impl ProgramError {
    pub fn link(log: impl Into<String>) -> Self {
        Self::Link { log: log.into() }
    }
}

/// Misuse of the host-side kernel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KernelError {
    #[error("feedback buffers must share one capacity, read {read} particles but capture holds {capture}")]
    CapacityMismatch { read: usize, capture: usize },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to create graphics context: {0}")]
    ContextCreation(String),

    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error("device error during {context}: {message}")]
    Device {
        context: &'static str,
        message: String,
    },

    #[error("failed to read kernel source {path:?}")]
    KernelSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    // Adapters for `map_err`, vulkano's error types are only formatted, never matched on here
    pub fn context<E: Debug>(context: &'static str) -> impl FnOnce(E) -> Self {
        move |e| Self::ContextCreation(format!("{context}: {e:?}"))
    }
    pub fn device<E: Debug>(context: &'static str) -> impl FnOnce(E) -> Self {
        move |e| Self::Device {
            context,
            message: format!("{e:?}"),
        }
    }
}
