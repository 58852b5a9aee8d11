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

use crate::app_config::{FieldConfig, FieldKind};
use crate::kernel::VelocitySampler;
use crate::my_math::{Vector3, Vector4};

/// How the volume is filtered between texel centres. Mirrors the device sampler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFilter {
    Linear,
    Nearest,
}

/// A velocity volume stored x-fastest, then y, then z (the layout of a buffer-to-image copy).
///
/// Sampling clamps to the edge texels outside `[0, 1]` in every axis.
#[derive(Clone, Debug)]
pub struct VelocityField {
    size: [u32; 3],
    texels: Vec<Vector4>,
    filter: SampleFilter,
}

impl VelocityField {
    pub fn from_fn(size: [u32; 3], mut f: impl FnMut([u32; 3]) -> Vector3) -> Self {
        let [nx, ny, nz] = size;
        let mut texels = Vec::with_capacity((nx * ny * nz) as usize);
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    let v = f([x, y, z]);
                    texels.push(Vector4::new(v.x, v.y, v.z, 0.));
                }
            }
        }

        Self {
            size,
            texels,
            filter: SampleFilter::Linear,
        }
    }

    pub fn uniform(size: [u32; 3], velocity: Vector3) -> Self {
        Self::from_fn(size, |_| velocity)
    }

    // Rising column with a swirl about the vertical axis, strongest along the axis
    pub fn plume(size: [u32; 3], extent: Vector3, rise: f32, swirl: f32) -> Self {
        let radius = extent.x.min(extent.z);
        Self::from_fn(size, |texel| {
            let p = texel_centre(size, texel, extent);
            let falloff = 1. - ((p.x * p.x + p.z * p.z).sqrt() / radius).min(1.);
            Vector3::new(
                -swirl * p.z,
                rise * (0.25 + 0.75 * falloff),
                swirl * p.x,
            )
        })
    }

    pub fn from_config(config: &FieldConfig, extent: Vector3) -> Self {
        match config.kind {
            FieldKind::Uniform(velocity) => Self::uniform(config.size, velocity),
            FieldKind::Plume { rise, swirl } => Self::plume(config.size, extent, rise, swirl),
        }
    }

    pub fn with_filter(self, filter: SampleFilter) -> Self {
        Self { filter, ..self }
    }

    pub fn size(&self) -> [u32; 3] {
        self.size
    }
    pub fn filter(&self) -> SampleFilter {
        self.filter
    }
    pub fn texels(&self) -> &[Vector4] {
        &self.texels
    }

    pub fn texel(&self, [x, y, z]: [u32; 3]) -> Vector3 {
        let [nx, ny, _] = self.size;
        self.texels[(x + nx * (y + ny * z)) as usize].xyz()
    }

    fn sample_linear(&self, tc: Vector3) -> Vector3 {
        // Texel centres sit at (i + 0.5) / n
        let axis = |t: f32, n: u32| -> (u32, u32, f32) {
            let u = t * n as f32 - 0.5;
            let i0 = u.floor();
            let frac = u - i0;
            let clamp = |i: f32| i.clamp(0., (n - 1) as f32) as u32;
            (clamp(i0), clamp(i0 + 1.), frac)
        };
        let (x0, x1, fx) = axis(tc.x, self.size[0]);
        let (y0, y1, fy) = axis(tc.y, self.size[1]);
        let (z0, z1, fz) = axis(tc.z, self.size[2]);

        let row = |y: u32, z: u32| Vector3::lerp(self.texel([x0, y, z]), self.texel([x1, y, z]), fx);
        let slice = |z: u32| Vector3::lerp(row(y0, z), row(y1, z), fy);
        Vector3::lerp(slice(z0), slice(z1), fz)
    }

    fn sample_nearest(&self, tc: Vector3) -> Vector3 {
        let axis = |t: f32, n: u32| (t * n as f32).floor().clamp(0., (n - 1) as f32) as u32;
        self.texel([
            axis(tc.x, self.size[0]),
            axis(tc.y, self.size[1]),
            axis(tc.z, self.size[2]),
        ])
    }
}

impl VelocitySampler for VelocityField {
    fn fetch(&self, tc: Vector3) -> Vector3 {
        match self.filter {
            SampleFilter::Linear => self.sample_linear(tc),
            SampleFilter::Nearest => self.sample_nearest(tc),
        }
    }
}

// World-space position of a texel centre within a domain of the given half-extent
fn texel_centre(size: [u32; 3], [x, y, z]: [u32; 3], extent: Vector3) -> Vector3 {
    let unit = |i: u32, n: u32| (i as f32 + 0.5) / n as f32;
    let tc = Vector3::new(unit(x, size[0]), unit(y, size[1]), unit(z, size[2]));
    Vector3::hadamard(2. * tc, extent) - extent
}
