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

use bytemuck::Zeroable;
use vulkano::buffer::BufferContents;
use vulkano::pipeline::graphics::vertex_input::Vertex;

use crate::my_math::Vector3;

/// One particle as stored in the feedback buffers.
///
/// The layout doubles as the vertex-attribute stride and as the std430 element of the
/// kernel's capture block, so the two roles of a buffer never need a conversion pass.
/// A `birth_time` of zero marks a particle that has never been seeded.
#[repr(C)]
#[derive(BufferContents, Vertex, Zeroable, Clone, Copy, Debug, Default, PartialEq)]
pub struct Particle {
    #[name("Position")]
    #[format(R32G32B32_SFLOAT)]
    pub position: [f32; 3],
    #[name("BirthTime")]
    #[format(R32_SFLOAT)]
    pub birth_time: f32,
    #[name("Velocity")]
    #[format(R32G32B32_SFLOAT)]
    pub velocity: [f32; 3],
    #[name("Reserved")]
    #[format(R32_SFLOAT)]
    pub reserved: f32,
}

/// Interleaved placement of a captured output inside one particle record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordField {
    pub offset: u32,
    pub components: u32,
}

impl Particle {
    /// Capture-set layout in record order: position, birth time, velocity.
    pub const CAPTURE_LAYOUT: [RecordField; 3] = [
        RecordField {
            offset: 0,
            components: 3,
        },
        RecordField {
            offset: 12,
            components: 1,
        },
        RecordField {
            offset: 16,
            components: 3,
        },
    ];

    pub fn new(position: Vector3, birth_time: f32, velocity: Vector3) -> Self {
        Self {
            position: position.into(),
            birth_time,
            velocity: velocity.into(),
            reserved: 0.,
        }
    }

    pub fn position(&self) -> Vector3 {
        self.position.into()
    }
    pub fn velocity(&self) -> Vector3 {
        self.velocity.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn record_matches_capture_layout() {
        assert_eq!(size_of::<Particle>(), 32);

        let offsets = [
            offset_of!(Particle, position),
            offset_of!(Particle, birth_time),
            offset_of!(Particle, velocity),
        ];
        for (field, offset) in Particle::CAPTURE_LAYOUT.iter().zip(offsets) {
            assert_eq!(field.offset as usize, offset);
        }
    }

    #[test]
    fn zeroed_particle_is_unseeded() {
        let particle = Particle::zeroed();
        assert_eq!(particle, Particle::default());
        assert_eq!(particle.birth_time, 0.);
    }
}
