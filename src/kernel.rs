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

//! Host-side mirror of `shaders/advect.vert`.
//!
//! The device kernel is the simulation; these functions reproduce it operation for
//! operation so that device output can be checked and the lifecycle rules tested
//! without a GPU. Keep both in step when either changes.

use rayon::prelude::*;
use vulkano::buffer::BufferContents;

use crate::app_config::SimulationConfig;
use crate::engine::vertex::Particle;
use crate::error::KernelError;
use crate::my_math::Vector3;

/// `TwoPi` as written in the kernel, rounded to `f32`.
pub const TWO_PI: f32 = 6.283_185_5;

const HASH_SCALE: f32 = 1. / 16_777_216.;

/// Push-constant block `Params` of the advection kernel.
#[repr(C)]
#[derive(BufferContents, Clone, Copy, Debug, PartialEq)]
pub struct KernelParams {
    pub size: [f32; 3],
    pub time: f32,
    pub extent: [f32; 3],
    pub time_step: f32,
    pub initial_band: f32,
    pub seed_radius: f32,
    pub plume_ceiling: f32,
    pub plume_base: f32,
}

/// Name, byte offset and GLSL type of each `Params` member, for uniform introspection.
pub const PARAM_MEMBERS: [(&str, u32, &str); 8] = [
    ("Size", 0, "vec3"),
    ("Time", 12, "float"),
    ("Extent", 16, "vec3"),
    ("TimeStep", 28, "float"),
    ("InitialBand", 32, "float"),
    ("SeedRadius", 36, "float"),
    ("PlumeCeiling", 40, "float"),
    ("PlumeBase", 44, "float"),
];

impl KernelParams {
    pub fn new(simulation: &SimulationConfig, field_size: [u32; 3], time: f32) -> Self {
        Self {
            size: field_size.map(|n| n as f32),
            time,
            extent: simulation.extent.into(),
            time_step: simulation.time_step,
            initial_band: simulation.initial_band,
            seed_radius: simulation.seed_radius,
            plume_ceiling: simulation.plume_ceiling,
            plume_base: simulation.plume_base,
        }
    }
    pub fn extent(&self) -> Vector3 {
        self.extent.into()
    }
}

/// The simulation clock; one tick per completed advection pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimulationClock {
    time: f32,
    step: f32,
}
impl SimulationClock {
    pub fn new(step: f32) -> Self {
        Self { time: 0., step }
    }
    pub fn time(&self) -> f32 {
        self.time
    }
    pub fn advance(&mut self) {
        self.time += self.step;
    }
}

/// Anything the kernel can fetch velocities from, addressed in texture space.
pub trait VelocitySampler: Sync {
    fn fetch(&self, tc: Vector3) -> Vector3;
}
impl<F> VelocitySampler for F
where
    F: Fn(Vector3) -> Vector3 + Sync,
{
    fn fetch(&self, tc: Vector3) -> Vector3 {
        self(tc)
    }
}

// Integer hash with multiply-xor-shift avalanche
pub fn randhash(seed: u32) -> u32 {
    let mut i = (seed ^ 12_345_391).wrapping_mul(2_654_435_769);
    i ^= (i << 6) ^ (i >> 26);
    i = i.wrapping_mul(2_654_435_769);
    i = i.wrapping_add((i << 5) ^ (i >> 12));
    i
}

// Uniform draw in `[0, b)`. The top 24 bits convert to `f32` exactly
pub fn randhashf(seed: u32, b: f32) -> f32 {
    b * ((randhash(seed) >> 8) as f32 * HASH_SCALE)
}

pub fn seed_counter(time: f32, index: u32) -> u32 {
    ((time * 1000.).floor() as u32).wrapping_add(index)
}

/// The three draws that place a (re)born particle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeedDraw {
    pub theta: f32,
    pub radius: f32,
    pub height: f32,
}

// Draw order is angle, radius, height on consecutive counters
pub fn draw_seed(time: f32, index: u32, seed_radius: f32, initial_band: f32) -> SeedDraw {
    let seed = seed_counter(time, index);
    SeedDraw {
        theta: randhashf(seed, TWO_PI),
        radius: randhashf(seed.wrapping_add(1), seed_radius),
        height: randhashf(seed.wrapping_add(2), initial_band),
    }
}

pub fn texture_coordinates(p: Vector3, extent: Vector3) -> Vector3 {
    (p + extent) / (2. * extent)
}

pub fn sample_velocity<S: VelocitySampler + ?Sized>(p: Vector3, extent: Vector3, field: &S) -> Vector3 {
    field.fetch(texture_coordinates(p, extent))
}

// Rounding `PlumeBase + offset` may land on the excluded top of the band
pub fn seed_height(plume_base: f32, initial_band: f32, offset: f32) -> f32 {
    (plume_base + offset).min((plume_base + initial_band).next_down())
}

pub fn needs_seed(particle: &Particle, plume_ceiling: f32) -> bool {
    particle.birth_time == 0. || particle.position[1] > plume_ceiling
}

/// Evaluates one particle for one frame. Pure: reads nothing but its own record.
pub fn advect_particle<S: VelocitySampler + ?Sized>(
    index: u32,
    particle: &Particle,
    params: &KernelParams,
    field: &S,
) -> Particle {
    if needs_seed(particle, params.plume_ceiling) {
        let SeedDraw {
            theta,
            radius,
            height,
        } = draw_seed(params.time, index, params.seed_radius, params.initial_band);
        let position = Vector3::new(
            radius * theta.cos(),
            seed_height(params.plume_base, params.initial_band, height),
            radius * theta.sin(),
        );
        return Particle::new(position, params.time, Vector3::default());
    }

    // Midpoint step, the recorded velocity is the one sampled at the midpoint
    let extent = params.extent();
    let position = particle.position();
    let v0 = sample_velocity(position, extent, field);
    let midpoint = position + (0.5 * params.time_step) * v0;
    let v1 = sample_velocity(midpoint, extent, field);
    Particle::new(position + params.time_step * v1, particle.birth_time, v1)
}

/// One advection pass over a whole buffer, written into `capture` at matching indices.
pub fn advect<S: VelocitySampler + ?Sized>(
    params: &KernelParams,
    field: &S,
    source: &[Particle],
    capture: &mut [Particle],
) -> Result<(), KernelError> {
    if source.len() != capture.len() {
        return Err(KernelError::CapacityMismatch {
            read: source.len(),
            capture: capture.len(),
        });
    }
    capture
        .par_iter_mut()
        .zip(source.par_iter())
        .enumerate()
        .for_each(|(index, (out, particle))| {
            *out = advect_particle(index as u32, particle, params, field);
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::FeedbackPair;
    use bytemuck::Zeroable;
    use pretty_assertions::assert_eq;
    use std::mem::offset_of;

    fn params(time: f32) -> KernelParams {
        KernelParams::new(&SimulationConfig::default(), [32, 32, 32], time)
    }

    fn still(_: Vector3) -> Vector3 {
        Vector3::default()
    }

    #[test]
    fn params_block_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<KernelParams>(), 48);
        let offsets = [
            offset_of!(KernelParams, size),
            offset_of!(KernelParams, time),
            offset_of!(KernelParams, extent),
            offset_of!(KernelParams, time_step),
            offset_of!(KernelParams, initial_band),
            offset_of!(KernelParams, seed_radius),
            offset_of!(KernelParams, plume_ceiling),
            offset_of!(KernelParams, plume_base),
        ];
        for ((_, offset, _), actual) in PARAM_MEMBERS.iter().zip(offsets) {
            assert_eq!(*offset as usize, actual);
        }
    }

    #[test]
    fn randhash_is_stable() {
        // Pinned so that edits to either copy of the hash are caught
        let hashes: Vec<u32> = (0..4).map(randhash).collect();
        assert_eq!(hashes, vec![155_489_619, 548_517_411, 1_909_112_175, 217_491_472]);
    }

    #[test]
    fn randhashf_stays_in_half_open_range() {
        for seed in (0..200_000u32).step_by(7) {
            let v = randhashf(seed, 0.25);
            assert!((0. ..0.25).contains(&v), "seed {seed} drew {v}");
        }
        assert!(randhashf(u32::MAX, 1.) < 1.);
    }

    #[test]
    fn seeding_is_deterministic() {
        let a = draw_seed(12.345, 77, 0.25, 0.1);
        let b = draw_seed(12.345, 77, 0.25, 0.1);
        assert_eq!(a.theta.to_bits(), b.theta.to_bits());
        assert_eq!(a.radius.to_bits(), b.radius.to_bits());
        assert_eq!(a.height.to_bits(), b.height.to_bits());

        // Draws consume consecutive counters in angle, radius, height order
        let seed = seed_counter(12.345, 77);
        assert_eq!(a.theta, randhashf(seed, TWO_PI));
        assert_eq!(a.radius, randhashf(seed + 1, 0.25));
        assert_eq!(a.height, randhashf(seed + 2, 0.1));

        assert_ne!(a, draw_seed(12.345, 78, 0.25, 0.1));
    }

    #[test]
    fn seed_counter_floors_milliseconds() {
        assert_eq!(seed_counter(0., 5), 5);
        assert_eq!(seed_counter(1.0, 0), 1000);
        assert_eq!(seed_counter(0.0019, 1), 2);
        assert_eq!(seed_counter(0., u32::MAX), u32::MAX);
        assert_eq!(seed_counter(0.001, u32::MAX), 0);
    }

    #[test]
    fn domain_mapping() {
        let extent = Vector3::new(1., 2., 4.);
        assert_eq!(
            texture_coordinates(Vector3::default(), extent),
            Vector3::splat(0.5)
        );
        assert_eq!(
            texture_coordinates(Vector3::new(-1., -2., -4.), extent),
            Vector3::splat(0.)
        );
        assert_eq!(
            texture_coordinates(Vector3::new(1., 2., 4.), extent),
            Vector3::splat(1.)
        );

        for i in 0..=20 {
            let s = i as f32 / 10. - 1.;
            let tc = texture_coordinates(Vector3::hadamard(Vector3::splat(s), extent), extent);
            for c in [tc.x, tc.y, tc.z] {
                assert!((0. ..=1.).contains(&c), "{c} out of range for s = {s}");
            }
        }
    }

    #[test]
    fn unseeded_particle_is_always_seeded() {
        let p = params(3.);
        let stale = Particle::new(Vector3::new(0.9, 0., -0.4), 0., Vector3::new(1., 1., 1.));
        let fast = |_: Vector3| Vector3::new(0., 10., 0.);

        let out = advect_particle(4, &stale, &p, &fast);
        assert_eq!(out.birth_time, 3.);
        assert_eq!(out.velocity(), Vector3::default());
        let draw = draw_seed(3., 4, p.seed_radius, p.initial_band);
        assert_eq!(out.position[1], seed_height(p.plume_base, p.initial_band, draw.height));
    }

    #[test]
    fn particle_above_ceiling_is_reseeded() {
        let p = params(8.);
        let escaped = Particle::new(Vector3::new(0., 3.01, 0.), 2., Vector3::new(0., 1., 0.));
        let out = advect_particle(0, &escaped, &p, &still);
        assert_eq!(out.birth_time, 8.);
        assert!(out.position[1] < p.plume_base + p.initial_band);

        // Exactly at the ceiling is still alive
        let at_ceiling = Particle::new(Vector3::new(0., 3., 0.), 2., Vector3::default());
        let out = advect_particle(0, &at_ceiling, &p, &still);
        assert_eq!(out.birth_time, 2.);
        assert_eq!(out.position(), at_ceiling.position());
    }

    #[test]
    fn seeded_particles_start_inside_the_band() {
        let p = params(41.5);
        for index in 0..4096 {
            let out = advect_particle(index, &Particle::zeroed(), &p, &still);
            let y = out.position[1];
            assert!(y >= p.plume_base && y < p.plume_base + p.initial_band, "y = {y}");
            let radial = (out.position[0].powi(2) + out.position[2].powi(2)).sqrt();
            assert!(radial < p.seed_radius, "radial = {radial}");
        }
    }

    #[test]
    fn seed_height_never_reaches_the_band_top() {
        // Index 235964 at time zero draws an offset that rounds onto the top when added to the base
        let p = params(0.);
        let top = p.plume_base + p.initial_band;
        let draw = draw_seed(0., 235_964, p.seed_radius, p.initial_band);
        assert!(draw.height < p.initial_band);

        let out = advect_particle(235_964, &Particle::zeroed(), &p, &still);
        assert!(out.position[1] < top, "y = {}", out.position[1]);
        assert!(out.position[1] >= p.plume_base);

        for index in [235_964, 555_924, 603_183, 939_562] {
            let y = advect_particle(index, &Particle::zeroed(), &p, &still).position[1];
            assert!(y >= p.plume_base && y < top, "index {index}: y = {y}");
        }

        assert_eq!(seed_height(-3., 0.1, 0.), -3.);
        assert_eq!(seed_height(-3., 0.1, 0.1), (-3f32 + 0.1).next_down());
    }

    #[test]
    fn advect_rejects_mismatched_buffers() {
        let source = vec![Particle::zeroed(); 4];
        let mut capture = vec![Particle::zeroed(); 3];
        assert_eq!(
            advect(&params(1.), &still, &source, &mut capture),
            Err(KernelError::CapacityMismatch { read: 4, capture: 3 })
        );
        assert!(capture.iter().all(|p| *p == Particle::zeroed()));
    }

    #[test]
    fn uniform_field_degenerates_to_euler() {
        let p = params(1.);
        let v = Vector3::new(0.01, 0.02, -0.03);
        let field = move |_: Vector3| v;
        let start = Particle::new(Vector3::new(0.1, -2., 0.2), 0.5, Vector3::default());

        let out = advect_particle(9, &start, &p, &field);
        assert_eq!(out.position(), start.position() + p.time_step * v);
        assert_eq!(out.velocity(), v);
        assert_eq!(out.birth_time, 0.5);
    }

    #[test]
    fn midpoint_velocity_is_recorded() {
        let p = params(1.);
        // Velocity grows with height, so the midpoint sample differs from the start sample
        let shear = |tc: Vector3| Vector3::new(0., 0.01 * tc.y, 0.);
        let start = Particle::new(Vector3::new(0., 0., 0.), 1., Vector3::default());

        let v0 = sample_velocity(start.position(), p.extent(), &shear);
        let out = advect_particle(0, &start, &p, &shear);
        assert!(out.velocity[1] > v0.y);
        assert_eq!(out.position[1], p.time_step * out.velocity[1]);
    }

    #[test]
    fn end_to_end_zero_field() {
        let simulation = SimulationConfig::default();
        let mut buffers = FeedbackPair::new(vec![Particle::zeroed(); 10], vec![Particle::zeroed(); 10]);
        let mut run = |time: f32| {
            let params = KernelParams::new(&simulation, [8, 8, 8], time);
            let (source, capture) = buffers.roles();
            advect(&params, &still, source.buffer(), capture.into_buffer()).unwrap();
            buffers.swap();
            buffers.latest().clone()
        };

        // Seeding at time zero records a zero birth time, which is still the unseeded sentinel
        let first = run(0.);
        for particle in &first {
            assert_eq!(particle.birth_time, 0.);
            assert!(particle.position[1] >= -3. && particle.position[1] < -2.9);
        }

        let second = run(1000.);
        for particle in &second {
            assert_eq!(particle.birth_time, 1000.);
            assert!(particle.position[1] >= -3. && particle.position[1] < -2.9);
        }

        let third = run(1005.);
        assert_eq!(third, second);
        assert!(third.iter().all(|p| p.velocity() == Vector3::default()));
    }
}
