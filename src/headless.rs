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

//! Windowless host loop: run a fixed number of passes, optionally checking each
//! one against the host-side kernel.

use crate::engine::vertex::Particle;
use crate::engine::Engine;
use crate::kernel;

/// Largest accepted difference per component, relative to values above one.
///
/// Device filtering uses reduced-precision interpolation weights, so exact
/// agreement with the host sampler is not expected.
pub const VERIFY_TOLERANCE: f32 = 1e-2;

const REPORTED_MISMATCHES: usize = 4;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Comparison {
    pub max_error: f32,
    pub mismatches: Vec<usize>,
}

fn component_error(expected: f32, actual: f32) -> f32 {
    if expected.is_nan() || actual.is_nan() {
        return f32::INFINITY;
    }
    (expected - actual).abs() / expected.abs().max(1.)
}

fn particle_error(expected: &Particle, actual: &Particle) -> f32 {
    let pairs = expected
        .position
        .iter()
        .zip(&actual.position)
        .chain(expected.velocity.iter().zip(&actual.velocity))
        .chain(std::iter::once((&expected.birth_time, &actual.birth_time)));
    pairs.fold(0., |worst, (&e, &a)| worst.max(component_error(e, a)))
}

pub fn compare(expected: &[Particle], actual: &[Particle], tolerance: f32) -> Comparison {
    if expected.len() != actual.len() {
        return Comparison {
            max_error: f32::INFINITY,
            mismatches: (0..expected.len().max(actual.len())).collect(),
        };
    }

    expected
        .iter()
        .zip(actual)
        .enumerate()
        .fold(Comparison::default(), |mut comparison, (index, (e, a))| {
            let error = particle_error(e, a);
            comparison.max_error = comparison.max_error.max(error);
            if error > tolerance {
                comparison.mismatches.push(index);
            }
            comparison
        })
}

/// Summary of one particle buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParticleStats {
    pub count: usize,
    pub min_height: f32,
    pub max_height: f32,
    pub max_speed: f32,
    pub all_finite: bool,
}

impl ParticleStats {
    pub fn of(particles: &[Particle]) -> Self {
        particles.iter().fold(
            Self {
                count: particles.len(),
                min_height: f32::INFINITY,
                max_height: f32::NEG_INFINITY,
                max_speed: 0.,
                all_finite: true,
            },
            |stats, particle| Self {
                min_height: stats.min_height.min(particle.position[1]),
                max_height: stats.max_height.max(particle.position[1]),
                max_speed: stats.max_speed.max(particle.velocity().length()),
                all_finite: stats.all_finite
                    && particle.position().is_finite()
                    && particle.velocity().is_finite()
                    && particle.birth_time.is_finite(),
                ..stats
            },
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    pub passes: u32,
    pub skipped: u32,
    pub verified: u32,
    pub max_error: f32,
    pub time: f32,
    pub stats: ParticleStats,
}

pub fn run(engine: &mut Engine, frames: u32, verify: bool) -> anyhow::Result<Report> {
    let mut report = Report {
        passes: 0,
        skipped: 0,
        verified: 0,
        max_error: 0.,
        time: engine.time(),
        stats: ParticleStats::of(&[]),
    };

    for pass in 0..frames {
        let before = if verify { Some(engine.read_particles()?) } else { None };
        let params = engine.params();

        if let Err(e) = engine.advect() {
            log::warn!("Skipping pass {pass}: {e}");
            report.skipped += 1;
            continue;
        }
        report.passes += 1;

        if let Some(before) = before {
            let mut expected = vec![Particle::default(); before.len()];
            kernel::advect(&params, engine.field(), &before, &mut expected)?;
            let actual = engine.read_particles()?;

            let comparison = compare(&expected, &actual, VERIFY_TOLERANCE);
            report.max_error = report.max_error.max(comparison.max_error);
            if !comparison.mismatches.is_empty() {
                let first = &comparison.mismatches[..comparison.mismatches.len().min(REPORTED_MISMATCHES)];
                for &index in first {
                    log::error!(
                        "Particle {index}: expected {:?}, device wrote {:?}",
                        expected[index],
                        actual[index]
                    );
                }
                anyhow::bail!(
                    "pass {} at time {}: {} of {} particles differ from the reference kernel",
                    pass,
                    params.time,
                    comparison.mismatches.len(),
                    actual.len()
                );
            }
            report.verified += 1;
            log::debug!("Pass {pass} verified, max error {}", comparison.max_error);
        }
    }

    report.time = engine.time();
    report.stats = ParticleStats::of(&engine.read_particles()?);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::my_math::Vector3;
    use pretty_assertions::assert_eq;

    fn particle(y: f32, birth_time: f32, vy: f32) -> Particle {
        Particle::new(Vector3::new(0.1, y, -0.1), birth_time, Vector3::new(0., vy, 0.))
    }

    #[test]
    fn identical_buffers_compare_clean() {
        let particles = vec![particle(-3., 0., 0.), particle(1.5, 5., 0.02)];
        assert_eq!(compare(&particles, &particles, VERIFY_TOLERANCE), Comparison::default());
    }

    #[test]
    fn mismatches_are_reported_by_index() {
        let expected = vec![particle(0., 5., 0.), particle(0., 5., 0.), particle(0., 5., 0.)];
        let mut actual = expected.clone();
        actual[1].position[1] = 0.5;
        actual[2].velocity[1] = 0.001;

        let comparison = compare(&expected, &actual, VERIFY_TOLERANCE);
        assert_eq!(comparison.mismatches, vec![1]);
        assert_eq!(comparison.max_error, 0.5);
    }

    #[test]
    fn large_values_compare_relatively() {
        // A reseed at time 1000 differs from 1000.5 by well under one percent
        let comparison = compare(&[particle(0., 1000., 0.)], &[particle(0., 1000.5, 0.)], VERIFY_TOLERANCE);
        assert!(comparison.mismatches.is_empty());
    }

    #[test]
    fn nan_and_length_mismatch_never_pass() {
        let good = vec![particle(0., 5., 0.)];
        let bad = vec![particle(f32::NAN, 5., 0.)];
        assert_eq!(compare(&good, &bad, VERIFY_TOLERANCE).mismatches, vec![0]);
        assert_eq!(compare(&good, &[], VERIFY_TOLERANCE).mismatches, vec![0]);
    }

    #[test]
    fn stats_summarise_heights_and_speed() {
        let stats = ParticleStats::of(&[particle(-2.95, 0., 0.), particle(1., 5., -0.5)]);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min_height, -2.95);
        assert_eq!(stats.max_height, 1.);
        assert_eq!(stats.max_speed, 0.5);
        assert!(stats.all_finite);

        assert!(!ParticleStats::of(&[particle(f32::INFINITY, 0., 0.)]).all_finite);
    }
}
