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

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::my_math::Vector3;

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum FieldKindName {
    Uniform,
    Plume,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FieldToml {
    pub kind: Option<FieldKindName>,
    pub size: Option<[u32; 3]>,
    pub velocity: Option<[f32; 3]>,
    pub rise: Option<f32>,
    pub swirl: Option<f32>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlData {
    pub launch_fullscreen: Option<bool>,

    pub particle_count: Option<NonZeroUsize>,
    pub time_step: Option<f32>,
    pub initial_band: Option<f32>,
    pub seed_radius: Option<f32>,
    pub plume_ceiling: Option<f32>,
    pub plume_base: Option<f32>,
    pub extent: Option<[f32; 3]>,

    pub kernel_dir: Option<PathBuf>,

    #[serde(default)]
    pub field: FieldToml,
}

// Hardcoded default values
const DEFAULT_PARTICLE_COUNT: usize = 65_536;
const DEFAULT_TIME_STEP: f32 = 5.;
const DEFAULT_INITIAL_BAND: f32 = 0.1;
const DEFAULT_SEED_RADIUS: f32 = 0.25;
const DEFAULT_PLUME_CEILING: f32 = 3.;
const DEFAULT_PLUME_BASE: f32 = -3.;
const DEFAULT_EXTENT: [f32; 3] = [1., 1., 1.];
const DEFAULT_FIELD_SIZE: [u32; 3] = [32, 32, 32];
const DEFAULT_RISE: f32 = 0.02;
const DEFAULT_SWIRL: f32 = 0.01;

// Largest grid edge accepted for the velocity volume
const MAX_FIELD_EDGE: u32 = 256;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FieldKind {
    Uniform(Vector3),
    Plume { rise: f32, swirl: f32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldConfig {
    pub kind: FieldKind,
    pub size: [u32; 3],
}
impl Default for FieldConfig {
    fn default() -> Self {
        Self {
            kind: FieldKind::Plume {
                rise: DEFAULT_RISE,
                swirl: DEFAULT_SWIRL,
            },
            size: DEFAULT_FIELD_SIZE,
        }
    }
}

// Parameters consumed by the advection kernel, minus the clock which the host loop owns
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimulationConfig {
    pub time_step: f32,
    pub initial_band: f32,
    pub seed_radius: f32,
    pub plume_ceiling: f32,
    pub plume_base: f32,
    pub extent: Vector3,
}
impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            time_step: DEFAULT_TIME_STEP,
            initial_band: DEFAULT_INITIAL_BAND,
            seed_radius: DEFAULT_SEED_RADIUS,
            plume_ceiling: DEFAULT_PLUME_CEILING,
            plume_base: DEFAULT_PLUME_BASE,
            extent: DEFAULT_EXTENT.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub launch_fullscreen: bool,

    pub particle_count: usize,
    pub simulation: SimulationConfig,
    pub field: FieldConfig,

    // Directory holding `advect.vert` and `stub.frag`, replacing the embedded kernels when set
    pub kernel_dir: Option<PathBuf>,
}
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            launch_fullscreen: bool::default(),

            particle_count: DEFAULT_PARTICLE_COUNT,
            simulation: SimulationConfig::default(),
            field: FieldConfig::default(),

            kernel_dir: None,
        }
    }
}

pub fn parse_file(filepath: &Path) -> anyhow::Result<AppConfig> {
    let contents = std::fs::read_to_string(filepath)?;
    let mut config = parse_str(&contents)?;

    // Relative kernel directories are resolved against the config file's location
    if let (Some(kernel_dir), Some(parent)) = (config.kernel_dir.as_mut(), filepath.parent()) {
        if kernel_dir.is_relative() {
            *kernel_dir = parent.join(&*kernel_dir);
        }
    }

    Ok(config)
}

pub fn parse_str(contents: &str) -> anyhow::Result<AppConfig> {
    let config: TomlData = toml::from_str(contents)?;

    let particle_count = config
        .particle_count
        .map_or(DEFAULT_PARTICLE_COUNT, NonZeroUsize::get);
    if u32::try_from(particle_count).is_err() {
        anyhow::bail!(
            "`particle_count` must fit in a 32-bit vertex count, was given: {}",
            particle_count
        );
    }

    let time_step = match config.time_step {
        Some(time_step) => {
            if time_step > 0. && time_step.is_finite() {
                time_step
            } else {
                anyhow::bail!(
                    "`time_step` must be a positive number, was given: {}",
                    time_step
                );
            }
        }
        None => DEFAULT_TIME_STEP,
    };

    let initial_band = non_negative(config.initial_band, DEFAULT_INITIAL_BAND, "initial_band")?;
    let seed_radius = non_negative(config.seed_radius, DEFAULT_SEED_RADIUS, "seed_radius")?;

    let plume_base = config.plume_base.unwrap_or(DEFAULT_PLUME_BASE);
    let plume_ceiling = config.plume_ceiling.unwrap_or(DEFAULT_PLUME_CEILING);
    if !(plume_ceiling > plume_base) {
        anyhow::bail!(
            "`plume_ceiling` ({}) must lie above `plume_base` ({})",
            plume_ceiling,
            plume_base
        );
    }

    let extent: Vector3 = config.extent.unwrap_or(DEFAULT_EXTENT).into();
    if !(extent.min_element() > 0.) || !extent.is_finite() {
        anyhow::bail!(
            "`extent` components must be positive, was given: {:?}",
            <[f32; 3]>::from(extent)
        );
    }

    let field = {
        let FieldToml {
            kind,
            size,
            velocity,
            rise,
            swirl,
        } = config.field;

        let size = size.unwrap_or(DEFAULT_FIELD_SIZE);
        if size.iter().any(|&n| n == 0 || n > MAX_FIELD_EDGE) {
            anyhow::bail!(
                "`field.size` edges must be within 1..={}, was given: {:?}",
                MAX_FIELD_EDGE,
                size
            );
        }

        let kind = match kind.unwrap_or(FieldKindName::Plume) {
            FieldKindName::Uniform => FieldKind::Uniform(velocity.unwrap_or_default().into()),
            FieldKindName::Plume => FieldKind::Plume {
                rise: rise.unwrap_or(DEFAULT_RISE),
                swirl: swirl.unwrap_or(DEFAULT_SWIRL),
            },
        };
        FieldConfig { kind, size }
    };

    Ok(AppConfig {
        launch_fullscreen: config.launch_fullscreen.unwrap_or_default(),

        particle_count,
        simulation: SimulationConfig {
            time_step,
            initial_band,
            seed_radius,
            plume_ceiling,
            plume_base,
            extent,
        },
        field,

        kernel_dir: config.kernel_dir,
    })
}

fn non_negative(value: Option<f32>, default: f32, key: &str) -> anyhow::Result<f32> {
    match value {
        Some(v) if v >= 0. && v.is_finite() => Ok(v),
        Some(v) => anyhow::bail!("`{}` must be a non-negative number, was given: {}", key, v),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.simulation.time_step, 5.);
        assert_eq!(config.simulation.initial_band, 0.1);
        assert_eq!(config.simulation.seed_radius, 0.25);
        assert_eq!(config.simulation.plume_ceiling, 3.);
        assert_eq!(config.simulation.plume_base, -3.);
    }

    #[test]
    fn overrides_are_applied() {
        let config = parse_str(
            r#"
            particle_count = 10
            time_step = 0.5
            plume_base = -1.0
            plume_ceiling = 2.0
            extent = [2.0, 3.0, 2.0]

            [field]
            kind = "uniform"
            size = [4, 8, 4]
            velocity = [0.0, 1.0, 0.0]
            "#,
        )
        .unwrap();

        assert_eq!(config.particle_count, 10);
        assert_eq!(config.simulation.time_step, 0.5);
        assert_eq!(config.simulation.plume_base, -1.);
        assert_eq!(config.simulation.plume_ceiling, 2.);
        assert_eq!(config.simulation.extent, Vector3::new(2., 3., 2.));
        assert_eq!(
            config.field,
            FieldConfig {
                kind: FieldKind::Uniform(Vector3::new(0., 1., 0.)),
                size: [4, 8, 4],
            }
        );
    }

    #[test]
    fn rejects_invalid_values() {
        for source in [
            "time_step = 0.0",
            "time_step = -1.0",
            "particle_count = 0",
            "seed_radius = -0.5",
            "initial_band = -0.1",
            "plume_base = 3.0\nplume_ceiling = 3.0",
            "extent = [1.0, 0.0, 1.0]",
            "[field]\nsize = [0, 4, 4]",
            "unknown_key = true",
        ] {
            assert!(parse_str(source).is_err(), "accepted: {source}");
        }
    }

    #[test]
    fn relative_kernel_dir_follows_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plume.toml");
        std::fs::write(&path, "kernel_dir = \"kernels\"\n").unwrap();

        let config = parse_file(&path).unwrap();
        assert_eq!(config.kernel_dir, Some(dir.path().join("kernels")));
    }
}
