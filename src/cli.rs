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

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "plume_advect")]
#[command(about = "GPU particle advection through a 3D velocity field", long_about = None)]
#[command(version)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Run without a window for a fixed number of passes
    #[arg(long)]
    pub headless: bool,

    /// Number of passes to run in headless mode
    #[arg(long, default_value_t = 60, requires = "headless")]
    pub frames: u32,

    /// Check every headless pass against the host-side kernel
    #[arg(long, requires = "headless")]
    pub verify: bool,

    /// Verbosity level (can be repeated for more detail)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn headless_flags_parse() {
        let cli = Cli::parse_from(["plume_advect", "--headless", "--frames", "3", "--verify", "-vv"]);
        assert!(cli.headless && cli.verify);
        assert_eq!(cli.frames, 3);
        assert_eq!(cli.log_level(), log::LevelFilter::Trace);
        assert!(cli.config.is_none());
    }

    #[test]
    fn verify_requires_headless() {
        assert!(Cli::try_parse_from(["plume_advect", "--verify"]).is_err());
    }
}
