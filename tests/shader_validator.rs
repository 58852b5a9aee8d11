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

use std::fs;
use std::path::Path;

#[test]
fn validate_all_shaders() {
    let shader_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders");
    let mut errors = Vec::new();
    let mut compiled = 0;

    if !shader_dir.exists() {
        panic!("Shader directory not found: {:?}", shader_dir);
    }

    let compiler = shaderc::Compiler::new().expect("shaderc compiler");
    for entry in fs::read_dir(&shader_dir).unwrap() {
        let path = entry.unwrap().path();
        let kind = match path.extension().and_then(|ext| ext.to_str()) {
            Some("vert") => shaderc::ShaderKind::Vertex,
            Some("frag") => shaderc::ShaderKind::Fragment,
            _ => continue,
        };
        validate_shader(&compiler, &path, kind, &mut errors);
        compiled += 1;
    }

    if !errors.is_empty() {
        panic!("Shader validation failed:\n{}", errors.join("\n"));
    }
    assert!(compiled >= 2, "expected the advection kernel and its fragment stage");
}

fn validate_shader(
    compiler: &shaderc::Compiler,
    path: &Path,
    kind: shaderc::ShaderKind,
    errors: &mut Vec<String>,
) {
    let source = fs::read_to_string(path).unwrap();
    let name = path.file_name().unwrap().to_string_lossy();

    let mut options = shaderc::CompileOptions::new().unwrap();
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_0 as u32);
    options.set_warnings_as_errors();

    if let Err(e) = compiler.compile_into_spirv(&source, kind, &name, "main", Some(&options)) {
        errors.push(format!("Failed to compile {name}:\n{e}"));
    }
}

#[test]
fn advection_kernel_declares_the_capture_block() {
    let source = fs::read_to_string(Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders/advect.vert")).unwrap();
    for declaration in [
        "layout(location = 0) in vec3 Position;",
        "layout(location = 3) in float BirthTime;",
        "layout(location = 4) in vec3 Velocity;",
        "layout(location = 0) out vec3 vPosition;",
        "layout(location = 1) out float vBirthTime;",
        "layout(location = 2) out vec3 vVelocity;",
    ] {
        assert!(source.contains(declaration), "advect.vert lacks `{declaration}`");
    }
}

#[test]
fn advection_kernel_keeps_seeds_below_the_band_top() {
    let source = fs::read_to_string(Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders/advect.vert")).unwrap();
    assert!(
        source.contains("NextBelow(params.PlumeBase + params.InitialBand)"),
        "seed height is not clamped below PlumeBase + InitialBand"
    );
    assert!(!source.contains("params.PlumeBase + y,"), "seed height bypasses SeedHeight");
}
