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

//! Builds the advection program from GLSL kernel sources.
//!
//! Compilation happens at run time so that a broken kernel is reported as a
//! [`ProgramError`] instead of failing the build. Attribute binding and the
//! capture set are validated against the kernel's reflected interface before
//! the pipeline is linked.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use vulkano::device::Device;
use vulkano::pipeline::graphics::color_blend::{
    ColorBlendAttachmentState, ColorBlendState, ColorComponents,
};
use vulkano::pipeline::graphics::input_assembly::{InputAssemblyState, PrimitiveTopology};
use vulkano::pipeline::graphics::multisample::MultisampleState;
use vulkano::pipeline::graphics::rasterization::RasterizationState;
use vulkano::pipeline::graphics::vertex_input::{Vertex, VertexDefinition};
use vulkano::pipeline::graphics::viewport::ViewportState;
use vulkano::pipeline::graphics::GraphicsPipelineCreateInfo;
use vulkano::pipeline::layout::PipelineDescriptorSetLayoutCreateInfo;
use vulkano::pipeline::{
    DynamicState, GraphicsPipeline, Pipeline, PipelineLayout, PipelineShaderStageCreateInfo,
};
use vulkano::render_pass::Subpass;
use vulkano::shader::{EntryPoint, EntryPointInfo, ShaderInterface, ShaderModule, ShaderModuleCreateInfo};

use super::vertex::{Particle, RecordField};
use crate::error::{EngineError, ProgramError};

/// Attribute names in slot order. Only some are consumed by the advection kernel.
pub const PARTICLE_ATTRIBUTES: [&str; 5] = ["Position", "TexCoord", "Normal", "BirthTime", "Velocity"];

/// Kernel outputs captured into the write buffer, in record order.
pub const PARTICLE_CAPTURES: [&str; 3] = ["vPosition", "vBirthTime", "vVelocity"];

/// Names for the kernel's descriptor bindings as `(set, binding, name)`.
pub const KERNEL_DESCRIPTORS: [(u32, u32, &str); 2] = [(0, 0, "Sampler"), (1, 0, "Capture")];

pub const VERTEX_FILE: &str = "advect.vert";
pub const FRAGMENT_FILE: &str = "stub.frag";

const ENTRY_POINT: &str = "main";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Vertex,
    Fragment,
}
impl Stage {
    fn shader_kind(self) -> shaderc::ShaderKind {
        match self {
            Stage::Vertex => shaderc::ShaderKind::Vertex,
            Stage::Fragment => shaderc::ShaderKind::Fragment,
        }
    }
}
impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Vertex => "vertex",
            Stage::Fragment => "fragment",
        })
    }
}

/// GLSL text of both stages.
#[derive(Clone, Debug)]
pub struct KernelSources {
    pub vertex: String,
    pub fragment: String,
}

impl KernelSources {
    pub fn embedded() -> Self {
        Self {
            vertex: include_str!("../../shaders/advect.vert").to_owned(),
            fragment: include_str!("../../shaders/stub.frag").to_owned(),
        }
    }

    // Read both stages from a directory, or fall back to the copies built into the binary
    pub fn load(kernel_dir: Option<&Path>) -> Result<Self, EngineError> {
        let Some(dir) = kernel_dir else {
            return Ok(Self::embedded());
        };
        let read = |file: &str| {
            let path = dir.join(file);
            std::fs::read_to_string(&path).map_err(|source| EngineError::KernelSource { path, source })
        };
        log::info!("Loading kernels from {}", dir.display());
        Ok(Self {
            vertex: read(VERTEX_FILE)?,
            fragment: read(FRAGMENT_FILE)?,
        })
    }
}

/// SPIR-V words of both stages.
pub struct CompiledStages {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

pub fn compile_stage(
    compiler: &shaderc::Compiler,
    stage: Stage,
    source: &str,
    file_name: &str,
) -> Result<Vec<u32>, ProgramError> {
    let mut options = shaderc::CompileOptions::new().ok_or(ProgramError::CompilerUnavailable)?;
    options.set_source_language(shaderc::SourceLanguage::GLSL);
    options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_0 as u32);

    let artifact = compiler
        .compile_into_spirv(source, stage.shader_kind(), file_name, ENTRY_POINT, Some(&options))
        .map_err(|e| ProgramError::Compile {
            stage,
            log: match e {
                shaderc::Error::CompilationError(_, log) => log,
                other => other.to_string(),
            },
        })?;

    if artifact.get_num_warnings() > 0 {
        log::warn!("{} stage compiled with warnings:\n{}", stage, artifact.get_warning_messages());
    }
    Ok(artifact.as_binary().to_vec())
}

pub fn compile_sources(sources: &KernelSources) -> Result<CompiledStages, ProgramError> {
    let compiler = shaderc::Compiler::new().ok_or(ProgramError::CompilerUnavailable)?;
    Ok(CompiledStages {
        vertex: compile_stage(&compiler, Stage::Vertex, &sources.vertex, VERTEX_FILE)?,
        fragment: compile_stage(&compiler, Stage::Fragment, &sources.fragment, FRAGMENT_FILE)?,
    })
}

/// A named stage input or output as declared by a kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceVariable {
    pub name: String,
    pub location: u32,
    pub components: u32,
}

impl InterfaceVariable {
    pub fn new(name: &str, location: u32, components: u32) -> Self {
        Self {
            name: name.to_owned(),
            location,
            components,
        }
    }

    // Sorted by location; unnamed variables are kept with an empty name so they fail to bind
    fn reflect(interface: &ShaderInterface) -> Vec<Self> {
        let mut variables: Vec<Self> = interface
            .elements()
            .iter()
            .map(|entry| Self {
                name: entry.name.as_deref().unwrap_or_default().to_owned(),
                location: entry.location,
                components: entry.ty.num_components,
            })
            .collect();
        variables.sort_by_key(|v| v.location);
        variables
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeBinding {
    pub name: String,
    pub slot: u32,
}

/// Binds kernel inputs to the fixed slot convention of `attributes` (slot = list index).
///
/// Every input the kernel consumes must be listed and declared at its slot. Listed
/// names the kernel doesn't consume are left unbound.
pub fn bind_attributes(
    inputs: &[InterfaceVariable],
    attributes: &[&str],
) -> Result<Vec<AttributeBinding>, ProgramError> {
    for (i, name) in attributes.iter().enumerate() {
        if attributes[..i].contains(name) {
            return Err(ProgramError::link(format!("attribute `{name}` is listed twice")));
        }
    }

    inputs
        .iter()
        .map(|input| {
            let slot = attributes
                .iter()
                .position(|&name| name == input.name)
                .ok_or_else(|| {
                    ProgramError::link(format!(
                        "vertex input `{}` at location {} has no bound attribute",
                        input.name, input.location
                    ))
                })? as u32;
            if slot != input.location {
                return Err(ProgramError::link(format!(
                    "attribute `{}` is bound to slot {} but the kernel declares location {}",
                    input.name, slot, input.location
                )));
            }
            Ok(AttributeBinding {
                name: input.name.clone(),
                slot,
            })
        })
        .collect()
}

/// A captured output and where it lands in the interleaved record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureSlot {
    pub name: String,
    pub location: u32,
    pub offset: u32,
    pub components: u32,
}

/// Resolves the capture set against the kernel's outputs with interleaved packing.
///
/// Names must be kernel outputs listed in declaration order, and the packed layout
/// must equal `record`, the layout of the buffer the kernel captures into.
pub fn resolve_captures(
    outputs: &[InterfaceVariable],
    captures: &[&str],
    record: &[RecordField],
) -> Result<Vec<CaptureSlot>, ProgramError> {
    if captures.is_empty() {
        return Ok(vec![]);
    }

    let mut slots: Vec<CaptureSlot> = Vec::with_capacity(captures.len());
    let mut offset = 0;
    for &name in captures {
        let output = outputs.iter().find(|o| o.name == name).ok_or_else(|| {
            ProgramError::link(format!("capture `{name}` is not an output of the vertex kernel"))
        })?;
        if let Some(previous) = slots.last() {
            if output.location <= previous.location {
                return Err(ProgramError::link(format!(
                    "capture `{}` (location {}) is listed after `{}` (location {}), captures must follow declaration order",
                    name, output.location, previous.name, previous.location
                )));
            }
        }
        slots.push(CaptureSlot {
            name: name.to_owned(),
            location: output.location,
            offset,
            components: output.components,
        });
        offset += 4 * output.components;
    }

    let packed: Vec<RecordField> = slots
        .iter()
        .map(|s| RecordField {
            offset: s.offset,
            components: s.components,
        })
        .collect();
    if packed != record {
        return Err(ProgramError::link(format!(
            "capture layout {packed:?} does not match the particle record {record:?}"
        )));
    }
    Ok(slots)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UniformSlot {
    Descriptor { set: u32, binding: u32 },
    PushConstant { offset: u32 },
}
impl fmt::Display for UniformSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UniformSlot::Descriptor { set, binding } => write!(f, "set {set}, binding {binding}"),
            UniformSlot::PushConstant { offset } => write!(f, "push constant +{offset}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveUniform {
    pub name: String,
    pub ty: String,
    pub slot: UniformSlot,
}

/// What reflection reports about a program's uniforms before naming.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReflectedUniforms {
    /// `(set, binding, type)` per descriptor binding, possibly repeated across stages.
    pub descriptors: Vec<(u32, u32, String)>,
    /// End of the widest push-constant range of any stage.
    pub push_constant_end: u32,
}

impl ReflectedUniforms {
    fn of(stages: [&EntryPointInfo; 2]) -> Self {
        let descriptors = stages
            .into_iter()
            .flat_map(|info| info.descriptor_binding_requirements.iter())
            .map(|(&(set, binding), requirements)| (set, binding, format!("{:?}", requirements.descriptor_types)))
            .collect();
        let push_constant_end = stages
            .into_iter()
            .filter_map(|info| info.push_constant_requirements.as_ref())
            .map(|range| range.offset + range.size)
            .max()
            .unwrap_or(0);
        Self {
            descriptors,
            push_constant_end,
        }
    }
}

// Descriptor bindings in (set, binding) order, then push-constant members inside the reflected range
fn enumerate_uniforms(
    reflected: ReflectedUniforms,
    descriptor_names: &[(u32, u32, &str)],
    push_constant_members: &[(&str, u32, &str)],
) -> Vec<ActiveUniform> {
    let ReflectedUniforms {
        mut descriptors,
        push_constant_end,
    } = reflected;
    descriptors.sort();
    descriptors.dedup_by_key(|(set, binding, _)| (*set, *binding));

    let descriptors = descriptors.into_iter().map(|(set, binding, ty)| ActiveUniform {
        name: descriptor_names
            .iter()
            .find(|(s, b, _)| (*s, *b) == (set, binding))
            .map_or_else(|| format!("set{set}.binding{binding}"), |(_, _, name)| (*name).to_owned()),
        ty,
        slot: UniformSlot::Descriptor { set, binding },
    });
    let members = push_constant_members
        .iter()
        .filter(|(_, offset, _)| *offset < push_constant_end)
        .map(|&(name, offset, ty)| ActiveUniform {
            name: name.to_owned(),
            ty: ty.to_owned(),
            slot: UniformSlot::PushConstant { offset },
        });
    descriptors.chain(members).collect()
}

/// A linked, validated advection program.
pub struct Program {
    pipeline: Arc<GraphicsPipeline>,
    attributes: Vec<AttributeBinding>,
    captures: Vec<CaptureSlot>,
    uniforms: Vec<ActiveUniform>,
}

impl Program {
    pub fn pipeline(&self) -> &Arc<GraphicsPipeline> {
        &self.pipeline
    }
    pub fn layout(&self) -> &Arc<PipelineLayout> {
        self.pipeline.layout()
    }
    pub fn attributes(&self) -> &[AttributeBinding] {
        &self.attributes
    }
    pub fn captures(&self) -> &[CaptureSlot] {
        &self.captures
    }
    pub fn uniforms(&self) -> &[ActiveUniform] {
        &self.uniforms
    }
}

pub struct ProgramBuilder<'a> {
    sources: &'a KernelSources,
    attributes: &'a [&'a str],
    captures: &'a [&'a str],
    descriptor_names: &'a [(u32, u32, &'a str)],
    push_constant_members: &'a [(&'a str, u32, &'a str)],
}

impl<'a> ProgramBuilder<'a> {
    pub fn new(sources: &'a KernelSources) -> Self {
        Self {
            sources,
            attributes: &[],
            captures: &[],
            descriptor_names: &[],
            push_constant_members: &[],
        }
    }
    pub fn attributes(self, attributes: &'a [&'a str]) -> Self {
        Self { attributes, ..self }
    }
    pub fn captures(self, captures: &'a [&'a str]) -> Self {
        Self { captures, ..self }
    }
    pub fn descriptor_names(self, descriptor_names: &'a [(u32, u32, &'a str)]) -> Self {
        Self {
            descriptor_names,
            ..self
        }
    }
    pub fn push_constant_members(self, push_constant_members: &'a [(&'a str, u32, &'a str)]) -> Self {
        Self {
            push_constant_members,
            ..self
        }
    }

    pub fn build(self, device: &Arc<Device>, subpass: Subpass) -> Result<Program, ProgramError> {
        let compiled = compile_sources(self.sources)?;
        let vs = load_entry_point(device, Stage::Vertex, &compiled.vertex)?;
        let fs = load_entry_point(device, Stage::Fragment, &compiled.fragment)?;

        let attributes = bind_attributes(
            &InterfaceVariable::reflect(&vs.info().input_interface),
            self.attributes,
        )?;
        let captures = resolve_captures(
            &InterfaceVariable::reflect(&vs.info().output_interface),
            self.captures,
            &Particle::CAPTURE_LAYOUT,
        )?;

        let link = |e: &dyn fmt::Debug| ProgramError::link(format!("{e:?}"));

        // Buffer members are matched to kernel inputs by name
        let vertex_input_state = Particle::per_vertex()
            .definition(&vs.info().input_interface)
            .map_err(|e| link(&e))?;

        let uniforms = enumerate_uniforms(
            ReflectedUniforms::of([vs.info(), fs.info()]),
            self.descriptor_names,
            self.push_constant_members,
        );

        let stages = [
            PipelineShaderStageCreateInfo::new(vs),
            PipelineShaderStageCreateInfo::new(fs),
        ];
        let layout = PipelineLayout::new(
            device.clone(),
            PipelineDescriptorSetLayoutCreateInfo::from_stages(&stages)
                .into_pipeline_layout_create_info(device.clone())
                .map_err(|e| link(&e))?,
        )
        .map_err(|e| link(&e))?;

        let pipeline = GraphicsPipeline::new(
            device.clone(),
            None,
            GraphicsPipelineCreateInfo {
                stages: stages.into_iter().collect(),
                vertex_input_state: Some(vertex_input_state),
                // One point per particle
                input_assembly_state: Some(InputAssemblyState {
                    topology: PrimitiveTopology::PointList,
                    ..Default::default()
                }),
                viewport_state: Some(ViewportState::default()),
                rasterization_state: Some(RasterizationState::default()),
                multisample_state: Some(MultisampleState::default()),
                // The fragment stage is a stub, keep it from touching the target
                color_blend_state: Some(ColorBlendState::with_attachment_states(
                    subpass.num_color_attachments(),
                    ColorBlendAttachmentState {
                        color_write_mask: ColorComponents::empty(),
                        ..Default::default()
                    },
                )),
                dynamic_state: [DynamicState::Viewport].into_iter().collect(),
                subpass: Some(subpass.into()),
                ..GraphicsPipelineCreateInfo::layout(layout)
            },
        )
        .map_err(|e| link(&e))?;

        for uniform in &uniforms {
            log::debug!("uniform[{}]: {} ({})", uniform.slot, uniform.name, uniform.ty);
        }

        Ok(Program {
            pipeline,
            attributes,
            captures,
            uniforms,
        })
    }
}

fn load_entry_point(device: &Arc<Device>, stage: Stage, words: &[u32]) -> Result<EntryPoint, ProgramError> {
    // SAFETY: `words` is SPIR-V straight from shaderc
    let module = unsafe { ShaderModule::new(device.clone(), ShaderModuleCreateInfo::new(words)) }
        .map_err(|e| ProgramError::Compile {
            stage,
            log: format!("{e:?}"),
        })?;
    module.entry_point(ENTRY_POINT).ok_or_else(|| ProgramError::Compile {
        stage,
        log: format!("no `{ENTRY_POINT}` entry point"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kernel_inputs() -> Vec<InterfaceVariable> {
        vec![
            InterfaceVariable::new("Position", 0, 3),
            InterfaceVariable::new("BirthTime", 3, 1),
            InterfaceVariable::new("Velocity", 4, 3),
        ]
    }

    fn kernel_outputs() -> Vec<InterfaceVariable> {
        vec![
            InterfaceVariable::new("vPosition", 0, 3),
            InterfaceVariable::new("vBirthTime", 1, 1),
            InterfaceVariable::new("vVelocity", 2, 3),
        ]
    }

    fn link_log(result: Result<impl fmt::Debug, ProgramError>) -> String {
        match result {
            Err(ProgramError::Link { log }) => log,
            other => panic!("expected a link error, got {other:?}"),
        }
    }

    #[test]
    fn embedded_kernels_compile() {
        let compiled = compile_sources(&KernelSources::embedded()).unwrap();
        // SPIR-V magic number
        assert_eq!(compiled.vertex[0], 0x0723_0203);
        assert_eq!(compiled.fragment[0], 0x0723_0203);
    }

    #[test]
    fn vertex_compile_error_carries_the_log() {
        let sources = KernelSources {
            vertex: "#version 450\nvoid main() { undeclared = 1.0; }\n".to_owned(),
            ..KernelSources::embedded()
        };
        match compile_sources(&sources) {
            Err(ProgramError::Compile { stage, log }) => {
                assert_eq!(stage, Stage::Vertex);
                assert!(log.contains("undeclared"), "log was: {log}");
            }
            other => panic!("expected a vertex compile error, got {:?}", other.err()),
        }
    }

    #[test]
    fn fragment_compile_error_names_the_stage() {
        let sources = KernelSources {
            fragment: "#version 450\nvoid main() { FragColor = vec4(0.0) }\n".to_owned(),
            ..KernelSources::embedded()
        };
        let err = compile_sources(&sources).err().unwrap();
        assert!(matches!(err, ProgramError::Compile { stage: Stage::Fragment, .. }));
        assert!(err.to_string().starts_with("can't compile fragment stage"));
    }

    #[test]
    fn kernel_sources_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VERTEX_FILE), "vertex text").unwrap();
        std::fs::write(dir.path().join(FRAGMENT_FILE), "fragment text").unwrap();

        let sources = KernelSources::load(Some(dir.path())).unwrap();
        assert_eq!(sources.vertex, "vertex text");
        assert_eq!(sources.fragment, "fragment text");

        std::fs::remove_file(dir.path().join(FRAGMENT_FILE)).unwrap();
        assert!(matches!(
            KernelSources::load(Some(dir.path())),
            Err(EngineError::KernelSource { .. })
        ));
    }

    #[test]
    fn attributes_bind_to_fixed_slots() {
        let bindings = bind_attributes(&kernel_inputs(), &PARTICLE_ATTRIBUTES).unwrap();
        let slots: Vec<_> = bindings.iter().map(|b| (b.name.as_str(), b.slot)).collect();
        assert_eq!(slots, vec![("Position", 0), ("BirthTime", 3), ("Velocity", 4)]);
    }

    #[test]
    fn attribute_mismatches_fail_to_link() {
        let log = link_log(bind_attributes(&kernel_inputs(), &["Position", "BirthTime", "Velocity"]));
        assert!(log.contains("BirthTime"), "{log}");

        let log = link_log(bind_attributes(&kernel_inputs(), &["Position", "TexCoord", "Normal", "BirthTime"]));
        assert!(log.contains("Velocity"), "{log}");

        let log = link_log(bind_attributes(&kernel_inputs(), &["Position", "Position"]));
        assert!(log.contains("twice"), "{log}");
    }

    #[test]
    fn captures_pack_interleaved() {
        let slots = resolve_captures(&kernel_outputs(), &PARTICLE_CAPTURES, &Particle::CAPTURE_LAYOUT).unwrap();
        let layout: Vec<_> = slots.iter().map(|s| (s.name.as_str(), s.offset)).collect();
        assert_eq!(layout, vec![("vPosition", 0), ("vBirthTime", 12), ("vVelocity", 16)]);
    }

    #[test]
    fn no_captures_means_no_capture_set() {
        assert_eq!(resolve_captures(&kernel_outputs(), &[], &Particle::CAPTURE_LAYOUT).unwrap(), vec![]);
    }

    #[test]
    fn capture_mismatches_fail_to_link() {
        let record = &Particle::CAPTURE_LAYOUT;

        let log = link_log(resolve_captures(&kernel_outputs(), &["vPosition", "vAge", "vVelocity"], record));
        assert!(log.contains("vAge"), "{log}");

        let log = link_log(resolve_captures(
            &kernel_outputs(),
            &["vBirthTime", "vPosition", "vVelocity"],
            record,
        ));
        assert!(log.contains("declaration order"), "{log}");

        let log = link_log(resolve_captures(&kernel_outputs(), &["vPosition", "vVelocity"], record));
        assert!(log.contains("particle record"), "{log}");
    }

    #[test]
    fn uniforms_are_named_and_ordered() {
        let reflected = ReflectedUniforms {
            descriptors: vec![
                (1, 0, "StorageBuffer".to_owned()),
                (0, 0, "CombinedImageSampler".to_owned()),
                (1, 0, "StorageBuffer".to_owned()),
                (2, 3, "UniformBuffer".to_owned()),
            ],
            push_constant_end: 16,
        };
        let members = [("Size", 0, "vec3"), ("Time", 12, "float"), ("Extent", 16, "vec3")];
        let uniforms = enumerate_uniforms(reflected, &KERNEL_DESCRIPTORS, &members);

        let listed: Vec<(String, UniformSlot)> = uniforms.into_iter().map(|u| (u.name, u.slot)).collect();
        assert_eq!(
            listed,
            vec![
                ("Sampler".to_owned(), UniformSlot::Descriptor { set: 0, binding: 0 }),
                ("Capture".to_owned(), UniformSlot::Descriptor { set: 1, binding: 0 }),
                ("set2.binding3".to_owned(), UniformSlot::Descriptor { set: 2, binding: 3 }),
                ("Size".to_owned(), UniformSlot::PushConstant { offset: 0 }),
                ("Time".to_owned(), UniformSlot::PushConstant { offset: 12 }),
            ]
        );
    }

    #[test]
    fn no_push_constants_lists_no_members() {
        let uniforms = enumerate_uniforms(
            ReflectedUniforms::default(),
            &KERNEL_DESCRIPTORS,
            &crate::kernel::PARAM_MEMBERS,
        );
        assert!(uniforms.is_empty());
    }
}
