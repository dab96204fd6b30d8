//! Shader sources, feature flags and the `#ifdef` preprocessor.

use crate::device::{
    BlendMode, ColorTarget, CompareOp, CullMode, DepthState, PipelineDesc, ShaderId,
    TextureFormat, VertexLayout,
};
use crate::gbuffer::GBuffer;
use bitflags::bitflags;

/// Format of the lighting accumulation target.
pub const HDR_FORMAT: TextureFormat = TextureFormat::Rgba16Float;
/// Format of post-processing and output targets.
pub const LDR_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;

/// Identity of a shader template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderSource {
    GBuffer,
    Lighting,
    Transparent,
    PostProcess,
}

impl ShaderSource {
    pub const ALL: [ShaderSource; 4] = [
        Self::GBuffer,
        Self::Lighting,
        Self::Transparent,
        Self::PostProcess,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::GBuffer => "gbuffer.wgsl",
            Self::Lighting => "lighting.wgsl",
            Self::Transparent => "transparent.wgsl",
            Self::PostProcess => "post.wgsl",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::GBuffer => include_str!("shaders/gbuffer.wgsl"),
            Self::Lighting => include_str!("shaders/lighting.wgsl"),
            Self::Transparent => include_str!("shaders/transparent.wgsl"),
            Self::PostProcess => include_str!("shaders/post.wgsl"),
        }
    }
}

bitflags! {
    /// Feature bitmask selecting a shader variation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct ShaderFlags: u32 {
        const ALBEDO_MAP = 1 << 0;
        const NORMAL_MAP = 1 << 1;
        const ROUGHNESS_MAP = 1 << 2;
        const METALLIC_MAP = 1 << 3;
        const OCCLUSION_MAP = 1 << 4;
        const EMISSIVE_MAP = 1 << 5;

        const DEPTH_ONLY = 1 << 8;
        const ALPHA_BLEND = 1 << 9;

        const DIRECTIONAL = 1 << 12;
        const POINT = 1 << 13;
        const SPOT = 1 << 14;
        const AMBIENT = 1 << 15;

        const TONEMAP_ACES = 1 << 16;
        const TONEMAP_REINHARD = 1 << 17;
        const FXAA = 1 << 18;
        const SHARPEN = 1 << 19;
        const BLIT = 1 << 20;

        const MATERIAL_MAPS = Self::ALBEDO_MAP.bits()
            | Self::NORMAL_MAP.bits()
            | Self::ROUGHNESS_MAP.bits()
            | Self::METALLIC_MAP.bits()
            | Self::OCCLUSION_MAP.bits()
            | Self::EMISSIVE_MAP.bits();
    }
}

const DEFINE_NAMES: [(ShaderFlags, &str); 17] = [
    (ShaderFlags::ALBEDO_MAP, "HAS_ALBEDO_MAP"),
    (ShaderFlags::NORMAL_MAP, "HAS_NORMAL_MAP"),
    (ShaderFlags::ROUGHNESS_MAP, "HAS_ROUGHNESS_MAP"),
    (ShaderFlags::METALLIC_MAP, "HAS_METALLIC_MAP"),
    (ShaderFlags::OCCLUSION_MAP, "HAS_OCCLUSION_MAP"),
    (ShaderFlags::EMISSIVE_MAP, "HAS_EMISSIVE_MAP"),
    (ShaderFlags::DEPTH_ONLY, "DEPTH_ONLY"),
    (ShaderFlags::ALPHA_BLEND, "ALPHA_BLEND"),
    (ShaderFlags::DIRECTIONAL, "LIGHT_DIRECTIONAL"),
    (ShaderFlags::POINT, "LIGHT_POINT"),
    (ShaderFlags::SPOT, "LIGHT_SPOT"),
    (ShaderFlags::AMBIENT, "LIGHT_AMBIENT"),
    (ShaderFlags::TONEMAP_ACES, "TONEMAP_ACES"),
    (ShaderFlags::TONEMAP_REINHARD, "TONEMAP_REINHARD"),
    (ShaderFlags::FXAA, "PASS_FXAA"),
    (ShaderFlags::SHARPEN, "PASS_SHARPEN"),
    (ShaderFlags::BLIT, "PASS_BLIT"),
];

impl ShaderFlags {
    /// The macro set for this variation, in a stable order.
    pub fn defines(self) -> Vec<(String, String)> {
        DEFINE_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| ((*name).to_string(), "1".to_string()))
            .collect()
    }
}

/// Fixed-function state a variation's pipeline is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineKind {
    /// Opaque depth only, writes depth with `Less`.
    DepthPrepass,
    /// GBuffer fill writing depth with `Less` (no pre-pass ran).
    GBuffer,
    /// GBuffer fill over pre-pass depth: `LessEqual`, no depth writes.
    GBufferPrepassed,
    /// Additive full-screen light accumulation into HDR.
    Lighting,
    /// Forward shaded, alpha blended, depth tested read-only.
    Transparent,
    /// Full-screen post pass into an LDR target.
    Post,
}

impl PipelineKind {
    pub fn pipeline_desc(self, label: String, shader: ShaderId) -> PipelineDesc {
        let gbuffer_targets = GBuffer::color_formats()
            .into_iter()
            .map(|format| ColorTarget {
                format,
                blend: BlendMode::Replace,
            })
            .collect::<Vec<_>>();
        let depth = |compare, write| {
            Some(DepthState {
                format: GBuffer::DEPTH_FORMAT,
                compare,
                write,
            })
        };
        let (vertex_layout, fragment, color_targets, depth, cull) = match self {
            Self::DepthPrepass => (
                VertexLayout::Mesh,
                false,
                Vec::new(),
                depth(CompareOp::Less, true),
                CullMode::Back,
            ),
            Self::GBuffer => (
                VertexLayout::Mesh,
                true,
                gbuffer_targets,
                depth(CompareOp::Less, true),
                CullMode::Back,
            ),
            Self::GBufferPrepassed => (
                VertexLayout::Mesh,
                true,
                gbuffer_targets,
                depth(CompareOp::LessEqual, false),
                CullMode::Back,
            ),
            Self::Lighting => (
                VertexLayout::FullScreen,
                true,
                vec![ColorTarget {
                    format: HDR_FORMAT,
                    blend: BlendMode::Additive,
                }],
                None,
                CullMode::None,
            ),
            Self::Transparent => (
                VertexLayout::Mesh,
                true,
                vec![ColorTarget {
                    format: HDR_FORMAT,
                    blend: BlendMode::Alpha,
                }],
                depth(CompareOp::LessEqual, false),
                CullMode::None,
            ),
            Self::Post => (
                VertexLayout::FullScreen,
                true,
                vec![ColorTarget {
                    format: LDR_FORMAT,
                    blend: BlendMode::Replace,
                }],
                None,
                CullMode::None,
            ),
        };
        PipelineDesc {
            label,
            shader,
            vertex_layout,
            fragment,
            color_targets,
            depth,
            cull,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreprocessError {
    #[error("line {line}: {directive} without matching #ifdef")]
    Unmatched { line: usize, directive: &'static str },
    #[error("line {line}: second #else in the same block")]
    DuplicateElse { line: usize },
    #[error("line {line}: {directive} needs a macro name")]
    MissingName { line: usize, directive: &'static str },
    #[error("{open} unterminated #ifdef block(s) at end of file")]
    Unterminated { open: usize },
}

struct Block {
    /// Whether the enclosing block is emitting lines.
    parent_active: bool,
    condition: bool,
    in_else: bool,
}

impl Block {
    fn active(&self) -> bool {
        self.parent_active && (self.condition != self.in_else)
    }
}

/// Resolve `#ifdef`, `#ifndef`, `#else` and `#endif` against `defines`.
///
/// Inactive lines are dropped; directive lines are replaced by blank lines
/// so compiler diagnostics keep their line numbers.
pub fn preprocess(source: &str, defines: &[(String, String)]) -> Result<String, PreprocessError> {
    let is_defined = |name: &str| defines.iter().any(|(d, _)| d == name);
    let mut stack: Vec<Block> = Vec::new();
    let mut out = String::with_capacity(source.len());

    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        let trimmed = raw.trim_start();
        let active = stack.last().is_none_or(Block::active);

        let mut words = trimmed.split_whitespace();
        let directive = if trimmed.starts_with('#') { words.next() } else { None };
        match directive {
            Some(d @ ("#ifdef" | "#ifndef")) => {
                let directive = if d == "#ifdef" { "#ifdef" } else { "#ifndef" };
                let name = words
                    .next()
                    .ok_or(PreprocessError::MissingName { line, directive })?;
                let defined = is_defined(name);
                stack.push(Block {
                    parent_active: active,
                    condition: if directive == "#ifdef" { defined } else { !defined },
                    in_else: false,
                });
            }
            Some("#else") => {
                let block = stack.last_mut().ok_or(PreprocessError::Unmatched {
                    line,
                    directive: "#else",
                })?;
                if block.in_else {
                    return Err(PreprocessError::DuplicateElse { line });
                }
                block.in_else = true;
            }
            Some("#endif") => {
                stack.pop().ok_or(PreprocessError::Unmatched {
                    line,
                    directive: "#endif",
                })?;
            }
            _ => {
                if active {
                    out.push_str(raw);
                }
            }
        }
        out.push('\n');
    }

    if !stack.is_empty() {
        return Err(PreprocessError::Unterminated { open: stack.len() });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs(names: &[&str]) -> Vec<(String, String)> {
        names.iter().map(|n| (n.to_string(), "1".to_string())).collect()
    }

    #[test]
    fn defines_follow_flags() {
        let flags = ShaderFlags::NORMAL_MAP | ShaderFlags::ALBEDO_MAP;
        let names: Vec<String> = flags.defines().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["HAS_ALBEDO_MAP", "HAS_NORMAL_MAP"]);
        assert!(ShaderFlags::empty().defines().is_empty());
    }

    #[test]
    fn nested_blocks() {
        let src = "a\n#ifdef X\nb\n#ifndef Y\nc\n#else\nd\n#endif\n#else\ne\n#endif\nf";
        let lines = |out: String| {
            out.lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        };
        assert_eq!(lines(preprocess(src, &defs(&["X"])).unwrap()), ["a", "b", "c", "f"]);
        assert_eq!(lines(preprocess(src, &defs(&["X", "Y"])).unwrap()), ["a", "b", "d", "f"]);
        assert_eq!(lines(preprocess(src, &defs(&["Y"])).unwrap()), ["a", "e", "f"]);
    }

    #[test]
    fn line_numbers_are_preserved() {
        let src = "one\n#ifdef X\ntwo\n#endif\nthree";
        let out = preprocess(src, &[]).unwrap();
        assert_eq!(out.lines().count(), 5);
        assert_eq!(out.lines().nth(4), Some("three"));
    }

    #[test]
    fn unbalanced_directives_are_errors() {
        assert_eq!(
            preprocess("#endif", &[]),
            Err(PreprocessError::Unmatched {
                line: 1,
                directive: "#endif"
            })
        );
        assert_eq!(
            preprocess("#ifdef A\nx", &[]),
            Err(PreprocessError::Unterminated { open: 1 })
        );
        assert_eq!(
            preprocess("#ifdef A\n#else\n#else\n#endif", &[]),
            Err(PreprocessError::DuplicateElse { line: 3 })
        );
        assert!(matches!(
            preprocess("#ifdef\n#endif", &[]),
            Err(PreprocessError::MissingName { line: 1, .. })
        ));
    }

    #[test]
    fn embedded_sources_preprocess_for_every_feature() {
        let all = ShaderFlags::all();
        for source in ShaderSource::ALL {
            for flags in [ShaderFlags::empty(), all] {
                preprocess(source.code(), &flags.defines()).unwrap();
            }
            for (flag, _) in DEFINE_NAMES {
                preprocess(source.code(), &flag.defines()).unwrap();
            }
        }
    }

    #[test]
    fn depth_prepass_has_no_color_targets() {
        let desc = PipelineKind::DepthPrepass.pipeline_desc("prepass".into(), ShaderId(1));
        assert!(desc.color_targets.is_empty());
        assert!(!desc.fragment);
        let desc = PipelineKind::GBufferPrepassed.pipeline_desc("gbuffer".into(), ShaderId(1));
        assert_eq!(desc.color_targets.len(), 3);
        assert!(!desc.depth.unwrap().write);
    }
}
