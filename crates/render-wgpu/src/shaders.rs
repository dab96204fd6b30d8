/// Copies the renderer's output texture onto the swapchain image, whose
/// format and color space may differ from the output's.
pub const PRESENT_SHADER: &str = r#"
@group(0) @binding(0) var source_tex: texture_2d<f32>;
@group(0) @binding(1) var source_sampler: sampler;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: VertexOutput;
    out.position = vec4<f32>(uv * vec2<f32>(2.0, -2.0) + vec2<f32>(-1.0, 1.0), 0.0, 1.0);
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(source_tex, source_sampler, in.uv);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_shader_has_no_directives() {
        let processed = spartan_render::preprocess(PRESENT_SHADER, &[]).unwrap();
        assert_eq!(processed.trim(), PRESENT_SHADER.trim());
        assert!(PRESENT_SHADER.contains("fn vs_main"));
        assert!(PRESENT_SHADER.contains("fn fs_main"));
    }
}
