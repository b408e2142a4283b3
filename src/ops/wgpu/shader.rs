//! WGSL generation.
//!
//! A program's WGSL body is wrapped into a full compute shader:
//!
//! - binding 0 is the output grid, `rgba8uint` when the plan packs floats and
//!   `r32float` otherwise
//! - bindings 1.. are the arguments, in order, either as read-only `f32`
//!   storage buffers or, for deferred results of the same device, as the
//!   producer's texture
//! - each argument gets an `argN(...)` accessor taking coordinates outermost
//!   first, returning `0.0` out of range
//!
//! One invocation per output coordinate, `8 × 8 × 1` workgroups.

use std::fmt::Write as _;

use crate::codec::Codec;
use crate::output::{CellFormat, StoragePlan};
use crate::program::Program;

/// Workgroup size along x and y.
pub const WORKGROUP: u32 = 8;

/// How one argument reaches the shader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// One `f32` in a storage buffer.
    Scalar,
    /// A flattened array in a storage buffer, extents x first.
    Buffer {
        /// Extents of the array.
        extents: Vec<usize>,
    },
    /// A producer kernel's output texture.
    Texture {
        /// Extents of the producer's output.
        extents: Vec<usize>,
        /// Whether the texels carry packed floats.
        packed: bool,
    },
}

impl Binding {
    /// Texture binding for a producer's storage plan.
    pub fn texture(plan: &StoragePlan) -> Self {
        Self::Texture {
            extents: plan.extents().to_vec(),
            packed: plan.codec().is_some(),
        }
    }
}

fn xyz(extents: &[usize]) -> (usize, usize, usize) {
    let at = |i: usize| extents.get(i).copied().unwrap_or(1);
    (at(0), at(1), at(2))
}

/// Accessor parameter list and bounds check for an argument of `rank`.
fn coordinates(rank: usize, extents: &[usize]) -> (&'static str, String) {
    let (x, y, z) = xyz(extents);
    match rank {
        0 => ("", "false".to_owned()),
        1 => ("x: u32", format!("x >= {x}u")),
        2 => ("y: u32, x: u32", format!("x >= {x}u || y >= {y}u")),
        _ => (
            "z: u32, y: u32, x: u32",
            format!("x >= {x}u || y >= {y}u || z >= {z}u"),
        ),
    }
}

fn accessor(out: &mut String, index: usize, binding: &Binding) {
    let name = format!("arg{index}");
    match binding {
        Binding::Scalar => {
            let _ = writeln!(out, "fn {name}() -> f32 {{\n    return {name}_data[0];\n}}\n");
        }
        Binding::Buffer { extents } => {
            let (x, y, _) = xyz(extents);
            let (params, oob) = coordinates(extents.len(), extents);
            let at = match extents.len() {
                1 => "x".to_owned(),
                2 => format!("x + y * {x}u"),
                _ => format!("x + (y + z * {y}u) * {x}u"),
            };
            let _ = writeln!(
                out,
                "fn {name}({params}) -> f32 {{\n    if ({oob}) {{ return 0.0; }}\n    return {name}_data[{at}];\n}}\n"
            );
        }
        Binding::Texture { extents, packed } => {
            let (_, y, _) = xyz(extents);
            let (params, oob) = coordinates(extents.len(), extents);
            let cell = match extents.len() {
                1 => "vec2<u32>(x, 0u)".to_owned(),
                2 => "vec2<u32>(x, y)".to_owned(),
                _ => format!("vec2<u32>(x, y + z * {y}u)"),
            };
            let load = format!("textureLoad({name}_cells, {cell}, 0)");
            let value = if *packed {
                format!("unpack_float({load})")
            } else {
                format!("{load}.r")
            };
            let _ = writeln!(
                out,
                "fn {name}({params}) -> f32 {{\n    if ({oob}) {{ return 0.0; }}\n    return {value};\n}}\n"
            );
        }
    }
}

/// Builds the complete shader for `program` writing into `plan`.
///
/// Returns `None` if the program has no WGSL body.
pub fn generate(program: &Program, plan: &StoragePlan, bindings: &[Binding]) -> Option<String> {
    let body = program.wgsl()?;
    let (x, y, z) = plan.xyz();
    let packed = plan.cells() == CellFormat::Packed;
    let reads_packed = bindings
        .iter()
        .any(|b| matches!(b, Binding::Texture { packed: true, .. }));

    let mut out = String::new();
    let _ = writeln!(out, "// kernel: {}", program.name());
    let _ = writeln!(out, "const OUTPUT_X: u32 = {x}u;");
    let _ = writeln!(out, "const OUTPUT_Y: u32 = {y}u;");
    let _ = writeln!(out, "const OUTPUT_Z: u32 = {z}u;\n");

    let format = if packed { "rgba8uint" } else { "r32float" };
    let _ = writeln!(
        out,
        "@group(0) @binding(0) var out_cells: texture_storage_2d<{format}, write>;"
    );
    for (i, binding) in bindings.iter().enumerate() {
        let slot = i + 1;
        match binding {
            Binding::Scalar | Binding::Buffer { .. } => {
                let _ = writeln!(
                    out,
                    "@group(0) @binding({slot}) var<storage, read> arg{i}_data: array<f32>;"
                );
            }
            Binding::Texture { packed, .. } => {
                let texel = if *packed { "u32" } else { "f32" };
                let _ = writeln!(
                    out,
                    "@group(0) @binding({slot}) var arg{i}_cells: texture_2d<{texel}>;"
                );
            }
        }
    }
    out.push('\n');

    if packed {
        out.push_str(Codec::wgsl_pack());
        out.push('\n');
    }
    if reads_packed {
        out.push_str(Codec::wgsl_unpack());
        out.push('\n');
    }
    for (i, binding) in bindings.iter().enumerate() {
        accessor(&mut out, i, binding);
    }

    let _ = writeln!(out, "fn kernel_body(thread: vec3<u32>) -> f32 {{\n{body}\n}}\n");
    out.push_str(
        "fn output_cell(x: u32, y: u32, z: u32) -> vec2<u32> {\n    \
         return vec2<u32>(x, y + z * OUTPUT_Y);\n}\n\n",
    );
    let store = if packed {
        "textureStore(out_cells, cell, pack_float(value));"
    } else {
        "textureStore(out_cells, cell, vec4<f32>(value, 0.0, 0.0, 0.0));"
    };
    let _ = writeln!(
        out,
        "fn store_output(cell: vec2<u32>, value: f32) {{\n    {store}\n}}\n"
    );
    let _ = writeln!(
        out,
        "@compute @workgroup_size({WORKGROUP}, {WORKGROUP}, 1)\n\
         fn main(@builtin(global_invocation_id) id: vec3<u32>) {{\n    \
         if (id.x >= OUTPUT_X || id.y >= OUTPUT_Y || id.z >= OUTPUT_Z) {{ return; }}\n    \
         store_output(output_cell(id.x, id.y, id.z), kernel_body(id));\n}}"
    );
    Some(out)
}
