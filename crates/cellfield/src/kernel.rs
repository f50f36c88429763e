//! Kernels: the per-cell transition functions the engine runs.
//!
//! The engine doesn't understand what a kernel computes. It only binds the kernel's inputs, sets
//! its uniforms and runs it once for every cell of a variable's next buffer. A kernel is either
//! WGSL for the GPU substrate or a plain Rust function for the host substrate. Both see the same
//! things: the cell's position, its dependencies' current cells (read with toroidal wrapping) and
//! the kernel's declared scalar uniforms.

use std::sync::Arc;

use glam::Vec4;

use crate::error::{EngineError, EngineResult};

/// A host kernel function.
pub type HostFunction = dyn Fn(&Cell<'_>) -> Vec4 + Send + Sync;

/// What a kernel runs.
#[derive(Clone)]
pub enum Program {
    /// WGSL defining `fn cell(position: vec2<i32>) -> vec4<f32>`.
    ///
    /// The engine prepends declarations for `grid` (`width`, `height`, `generation`), for
    /// `uniforms` (one `f32` field per declared uniform) and a `sample_<dependency>(x, y)` helper
    /// for every dependency, which wraps around the grid's edges.
    ComputeShader(String),
    /// A function run once per cell on the host.
    Host(Arc<HostFunction>),
}

/// Where a kernel can run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    /// A WGSL compute shader, for the GPU substrate.
    ComputeShader,
    /// A Rust function, for the host substrate.
    Host,
}

impl Platform {
    /// A human readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ComputeShader => "compute shader",
            Self::Host => "host",
        }
    }
}

/// A program plus the scalar uniforms it declares.
#[derive(Clone)]
pub struct Kernel {
    /// The per-cell program.
    program: Program,
    /// Declared uniforms and their current values, in declaration order.
    uniforms: Vec<(String, f32)>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Kernel")
            .field("platform", &self.platform())
            .field("uniforms", &self.uniforms)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    /// A WGSL kernel. Uniforms start at 0.
    #[must_use]
    pub fn compute_shader(source: impl Into<String>, uniforms: &[&str]) -> Self {
        Self::new(Program::ComputeShader(source.into()), uniforms)
    }

    /// A host kernel. Uniforms start at 0.
    #[must_use]
    pub fn host(
        function: impl Fn(&Cell<'_>) -> Vec4 + Send + Sync + 'static,
        uniforms: &[&str],
    ) -> Self {
        Self::new(Program::Host(Arc::new(function)), uniforms)
    }

    /// Instantiate. Repeated uniform names are only declared once.
    fn new(program: Program, names: &[&str]) -> Self {
        let mut uniforms: Vec<(String, f32)> = Vec::with_capacity(names.len());
        for name in names {
            if !uniforms.iter().any(|(existing, _)| existing == name) {
                uniforms.push(((*name).to_owned(), 0.0));
            }
        }
        Self { program, uniforms }
    }

    /// Where this kernel can run.
    #[must_use]
    pub const fn platform(&self) -> Platform {
        match self.program {
            Program::ComputeShader(_) => Platform::ComputeShader,
            Program::Host(_) => Platform::Host,
        }
    }

    /// The per-cell program.
    #[must_use]
    pub const fn program(&self) -> &Program {
        &self.program
    }

    /// Declared uniforms with their current values.
    #[must_use]
    pub fn uniforms(&self) -> &[(String, f32)] {
        &self.uniforms
    }

    /// The current value of a declared uniform.
    #[must_use]
    pub fn uniform(&self, name: &str) -> Option<f32> {
        self.uniforms
            .iter()
            .find(|(declared, _)| declared == name)
            .map(|&(_, value)| value)
    }

    /// Set a declared uniform.
    ///
    /// # Errors
    /// `UnknownUniform` if the kernel never declared `name`.
    pub fn set_uniform(&mut self, name: &str, value: f32) -> EngineResult<()> {
        let uniform = self
            .uniforms
            .iter_mut()
            .find(|(declared, _)| declared == name)
            .ok_or_else(|| EngineError::UnknownUniform(name.to_owned()))?;
        uniform.1 = value;
        Ok(())
    }

    /// Uniform names end up in generated WGSL, beside the engine's own padding fields.
    pub(crate) fn validate(&self) -> EngineResult<()> {
        match self
            .uniforms
            .iter()
            .find(|(name, _)| !is_identifier(name) || name.starts_with(GENERATED_PREFIX))
        {
            Some((name, _)) => Err(EngineError::InvalidName(name.clone())),
            None => Ok(()),
        }
    }
}

/// A dependency bound to a host kernel.
pub(crate) struct Input<'input> {
    /// The dependency variable's name.
    pub name: &'input str,
    /// Its current cells.
    pub cells: &'input [Vec4],
}

/// What a host kernel sees of the cell it's computing.
pub struct Cell<'cell> {
    /// Column.
    x: u32,
    /// Row.
    y: u32,
    /// Grid width.
    width: u32,
    /// Grid height.
    height: u32,
    /// The number of steps completed before this one.
    generation: u64,
    /// The kernel's dependencies.
    inputs: &'cell [Input<'cell>],
    /// The kernel's uniforms.
    uniforms: &'cell [(String, f32)],
}

impl<'cell> Cell<'cell> {
    /// Instantiate.
    pub(crate) const fn new(
        position: (u32, u32),
        size: (u32, u32),
        generation: u64,
        inputs: &'cell [Input<'cell>],
        uniforms: &'cell [(String, f32)],
    ) -> Self {
        Self {
            x: position.0,
            y: position.1,
            width: size.0,
            height: size.1,
            generation,
            inputs,
            uniforms,
        }
    }

    /// Column of the cell being computed.
    #[must_use]
    pub const fn x(&self) -> u32 {
        self.x
    }

    /// Row of the cell being computed.
    #[must_use]
    pub const fn y(&self) -> u32 {
        self.y
    }

    /// Grid width.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Grid height.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// The number of steps completed before the one being computed.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Read a dependency at an offset from this cell, wrapping around the grid's edges.
    /// Dependencies that aren't bound read as zero, just like an unseeded buffer.
    #[must_use]
    pub fn sample(&self, dependency: &str, dx: i32, dy: i32) -> Vec4 {
        self.sample_at(
            dependency,
            i64::from(self.x) + i64::from(dx),
            i64::from(self.y) + i64::from(dy),
        )
    }

    /// Read a dependency at this cell.
    #[must_use]
    pub fn current(&self, dependency: &str) -> Vec4 {
        self.sample(dependency, 0, 0)
    }

    /// Read a dependency at absolute coordinates, wrapping around the grid's edges.
    #[must_use]
    pub fn sample_at(&self, dependency: &str, x: i64, y: i64) -> Vec4 {
        let index = cellfield_kernel::sampling::wrapped_index(x, y, self.width, self.height);
        self.inputs
            .iter()
            .find(|input| input.name == dependency)
            .and_then(|input| input.cells.get(index))
            .copied()
            .unwrap_or(Vec4::ZERO)
    }

    /// The value of a uniform, or 0 if the kernel doesn't declare it.
    #[must_use]
    pub fn uniform(&self, name: &str) -> f32 {
        self.uniforms
            .iter()
            .find(|(declared, _)| declared == name)
            .map_or(0.0, |&(_, value)| value)
    }
}

/// Prefix of every name the engine generates in WGSL.
pub(crate) const GENERATED_PREFIX: &str = "cellfield_";

/// WGSL keywords and reserved words, none of which can name anything.
#[rustfmt::skip]
const RESERVED: &[&str] = &[
    "alias", "break", "case", "const", "const_assert", "continue", "continuing", "default",
    "diagnostic", "discard", "else", "enable", "false", "fn", "for", "if", "let", "loop",
    "override", "requires", "return", "struct", "switch", "true", "var", "while",
    "NULL", "Self", "abstract", "active", "alignas", "alignof", "as", "asm", "asm_fragment",
    "async", "attribute", "auto", "await", "become", "binding_array", "cast", "catch", "class",
    "co_await", "co_return", "co_yield", "coherent", "column_major", "common", "compile",
    "compile_fragment", "concept", "const_cast", "consteval", "constexpr", "constinit", "crate",
    "debugger", "decltype", "delete", "demote", "demote_to_helper", "do", "dynamic_cast", "enum",
    "explicit", "export", "extends", "extern", "external", "fallthrough", "filter", "final",
    "finally", "friend", "from", "fxgroup", "get", "goto", "groupshared", "highp", "impl",
    "implements", "import", "inline", "instanceof", "interface", "layout", "lowp", "macro",
    "macro_rules", "match", "mediump", "meta", "mod", "module", "move", "mut", "mutable",
    "namespace", "new", "nil", "noexcept", "noinline", "nointerpolation", "noperspective", "null",
    "nullptr", "of", "operator", "package", "packoffset", "partition", "pass", "patch",
    "pixelfragment", "precise", "precision", "premerge", "priv", "protected", "pub", "public",
    "readonly", "ref", "regardless", "register", "reinterpret_cast", "require", "resource",
    "restrict", "self", "set", "shared", "sizeof", "smooth", "snorm", "static", "static_assert",
    "static_cast", "std", "subroutine", "super", "target", "template", "this", "thread_local",
    "throw", "trait", "try", "type", "typedef", "typeid", "typename", "typeof", "union", "unless",
    "unorm", "unsafe", "unsized", "use", "using", "varying", "virtual", "volatile", "wgsl",
    "where", "with", "writeonly", "yield",
];

/// Whether a name can be spliced into WGSL as an identifier. WGSL reserves `_` on its own, every
/// name starting with `__`, and its keywords.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut characters = name.chars();
    let well_formed = characters
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && characters.all(|character| character.is_ascii_alphanumeric() || character == '_');
    well_formed && name != "_" && !name.starts_with("__") && !RESERVED.contains(&name)
}

#[expect(clippy::float_cmp, reason = "They're just tests")]
#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_identifier("energy"));
        assert!(is_identifier("_field2"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("2field"));
        assert!(!is_identifier("field-b"));
        assert!(!is_identifier("fïeld"));
    }

    #[test]
    fn wgsl_keywords_are_not_identifiers() {
        for name in ["loop", "var", "struct", "fn", "self", "_", "__field"] {
            assert!(!is_identifier(name), "`{name}` was accepted");
        }
        assert!(is_identifier("loops"));
        assert!(is_identifier("_var"));
    }

    #[test]
    fn uniforms_are_declared_once() {
        let mut kernel = Kernel::host(|_| Vec4::ZERO, &["mu", "sigma", "mu"]);
        assert_eq!(kernel.uniforms().len(), 2);
        kernel.set_uniform("sigma", 0.5).unwrap();
        assert_eq!(kernel.uniform("sigma"), Some(0.5));
        assert_eq!(kernel.uniform("mu"), Some(0.0));
        assert!(matches!(
            kernel.set_uniform("nope", 1.0),
            Err(EngineError::UnknownUniform(name)) if name == "nope"
        ));
    }

    #[test]
    fn rejects_uniforms_that_are_not_identifiers() {
        let kernel = Kernel::compute_shader("", &["ok", "not ok"]);
        assert!(matches!(kernel.validate(), Err(EngineError::InvalidName(_))));
        let keyword = Kernel::compute_shader("", &["ok", "loop"]);
        assert!(matches!(keyword.validate(), Err(EngineError::InvalidName(name)) if name == "loop"));
    }

    #[test]
    fn rejects_uniforms_named_like_the_engine_padding() {
        let kernel = Kernel::compute_shader("", &["mu", "cellfield_padding_1"]);
        assert!(matches!(
            kernel.validate(),
            Err(EngineError::InvalidName(name)) if name == "cellfield_padding_1"
        ));
        assert!(Kernel::compute_shader("", &["mu", "padding"]).validate().is_ok());
    }

    #[test]
    fn cells_wrap_around_the_grid() {
        #[rustfmt::skip]
        let cells = [
            Vec4::splat(1.0), Vec4::splat(2.0), Vec4::splat(3.0),
            Vec4::splat(4.0), Vec4::splat(5.0), Vec4::splat(6.0),
        ];
        let inputs = [Input {
            name: "field",
            cells: &cells,
        }];
        let uniforms = [("mu".to_owned(), 0.25)];
        let cell = Cell::new((0, 0), (3, 2), 7, &inputs, &uniforms);

        assert_eq!(cell.current("field").x, 1.0);
        assert_eq!(cell.sample("field", -1, 0).x, 3.0);
        assert_eq!(cell.sample("field", 0, -1).x, 4.0);
        assert_eq!(cell.sample("field", -1, -1).x, 6.0);
        assert_eq!(cell.sample("missing", 0, 0), Vec4::ZERO);
        assert_eq!(cell.uniform("mu"), 0.25);
        assert_eq!(cell.uniform("missing"), 0.0);
        assert_eq!(cell.generation(), 7);
    }
}
