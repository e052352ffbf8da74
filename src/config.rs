//! JIT compiler configuration.

/// Tunables for the JIT compiler.
///
/// All knobs affect code quality or diagnostics only; none change the
/// observable semantics of translated functions, with the exception of
/// `allow_devirtualization` which replaces a runtime vtable lookup with a
/// direct call when the callee cannot be overridden.
#[derive(Debug, Clone, Copy)]
pub struct JitConfig {
    /// Compile at the backend's `speed` optimization level. When false the
    /// backend compiles at `none`; the IR verifier runs either way.
    pub allow_optimizations: bool,
    /// Disassemble each function before translation and log module symbol
    /// state after codegen.
    pub verbose: bool,
    /// Resolve virtual calls to final methods (or methods of no-inherit
    /// classes) at compile time.
    pub allow_devirtualization: bool,
    /// Request fast-math lowering for float operations. Advisory: Cranelift
    /// exposes no per-instruction fast-math flags, so this is recorded but
    /// has no effect on emitted code.
    pub allow_fast_math: bool,
    /// Treat `readonly` system functions as accessing only argument memory.
    /// Advisory on this backend; the declaration is tagged but Cranelift
    /// has no attribute to consume it.
    pub assume_const_is_pure: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            allow_optimizations: true,
            verbose: false,
            allow_devirtualization: true,
            allow_fast_math: false,
            assume_const_is_pure: false,
        }
    }
}
