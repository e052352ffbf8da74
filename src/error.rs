//! Error types for the JIT compilation pipeline.

/// Error raised while translating or assembling a function.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// The engine handed over a function without a bytecode body.
    #[error("function has no bytecode body")]
    NullBytecode,

    /// The translator reached an opcode it does not support. The function
    /// is dropped from the module; other pending functions still build.
    #[error("unimplemented instruction {0}")]
    UnimplementedInstruction(&'static str),

    /// A function from a different engine instance was submitted.
    #[error("function belongs to a different engine instance")]
    EngineMismatch,

    /// The backend rejected the produced IR.
    #[error("IR verifier rejected function {function}: {message}")]
    Verifier { function: String, message: String },

    /// Backend or ISA construction failure.
    #[error("codegen backend error: {0}")]
    Backend(String),

    /// Declaration, definition or finalization failure in the JIT linker.
    #[error("module error: {0}")]
    Module(#[from] cranelift_module::ModuleError),
}

/// Logs an internal-consistency failure with its location and panics.
///
/// Invariant violations are not recoverable: the stack model or the jump
/// map is corrupt and any IR emitted afterwards would be garbage.
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {{
        log::error!("internal consistency failure at {}:{}: {}", file!(), line!(), format_args!($($arg)*));
        panic!("internal consistency failure: {}", format_args!($($arg)*));
    }};
}

/// Asserts a translator invariant, panicking through [`internal_error!`].
#[macro_export]
macro_rules! internal_assert {
    ($cond:expr) => {
        if !$cond {
            $crate::internal_error!(concat!("assertion failed: ", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::internal_error!($($arg)*);
        }
    };
}
