//! asjit: a JIT compiler that lowers a stack-based scripting VM's bytecode
//! into native machine code through Cranelift.
//!
//! The host scripting engine hands over each function's bytecode together
//! with its metadata (signature, stack sizing, debug line table, type
//! system). The compiler produces a native implementation of the function
//! plus a *VM entry thunk* the interpreter can call with its register file,
//! so execution transfers transparently into JITted code.
//!
//! Pipeline:
//! - [`jit::JitCompiler::compile`] enqueues a function into the
//!   [`assembler::ModuleAssembler`] of its script module;
//! - [`jit::JitCompiler::build_all`] drives a two-pass
//!   [`codegen::translator::FunctionTranslator`] per function (pass 1
//!   discovers branch targets and jump tables, pass 2 emits IR while
//!   tracking the VM's abstract stack pointer), finalizes each module in
//!   the JIT linker, and publishes every entry thunk into its
//!   [`runtime::FnPtrSlot`].

pub mod assembler;
pub mod bytecode;
pub mod codegen;
pub mod common;
pub mod config;
pub mod engine;
pub mod error;
pub mod jit;
pub mod runtime;

pub use assembler::{TargetArch, TargetInfo};
pub use config::JitConfig;
pub use error::JitError;
pub use jit::JitCompiler;
pub use runtime::{FnPtrSlot, VmEntryFn, VmRegisters};
