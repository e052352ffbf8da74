//! Bytecode-to-IR translation: type mapping, the stack model, the
//! two-pass function translator, call emission, and debug metadata.

pub mod calls;
pub mod debuginfo;
pub mod stack_frame;
pub mod translator;
pub mod types;
