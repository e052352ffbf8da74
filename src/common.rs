//! Symbol naming and shared constants.

use crate::engine::{MessageType, ScriptEngine, ScriptFunction};

/// Size of a VM pointer in stack dwords.
pub const PTR_DWORDS: i64 = 2;

/// User-data key under which the JITted body address of a script function
/// is stored, so the runtime vtable helpers can find it.
pub const VTABLE_USERDATA_IDENTIFIER: u64 = 0xCAFE_CAFE_CAFE_CAFE;

/// Name of the backend module for a script module.
pub fn make_module_name(module: Option<&str>) -> String {
    match module {
        None => "asjit.shared".to_owned(),
        Some(name) => format!("asjit.module.{name}"),
    }
}

/// Symbol name of a script function's native implementation.
///
/// The engine-assigned function id keeps overloads distinct and lets any
/// module compute the same name when importing.
pub fn make_function_name(function: &ScriptFunction) -> String {
    format!(
        "{}.{}.{}",
        make_module_name(function.module.as_deref()),
        function.name,
        function.id.0
    )
}

/// Symbol name of a script function's VM entry thunk.
pub fn make_vm_entry_thunk_name(function: &ScriptFunction) -> String {
    format!("{}.vmthunk", make_function_name(function))
}

/// Symbol name of a system (native) function.
pub fn make_system_function_name(function: &ScriptFunction) -> String {
    format!("asjit.external.{}.{}", function.name, function.id.0)
}

/// Routes a compiler diagnostic through the engine's message callback.
pub(crate) fn diagnostic(engine: &ScriptEngine, kind: MessageType, text: impl AsRef<str>) {
    engine.write_message(kind, &format!("asjit: {}", text.as_ref()));
}
