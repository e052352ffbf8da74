//! Host-engine data model: what the scripting engine hands the JIT.
//!
//! The engine proper (compiler, interpreter, stdlib) is not part of this
//! crate; these types are the contract it talks through. Tests build
//! engines by hand the same way they hand-assemble bytecode.

pub mod function;
pub mod types;

use std::cell::RefCell;

use rustc_hash::FxHashMap;

pub use function::{
    Bytecode, FunctionId, FunctionKind, LineEntry, NativeCallConv, NativeInterface, Param,
    ScriptFunction,
};
pub use types::{Behaviours, DataType, ObjectType, Property, TypeFlags, TypeId};

/// Severity of an engine diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Info,
    Warning,
    Error,
}

type MessageCallback = Box<dyn FnMut(MessageType, &str)>;

/// The engine-side state the JIT reads: a function table, an object type
/// registry, and a message sink.
///
/// Functions and types are boxed so their addresses stay stable; emitted
/// code and vtables hold raw pointers into them.
pub struct ScriptEngine {
    functions: Vec<Box<ScriptFunction>>,
    object_types: FxHashMap<TypeId, Box<ObjectType>>,
    next_type_id: i32,
    message_callback: RefCell<Option<MessageCallback>>,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine {
    pub fn new() -> Self {
        ScriptEngine {
            functions: Vec::new(),
            object_types: FxHashMap::default(),
            next_type_id: TypeId::FIRST_USER.0,
            message_callback: RefCell::new(None),
        }
    }

    /// Registers a function and assigns its id.
    pub fn register_function(&mut self, mut function: ScriptFunction) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        function.id = id;
        self.functions.push(Box::new(function));
        id
    }

    pub fn function(&self, id: FunctionId) -> &ScriptFunction {
        crate::internal_assert!(
            (id.0 as usize) < self.functions.len(),
            "unknown function id {}",
            id.0
        );
        &self.functions[id.0 as usize]
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Registers an object type and assigns its type id.
    pub fn register_object_type(&mut self, mut object_type: ObjectType) -> TypeId {
        let id = TypeId(self.next_type_id);
        self.next_type_id += 1;
        object_type.type_id = id;
        self.object_types.insert(id, Box::new(object_type));
        id
    }

    pub fn object_type(&self, id: TypeId) -> Option<&ObjectType> {
        self.object_types.get(&id).map(|t| t.as_ref())
    }

    /// Raw pointer to an object type, as embedded into bytecode arguments.
    pub fn object_type_address(&self, id: TypeId) -> *const ObjectType {
        match self.object_types.get(&id) {
            Some(t) => t.as_ref() as *const ObjectType,
            None => crate::internal_error!("unknown object type id {}", id.0),
        }
    }

    /// Installs the virtual function table of a class: each slot resolves
    /// to the concrete override the runtime lookup should dispatch to.
    pub fn set_virtual_table(&mut self, type_id: TypeId, slots: &[FunctionId]) {
        let table: Vec<*const ScriptFunction> = slots
            .iter()
            .map(|&id| self.functions[id.0 as usize].as_ref() as *const ScriptFunction)
            .collect();
        if let Some(object_type) = self.object_types.get_mut(&type_id) {
            object_type.vtable = table;
        } else {
            crate::internal_error!("set_virtual_table on unknown type id {}", type_id.0);
        }
    }

    /// Records the methods of a class, used by devirtualization to find
    /// the concrete counterpart of a virtual stub.
    pub fn set_method_list(&mut self, type_id: TypeId, methods: &[FunctionId]) {
        if let Some(object_type) = self.object_types.get_mut(&type_id) {
            object_type.methods = methods.to_vec();
        } else {
            crate::internal_error!("set_method_list on unknown type id {}", type_id.0);
        }
    }

    pub fn set_message_callback(&self, callback: impl FnMut(MessageType, &str) + 'static) {
        *self.message_callback.borrow_mut() = Some(Box::new(callback));
    }

    /// Delivers a diagnostic to the registered callback, or the log if
    /// none is installed.
    pub fn write_message(&self, kind: MessageType, text: &str) {
        let mut slot = self.message_callback.borrow_mut();
        match slot.as_mut() {
            Some(callback) => callback(kind, text),
            None => match kind {
                MessageType::Info => log::info!("{text}"),
                MessageType::Warning => log::warn!("{text}"),
                MessageType::Error => log::error!("{text}"),
            },
        }
    }
}
