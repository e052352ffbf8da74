//! Script function snapshots, the immutable input of the translator.

use std::cell::{Cell, RefCell};

use rustc_hash::FxHashMap;

use crate::engine::types::{DataType, TypeId};

/// Engine-assigned function identifier; index into the engine's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

/// What kind of callable the engine registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Plain script function with a bytecode body.
    Script,
    /// Virtual method stub; resolved through the class vtable.
    Virtual,
    /// Delegate bound to an object instance.
    Delegate,
    /// Native function registered by the host application.
    System,
}

/// Calling convention of a native (system) function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeCallConv {
    Cdecl,
    Thiscall,
    VirtualThiscall,
    CdeclObjFirst,
    CdeclObjLast,
}

/// How the engine stored a native function: its address, convention, and
/// whether the host ABI returns the value through memory.
#[derive(Debug, Clone, Copy)]
pub struct NativeInterface {
    /// Entry address for direct conventions; for `VirtualThiscall` the
    /// member-pointer value probed by `system_vtable_lookup`.
    pub address: usize,
    pub call_conv: NativeCallConv,
    pub host_return_in_memory: bool,
}

/// A declared parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub data_type: DataType,
}

/// One row of the debug line table: bytecode offset → source position.
#[derive(Debug, Clone, Copy)]
pub struct LineEntry {
    pub offset: usize,
    pub line: u32,
    pub column: u32,
    pub section: u32,
}

/// Bytecode blob: 32-bit words with interior mutability so `JitEntry` can
/// patch its pointer argument in place.
pub struct Bytecode {
    words: Box<[Cell<u32>]>,
}

impl Bytecode {
    pub fn new(words: Vec<u32>) -> Self {
        Bytecode {
            words: words.into_iter().map(Cell::new).collect::<Vec<_>>().into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[Cell<u32>] {
        &self.words
    }

    /// Stable address of the instruction word at `offset`. The engine owns
    /// the function (and thus this blob) for the process lifetime, so the
    /// thunk may embed this address.
    pub fn word_address(&self, offset: usize) -> *const u32 {
        self.words[offset].as_ptr()
    }
}

/// Immutable snapshot of a function handed over by the engine.
///
/// The JIT never mutates it, apart from the in-place `JitEntry` argument
/// patch and the user-data table the engine exposes for exactly that
/// purpose.
pub struct ScriptFunction {
    pub id: FunctionId,
    pub name: String,
    /// Owning script module; `None` groups the function into the shared
    /// module.
    pub module: Option<String>,
    pub kind: FunctionKind,
    pub return_type: DataType,
    pub params: Vec<Param>,
    /// Set for methods: the class this function belongs to.
    pub object_type: Option<TypeId>,
    pub returns_on_stack: bool,
    pub is_final: bool,
    pub is_read_only: bool,
    pub bytecode: Option<Bytecode>,
    /// Dwords reserved for local variables at the base of the stack frame.
    pub variable_space: u32,
    /// Maximum stack depth in dwords, locals included.
    pub stack_needed: u32,
    pub line_table: Vec<LineEntry>,
    /// Index into the owning class vtable for virtual stubs, −1 otherwise.
    pub vf_table_idx: i32,
    pub native: Option<NativeInterface>,
    user_data: RefCell<FxHashMap<u64, usize>>,
}

impl ScriptFunction {
    /// A script function with a bytecode body.
    pub fn script(
        name: impl Into<String>,
        module: Option<&str>,
        return_type: DataType,
        params: Vec<Param>,
        bytecode: Vec<u32>,
        variable_space: u32,
        stack_needed: u32,
    ) -> Self {
        ScriptFunction {
            id: FunctionId(0),
            name: name.into(),
            module: module.map(str::to_owned),
            kind: FunctionKind::Script,
            return_type,
            params,
            object_type: None,
            returns_on_stack: false,
            is_final: false,
            is_read_only: false,
            bytecode: Some(Bytecode::new(bytecode)),
            variable_space,
            stack_needed,
            line_table: Vec::new(),
            vf_table_idx: -1,
            native: None,
            user_data: RefCell::new(FxHashMap::default()),
        }
    }

    /// A native function registered by the host application.
    pub fn system(
        name: impl Into<String>,
        return_type: DataType,
        params: Vec<Param>,
        native: NativeInterface,
    ) -> Self {
        ScriptFunction {
            id: FunctionId(0),
            name: name.into(),
            module: None,
            kind: FunctionKind::System,
            return_type,
            params,
            object_type: None,
            returns_on_stack: false,
            is_final: false,
            is_read_only: false,
            bytecode: None,
            variable_space: 0,
            stack_needed: 0,
            line_table: Vec::new(),
            vf_table_idx: -1,
            native: Some(native),
            user_data: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn is_method(&self) -> bool {
        self.object_type.is_some()
    }

    /// Dwords the caller pushes for the declared parameters (plus the
    /// hidden return pointer for functions returning on the stack).
    pub fn space_needed_for_arguments(&self) -> i64 {
        let params: i64 = self.params.iter().map(|p| p.data_type.size_on_stack_dwords()).sum();
        if self.returns_on_stack {
            params + crate::common::PTR_DWORDS
        } else {
            params
        }
    }

    /// Source line for a bytecode offset: the closest table entry at or
    /// before it.
    pub fn line_for_offset(&self, offset: usize) -> Option<&LineEntry> {
        self.line_table.iter().take_while(|e| e.offset <= offset).last()
    }

    pub fn set_user_data(&self, key: u64, value: usize) {
        self.user_data.borrow_mut().insert(key, value);
    }

    pub fn user_data(&self, key: u64) -> Option<usize> {
        self.user_data.borrow().get(&key).copied()
    }
}
