//! Script type system as surfaced to the JIT.

use bitflags::bitflags;

use crate::engine::function::FunctionId;
use crate::engine::ScriptFunction;

/// Engine-assigned type identifier.
///
/// Identifiers below [`TypeId::FIRST_USER`] are the primitive types; object
/// types registered with the engine get identifiers above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub i32);

impl TypeId {
    pub const VOID: TypeId = TypeId(0);
    pub const BOOL: TypeId = TypeId(1);
    pub const INT8: TypeId = TypeId(2);
    pub const INT16: TypeId = TypeId(3);
    pub const INT32: TypeId = TypeId(4);
    pub const INT64: TypeId = TypeId(5);
    pub const UINT8: TypeId = TypeId(6);
    pub const UINT16: TypeId = TypeId(7);
    pub const UINT32: TypeId = TypeId(8);
    pub const UINT64: TypeId = TypeId(9);
    pub const FLOAT: TypeId = TypeId(10);
    pub const DOUBLE: TypeId = TypeId(11);

    pub const FIRST_USER: TypeId = TypeId(256);

    pub fn is_primitive(self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

/// A script data type: a type id plus reference/handle modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataType {
    pub type_id: TypeId,
    pub is_reference: bool,
    pub is_object_handle: bool,
}

impl DataType {
    pub fn value(type_id: TypeId) -> Self {
        DataType { type_id, is_reference: false, is_object_handle: false }
    }

    pub fn reference(type_id: TypeId) -> Self {
        DataType { type_id, is_reference: true, is_object_handle: false }
    }

    pub fn handle(type_id: TypeId) -> Self {
        DataType { type_id, is_reference: false, is_object_handle: true }
    }

    pub fn void() -> Self {
        Self::value(TypeId::VOID)
    }

    pub fn is_void(&self) -> bool {
        self.type_id == TypeId::VOID && !self.is_reference && !self.is_object_handle
    }

    pub fn is_primitive(&self) -> bool {
        self.type_id.is_primitive() && !self.is_object_handle
    }

    pub fn is_object(&self) -> bool {
        !self.type_id.is_primitive()
    }

    /// Number of dwords this type occupies on the VM stack.
    pub fn size_on_stack_dwords(&self) -> i64 {
        if self.is_void() {
            return 0;
        }
        if self.is_reference || self.is_object_handle || self.is_object() {
            return crate::common::PTR_DWORDS;
        }
        match self.type_id {
            TypeId::INT64 | TypeId::UINT64 | TypeId::DOUBLE => 2,
            _ => 1,
        }
    }

    /// In-memory byte size of a primitive type.
    pub fn primitive_size_bytes(&self) -> u32 {
        match self.type_id {
            TypeId::BOOL | TypeId::INT8 | TypeId::UINT8 => 1,
            TypeId::INT16 | TypeId::UINT16 => 2,
            TypeId::INT32 | TypeId::UINT32 | TypeId::FLOAT => 4,
            TypeId::INT64 | TypeId::UINT64 | TypeId::DOUBLE => 8,
            _ => crate::internal_error!("primitive_size_bytes on non-primitive {:?}", self.type_id),
        }
    }
}

bitflags! {
    /// Behavior flags of an object type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        /// Class defined in script; instances carry a script object header.
        const SCRIPT_OBJECT = 1 << 0;
        /// Reference type with engine-managed lifetime.
        const REF = 1 << 1;
        /// Value type.
        const VALUE = 1 << 2;
        /// Reference type without reference counting.
        const NOCOUNT = 1 << 3;
        /// Class that cannot be inherited from.
        const NOINHERIT = 1 << 4;
        /// List pattern type used by initialization lists.
        const LIST_PATTERN = 1 << 5;
    }
}

/// Lifetime behaviours of an object type, as engine function ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct Behaviours {
    pub construct: Option<FunctionId>,
    pub destruct: Option<FunctionId>,
    pub addref: Option<FunctionId>,
    pub release: Option<FunctionId>,
}

/// A member of a script class, kept for the debug type cache.
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub data_type: DataType,
    pub byte_offset: u32,
}

/// An object type registered with the engine.
pub struct ObjectType {
    pub type_id: TypeId,
    pub name: String,
    /// Size of one instance in bytes, header included for script objects.
    pub size: u32,
    pub flags: TypeFlags,
    pub beh: Behaviours,
    /// Virtual function table; entries point at the concrete overrides.
    /// Installed via [`crate::engine::ScriptEngine::set_virtual_table`].
    pub vtable: Vec<*const ScriptFunction>,
    /// All methods of the class, for devirtualization lookup.
    pub methods: Vec<FunctionId>,
    pub properties: Vec<Property>,
}

impl ObjectType {
    pub fn new(name: impl Into<String>, size: u32, flags: TypeFlags) -> Self {
        ObjectType {
            type_id: TypeId(0),
            name: name.into(),
            size,
            flags,
            beh: Behaviours::default(),
            vtable: Vec::new(),
            methods: Vec::new(),
            properties: Vec::new(),
        }
    }
}
