//! Per-module debug type cache and source location mapping.
//!
//! Cranelift's JIT path has no DWARF builder, so debug types are kept as
//! plain records: enough for diagnostics and for an engine-side debugger to
//! reconstruct member layouts. Source positions flow into the IR through
//! `FunctionBuilder::set_srcloc`.

use cranelift_codegen::ir;
use rustc_hash::FxHashMap;

use crate::engine::{ScriptEngine, ScriptFunction, TypeFlags, TypeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugEncoding {
    Void,
    Boolean,
    Signed,
    Unsigned,
    Float,
    Address,
}

/// One member of a composite debug type.
#[derive(Debug, Clone)]
pub struct DebugMember {
    pub name: String,
    pub type_id: TypeId,
    pub bit_size: u32,
    pub bit_offset: u32,
}

/// Cached debug description of a script type.
#[derive(Debug, Clone)]
pub enum DebugType {
    Basic { name: String, bit_size: u32, encoding: DebugEncoding },
    /// Script class; surfaced to debuggers as a pointer to the class.
    Class { name: String, byte_size: u32, members: Vec<DebugMember> },
}

/// Script type-id → debug type, built lazily during pass 2 and shared by
/// all functions of one module.
#[derive(Default)]
pub struct DebugTypeCache {
    types: FxHashMap<TypeId, DebugType>,
}

impl DebugTypeCache {
    pub fn get_or_create(&mut self, engine: &ScriptEngine, type_id: TypeId) -> &DebugType {
        if !self.types.contains_key(&type_id) {
            let debug_type = Self::create(self, engine, type_id);
            self.types.insert(type_id, debug_type);
        }
        &self.types[&type_id]
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn create(&mut self, engine: &ScriptEngine, type_id: TypeId) -> DebugType {
        let basic = |name: &str, bit_size: u32, encoding| DebugType::Basic {
            name: name.to_owned(),
            bit_size,
            encoding,
        };

        match type_id {
            TypeId::VOID => return basic("void", 0, DebugEncoding::Void),
            TypeId::BOOL => return basic("bool", 1, DebugEncoding::Boolean),
            TypeId::INT8 => return basic("int8", 8, DebugEncoding::Signed),
            TypeId::INT16 => return basic("int16", 16, DebugEncoding::Signed),
            TypeId::INT32 => return basic("int", 32, DebugEncoding::Signed),
            TypeId::INT64 => return basic("int64", 64, DebugEncoding::Signed),
            TypeId::UINT8 => return basic("uint8", 8, DebugEncoding::Unsigned),
            TypeId::UINT16 => return basic("uint16", 16, DebugEncoding::Unsigned),
            TypeId::UINT32 => return basic("uint", 32, DebugEncoding::Unsigned),
            TypeId::UINT64 => return basic("uint64", 64, DebugEncoding::Unsigned),
            TypeId::FLOAT => return basic("float", 32, DebugEncoding::Float),
            TypeId::DOUBLE => return basic("double", 64, DebugEncoding::Float),
            _ => {}
        }

        let Some(object_type) = engine.object_type(type_id) else {
            crate::internal_error!("debug type requested for unknown type id {}", type_id.0);
        };

        if object_type.flags.contains(TypeFlags::SCRIPT_OBJECT) {
            let members = object_type
                .properties
                .iter()
                .map(|property| DebugMember {
                    name: property.name.clone(),
                    type_id: property.data_type.type_id,
                    bit_size: if property.data_type.is_primitive() {
                        property.data_type.primitive_size_bytes() * 8
                    } else {
                        64
                    },
                    bit_offset: property.byte_offset * 8,
                })
                .collect();
            DebugType::Class {
                name: object_type.name.clone(),
                byte_size: object_type.size,
                members,
            }
        } else {
            basic(&object_type.name, 64, DebugEncoding::Address)
        }
    }
}

/// Source location of a bytecode offset, for `set_srcloc`.
pub fn source_location(function: &ScriptFunction, offset: usize) -> ir::SourceLoc {
    match function.line_for_offset(offset) {
        Some(entry) => ir::SourceLoc::new(entry.line),
        None => ir::SourceLoc::default(),
    }
}
