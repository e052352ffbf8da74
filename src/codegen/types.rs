//! Script type → backend IR type mapping.

use std::cell::RefCell;

use cranelift_codegen::ir::{self, types};
use rustc_hash::FxHashMap;

use crate::engine::{DataType, ScriptEngine, TypeId};

/// Cached layout of a composite script type.
#[derive(Debug, Clone)]
pub struct ObjectLayout {
    pub name: String,
    pub size_in_memory: u32,
}

/// Maps script data types to Cranelift value types.
///
/// Primitives map to the matching scalar; references to primitives and any
/// object form (value, handle, reference) are surfaced as the target's
/// pointer type. Composite layouts are cached by script type-id for the
/// debug type cache and object allocation.
pub struct TypeMapper {
    ptr_type: ir::Type,
    object_layouts: RefCell<FxHashMap<TypeId, ObjectLayout>>,
}

impl TypeMapper {
    pub fn new(ptr_type: ir::Type) -> Self {
        TypeMapper { ptr_type, object_layouts: RefCell::new(FxHashMap::default()) }
    }

    pub fn pointer_type(&self) -> ir::Type {
        self.ptr_type
    }

    /// IR type of a value of `data_type`. `None` means void (no value).
    pub fn map(&self, engine: &ScriptEngine, data_type: &DataType) -> Option<ir::Type> {
        if data_type.is_object() {
            self.cache_object_layout(engine, data_type.type_id);
            return Some(self.ptr_type);
        }

        let base = match data_type.type_id {
            TypeId::VOID => None,
            TypeId::BOOL | TypeId::INT8 | TypeId::UINT8 => Some(types::I8),
            TypeId::INT16 | TypeId::UINT16 => Some(types::I16),
            TypeId::INT32 | TypeId::UINT32 => Some(types::I32),
            TypeId::INT64 | TypeId::UINT64 => Some(types::I64),
            TypeId::FLOAT => Some(types::F32),
            TypeId::DOUBLE => Some(types::F64),
            other => crate::internal_error!("unregistered primitive type id {}", other.0),
        };

        if data_type.is_reference {
            return Some(self.ptr_type);
        }
        base
    }

    pub fn object_layout(&self, engine: &ScriptEngine, type_id: TypeId) -> ObjectLayout {
        self.cache_object_layout(engine, type_id);
        self.object_layouts.borrow()[&type_id].clone()
    }

    fn cache_object_layout(&self, engine: &ScriptEngine, type_id: TypeId) {
        let mut layouts = self.object_layouts.borrow_mut();
        if layouts.contains_key(&type_id) {
            return;
        }
        let Some(object_type) = engine.object_type(type_id) else {
            crate::internal_error!("unregistered object type id {}", type_id.0);
        };
        layouts.insert(
            type_id,
            ObjectLayout { name: object_type.name.clone(), size_in_memory: object_type.size },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ObjectType, TypeFlags};

    #[test]
    fn primitives_map_to_scalars() {
        let engine = ScriptEngine::new();
        let mapper = TypeMapper::new(types::I64);
        assert_eq!(mapper.map(&engine, &DataType::void()), None);
        assert_eq!(mapper.map(&engine, &DataType::value(TypeId::BOOL)), Some(types::I8));
        assert_eq!(mapper.map(&engine, &DataType::value(TypeId::INT32)), Some(types::I32));
        assert_eq!(mapper.map(&engine, &DataType::value(TypeId::UINT64)), Some(types::I64));
        assert_eq!(mapper.map(&engine, &DataType::value(TypeId::FLOAT)), Some(types::F32));
        assert_eq!(mapper.map(&engine, &DataType::value(TypeId::DOUBLE)), Some(types::F64));
    }

    #[test]
    fn references_and_objects_map_to_pointers() {
        let mut engine = ScriptEngine::new();
        let id = engine.register_object_type(ObjectType::new("Vec3", 12, TypeFlags::VALUE));
        let mapper = TypeMapper::new(types::I64);
        assert_eq!(mapper.map(&engine, &DataType::reference(TypeId::INT32)), Some(types::I64));
        assert_eq!(mapper.map(&engine, &DataType::value(id)), Some(types::I64));
        assert_eq!(mapper.map(&engine, &DataType::handle(id)), Some(types::I64));

        let layout = mapper.object_layout(&engine, id);
        assert_eq!(layout.name, "Vec3");
        assert_eq!(layout.size_in_memory, 12);
    }
}
