//! Compile-time model of one function's VM stack.
//!
//! The VM stack is a single arena of 32-bit cells plus an abstract stack
//! pointer that exists only while IR is being emitted. Stack offsets from
//! the bytecode resolve to static addresses inside an explicit stack slot;
//! offsets at or below zero address the parameter slots instead.

use std::collections::BTreeMap;

use cranelift_codegen::ir::{self, InstBuilder, StackSlot, StackSlotData, StackSlotKind};
use cranelift_frontend::FunctionBuilder;

use crate::common::PTR_DWORDS;
use crate::engine::{DataType, ScriptFunction};

/// Dwords the VM reserves on top of `stack_needed` for exception handling.
const RESERVED_DWORDS: i64 = 2 * PTR_DWORDS;

/// A parameter of the translated function, pinned to its own slot so its
/// address can be taken and its value overwritten like any VM variable.
pub struct Parameter {
    pub argument_index: usize,
    pub slot: StackSlot,
    pub data_type: DataType,
    pub name: String,
}

/// Stack offsets as the bytecode sees them:
/// - `offset <= 0`: parameters;
/// - `0 < offset <= variable_space`: local variables;
/// - `variable_space < offset <= total_space`: the temporary stack.
pub type StackOffset = i64;

pub struct StackFrame {
    ptr_type: ir::Type,
    variable_space: i64,
    stack_space: i64,
    storage: Option<StackSlot>,
    parameters: BTreeMap<StackOffset, Parameter>,
    stack_pointer: StackOffset,
}

impl StackFrame {
    pub fn new(function: &ScriptFunction, ptr_type: ir::Type) -> Self {
        let variable_space = function.variable_space as i64;
        let stack_space = function.stack_needed as i64 - variable_space + RESERVED_DWORDS;
        StackFrame {
            ptr_type,
            variable_space,
            stack_space,
            storage: None,
            parameters: BTreeMap::new(),
            stack_pointer: variable_space,
        }
    }

    /// Allocates the storage arena and the parameter slots, and spills the
    /// incoming arguments. `args` are the entry block parameters.
    pub fn setup(
        &mut self,
        builder: &mut FunctionBuilder,
        function: &ScriptFunction,
        args: &[ir::Value],
    ) {
        let bytes = (self.total_space() * 4) as u32;
        self.storage = Some(builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            bytes,
            3,
        )));

        let mut stack_offset: StackOffset = 0;
        let mut argument_index = 0usize;

        let mut allocate_parameter =
            |frame: &mut Self, builder: &mut FunctionBuilder, data_type: DataType, name: &str| {
                let slot = builder.create_sized_stack_slot(StackSlotData::new(
                    StackSlotKind::ExplicitSlot,
                    8,
                    3,
                ));
                builder.ins().stack_store(args[argument_index], slot, 0);
                let previous = frame.parameters.insert(
                    stack_offset,
                    Parameter { argument_index, slot, data_type, name: name.to_owned() },
                );
                crate::internal_assert!(previous.is_none(), "duplicate parameter offset");
                stack_offset -= data_type.size_on_stack_dwords();
                argument_index += 1;
            };

        if function.returns_on_stack && !function.return_type.is_void() {
            allocate_parameter(self, builder, function.return_type, "stackRetPtr");
        }
        if let Some(type_id) = function.object_type {
            allocate_parameter(self, builder, DataType::handle(type_id), "thisPtr");
        }
        for param in &function.params {
            allocate_parameter(self, builder, param.data_type, &param.name);
        }

        self.stack_pointer = self.variable_space;
    }

    pub fn finalize(&self) {
        crate::internal_assert!(
            self.empty_stack(),
            "stack pointer {} != variable space {} at end of function",
            self.stack_pointer,
            self.variable_space
        );
    }

    pub fn variable_space(&self) -> i64 {
        self.variable_space
    }

    pub fn stack_space(&self) -> i64 {
        self.stack_space
    }

    pub fn total_space(&self) -> i64 {
        self.variable_space + self.stack_space
    }

    pub fn current_stack_pointer(&self) -> StackOffset {
        self.stack_pointer
    }

    pub fn empty_stack(&self) -> bool {
        self.stack_pointer == self.variable_space
    }

    /// Factory calls pop into the parameter region; callers that emit them
    /// use this to bring the stack pointer back into bounds.
    pub fn clamp_to_variable_space(&mut self) {
        self.stack_pointer = self.stack_pointer.max(self.variable_space);
    }

    pub fn check_bounds(&self) {
        crate::internal_assert!(
            self.stack_pointer >= self.variable_space,
            "stack pointer {} below variable space {}",
            self.stack_pointer,
            self.variable_space
        );
        crate::internal_assert!(
            self.stack_pointer <= self.total_space(),
            "stack pointer {} above total space {}",
            self.stack_pointer,
            self.total_space()
        );
    }

    pub fn push(&mut self, builder: &mut FunctionBuilder, value: ir::Value, dwords: i64) {
        self.stack_pointer += dwords;
        self.store(builder, self.stack_pointer, value);
    }

    pub fn pop(&mut self, dwords: i64) {
        self.stack_pointer -= dwords;
    }

    pub fn pop_value(
        &mut self,
        builder: &mut FunctionBuilder,
        dwords: i64,
        ty: ir::Type,
    ) -> ir::Value {
        let value = self.load(builder, self.stack_pointer, ty);
        self.pop(dwords);
        value
    }

    pub fn top(&self, builder: &mut FunctionBuilder, ty: ir::Type) -> ir::Value {
        self.load(builder, self.stack_pointer, ty)
    }

    pub fn load(&self, builder: &mut FunctionBuilder, offset: StackOffset, ty: ir::Type) -> ir::Value {
        let (slot, byte_offset) = self.location(offset);
        builder.ins().stack_load(ty, slot, byte_offset)
    }

    pub fn store(&self, builder: &mut FunctionBuilder, offset: StackOffset, value: ir::Value) {
        let (slot, byte_offset) = self.location(offset);
        builder.ins().stack_store(value, slot, byte_offset);
    }

    /// Physical address of a stack cell.
    pub fn pointer_to(&self, builder: &mut FunctionBuilder, offset: StackOffset) -> ir::Value {
        let (slot, byte_offset) = self.location(offset);
        builder.ins().stack_addr(self.ptr_type, slot, byte_offset)
    }

    /// Address of cell zero of the storage arena, for opcodes that index
    /// the frame with a runtime value.
    pub fn storage_base(&self, builder: &mut FunctionBuilder) -> ir::Value {
        let storage = self.storage_slot();
        builder.ins().stack_addr(self.ptr_type, storage, 0)
    }

    pub fn parameter(&self, offset: StackOffset) -> Option<&Parameter> {
        self.parameters.get(&offset)
    }

    fn storage_slot(&self) -> StackSlot {
        match self.storage {
            Some(slot) => slot,
            None => crate::internal_error!("stack frame used before setup"),
        }
    }

    fn location(&self, offset: StackOffset) -> (StackSlot, i32) {
        if offset <= 0 {
            match self.parameters.get(&offset) {
                Some(parameter) => return (parameter.slot, 0),
                None => crate::internal_error!("no parameter at stack offset {offset}"),
            }
        }

        let real_offset = self.total_space() - offset;
        crate::internal_assert!(
            real_offset >= 0 && real_offset <= self.total_space(),
            "stack offset {offset} outside storage"
        );
        (self.storage_slot(), (real_offset * 4) as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DataType, Param, TypeId};
    use cranelift_codegen::ir::{types, AbiParam, Function, Signature, UserFuncName};
    use cranelift_codegen::isa::CallConv;
    use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};

    fn with_builder(params: &[ir::Type], body: impl FnOnce(&mut FunctionBuilder, Vec<ir::Value>)) {
        let mut sig = Signature::new(CallConv::SystemV);
        for &ty in params {
            sig.params.push(AbiParam::new(ty));
        }
        let mut func = Function::with_name_signature(UserFuncName::default(), sig);
        let mut ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut func, &mut ctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let args = builder.block_params(entry).to_vec();
        body(&mut builder, args);
        builder.ins().return_(&[]);
        builder.seal_all_blocks();
        builder.finalize();
    }

    fn sample_function() -> ScriptFunction {
        ScriptFunction::script(
            "sample",
            None,
            DataType::void(),
            vec![
                Param { name: "a".into(), data_type: DataType::value(TypeId::INT32) },
                Param { name: "b".into(), data_type: DataType::value(TypeId::DOUBLE) },
            ],
            vec![],
            3,
            6,
        )
    }

    #[test]
    fn space_accounting_includes_reserve() {
        let function = sample_function();
        let frame = StackFrame::new(&function, types::I64);
        assert_eq!(frame.variable_space(), 3);
        assert_eq!(frame.stack_space(), 6 - 3 + RESERVED_DWORDS);
        assert_eq!(frame.total_space(), 3 + 3 + RESERVED_DWORDS);
    }

    #[test]
    fn push_pop_moves_the_abstract_pointer() {
        let function = sample_function();
        with_builder(&[types::I32, types::F64], |builder, args| {
            let mut frame = StackFrame::new(&function, types::I64);
            frame.setup(builder, &function, &args);
            assert!(frame.empty_stack());

            let value = builder.ins().iconst(types::I32, 7);
            frame.push(builder, value, 1);
            assert_eq!(frame.current_stack_pointer(), frame.variable_space() + 1);
            frame.check_bounds();

            let back = frame.pop_value(builder, 1, types::I32);
            assert!(frame.empty_stack());
            let _ = back;
            frame.finalize();
        });
    }

    #[test]
    fn parameters_sit_at_descending_offsets() {
        let function = sample_function();
        with_builder(&[types::I32, types::F64], |builder, args| {
            let mut frame = StackFrame::new(&function, types::I64);
            frame.setup(builder, &function, &args);
            let a = frame.parameter(0).expect("first parameter at offset 0");
            assert_eq!(a.name, "a");
            assert_eq!(a.argument_index, 0);
            let b = frame.parameter(-1).expect("second parameter below it");
            assert_eq!(b.name, "b");
            assert_eq!(b.argument_index, 1);
        });
    }

    #[test]
    fn clamp_recovers_from_factory_pops() {
        let function = sample_function();
        let mut frame = StackFrame::new(&function, types::I64);
        frame.pop(2);
        assert!(frame.current_stack_pointer() < frame.variable_space());
        frame.clamp_to_variable_space();
        assert!(frame.empty_stack());
    }
}
