//! Two-pass translation of one script function into Cranelift IR.
//!
//! Pass 1 walks the bytecode to discover branch targets and jump tables.
//! Pass 2 emits IR for every opcode, tracking the abstract stack pointer
//! and the value/object registers, and asserts each opcode's stack delta.
//! The same type also emits the VM entry thunk that adapts the
//! interpreter's register file to the native ABI.

use cranelift_codegen::ir::{
    self, condcodes::IntCC, types, Block, InstBuilder, MemFlags, StackSlot, StackSlotData,
    StackSlotKind, Value,
};
use cranelift_frontend::{FunctionBuilder, Switch};
use cranelift_module::Module;
use rustc_hash::FxHashMap;

use crate::assembler::ModuleState;
use crate::bytecode::{BytecodeCursor, Instruction, Opcode};
use crate::codegen::calls::VmEntryContext;
use crate::codegen::debuginfo::source_location;
use crate::codegen::stack_frame::StackFrame;
use crate::common::{diagnostic, PTR_DWORDS};
use crate::config::JitConfig;
use crate::engine::{FunctionId, MessageType, ObjectType, ScriptEngine, ScriptFunction, TypeFlags};
use crate::error::JitError;

/// Pass-1 state for jump table discovery.
#[derive(Default)]
pub(crate) struct PreprocessContext {
    handling_jump_table: bool,
    current_switch_offset: usize,
}

/// How a comparison interprets its operands.
#[derive(Clone, Copy)]
enum CompareKind {
    Signed,
    Unsigned,
    Float,
}

pub struct FunctionTranslator<'a, 'b> {
    pub(crate) state: &'a mut ModuleState,
    pub(crate) engine: &'a ScriptEngine,
    pub(crate) config: &'a JitConfig,
    pub(crate) function: &'a ScriptFunction,
    pub(crate) builder: FunctionBuilder<'b>,
    pub(crate) frame: StackFrame,
    pub(crate) ptr_type: ir::Type,
    pub(crate) jump_map: FxHashMap<usize, Block>,
    pub(crate) switch_map: FxHashMap<usize, Vec<Block>>,
    value_register: Option<StackSlot>,
    object_register: Option<StackSlot>,
    ret_offset: Option<usize>,
    terminated: bool,
}

impl<'a, 'b> FunctionTranslator<'a, 'b> {
    pub fn new(
        state: &'a mut ModuleState,
        engine: &'a ScriptEngine,
        config: &'a JitConfig,
        function: &'a ScriptFunction,
        builder: FunctionBuilder<'b>,
    ) -> Self {
        let ptr_type = state.pointer_type();
        FunctionTranslator {
            frame: StackFrame::new(function, ptr_type),
            state,
            engine,
            config,
            function,
            builder,
            ptr_type,
            jump_map: FxHashMap::default(),
            switch_map: FxHashMap::default(),
            value_register: None,
            object_register: None,
            ret_offset: None,
            terminated: false,
        }
    }

    /// Translates the function body. Returns the bytecode offset of the
    /// `RET` instruction for the VM entry thunk.
    pub fn translate_body(mut self) -> Result<Option<usize>, JitError> {
        let function = self.function;
        let Some(bytecode) = function.bytecode.as_ref() else {
            return Err(JitError::NullBytecode);
        };

        if self.config.verbose {
            log::debug!(
                "function {}: variable_space {}, stack_needed {}",
                function.name,
                function.variable_space,
                function.stack_needed
            );
            for ins in BytecodeCursor::new(bytecode) {
                let text = crate::bytecode::disasm::disassemble(self.engine, &ins);
                if !text.is_empty() {
                    log::debug!("{:04x}: {}", ins.offset, text);
                }
            }
        }

        let entry = self.builder.create_block();
        self.builder.append_block_params_for_function_params(entry);
        self.builder.switch_to_block(entry);

        let mut preprocess = PreprocessContext::default();
        for ins in BytecodeCursor::new(bytecode) {
            self.preprocess_instruction(&ins, &mut preprocess);
        }

        self.register_debug_types();
        self.emit_allocate_local_structures(entry);

        for ins in BytecodeCursor::new(bytecode) {
            self.translate_instruction(&ins)?;
        }

        self.frame.finalize();
        if !self.terminated {
            self.builder.ins().trap(ir::TrapCode::user(1).unwrap());
        }
        self.builder.seal_all_blocks();

        let ret_offset = self.ret_offset;
        self.builder.finalize();
        Ok(ret_offset)
    }

    /// Emits the VM entry thunk: unpacks the interpreter frame, calls the
    /// native implementation, stores the result into the VM registers and
    /// points the program pointer at the recorded `RET`.
    pub fn translate_vm_entry_thunk(mut self, ret_offset: Option<usize>) -> Result<(), JitError> {
        let ptr = self.ptr_type;

        let entry = self.builder.create_block();
        self.builder.append_block_params_for_function_params(entry);
        self.builder.switch_to_block(entry);

        let params = self.builder.block_params(entry).to_vec();
        let regs = params[0];

        let frame_pointer = self.builder.ins().load(ptr, MemFlags::trusted(), regs, 8);
        let value_register = self.builder.ins().iadd_imm(regs, 24);
        let object_register = self.builder.ins().iadd_imm(regs, 32);

        let context = VmEntryContext { frame_pointer, value_register, object_register };
        self.emit_script_call(self.function, Some(&context))?;

        let ret_address = match (self.function.bytecode.as_ref(), ret_offset) {
            (Some(bytecode), Some(offset)) => bytecode.word_address(offset) as i64,
            _ => 0,
        };
        let ret_pointer = self.builder.ins().iconst(ptr, ret_address);
        self.builder.ins().store(MemFlags::trusted(), ret_pointer, regs, 0);

        self.builder.ins().return_(&[]);
        self.builder.seal_all_blocks();
        self.builder.finalize();
        Ok(())
    }

    // ===== Pass 1 =====

    pub(crate) fn preprocess_instruction(
        &mut self,
        ins: &Instruction,
        ctx: &mut PreprocessContext,
    ) {
        match ins.opcode {
            Opcode::JmpP => {
                ctx.current_switch_offset = ins.offset;
                ctx.handling_jump_table = true;
            }

            Opcode::Jmp => {
                self.preprocess_unconditional_branch(ins);

                if ctx.handling_jump_table {
                    self.insert_label(ins.offset);
                    let case_block = self.jump_map[&ins.offset];
                    self.switch_map
                        .entry(ctx.current_switch_offset)
                        .or_default()
                        .push(case_block);
                }
            }

            Opcode::Jz
            | Opcode::Jnz
            | Opcode::Js
            | Opcode::Jns
            | Opcode::Jp
            | Opcode::Jnp
            | Opcode::JLowZ
            | Opcode::JLowNZ => {
                ctx.handling_jump_table = false;
                self.preprocess_conditional_branch(ins);
            }

            _ => {
                ctx.handling_jump_table = false;
            }
        }
    }

    fn preprocess_unconditional_branch(&mut self, ins: &Instruction) {
        self.insert_label(branch_target_offset(ins));
    }

    fn preprocess_conditional_branch(&mut self, ins: &Instruction) {
        self.insert_label(ins.offset + 2);
        self.preprocess_unconditional_branch(ins);
    }

    fn insert_label(&mut self, offset: usize) {
        if self.jump_map.contains_key(&offset) {
            return;
        }
        let block = self.builder.create_block();
        self.jump_map.insert(offset, block);
    }

    // ===== Pass 2 =====

    /// Records the debug types of the signature in the module cache.
    fn register_debug_types(&mut self) {
        let engine = self.engine;
        let function = self.function;
        self.state.debug_types.get_or_create(engine, function.return_type.type_id);
        if let Some(object_type) = function.object_type {
            self.state.debug_types.get_or_create(engine, object_type);
        }
        for param in &function.params {
            self.state.debug_types.get_or_create(engine, param.data_type.type_id);
        }
    }

    fn emit_allocate_local_structures(&mut self, entry: Block) {
        let value_register = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            8,
            3,
        ));
        let object_register = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            8,
            3,
        ));
        self.value_register = Some(value_register);
        self.object_register = Some(object_register);

        let args = self.builder.block_params(entry).to_vec();
        self.frame.setup(&mut self.builder, self.function, &args);
    }

    fn translate_instruction(&mut self, ins: &Instruction) -> Result<(), JitError> {
        self.builder.set_srcloc(source_location(self.function, ins.offset));

        let old_stack_pointer = self.frame.current_stack_pointer();

        if let Some(&block) = self.jump_map.get(&ins.offset) {
            crate::internal_assert!(
                self.frame.empty_stack(),
                "non-empty stack entering label at {:#06x}",
                ins.offset
            );
            self.switch_to_block(block);
        }

        self.frame.check_bounds();

        let ptr = self.ptr_type;

        match ins.opcode {
            Opcode::PopPtr => {
                self.frame.pop(PTR_DWORDS);
            }

            Opcode::PshGPtr => {
                let value = self.load_global(ins.arg_pword(0), ptr);
                self.frame.push(&mut self.builder, value, PTR_DWORDS);
            }

            Opcode::PshC4 => {
                let value = self.builder.ins().iconst(types::I32, ins.arg_int(0) as i64);
                self.frame.push(&mut self.builder, value, 1);
            }

            Opcode::PshV4 => {
                let value = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::I32);
                self.frame.push(&mut self.builder, value, 1);
            }

            Opcode::Psf => {
                let pointer = self.frame.pointer_to(&mut self.builder, ins.arg_sword0() as i64);
                self.frame.push(&mut self.builder, pointer, PTR_DWORDS);
            }

            Opcode::Not => {
                let source = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::I32);
                let is_zero = self.builder.ins().icmp_imm(IntCC::Equal, source, 0);
                let result = self.builder.ins().uextend(types::I32, is_zero);
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, result);
            }

            Opcode::PshG4 => {
                let value = self.load_global(ins.arg_pword(0), types::I32);
                self.frame.push(&mut self.builder, value, 1);
            }

            Opcode::Call | Opcode::CallIntf => {
                let engine = self.engine;
                let callee = engine.function(FunctionId(ins.arg_int(0) as u32));
                self.emit_script_call(callee, None)?;
            }

            Opcode::CallSys | Opcode::Thiscall1 => {
                let engine = self.engine;
                let callee = engine.function(FunctionId(ins.arg_int(0) as u32));
                self.emit_system_call(callee)?;
            }

            Opcode::Ret => {
                let function = self.function;
                if function.return_type.is_void() || function.returns_on_stack {
                    self.builder.ins().return_(&[]);
                } else if function.return_type.is_object() {
                    let value = self.load_object_register();
                    self.builder.ins().return_(&[value]);
                } else {
                    let ret_type = match self.state.mapper.map(self.engine, &function.return_type) {
                        Some(ty) => ty,
                        None => crate::internal_error!("void return reached value path"),
                    };
                    let value = self.load_value_register(ret_type);
                    self.builder.ins().return_(&[value]);
                }
                self.ret_offset = Some(ins.offset);
                self.terminated = true;
            }

            Opcode::Jmp => {
                let target = self.branch_target(ins);
                self.builder.ins().jump(target, &[]);
                self.terminated = true;
            }

            Opcode::Jz => self.emit_conditional_branch(ins, IntCC::Equal),
            Opcode::Jnz => self.emit_conditional_branch(ins, IntCC::NotEqual),
            Opcode::Js => self.emit_conditional_branch(ins, IntCC::SignedLessThan),
            Opcode::Jns => self.emit_conditional_branch(ins, IntCC::SignedGreaterThanOrEqual),
            Opcode::Jp => self.emit_conditional_branch(ins, IntCC::SignedGreaterThan),
            Opcode::Jnp => self.emit_conditional_branch(ins, IntCC::SignedLessThanOrEqual),

            Opcode::JLowZ => self.emit_low_conditional_branch(ins, IntCC::Equal),
            Opcode::JLowNZ => self.emit_low_conditional_branch(ins, IntCC::NotEqual),

            Opcode::Tz => self.emit_test(IntCC::Equal),
            Opcode::Tnz => self.emit_test(IntCC::NotEqual),
            Opcode::Ts => self.emit_test(IntCC::SignedLessThan),
            Opcode::Tns => self.emit_test(IntCC::SignedGreaterThanOrEqual),
            Opcode::Tp => self.emit_test(IntCC::SignedGreaterThan),
            Opcode::Tnp => self.emit_test(IntCC::SignedLessThanOrEqual),

            Opcode::NegI => self.emit_neg(ins, types::I32),
            Opcode::NegI64 => self.emit_neg(ins, types::I64),
            Opcode::NegF => self.emit_neg(ins, types::F32),
            Opcode::NegD => self.emit_neg(ins, types::F64),

            Opcode::IncI8 => self.emit_increment(types::I8, 1),
            Opcode::DecI8 => self.emit_increment(types::I8, -1),
            Opcode::IncI16 => self.emit_increment(types::I16, 1),
            Opcode::DecI16 => self.emit_increment(types::I16, -1),
            Opcode::IncI => self.emit_increment(types::I32, 1),
            Opcode::DecI => self.emit_increment(types::I32, -1),
            Opcode::IncI64 => self.emit_increment(types::I64, 1),
            Opcode::DecI64 => self.emit_increment(types::I64, -1),
            Opcode::IncF => self.emit_increment(types::F32, 1),
            Opcode::DecF => self.emit_increment(types::F32, -1),
            Opcode::IncD => self.emit_increment(types::F64, 1),
            Opcode::DecD => self.emit_increment(types::F64, -1),

            Opcode::IncVi => {
                let value = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::I32);
                let result = self.builder.ins().iadd_imm(value, 1);
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, result);
            }
            Opcode::DecVi => {
                let value = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::I32);
                let result = self.builder.ins().iadd_imm(value, -1);
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, result);
            }

            Opcode::BNot => self.emit_bit_not(ins, types::I32),
            Opcode::BNot64 => self.emit_bit_not(ins, types::I64),

            Opcode::BAnd => self.emit_binop(ins, types::I32, |b, l, r| b.ins().band(l, r)),
            Opcode::BOr => self.emit_binop(ins, types::I32, |b, l, r| b.ins().bor(l, r)),
            Opcode::BXor => self.emit_binop(ins, types::I32, |b, l, r| b.ins().bxor(l, r)),
            Opcode::BSll => self.emit_binop(ins, types::I32, |b, l, r| b.ins().ishl(l, r)),
            Opcode::BSrl => self.emit_binop(ins, types::I32, |b, l, r| b.ins().ushr(l, r)),
            Opcode::BSra => self.emit_binop(ins, types::I32, |b, l, r| b.ins().sshr(l, r)),

            Opcode::BAnd64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().band(l, r)),
            Opcode::BOr64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().bor(l, r)),
            Opcode::BXor64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().bxor(l, r)),
            Opcode::BSll64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().ishl(l, r)),
            Opcode::BSrl64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().ushr(l, r)),
            Opcode::BSra64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().sshr(l, r)),

            Opcode::PshC8 => {
                let value = self.builder.ins().iconst(types::I64, ins.arg_qword(0) as i64);
                self.frame.push(&mut self.builder, value, 2);
            }

            Opcode::PshVPtr => {
                let value = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, ptr);
                self.frame.push(&mut self.builder, value, PTR_DWORDS);
            }

            Opcode::PshV8 => {
                let value = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::I64);
                self.frame.push(&mut self.builder, value, 2);
            }

            Opcode::RdsPtr => {
                // Dereference the pointer on top of the stack in place.
                let address = self.frame.top(&mut self.builder, ptr);
                let value = self.builder.ins().load(ptr, MemFlags::trusted(), address, 0);
                self.frame.store(&mut self.builder, self.frame.current_stack_pointer(), value);
            }

            Opcode::CmpI => self.emit_compare_vars(ins, types::I32, CompareKind::Signed),
            Opcode::CmpU => self.emit_compare_vars(ins, types::I32, CompareKind::Unsigned),
            Opcode::CmpI64 => self.emit_compare_vars(ins, types::I64, CompareKind::Signed),
            Opcode::CmpU64 => self.emit_compare_vars(ins, types::I64, CompareKind::Unsigned),
            Opcode::CmpF => self.emit_compare_vars(ins, types::F32, CompareKind::Float),
            Opcode::CmpD => self.emit_compare_vars(ins, types::F64, CompareKind::Float),

            Opcode::CmpIi => {
                let lhs = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::I32);
                let rhs = self.builder.ins().iconst(types::I32, ins.arg_int(0) as i64);
                self.emit_compare(lhs, rhs, CompareKind::Signed);
            }
            Opcode::CmpIu => {
                let lhs = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::I32);
                let rhs = self.builder.ins().iconst(types::I32, ins.arg_int(0) as i64);
                self.emit_compare(lhs, rhs, CompareKind::Unsigned);
            }
            Opcode::CmpIf => {
                let lhs = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::F32);
                let rhs = self.builder.ins().f32const(ins.arg_float(0));
                self.emit_compare(lhs, rhs, CompareKind::Float);
            }

            Opcode::JmpP => {
                let targets = match self.switch_map.get(&ins.offset) {
                    Some(targets) => targets.clone(),
                    None => crate::internal_error!("no switch table at {:#06x}", ins.offset),
                };
                crate::internal_assert!(!targets.is_empty(), "empty switch table");

                let index =
                    self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::I32);
                let mut switch = Switch::new();
                for (case, &block) in targets.iter().enumerate() {
                    switch.set_entry(case as u128, block);
                }
                // The VM routes the default to the last case.
                switch.emit(&mut self.builder, index, *targets.last().unwrap());
                self.terminated = true;
            }

            Opcode::PopRPtr => {
                let value = self.frame.pop_value(&mut self.builder, PTR_DWORDS, ptr);
                self.store_value_register(value);
            }

            Opcode::PshRPtr => {
                let value = self.load_value_register(ptr);
                self.frame.push(&mut self.builder, value, PTR_DWORDS);
            }

            Opcode::Suspend => {
                diagnostic(
                    self.engine,
                    MessageType::Warning,
                    "found VM suspend, these are unsupported and ignored",
                );
            }

            Opcode::Alloc => self.emit_alloc(ins)?,
            Opcode::Free => self.emit_free(ins)?,

            Opcode::LoadObj => {
                let pointer = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, ptr);
                self.store_object_register(pointer);
                let null = self.builder.ins().iconst(ptr, 0);
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, null);
            }

            Opcode::StoreObj => {
                let pointer = self.load_object_register();
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, pointer);
                let null = self.builder.ins().iconst(ptr, 0);
                self.store_object_register(null);
            }

            Opcode::GetObj => {
                // Replace a variable index on the stack by the object
                // pointer held in that variable, then null the variable.
                let slot_offset = self.frame.current_stack_pointer() - ins.arg_word0() as i64;
                let index_pointer = self.frame.pointer_to(&mut self.builder, slot_offset);
                let index = self.builder.ins().load(ptr, MemFlags::trusted(), index_pointer, 0);

                let variable_pointer = self.frame_address_for_index(index);
                let variable =
                    self.builder.ins().load(ptr, MemFlags::trusted(), variable_pointer, 0);

                self.builder.ins().store(MemFlags::trusted(), variable, index_pointer, 0);
                let null = self.builder.ins().iconst(ptr, 0);
                self.builder.ins().store(MemFlags::trusted(), null, variable_pointer, 0);
            }

            Opcode::GetObjRef => {
                // Replace a variable index on the stack with the handle
                // stored in that variable.
                let slot_offset = self.frame.current_stack_pointer() - ins.arg_word0() as i64;
                let index_pointer = self.frame.pointer_to(&mut self.builder, slot_offset);
                let index = self.builder.ins().load(ptr, MemFlags::trusted(), index_pointer, 0);

                let variable_pointer = self.frame_address_for_index(index);
                let variable =
                    self.builder.ins().load(ptr, MemFlags::trusted(), variable_pointer, 0);
                self.builder.ins().store(MemFlags::trusted(), variable, index_pointer, 0);
            }

            Opcode::GetRef => {
                // Replace a variable index on the stack with the address
                // of the variable.
                let slot_offset = self.frame.current_stack_pointer() - ins.arg_word0() as i64;
                let index_pointer = self.frame.pointer_to(&mut self.builder, slot_offset);
                let index =
                    self.builder.ins().load(types::I32, MemFlags::trusted(), index_pointer, 0);
                let index = self.builder.ins().uextend(types::I64, index);

                let variable_pointer = self.frame_address_for_index(index);
                self.builder.ins().store(MemFlags::trusted(), variable_pointer, index_pointer, 0);
            }

            Opcode::RefCpy => self.emit_ref_copy(ins)?,
            Opcode::RefCpyV => self.emit_ref_copy_to_variable(ins)?,

            // Null checks are documented future exception-raising points.
            Opcode::ChkRef | Opcode::ChkNullV | Opcode::ChkRefS => {}

            Opcode::ObjType => {
                let value = self.builder.ins().iconst(types::I64, ins.arg_pword(0) as i64);
                self.frame.push(&mut self.builder, value, PTR_DWORDS);
            }

            Opcode::SetV1 | Opcode::SetV2 | Opcode::SetV4 => {
                let value = self.builder.ins().iconst(types::I32, ins.arg_int(0) as i64);
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, value);
            }

            Opcode::SetV8 => {
                let value = self.builder.ins().iconst(types::I64, ins.arg_qword(0) as i64);
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, value);
            }

            Opcode::AddSi => {
                let top = self.frame.current_stack_pointer();
                let value = self.frame.load(&mut self.builder, top, ptr);
                let incremented = self.builder.ins().iadd_imm(value, ins.arg_sword0() as i64);
                self.frame.store(&mut self.builder, top, incremented);
            }

            Opcode::CpyVtoV4 => {
                let value = self.frame.load(&mut self.builder, ins.arg_sword1() as i64, types::I32);
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, value);
            }
            Opcode::CpyVtoV8 => {
                let value = self.frame.load(&mut self.builder, ins.arg_sword1() as i64, types::I64);
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, value);
            }

            Opcode::CpyVtoR4 => {
                let value = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::I32);
                self.store_value_register(value);
            }
            Opcode::CpyVtoR8 => {
                let value = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::I64);
                self.store_value_register(value);
            }

            Opcode::CpyRtoV4 => {
                let value = self.load_value_register(types::I32);
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, value);
            }
            Opcode::CpyRtoV8 => {
                let value = self.load_value_register(types::I64);
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, value);
            }

            Opcode::CpyVtoG4 => {
                let address = self.builder.ins().iconst(ptr, ins.arg_pword(0) as i64);
                let value = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, types::I32);
                self.builder.ins().store(MemFlags::trusted(), value, address, 0);
            }

            Opcode::CpyGtoV4 => {
                let value = self.load_global(ins.arg_pword(0), types::I32);
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, value);
            }

            Opcode::SetG4 => {
                let address = self.builder.ins().iconst(ptr, ins.arg_pword(0) as i64);
                let value = self.builder.ins().iconst(types::I32, ins.arg_int(2) as i64);
                self.builder.ins().store(MemFlags::trusted(), value, address, 0);
            }

            Opcode::WrtV1 => self.emit_write_through_register(ins, types::I8),
            Opcode::WrtV2 => self.emit_write_through_register(ins, types::I16),
            Opcode::WrtV4 => self.emit_write_through_register(ins, types::I32),
            Opcode::WrtV8 => self.emit_write_through_register(ins, types::I64),

            Opcode::RdR1 => self.emit_read_through_register(ins, types::I8, true),
            Opcode::RdR2 => self.emit_read_through_register(ins, types::I16, true),
            Opcode::RdR4 => self.emit_read_through_register(ins, types::I32, false),
            Opcode::RdR8 => self.emit_read_through_register(ins, types::I64, false),

            Opcode::Ldg => {
                let address = self.builder.ins().iconst(ptr, ins.arg_pword(0) as i64);
                self.store_value_register(address);
            }

            Opcode::Ldv => {
                let address = self.frame.pointer_to(&mut self.builder, ins.arg_sword0() as i64);
                self.store_value_register(address);
            }

            Opcode::Pga => {
                let value = self.builder.ins().iconst(types::I64, ins.arg_pword(0) as i64);
                self.frame.push(&mut self.builder, value, PTR_DWORDS);
            }

            Opcode::Var => {
                let value = self.builder.ins().iconst(types::I64, ins.arg_sword0() as i64);
                self.frame.push(&mut self.builder, value, PTR_DWORDS);
            }

            Opcode::LoadThisR => {
                let object = self.frame.load(&mut self.builder, 0, ptr);
                let field = self.builder.ins().iadd_imm(object, ins.arg_sword0() as i64);
                self.store_value_register(field);
            }

            Opcode::LoadRObjR => {
                let base = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, ptr);
                let field = self.builder.ins().iadd_imm(base, ins.arg_sword1() as i64);
                self.store_value_register(field);
            }

            Opcode::ClrHi => {
                let low = self.load_value_register(types::I8);
                let extended = self.builder.ins().uextend(types::I32, low);
                self.store_value_register(extended);
            }

            Opcode::JitEntry => {
                if self.config.verbose {
                    diagnostic(
                        self.engine,
                        MessageType::Info,
                        "found JIT entry point, patching as valid entry point",
                    );
                }
                ins.patch_pword(0, self.state.jit_token);
            }

            // ===== Conversions =====
            Opcode::ItoF => self.emit_cast(ins, types::I32, |b, v| b.ins().fcvt_from_sint(types::F32, v)),
            Opcode::FtoI => self.emit_cast(ins, types::F32, |b, v| b.ins().fcvt_to_sint(types::I32, v)),
            Opcode::UtoF => self.emit_cast(ins, types::I32, |b, v| b.ins().fcvt_from_uint(types::F32, v)),
            Opcode::FtoU => self.emit_cast(ins, types::F32, |b, v| b.ins().fcvt_to_uint(types::I32, v)),
            Opcode::SbToI => self.emit_cast(ins, types::I8, |b, v| b.ins().sextend(types::I32, v)),
            Opcode::SwToI => self.emit_cast(ins, types::I16, |b, v| b.ins().sextend(types::I32, v)),
            Opcode::UbToI => self.emit_cast(ins, types::I8, |b, v| b.ins().uextend(types::I32, v)),
            Opcode::UwToI => self.emit_cast(ins, types::I16, |b, v| b.ins().uextend(types::I32, v)),
            Opcode::ItoB => self.emit_cast(ins, types::I32, |b, v| b.ins().ireduce(types::I8, v)),
            Opcode::ItoW => self.emit_cast(ins, types::I32, |b, v| b.ins().ireduce(types::I16, v)),
            Opcode::DtoI => self.emit_cast(ins, types::F64, |b, v| b.ins().fcvt_to_sint(types::I32, v)),
            Opcode::DtoU => self.emit_cast(ins, types::F64, |b, v| b.ins().fcvt_to_uint(types::I32, v)),
            Opcode::DtoF => self.emit_cast(ins, types::F64, |b, v| b.ins().fdemote(types::F32, v)),
            Opcode::ItoD => self.emit_cast(ins, types::I32, |b, v| b.ins().fcvt_from_sint(types::F64, v)),
            Opcode::UtoD => self.emit_cast(ins, types::I32, |b, v| b.ins().fcvt_from_uint(types::F64, v)),
            Opcode::FtoD => self.emit_cast(ins, types::F32, |b, v| b.ins().fpromote(types::F64, v)),
            Opcode::I64toI => self.emit_cast(ins, types::I64, |b, v| b.ins().ireduce(types::I32, v)),
            Opcode::UtoI64 => self.emit_cast(ins, types::I32, |b, v| b.ins().uextend(types::I64, v)),
            Opcode::ItoI64 => self.emit_cast(ins, types::I32, |b, v| b.ins().sextend(types::I64, v)),
            Opcode::FtoI64 => self.emit_cast(ins, types::F32, |b, v| b.ins().fcvt_to_sint(types::I64, v)),
            Opcode::DtoI64 => self.emit_cast(ins, types::F64, |b, v| b.ins().fcvt_to_sint(types::I64, v)),
            Opcode::FtoU64 => self.emit_cast(ins, types::F32, |b, v| b.ins().fcvt_to_uint(types::I64, v)),
            Opcode::DtoU64 => self.emit_cast(ins, types::F64, |b, v| b.ins().fcvt_to_uint(types::I64, v)),
            Opcode::I64toF => self.emit_cast(ins, types::I64, |b, v| b.ins().fcvt_from_sint(types::F32, v)),
            Opcode::U64toF => self.emit_cast(ins, types::I64, |b, v| b.ins().fcvt_from_uint(types::F32, v)),
            Opcode::I64toD => self.emit_cast(ins, types::I64, |b, v| b.ins().fcvt_from_sint(types::F64, v)),
            Opcode::U64toD => self.emit_cast(ins, types::I64, |b, v| b.ins().fcvt_from_uint(types::F64, v)),

            // ===== Arithmetic =====
            Opcode::AddI => self.emit_binop(ins, types::I32, |b, l, r| b.ins().iadd(l, r)),
            Opcode::SubI => self.emit_binop(ins, types::I32, |b, l, r| b.ins().isub(l, r)),
            Opcode::MulI => self.emit_binop(ins, types::I32, |b, l, r| b.ins().imul(l, r)),
            Opcode::DivI => self.emit_binop(ins, types::I32, |b, l, r| b.ins().sdiv(l, r)),
            Opcode::ModI => self.emit_binop(ins, types::I32, |b, l, r| b.ins().srem(l, r)),
            Opcode::DivU => self.emit_binop(ins, types::I32, |b, l, r| b.ins().udiv(l, r)),
            Opcode::ModU => self.emit_binop(ins, types::I32, |b, l, r| b.ins().urem(l, r)),

            Opcode::AddI64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().iadd(l, r)),
            Opcode::SubI64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().isub(l, r)),
            Opcode::MulI64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().imul(l, r)),
            Opcode::DivI64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().sdiv(l, r)),
            Opcode::ModI64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().srem(l, r)),
            Opcode::DivU64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().udiv(l, r)),
            Opcode::ModU64 => self.emit_binop(ins, types::I64, |b, l, r| b.ins().urem(l, r)),

            Opcode::AddF => self.emit_binop(ins, types::F32, |b, l, r| b.ins().fadd(l, r)),
            Opcode::SubF => self.emit_binop(ins, types::F32, |b, l, r| b.ins().fsub(l, r)),
            Opcode::MulF => self.emit_binop(ins, types::F32, |b, l, r| b.ins().fmul(l, r)),
            Opcode::DivF => self.emit_binop(ins, types::F32, |b, l, r| b.ins().fdiv(l, r)),
            Opcode::ModF => self.emit_float_rem(ins, types::F32)?,

            Opcode::AddD => self.emit_binop(ins, types::F64, |b, l, r| b.ins().fadd(l, r)),
            Opcode::SubD => self.emit_binop(ins, types::F64, |b, l, r| b.ins().fsub(l, r)),
            Opcode::MulD => self.emit_binop(ins, types::F64, |b, l, r| b.ins().fmul(l, r)),
            Opcode::DivD => self.emit_binop(ins, types::F64, |b, l, r| b.ins().fdiv(l, r)),
            Opcode::ModD => self.emit_float_rem(ins, types::F64)?,

            Opcode::AddIi => {
                let rhs = self.builder.ins().iconst(types::I32, ins.arg_int(1) as i64);
                self.emit_binop_imm(ins, types::I32, rhs, |b, l, r| b.ins().iadd(l, r));
            }
            Opcode::SubIi => {
                let rhs = self.builder.ins().iconst(types::I32, ins.arg_int(1) as i64);
                self.emit_binop_imm(ins, types::I32, rhs, |b, l, r| b.ins().isub(l, r));
            }
            Opcode::MulIi => {
                let rhs = self.builder.ins().iconst(types::I32, ins.arg_int(1) as i64);
                self.emit_binop_imm(ins, types::I32, rhs, |b, l, r| b.ins().imul(l, r));
            }
            Opcode::AddIf => {
                let rhs = self.builder.ins().f32const(ins.arg_float(1));
                self.emit_binop_imm(ins, types::F32, rhs, |b, l, r| b.ins().fadd(l, r));
            }
            Opcode::SubIf => {
                let rhs = self.builder.ins().f32const(ins.arg_float(1));
                self.emit_binop_imm(ins, types::F32, rhs, |b, l, r| b.ins().fsub(l, r));
            }
            Opcode::MulIf => {
                let rhs = self.builder.ins().f32const(ins.arg_float(1));
                self.emit_binop_imm(ins, types::F32, rhs, |b, l, r| b.ins().fmul(l, r));
            }

            // ===== List initializer helpers =====
            Opcode::AllocMem => {
                let size = self.builder.ins().iconst(ptr, ins.arg_dword(0) as i64);
                let alloc = self.state.module.declare_func_in_func(
                    self.state.runtime.alloc,
                    self.builder.func,
                );
                let call = self.builder.ins().call(alloc, &[size]);
                let memory = self.builder.inst_results(call)[0];
                self.frame.store(&mut self.builder, ins.arg_sword0() as i64, memory);
            }

            Opcode::SetListSize => {
                let list = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, ptr);
                let offset = ins.arg_dword(0) as i64;
                let size = self.builder.ins().iconst(types::I32, ins.arg_dword(1) as i64);
                let target = self.builder.ins().iadd_imm(list, offset);
                self.builder.ins().store(MemFlags::trusted(), size, target, 0);
            }

            Opcode::PshListElmnt => {
                let list = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, ptr);
                let element = self.builder.ins().iadd_imm(list, ins.arg_dword(0) as i64);
                self.frame.push(&mut self.builder, element, PTR_DWORDS);
            }

            // ===== Reserved or deprecated =====
            Opcode::SwapPtr
            | Opcode::LdGRdR4
            | Opcode::Str
            | Opcode::CallBnd
            | Opcode::Copy
            | Opcode::PshNull
            | Opcode::ClrVPtr
            | Opcode::TypeId
            | Opcode::CmpPtr
            | Opcode::Cast
            | Opcode::ChkNullS
            | Opcode::CallPtr
            | Opcode::FuncPtr
            | Opcode::LoadVObjR
            | Opcode::SetListType
            | Opcode::PowI
            | Opcode::PowU
            | Opcode::PowF
            | Opcode::PowD
            | Opcode::PowDi
            | Opcode::PowI64
            | Opcode::PowU64 => {
                return Err(JitError::UnimplementedInstruction(ins.info.mnemonic));
            }
        }

        if let Some(expected) = ins.info.concrete_stack_delta() {
            let moved = self.frame.current_stack_pointer() - old_stack_pointer;
            crate::internal_assert!(
                moved == expected,
                "{} moved the stack pointer by {moved}, expected {expected}",
                ins.info.mnemonic
            );
        }
        Ok(())
    }

    // ===== Object lifetime =====

    fn emit_alloc(&mut self, ins: &Instruction) -> Result<(), JitError> {
        let ptr = self.ptr_type;
        let object_type = unsafe { &*(ins.arg_pword(0) as *const ObjectType) };
        let constructor_id = ins.arg_int(2);

        if object_type.flags.contains(TypeFlags::SCRIPT_OBJECT) {
            let type_arg = self.builder.ins().iconst(ptr, object_type as *const ObjectType as i64);
            let new_object = self.state.module.declare_func_in_func(
                self.state.runtime.new_script_object,
                self.builder.func,
            );
            let call = self.builder.ins().call(new_object, &[type_arg]);
            let object = self.builder.inst_results(call)[0];

            let engine = self.engine;
            let constructor = engine.function(FunctionId(constructor_id as u32));
            let target_offset =
                self.frame.current_stack_pointer() - constructor.space_needed_for_arguments();
            let target = self.frame.load(&mut self.builder, target_offset, ptr);
            self.builder.ins().store(MemFlags::trusted(), object, target, 0);

            self.frame.push(&mut self.builder, object, PTR_DWORDS);
            self.emit_script_call(constructor, None)?;
            self.frame.pop(PTR_DWORDS);
        } else {
            let size = self.builder.ins().iconst(ptr, object_type.size as i64);
            let alloc = self
                .state
                .module
                .declare_func_in_func(self.state.runtime.alloc, self.builder.func);
            let call = self.builder.ins().call(alloc, &[size]);
            let object = self.builder.inst_results(call)[0];

            if constructor_id != 0 {
                self.frame.push(&mut self.builder, object, PTR_DWORDS);
                let engine = self.engine;
                let constructor = engine.function(FunctionId(constructor_id as u32));
                self.emit_system_call(constructor)?;
            }

            let target = self.frame.pop_value(&mut self.builder, PTR_DWORDS, ptr);
            self.builder.ins().store(MemFlags::trusted(), object, target, 0);
        }
        Ok(())
    }

    fn emit_free(&mut self, ins: &Instruction) -> Result<(), JitError> {
        let ptr = self.ptr_type;
        let object_type = unsafe { &*(ins.arg_pword(0) as *const ObjectType) };
        let object = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, ptr);

        if object_type.flags.contains(TypeFlags::REF) {
            crate::internal_assert!(
                object_type.flags.contains(TypeFlags::NOCOUNT)
                    || object_type.beh.release.is_some(),
                "counted reference type {} without release behaviour",
                object_type.name
            );
            if let Some(release) = object_type.beh.release {
                let engine = self.engine;
                let release = engine.function(release);
                self.emit_object_method_call(release, object);
            }
        } else {
            if let Some(destruct) = object_type.beh.destruct {
                let engine = self.engine;
                let destruct = engine.function(destruct);
                self.emit_object_method_call(destruct, object);
            } else if object_type.flags.contains(TypeFlags::LIST_PATTERN) {
                diagnostic(
                    self.engine,
                    MessageType::Warning,
                    "STUB: list pattern free, this will result in a leak",
                );
            }

            let free = self
                .state
                .module
                .declare_func_in_func(self.state.runtime.free, self.builder.func);
            self.builder.ins().call(free, &[object]);
        }
        Ok(())
    }

    fn emit_ref_copy(&mut self, ins: &Instruction) -> Result<(), JitError> {
        let ptr = self.ptr_type;
        let object_type = unsafe { &*(ins.arg_pword(0) as *const ObjectType) };

        let destination = self.frame.pop_value(&mut self.builder, PTR_DWORDS, ptr);
        let reference = self.frame.top(&mut self.builder, ptr);

        self.emit_addref(object_type, reference, "REFCPY");
        self.builder.ins().store(MemFlags::trusted(), reference, destination, 0);
        Ok(())
    }

    fn emit_ref_copy_to_variable(&mut self, ins: &Instruction) -> Result<(), JitError> {
        let ptr = self.ptr_type;
        let object_type = unsafe { &*(ins.arg_pword(0) as *const ObjectType) };

        let destination = self.frame.pointer_to(&mut self.builder, ins.arg_sword0() as i64);
        let reference = self.frame.top(&mut self.builder, ptr);

        self.emit_addref(object_type, reference, "RefCpyV");
        self.builder.ins().store(MemFlags::trusted(), reference, destination, 0);
        Ok(())
    }

    fn emit_addref(&mut self, object_type: &ObjectType, reference: Value, opcode: &str) {
        if object_type.flags.contains(TypeFlags::NOCOUNT) {
            return;
        }
        if object_type.beh.release.is_some() {
            diagnostic(
                self.engine,
                MessageType::Warning,
                format!("STUB: {opcode} not releasing old reference, this may leak"),
            );
        }
        if let Some(addref) = object_type.beh.addref {
            diagnostic(
                self.engine,
                MessageType::Info,
                "STUB: not checking for zero in addref",
            );
            let engine = self.engine;
            let addref = engine.function(addref);
            self.emit_object_method_call(addref, reference);
        }
    }

    // ===== Emission helpers =====

    fn switch_to_block(&mut self, block: Block) {
        if !self.terminated {
            self.builder.ins().jump(block, &[]);
        }
        self.builder.switch_to_block(block);
        self.terminated = false;
    }

    fn branch_target(&self, ins: &Instruction) -> Block {
        match self.jump_map.get(&branch_target_offset(ins)) {
            Some(&block) => block,
            None => crate::internal_error!("missing branch target for {:#06x}", ins.offset),
        }
    }

    fn fallthrough_target(&self, ins: &Instruction) -> Block {
        match self.jump_map.get(&(ins.offset + 2)) {
            Some(&block) => block,
            None => crate::internal_error!("missing fallthrough target for {:#06x}", ins.offset),
        }
    }

    fn emit_conditional_branch(&mut self, ins: &Instruction, condition: IntCC) {
        let value = self.load_value_register(types::I32);
        let flag = self.builder.ins().icmp_imm(condition, value, 0);
        let taken = self.branch_target(ins);
        let fallthrough = self.fallthrough_target(ins);
        self.builder.ins().brif(flag, taken, &[], fallthrough, &[]);
        self.terminated = true;
    }

    fn emit_low_conditional_branch(&mut self, ins: &Instruction, condition: IntCC) {
        let value = self.load_value_register(types::I8);
        let flag = self.builder.ins().icmp_imm(condition, value, 0);
        let taken = self.branch_target(ins);
        let fallthrough = self.fallthrough_target(ins);
        self.builder.ins().brif(flag, taken, &[], fallthrough, &[]);
        self.terminated = true;
    }

    fn emit_test(&mut self, condition: IntCC) {
        let value = self.load_value_register(types::I32);
        let flag = self.builder.ins().icmp_imm(condition, value, 0);
        let extended = self.builder.ins().uextend(types::I64, flag);
        self.store_value_register(extended);
    }

    fn emit_compare_vars(&mut self, ins: &Instruction, ty: ir::Type, kind: CompareKind) {
        let lhs = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, ty);
        let rhs = self.frame.load(&mut self.builder, ins.arg_sword1() as i64, ty);
        self.emit_compare(lhs, rhs, kind);
    }

    /// value register ← −1 / 0 / 1.
    fn emit_compare(&mut self, lhs: Value, rhs: Value, kind: CompareKind) {
        let (lower, greater) = match kind {
            CompareKind::Float => (
                self.builder.ins().fcmp(ir::condcodes::FloatCC::LessThan, lhs, rhs),
                self.builder.ins().fcmp(ir::condcodes::FloatCC::GreaterThan, lhs, rhs),
            ),
            CompareKind::Signed => (
                self.builder.ins().icmp(IntCC::SignedLessThan, lhs, rhs),
                self.builder.ins().icmp(IntCC::SignedGreaterThan, lhs, rhs),
            ),
            CompareKind::Unsigned => (
                self.builder.ins().icmp(IntCC::UnsignedLessThan, lhs, rhs),
                self.builder.ins().icmp(IntCC::UnsignedGreaterThan, lhs, rhs),
            ),
        };

        let minus_one = self.builder.ins().iconst(types::I32, -1);
        let zero = self.builder.ins().iconst(types::I32, 0);
        let one = self.builder.ins().iconst(types::I32, 1);

        let lower_or_equal = self.builder.ins().select(lower, minus_one, zero);
        let result = self.builder.ins().select(greater, one, lower_or_equal);
        self.store_value_register(result);
    }

    fn emit_binop(
        &mut self,
        ins: &Instruction,
        ty: ir::Type,
        op: impl FnOnce(&mut FunctionBuilder, Value, Value) -> Value,
    ) {
        let lhs = self.frame.load(&mut self.builder, ins.arg_sword1() as i64, ty);
        let rhs = self.frame.load(&mut self.builder, ins.arg_sword2() as i64, ty);
        let result = op(&mut self.builder, lhs, rhs);
        self.frame.store(&mut self.builder, ins.arg_sword0() as i64, result);
    }

    fn emit_binop_imm(
        &mut self,
        ins: &Instruction,
        ty: ir::Type,
        rhs: Value,
        op: impl FnOnce(&mut FunctionBuilder, Value, Value) -> Value,
    ) {
        let lhs = self.frame.load(&mut self.builder, ins.arg_sword1() as i64, ty);
        let result = op(&mut self.builder, lhs, rhs);
        self.frame.store(&mut self.builder, ins.arg_sword0() as i64, result);
    }

    fn emit_float_rem(&mut self, ins: &Instruction, ty: ir::Type) -> Result<(), JitError> {
        let callee = if ty == types::F32 {
            self.state.runtime.fmodf
        } else {
            self.state.runtime.fmod
        };
        let lhs = self.frame.load(&mut self.builder, ins.arg_sword1() as i64, ty);
        let rhs = self.frame.load(&mut self.builder, ins.arg_sword2() as i64, ty);
        let fmod = self.state.module.declare_func_in_func(callee, self.builder.func);
        let call = self.builder.ins().call(fmod, &[lhs, rhs]);
        let result = self.builder.inst_results(call)[0];
        self.frame.store(&mut self.builder, ins.arg_sword0() as i64, result);
        Ok(())
    }

    fn emit_neg(&mut self, ins: &Instruction, ty: ir::Type) {
        let value = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, ty);
        let result = if ty.is_float() {
            self.builder.ins().fneg(value)
        } else {
            self.builder.ins().ineg(value)
        };
        self.frame.store(&mut self.builder, ins.arg_sword0() as i64, result);
    }

    fn emit_bit_not(&mut self, ins: &Instruction, ty: ir::Type) {
        let value = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, ty);
        let result = self.builder.ins().bnot(value);
        self.frame.store(&mut self.builder, ins.arg_sword0() as i64, result);
    }

    /// Increment/decrement through the value register as a pointer.
    fn emit_increment(&mut self, ty: ir::Type, by: i64) {
        let pointer = self.load_value_register(self.ptr_type);
        let value = self.builder.ins().load(ty, MemFlags::trusted(), pointer, 0);
        let result = if ty == types::F32 {
            let increment = self.builder.ins().f32const(by as f32);
            self.builder.ins().fadd(value, increment)
        } else if ty == types::F64 {
            let increment = self.builder.ins().f64const(by as f64);
            self.builder.ins().fadd(value, increment)
        } else {
            self.builder.ins().iadd_imm(value, by)
        };
        self.builder.ins().store(MemFlags::trusted(), result, pointer, 0);
    }

    fn emit_cast(
        &mut self,
        ins: &Instruction,
        from: ir::Type,
        op: impl FnOnce(&mut FunctionBuilder, Value) -> Value,
    ) {
        // Same-width conversions address one variable; width-changing ones
        // read sword1 and write sword0.
        let source_offset = if ins.info.layout == crate::bytecode::Layout::WordWord {
            ins.arg_sword1() as i64
        } else {
            ins.arg_sword0() as i64
        };
        let value = self.frame.load(&mut self.builder, source_offset, from);
        let converted = op(&mut self.builder, value);
        self.frame.store(&mut self.builder, ins.arg_sword0() as i64, converted);
    }

    fn emit_write_through_register(&mut self, ins: &Instruction, ty: ir::Type) {
        let value = self.frame.load(&mut self.builder, ins.arg_sword0() as i64, ty);
        let target = self.load_value_register(self.ptr_type);
        self.builder.ins().store(MemFlags::trusted(), value, target, 0);
    }

    fn emit_read_through_register(&mut self, ins: &Instruction, ty: ir::Type, extend: bool) {
        let source = self.load_value_register(self.ptr_type);
        let mut value = self.builder.ins().load(ty, MemFlags::trusted(), source, 0);
        if extend {
            value = self.builder.ins().uextend(types::I32, value);
        }
        self.frame.store(&mut self.builder, ins.arg_sword0() as i64, value);
    }

    fn load_global(&mut self, address: u64, ty: ir::Type) -> Value {
        let pointer = self.builder.ins().iconst(self.ptr_type, address as i64);
        self.builder.ins().load(ty, MemFlags::trusted(), pointer, 0)
    }

    /// Address of the frame cell a runtime variable index refers to:
    /// `&storage[total_space - index]`.
    fn frame_address_for_index(&mut self, index: Value) -> Value {
        let base = self.frame.storage_base(&mut self.builder);
        let total = self.builder.ins().iconst(self.ptr_type, self.frame.total_space());
        let cell = self.builder.ins().isub(total, index);
        let byte_offset = self.builder.ins().imul_imm(cell, 4);
        self.builder.ins().iadd(base, byte_offset)
    }

    fn value_register_slot(&self) -> StackSlot {
        match self.value_register {
            Some(slot) => slot,
            None => crate::internal_error!("value register used before setup"),
        }
    }

    fn object_register_slot(&self) -> StackSlot {
        match self.object_register {
            Some(slot) => slot,
            None => crate::internal_error!("object register used before setup"),
        }
    }

    pub(crate) fn store_value_register(&mut self, value: Value) {
        let slot = self.value_register_slot();
        self.builder.ins().stack_store(value, slot, 0);
    }

    pub(crate) fn load_value_register(&mut self, ty: ir::Type) -> Value {
        let slot = self.value_register_slot();
        self.builder.ins().stack_load(ty, slot, 0)
    }

    pub(crate) fn store_object_register(&mut self, value: Value) {
        let slot = self.object_register_slot();
        self.builder.ins().stack_store(value, slot, 0);
    }

    pub(crate) fn load_object_register(&mut self) -> Value {
        let slot = self.object_register_slot();
        self.builder.ins().stack_load(self.ptr_type, slot, 0)
    }
}

/// `offset + 2 + displacement`, the target of a branch instruction.
fn branch_target_offset(ins: &Instruction) -> usize {
    (ins.offset as i64 + 2 + ins.arg_int(0) as i64) as usize
}

#[cfg(test)]
impl FunctionTranslator<'_, '_> {
    /// Runs pass 1 alone and returns the label offsets plus the switch
    /// table sizes, filling and finalizing all created blocks so the
    /// builder can be torn down cleanly.
    pub(crate) fn preprocess_for_tests(mut self) -> (Vec<usize>, Vec<(usize, usize)>) {
        let function = self.function;
        let bytecode = function.bytecode.as_ref().expect("test function has bytecode");

        let entry = self.builder.create_block();
        self.builder.switch_to_block(entry);

        let mut ctx = PreprocessContext::default();
        for ins in BytecodeCursor::new(bytecode) {
            self.preprocess_instruction(&ins, &mut ctx);
        }

        let mut labels: Vec<usize> = self.jump_map.keys().copied().collect();
        labels.sort_unstable();
        let mut switches: Vec<(usize, usize)> =
            self.switch_map.iter().map(|(&offset, targets)| (offset, targets.len())).collect();
        switches.sort_unstable();

        let blocks: Vec<Block> = self.jump_map.values().copied().collect();
        self.builder.ins().trap(ir::TrapCode::user(1).unwrap());
        for block in blocks {
            self.builder.switch_to_block(block);
            self.builder.ins().trap(ir::TrapCode::user(1).unwrap());
        }
        self.builder.seal_all_blocks();
        self.builder.finalize();

        (labels, switches)
    }
}
