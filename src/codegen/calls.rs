//! Call emission: script calls (direct, virtual, delegate), system calls
//! under each native calling convention, and the object method trampoline.

use cranelift_codegen::ir::{self, InstBuilder, MemFlags, Value};
use cranelift_module::Module;

use crate::codegen::translator::FunctionTranslator;
use crate::common::PTR_DWORDS;
use crate::engine::{
    DataType, FunctionKind, MessageType, NativeCallConv, ScriptFunction, TypeFlags,
};
use crate::error::JitError;

/// Register-file pointers used when a call is emitted inside the VM entry
/// thunk: arguments come from the interpreter frame and results go back
/// into the interpreter's registers.
pub(crate) struct VmEntryContext {
    pub frame_pointer: Value,
    pub value_register: Value,
    pub object_register: Value,
}

enum ResolvedCallee {
    Direct(ir::FuncRef),
    Indirect(Value),
}

impl<'a, 'b> FunctionTranslator<'a, 'b> {
    /// Emits a call to a script function. In thunk mode (`vm` set),
    /// arguments are read downward from the VM frame instead of popped
    /// from the JIT stack.
    pub(crate) fn emit_script_call(
        &mut self,
        callee: &ScriptFunction,
        vm: Option<&VmEntryContext>,
    ) -> Result<(), JitError> {
        match callee.kind {
            FunctionKind::Script | FunctionKind::Virtual | FunctionKind::Delegate => {}
            FunctionKind::System => {
                crate::internal_error!("system function {} in script call", callee.name)
            }
        }

        let signature = self.state.script_signature(self.engine, callee);

        let resolved = if callee.kind == FunctionKind::Virtual {
            crate::internal_assert!(
                vm.is_none(),
                "virtual callee {} in VM entry thunk",
                callee.name
            );
            self.resolve_virtual_script_function(callee)?
        } else {
            let func_id = self.state.get_script_function(callee, self.engine)?;
            ResolvedCallee::Direct(
                self.state.module.declare_func_in_func(func_id, self.builder.func),
            )
        };

        let mut read_dwords: i64 = 0;
        let mut args = Vec::new();

        if callee.returns_on_stack && !callee.return_type.is_void() {
            args.push(self.read_call_argument(&callee.return_type, vm, &mut read_dwords));
        }
        if let Some(type_id) = callee.object_type {
            args.push(self.read_call_argument(&DataType::handle(type_id), vm, &mut read_dwords));
        }
        for param in &callee.params {
            args.push(self.read_call_argument(&param.data_type, vm, &mut read_dwords));
        }

        let call = match resolved {
            ResolvedCallee::Direct(func_ref) => self.builder.ins().call(func_ref, &args),
            ResolvedCallee::Indirect(target) => {
                let sig_ref = self.builder.import_signature(signature);
                self.builder.ins().call_indirect(sig_ref, target, &args)
            }
        };

        if !callee.return_type.is_void() && !callee.returns_on_stack {
            let result = self.builder.inst_results(call)[0];
            if callee.return_type.is_object() {
                match vm {
                    Some(context) => {
                        self.builder.ins().store(
                            MemFlags::trusted(),
                            result,
                            context.object_register,
                            0,
                        );
                    }
                    None => self.store_object_register(result),
                }
            } else {
                match vm {
                    Some(context) => {
                        self.builder.ins().store(
                            MemFlags::trusted(),
                            result,
                            context.value_register,
                            0,
                        );
                    }
                    None => self.store_value_register(result),
                }
            }
        }
        Ok(())
    }

    /// Emits a native call under the callee's calling convention.
    pub(crate) fn emit_system_call(&mut self, callee: &ScriptFunction) -> Result<(), JitError> {
        let Some(intf) = callee.native else {
            crate::internal_error!("script function {} in system call", callee.name);
        };
        let ptr = self.ptr_type;
        let signature = self.state.system_signature(self.engine, callee);

        // When the script expects a stack return but the host ABI returns
        // by value, the hidden pointer the script pushed becomes a plain
        // store target after the call.
        let mut return_pointer = None;
        if callee.returns_on_stack && !intf.host_return_in_memory {
            return_pointer = Some(self.frame.pop_value(&mut self.builder, PTR_DWORDS, ptr));
        }

        let mut args = Vec::new();
        let mut object = None;

        match intf.call_conv {
            NativeCallConv::Cdecl => {
                self.pop_system_parameters(callee, &mut args);
            }

            NativeCallConv::Thiscall
            | NativeCallConv::VirtualThiscall
            | NativeCallConv::CdeclObjFirst => {
                let this = self.frame.pop_value(&mut self.builder, PTR_DWORDS, ptr);
                object = Some(this);
                if intf.host_return_in_memory {
                    let sret = self.frame.pop_value(&mut self.builder, PTR_DWORDS, ptr);
                    args.push(sret);
                }
                args.push(this);
                self.pop_system_parameters(callee, &mut args);
            }

            NativeCallConv::CdeclObjLast => {
                let this = self.frame.pop_value(&mut self.builder, PTR_DWORDS, ptr);
                object = Some(this);
                if intf.host_return_in_memory {
                    let sret = self.frame.pop_value(&mut self.builder, PTR_DWORDS, ptr);
                    args.push(sret);
                }
                self.pop_system_parameters(callee, &mut args);
                args.push(this);
            }
        }

        let call = match intf.call_conv {
            NativeCallConv::VirtualThiscall => {
                let object = match object {
                    Some(object) => object,
                    None => crate::internal_error!("virtual thiscall without object"),
                };
                let slot = self.builder.ins().iconst(ptr, intf.address as i64);
                let lookup = self.state.module.declare_func_in_func(
                    self.state.runtime.system_vtable_lookup,
                    self.builder.func,
                );
                let lookup_call = self.builder.ins().call(lookup, &[object, slot]);
                let target = self.builder.inst_results(lookup_call)[0];

                let sig_ref = self.builder.import_signature(signature.clone());
                self.builder.ins().call_indirect(sig_ref, target, &args)
            }
            _ => {
                let func_id = self.state.get_system_function(callee, self.engine, self.config)?;
                let func_ref = self.state.module.declare_func_in_func(func_id, self.builder.func);
                self.builder.ins().call(func_ref, &args)
            }
        };

        let returns_value = !signature.returns.is_empty();
        match return_pointer {
            Some(pointer) => {
                if returns_value {
                    let result = self.builder.inst_results(call)[0];
                    self.builder.ins().store(MemFlags::trusted(), result, pointer, 0);
                }
            }
            None => {
                if returns_value {
                    let result = self.builder.inst_results(call)[0];
                    if callee.return_type.is_object_handle {
                        self.store_object_register(result);
                    } else {
                        self.store_value_register(result);
                    }
                }
            }
        }

        // Factory calls pop into the parameter region.
        self.frame.clamp_to_variable_space();
        Ok(())
    }

    /// Invokes an engine-side method on `object` through the
    /// `call_object_method` trampoline; used for refcount and destructor
    /// behaviours.
    pub(crate) fn emit_object_method_call(&mut self, callee: &ScriptFunction, object: Value) {
        let descriptor = self
            .builder
            .ins()
            .iconst(self.ptr_type, callee as *const ScriptFunction as i64);
        let trampoline = self.state.module.declare_func_in_func(
            self.state.runtime.call_object_method,
            self.builder.func,
        );
        self.builder.ins().call(trampoline, &[object, descriptor]);
    }

    fn pop_system_parameters(&mut self, callee: &ScriptFunction, args: &mut Vec<Value>) {
        let mut read_dwords = 0i64;
        for param in &callee.params {
            args.push(self.read_call_argument(&param.data_type, None, &mut read_dwords));
        }
    }

    fn read_call_argument(
        &mut self,
        data_type: &DataType,
        vm: Option<&VmEntryContext>,
        read_dwords: &mut i64,
    ) -> Value {
        let dwords = data_type.size_on_stack_dwords();
        let ty = match self.state.mapper.map(self.engine, data_type) {
            Some(ty) => ty,
            None => crate::internal_error!("void call argument"),
        };
        let value = match vm {
            Some(context) => {
                // The VM frame is read downward, dword by dword.
                let byte_offset = (-*read_dwords * 4) as i32;
                self.builder.ins().load(ty, MemFlags::trusted(), context.frame_pointer, byte_offset)
            }
            None => self.frame.pop_value(&mut self.builder, dwords, ty),
        };
        *read_dwords += dwords;
        value
    }

    /// Resolves a virtual script call: a direct call when the target
    /// cannot be overridden and devirtualization is enabled, a runtime
    /// vtable lookup otherwise.
    fn resolve_virtual_script_function(
        &mut self,
        callee: &ScriptFunction,
    ) -> Result<ResolvedCallee, JitError> {
        let engine = self.engine;
        let Some(owner_id) = callee.object_type else {
            crate::internal_error!("virtual function {} without owner", callee.name);
        };
        let Some(owner) = engine.object_type(owner_id) else {
            crate::internal_error!("unknown owner type for {}", callee.name);
        };

        let is_final = callee.is_final || owner.flags.contains(TypeFlags::NOINHERIT);

        if self.config.allow_devirtualization && is_final {
            let resolved = self.find_nonvirtual_match(callee);
            let Some(resolved) = resolved else {
                crate::internal_error!("no non-virtual match for final {}", callee.name);
            };
            if self.config.verbose {
                crate::common::diagnostic(
                    self.engine,
                    MessageType::Info,
                    format!("devirtualized call to {}", callee.name),
                );
            }
            let func_id = self.state.get_script_function(resolved, self.engine)?;
            return Ok(ResolvedCallee::Direct(
                self.state.module.declare_func_in_func(func_id, self.builder.func),
            ));
        }

        let object = self.frame.top(&mut self.builder, self.ptr_type);
        let descriptor = self
            .builder
            .ins()
            .iconst(self.ptr_type, callee as *const ScriptFunction as i64);
        let lookup = self.state.module.declare_func_in_func(
            self.state.runtime.script_vtable_lookup,
            self.builder.func,
        );
        let call = self.builder.ins().call(lookup, &[object, descriptor]);
        Ok(ResolvedCallee::Indirect(self.builder.inst_results(call)[0]))
    }

    /// The concrete method matching a virtual stub's signature.
    fn find_nonvirtual_match(&self, callee: &ScriptFunction) -> Option<&'a ScriptFunction> {
        let engine = self.engine;
        let owner = engine.object_type(callee.object_type?)?;
        owner
            .methods
            .iter()
            .map(|&id| engine.function(id))
            .find(|candidate| {
                candidate.kind == FunctionKind::Script
                    && candidate.name == callee.name
                    && candidate.return_type == callee.return_type
                    && candidate.params.len() == callee.params.len()
                    && candidate
                        .params
                        .iter()
                        .zip(&callee.params)
                        .all(|(a, b)| a.data_type == b.data_type)
            })
    }
}
