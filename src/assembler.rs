//! Per-script-module assembly: owns the backend module, declares symbols,
//! drives function translation, and publishes results to the engine.

use std::rc::Rc;
use std::sync::Arc;

use cranelift_codegen::ir::{self, AbiParam, ArgumentPurpose, Signature, UserFuncName};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::verifier::verify_function;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use target_lexicon::Architecture;

use crate::codegen::debuginfo::DebugTypeCache;
use crate::codegen::translator::FunctionTranslator;
use crate::codegen::types::TypeMapper;
use crate::common::{
    diagnostic, make_function_name, make_system_function_name, make_vm_entry_thunk_name,
};
use crate::config::JitConfig;
use crate::engine::{
    FunctionId, MessageType, NativeCallConv, ScriptEngine, ScriptFunction,
};
use crate::error::JitError;
use crate::runtime::{self, FnPtrSlot, VmEntryFn};

/// Process-wide extern symbol table the JIT linker resolves imports from.
/// System function addresses and already-built script function bodies are
/// published here.
pub type SharedSymbolTable = Arc<Mutex<FxHashMap<String, usize>>>;

/// A function waiting for `build()`, together with its output slot.
pub struct PendingFunction {
    pub function: FunctionId,
    pub slot: Rc<FnPtrSlot>,
}

/// Record of one built function, kept until module link.
pub struct JitSymbol {
    pub function: FunctionId,
    pub name: String,
    pub entry_name: String,
    pub body: FuncId,
    pub thunk: FuncId,
    pub slot: Rc<FnPtrSlot>,
}

/// Handles to the runtime helpers, declared once per module.
pub struct RuntimeFunctions {
    pub alloc: FuncId,
    pub free: FuncId,
    pub new_script_object: FuncId,
    pub script_vtable_lookup: FuncId,
    pub system_vtable_lookup: FuncId,
    pub call_object_method: FuncId,
    pub fmodf: FuncId,
    pub fmod: FuncId,
    pub panic: FuncId,
    pub set_internal_exception: FuncId,
}

impl RuntimeFunctions {
    fn declare(module: &mut JITModule) -> Result<Self, JitError> {
        let ptr = module.isa().pointer_type();
        let call_conv = module.isa().default_call_conv();

        let mut declare = |name: &str, params: &[ir::Type], returns: &[ir::Type]| {
            let mut sig = Signature::new(call_conv);
            for &p in params {
                sig.params.push(AbiParam::new(p));
            }
            for &r in returns {
                sig.returns.push(AbiParam::new(r));
            }
            module
                .declare_function(name, Linkage::Import, &sig)
                .map_err(JitError::from)
        };

        Ok(RuntimeFunctions {
            alloc: declare("asjit.private.alloc", &[ptr], &[ptr])?,
            free: declare("asjit.private.free", &[ptr], &[])?,
            new_script_object: declare("asjit.private.new_script_object", &[ptr], &[ptr])?,
            script_vtable_lookup: declare("asjit.private.script_vtable_lookup", &[ptr, ptr], &[ptr])?,
            system_vtable_lookup: declare("asjit.private.system_vtable_lookup", &[ptr, ptr], &[ptr])?,
            call_object_method: declare("asjit.private.call_object_method", &[ptr, ptr], &[])?,
            fmodf: declare("fmodf", &[ir::types::F32, ir::types::F32], &[ir::types::F32])?,
            fmod: declare("fmod", &[ir::types::F64, ir::types::F64], &[ir::types::F64])?,
            panic: declare("asjit.private.panic", &[], &[])?,
            set_internal_exception: declare(
                "asjit.private.set_internal_exception",
                &[ir::types::I8],
                &[],
            )?,
        })
    }
}

fn register_runtime_symbols(builder: &mut JITBuilder) {
    builder.symbol("asjit.private.alloc", runtime::jit_alloc as *const u8);
    builder.symbol("asjit.private.free", runtime::jit_free as *const u8);
    builder.symbol(
        "asjit.private.new_script_object",
        runtime::jit_new_script_object as *const u8,
    );
    builder.symbol(
        "asjit.private.script_vtable_lookup",
        runtime::jit_script_vtable_lookup as *const u8,
    );
    builder.symbol(
        "asjit.private.system_vtable_lookup",
        runtime::jit_system_vtable_lookup as *const u8,
    );
    builder.symbol(
        "asjit.private.call_object_method",
        runtime::jit_call_object_method as *const u8,
    );
    builder.symbol("fmodf", runtime::jit_fmodf as *const u8);
    builder.symbol("fmod", runtime::jit_fmod as *const u8);
    builder.symbol("asjit.private.panic", runtime::jit_panic as *const u8);
    builder.symbol(
        "asjit.private.set_internal_exception",
        runtime::jit_set_internal_exception as *const u8,
    );
}

/// Backend module plus the symbol state translators work against.
pub struct ModuleState {
    pub module: JITModule,
    pub mapper: TypeMapper,
    pub debug_types: DebugTypeCache,
    pub runtime: RuntimeFunctions,
    /// Token patched into `JitEntry` arguments; stable per compiler.
    pub jit_token: u64,
    /// Functions declared readonly-pure under `assume_const_is_pure`.
    pub pure_system_calls: FxHashSet<FuncId>,
    module_key: Option<String>,
    script_functions: FxHashMap<FunctionId, FuncId>,
    system_functions: FxHashMap<FunctionId, FuncId>,
    symbols: SharedSymbolTable,
    declared_names: Vec<String>,
}

impl ModuleState {
    pub(crate) fn new(
        isa: Arc<dyn TargetIsa>,
        module_key: Option<String>,
        symbols: SharedSymbolTable,
        jit_token: u64,
    ) -> Result<Self, JitError> {
        let mut builder = JITBuilder::with_isa(isa, default_libcall_names());
        register_runtime_symbols(&mut builder);
        let lookup = symbols.clone();
        builder.symbol_lookup_fn(Box::new(move |name| {
            lookup.lock().get(name).map(|&address| address as *const u8)
        }));

        let mut module = JITModule::new(builder);
        let ptr_type = module.isa().pointer_type();
        let runtime = RuntimeFunctions::declare(&mut module)?;

        Ok(ModuleState {
            module,
            mapper: TypeMapper::new(ptr_type),
            debug_types: DebugTypeCache::default(),
            runtime,
            jit_token,
            pure_system_calls: FxHashSet::default(),
            module_key,
            script_functions: FxHashMap::default(),
            system_functions: FxHashMap::default(),
            symbols,
            declared_names: Vec::new(),
        })
    }

    pub fn pointer_type(&self) -> ir::Type {
        self.module.isa().pointer_type()
    }

    /// Native signature of a script function: optional hidden return
    /// pointer, optional `this`, then the declared parameters.
    pub fn script_signature(&self, engine: &ScriptEngine, function: &ScriptFunction) -> Signature {
        let ptr = self.pointer_type();
        let mut sig = Signature::new(self.module.isa().default_call_conv());

        if function.returns_on_stack && !function.return_type.is_void() {
            sig.params.push(AbiParam::new(ptr));
        }
        if function.object_type.is_some() {
            sig.params.push(AbiParam::new(ptr));
        }
        for param in &function.params {
            match self.mapper.map(engine, &param.data_type) {
                Some(ty) => sig.params.push(AbiParam::new(ty)),
                None => crate::internal_error!("void parameter on {}", function.name),
            }
        }
        if !function.returns_on_stack {
            if let Some(ty) = self.mapper.map(engine, &function.return_type) {
                sig.returns.push(AbiParam::new(ty));
            }
        }
        sig
    }

    /// Native signature of a system call under its calling convention.
    pub fn system_signature(&self, engine: &ScriptEngine, function: &ScriptFunction) -> Signature {
        let Some(intf) = function.native else {
            crate::internal_error!("system signature requested for {}", function.name);
        };
        let ptr = self.pointer_type();
        let mut sig = Signature::new(self.module.isa().default_call_conv());

        if intf.host_return_in_memory {
            sig.params.push(AbiParam::special(ptr, ArgumentPurpose::StructReturn));
        }
        match intf.call_conv {
            NativeCallConv::Thiscall
            | NativeCallConv::VirtualThiscall
            | NativeCallConv::CdeclObjFirst => {
                sig.params.push(AbiParam::new(ptr));
            }
            NativeCallConv::Cdecl | NativeCallConv::CdeclObjLast => {}
        }
        for param in &function.params {
            match self.mapper.map(engine, &param.data_type) {
                Some(ty) => sig.params.push(AbiParam::new(ty)),
                None => crate::internal_error!("void parameter on {}", function.name),
            }
        }
        if intf.call_conv == NativeCallConv::CdeclObjLast {
            sig.params.push(AbiParam::new(ptr));
        }
        if !intf.host_return_in_memory {
            if let Some(ty) = self.mapper.map(engine, &function.return_type) {
                sig.returns.push(AbiParam::new(ty));
            }
        }
        sig
    }

    fn vm_entry_thunk_signature(&self) -> Signature {
        let ptr = self.pointer_type();
        let mut sig = Signature::new(self.module.isa().default_call_conv());
        sig.params.push(AbiParam::new(ptr));
        sig.params.push(AbiParam::new(ir::types::I64));
        sig
    }

    /// Declares (once) the native implementation symbol of a script
    /// function. Functions of this module are exported definitions; others
    /// are imports resolved through the shared symbol table.
    pub fn get_script_function(
        &mut self,
        function: &ScriptFunction,
        engine: &ScriptEngine,
    ) -> Result<FuncId, JitError> {
        crate::internal_assert!(
            function.vf_table_idx < 0,
            "virtual function {} must be resolved before symbol lookup",
            function.name
        );
        if let Some(&id) = self.script_functions.get(&function.id) {
            return Ok(id);
        }

        let name = make_function_name(function);
        let linkage = if function.module == self.module_key {
            Linkage::Export
        } else {
            Linkage::Import
        };
        let sig = self.script_signature(engine, function);
        let id = self.module.declare_function(&name, linkage, &sig)?;
        self.script_functions.insert(function.id, id);
        self.declared_names.push(name);
        Ok(id)
    }

    /// Declares (once) a system function import and publishes its native
    /// address for the linker.
    pub fn get_system_function(
        &mut self,
        function: &ScriptFunction,
        engine: &ScriptEngine,
        config: &JitConfig,
    ) -> Result<FuncId, JitError> {
        if let Some(&id) = self.system_functions.get(&function.id) {
            return Ok(id);
        }
        let Some(intf) = function.native else {
            crate::internal_error!("system call to non-system function {}", function.name);
        };
        crate::internal_assert!(
            intf.call_conv != NativeCallConv::VirtualThiscall,
            "virtual thiscall {} resolves at runtime, not by symbol",
            function.name
        );

        let name = make_system_function_name(function);
        let sig = self.system_signature(engine, function);
        let id = self.module.declare_function(&name, Linkage::Import, &sig)?;
        if config.assume_const_is_pure && function.is_read_only {
            self.pure_system_calls.insert(id);
        }
        self.symbols.lock().insert(name.clone(), intf.address);
        self.system_functions.insert(function.id, id);
        self.declared_names.push(name);
        Ok(id)
    }

    fn declare_vm_entry_thunk(&mut self, function: &ScriptFunction) -> Result<FuncId, JitError> {
        let name = make_vm_entry_thunk_name(function);
        let sig = self.vm_entry_thunk_signature();
        let id = self.module.declare_function(&name, Linkage::Export, &sig)?;
        self.declared_names.push(name);
        Ok(id)
    }

    fn publish_symbol(&self, name: &str, address: *const u8) {
        self.symbols.lock().insert(name.to_owned(), address as usize);
    }
}

/// Assembles all pending functions of one script module.
pub struct ModuleAssembler {
    state: ModuleState,
    pending: Vec<PendingFunction>,
    jit_symbols: Vec<JitSymbol>,
    built: bool,
}

impl ModuleAssembler {
    pub fn new(
        isa: Arc<dyn TargetIsa>,
        module_key: Option<String>,
        symbols: SharedSymbolTable,
        jit_token: u64,
    ) -> Result<Self, JitError> {
        Ok(ModuleAssembler {
            state: ModuleState::new(isa, module_key, symbols, jit_token)?,
            pending: Vec::new(),
            jit_symbols: Vec::new(),
            built: false,
        })
    }

    pub fn append(&mut self, function: PendingFunction) {
        self.pending.push(function);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Translates every pending function, then defines and finalizes the
    /// module. Per-function failures drop that function and continue;
    /// module-level failures propagate.
    pub fn build(&mut self, engine: &ScriptEngine, config: &JitConfig) -> Result<(), JitError> {
        let pending = std::mem::take(&mut self.pending);

        for entry in pending {
            if self.jit_symbols.iter().any(|s| s.function == entry.function) {
                if config.verbose {
                    diagnostic(
                        engine,
                        MessageType::Info,
                        "ignoring function that was compiled in module already",
                    );
                }
                continue;
            }
            if let Err(error) = self.build_function(engine, config, &entry) {
                match error {
                    JitError::UnimplementedInstruction(mnemonic) => {
                        diagnostic(
                            engine,
                            MessageType::Warning,
                            format!(
                                "skipping {}: unimplemented instruction {mnemonic}",
                                engine.function(entry.function).name
                            ),
                        );
                    }
                    JitError::NullBytecode => {
                        diagnostic(
                            engine,
                            MessageType::Warning,
                            format!("{} has no bytecode", engine.function(entry.function).name),
                        );
                    }
                    other => return Err(other),
                }
            }
        }

        if config.verbose {
            self.dump_state();
        }

        self.state.module.finalize_definitions()?;
        self.built = true;

        // Later modules import earlier ones through the shared table.
        for symbol in &self.jit_symbols {
            let address = self.state.module.get_finalized_function(symbol.body);
            self.state.publish_symbol(&symbol.name, address);
        }
        Ok(())
    }

    fn build_function(
        &mut self,
        engine: &ScriptEngine,
        config: &JitConfig,
        entry: &PendingFunction,
    ) -> Result<(), JitError> {
        let function = engine.function(entry.function);
        if function.bytecode.is_none() {
            return Err(JitError::NullBytecode);
        }

        // Native implementation. The body symbol is declared only once
        // translation succeeds; self-recursion goes through the same cache.
        let mut ctx = self.state.module.make_context();
        ctx.func.signature = self.state.script_signature(engine, function);
        ctx.func.name = UserFuncName::user(0, function.id.0);
        let ret_offset;
        {
            let mut builder_ctx = FunctionBuilderContext::new();
            let builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
            let translator =
                FunctionTranslator::new(&mut self.state, engine, config, function, builder);
            ret_offset = translator.translate_body()?;
        }
        let body_id = self.state.get_script_function(function, engine)?;
        self.verify(engine, function, &ctx.func)?;
        self.state.module.define_function(body_id, &mut ctx)?;

        // VM entry thunk.
        let thunk_id = self.state.declare_vm_entry_thunk(function)?;
        self.state.module.clear_context(&mut ctx);
        ctx.func.signature = self.state.vm_entry_thunk_signature();
        ctx.func.name = UserFuncName::user(1, function.id.0);
        {
            let mut builder_ctx = FunctionBuilderContext::new();
            let builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
            let translator =
                FunctionTranslator::new(&mut self.state, engine, config, function, builder);
            translator.translate_vm_entry_thunk(ret_offset)?;
        }
        self.verify(engine, function, &ctx.func)?;
        self.state.module.define_function(thunk_id, &mut ctx)?;

        self.jit_symbols.push(JitSymbol {
            function: entry.function,
            name: make_function_name(function),
            entry_name: make_vm_entry_thunk_name(function),
            body: body_id,
            thunk: thunk_id,
            slot: Rc::clone(&entry.slot),
        });
        Ok(())
    }

    fn verify(
        &self,
        engine: &ScriptEngine,
        function: &ScriptFunction,
        func: &ir::Function,
    ) -> Result<(), JitError> {
        if let Err(errors) = verify_function(func, self.state.module.isa()) {
            let error = JitError::Verifier {
                function: function.name.clone(),
                message: errors.to_string(),
            };
            diagnostic(engine, MessageType::Error, format!("{error}"));
            return Err(error);
        }
        Ok(())
    }

    /// Writes every entry thunk address into its output slot and stashes
    /// the body address on the script function for the vtable helpers.
    pub fn link(&mut self, engine: &ScriptEngine) {
        if !self.built {
            return;
        }
        for symbol in &self.jit_symbols {
            let function = engine.function(symbol.function);

            let body = self.state.module.get_finalized_function(symbol.body);
            function.set_user_data(crate::common::VTABLE_USERDATA_IDENTIFIER, body as usize);

            let thunk = self.state.module.get_finalized_function(symbol.thunk);
            let entry: VmEntryFn = unsafe { std::mem::transmute(thunk) };
            symbol.slot.set(entry);
        }
    }

    fn dump_state(&self) {
        log::debug!(
            "module {:?}: {} functions, {} debug types",
            self.state.module_key,
            self.jit_symbols.len(),
            self.state.debug_types.len()
        );
        for name in &self.state.declared_names {
            log::debug!("declared '{name}'");
        }
        for symbol in &self.jit_symbols {
            log::debug!("jit symbol '{}' (thunk '{}')", symbol.name, symbol.entry_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DataType, NativeInterface, Param, TypeId};

    fn test_state() -> (ModuleState, ScriptEngine) {
        let config = JitConfig::default();
        let isa = build_isa(&config).unwrap();
        let state = ModuleState::new(isa, None, SharedSymbolTable::default(), 1).unwrap();
        (state, ScriptEngine::new())
    }

    fn native_with(conv: NativeCallConv, in_memory: bool) -> ScriptFunction {
        ScriptFunction::system(
            "native",
            DataType::value(TypeId::INT32),
            vec![Param { name: "x".into(), data_type: DataType::value(TypeId::INT32) }],
            NativeInterface { address: 0x1000, call_conv: conv, host_return_in_memory: in_memory },
        )
    }

    #[test]
    fn thiscall_sret_puts_the_hidden_pointer_first() {
        let (state, engine) = test_state();
        let function = native_with(NativeCallConv::Thiscall, true);
        let sig = state.system_signature(&engine, &function);
        // [sret][this][x], value returned through memory.
        assert_eq!(sig.params.len(), 3);
        assert_eq!(sig.params[0].purpose, ArgumentPurpose::StructReturn);
        assert!(sig.returns.is_empty());
    }

    #[test]
    fn objlast_appends_this() {
        let (state, engine) = test_state();
        let function = native_with(NativeCallConv::CdeclObjLast, false);
        let sig = state.system_signature(&engine, &function);
        // [x][this], value returned by register.
        assert_eq!(sig.params.len(), 2);
        assert_eq!(sig.params[1].value_type, state.pointer_type());
        assert_eq!(sig.returns.len(), 1);
    }

    #[test]
    fn cdecl_has_only_declared_parameters() {
        let (state, engine) = test_state();
        let function = native_with(NativeCallConv::Cdecl, false);
        let sig = state.system_signature(&engine, &function);
        assert_eq!(sig.params.len(), 1);
        assert_eq!(sig.returns.len(), 1);
    }

    #[test]
    fn readonly_declarations_are_marked_pure_when_configured() {
        let (mut state, engine) = test_state();
        let config = JitConfig { assume_const_is_pure: true, ..Default::default() };

        let mut pure = native_with(NativeCallConv::Cdecl, false);
        pure.is_read_only = true;
        let pure_id = state.get_system_function(&pure, &engine, &config).unwrap();
        assert!(state.pure_system_calls.contains(&pure_id));

        let mut plain = native_with(NativeCallConv::Cdecl, false);
        plain.id = crate::engine::FunctionId(1);
        let plain_id = state.get_system_function(&plain, &engine, &config).unwrap();
        assert!(!state.pure_system_calls.contains(&plain_id));
    }

    #[test]
    fn script_signature_orders_sret_then_this() {
        let (state, engine) = test_state();
        let mut function = ScriptFunction::script(
            "method",
            None,
            DataType::value(TypeId::INT32),
            vec![Param { name: "x".into(), data_type: DataType::value(TypeId::INT32) }],
            vec![],
            0,
            0,
        );
        function.returns_on_stack = true;
        function.object_type = Some(TypeId::FIRST_USER);

        let sig = state.script_signature(&engine, &function);
        // [stackRetPtr][thisPtr][x], nothing returned by register.
        assert_eq!(sig.params.len(), 3);
        assert!(sig.returns.is_empty());
        assert_eq!(sig.params[0].value_type, state.pointer_type());
        assert_eq!(sig.params[1].value_type, state.pointer_type());
    }

    #[test]
    fn host_target_is_a_supported_64_bit_architecture() {
        let isa = build_isa(&JitConfig::default()).unwrap();
        let info = target_info(isa.as_ref());
        assert_eq!(info.pointer_size, 8);
        assert!(matches!(info.arch, TargetArch::X86_64 | TargetArch::AArch64));
    }

    #[test]
    fn system_symbols_are_published_for_the_linker() {
        let (mut state, engine) = test_state();
        let config = JitConfig::default();
        let function = native_with(NativeCallConv::Cdecl, false);
        state.get_system_function(&function, &engine, &config).unwrap();
        let name = make_system_function_name(&function);
        assert_eq!(state.symbols.lock().get(&name).copied(), Some(0x1000));
    }
}

/// Architectures the emitted code can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    X86_64,
    AArch64,
}

/// Description of the target an ISA emits for.
#[derive(Debug, Clone, Copy)]
pub struct TargetInfo {
    pub arch: TargetArch,
    /// Pointer size in bytes.
    pub pointer_size: usize,
}

/// Introspects a built ISA: architecture and pointer width.
pub fn target_info(isa: &dyn TargetIsa) -> TargetInfo {
    let arch = match isa.triple().architecture {
        Architecture::X86_64 => TargetArch::X86_64,
        Architecture::Aarch64(_) => TargetArch::AArch64,
        _ => TargetArch::X86_64, // fallback
    };
    TargetInfo { arch, pointer_size: isa.pointer_bytes() as usize }
}

/// Builds the ISA the compiler emits for, per the configuration.
pub fn build_isa(config: &JitConfig) -> Result<Arc<dyn TargetIsa>, JitError> {
    let mut flags = settings::builder();
    let opt_level = if config.allow_optimizations { "speed" } else { "none" };
    flags
        .set("opt_level", opt_level)
        .map_err(|e| JitError::Backend(format!("failed to set opt_level: {e}")))?;
    flags
        .set("is_pic", "false")
        .map_err(|e| JitError::Backend(format!("failed to set is_pic: {e}")))?;
    flags
        .set("enable_verifier", "true")
        .map_err(|e| JitError::Backend(format!("failed to set enable_verifier: {e}")))?;

    let isa = cranelift_native::builder()
        .map_err(|e| JitError::Backend(format!("failed to create native ISA builder: {e}")))?
        .finish(settings::Flags::new(flags))
        .map_err(|e| JitError::Backend(format!("failed to finish ISA: {e}")))?;
    Ok(isa)
}
