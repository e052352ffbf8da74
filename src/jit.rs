//! Engine-facing JIT compiler: accepts functions, batches them per script
//! module, and drives build and link.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use cranelift_codegen::isa::TargetIsa;
use rustc_hash::FxHashMap;

use crate::assembler::{
    build_isa, target_info, ModuleAssembler, PendingFunction, SharedSymbolTable, TargetInfo,
};
use crate::common::diagnostic;
use crate::config::JitConfig;
use crate::engine::{FunctionId, MessageType, ScriptEngine};
use crate::error::JitError;
use crate::runtime::{FnPtrSlot, VmEntryFn};

/// One compilation session, tied to one engine instance for its lifetime.
///
/// `compile` only enqueues; nothing is emitted until `build_all`, so every
/// function enqueued before the build is visible in the same module and
/// can cross-reference directly.
pub struct JitCompiler {
    isa: Arc<dyn TargetIsa>,
    config: JitConfig,
    symbols: SharedSymbolTable,
    engine_identity: Cell<Option<*const ScriptEngine>>,
    assemblers: FxHashMap<Option<String>, ModuleAssembler>,
    /// Built modules own their executable code for the process lifetime.
    retained: Vec<ModuleAssembler>,
}

impl JitCompiler {
    pub fn new(config: JitConfig) -> Result<Self, JitError> {
        let isa = build_isa(&config)?;
        // The stack model and the VM register file layout assume a 64-bit
        // target; narrower pointers need their own ABI description.
        let info = target_info(isa.as_ref());
        if info.pointer_size != 8 {
            return Err(JitError::Backend(format!(
                "unsupported target: {}-byte pointers",
                info.pointer_size
            )));
        }
        Ok(JitCompiler {
            isa,
            config,
            symbols: SharedSymbolTable::default(),
            engine_identity: Cell::new(None),
            assemblers: FxHashMap::default(),
            retained: Vec::new(),
        })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Architecture and pointer width of the target the compiler emits for.
    pub fn target_info(&self) -> TargetInfo {
        target_info(self.isa.as_ref())
    }

    /// Token patched into `JitEntry` arguments; stable for this compiler.
    fn jit_token(&self) -> u64 {
        Arc::as_ptr(&self.symbols) as u64
    }

    fn check_engine(&self, engine: &ScriptEngine) -> Result<(), JitError> {
        let identity = engine as *const ScriptEngine;
        match self.engine_identity.get() {
            None => {
                self.engine_identity.set(Some(identity));
                Ok(())
            }
            Some(known) if known == identity => Ok(()),
            Some(_) => {
                diagnostic(
                    engine,
                    MessageType::Error,
                    "function belongs to a different engine instance",
                );
                Err(JitError::EngineMismatch)
            }
        }
    }

    /// Accepts a function for compilation. A function with no bytecode is
    /// reported as a warning and its slot is left untouched.
    pub fn compile(
        &mut self,
        engine: &ScriptEngine,
        function: FunctionId,
        slot: Rc<FnPtrSlot>,
    ) -> Result<(), JitError> {
        self.check_engine(engine)?;

        let target = engine.function(function);
        if target.bytecode.is_none() {
            diagnostic(
                engine,
                MessageType::Warning,
                format!("{} has no bytecode to compile", target.name),
            );
            return Ok(());
        }

        let key = target.module.clone();
        if !self.assemblers.contains_key(&key) {
            let assembler = ModuleAssembler::new(
                self.isa.clone(),
                key.clone(),
                self.symbols.clone(),
                self.jit_token(),
            )?;
            self.assemblers.insert(key.clone(), assembler);
        }
        match self.assemblers.get_mut(&key) {
            Some(assembler) => assembler.append(PendingFunction { function, slot }),
            None => crate::internal_error!("assembler vanished for module {key:?}"),
        }
        Ok(())
    }

    /// Releases a published function pointer. The JIT linker retains code
    /// for the process lifetime, so this is a no-op.
    pub fn release_jit(&mut self, _entry: VmEntryFn) {}

    /// Builds every pending function, links, and populates every slot.
    /// Module failures are reported through the engine message callback;
    /// other modules still build.
    pub fn build_all(&mut self, engine: &ScriptEngine) {
        if self.check_engine(engine).is_err() {
            return;
        }

        let mut assemblers: Vec<(Option<String>, ModuleAssembler)> =
            self.assemblers.drain().collect();
        // Shared module first, then script modules in name order.
        assemblers.sort_by(|a, b| a.0.cmp(&b.0));

        for (_key, assembler) in &mut assemblers {
            if let Err(error) = assembler.build(engine, &self.config) {
                diagnostic(engine, MessageType::Error, format!("module build failed: {error}"));
            }
        }
        for (_key, assembler) in &mut assemblers {
            assembler.link(engine);
        }
        self.retained.extend(assemblers.into_iter().map(|(_, assembler)| assembler));
    }
}
