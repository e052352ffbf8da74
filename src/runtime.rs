//! C-callable runtime helpers referenced by emitted code, plus the VM
//! register file layout shared with the interpreter.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::common::VTABLE_USERDATA_IDENTIFIER;
use crate::engine::{NativeCallConv, ObjectType, ScriptFunction};

/// The interpreter's register file, passed to every VM entry thunk.
///
/// Field order and layout are part of the ABI contract with the engine:
/// offsets 0/8/16/24/32/40/48/56 on the documented 64-bit target.
#[repr(C)]
pub struct VmRegisters {
    pub program_pointer: *mut u32,
    pub stack_frame_pointer: *mut u32,
    pub stack_pointer: *mut u32,
    pub value_register: u64,
    pub object_register: *mut u8,
    pub object_type: *mut u8,
    pub do_process_suspend: bool,
    pub ctx: *mut u8,
}

/// Signature of a VM entry thunk published into a [`FnPtrSlot`].
pub type VmEntryFn = unsafe extern "C" fn(*mut VmRegisters, i64);

/// Engine-provided output slot for one compiled function.
#[derive(Default)]
pub struct FnPtrSlot {
    entry: Cell<Option<VmEntryFn>>,
}

impl FnPtrSlot {
    pub fn new() -> Self {
        FnPtrSlot::default()
    }

    pub fn get(&self) -> Option<VmEntryFn> {
        self.entry.get()
    }

    pub(crate) fn set(&self, entry: VmEntryFn) {
        self.entry.set(Some(entry));
    }
}

/// Internal exception kind recorded on the current context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VmState {
    Ok = 0,
    ExceptionExternal = 1,
    ExceptionNullPointer = 2,
}

thread_local! {
    static CURRENT_VM_STATE: Cell<VmState> = const { Cell::new(VmState::Ok) };
}

/// Reads and clears the internal exception state of the current context.
pub fn take_internal_exception() -> VmState {
    CURRENT_VM_STATE.with(|state| state.replace(VmState::Ok))
}

// Engine-global allocator hooks. Zero means "use the default allocator".
static ALLOC_HOOK: AtomicUsize = AtomicUsize::new(0);
static FREE_HOOK: AtomicUsize = AtomicUsize::new(0);

pub type AllocFn = unsafe extern "C" fn(usize) -> *mut u8;
pub type FreeFn = unsafe extern "C" fn(*mut u8);

/// Overrides the allocator the runtime helpers route through, process-wide.
pub fn set_global_memory_functions(alloc: AllocFn, free: FreeFn) {
    ALLOC_HOOK.store(alloc as usize, Ordering::SeqCst);
    FREE_HOOK.store(free as usize, Ordering::SeqCst);
}

// The default allocator keeps the allocation size in a 16-byte header so
// `free` does not need one.
const HEADER_SIZE: usize = 16;

unsafe extern "C" fn default_alloc(size: usize) -> *mut u8 {
    let layout = std::alloc::Layout::from_size_align_unchecked(size + HEADER_SIZE, 16);
    let base = std::alloc::alloc(layout);
    if base.is_null() {
        std::alloc::handle_alloc_error(layout);
    }
    (base as *mut usize).write(size);
    base.add(HEADER_SIZE)
}

unsafe extern "C" fn default_free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let base = ptr.sub(HEADER_SIZE);
    let size = (base as *const usize).read();
    let layout = std::alloc::Layout::from_size_align_unchecked(size + HEADER_SIZE, 16);
    std::alloc::dealloc(base, layout);
}

/// Header at the start of every script object instance.
#[repr(C)]
pub struct ScriptObjectHeader {
    pub object_type: *const ObjectType,
    pub ref_count: i32,
}

/// `asjit.private.alloc` — engine allocator; never returns null (matches
/// engine behavior: allocation failure aborts).
pub unsafe extern "C" fn jit_alloc(size: usize) -> *mut u8 {
    let hook = ALLOC_HOOK.load(Ordering::Relaxed);
    if hook == 0 {
        default_alloc(size)
    } else {
        let alloc: AllocFn = std::mem::transmute(hook);
        alloc(size)
    }
}

/// `asjit.private.free`.
pub unsafe extern "C" fn jit_free(ptr: *mut u8) {
    let hook = FREE_HOOK.load(Ordering::Relaxed);
    if hook == 0 {
        default_free(ptr)
    } else {
        let free: FreeFn = std::mem::transmute(hook);
        free(ptr)
    }
}

/// `asjit.private.new_script_object` — allocates a script class instance
/// and runs its zero-initializing constructor.
pub unsafe extern "C" fn jit_new_script_object(object_type: *const ObjectType) -> *mut u8 {
    let size = (*object_type).size as usize;
    let object = jit_alloc(size);
    std::ptr::write_bytes(object, 0, size);
    (object as *mut ScriptObjectHeader)
        .write(ScriptObjectHeader { object_type, ref_count: 1 });
    object
}

/// `asjit.private.script_vtable_lookup` — returns the JITted body address
/// of the virtual override of `function` on `object`.
pub unsafe extern "C" fn jit_script_vtable_lookup(
    object: *mut u8,
    function: *const ScriptFunction,
) -> *const u8 {
    let header = &*(object as *const ScriptObjectHeader);
    let object_type = &*header.object_type;
    let function = &*function;
    crate::internal_assert!(
        function.vf_table_idx >= 0,
        "script_vtable_lookup on non-virtual function {}",
        function.name
    );
    let target = object_type.vtable[function.vf_table_idx as usize];
    match (*target).user_data(VTABLE_USERDATA_IDENTIFIER) {
        Some(address) => address as *const u8,
        None => crate::internal_error!(
            "no JIT entry registered for virtual override of {}",
            function.name
        ),
    }
}

/// `asjit.private.system_vtable_lookup` — native vtable probe.
#[cfg(all(target_arch = "x86_64", unix))]
pub unsafe extern "C" fn jit_system_vtable_lookup(object: *mut u8, slot: usize) -> *const u8 {
    let vtable = *(object as *const *const *const u8);
    *vtable.add(slot >> 3)
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
pub unsafe extern "C" fn jit_system_vtable_lookup(_object: *mut u8, _slot: usize) -> *const u8 {
    unimplemented!("native vtable lookups are only supported on x86-64 System V")
}

/// `asjit.private.call_object_method` — trampoline used for refcount and
/// destructor behaviours: invokes an engine-registered method on `object`.
pub unsafe extern "C" fn jit_call_object_method(object: *mut u8, function: *const ScriptFunction) {
    let function = &*function;
    let Some(intf) = function.native else {
        crate::internal_error!("call_object_method on non-system function {}", function.name);
    };
    match intf.call_conv {
        NativeCallConv::Thiscall
        | NativeCallConv::CdeclObjFirst
        | NativeCallConv::CdeclObjLast => {
            let method: unsafe extern "C" fn(*mut u8) = std::mem::transmute(intf.address);
            method(object);
        }
        NativeCallConv::VirtualThiscall => {
            let target = jit_system_vtable_lookup(object, intf.address);
            let method: unsafe extern "C" fn(*mut u8) = std::mem::transmute(target);
            method(object);
        }
        NativeCallConv::Cdecl => {
            crate::internal_error!("call_object_method with cdecl function {}", function.name)
        }
    }
}

/// `fmodf` — float remainder for `MODf`.
pub extern "C" fn jit_fmodf(lhs: f32, rhs: f32) -> f32 {
    lhs % rhs
}

/// `fmod` — float remainder for `MODd`.
pub extern "C" fn jit_fmod(lhs: f64, rhs: f64) -> f64 {
    lhs % rhs
}

/// `asjit.private.panic`.
pub extern "C" fn jit_panic() -> ! {
    log::error!("jit runtime panic");
    std::process::abort()
}

/// `asjit.private.set_internal_exception`.
pub extern "C" fn jit_set_internal_exception(state: u8) {
    let state = match state {
        0 => VmState::Ok,
        1 => VmState::ExceptionExternal,
        _ => VmState::ExceptionNullPointer,
    };
    CURRENT_VM_STATE.with(|cell| cell.set(state));
}
