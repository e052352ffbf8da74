//! End-to-end JIT tests: hand-assembled bytecode through the full
//! pipeline (two-pass translation, module build, link) into native
//! execution, both by direct native calls and through the VM entry thunk.

use std::cell::RefCell;
use std::rc::Rc;

use asjit::bytecode::Opcode;
use asjit::common::VTABLE_USERDATA_IDENTIFIER;
use asjit::engine::{
    DataType, FunctionId, FunctionKind, MessageType, NativeCallConv, NativeInterface, ObjectType,
    Param, ScriptEngine, ScriptFunction, TypeFlags, TypeId,
};
use asjit::runtime::{jit_new_script_object, VmRegisters};
use asjit::{FnPtrSlot, JitCompiler, JitConfig};

// ============================================================================
// Bytecode assembly helpers
// ============================================================================

fn w(op: Opcode, sword0: i16) -> u32 {
    (op as u32) | ((sword0 as u16 as u32) << 16)
}

fn op(code: &mut Vec<u32>, op_: Opcode) {
    code.push(w(op_, 0));
}

fn op_w(code: &mut Vec<u32>, op_: Opcode, sword0: i16) {
    code.push(w(op_, sword0));
}

fn op_dw(code: &mut Vec<u32>, op_: Opcode, dword: u32) {
    code.push(w(op_, 0));
    code.push(dword);
}

fn op_w_dw(code: &mut Vec<u32>, op_: Opcode, sword0: i16, dword: u32) {
    code.push(w(op_, sword0));
    code.push(dword);
}

fn op_w_qw(code: &mut Vec<u32>, op_: Opcode, sword0: i16, qword: u64) {
    code.push(w(op_, sword0));
    code.push(qword as u32);
    code.push((qword >> 32) as u32);
}

fn op_ww(code: &mut Vec<u32>, op_: Opcode, sword0: i16, sword1: i16) {
    code.push(w(op_, sword0));
    code.push(sword1 as u16 as u32);
}

fn op_www(code: &mut Vec<u32>, op_: Opcode, dest: i16, lhs: i16, rhs: i16) {
    code.push(w(op_, dest));
    code.push((lhs as u16 as u32) | ((rhs as u16 as u32) << 16));
}

fn op_wwd(code: &mut Vec<u32>, op_: Opcode, dest: i16, src: i16, dword: u32) {
    code.push(w(op_, dest));
    code.push(src as u16 as u32);
    code.push(dword);
}

fn jump(code: &mut Vec<u32>, op_: Opcode, displacement: i32) {
    code.push(w(op_, 0));
    code.push(displacement as u32);
}

fn int_param(name: &str) -> Param {
    Param { name: name.into(), data_type: DataType::value(TypeId::INT32) }
}

// ============================================================================
// Build-and-call helpers
// ============================================================================

struct Built {
    _compiler: JitCompiler,
    slots: Vec<Rc<FnPtrSlot>>,
    bodies: Vec<usize>,
}

/// Compiles every listed function with the given config and returns the
/// published thunk slots plus the native body addresses.
fn build(engine: &ScriptEngine, config: JitConfig, functions: &[FunctionId]) -> Built {
    let mut compiler = JitCompiler::new(config).unwrap();
    let slots: Vec<Rc<FnPtrSlot>> =
        functions.iter().map(|_| Rc::new(FnPtrSlot::new())).collect();
    for (&id, slot) in functions.iter().zip(&slots) {
        compiler.compile(engine, id, Rc::clone(slot)).unwrap();
    }
    compiler.build_all(engine);

    let bodies = functions
        .iter()
        .map(|&id| {
            engine
                .function(id)
                .user_data(VTABLE_USERDATA_IDENTIFIER)
                .expect("function body was linked")
        })
        .collect();
    Built { _compiler: compiler, slots, bodies }
}

fn build_one(engine: &ScriptEngine, function: FunctionId) -> Built {
    build(engine, JitConfig::default(), &[function])
}

// ============================================================================
// Native execution — constants, arithmetic, registers
// ============================================================================

#[test]
fn constant_return() {
    // int f() { return 42; }
    let mut code = Vec::new();
    op_w_dw(&mut code, Opcode::SetV4, 1, 42);
    op_w(&mut code, Opcode::CpyVtoR4, 1);
    op_w(&mut code, Opcode::Ret, 0);

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "f",
        Some("scripts"),
        DataType::value(TypeId::INT32),
        vec![],
        code,
        1,
        1,
    ));

    let built = build_one(&engine, id);
    let f: unsafe extern "C" fn() -> i32 = unsafe { std::mem::transmute(built.bodies[0]) };
    assert_eq!(unsafe { f() }, 42);
}

#[test]
fn parameter_addition() {
    // int add(int a, int b) { return a + b; }
    let mut code = Vec::new();
    op_www(&mut code, Opcode::AddI, 1, 0, -1);
    op_w(&mut code, Opcode::CpyVtoR4, 1);
    op_w(&mut code, Opcode::Ret, 2);

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "add",
        Some("scripts"),
        DataType::value(TypeId::INT32),
        vec![int_param("a"), int_param("b")],
        code,
        1,
        1,
    ));

    let built = build_one(&engine, id);
    let add: unsafe extern "C" fn(i32, i32) -> i32 =
        unsafe { std::mem::transmute(built.bodies[0]) };
    assert_eq!(unsafe { add(3, 5) }, 8);
    assert_eq!(unsafe { add(-2, 7) }, 5);
    assert_eq!(unsafe { add(i32::MAX, 1) }, i32::MIN);
}

#[test]
fn compare_and_test_opcodes() {
    // int gt(int a, int b) { return a > b; }
    let mut code = Vec::new();
    op_ww(&mut code, Opcode::CmpI, 0, -1);
    op(&mut code, Opcode::Tp);
    op_w(&mut code, Opcode::Ret, 2);

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "gt",
        Some("scripts"),
        DataType::value(TypeId::INT32),
        vec![int_param("a"), int_param("b")],
        code,
        0,
        0,
    ));

    let built = build_one(&engine, id);
    let gt: unsafe extern "C" fn(i32, i32) -> i32 =
        unsafe { std::mem::transmute(built.bodies[0]) };
    // int a=15, b=16: a > b is false.
    assert_eq!(unsafe { gt(15, 16) }, 0);
    assert_eq!(unsafe { gt(16, 15) }, 1);
    assert_eq!(unsafe { gt(5, 5) }, 0);
}

#[test]
fn int8_wraparound_signed() {
    // int8(1) + int8(-2) == -1
    let mut code = Vec::new();
    op_w_dw(&mut code, Opcode::SetV4, 1, 1);
    op_w_dw(&mut code, Opcode::SetV4, 2, (-2i32) as u32);
    op_www(&mut code, Opcode::AddI, 1, 1, 2);
    op_w(&mut code, Opcode::ItoB, 1);
    op_w(&mut code, Opcode::SbToI, 1);
    op_w(&mut code, Opcode::CpyVtoR4, 1);
    op_w(&mut code, Opcode::Ret, 0);

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "sum8",
        Some("scripts"),
        DataType::value(TypeId::INT8),
        vec![],
        code,
        2,
        2,
    ));

    let built = build_one(&engine, id);
    let f: unsafe extern "C" fn() -> i8 = unsafe { std::mem::transmute(built.bodies[0]) };
    assert_eq!(unsafe { f() }, -1);
}

#[test]
fn uint8_wraparound() {
    // uint8(1) + uint8(254) == 255
    let mut code = Vec::new();
    op_w_dw(&mut code, Opcode::SetV4, 1, 1);
    op_w_dw(&mut code, Opcode::SetV4, 2, 254);
    op_www(&mut code, Opcode::AddI, 1, 1, 2);
    op_w(&mut code, Opcode::ItoB, 1);
    op_w(&mut code, Opcode::UbToI, 1);
    op_w(&mut code, Opcode::CpyVtoR4, 1);
    op_w(&mut code, Opcode::Ret, 0);

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "sumu8",
        Some("scripts"),
        DataType::value(TypeId::INT32),
        vec![],
        code,
        2,
        2,
    ));

    let built = build_one(&engine, id);
    let f: unsafe extern "C" fn() -> i32 = unsafe { std::mem::transmute(built.bodies[0]) };
    assert_eq!(unsafe { f() }, 255);
}

#[test]
fn float_division() {
    // float a = 5.0f, b = 2.0f; return a / b;
    let mut code = Vec::new();
    op_w_dw(&mut code, Opcode::SetV4, 1, 5.0f32.to_bits());
    op_w_dw(&mut code, Opcode::SetV4, 2, 2.0f32.to_bits());
    op_www(&mut code, Opcode::DivF, 1, 1, 2);
    op_w(&mut code, Opcode::CpyVtoR4, 1);
    op_w(&mut code, Opcode::Ret, 0);

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "fdiv",
        Some("scripts"),
        DataType::value(TypeId::FLOAT),
        vec![],
        code,
        2,
        2,
    ));

    let built = build_one(&engine, id);
    let f: unsafe extern "C" fn() -> f32 = unsafe { std::mem::transmute(built.bodies[0]) };
    assert_eq!(unsafe { f() }, 2.5);
}

#[test]
fn int64_constants_and_moves() {
    let mut code = Vec::new();
    op_w_qw(&mut code, Opcode::SetV8, 2, 0x1_0000_0001);
    op_w(&mut code, Opcode::CpyVtoR8, 2);
    op_w(&mut code, Opcode::Ret, 0);

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "big",
        Some("scripts"),
        DataType::value(TypeId::INT64),
        vec![],
        code,
        2,
        2,
    ));

    let built = build_one(&engine, id);
    let f: unsafe extern "C" fn() -> i64 = unsafe { std::mem::transmute(built.bodies[0]) };
    assert_eq!(unsafe { f() }, 0x1_0000_0001);
}

#[test]
fn float_to_int_cast() {
    // int trunc(float x) { return int(x); }
    let mut code = Vec::new();
    op_ww(&mut code, Opcode::CpyVtoV4, 1, 0);
    op_w(&mut code, Opcode::FtoI, 1);
    op_w(&mut code, Opcode::CpyVtoR4, 1);
    op_w(&mut code, Opcode::Ret, 1);

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "trunc",
        Some("scripts"),
        DataType::value(TypeId::INT32),
        vec![Param { name: "x".into(), data_type: DataType::value(TypeId::FLOAT) }],
        code,
        1,
        1,
    ));

    let built = build_one(&engine, id);
    let f: unsafe extern "C" fn(f32) -> i32 = unsafe { std::mem::transmute(built.bodies[0]) };
    assert_eq!(unsafe { f(3.7) }, 3);
    assert_eq!(unsafe { f(-1.2) }, -1);
}

#[test]
fn value_register_indirection() {
    // LDV/WRTV4/RDR4: write a variable through the value register, then
    // read it back the same way.
    let mut code = Vec::new();
    op_w_dw(&mut code, Opcode::SetV4, 1, 7);
    op_w_dw(&mut code, Opcode::SetV4, 2, 99);
    op_w(&mut code, Opcode::Ldv, 1);
    op_w(&mut code, Opcode::WrtV4, 2);
    op_w(&mut code, Opcode::Ldv, 1);
    op_w(&mut code, Opcode::RdR4, 3);
    op_w(&mut code, Opcode::CpyVtoR4, 3);
    op_w(&mut code, Opcode::Ret, 0);

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "indirect",
        Some("scripts"),
        DataType::value(TypeId::INT32),
        vec![],
        code,
        3,
        3,
    ));

    let built = build_one(&engine, id);
    let f: unsafe extern "C" fn() -> i32 = unsafe { std::mem::transmute(built.bodies[0]) };
    assert_eq!(unsafe { f() }, 99);
}

#[test]
fn global_variable_round_trip() {
    // CpyGtoV4 / IncVi / CpyVtoG4 against an engine-owned global.
    let global: &'static mut u32 = Box::leak(Box::new(41));
    let address = global as *mut u32 as u64;

    let mut code = Vec::new();
    op_w_qw(&mut code, Opcode::CpyGtoV4, 1, address);
    op_w(&mut code, Opcode::IncVi, 1);
    op_w_qw(&mut code, Opcode::CpyVtoG4, 1, address);
    op_w(&mut code, Opcode::Ret, 0);

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "bump_global",
        Some("scripts"),
        DataType::void(),
        vec![],
        code,
        1,
        1,
    ));

    let built = build_one(&engine, id);
    let f: unsafe extern "C" fn() = unsafe { std::mem::transmute(built.bodies[0]) };
    unsafe { f() };
    assert_eq!(*global, 42);
}

// ============================================================================
// Control flow
// ============================================================================

#[test]
fn loop_accumulates() {
    // int sum() { s = 0; for (i = 0; i < 5; ++i) s += i; return s; }
    let mut code = Vec::new();
    op_w_dw(&mut code, Opcode::SetV4, 1, 0); // 0: s = 0
    op_w_dw(&mut code, Opcode::SetV4, 2, 0); // 2: i = 0
    jump(&mut code, Opcode::Jmp, 3); //         4: -> 9
    op_www(&mut code, Opcode::AddI, 1, 1, 2); // 6: s += i
    op_w(&mut code, Opcode::IncVi, 2); //       8: ++i
    op_w_dw(&mut code, Opcode::CmpIi, 2, 5); // 9: compare i, 5
    jump(&mut code, Opcode::Js, -7); //         11: i < 5 -> 6
    op_w(&mut code, Opcode::CpyVtoR4, 1); //    13
    op_w(&mut code, Opcode::Ret, 0); //         14

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "sum",
        Some("scripts"),
        DataType::value(TypeId::INT32),
        vec![],
        code,
        2,
        2,
    ));

    let built = build_one(&engine, id);
    let f: unsafe extern "C" fn() -> i32 = unsafe { std::mem::transmute(built.bodies[0]) };
    assert_eq!(unsafe { f() }, 10);
}

#[test]
fn jump_table_switch() {
    // switch (x) { case 0: 10; case 1: 20; default: 30 }
    let mut code = Vec::new();
    op_w(&mut code, Opcode::JmpP, 0); //     0
    jump(&mut code, Opcode::Jmp, 4); //      1: case 0 -> 7
    jump(&mut code, Opcode::Jmp, 6); //      3: case 1 -> 11
    jump(&mut code, Opcode::Jmp, 8); //      5: case 2 -> 15
    op_w_dw(&mut code, Opcode::SetV4, 1, 10); // 7
    op_w(&mut code, Opcode::CpyVtoR4, 1); //     9
    op_w(&mut code, Opcode::Ret, 1); //          10
    op_w_dw(&mut code, Opcode::SetV4, 1, 20); // 11
    op_w(&mut code, Opcode::CpyVtoR4, 1); //     13
    op_w(&mut code, Opcode::Ret, 1); //          14
    op_w_dw(&mut code, Opcode::SetV4, 1, 30); // 15
    op_w(&mut code, Opcode::CpyVtoR4, 1); //     17
    op_w(&mut code, Opcode::Ret, 1); //          18

    let mut engine = ScriptEngine::new();
    let id = engine.register_function(ScriptFunction::script(
        "select",
        Some("scripts"),
        DataType::value(TypeId::INT32),
        vec![int_param("x")],
        code,
        1,
        1,
    ));

    let built = build_one(&engine, id);
    let f: unsafe extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(built.bodies[0]) };
    assert_eq!(unsafe { f(0) }, 10);
    assert_eq!(unsafe { f(1) }, 20);
    assert_eq!(unsafe { f(2) }, 30);
    // Out-of-range indices take the default, which the VM routes to the
    // last case.
    assert_eq!(unsafe { f(17) }, 30);
}

// ============================================================================
// Calls
// ============================================================================

thread_local! {
    static PRINTED: RefCell<Vec<i32>> = const { RefCell::new(Vec::new()) };
}

extern "C" fn print_i32(value: i32) {
    PRINTED.with(|sink| sink.borrow_mut().push(value));
}

#[test]
fn system_call_loop_prints_in_order() {
    // for (int i = 0; i < 5; ++i) print(i);
    let mut engine = ScriptEngine::new();
    let print_id = engine.register_function(ScriptFunction::system(
        "print",
        DataType::void(),
        vec![int_param("value")],
        NativeInterface {
            address: print_i32 as usize,
            call_conv: NativeCallConv::Cdecl,
            host_return_in_memory: false,
        },
    ));

    let mut code = Vec::new();
    op_w_dw(&mut code, Opcode::SetV4, 1, 0); //      0: i = 0
    op_w_dw(&mut code, Opcode::CmpIi, 1, 5); //      2: compare i, 5
    jump(&mut code, Opcode::Jns, 6); //              4: i >= 5 -> 12
    op_w(&mut code, Opcode::PshV4, 1); //            6
    op_dw(&mut code, Opcode::CallSys, print_id.0); // 7
    op_w(&mut code, Opcode::IncVi, 1); //            9
    jump(&mut code, Opcode::Jmp, -10); //            10: -> 2
    op_w(&mut code, Opcode::Ret, 0); //              12

    let loop_id = engine.register_function(ScriptFunction::script(
        "print_loop",
        Some("scripts"),
        DataType::void(),
        vec![],
        code,
        1,
        2,
    ));

    let built = build(&engine, JitConfig::default(), &[loop_id]);
    let f: unsafe extern "C" fn() = unsafe { std::mem::transmute(built.bodies[0]) };
    PRINTED.with(|sink| sink.borrow_mut().clear());
    unsafe { f() };
    PRINTED.with(|sink| assert_eq!(*sink.borrow(), vec![0, 1, 2, 3, 4]));
}

extern "C" fn counter_increment(counter: *mut u64) {
    unsafe { *counter += 1 };
}

#[test]
fn thiscall_system_method() {
    let mut engine = ScriptEngine::new();
    let counter_type =
        engine.register_object_type(ObjectType::new("Counter", 8, TypeFlags::REF | TypeFlags::NOCOUNT));
    let inc_id = engine.register_function(ScriptFunction::system(
        "increment",
        DataType::void(),
        vec![],
        NativeInterface {
            address: counter_increment as usize,
            call_conv: NativeCallConv::Thiscall,
            host_return_in_memory: false,
        },
    ));

    // void bump(Counter@ c) { c.increment(); }
    let mut code = Vec::new();
    op_w(&mut code, Opcode::PshVPtr, 0);
    op_dw(&mut code, Opcode::CallSys, inc_id.0);
    op_w(&mut code, Opcode::Ret, 2);

    let bump_id = engine.register_function(ScriptFunction::script(
        "bump",
        Some("scripts"),
        DataType::void(),
        vec![Param { name: "c".into(), data_type: DataType::handle(counter_type) }],
        code,
        0,
        2,
    ));

    let built = build_one(&engine, bump_id);
    let bump: unsafe extern "C" fn(*mut u64) = unsafe { std::mem::transmute(built.bodies[0]) };
    let mut counter = 7u64;
    unsafe { bump(&mut counter) };
    assert_eq!(counter, 8);
}

fn register_fib(engine: &mut ScriptEngine) -> FunctionId {
    // int fib(int n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); }
    let fib_id = engine.function_count() as u32;

    let mut code = Vec::new();
    op_w_dw(&mut code, Opcode::CmpIi, 0, 2); //        0
    jump(&mut code, Opcode::Jns, 2); //                2: n >= 2 -> 6
    op_w(&mut code, Opcode::CpyVtoR4, 0); //           4
    op_w(&mut code, Opcode::Ret, 1); //                5
    op_wwd(&mut code, Opcode::AddIi, 1, 0, (-1i32) as u32); // 6: v1 = n - 1
    op_w(&mut code, Opcode::PshV4, 1); //              9
    op_dw(&mut code, Opcode::Call, fib_id); //         10
    op_w(&mut code, Opcode::CpyRtoV4, 1); //           12
    op_wwd(&mut code, Opcode::AddIi, 2, 0, (-2i32) as u32); // 13: v2 = n - 2
    op_w(&mut code, Opcode::PshV4, 2); //              16
    op_dw(&mut code, Opcode::Call, fib_id); //         17
    op_w(&mut code, Opcode::CpyRtoV4, 2); //           19
    op_www(&mut code, Opcode::AddI, 1, 1, 2); //       20
    op_w(&mut code, Opcode::CpyVtoR4, 1); //           22
    op_w(&mut code, Opcode::Ret, 1); //                23

    engine.register_function(ScriptFunction::script(
        "fib",
        Some("scripts"),
        DataType::value(TypeId::INT32),
        vec![int_param("n")],
        code,
        2,
        3,
    ))
}

#[test]
fn recursive_fib_native_call() {
    let mut engine = ScriptEngine::new();
    let fib_id = register_fib(&mut engine);

    let built = build_one(&engine, fib_id);
    let fib: unsafe extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(built.bodies[0]) };
    assert_eq!(unsafe { fib(1) }, 1);
    assert_eq!(unsafe { fib(10) }, 55);
    assert_eq!(unsafe { fib(20) }, 6765);
    assert_eq!(unsafe { fib(25) }, 75025);
}

#[test]
fn vm_entry_thunk_round_trip() {
    let mut engine = ScriptEngine::new();
    let fib_id = register_fib(&mut engine);

    let built = build_one(&engine, fib_id);
    let entry = built.slots[0].get().expect("thunk was published");

    // Simulated interpreter frame: the single i32 argument sits at the
    // frame pointer, read downward.
    let mut frame = vec![0u32; 16];
    frame[8] = 10;
    let mut regs = VmRegisters {
        program_pointer: std::ptr::null_mut(),
        stack_frame_pointer: unsafe { frame.as_mut_ptr().add(8) },
        stack_pointer: std::ptr::null_mut(),
        value_register: 0,
        object_register: std::ptr::null_mut(),
        object_type: std::ptr::null_mut(),
        do_process_suspend: false,
        ctx: std::ptr::null_mut(),
    };

    unsafe { entry(&mut regs, 0) };

    assert_eq!(regs.value_register as u32, 55);
    // The thunk must leave the interpreter at the RET instruction.
    let ret_address = engine.function(fib_id).bytecode.as_ref().unwrap().word_address(23);
    assert_eq!(regs.program_pointer as *const u32, ret_address);
}

// ============================================================================
// Virtual calls and devirtualization
// ============================================================================

fn register_widget(engine: &mut ScriptEngine, sink: u64) -> (TypeId, FunctionId, FunctionId) {
    // class Widget { void poke() { g_sink = 7; } }
    let widget = engine.register_object_type(ObjectType::new(
        "Widget",
        16,
        TypeFlags::SCRIPT_OBJECT | TypeFlags::NOINHERIT,
    ));

    let mut poke_code = Vec::new();
    // QwordDword: pointer argument then the stored value.
    poke_code.push(w(Opcode::SetG4, 0));
    poke_code.push(sink as u32);
    poke_code.push((sink >> 32) as u32);
    poke_code.push(7);
    op_w(&mut poke_code, Opcode::Ret, 2);

    let mut poke = ScriptFunction::script(
        "poke",
        Some("scripts"),
        DataType::void(),
        vec![],
        poke_code,
        0,
        0,
    );
    poke.object_type = Some(widget);
    let poke_id = engine.register_function(poke);

    let mut stub = ScriptFunction::script(
        "poke",
        Some("scripts"),
        DataType::void(),
        vec![],
        vec![],
        0,
        0,
    );
    stub.kind = FunctionKind::Virtual;
    stub.object_type = Some(widget);
    stub.vf_table_idx = 0;
    stub.bytecode = None;
    let stub_id = engine.register_function(stub);

    engine.set_virtual_table(widget, &[poke_id]);
    (widget, poke_id, stub_id)
}

fn register_poke_caller(
    engine: &mut ScriptEngine,
    widget: TypeId,
    stub_id: FunctionId,
) -> FunctionId {
    // void call_poke(Widget@ w) { w.poke(); }
    let mut code = Vec::new();
    op_w(&mut code, Opcode::PshVPtr, 0);
    op_dw(&mut code, Opcode::CallIntf, stub_id.0);
    op_w(&mut code, Opcode::Ret, 2);

    engine.register_function(ScriptFunction::script(
        "call_poke",
        Some("scripts"),
        DataType::void(),
        vec![Param { name: "w".into(), data_type: DataType::handle(widget) }],
        code,
        0,
        2,
    ))
}

#[test]
fn virtual_call_devirtualizes_when_final() {
    let sink: &'static mut u32 = Box::leak(Box::new(0));
    let sink_address = sink as *mut u32 as u64;

    let mut engine = ScriptEngine::new();
    let (widget, poke_id, stub_id) = register_widget(&mut engine, sink_address);
    engine.set_method_list(widget, &[poke_id]);
    let caller_id = register_poke_caller(&mut engine, widget, stub_id);

    let messages = Rc::new(RefCell::new(Vec::new()));
    let collected = Rc::clone(&messages);
    engine.set_message_callback(move |_kind, text| collected.borrow_mut().push(text.to_owned()));

    let config = JitConfig { verbose: true, ..Default::default() };
    let built = build(&engine, config, &[caller_id, poke_id]);

    let call_poke: unsafe extern "C" fn(*mut u8) = unsafe { std::mem::transmute(built.bodies[0]) };
    // Devirtualized: the callee is reached without touching the object.
    let mut dummy = [0u8; 16];
    unsafe { call_poke(dummy.as_mut_ptr()) };
    assert_eq!(*sink, 7);
    assert!(messages.borrow().iter().any(|m| m.contains("devirtualized")));
}

#[test]
fn virtual_call_uses_vtable_when_devirtualization_is_off() {
    let sink: &'static mut u32 = Box::leak(Box::new(0));
    let sink_address = sink as *mut u32 as u64;

    let mut engine = ScriptEngine::new();
    let (widget, poke_id, stub_id) = register_widget(&mut engine, sink_address);
    let caller_id = register_poke_caller(&mut engine, widget, stub_id);

    let config = JitConfig { allow_devirtualization: false, ..Default::default() };
    let built = build(&engine, config, &[caller_id, poke_id]);

    // A real script object this time: the runtime lookup walks its header.
    let object = unsafe { jit_new_script_object(engine.object_type_address(widget)) };
    let call_poke: unsafe extern "C" fn(*mut u8) = unsafe { std::mem::transmute(built.bodies[0]) };
    unsafe { call_poke(object) };
    assert_eq!(*sink, 7);
}

// ============================================================================
// Error paths
// ============================================================================

#[test]
fn unimplemented_opcode_drops_only_that_function() {
    let mut engine = ScriptEngine::new();

    let mut bad_code = Vec::new();
    op_www(&mut bad_code, Opcode::PowI, 1, 0, 0);
    op_w(&mut bad_code, Opcode::Ret, 1);
    let bad_id = engine.register_function(ScriptFunction::script(
        "pow",
        Some("scripts"),
        DataType::value(TypeId::INT32),
        vec![int_param("x")],
        bad_code,
        1,
        1,
    ));

    let mut good_code = Vec::new();
    op_w_dw(&mut good_code, Opcode::SetV4, 1, 5);
    op_w(&mut good_code, Opcode::CpyVtoR4, 1);
    op_w(&mut good_code, Opcode::Ret, 0);
    let good_id = engine.register_function(ScriptFunction::script(
        "five",
        Some("scripts"),
        DataType::value(TypeId::INT32),
        vec![],
        good_code,
        1,
        1,
    ));

    let warnings = Rc::new(RefCell::new(Vec::new()));
    let collected = Rc::clone(&warnings);
    engine.set_message_callback(move |kind, text| {
        if kind == MessageType::Warning {
            collected.borrow_mut().push(text.to_owned());
        }
    });

    let mut compiler = JitCompiler::new(JitConfig::default()).unwrap();
    let bad_slot = Rc::new(FnPtrSlot::new());
    let good_slot = Rc::new(FnPtrSlot::new());
    compiler.compile(&engine, bad_id, Rc::clone(&bad_slot)).unwrap();
    compiler.compile(&engine, good_id, Rc::clone(&good_slot)).unwrap();
    compiler.build_all(&engine);

    assert!(bad_slot.get().is_none());
    assert!(good_slot.get().is_some());
    assert!(warnings.borrow().iter().any(|m| m.contains("POWi")));

    let five = engine
        .function(good_id)
        .user_data(VTABLE_USERDATA_IDENTIFIER)
        .expect("good function linked");
    let five: unsafe extern "C" fn() -> i32 = unsafe { std::mem::transmute(five) };
    assert_eq!(unsafe { five() }, 5);
}
