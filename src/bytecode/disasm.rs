//! Layout-driven disassembly, used by verbose diagnostics.

use crate::bytecode::cursor::Instruction;
use crate::bytecode::opcode::{Layout, Opcode};
use crate::engine::{FunctionId, ScriptEngine};

/// Renders one instruction. Returns an empty string for instructions that
/// carry no information worth printing.
pub fn disassemble(engine: &ScriptEngine, ins: &Instruction) -> String {
    match ins.opcode {
        Opcode::JitEntry | Opcode::Suspend => return String::new(),

        Opcode::Call | Opcode::CallSys | Opcode::CallIntf | Opcode::Thiscall1 => {
            let callee = engine.function(FunctionId(ins.arg_int(0) as u32));
            return format!("{} {}", ins.info.mnemonic, callee.name);
        }

        _ => {}
    }

    let name = ins.info.mnemonic;
    match ins.info.layout {
        Layout::NoArg => name.to_owned(),
        Layout::Word => format!("{} {}", name, ins.arg_sword0()),
        Layout::Dword => format!("{} {}", name, ins.arg_int(0)),
        Layout::WordDword => format!("{} {} {}", name, ins.arg_sword0(), ins.arg_int(0)),
        Layout::DwordDword => format!("{} {} {}", name, ins.arg_int(0), ins.arg_int(1)),
        Layout::Qword => format!("{} {}", name, ins.arg_pword(0)),
        Layout::WordQword => format!("{} {} {}", name, ins.arg_sword0(), ins.arg_pword(0)),
        Layout::QwordDword => format!("{} {} {}", name, ins.arg_pword(0), ins.arg_int(2)),
        Layout::WordWord => format!("{} {} {}", name, ins.arg_sword0(), ins.arg_sword1()),
        Layout::WordWordWord => format!(
            "{} {} {} {}",
            name,
            ins.arg_sword0(),
            ins.arg_sword1(),
            ins.arg_sword2()
        ),
        Layout::WordWordDword => format!(
            "{} {} {} {}",
            name,
            ins.arg_sword0(),
            ins.arg_sword1(),
            ins.arg_int(1)
        ),
        Layout::WordDwordDword => format!(
            "{} {} {} {}",
            name,
            ins.arg_sword0(),
            ins.arg_int(0),
            ins.arg_int(1)
        ),
    }
}
