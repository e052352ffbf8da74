//! The VM's opcode set and its static info table.
//!
//! Each instruction is a sequence of 32-bit words: the opcode in the low
//! byte of word 0, the first (signed) word argument in the high half of
//! word 0, further word arguments packed into word 1, and dword/qword tails
//! after that. The layout variant drives decoding and disassembly; the
//! stack delta is asserted by the translator after emitting each opcode.

/// Stack delta sentinel for instructions whose effect depends on call
/// signatures or other dynamic context.
pub const VARIABLE_STACK_DELTA: i16 = i16::MIN;

/// Operand layout of an instruction, by argument shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// No arguments.
    NoArg,
    /// One word argument in the high half of word 0.
    Word,
    /// Word argument plus one dword.
    WordDword,
    /// One dword argument.
    Dword,
    /// Two dword arguments.
    DwordDword,
    /// One qword argument.
    Qword,
    /// Word argument plus one qword.
    WordQword,
    /// Qword argument plus one dword.
    QwordDword,
    /// Two word arguments (high half of word 0, low half of word 1).
    WordWord,
    /// Three word arguments (high 0, low 1, high 1).
    WordWordWord,
    /// Two word arguments plus one dword.
    WordWordDword,
    /// Word argument plus two dwords.
    WordDwordDword,
}

impl Layout {
    /// Instruction size in 32-bit words, opcode word included.
    pub fn size_words(self) -> usize {
        match self {
            Layout::NoArg | Layout::Word => 1,
            Layout::Dword | Layout::WordDword | Layout::WordWord | Layout::WordWordWord => 2,
            Layout::Qword
            | Layout::WordQword
            | Layout::DwordDword
            | Layout::WordWordDword
            | Layout::WordDwordDword => 3,
            Layout::QwordDword => 4,
        }
    }
}

/// Static description of one opcode kind.
#[derive(Debug)]
pub struct OpcodeInfo {
    pub mnemonic: &'static str,
    pub layout: Layout,
    /// Stack pointer movement in dwords, or [`VARIABLE_STACK_DELTA`].
    pub stack_delta: i16,
}

impl OpcodeInfo {
    pub fn size_words(&self) -> usize {
        self.layout.size_words()
    }

    pub fn concrete_stack_delta(&self) -> Option<i64> {
        if self.stack_delta == VARIABLE_STACK_DELTA {
            None
        } else {
            Some(self.stack_delta as i64)
        }
    }
}

macro_rules! define_opcodes {
    ($( $name:ident => $mnemonic:literal, $layout:ident, $delta:expr; )*) => {
        /// Every opcode the VM emits, in instruction-set order. The byte
        /// encoding of an opcode is its position in this list.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name),*
        }

        const ALL_OPCODES: &[Opcode] = &[$(Opcode::$name),*];

        impl Opcode {
            pub fn from_byte(byte: u8) -> Option<Opcode> {
                ALL_OPCODES.get(byte as usize).copied()
            }

            pub fn info(self) -> &'static OpcodeInfo {
                match self {
                    $(
                        Opcode::$name => &OpcodeInfo {
                            mnemonic: $mnemonic,
                            layout: Layout::$layout,
                            stack_delta: $delta,
                        },
                    )*
                }
            }

            pub fn count() -> usize {
                ALL_OPCODES.len()
            }
        }
    };
}

const VAR: i16 = VARIABLE_STACK_DELTA;

define_opcodes! {
    PopPtr      => "PopPtr",      NoArg,          -2;
    PshGPtr     => "PshGPtr",     Qword,          2;
    PshC4       => "PshC4",       Dword,          1;
    PshV4       => "PshV4",       Word,           1;
    Psf         => "PSF",         Word,           2;
    SwapPtr     => "SwapPtr",     NoArg,          0;
    Not         => "NOT",         Word,           0;
    PshG4       => "PshG4",       Qword,          1;
    LdGRdR4     => "LdGRdR4",     WordQword,      0;
    Call        => "CALL",        Dword,          VAR;
    Ret         => "RET",         Word,           VAR;
    Jmp         => "JMP",         Dword,          0;
    Jz          => "JZ",          Dword,          0;
    Jnz         => "JNZ",         Dword,          0;
    Js          => "JS",          Dword,          0;
    Jns         => "JNS",         Dword,          0;
    Jp          => "JP",          Dword,          0;
    Jnp         => "JNP",         Dword,          0;
    Tz          => "TZ",          NoArg,          0;
    Tnz         => "TNZ",         NoArg,          0;
    Ts          => "TS",          NoArg,          0;
    Tns         => "TNS",         NoArg,          0;
    Tp          => "TP",          NoArg,          0;
    Tnp         => "TNP",         NoArg,          0;
    NegI        => "NEGi",        Word,           0;
    NegF        => "NEGf",        Word,           0;
    NegD        => "NEGd",        Word,           0;
    IncI16      => "INCi16",      NoArg,          0;
    IncI8       => "INCi8",       NoArg,          0;
    DecI16      => "DECi16",      NoArg,          0;
    DecI8       => "DECi8",       NoArg,          0;
    IncI        => "INCi",        NoArg,          0;
    DecI        => "DECi",        NoArg,          0;
    IncF        => "INCf",        NoArg,          0;
    DecF        => "DECf",        NoArg,          0;
    IncD        => "INCd",        NoArg,          0;
    DecD        => "DECd",        NoArg,          0;
    IncVi       => "IncVi",       Word,           0;
    DecVi       => "DecVi",       Word,           0;
    BNot        => "BNOT",        Word,           0;
    BAnd        => "BAND",        WordWordWord,   0;
    BOr         => "BOR",         WordWordWord,   0;
    BXor        => "BXOR",        WordWordWord,   0;
    BSll        => "BSLL",        WordWordWord,   0;
    BSrl        => "BSRL",        WordWordWord,   0;
    BSra        => "BSRA",        WordWordWord,   0;
    Copy        => "COPY",        WordDword,      -2;
    PshC8       => "PshC8",       Qword,          2;
    PshVPtr     => "PshVPtr",     Word,           2;
    RdsPtr      => "RDSPtr",      NoArg,          0;
    CmpD        => "CMPd",        WordWord,       0;
    CmpU        => "CMPu",        WordWord,       0;
    CmpF        => "CMPf",        WordWord,       0;
    CmpI        => "CMPi",        WordWord,       0;
    CmpIi       => "CMPIi",       WordDword,      0;
    CmpIf       => "CMPIf",       WordDword,      0;
    CmpIu       => "CMPIu",       WordDword,      0;
    JmpP        => "JMPP",        Word,           0;
    PopRPtr     => "PopRPtr",     NoArg,          -2;
    PshRPtr     => "PshRPtr",     NoArg,          2;
    Str         => "STR",         Word,           VAR;
    CallSys     => "CALLSYS",     Dword,          VAR;
    CallBnd     => "CALLBND",     Dword,          VAR;
    Suspend     => "SUSPEND",     NoArg,          0;
    Alloc       => "ALLOC",       QwordDword,     VAR;
    Free        => "FREE",        WordQword,      0;
    LoadObj     => "LOADOBJ",     Word,           0;
    StoreObj    => "STOREOBJ",    Word,           0;
    GetObj      => "GETOBJ",      Word,           0;
    RefCpy      => "REFCPY",      Qword,          -2;
    ChkRef      => "CHKREF",      NoArg,          0;
    GetObjRef   => "GETOBJREF",   Word,           0;
    GetRef      => "GETREF",      Word,           0;
    PshNull     => "PshNull",     NoArg,          2;
    ClrVPtr     => "ClrVPtr",     Word,           0;
    ObjType     => "OBJTYPE",     Qword,          2;
    TypeId      => "TYPEID",      Dword,          1;
    SetV4       => "SetV4",       WordDword,      0;
    SetV8       => "SetV8",       WordQword,      0;
    AddSi       => "ADDSi",       WordDword,      0;
    CpyVtoV4    => "CpyVtoV4",    WordWord,       0;
    CpyVtoV8    => "CpyVtoV8",    WordWord,       0;
    CpyVtoR4    => "CpyVtoR4",    Word,           0;
    CpyVtoR8    => "CpyVtoR8",    Word,           0;
    CpyVtoG4    => "CpyVtoG4",    WordQword,      0;
    CpyRtoV4    => "CpyRtoV4",    Word,           0;
    CpyRtoV8    => "CpyRtoV8",    Word,           0;
    CpyGtoV4    => "CpyGtoV4",    WordQword,      0;
    WrtV1       => "WRTV1",       Word,           0;
    WrtV2       => "WRTV2",       Word,           0;
    WrtV4       => "WRTV4",       Word,           0;
    WrtV8       => "WRTV8",       Word,           0;
    RdR1        => "RDR1",        Word,           0;
    RdR2        => "RDR2",        Word,           0;
    RdR4        => "RDR4",        Word,           0;
    RdR8        => "RDR8",        Word,           0;
    Ldg         => "LDG",         Qword,          0;
    Ldv         => "LDV",         Word,           0;
    Pga         => "PGA",         Qword,          2;
    CmpPtr      => "CmpPtr",      WordWord,       0;
    Var         => "VAR",         Word,           2;
    ItoF        => "iTOf",        Word,           0;
    FtoI        => "fTOi",        Word,           0;
    UtoF        => "uTOf",        Word,           0;
    FtoU        => "fTOu",        Word,           0;
    SbToI       => "sbTOi",       Word,           0;
    SwToI       => "swTOi",       Word,           0;
    UbToI       => "ubTOi",       Word,           0;
    UwToI       => "uwTOi",       Word,           0;
    DtoI        => "dTOi",        WordWord,       0;
    DtoU        => "dTOu",        WordWord,       0;
    DtoF        => "dTOf",        WordWord,       0;
    ItoD        => "iTOd",        WordWord,       0;
    UtoD        => "uTOd",        WordWord,       0;
    FtoD        => "fTOd",        WordWord,       0;
    AddI        => "ADDi",        WordWordWord,   0;
    SubI        => "SUBi",        WordWordWord,   0;
    MulI        => "MULi",        WordWordWord,   0;
    DivI        => "DIVi",        WordWordWord,   0;
    ModI        => "MODi",        WordWordWord,   0;
    AddF        => "ADDf",        WordWordWord,   0;
    SubF        => "SUBf",        WordWordWord,   0;
    MulF        => "MULf",        WordWordWord,   0;
    DivF        => "DIVf",        WordWordWord,   0;
    ModF        => "MODf",        WordWordWord,   0;
    AddD        => "ADDd",        WordWordWord,   0;
    SubD        => "SUBd",        WordWordWord,   0;
    MulD        => "MULd",        WordWordWord,   0;
    DivD        => "DIVd",        WordWordWord,   0;
    ModD        => "MODd",        WordWordWord,   0;
    AddIi       => "ADDIi",       WordWordDword,  0;
    SubIi       => "SUBIi",       WordWordDword,  0;
    MulIi       => "MULIi",       WordWordDword,  0;
    AddIf       => "ADDIf",       WordWordDword,  0;
    SubIf       => "SUBIf",       WordWordDword,  0;
    MulIf       => "MULIf",       WordWordDword,  0;
    SetG4       => "SetG4",       QwordDword,     0;
    ChkRefS     => "ChkRefS",     NoArg,          0;
    ChkNullV    => "ChkNullV",    Word,           0;
    CallIntf    => "CALLINTF",    Dword,          VAR;
    ItoB        => "iTOb",        Word,           0;
    ItoW        => "iTOw",        Word,           0;
    SetV1       => "SetV1",       WordDword,      0;
    SetV2       => "SetV2",       WordDword,      0;
    Cast        => "Cast",        Dword,          VAR;
    I64toI      => "i64TOi",      WordWord,       0;
    UtoI64      => "uTOi64",      WordWord,       0;
    ItoI64      => "iTOi64",      WordWord,       0;
    FtoI64      => "fTOi64",      WordWord,       0;
    DtoI64      => "dTOi64",      Word,           0;
    FtoU64      => "fTOu64",      WordWord,       0;
    DtoU64      => "dTOu64",      Word,           0;
    I64toF      => "i64TOf",      WordWord,       0;
    U64toF      => "u64TOf",      WordWord,       0;
    I64toD      => "i64TOd",      Word,           0;
    U64toD      => "u64TOd",      Word,           0;
    NegI64      => "NEGi64",      Word,           0;
    IncI64      => "INCi64",      NoArg,          0;
    DecI64      => "DECi64",      NoArg,          0;
    BNot64      => "BNOT64",      Word,           0;
    AddI64      => "ADDi64",      WordWordWord,   0;
    SubI64      => "SUBi64",      WordWordWord,   0;
    MulI64      => "MULi64",      WordWordWord,   0;
    DivI64      => "DIVi64",      WordWordWord,   0;
    ModI64      => "MODi64",      WordWordWord,   0;
    BAnd64      => "BAND64",      WordWordWord,   0;
    BOr64       => "BOR64",       WordWordWord,   0;
    BXor64      => "BXOR64",      WordWordWord,   0;
    BSll64      => "BSLL64",      WordWordWord,   0;
    BSrl64      => "BSRL64",      WordWordWord,   0;
    BSra64      => "BSRA64",      WordWordWord,   0;
    CmpI64      => "CMPi64",      WordWord,       0;
    CmpU64      => "CMPu64",      WordWord,       0;
    ChkNullS    => "ChkNullS",    Word,           0;
    ClrHi       => "ClrHi",       NoArg,          0;
    JitEntry    => "JitEntry",    Qword,          0;
    CallPtr     => "CallPtr",     Word,           VAR;
    FuncPtr     => "FuncPtr",     Qword,          2;
    LoadThisR   => "LoadThisR",   WordDword,      0;
    PshV8       => "PshV8",       Word,           2;
    DivU        => "DIVu",        WordWordWord,   0;
    ModU        => "MODu",        WordWordWord,   0;
    DivU64      => "DIVu64",      WordWordWord,   0;
    ModU64      => "MODu64",      WordWordWord,   0;
    LoadRObjR   => "LoadRObjR",   WordWordDword,  0;
    LoadVObjR   => "LoadVObjR",   WordWordDword,  0;
    RefCpyV     => "RefCpyV",     WordQword,      0;
    JLowZ       => "JLowZ",       Dword,          0;
    JLowNZ      => "JLowNZ",      Dword,          0;
    AllocMem    => "AllocMem",    WordDword,      0;
    SetListSize => "SetListSize", WordDwordDword, 0;
    PshListElmnt => "PshListElmnt", WordDword,    2;
    SetListType => "SetListType", WordDwordDword, 0;
    PowI        => "POWi",        WordWordWord,   0;
    PowU        => "POWu",        WordWordWord,   0;
    PowF        => "POWf",        WordWordWord,   0;
    PowD        => "POWd",        WordWordWord,   0;
    PowDi       => "POWdi",       WordWordWord,   0;
    PowI64      => "POWi64",      WordWordWord,   0;
    PowU64      => "POWu64",      WordWordWord,   0;
    Thiscall1   => "Thiscall1",   Dword,          VAR;
}
