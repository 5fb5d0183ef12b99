/*!
 * The 32-bit x86 target: registers, condition codes, opcode tables,
 * addressing modes, labels and the instruction encoder.
 */

mod label;
pub use label::{Label, Patch, RelocKind, UNKNOWN_DISP, ABS_PLACEHOLDER};

pub(crate) mod assembler;
pub use assembler::{Assembler};

/** A 32-bit general-purpose register. The discriminant is the encoding. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Register {
    EAX = 0,
    ECX = 1,
    EDX = 2,
    EBX = 3,
    ESP = 4,
    EBP = 5,
    ESI = 6,
    EDI = 7,
}

impl Register {
    pub fn number(self) -> u8 { self as u8 }

    /** Whether the register has an 8-bit sub-register (AL, CL, DL, BL). */
    pub fn has_byte_form(self) -> bool { (self as u8) < 4 }
}

/**
 * A 64-bit value held in two 32-bit registers. Only these three pairings
 * are ever formed; the allocator hands them out as a unit.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pair {
    EDXEAX,
    EBXECX,
    EDIESI,
}

impl Pair {
    /** The register holding bits 32..64. */
    pub fn hi(self) -> Register {
        match self {
            Pair::EDXEAX => Register::EDX,
            Pair::EBXECX => Register::EBX,
            Pair::EDIESI => Register::EDI,
        }
    }

    /** The register holding bits 0..32. */
    pub fn lo(self) -> Register {
        match self {
            Pair::EDXEAX => Register::EAX,
            Pair::EBXECX => Register::ECX,
            Pair::EDIESI => Register::ESI,
        }
    }
}

/**
 * A condition code, as used in `Jcc` and `SETcc`. The discriminant is the
 * low nibble of the opcode.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Condition {
    O  = 0x0,
    NO = 0x1,
    B  = 0x2,
    AE = 0x3,
    Z  = 0x4,
    NZ = 0x5,
    BE = 0x6,
    A  = 0x7,
    S  = 0x8,
    NS = 0x9,
    P  = 0xA,
    NP = 0xB,
    L  = 0xC,
    GE = 0xD,
    LE = 0xE,
    G  = 0xF,
}

impl Condition {
    pub fn cc(self) -> u8 { self as u8 }

    /** The opposite condition. */
    pub fn not(self) -> Condition {
        use Condition::*;
        match self {
            O => NO, NO => O,
            B => AE, AE => B,
            Z => NZ, NZ => Z,
            BE => A, A => BE,
            S => NS, NS => S,
            P => NP, NP => P,
            L => GE, GE => L,
            LE => G, G => LE,
        }
    }
}

/**
 * A two-operand arithmetic or logical operation with the classic 8-opcode
 * encoding family. The discriminant selects both the opcode row and the
 * ModRM `reg` field of the immediate forms.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinaryOp {
    Add = 0,
    Or  = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

impl BinaryOp {
    /** The ModRM `reg` field of the `0x81`/`0x83` immediate forms. */
    pub fn reg_field(self) -> u8 { self as u8 }

    /** Opcode of `op r/m32, r32`. */
    pub fn rm_reg(self) -> u8 { ((self as u8) << 3) | 0x01 }

    /** Opcode of `op r32, r/m32`. */
    pub fn reg_rm(self) -> u8 { ((self as u8) << 3) | 0x03 }

    pub fn is_commutative(self) -> bool {
        use BinaryOp::*;
        matches!(self, Add | Or | Adc | And | Xor)
    }
}

/**
 * A shift or rotate operation: the ModRM `reg` field of the `0xC1`/`0xD1`/
 * `0xD3` family.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ShiftOp {
    Rol = 0,
    Ror = 1,
    Rcl = 2,
    Rcr = 3,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

impl ShiftOp {
    pub fn reg_field(self) -> u8 { self as u8 }
}

/** An index-register scaling factor. The discriminant is the SIB encoding. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Scale {
    One = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
}

/**
 * The displacement of an [`Address`]: either a known constant or the
 * address of a [`Label`], resolved when the code is relocated.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disp {
    Imm(i32),
    Label(Label),
}

/**
 * A memory operand, covering the x86 addressing modes: an optional base
 * register, an optional scaled index register and a displacement.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub base: Option<Register>,
    pub index: Option<(Register, Scale)>,
    pub disp: Disp,
}

impl Address {
    /** `[base]`. */
    pub fn base(base: Register) -> Self {
        Address {base: Some(base), index: None, disp: Disp::Imm(0)}
    }

    /** `[base + disp]`. */
    pub fn base_disp(base: Register, disp: i32) -> Self {
        Address {base: Some(base), index: None, disp: Disp::Imm(disp)}
    }

    /** `[base + index * scale]`. */
    pub fn base_index(base: Register, index: Register, scale: Scale) -> Self {
        Address {base: Some(base), index: Some((index, scale)), disp: Disp::Imm(0)}
    }

    /** `[index * scale + disp]`. */
    pub fn index_disp(index: Register, scale: Scale, disp: i32) -> Self {
        Address {base: None, index: Some((index, scale)), disp: Disp::Imm(disp)}
    }

    /** `[index * scale + label]`, e.g. a jump-table element. */
    pub fn index_label(index: Register, scale: Scale, label: Label) -> Self {
        Address {base: None, index: Some((index, scale)), disp: Disp::Label(label)}
    }

    /** `[disp]`. */
    pub fn absolute(disp: i32) -> Self {
        Address {base: None, index: None, disp: Disp::Imm(disp)}
    }

    /** The same address `delta` bytes further on. */
    pub fn offset(self, delta: i32) -> Self {
        let disp = match self.disp {
            Disp::Imm(d) => Disp::Imm(d + delta),
            Disp::Label(_) => panic!("cannot offset a label displacement"),
        };
        Address {disp, ..self}
    }

    /** Tests whether the address mentions `reg` as base or index. */
    pub fn uses(&self, reg: Register) -> bool {
        self.base == Some(reg) || matches!(self.index, Some((r, _)) if r == reg)
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_encoding() {
        assert_eq!(Register::EAX.number(), 0);
        assert_eq!(Register::EDI.number(), 7);
        assert!(Register::EBX.has_byte_form());
        assert!(!Register::ESI.has_byte_form());
    }

    #[test]
    fn pair_halves() {
        assert_eq!(Pair::EDXEAX.hi(), Register::EDX);
        assert_eq!(Pair::EDXEAX.lo(), Register::EAX);
        assert_eq!(Pair::EDIESI.hi(), Register::EDI);
        assert_eq!(Pair::EDIESI.lo(), Register::ESI);
    }

    #[test]
    fn binary_opcodes() {
        assert_eq!(BinaryOp::Add.rm_reg(), 0x01);
        assert_eq!(BinaryOp::Add.reg_rm(), 0x03);
        assert_eq!(BinaryOp::Sub.rm_reg(), 0x29);
        assert_eq!(BinaryOp::Cmp.reg_rm(), 0x3B);
        assert!(BinaryOp::Add.is_commutative());
        assert!(!BinaryOp::Sub.is_commutative());
        assert!(!BinaryOp::Cmp.is_commutative());
    }

    #[test]
    fn condition_negation() {
        assert_eq!(Condition::Z.not(), Condition::NZ);
        assert_eq!(Condition::L.not(), Condition::GE);
        assert_eq!(Condition::A.not(), Condition::BE);
    }

    #[test]
    fn address_offset() {
        let a = Address::base_disp(Register::EBP, -8);
        assert_eq!(a.offset(4), Address::base_disp(Register::EBP, -4));
        assert!(a.uses(Register::EBP));
        assert!(!a.uses(Register::EAX));
    }
}
