use std::fmt;

/**
 * The semantic type of a value flowing through the shadow stack.
 *
 * Types are grouped as *primary* (word- and doubleword-sized value types,
 * directly computable), *secondary* (sub-word integers, usable only for
 * memory transfers) and *pointer-like* (the reference types and the
 * interpreter's pseudo-pointers, which participate in the widening rule).
 * `Float` and `Double` exist as tags so their use can be rejected
 * explicitly; no operation accepts them.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    /// 32-bit signed integer.
    Int,
    /// 32-bit unsigned integer.
    Uint,
    /// 64-bit signed integer.
    Long,
    /// 64-bit unsigned integer.
    Ulong,
    Float,
    Double,
    /// Untyped machine reference.
    Ref,
    /// Reference tracked by the garbage collector.
    Oop,
    /// 8-bit signed integer.
    Byte,
    /// 8-bit unsigned integer.
    Ubyte,
    /// 16-bit signed integer.
    Short,
    /// 16-bit unsigned integer.
    Ushort,
    /// Method pointer pseudo-type.
    Mp,
    /// Instruction pointer pseudo-type.
    Ip,
    /// Locals pointer pseudo-type.
    Lp,
    /// Stack segment pseudo-type.
    Ss,
}

impl Type {
    /** The number of bytes a value of this type occupies in memory. */
    pub fn structure_size(self) -> usize {
        use Type::*;
        match self {
            Void => 0,
            Byte | Ubyte => 1,
            Short | Ushort => 2,
            Int | Uint | Float | Ref | Oop | Mp | Ip | Lp | Ss => 4,
            Long | Ulong | Double => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        use Type::*;
        matches!(self, Int | Long | Byte | Short | Float | Double)
    }

    /** Word- and doubleword-sized value types, directly computable. */
    pub fn is_primary(self) -> bool {
        use Type::*;
        matches!(self, Int | Uint | Long | Ulong | Float | Double | Ref | Oop)
    }

    /** Sub-word integer types, used for memory transfers only. */
    pub fn is_secondary(self) -> bool {
        use Type::*;
        matches!(self, Byte | Ubyte | Short | Ushort)
    }

    /** Reference types and interpreter pseudo-pointers. */
    pub fn is_pointer(self) -> bool {
        use Type::*;
        matches!(self, Ref | Oop | Mp | Ip | Lp | Ss)
    }

    /**
     * The type a value of this type computes as: pointer-like types compute
     * as `Ref`, sub-word integers as `Int`, everything else as itself.
     */
    pub fn primitive(self) -> Type {
        use Type::*;
        match self {
            Oop | Mp | Ip | Lp | Ss => Ref,
            Byte | Ubyte | Short | Ushort => Int,
            other => other,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Type::Void => "VOID",
            Type::Int => "INT",
            Type::Uint => "UINT",
            Type::Long => "LONG",
            Type::Ulong => "ULONG",
            Type::Float => "FLOAT",
            Type::Double => "DOUBLE",
            Type::Ref => "REF",
            Type::Oop => "OOP",
            Type::Byte => "BYTE",
            Type::Ubyte => "UBYTE",
            Type::Short => "SHORT",
            Type::Ushort => "USHORT",
            Type::Mp => "MP",
            Type::Ip => "IP",
            Type::Lp => "LP",
            Type::Ss => "SS",
        };
        f.write_str(name)
    }
}

/**
 * The type of the result of a binary operation, under the widening rule:
 * combining a pointer-like operand with an integer yields `Ref`; otherwise
 * the first operand's type prevails. Operand compatibility is validated
 * before this is consulted.
 */
pub fn result_type(op1: Type, op2: Type) -> Type {
    if op1.is_pointer() || op2.is_pointer() {
        Type::Ref
    } else {
        op1
    }
}

//-----------------------------------------------------------------------------
