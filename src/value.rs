use super::types::{Type};
use super::x86::{Address, Label, Pair, Register};

/**
 * A stack-frame slot holding a parameter or a local variable. Slots are
 * allocated by the driver with a monotonically increasing byte offset; the
 * frame-pointer-relative address follows the frame layout: parameters at
 * `[EBP + 8 + offset]`, locals below the saved frame pointer.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Local {
    pub ty: Type,
    pub slot_offset: i32,
    pub is_param: bool,
}

impl Local {
    /** The frame-pointer-relative byte offset of this slot. */
    pub fn offset(&self) -> i32 {
        let size = self.ty.structure_size() as i32;
        debug_assert!(size == 4 || size == 8);
        if self.is_param {
            8 + self.slot_offset
        } else {
            -self.slot_offset - size
        }
    }

    /** The address of this slot (of its low word, for 64-bit slots). */
    pub fn address(&self) -> Address {
        Address::base_disp(Register::EBP, self.offset())
    }
}

/** A constant datum queued for emission after the function epilogue. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataValue {
    /// Raw bytes, emitted unaligned.
    Bytes(Vec<u8>),
    /// 32-bit words, emitted 4-aligned.
    Words(Vec<i32>),
    /// Label addresses (e.g. a jump table), emitted 4-aligned.
    Labels(Vec<Label>),
}

/**
 * A value on the shadow stack: the symbolic description of where a
 * stack-machine operand lives before and after it is committed to a
 * concrete register, memory location or immediate.
 */
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolicValue {
    /// A 32-bit compile-time constant.
    Literal32 { value: i32, ty: Type },
    /// A 64-bit compile-time constant.
    Literal64 { value: i64, ty: Type },
    /// A value resident in a physical register. `spilled` is set while the
    /// register has been pushed onto the native stack around a call.
    Reg32 { reg: Register, ty: Type, spilled: bool },
    /// A 64-bit value resident in a register pair.
    Reg64 { pair: Pair, ty: Type, spilled: bool },
    /// A value resident in a stack-frame slot.
    Local { local: Local },
    /// The address of a constant datum emitted as a deferred data block.
    Object { label: Label },
    /// The address of an external symbol, resolved by the linker.
    FixupSymbol { name: String },
    /// The address of a code label.
    LabelRef { label: Label },
}

impl SymbolicValue {
    pub fn reg32(reg: Register, ty: Type) -> Self {
        SymbolicValue::Reg32 {reg, ty, spilled: false}
    }

    pub fn reg64(pair: Pair, ty: Type) -> Self {
        SymbolicValue::Reg64 {pair, ty, spilled: false}
    }

    /** The semantic type of this value. */
    pub fn ty(&self) -> Type {
        match self {
            SymbolicValue::Literal32 {ty, ..} => *ty,
            SymbolicValue::Literal64 {ty, ..} => *ty,
            SymbolicValue::Reg32 {ty, ..} => *ty,
            SymbolicValue::Reg64 {ty, ..} => *ty,
            SymbolicValue::Local {local} => local.ty,
            SymbolicValue::Object {..} => Type::Oop,
            SymbolicValue::FixupSymbol {..} => Type::Ref,
            SymbolicValue::LabelRef {..} => Type::Ref,
        }
    }

    /**
     * Whether this value's storage can be reinterpreted as `candidate`
     * without emitting code: the storage must be the right shape for the
     * candidate type, regardless of the currently declared type.
     */
    pub fn is_type_equivalent(&self, candidate: Type) -> bool {
        match self {
            SymbolicValue::Literal32 {..} => candidate.structure_size() == 4,
            SymbolicValue::Literal64 {..} => candidate.structure_size() == 8,
            SymbolicValue::Reg32 {..} =>
                candidate.structure_size() == 4
                    && (candidate.is_primary() || candidate.is_pointer()),
            SymbolicValue::Reg64 {..} =>
                matches!(candidate, Type::Long | Type::Ulong),
            SymbolicValue::Local {local} =>
                candidate.structure_size() == local.ty.structure_size(),
            SymbolicValue::Object {..}
            | SymbolicValue::FixupSymbol {..}
            | SymbolicValue::LabelRef {..} => candidate.structure_size() == 4,
        }
    }

    /** The number of bytes this value occupies when pushed as an argument. */
    pub fn param_bytes(&self) -> i32 {
        if self.ty().structure_size() == 8 { 8 } else { 4 }
    }
}

/**
 * The abstract operand stack mirroring the source stack machine's
 * evaluation stack. Forward branches deep-copy it so the state at the
 * branch site can be reinstated when the target label binds.
 */
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowStack {
    values: Vec<SymbolicValue>,
}

impl ShadowStack {
    pub fn new() -> Self {
        ShadowStack {values: Vec::new()}
    }

    pub fn push(&mut self, value: SymbolicValue) {
        self.values.push(value);
    }

    pub fn pop(&mut self) -> Option<SymbolicValue> {
        self.values.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /** The element `index` slots from the *bottom* of the stack. */
    pub fn element_at(&self, index: usize) -> Option<&SymbolicValue> {
        self.values.get(index)
    }

    pub fn element_at_mut(&mut self, index: usize) -> Option<&mut SymbolicValue> {
        self.values.get_mut(index)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /** Reverses the whole stack (ABI argument-order adjustment). */
    pub fn reverse(&mut self) {
        self.values.reverse();
    }

    pub fn iter(&self) -> impl Iterator<Item=&SymbolicValue> {
        self.values.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item=&mut SymbolicValue> {
        self.values.iter_mut()
    }
}

//-----------------------------------------------------------------------------
