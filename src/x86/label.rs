/**
 * The displacement written at a relative patch site whose target is not yet
 * known. Also the value read back to check a site has not been patched
 * twice.
 */
pub const UNKNOWN_DISP: i32 = -0x8000_0000;

/** The word written at an absolute patch site whose target is not yet known. */
pub const ABS_PLACEHOLDER: i32 = 0xDEAD_BEEF_u32 as i32;

/**
 * A control-flow or address-constant target. `Label`s are small `Copy`
 * indices into the assembler's label arena, so they can be stored in
 * operand descriptors and used as table keys. A `Label` starts *unbound*
 * (target unknown, accumulating patch sites) and is bound to a code offset
 * exactly once, which patches every accumulated site.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) usize);

/** The address of an instruction field that refers to a `Label`. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Patch {
    /// A 32-bit displacement relative to the end of the field.
    Relative(usize),
    /// A 32-bit absolute code address (relocated when the base is known).
    Absolute(usize),
}

impl Patch {
    /** The byte offset of the 32-bit field into the compiled code. */
    pub fn address(&self) -> usize {
        match *self {
            Patch::Relative(pos) | Patch::Absolute(pos) => pos,
        }
    }
}

/** The state of one [`Label`] in the arena. */
#[derive(Debug)]
pub(crate) struct LabelState {
    pub target: Option<usize>,
    pub patches: Vec<Patch>,
}

impl LabelState {
    pub fn new() -> Self {
        LabelState {target: None, patches: Vec::new()}
    }

    pub fn is_bound(&self) -> bool {
        self.target.is_some()
    }
}

/**
 * The kind of a relocation record. The discriminant is the tag packed into
 * the high byte of the serialized record.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelocKind {
    /// The 32-bit field holds an absolute address.
    Absolute = 0,
    /// The 32-bit field holds a displacement relative to the next byte.
    Relative = 1,
}

/** A relocation record: a 32-bit field at `pos` of the given kind. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Reloc {
    pub kind: RelocKind,
    pub pos: usize,
}

impl Reloc {
    /** Packs the record as `kind << 24 | pos`. */
    pub fn pack(self) -> i32 {
        ((self.kind as i32) << 24) | (self.pos as i32)
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_address() {
        assert_eq!(Patch::Relative(10).address(), 10);
        assert_eq!(Patch::Absolute(3).address(), 3);
    }

    #[test]
    fn reloc_packing() {
        let r = Reloc {kind: RelocKind::Relative, pos: 0x123456};
        assert_eq!(r.pack(), 0x0112_3456);
        let a = Reloc {kind: RelocKind::Absolute, pos: 8};
        assert_eq!(a.pack(), 8);
    }
}
