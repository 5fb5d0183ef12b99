use super::error::{CodegenError, Result};
use super::x86::{Pair, Register};

/**
 * The registers available for allocation, in allocation priority order.
 * The order is a heuristic: it keeps the low-priority registers free for
 * 64-bit pairs and for the fixed-register instructions (division, shift
 * counts) as long as possible.
 */
pub const ALLOCATION_ORDER: [Register; 6] = [
    Register::EAX,
    Register::EDX,
    Register::ECX,
    Register::EBX,
    Register::ESI,
    Register::EDI,
];

/** The 64-bit pairs, in allocation priority order. */
pub const PAIR_ORDER: [Pair; 3] = [Pair::EDIESI, Pair::EBXECX, Pair::EDXEAX];

/**
 * A straight-line register allocator: a fixed availability vector over the
 * six allocatable registers, handed out in a fixed priority order. There
 * is no liveness analysis and no spill-to-stack fallback; running out of
 * registers is an error, and call sites that need specific registers free
 * them up explicitly first.
 *
 * ESP and EBP are never allocated; marking or freeing them is a no-op so
 * that callers can treat every register value uniformly.
 */
#[derive(Debug)]
pub struct RegisterAllocator {
    avail: [bool; ALLOCATION_ORDER.len()],
}

impl RegisterAllocator {
    pub fn new() -> Self {
        RegisterAllocator {avail: [true; ALLOCATION_ORDER.len()]}
    }

    fn index_for(reg: Register) -> Option<usize> {
        ALLOCATION_ORDER.iter().position(|&r| r == reg)
    }

    /**
     * Allocates the next available 32-bit register, marking it used.
     */
    pub fn allocate(&mut self) -> Result<Register> {
        for (i, &reg) in ALLOCATION_ORDER.iter().enumerate() {
            if self.avail[i] {
                self.avail[i] = false;
                return Ok(reg);
            }
        }
        Err(CodegenError::RegistersExhausted)
    }

    /**
     * Allocates the next available register with an 8-bit sub-register
     * (needed by `SETcc` and the byte stores), marking it used.
     */
    pub fn allocate_byte(&mut self) -> Result<Register> {
        for (i, &reg) in ALLOCATION_ORDER.iter().enumerate() {
            if self.avail[i] && reg.has_byte_form() {
                self.avail[i] = false;
                return Ok(reg);
            }
        }
        Err(CodegenError::RegistersExhausted)
    }

    /** The registers with a 16-bit form are the same four. */
    pub fn allocate_short(&mut self) -> Result<Register> {
        self.allocate_byte()
    }

    /**
     * Allocates a 64-bit register pair, marking both halves used. Succeeds
     * only if both halves of some pair are simultaneously free.
     */
    pub fn allocate_pair(&mut self) -> Result<Pair> {
        for &pair in &PAIR_ORDER {
            if self.is_free(pair.hi()) && self.is_free(pair.lo()) {
                self.mark_used_pair(pair);
                return Ok(pair);
            }
        }
        Err(CodegenError::RegistersExhausted)
    }

    pub fn mark_used(&mut self, reg: Register) {
        if let Some(i) = Self::index_for(reg) {
            self.avail[i] = false;
        }
    }

    pub fn free(&mut self, reg: Register) {
        if let Some(i) = Self::index_for(reg) {
            self.avail[i] = true;
        }
    }

    /** Marks both halves used, as one operation. */
    pub fn mark_used_pair(&mut self, pair: Pair) {
        self.mark_used(pair.hi());
        self.mark_used(pair.lo());
    }

    /** Frees both halves, as one operation. */
    pub fn free_pair(&mut self, pair: Pair) {
        self.free(pair.hi());
        self.free(pair.lo());
    }

    /** Untracked registers (ESP, EBP) report free. */
    pub fn is_free(&self, reg: Register) -> bool {
        match Self::index_for(reg) {
            Some(i) => self.avail[i],
            None => true,
        }
    }

    /**
     * Whether the calling convention guarantees `reg` survives a call.
     * Registers outside this set must be spilled around calls by the
     * caller.
     */
    pub fn is_abi_preserved(reg: Register) -> bool {
        matches!(reg, Register::EBX | Register::ESI | Register::EDI)
    }

    /** Frees every register; called at each function prologue. */
    pub fn free_all(&mut self) {
        self.avail = [true; ALLOCATION_ORDER.len()];
    }
}

impl Default for RegisterAllocator {
    fn default() -> Self { RegisterAllocator::new() }
}

//-----------------------------------------------------------------------------
