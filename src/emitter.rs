/*!
 * The machine-code emitter: the layer between the instruction selector and
 * the [`Assembler`]. It owns the register allocator and knows the frame
 * layout, the fixed-register instructions (division, shift counts), the
 * register-pair sequences for 64-bit arithmetic, and the back-patching
 * protocol for the frame-allocation instruction.
 */

use indexmap::{IndexMap};

use super::alloc::{RegisterAllocator};
use super::buffer::{Buffer};
use super::error::{CodegenError, Result};
use super::types::{Type};
use super::value::{DataValue, ShadowStack, SymbolicValue};
use super::x86::{
    Address, Assembler, BinaryOp, Condition, Disp, Label, Pair, Register, Scale,
    ShiftOp,
};

/**
 * The immediate of the frame-allocation instruction emitted by [`enter`].
 * The frame size is unknown until [`leave`], so `enter` reserves the 6-byte
 * `sub esp, imm32` encoding with this immediate; if the final size fits the
 * 3-byte `imm8` encoding, `leave` re-emits the short form and the three
 * trailing `0x90` bytes decode as NOPs.
 *
 * [`enter`]: Emitter::enter
 * [`leave`]: Emitter::leave
 */
pub const FRAME_PLACEHOLDER: i32 = 0x9090_90FF_u32 as i32;

/** A 32-bit source operand. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src32 {
    Imm(i32),
    Reg(Register),
    Mem(Address),
}

/** A 64-bit source operand. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src64 {
    Imm(i64),
    Pair(Pair),
    Mem(Address),
}

/** A two-operand arithmetic or logical operation of the source machine. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Ushr,
}

/** A one-operand operation of the source machine. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Com,
}

/** A comparison of the source machine. The result is an `Int` 0 or 1. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /** The condition code that makes the comparison true after a `cmp`. */
    pub fn condition(self, signed: bool) -> Condition {
        use CompareOp::*;
        match (self, signed) {
            (Eq, _) => Condition::Z,
            (Ne, _) => Condition::NZ,
            (Lt, true) => Condition::L,
            (Lt, false) => Condition::B,
            (Le, true) => Condition::LE,
            (Le, false) => Condition::BE,
            (Gt, true) => Condition::G,
            (Gt, false) => Condition::A,
            (Ge, true) => Condition::GE,
            (Ge, false) => Condition::AE,
        }
    }
}

/**
 * What the function prologue stores in the method-pointer slot `[EBP-4]`.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preamble {
    /// No method-pointer slot is written.
    None,
    /// The slot is cleared to zero.
    Null,
    /// The slot receives the method address passed in EAX by the caller.
    Register,
    /// The slot receives the address of the function itself.
    Address(Label),
}

/**
 * The frame slots needed by [`Emitter::mul64`]: two 8-byte slots to park
 * the operands and four 4-byte slots to spill the scratch registers. The
 * caller allocates them in the activation record, so the multiply never
 * grows the native stack.
 */
#[derive(Debug, Clone, Copy)]
pub struct Mul64Frame {
    pub op1: Address,
    pub op2: Address,
    pub save_edx: Address,
    pub save_eax: Address,
    pub save_edi: Address,
    pub save_esi: Address,
}

//-----------------------------------------------------------------------------

/**
 * Emits function bodies into an [`Assembler`].
 *
 * The emitter tracks three pieces of per-function state: the position of
 * the patchable frame-allocation instruction, the jumps to the epilogue
 * accumulated by [`branch_to_leave`], and the data blocks deferred until
 * after the epilogue.
 *
 * [`branch_to_leave`]: Emitter::branch_to_leave
 */
#[derive(Debug)]
pub struct Emitter<B: Buffer> {
    pub asm: Assembler<B>,
    pub regs: RegisterAllocator,
    frame_patch: Option<usize>,
    leave_jumps: Vec<Label>,
    data: Vec<(Label, DataValue)>,
    comments: IndexMap<usize, String>,
}

impl<B: Buffer> Emitter<B> {
    pub fn new(asm: Assembler<B>) -> Self {
        Emitter {
            asm,
            regs: RegisterAllocator::new(),
            frame_patch: None,
            leave_jumps: Vec::new(),
            data: Vec::new(),
            comments: IndexMap::new(),
        }
    }

    /** The current code position. */
    pub fn get_pos(&self) -> usize {
        self.asm.get_pos()
    }

    /** Attaches `text` to the instruction at the current code position. */
    pub fn comment(&mut self, text: &str) {
        let entry = self.comments.entry(self.asm.get_pos()).or_default();
        entry.push_str(text);
        entry.push('\n');
    }

    /** The comment table, keyed by code position. */
    pub fn comments(&self) -> &IndexMap<usize, String> {
        &self.comments
    }

    //-------------------------------------------------------------------------
    // Prologue and epilogue.

    /**
     * Emits the function prologue, optionally binding `label` to its first
     * byte. The frame-allocation instruction is emitted with a placeholder
     * size and patched by [`leave`](Emitter::leave).
     */
    pub fn enter(&mut self, label: Option<Label>) -> Result<()> {
        self.regs.free_all();
        if let Some(label) = label {
            self.asm.bind(label)?;
        }
        self.asm.push_r(Register::EBP);
        self.asm.mov_rr(Register::EBP, Register::ESP);
        self.frame_patch = Some(self.asm.get_pos());
        self.asm.op_ri_wide(BinaryOp::Sub, Register::ESP, FRAME_PLACEHOLDER);
        Ok(())
    }

    /**
     * Emits the function epilogue: binds the accumulated jumps to this
     * point, tears down the frame, patches the prologue's frame size to
     * `frame_size`, and flushes the deferred data blocks.
     */
    pub fn leave(&mut self, frame_size: i32) -> Result<()> {
        for label in std::mem::take(&mut self.leave_jumps) {
            self.asm.bind(label)?;
        }
        self.asm.mov_rr(Register::ESP, Register::EBP);
        self.asm.pop_r(Register::EBP);
        self.asm.ret();

        let patch = self.frame_patch.take()
            .ok_or(CodegenError::Misuse("leave without a matching enter"))?;
        let save = self.asm.get_pos();
        self.asm.set_pos(patch);
        self.asm.op_ri(BinaryOp::Sub, Register::ESP, frame_size);
        self.asm.set_pos(save);

        for (label, value) in std::mem::take(&mut self.data) {
            match value {
                DataValue::Bytes(bytes) => {
                    self.asm.bind(label)?;
                    for b in bytes {
                        self.asm.emit_byte(b);
                    }
                },
                DataValue::Words(words) => {
                    self.asm.align(4);
                    self.asm.bind(label)?;
                    for w in words {
                        self.asm.emit_word(w);
                    }
                },
                DataValue::Labels(labels) => {
                    self.asm.align(4);
                    self.asm.bind(label)?;
                    for l in labels {
                        self.asm.emit_label_word(l);
                    }
                },
            }
        }
        Ok(())
    }

    /** Emits a jump to the epilogue, wherever it turns out to be. */
    pub fn branch_to_leave(&mut self) {
        let label = self.asm.new_label();
        self.asm.const_jump(label);
        self.leave_jumps.push(label);
    }

    /** Writes the method-pointer slot `[EBP-4]` as the prologue requires. */
    pub fn local_mp(&mut self, preamble: Preamble) -> Result<()> {
        let slot = Address::base_disp(Register::EBP, -4);
        match preamble {
            Preamble::None => {},
            Preamble::Null => self.asm.mov_mi(&slot, 0),
            Preamble::Register => self.asm.mov_mr(&slot, Register::EAX),
            Preamble::Address(label) => {
                let reg = self.regs.allocate()?;
                self.asm.mov_ri_label(reg, label);
                self.asm.mov_mr(&slot, reg);
                self.regs.free(reg);
            },
        }
        Ok(())
    }

    /** Queues a data block for emission after the epilogue. */
    pub fn defer_data(&mut self, label: Label, value: DataValue) {
        self.data.push((label, value));
    }

    //-------------------------------------------------------------------------
    // Stack allocation.

    /** Extends the activation record by `bytes`. */
    pub fn alloca_imm(&mut self, bytes: i32) {
        self.asm.op_ri(BinaryOp::Sub, Register::ESP, bytes);
    }

    pub fn alloca_reg(&mut self, bytes: Register) {
        self.asm.op_rr(BinaryOp::Sub, Register::ESP, bytes);
        self.regs.free(bytes);
    }

    pub fn alloca_mem(&mut self, bytes: &Address) {
        self.asm.op_rm(BinaryOp::Sub, Register::ESP, bytes);
    }

    /**
     * Records the new stack extent in the stack-segment slot. The slot is
     * at a fixed frame offset agreed with the runtime.
     */
    pub fn save_stack_segment(&mut self, slot: &Address) {
        self.asm.mov_mr(slot, Register::ESP);
    }

    /** Loads the receiver from the top of the runtime stack. */
    pub fn peek_receiver(&mut self) -> Result<Register> {
        let reg = self.regs.allocate()?;
        self.asm.mov_rm(reg, &Address::base(Register::ESP));
        Ok(reg)
    }

    //-------------------------------------------------------------------------
    // Loads and stores.

    /** Loads `dst` from memory and marks it used. */
    pub fn load_mem32(&mut self, src: &Address, dst: Register) {
        self.asm.mov_rm(dst, src);
        self.regs.mark_used(dst);
    }

    /** Loads a pair from memory: the low word first, then `src + 4`. */
    pub fn load_mem64(&mut self, src: &Address, dst: Pair) {
        self.asm.mov_rm(dst.lo(), src);
        self.asm.mov_rm(dst.hi(), &src.offset(4));
        self.regs.mark_used_pair(dst);
    }

    /** Stores `src` to memory and frees it. */
    pub fn store_reg32(&mut self, src: Register, dst: &Address) {
        self.asm.mov_mr(dst, src);
        self.regs.free(src);
    }

    pub fn store_reg64(&mut self, src: Pair, dst: &Address) {
        self.asm.mov_mr(dst, src.lo());
        self.asm.mov_mr(&dst.offset(4), src.hi());
        self.regs.free_pair(src);
    }

    pub fn store_imm32(&mut self, value: i32, dst: &Address) {
        self.asm.mov_mi(dst, value);
    }

    /// The low word goes at `dst`, the high word at `dst + 4`.
    pub fn store_imm64(&mut self, value: i64, dst: &Address) {
        self.asm.mov_mi(dst, value as i32);
        self.asm.mov_mi(&dst.offset(4), (value >> 32) as i32);
    }

    /** Copies memory to memory through a scratch register. */
    pub fn store_mem32(&mut self, src: &Address, dst: &Address) -> Result<()> {
        let reg = self.regs.allocate()?;
        self.asm.mov_rm(reg, src);
        self.asm.mov_mr(dst, reg);
        self.regs.free(reg);
        Ok(())
    }

    pub fn load_imm32(&mut self, value: i32, dst: Register) {
        self.asm.mov_ri(dst, value);
        self.regs.mark_used(dst);
    }

    pub fn load_imm64(&mut self, value: i64, dst: Pair) {
        self.asm.mov_ri(dst.lo(), value as i32);
        self.asm.mov_ri(dst.hi(), (value >> 32) as i32);
        self.regs.mark_used_pair(dst);
    }

    /** Loads the address of `label`; resolved when the code is relocated. */
    pub fn load_label(&mut self, label: Label, dst: Register) {
        self.asm.mov_ri_label(dst, label);
        self.regs.mark_used(dst);
    }

    /** Loads the address of an external symbol. */
    pub fn load_symbol(&mut self, name: &str, dst: Register) {
        self.asm.mov_ri_fixup(dst, name);
        self.regs.mark_used(dst);
    }

    /** Register-to-register move; frees `src` and marks `dst` used. */
    pub fn move32(&mut self, src: Register, dst: Register) {
        self.asm.mov_rr(dst, src);
        self.regs.free(src);
        self.regs.mark_used(dst);
    }

    pub fn move64(&mut self, src: Pair, dst: Pair) {
        self.asm.mov_rr(dst.lo(), src.lo());
        self.asm.mov_rr(dst.hi(), src.hi());
        self.regs.free_pair(src);
        self.regs.mark_used_pair(dst);
    }

    /** Copies a register without disturbing the original. */
    pub fn dup32(&mut self, src: Register) -> Result<Register> {
        let copy = self.regs.allocate()?;
        self.asm.mov_rr(copy, src);
        Ok(copy)
    }

    pub fn dup64(&mut self, src: Pair) -> Result<Pair> {
        let copy = self.regs.allocate_pair()?;
        self.asm.mov_rr(copy.lo(), src.lo());
        self.asm.mov_rr(copy.hi(), src.hi());
        Ok(copy)
    }

    //-------------------------------------------------------------------------
    // Untyped parameter access.

    /// `[EBP + idx*4 + 8]`: parameter `idx` of the current activation.
    fn parm_address(idx: Register) -> Address {
        Address {
            base: Some(Register::EBP),
            index: Some((idx, Scale::Four)),
            disp: Disp::Imm(8),
        }
    }

    /** Loads parameter word `idx` into `dst`. */
    pub fn load_parm(&mut self, idx: Src32, dst: Register) -> Result<()> {
        let idx_reg = self.materialize32(idx)?;
        self.asm.mov_rm(dst, &Self::parm_address(idx_reg));
        self.regs.free(idx_reg);
        self.regs.mark_used(dst);
        Ok(())
    }

    /** Stores `src` into parameter word `idx`. */
    pub fn store_parm(&mut self, src: Register, idx: Src32) -> Result<()> {
        let idx_reg = self.materialize32(idx)?;
        self.asm.mov_mr(&Self::parm_address(idx_reg), src);
        self.regs.free(idx_reg);
        self.regs.free(src);
        Ok(())
    }

    //-------------------------------------------------------------------------
    // Memory reads and writes through pointers.

    /**
     * Loads `dst` through the pointer in `src`, converting per `ty`:
     * sub-word types are widened with a sign or zero extension. Frees
     * `src`; for sub-word types `dst` must have a byte form.
     */
    pub fn read32(&mut self, src: Register, dst: Register, ty: Type) -> Result<()> {
        let addr = Address::base(src);
        match ty {
            Type::Int | Type::Uint | Type::Ref | Type::Oop
            | Type::Mp | Type::Ip | Type::Lp | Type::Ss => {
                self.asm.mov_rm(dst, &addr);
            },
            Type::Byte => self.asm.movsx_b_rm(dst, &addr),
            Type::Ubyte => self.asm.movzx_b_rm(dst, &addr),
            Type::Short => self.asm.movsx_w_rm(dst, &addr),
            Type::Ushort => self.asm.movzx_w_rm(dst, &addr),
            Type::Float | Type::Double => {
                return Err(CodegenError::Unsupported("floating-point reads"));
            },
            Type::Long | Type::Ulong | Type::Void => {
                return Err(CodegenError::TypeMismatch(
                    "64-bit read needs a register pair"));
            },
        }
        self.regs.free(src);
        self.regs.mark_used(dst);
        Ok(())
    }

    /** Loads a pair through the pointer in `src`. */
    pub fn read64(&mut self, src: Register, dst: Pair) {
        self.asm.mov_rm(dst.lo(), &Address::base(src));
        self.asm.mov_rm(dst.hi(), &Address::base_disp(src, 4));
        self.regs.free(src);
        self.regs.mark_used_pair(dst);
    }

    /**
     * Stores `src` through the pointer in `dst`, narrowing per the
     * structure size of `ty`. Frees both registers; for sub-word types
     * `src` must have a byte form.
     */
    pub fn write32(&mut self, src: Register, dst: Register, ty: Type) -> Result<()> {
        let addr = Address::base(dst);
        match ty.structure_size() {
            1 => self.asm.movb_mr(&addr, src),
            2 => self.asm.movw_mr(&addr, src),
            4 => self.asm.mov_mr(&addr, src),
            _ => return Err(CodegenError::TypeMismatch(
                "64-bit write needs a register pair")),
        }
        self.regs.free(src);
        self.regs.free(dst);
        Ok(())
    }

    pub fn write64(&mut self, src: Pair, dst: Register) {
        self.asm.mov_mr(&Address::base(dst), src.lo());
        self.asm.mov_mr(&Address::base_disp(dst, 4), src.hi());
        self.regs.free_pair(src);
        self.regs.free(dst);
    }

    /** Stores an immediate through the pointer in `dst`. */
    pub fn write_imm32(&mut self, value: i32, dst: Register, ty: Type) -> Result<()> {
        let addr = Address::base(dst);
        match ty.structure_size() {
            1 | 2 => {
                // No immediate narrow-store form; go through a register.
                let reg = self.regs.allocate_byte()?;
                self.asm.mov_ri(reg, value);
                if ty.structure_size() == 1 {
                    self.asm.movb_mr(&addr, reg);
                } else {
                    self.asm.movw_mr(&addr, reg);
                }
                self.regs.free(reg);
            },
            4 => self.asm.mov_mi(&addr, value),
            _ => return Err(CodegenError::TypeMismatch(
                "64-bit write needs a 64-bit immediate")),
        }
        self.regs.free(dst);
        Ok(())
    }

    pub fn write_imm64(&mut self, value: i64, dst: Register) {
        self.asm.mov_mi(&Address::base(dst), value as i32);
        self.asm.mov_mi(&Address::base_disp(dst, 4), (value >> 32) as i32);
        self.regs.free(dst);
    }

    //-------------------------------------------------------------------------
    // Fixed-register plumbing.

    /**
     * Evicts `reg_to_free` into a fresh register and re-tags any shadow
     * stack entry that referred to it. The caller takes over `reg_to_free`.
     */
    pub fn free_up(&mut self, reg_to_free: Register, stack: &mut ShadowStack)
    -> Result<()> {
        if self.regs.is_free(reg_to_free) {
            return Ok(());
        }
        let replacement = self.regs.allocate()?;
        self.asm.mov_rr(replacement, reg_to_free);
        for value in stack.iter_mut() {
            if let SymbolicValue::Reg32 {reg, ..} = value {
                if *reg == reg_to_free {
                    *reg = replacement;
                }
            }
        }
        Ok(())
    }

    /** Moves `src` into `target`, evicting the current occupant. */
    fn set_register_in(
        &mut self, target: Register, src: Register, stack: &mut ShadowStack,
    ) -> Result<()> {
        if src != target {
            self.free_up(target, stack)?;
            self.asm.mov_rr(target, src);
            self.regs.free(src);
            self.regs.mark_used(target);
        }
        Ok(())
    }

    /// `idiv` divides EDX:EAX; the dividend goes to EAX and EDX is cleared.
    fn set_dividend(&mut self, dividend: Register, stack: &mut ShadowStack)
    -> Result<()> {
        self.set_register_in(Register::EAX, dividend, stack)?;
        self.free_up(Register::EDX, stack)?;
        self.asm.mov_ri(Register::EDX, 0);
        self.regs.mark_used(Register::EDX);
        Ok(())
    }

    /// Variable shift counts go in CL.
    fn set_count_cl(&mut self, count: Src32, stack: &mut ShadowStack) -> Result<()> {
        if count == Src32::Reg(Register::ECX) {
            return Ok(());
        }
        self.free_up(Register::ECX, stack)?;
        match count {
            Src32::Imm(v) => self.asm.mov_ri(Register::ECX, v),
            Src32::Reg(r) => {
                self.asm.mov_rr(Register::ECX, r);
                self.regs.free(r);
            },
            Src32::Mem(a) => self.asm.mov_rm(Register::ECX, &a),
        }
        self.regs.mark_used(Register::ECX);
        Ok(())
    }

    /** Brings a 32-bit operand into a register, allocating if needed. */
    fn materialize32(&mut self, src: Src32) -> Result<Register> {
        match src {
            Src32::Reg(r) => Ok(r),
            Src32::Imm(v) => {
                let r = self.regs.allocate()?;
                self.asm.mov_ri(r, v);
                Ok(r)
            },
            Src32::Mem(a) => {
                let r = self.regs.allocate()?;
                self.asm.mov_rm(r, &a);
                Ok(r)
            },
        }
    }

    //-------------------------------------------------------------------------
    // Arithmetic.

    fn binary32(&mut self, op: BinaryOp, dst: Register, src: Src32) {
        match src {
            Src32::Imm(v) => self.asm.op_ri(op, dst, v),
            Src32::Reg(r) => {
                self.asm.op_rr(op, dst, r);
                self.regs.free(r);
            },
            Src32::Mem(a) => self.asm.op_rm(op, dst, &a),
        }
    }

    /**
     * `dst = dst op src` for 32-bit operands. Returns the result register:
     * `dst`, except for division and remainder which are pinned to EAX and
     * EDX respectively.
     */
    pub fn arith32(
        &mut self, op: ArithOp, dst: Register, src: Src32, stack: &mut ShadowStack,
    ) -> Result<Register> {
        match op {
            ArithOp::Add => {
                match src {
                    Src32::Imm(1) => self.asm.inc_r(dst),
                    Src32::Imm(-1) => self.asm.dec_r(dst),
                    _ => self.binary32(BinaryOp::Add, dst, src),
                }
                Ok(dst)
            },
            ArithOp::Sub => {
                match src {
                    Src32::Imm(1) => self.asm.dec_r(dst),
                    Src32::Imm(-1) => self.asm.inc_r(dst),
                    _ => self.binary32(BinaryOp::Sub, dst, src),
                }
                Ok(dst)
            },
            ArithOp::And => {
                self.binary32(BinaryOp::And, dst, src);
                Ok(dst)
            },
            ArithOp::Or => {
                self.binary32(BinaryOp::Or, dst, src);
                Ok(dst)
            },
            ArithOp::Xor => {
                self.binary32(BinaryOp::Xor, dst, src);
                Ok(dst)
            },
            ArithOp::Mul => {
                match src {
                    Src32::Imm(v) => self.asm.mul_rri(dst, dst, v),
                    Src32::Reg(r) => {
                        self.asm.mul_rr(dst, r);
                        self.regs.free(r);
                    },
                    Src32::Mem(a) => self.asm.mul_rm(dst, &a),
                }
                Ok(dst)
            },
            ArithOp::Div | ArithOp::Rem => {
                // The dividend setup clobbers EAX and EDX. Park the divisor
                // on the shadow stack so the eviction logic follows it if
                // it lives in one of them.
                let divisor = self.materialize32(src)?;
                stack.push(SymbolicValue::reg32(divisor, Type::Int));
                self.set_dividend(dst, stack)?;
                let divisor = match stack.pop() {
                    Some(SymbolicValue::Reg32 {reg, ..}) => reg,
                    _ => return Err(CodegenError::Misuse("divisor lost")),
                };
                self.asm.idiv_r(divisor);
                self.regs.free(divisor);
                if op == ArithOp::Div {
                    self.regs.free(Register::EDX);
                    Ok(Register::EAX)
                } else {
                    self.regs.free(Register::EAX);
                    Ok(Register::EDX)
                }
            },
            ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr => {
                let shift = match op {
                    ArithOp::Shl => ShiftOp::Shl,
                    ArithOp::Shr => ShiftOp::Sar,
                    _ => ShiftOp::Shr,
                };
                match src {
                    Src32::Imm(v) => self.asm.shift_ri(shift, dst, v as u8),
                    _ => {
                        self.set_count_cl(src, stack)?;
                        self.asm.shift_r_cl(shift, dst);
                    },
                }
                Ok(dst)
            },
        }
    }

    fn binary64(&mut self, lo_op: BinaryOp, hi_op: BinaryOp, dst: Pair, src: Src64) {
        match src {
            Src64::Imm(v) => {
                self.asm.op_ri(lo_op, dst.lo(), v as i32);
                self.asm.op_ri(hi_op, dst.hi(), (v >> 32) as i32);
            },
            Src64::Pair(p) => {
                self.asm.op_rr(lo_op, dst.lo(), p.lo());
                self.asm.op_rr(hi_op, dst.hi(), p.hi());
                self.regs.free_pair(p);
            },
            Src64::Mem(a) => {
                self.asm.op_rm(lo_op, dst.lo(), &a);
                self.asm.op_rm(hi_op, dst.hi(), &a.offset(4));
            },
        }
    }

    /**
     * `dst = dst op src` for the 64-bit operations that work pairwise on
     * the halves: add and subtract through the carry flag, and the
     * bitwise operations independently. Shifts take a 32-bit count and go
     * through [`shift64`]; multiplication goes through [`mul64`]; division
     * is delegated to the runtime.
     *
     * [`shift64`]: Emitter::shift64
     * [`mul64`]: Emitter::mul64
     */
    pub fn arith64(&mut self, op: ArithOp, dst: Pair, src: Src64) -> Result<Pair> {
        match op {
            ArithOp::Add => self.binary64(BinaryOp::Add, BinaryOp::Adc, dst, src),
            ArithOp::Sub => self.binary64(BinaryOp::Sub, BinaryOp::Sbb, dst, src),
            ArithOp::And => self.binary64(BinaryOp::And, BinaryOp::And, dst, src),
            ArithOp::Or => self.binary64(BinaryOp::Or, BinaryOp::Or, dst, src),
            ArithOp::Xor => self.binary64(BinaryOp::Xor, BinaryOp::Xor, dst, src),
            _ => return Err(CodegenError::IllegalOperand(
                "not a pairwise 64-bit operation")),
        }
        Ok(dst)
    }

    /**
     * Shifts the pair `dst` by the 32-bit count `count`, one bit per
     * iteration of a loop that rotates through the carry flag. The count
     * register is consumed.
     */
    pub fn shift64(&mut self, op: ArithOp, dst: Pair, count: Src32) -> Result<Pair> {
        let count_reg = self.materialize32(count)?;
        let start = self.asm.new_label();
        let end = self.asm.new_label();
        self.asm.bind(start)?;
        self.asm.op_ri(BinaryOp::Cmp, count_reg, 0);
        self.asm.jump_if(Condition::Z, end);
        match op {
            ArithOp::Shl => {
                self.asm.shift_ri(ShiftOp::Shl, dst.lo(), 1);
                self.asm.shift_ri(ShiftOp::Rcl, dst.hi(), 1);
            },
            ArithOp::Shr => {
                self.asm.shift_ri(ShiftOp::Sar, dst.hi(), 1);
                self.asm.shift_ri(ShiftOp::Rcr, dst.lo(), 1);
            },
            ArithOp::Ushr => {
                self.asm.shift_ri(ShiftOp::Shr, dst.hi(), 1);
                self.asm.shift_ri(ShiftOp::Rcr, dst.lo(), 1);
            },
            _ => return Err(CodegenError::IllegalOperand("not a shift operation")),
        }
        self.asm.dec_r(count_reg);
        self.asm.const_jump(start);
        self.asm.bind(end)?;
        self.regs.free(count_reg);
        Ok(dst)
    }

    /**
     * 64-bit multiply: `dst = dst * src`, computed schoolbook-style on the
     * frame slots in `frame` because four scratch registers are needed for
     * the partial products. Writing `ab * cd` with 32-bit digits, the
     * product is `(a*d + c*b) << 32 + b*d`, the `a*c` term being overflow.
     */
    pub fn mul64(&mut self, dst: Pair, src: Pair, frame: &Mul64Frame) -> Result<Pair> {
        self.asm.mov_mr(&frame.op1, dst.lo());
        self.asm.mov_mr(&frame.op1.offset(4), dst.hi());
        self.asm.mov_mr(&frame.op2, src.lo());
        self.asm.mov_mr(&frame.op2.offset(4), src.hi());
        self.mul64_mem(&frame.op1, &frame.op2, frame)?;
        self.asm.mov_rm(dst.lo(), &frame.op1);
        self.asm.mov_rm(dst.hi(), &frame.op1.offset(4));
        self.regs.free_pair(src);
        Ok(dst)
    }

    /// `op1 = op1 * op2` on 8-byte frame slots.
    fn mul64_mem(&mut self, op1: &Address, op2: &Address, frame: &Mul64Frame)
    -> Result<()> {
        use Register::*;
        let hi1 = op1.offset(4);
        let hi2 = op2.offset(4);

        // The scratch registers cannot be pushed: the runtime's stacks are
        // fixed-size, so spills go to pre-allocated frame slots.
        self.asm.mov_mr(&frame.save_edx, EDX);
        self.asm.mov_mr(&frame.save_eax, EAX);
        self.asm.mov_mr(&frame.save_edi, EDI);
        self.asm.mov_mr(&frame.save_esi, ESI);

        // Cross products of low and high digits, summed in EDI:ESI.
        self.asm.mov_rm(EDX, &hi1);
        self.asm.mov_rm(EAX, op2);
        self.asm.imul_r(EDX);
        self.asm.mov_rr(EDI, EDX);
        self.asm.mov_rr(ESI, EAX);
        self.asm.mov_rm(EDX, &hi2);
        self.asm.mov_rm(EAX, op1);
        self.asm.imul_r(EDX);
        self.asm.op_rr(BinaryOp::Add, ESI, EAX);
        self.asm.op_rr(BinaryOp::Adc, EDI, EDX);

        // Shift the cross products left 32 bits. This must not touch the
        // allocator: every small register may be live around a multiply.
        self.asm.mov_rr(EDI, ESI);
        self.asm.op_rr(BinaryOp::Xor, ESI, ESI);

        // Product of the low digits, plus the shifted cross products.
        self.asm.mov_rm(EDX, op1);
        self.asm.mov_rm(EAX, op2);
        self.asm.imul_r(EDX);
        self.asm.op_rr(BinaryOp::Add, EAX, ESI);
        self.asm.op_rr(BinaryOp::Adc, EDX, EDI);
        self.asm.mov_mr(op1, EAX);
        self.asm.mov_mr(&op1.offset(4), EDX);

        self.asm.mov_rm(EDX, &frame.save_edx);
        self.asm.mov_rm(EAX, &frame.save_eax);
        self.asm.mov_rm(EDI, &frame.save_edi);
        self.asm.mov_rm(ESI, &frame.save_esi);
        Ok(())
    }

    /**
     * 64-bit division and remainder are runtime calls; the helper takes
     * its operands from the runtime stack and returns in EDX:EAX.
     */
    pub fn long_div_call(&mut self, name: &str) -> Pair {
        self.asm.call_fixup(name);
        self.regs.mark_used_pair(Pair::EDXEAX);
        Pair::EDXEAX
    }

    pub fn unary32(&mut self, op: UnaryOp, reg: Register) -> Register {
        match op {
            UnaryOp::Neg => self.asm.neg_r(reg),
            UnaryOp::Com => self.asm.not_r(reg),
        }
        reg
    }

    /// Two's-complement negate of a pair: complement, then add 1 with carry.
    pub fn unary64(&mut self, op: UnaryOp, pair: Pair) -> Pair {
        self.asm.not_r(pair.lo());
        self.asm.not_r(pair.hi());
        if op == UnaryOp::Neg {
            self.asm.op_ri(BinaryOp::Add, pair.lo(), 1);
            self.asm.op_ri(BinaryOp::Adc, pair.hi(), 0);
        }
        pair
    }

    //-------------------------------------------------------------------------
    // Comparisons.

    /// Reads EFLAGS into a fresh 0-or-1 register.
    fn compare_result(&mut self, op: CompareOp, signed: bool) -> Result<Register> {
        let res = self.regs.allocate_byte()?;
        self.asm.mov_ri(res, 0);
        self.asm.set_if(op.condition(signed), res);
        Ok(res)
    }

    /**
     * Compares `dst` with `src` and returns a register holding 0 or 1.
     * Both operands are freed before the result register is allocated, so
     * it may reuse one of them.
     */
    pub fn compare32(
        &mut self, dst: Register, src: Src32, op: CompareOp, signed: bool,
    ) -> Result<Register> {
        self.binary32(BinaryOp::Cmp, dst, src);
        self.regs.free(dst);
        self.compare_result(op, signed)
    }

    /** Compares a frame slot with an immediate. */
    pub fn compare_mem32(
        &mut self, dst: &Address, src: i32, op: CompareOp, signed: bool,
    ) -> Result<Register> {
        self.asm.op_mi(BinaryOp::Cmp, dst, src);
        self.compare_result(op, signed)
    }

    fn cmp64_high(&mut self, dst: Pair, src: &Src64) {
        match *src {
            Src64::Imm(v) => self.asm.op_ri(BinaryOp::Cmp, dst.hi(), (v >> 32) as i32),
            Src64::Pair(p) => self.asm.op_rr(BinaryOp::Cmp, dst.hi(), p.hi()),
            Src64::Mem(a) => self.asm.op_rm(BinaryOp::Cmp, dst.hi(), &a.offset(4)),
        }
    }

    fn cmp64_low(&mut self, dst: Pair, src: &Src64) {
        match *src {
            Src64::Imm(v) => self.asm.op_ri(BinaryOp::Cmp, dst.lo(), v as i32),
            Src64::Pair(p) => self.asm.op_rr(BinaryOp::Cmp, dst.lo(), p.lo()),
            Src64::Mem(a) => self.asm.op_rm(BinaryOp::Cmp, dst.lo(), &a),
        }
    }

    fn free64(&mut self, src: &Src64) {
        if let Src64::Pair(p) = src {
            self.regs.free_pair(*p);
        }
    }

    /** Compares two 64-bit operands and returns a register holding 0 or 1. */
    pub fn compare64(
        &mut self, dst: Pair, src: Src64, op: CompareOp, signed: bool,
    ) -> Result<Register> {
        match op {
            CompareOp::Eq | CompareOp::Ne => self.compare64_equality(dst, src, op),
            _ => self.compare64_ordering(dst, src, op, signed),
        }
    }

    /// `ab == cd` iff `a == c` and `b == d`; the high words short-circuit.
    fn compare64_equality(&mut self, dst: Pair, src: Src64, op: CompareOp)
    -> Result<Register> {
        let not_equal = self.asm.new_label();
        let is_equal = self.asm.new_label();
        let end = self.asm.new_label();

        self.cmp64_high(dst, &src);
        self.asm.jump_if(Condition::NZ, not_equal);
        self.cmp64_low(dst, &src);
        self.regs.free_pair(dst);
        self.free64(&src);

        let res = self.regs.allocate()?;
        if op == CompareOp::Eq {
            self.asm.jump_if(Condition::Z, is_equal);
            self.asm.bind(not_equal)?;
            self.asm.mov_ri(res, 0);
            self.asm.const_jump(end);
            self.asm.bind(is_equal)?;
            self.asm.mov_ri(res, 1);
        } else {
            self.asm.jump_if(Condition::NZ, not_equal);
            self.asm.mov_ri(res, 0);
            self.asm.const_jump(end);
            self.asm.bind(not_equal)?;
            self.asm.mov_ri(res, 1);
        }
        self.asm.bind(end)?;
        Ok(res)
    }

    /**
     * `ab > cd`: decided by the high words unless they are equal, in which
     * case the low words decide, compared unsigned.
     */
    fn compare64_ordering(
        &mut self, dst: Pair, src: Src64, op: CompareOp, signed: bool,
    ) -> Result<Register> {
        let is = self.asm.new_label();
        let is_not = self.asm.new_label();
        let end = self.asm.new_label();

        let (wins, loses) = if signed {
            (Condition::G, Condition::L)
        } else {
            (Condition::A, Condition::B)
        };
        self.cmp64_high(dst, &src);
        match op {
            CompareOp::Gt | CompareOp::Ge => {
                self.asm.jump_if(wins, is);
                self.asm.jump_if(loses, is_not);
            },
            CompareOp::Lt | CompareOp::Le => {
                self.asm.jump_if(wins, is_not);
                self.asm.jump_if(loses, is);
            },
            _ => return Err(CodegenError::IllegalOperand(
                "not an ordering comparison")),
        }

        self.cmp64_low(dst, &src);
        let low_cc = match op {
            CompareOp::Gt => Condition::A,
            CompareOp::Ge => Condition::AE,
            CompareOp::Lt => Condition::B,
            _ => Condition::BE,
        };
        self.asm.jump_if(low_cc, is);
        self.regs.free_pair(dst);
        self.free64(&src);

        let res = self.regs.allocate()?;
        self.asm.bind(is_not)?;
        self.asm.mov_ri(res, 0);
        self.asm.const_jump(end);
        self.asm.bind(is)?;
        self.asm.mov_ri(res, 1);
        self.asm.bind(end)?;
        Ok(res)
    }

    //-------------------------------------------------------------------------
    // Branches.

    /**
     * Branches to `label` if the 0-or-1 value in `reg` equals `when`.
     * Frees `reg`.
     */
    pub fn branch_on(&mut self, reg: Register, when: bool, label: Label) {
        self.asm.op_ri(BinaryOp::Cmp, reg, if when { 1 } else { 0 });
        self.asm.jump_if(Condition::Z, label);
        self.regs.free(reg);
    }

    pub fn branch_on_mem(&mut self, addr: &Address, when: bool, label: Label) {
        self.asm.op_mi(BinaryOp::Cmp, addr, if when { 1 } else { 0 });
        self.asm.jump_if(Condition::Z, label);
    }

    /** As [`branch_on`](Emitter::branch_on), to a known code offset. */
    pub fn branch_on_abs(&mut self, reg: Register, when: bool, target: usize) {
        self.asm.op_ri(BinaryOp::Cmp, reg, if when { 1 } else { 0 });
        self.asm.jump_if_abs(Condition::Z, target);
        self.regs.free(reg);
    }

    pub fn branch_on_mem_abs(&mut self, addr: &Address, when: bool, target: usize) {
        self.asm.op_mi(BinaryOp::Cmp, addr, if when { 1 } else { 0 });
        self.asm.jump_if_abs(Condition::Z, target);
    }

    pub fn jump(&mut self, label: Label) {
        self.asm.const_jump(label);
    }

    pub fn jump_to(&mut self, target: usize) {
        self.asm.jump_abs(target);
    }

    /** An indirect jump through a register, e.g. a jump-table dispatch. */
    pub fn jump_reg(&mut self, reg: Register) {
        self.asm.jump_r(reg);
        self.regs.free(reg);
    }

    pub fn jump_mem(&mut self, addr: &Address) {
        self.asm.jump_m(addr);
    }

    //-------------------------------------------------------------------------
    // Calls, pushes and pops.

    pub fn call_label(&mut self, label: Label) {
        self.asm.const_call(label);
    }

    pub fn call_addr(&mut self, addr: i32) {
        self.asm.call_abs(addr);
    }

    pub fn call_reg(&mut self, reg: Register) {
        self.asm.call_r(reg);
        self.regs.free(reg);
    }

    pub fn call_mem(&mut self, addr: &Address) {
        self.asm.call_m(addr);
    }

    pub fn call_symbol(&mut self, name: &str) {
        self.asm.call_fixup(name);
    }

    pub fn push_reg(&mut self, reg: Register) {
        self.asm.push_r(reg);
        self.regs.free(reg);
    }

    /// High word first: the stack grows downwards.
    pub fn push_pair(&mut self, pair: Pair) {
        self.asm.push_r(pair.hi());
        self.asm.push_r(pair.lo());
        self.regs.free_pair(pair);
    }

    pub fn push_imm(&mut self, value: i32) {
        self.asm.push_i(value);
    }

    pub fn push_imm64(&mut self, value: i64) {
        self.asm.push_i((value >> 32) as i32);
        self.asm.push_i(value as i32);
    }

    pub fn push_mem(&mut self, addr: &Address) {
        self.asm.push_m(addr);
    }

    pub fn push_mem64(&mut self, addr: &Address) {
        self.asm.push_m(&addr.offset(4));
        self.asm.push_m(addr);
    }

    /** Pushes the address of `label`; resolved at relocation. */
    pub fn push_label_addr(&mut self, label: Label) {
        self.asm.push_i_label(label);
    }

    pub fn push_symbol(&mut self, name: &str) {
        self.asm.push_i_fixup(name);
    }

    pub fn pop_reg(&mut self, reg: Register) {
        self.asm.pop_r(reg);
        self.regs.mark_used(reg);
    }

    pub fn pop_pair(&mut self, pair: Pair) {
        self.asm.pop_r(pair.lo());
        self.asm.pop_r(pair.hi());
        self.regs.mark_used_pair(pair);
    }

    pub fn pop_mem(&mut self, addr: &Address) {
        self.asm.pop_m(addr);
    }

    /** Discards `bytes` of pushed arguments. */
    pub fn drop_bytes(&mut self, bytes: i32) {
        if bytes != 0 {
            self.asm.op_ri(BinaryOp::Add, Register::ESP, bytes);
        }
    }

    /**
     * Saves a live register across a call without releasing it; the
     * shadow stack keeps referring to the register while it is spilled.
     */
    pub fn spill(&mut self, reg: Register) {
        self.asm.push_r(reg);
    }

    pub fn spill_pair(&mut self, pair: Pair) {
        self.asm.push_r(pair.hi());
        self.asm.push_r(pair.lo());
    }

    pub fn unspill(&mut self, reg: Register) {
        self.asm.pop_r(reg);
    }

    pub fn unspill_pair(&mut self, pair: Pair) {
        self.asm.pop_r(pair.lo());
        self.asm.pop_r(pair.hi());
    }

    //-------------------------------------------------------------------------
    // Calling-convention registers.

    /** Return values travel in EAX. */
    pub fn load_return32(&mut self, src: Src32) {
        match src {
            Src32::Imm(v) => self.asm.mov_ri(Register::EAX, v),
            Src32::Reg(r) => {
                if r != Register::EAX {
                    self.asm.mov_rr(Register::EAX, r);
                }
            },
            Src32::Mem(a) => self.asm.mov_rm(Register::EAX, &a),
        }
    }

    /** 64-bit return values travel in EDX:EAX. */
    pub fn load_return64(&mut self, src: Src64) {
        match src {
            Src64::Imm(v) => {
                self.asm.mov_ri(Register::EAX, v as i32);
                self.asm.mov_ri(Register::EDX, (v >> 32) as i32);
            },
            Src64::Pair(p) => {
                if p != Pair::EDXEAX {
                    self.asm.mov_rr(Register::EAX, p.lo());
                    self.asm.mov_rr(Register::EDX, p.hi());
                }
            },
            Src64::Mem(a) => {
                self.asm.mov_rm(Register::EAX, &a);
                self.asm.mov_rm(Register::EDX, &a.offset(4));
            },
        }
    }

    /**
     * The interpreter calling convention passes the target address in EAX;
     * the current occupant is evicted.
     */
    pub fn load_call_register(&mut self, src: Src32, stack: &mut ShadowStack)
    -> Result<()> {
        if src == Src32::Reg(Register::EAX) {
            return Ok(());
        }
        self.free_up(Register::EAX, stack)?;
        match src {
            Src32::Imm(v) => self.asm.mov_ri(Register::EAX, v),
            Src32::Reg(r) => {
                self.asm.mov_rr(Register::EAX, r);
                self.regs.free(r);
            },
            Src32::Mem(a) => self.asm.mov_rm(Register::EAX, &a),
        }
        self.regs.mark_used(Register::EAX);
        Ok(())
    }

    pub fn load_call_register_label(&mut self, label: Label, stack: &mut ShadowStack)
    -> Result<()> {
        self.free_up(Register::EAX, stack)?;
        self.asm.mov_ri_label(Register::EAX, label);
        self.regs.mark_used(Register::EAX);
        Ok(())
    }

    pub fn load_call_register_symbol(&mut self, name: &str, stack: &mut ShadowStack)
    -> Result<()> {
        self.free_up(Register::EAX, stack)?;
        self.asm.mov_ri_fixup(Register::EAX, name);
        self.regs.mark_used(Register::EAX);
        Ok(())
    }

    //-------------------------------------------------------------------------
    // Conversions.

    /**
     * Truncates to 8 bits and re-extends per `ty` (`Byte` or `Ubyte`).
     * `reg` must have a byte form.
     */
    pub fn int_to_byte(&mut self, reg: Register, ty: Type) -> Register {
        self.asm.op_ri(BinaryOp::And, reg, 0xFF);
        if ty == Type::Byte {
            self.asm.movsx_b_rr(reg, reg);
        } else {
            self.asm.movzx_b_rr(reg, reg);
        }
        reg
    }

    /** Truncates to 16 bits and re-extends per `ty` (`Short` or `Ushort`). */
    pub fn int_to_short(&mut self, reg: Register, ty: Type) -> Register {
        self.asm.op_ri(BinaryOp::And, reg, 0xFFFF);
        if ty == Type::Short {
            self.asm.movsx_w_rr(reg, reg);
        } else {
            self.asm.movzx_w_rr(reg, reg);
        }
        reg
    }

    /**
     * Sign-extends the value in `value` into a fresh pair. The sign is not
     * known at compile time, so a run-time test fills the high word.
     * Consumes `value`.
     */
    pub fn int_to_long(&mut self, value: Register) -> Result<Pair> {
        let pair = self.regs.allocate_pair()?;
        self.asm.mov_rr(pair.lo(), value);

        let sign_extend = self.asm.new_label();
        let done = self.asm.new_label();
        self.asm.op_ri(BinaryOp::And, value, 0x8000_0000_u32 as i32);
        self.asm.op_ri(BinaryOp::Cmp, value, 0x8000_0000_u32 as i32);
        self.asm.jump_if(Condition::Z, sign_extend);
        self.asm.mov_ri(pair.hi(), 0);
        self.asm.const_jump(done);
        self.asm.bind(sign_extend)?;
        self.asm.mov_ri(pair.hi(), -1);
        self.asm.bind(done)?;

        self.regs.free(value);
        Ok(pair)
    }

    /** Zero-extends into a fresh pair. Consumes `value`. */
    pub fn uint_to_ulong(&mut self, value: Register) -> Result<Pair> {
        let pair = self.regs.allocate_pair()?;
        self.asm.mov_rr(pair.lo(), value);
        self.asm.mov_ri(pair.hi(), 0);
        self.regs.free(value);
        Ok(pair)
    }

    /** Truncation is free: the high half is released. */
    pub fn long_to_int(&mut self, pair: Pair) -> Register {
        self.regs.free(pair.hi());
        pair.lo()
    }
}

//-----------------------------------------------------------------------------
