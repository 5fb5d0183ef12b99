/*!
 * The instruction selector: one routine per stack-machine operation,
 * dispatching on the kinds of the symbolic operands. The selector decides
 * which values must be committed to registers, which can stay as memory or
 * immediate operands, and which fold away entirely; the [`Emitter`] then
 * produces the instruction sequences.
 */

use super::buffer::{Buffer};
use super::emitter::{
    ArithOp, CompareOp, Emitter, Mul64Frame, Src32, Src64, UnaryOp,
};
use super::error::{CodegenError, Result};
use super::types::{result_type, Type};
use super::value::{Local, ShadowStack, SymbolicValue};
use super::x86::{Address, Label, Pair, Register};
use super::alloc::{RegisterAllocator};

/** The calling convention of an emitted call. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// Plain C-style call; fixup-symbol targets use a relative relocation.
    Normal,
    /// Interpreter convention: the target address also travels in EAX, and
    /// fixup-symbol targets use an absolute relocation.
    Jvm,
}

/**
 * A selector borrows the per-function compilation state for the duration
 * of one operation: the emitter, the shadow stack, and the running local
 * frame extent (from which scratch frame slots are carved).
 */
pub struct Selector<'a, B: Buffer> {
    pub emit: &'a mut Emitter<B>,
    pub stack: &'a mut ShadowStack,
    pub locals_offset: &'a mut i32,
}

impl<'a, B: Buffer> Selector<'a, B> {
    /** Carves a fresh `size`-byte scratch slot out of the frame. */
    fn temp_slot(&mut self, size: i32) -> Address {
        let offset = *self.locals_offset + size;
        *self.locals_offset = offset;
        Address::base_disp(Register::EBP, -offset)
    }

    //-------------------------------------------------------------------------
    // Operand commitment.

    /** Commits a 32-bit value to a register, emitting a load if needed. */
    fn commit32(&mut self, value: SymbolicValue) -> Result<Register> {
        match value {
            SymbolicValue::Reg32 {reg, ..} => Ok(reg),
            SymbolicValue::Literal32 {value, ..} => {
                let reg = self.emit.regs.allocate()?;
                self.emit.load_imm32(value, reg);
                Ok(reg)
            },
            SymbolicValue::Local {local} if local.ty.structure_size() <= 4 => {
                let reg = self.emit.regs.allocate()?;
                self.emit.load_mem32(&local.address(), reg);
                Ok(reg)
            },
            SymbolicValue::Object {label} | SymbolicValue::LabelRef {label} => {
                let reg = self.emit.regs.allocate()?;
                self.emit.load_label(label, reg);
                Ok(reg)
            },
            SymbolicValue::FixupSymbol {name} => {
                let reg = self.emit.regs.allocate()?;
                self.emit.load_symbol(&name, reg);
                Ok(reg)
            },
            _ => Err(CodegenError::TypeMismatch("expected a 32-bit operand")),
        }
    }

    /**
     * As [`commit32`](Selector::commit32), into a register with an 8-bit
     * sub-register, as needed by the narrowing conversions and stores.
     */
    fn commit32_byte(&mut self, value: SymbolicValue) -> Result<Register> {
        match value {
            SymbolicValue::Reg32 {reg, ..} if reg.has_byte_form() => Ok(reg),
            SymbolicValue::Reg32 {reg, ..} => {
                let byte_reg = self.emit.regs.allocate_byte()?;
                self.emit.move32(reg, byte_reg);
                Ok(byte_reg)
            },
            SymbolicValue::Literal32 {value, ..} => {
                let reg = self.emit.regs.allocate_byte()?;
                self.emit.load_imm32(value, reg);
                Ok(reg)
            },
            SymbolicValue::Local {local} => {
                let reg = self.emit.regs.allocate_byte()?;
                self.emit.load_mem32(&local.address(), reg);
                Ok(reg)
            },
            _ => Err(CodegenError::TypeMismatch("expected a 32-bit operand")),
        }
    }

    /** Commits a 64-bit value to a register pair. */
    fn commit64(&mut self, value: SymbolicValue) -> Result<Pair> {
        match value {
            SymbolicValue::Reg64 {pair, ..} => Ok(pair),
            SymbolicValue::Literal64 {value, ..} => {
                let pair = self.emit.regs.allocate_pair()?;
                self.emit.load_imm64(value, pair);
                Ok(pair)
            },
            SymbolicValue::Local {local} if local.ty.structure_size() == 8 => {
                let pair = self.emit.regs.allocate_pair()?;
                self.emit.load_mem64(&local.address(), pair);
                Ok(pair)
            },
            _ => Err(CodegenError::TypeMismatch("expected a 64-bit operand")),
        }
    }

    /**
     * Renders a 32-bit value as a source operand, without committing it to
     * a register unless its kind requires one.
     */
    fn src32(&mut self, value: SymbolicValue) -> Result<Src32> {
        match value {
            SymbolicValue::Literal32 {value, ..} => Ok(Src32::Imm(value)),
            SymbolicValue::Reg32 {reg, ..} => Ok(Src32::Reg(reg)),
            SymbolicValue::Local {local} if local.ty.structure_size() <= 4 =>
                Ok(Src32::Mem(local.address())),
            other @ (SymbolicValue::Object {..}
                | SymbolicValue::LabelRef {..}
                | SymbolicValue::FixupSymbol {..}) =>
                Ok(Src32::Reg(self.commit32(other)?)),
            _ => Err(CodegenError::TypeMismatch("expected a 32-bit operand")),
        }
    }

    fn src64(&mut self, value: SymbolicValue) -> Result<Src64> {
        match value {
            SymbolicValue::Literal64 {value, ..} => Ok(Src64::Imm(value)),
            SymbolicValue::Reg64 {pair, ..} => Ok(Src64::Pair(pair)),
            SymbolicValue::Local {local} if local.ty.structure_size() == 8 =>
                Ok(Src64::Mem(local.address())),
            _ => Err(CodegenError::TypeMismatch("expected a 64-bit operand")),
        }
    }

    //-------------------------------------------------------------------------
    // Local variables and parameters.

    /** Stores `value` into a local or parameter slot. */
    pub fn store(&mut self, local: Local, value: SymbolicValue) -> Result<()> {
        let addr = local.address();
        if local.ty.structure_size() == 8 {
            match value {
                SymbolicValue::Literal64 {value, ..} =>
                    self.emit.store_imm64(value, &addr),
                SymbolicValue::Reg64 {pair, ..} =>
                    self.emit.store_reg64(pair, &addr),
                SymbolicValue::Local {local: src}
                if src.ty.structure_size() == 8 => {
                    let src_addr = src.address();
                    self.emit.store_mem32(&src_addr, &addr)?;
                    self.emit.store_mem32(&src_addr.offset(4), &addr.offset(4))?;
                },
                _ => return Err(CodegenError::TypeMismatch(
                    "store needs a 64-bit value")),
            }
        } else {
            match value {
                SymbolicValue::Literal32 {value, ..} =>
                    self.emit.store_imm32(value, &addr),
                SymbolicValue::Reg32 {reg, ..} =>
                    self.emit.store_reg32(reg, &addr),
                SymbolicValue::Local {local: src}
                if src.ty.structure_size() <= 4 => {
                    self.emit.store_mem32(&src.address(), &addr)?;
                },
                SymbolicValue::Object {label} | SymbolicValue::LabelRef {label} =>
                    self.emit.asm.mov_mi_label(&addr, label),
                SymbolicValue::FixupSymbol {name} =>
                    self.emit.asm.mov_mi_fixup(&addr, &name),
                _ => return Err(CodegenError::TypeMismatch(
                    "store needs a 32-bit value")),
            }
        }
        Ok(())
    }

    /** Duplicates `value`: committed values are copied into fresh storage. */
    pub fn dup(&mut self, value: &SymbolicValue) -> Result<SymbolicValue> {
        match value {
            SymbolicValue::Reg32 {reg, ty, ..} => {
                let copy = self.emit.dup32(*reg)?;
                Ok(SymbolicValue::reg32(copy, *ty))
            },
            SymbolicValue::Reg64 {pair, ty, ..} => {
                let copy = self.emit.dup64(*pair)?;
                Ok(SymbolicValue::reg64(copy, *ty))
            },
            // A local is refreshed into a register so a subsequent store to
            // the slot cannot alias the duplicate.
            SymbolicValue::Local {local} => {
                if local.ty.structure_size() == 8 {
                    let pair = self.emit.regs.allocate_pair()?;
                    self.emit.load_mem64(&local.address(), pair);
                    Ok(SymbolicValue::reg64(pair, local.ty))
                } else {
                    let reg = self.emit.regs.allocate()?;
                    self.emit.load_mem32(&local.address(), reg);
                    Ok(SymbolicValue::reg32(reg, local.ty))
                }
            },
            other => Ok(other.clone()),
        }
    }

    /** Releases whatever storage `value` occupies. */
    pub fn drop_value(&mut self, value: SymbolicValue) {
        match value {
            SymbolicValue::Reg32 {reg, ..} => self.emit.regs.free(reg),
            SymbolicValue::Reg64 {pair, ..} => self.emit.regs.free_pair(pair),
            _ => {},
        }
    }

    /**
     * Loads the parameter word whose index is `index`. Literal indices fold
     * into the addressing mode; computed indices scale at run time. The
     * result is always of type `Int`.
     */
    pub fn load_parm(&mut self, index: SymbolicValue) -> Result<SymbolicValue> {
        let dst = self.emit.regs.allocate()?;
        match index {
            SymbolicValue::Literal32 {value, ..} => {
                let addr = Address::base_disp(Register::EBP, 8 + 4 * value);
                self.emit.load_mem32(&addr, dst);
            },
            other => {
                let idx = self.src32(other)?;
                self.emit.load_parm(idx, dst)?;
            },
        }
        Ok(SymbolicValue::reg32(dst, Type::Int))
    }

    /** Stores `value` into the parameter word whose index is `index`. */
    pub fn store_parm(
        &mut self, value: SymbolicValue, index: SymbolicValue,
    ) -> Result<()> {
        let src = self.commit32(value)?;
        match index {
            SymbolicValue::Literal32 {value, ..} => {
                let addr = Address::base_disp(Register::EBP, 8 + 4 * value);
                self.emit.store_reg32(src, &addr);
            },
            other => {
                let idx = self.src32(other)?;
                self.emit.store_parm(src, idx)?;
            },
        }
        Ok(())
    }

    //-------------------------------------------------------------------------
    // Memory access through pointers.

    /** Commits a pointer-typed value to a register to be read or written. */
    fn commit_pointer(&mut self, addr: SymbolicValue) -> Result<Register> {
        self.commit32(addr)
    }

    /**
     * Reads a `ty`-typed datum through the pointer `addr`. Sub-word reads
     * widen to `Int`; 64-bit reads produce a register pair.
     */
    pub fn read(&mut self, addr: SymbolicValue, ty: Type) -> Result<SymbolicValue> {
        let ptr = self.commit_pointer(addr)?;
        if ty.structure_size() == 8 {
            let pair = self.emit.regs.allocate_pair()?;
            self.emit.read64(ptr, pair);
            Ok(SymbolicValue::reg64(pair, ty))
        } else {
            let dst = self.emit.regs.allocate()?;
            self.emit.read32(ptr, dst, ty)?;
            let result_ty = if ty.is_secondary() { Type::Int } else { ty };
            Ok(SymbolicValue::reg32(dst, result_ty))
        }
    }

    /** Writes `value` as a `ty`-typed datum through the pointer `addr`. */
    pub fn write(
        &mut self, addr: SymbolicValue, value: SymbolicValue, ty: Type,
    ) -> Result<()> {
        let ptr = self.commit_pointer(addr)?;
        match ty.structure_size() {
            8 => match value {
                SymbolicValue::Literal64 {value, ..} =>
                    self.emit.write_imm64(value, ptr),
                other => {
                    let pair = self.commit64(other)?;
                    self.emit.write64(pair, ptr);
                },
            },
            1 | 2 => match value {
                SymbolicValue::Literal32 {value, ..} =>
                    self.emit.write_imm32(value, ptr, ty)?,
                other => {
                    // Narrow stores encode the 8- or 16-bit sub-register.
                    let src = self.commit32_byte(other)?;
                    self.emit.write32(src, ptr, ty)?;
                },
            },
            _ => match value {
                SymbolicValue::Literal32 {value, ..} =>
                    self.emit.write_imm32(value, ptr, ty)?,
                other => {
                    let src = self.commit32(other)?;
                    self.emit.write32(src, ptr, ty)?;
                },
            },
        }
        Ok(())
    }

    //-------------------------------------------------------------------------
    // Arithmetic, logic and comparison.

    /**
     * `op1 op op2`, with the result left in a fresh register value. The
     * result type follows the pointer-widening rule; a 64-bit multiply
     * routes through frame scratch slots and 64-bit division through the
     * runtime helpers.
     */
    pub fn binop(
        &mut self, op: ArithOp, op1: SymbolicValue, op2: SymbolicValue,
    ) -> Result<SymbolicValue> {
        let ty = result_type(op1.ty(), op2.ty());
        if op1.ty().structure_size() == 8 {
            let result = self.binop64(op, op1, op2)?;
            Ok(SymbolicValue::reg64(result, ty))
        } else {
            let dst = self.commit32(op1)?;
            let src = self.src32(op2)?;
            let result = self.emit.arith32(op, dst, src, self.stack)?;
            Ok(SymbolicValue::reg32(result, ty))
        }
    }

    fn binop64(
        &mut self, op: ArithOp, op1: SymbolicValue, op2: SymbolicValue,
    ) -> Result<Pair> {
        match op {
            ArithOp::Mul => {
                let dst = self.commit64(op1)?;
                let src = self.commit64(op2)?;
                let frame = Mul64Frame {
                    op1: self.temp_slot(8),
                    op2: self.temp_slot(8),
                    save_edx: self.temp_slot(4),
                    save_eax: self.temp_slot(4),
                    save_edi: self.temp_slot(4),
                    save_esi: self.temp_slot(4),
                };
                self.emit.mul64(dst, src, &frame)
            },
            ArithOp::Div | ArithOp::Rem => self.long_div(op, op1, op2),
            ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr => {
                let dst = self.commit64(op1)?;
                let count = self.src32(op2)?;
                self.emit.shift64(op, dst, count)
            },
            _ => {
                let dst = self.commit64(op1)?;
                let src = self.src64(op2)?;
                self.emit.arith64(op, dst, src)
            },
        }
    }

    /**
     * 64-bit division and remainder go to the runtime helpers `div64` and
     * `rem64`: divisor pushed first, dividend on top, result in EDX:EAX,
     * sixteen argument bytes unwound by the caller.
     */
    fn long_div(
        &mut self, op: ArithOp, op1: SymbolicValue, op2: SymbolicValue,
    ) -> Result<Pair> {
        let dividend = self.commit64(op1)?;
        let divisor = self.commit64(op2)?;
        self.emit.push_pair(divisor);
        self.emit.push_pair(dividend);
        self.emit.free_up(Register::EAX, self.stack)?;
        self.emit.free_up(Register::EDX, self.stack)?;
        let symbol = if op == ArithOp::Div { "div64" } else { "rem64" };
        let result = self.emit.long_div_call(symbol);
        self.emit.drop_bytes(16);
        Ok(result)
    }

    /** Negation or bitwise complement; the operand type is preserved. */
    pub fn unary(&mut self, op: UnaryOp, value: SymbolicValue)
    -> Result<SymbolicValue> {
        let ty = value.ty();
        if ty.structure_size() == 8 {
            let pair = self.commit64(value)?;
            Ok(SymbolicValue::reg64(self.emit.unary64(op, pair), ty))
        } else {
            let reg = self.commit32(value)?;
            Ok(SymbolicValue::reg32(self.emit.unary32(op, reg), ty))
        }
    }

    /**
     * Compares `op1` with `op2`, signedness taken from the first operand.
     * The result is always an `Int` holding 0 or 1, for 64-bit operands
     * included.
     */
    pub fn compare(
        &mut self, op: CompareOp, op1: SymbolicValue, op2: SymbolicValue,
    ) -> Result<SymbolicValue> {
        let signed = op1.ty().is_signed();
        let result = if op1.ty().structure_size() == 8 {
            let dst = self.commit64(op1)?;
            let src = self.src64(op2)?;
            self.emit.compare64(dst, src, op, signed)?
        } else {
            match (&op1, &op2) {
                // A slot-vs-literal compare needs no register at all.
                (SymbolicValue::Local {local}, SymbolicValue::Literal32 {value, ..})
                if local.ty.structure_size() <= 4 => {
                    self.emit.compare_mem32(&local.address(), *value, op, signed)?
                },
                _ => {
                    let dst = self.commit32(op1)?;
                    let src = self.src32(op2)?;
                    self.emit.compare32(dst, src, op, signed)?
                },
            }
        };
        Ok(SymbolicValue::reg32(result, Type::Int))
    }

    //-------------------------------------------------------------------------
    // Branches.

    /** Branches to `label` if the `Int` condition equals `when`. */
    pub fn branch(
        &mut self, label: Label, condition: SymbolicValue, when: bool,
    ) -> Result<()> {
        match condition {
            SymbolicValue::Reg32 {reg, ..} =>
                self.emit.branch_on(reg, when, label),
            SymbolicValue::Local {local} =>
                self.emit.branch_on_mem(&local.address(), when, label),
            other => {
                let reg = self.commit32(other)?;
                self.emit.branch_on(reg, when, label);
            },
        }
        Ok(())
    }

    /** As [`branch`](Selector::branch), to a known code offset. */
    pub fn branch_to_offset(
        &mut self, target: usize, condition: SymbolicValue, when: bool,
    ) -> Result<()> {
        match condition {
            SymbolicValue::Reg32 {reg, ..} =>
                self.emit.branch_on_abs(reg, when, target),
            SymbolicValue::Local {local} =>
                self.emit.branch_on_mem_abs(&local.address(), when, target),
            other => {
                let reg = self.commit32(other)?;
                self.emit.branch_on_abs(reg, when, target);
            },
        }
        Ok(())
    }

    /** A computed goto: jumps to the address in `target`. */
    pub fn jump(&mut self, target: SymbolicValue) -> Result<()> {
        match target {
            SymbolicValue::Reg32 {reg, ..} => self.emit.jump_reg(reg),
            SymbolicValue::Literal32 {value, ..} =>
                self.emit.jump_to(value as usize),
            SymbolicValue::Local {local} =>
                self.emit.jump_mem(&local.address()),
            SymbolicValue::LabelRef {label} => self.emit.jump(label),
            _ => return Err(CodegenError::IllegalOperand(
                "jump needs a 32-bit address")),
        }
        Ok(())
    }

    //-------------------------------------------------------------------------
    // Native-stack transfers.

    /** Pushes `value` onto the native runtime stack. */
    pub fn push(&mut self, value: SymbolicValue) -> Result<()> {
        match value {
            SymbolicValue::Literal32 {value, ..} => self.emit.push_imm(value),
            SymbolicValue::Literal64 {value, ..} => self.emit.push_imm64(value),
            SymbolicValue::Reg32 {reg, ..} => self.emit.push_reg(reg),
            SymbolicValue::Reg64 {pair, ..} => self.emit.push_pair(pair),
            SymbolicValue::Local {local} => {
                if local.ty.structure_size() == 8 {
                    self.emit.push_mem64(&local.address());
                } else {
                    self.emit.push_mem(&local.address());
                }
            },
            SymbolicValue::Object {label} | SymbolicValue::LabelRef {label} =>
                self.emit.push_label_addr(label),
            SymbolicValue::FixupSymbol {name} => self.emit.push_symbol(&name),
        }
        Ok(())
    }

    /** Pops a `ty`-typed value off the native runtime stack. */
    pub fn pop(&mut self, ty: Type) -> Result<SymbolicValue> {
        if ty.structure_size() == 8 {
            let pair = self.emit.regs.allocate_pair()?;
            self.emit.pop_pair(pair);
            Ok(SymbolicValue::reg64(pair, ty))
        } else {
            let reg = self.emit.regs.allocate()?;
            self.emit.pop_reg(reg);
            Ok(SymbolicValue::reg32(reg, ty))
        }
    }

    //-------------------------------------------------------------------------
    // Forcing and conversion.

    /**
     * Reinterprets `value` as type `to` without emitting code. The storage
     * shape has been checked by the driver.
     */
    pub fn force(&mut self, value: SymbolicValue, to: Type) -> SymbolicValue {
        match value {
            SymbolicValue::Literal32 {value, ..} =>
                SymbolicValue::Literal32 {value, ty: to},
            SymbolicValue::Literal64 {value, ..} =>
                SymbolicValue::Literal64 {value, ty: to},
            SymbolicValue::Reg32 {reg, spilled, ..} =>
                SymbolicValue::Reg32 {reg, ty: to, spilled},
            SymbolicValue::Reg64 {pair, spilled, ..} =>
                SymbolicValue::Reg64 {pair, ty: to, spilled},
            SymbolicValue::Local {local} =>
                SymbolicValue::Local {local: Local {ty: to, ..local}},
            other => other,
        }
    }

    /** Converts `value` to type `to`, emitting extension or truncation. */
    pub fn convert(&mut self, value: SymbolicValue, to: Type)
    -> Result<SymbolicValue> {
        match (value.ty().primitive(), to) {
            (Type::Int, Type::Byte | Type::Ubyte) => {
                let reg = self.commit32_byte(value)?;
                Ok(SymbolicValue::reg32(self.emit.int_to_byte(reg, to), to))
            },
            (Type::Int, Type::Short | Type::Ushort) => {
                let reg = self.commit32_byte(value)?;
                Ok(SymbolicValue::reg32(self.emit.int_to_short(reg, to), to))
            },
            (Type::Int, Type::Long) => match value {
                // The sign of a literal folds at compile time.
                SymbolicValue::Literal32 {value, ..} =>
                    Ok(SymbolicValue::Literal64 {value: value as i64, ty: to}),
                other => {
                    let reg = self.commit32(other)?;
                    let pair = self.emit.int_to_long(reg)?;
                    Ok(SymbolicValue::reg64(pair, to))
                },
            },
            (Type::Uint, Type::Ulong) => match value {
                SymbolicValue::Literal32 {value, ..} => Ok(SymbolicValue::Literal64 {
                    value: value as u32 as i64,
                    ty: to,
                }),
                other => {
                    let reg = self.commit32(other)?;
                    let pair = self.emit.uint_to_ulong(reg)?;
                    Ok(SymbolicValue::reg64(pair, to))
                },
            },
            (Type::Long, Type::Int) | (Type::Ulong, Type::Uint) => match value {
                SymbolicValue::Literal64 {value, ..} =>
                    Ok(SymbolicValue::Literal32 {value: value as i32, ty: to}),
                SymbolicValue::Local {local} => {
                    let reg = self.emit.regs.allocate()?;
                    self.emit.load_mem32(&local.address(), reg);
                    Ok(SymbolicValue::reg32(reg, to))
                },
                other => {
                    let pair = self.commit64(other)?;
                    Ok(SymbolicValue::reg32(self.emit.long_to_int(pair), to))
                },
            },
            (Type::Float | Type::Double, _) | (_, Type::Float | Type::Double) =>
                Err(CodegenError::Unsupported("floating-point conversions")),
            _ => Err(CodegenError::IllegalOperand("no such conversion")),
        }
    }

    //-------------------------------------------------------------------------
    // Calls and returns.

    /**
     * Calls the function at `address` with `nparms` arguments taken from
     * the shadow stack. Live caller-saved registers left on the shadow
     * stack are spilled around the call; arguments go out right to left;
     * the return value (per `ty`) lands back on the shadow stack.
     */
    pub fn call(
        &mut self,
        address: SymbolicValue,
        nparms: usize,
        ty: Type,
        convention: Convention,
    ) -> Result<()> {
        let mut params = Vec::with_capacity(nparms);
        for _ in 0..nparms {
            let param = self.stack.pop()
                .ok_or(CodegenError::Misuse("call with too few operands"))?;
            params.push(param);
        }

        let spilled = self.spill_live_registers();

        let mut param_bytes = 0;
        for param in params.into_iter().rev() {
            param_bytes += param.param_bytes();
            self.push(param)?;
        }

        self.dispatch_call(address, convention)?;

        match ty {
            Type::Void => {},
            Type::Int | Type::Uint | Type::Ref | Type::Oop => {
                self.emit.regs.mark_used(Register::EAX);
                self.stack.push(SymbolicValue::reg32(Register::EAX, ty));
            },
            Type::Long | Type::Ulong => {
                self.emit.regs.mark_used_pair(Pair::EDXEAX);
                self.stack.push(SymbolicValue::reg64(Pair::EDXEAX, ty));
            },
            _ => return Err(CodegenError::TypeMismatch(
                "call can only return a primary type")),
        }

        self.emit.drop_bytes(param_bytes);
        if spilled {
            self.unspill_live_registers();
        }
        Ok(())
    }

    fn dispatch_call(&mut self, address: SymbolicValue, convention: Convention)
    -> Result<()> {
        match address {
            SymbolicValue::Literal32 {value, ..} => {
                if convention == Convention::Jvm {
                    self.emit.load_call_register(Src32::Imm(value), self.stack)?;
                }
                self.emit.call_addr(value);
            },
            SymbolicValue::Reg32 {reg, ..} => {
                if convention == Convention::Jvm {
                    self.emit.load_call_register(Src32::Reg(reg), self.stack)?;
                }
                self.emit.call_reg(reg);
            },
            SymbolicValue::LabelRef {label} => {
                if convention == Convention::Jvm {
                    self.emit.load_call_register_label(label, self.stack)?;
                }
                self.emit.call_label(label);
            },
            SymbolicValue::FixupSymbol {name} => match convention {
                Convention::Normal => self.emit.call_symbol(&name),
                Convention::Jvm => {
                    self.emit.load_call_register_symbol(&name, self.stack)?;
                    self.emit.call_reg(Register::EAX);
                },
            },
            SymbolicValue::Local {local} => {
                self.emit.call_mem(&local.address());
            },
            _ => return Err(CodegenError::IllegalOperand(
                "call needs a 32-bit address")),
        }
        Ok(())
    }

    /**
     * Pushes every shadow-stack-resident register the callee may clobber,
     * top of stack first, tagging the entries as spilled.
     */
    fn spill_live_registers(&mut self) -> bool {
        let mut spilled = false;
        for i in (0..self.stack.len()).rev() {
            let replacement = match self.stack.element_at(i) {
                Some(&SymbolicValue::Reg32 {reg, ty, spilled: false})
                if !RegisterAllocator::is_abi_preserved(reg) => {
                    self.emit.spill(reg);
                    Some(SymbolicValue::Reg32 {reg, ty, spilled: true})
                },
                Some(&SymbolicValue::Reg64 {pair, ty, spilled: false})
                if !RegisterAllocator::is_abi_preserved(pair.hi())
                    || !RegisterAllocator::is_abi_preserved(pair.lo()) => {
                    self.emit.spill_pair(pair);
                    Some(SymbolicValue::Reg64 {pair, ty, spilled: true})
                },
                _ => None,
            };
            if let Some(value) = replacement {
                if let Some(slot) = self.stack.element_at_mut(i) {
                    *slot = value;
                }
                spilled = true;
            }
        }
        spilled
    }

    /** Pops the spilled registers back, in reverse order of the pushes. */
    fn unspill_live_registers(&mut self) {
        for i in 0..self.stack.len() {
            let replacement = match self.stack.element_at(i) {
                Some(&SymbolicValue::Reg32 {reg, ty, spilled: true}) => {
                    self.emit.unspill(reg);
                    Some(SymbolicValue::Reg32 {reg, ty, spilled: false})
                },
                Some(&SymbolicValue::Reg64 {pair, ty, spilled: true}) => {
                    self.emit.unspill_pair(pair);
                    Some(SymbolicValue::Reg64 {pair, ty, spilled: false})
                },
                _ => None,
            };
            if let Some(value) = replacement {
                if let Some(slot) = self.stack.element_at_mut(i) {
                    *slot = value;
                }
            }
        }
    }

    /**
     * Moves the return value into the convention's registers (EAX, or
     * EDX:EAX for 64-bit values) and jumps to the shared epilogue.
     */
    pub fn ret(&mut self, value: SymbolicValue) -> Result<()> {
        if value.ty().structure_size() == 8 {
            let src = self.src64(value)?;
            self.emit.load_return64(src);
            if let Src64::Pair(pair) = src {
                self.emit.regs.free_pair(pair);
            }
            self.emit.regs.free_pair(Pair::EDXEAX);
        } else {
            let src = self.src32(value)?;
            self.emit.load_return32(src);
            if let Src32::Reg(reg) = src {
                self.emit.regs.free(reg);
            }
            self.emit.regs.free(Register::EAX);
        }
        self.emit.branch_to_leave();
        Ok(())
    }

    //-------------------------------------------------------------------------
    // Dynamic stack allocation.

    /**
     * Grows the dynamic stack area by `size` bytes, recording the new
     * extent in the stack-segment slot when one has been declared. The
     * result is the new stack extent, as a `Ref`.
     */
    pub fn alloca(
        &mut self, size: SymbolicValue, ss_slot: Option<Address>,
    ) -> Result<SymbolicValue> {
        match size {
            SymbolicValue::Literal32 {value, ..} => self.emit.alloca_imm(value),
            SymbolicValue::Reg32 {reg, ..} => self.emit.alloca_reg(reg),
            SymbolicValue::Local {local} =>
                self.emit.alloca_mem(&local.address()),
            _ => return Err(CodegenError::IllegalOperand(
                "alloca needs a 32-bit size")),
        }
        if let Some(slot) = ss_slot {
            self.emit.save_stack_segment(&slot);
        }
        Ok(SymbolicValue::reg32(Register::ESP, Type::Ref))
    }

    /** Restores ESP from the saved stack-segment slot. */
    pub fn pop_all(&mut self, ss_slot: &Address) {
        self.emit.asm.mov_rm(Register::ESP, ss_slot);
    }

    /** Loads the receiver from the top of the runtime stack, as an `Oop`. */
    pub fn peek_receiver(&mut self) -> Result<SymbolicValue> {
        let reg = self.emit.peek_receiver()?;
        Ok(SymbolicValue::reg32(reg, Type::Oop))
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::buffer::{VecU8};
    use super::super::x86::assembler::tests::{disassemble, new_assembler};
    use Register::*;

    struct Fixture {
        emit: Emitter<VecU8>,
        stack: ShadowStack,
        locals_offset: i32,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                emit: Emitter::new(new_assembler()),
                stack: ShadowStack::new(),
                locals_offset: 0,
            }
        }

        fn select(&mut self) -> Selector<'_, VecU8> {
            Selector {
                emit: &mut self.emit,
                stack: &mut self.stack,
                locals_offset: &mut self.locals_offset,
            }
        }

        fn code(&self) -> &[u8] {
            let len = self.emit.asm.get_pos();
            &self.emit.asm.buffer[..len]
        }
    }

    fn int_local(slot_offset: i32) -> Local {
        Local {ty: Type::Int, slot_offset, is_param: false}
    }

    #[test]
    fn store_dispatches_on_value_kind() {
        let mut f = Fixture::new();
        f.emit.regs.mark_used(EBX);
        let slot = int_local(0);
        f.select().store(slot, SymbolicValue::Literal32 {
            value: 7, ty: Type::Int,
        }).unwrap();
        f.select().store(slot, SymbolicValue::reg32(EBX, Type::Int)).unwrap();
        f.select().store(slot, SymbolicValue::Local {local: int_local(4)})
            .unwrap();
        disassemble(f.code(), vec![
            "mov dword [ebp-4],7",
            "mov [ebp-4],ebx",
            "mov eax,[ebp-8]",
            "mov [ebp-4],eax",
        ]).unwrap();
        assert!(f.emit.regs.is_free(EBX));
        assert!(f.emit.regs.is_free(EAX));
    }

    #[test]
    fn binop_folds_literal_source() {
        let mut f = Fixture::new();
        let result = f.select().binop(
            ArithOp::Add,
            SymbolicValue::Local {local: int_local(0)},
            SymbolicValue::Literal32 {value: 5, ty: Type::Int},
        ).unwrap();
        assert_eq!(result, SymbolicValue::reg32(EAX, Type::Int));
        disassemble(f.code(), vec![
            "mov eax,[ebp-4]",
            "add eax,5",
        ]).unwrap();
    }

    #[test]
    fn binop_widens_pointer_operands() {
        let mut f = Fixture::new();
        f.emit.regs.mark_used(EAX);
        f.emit.regs.mark_used(EDX);
        let result = f.select().binop(
            ArithOp::Add,
            SymbolicValue::reg32(EAX, Type::Oop),
            SymbolicValue::reg32(EDX, Type::Int),
        ).unwrap();
        assert_eq!(result.ty(), Type::Ref);
        disassemble(f.code(), vec![
            "add eax,edx",
        ]).unwrap();
        assert!(f.emit.regs.is_free(EDX));
    }

    #[test]
    fn long_multiply_uses_frame_scratch() {
        let mut f = Fixture::new();
        f.emit.regs.mark_used_pair(Pair::EDIESI);
        f.emit.regs.mark_used_pair(Pair::EBXECX);
        f.select().binop(
            ArithOp::Mul,
            SymbolicValue::reg64(Pair::EDIESI, Type::Long),
            SymbolicValue::reg64(Pair::EBXECX, Type::Long),
        ).unwrap();
        // Two 8-byte operand slots and four 4-byte register saves.
        assert_eq!(f.locals_offset, 32);
        assert!(f.emit.regs.is_free(EBX));
        assert!(f.emit.regs.is_free(ECX));
    }

    #[test]
    fn long_division_calls_the_runtime() {
        let mut f = Fixture::new();
        f.emit.regs.mark_used_pair(Pair::EDIESI);
        f.emit.regs.mark_used_pair(Pair::EBXECX);
        let result = f.select().binop(
            ArithOp::Div,
            SymbolicValue::reg64(Pair::EDIESI, Type::Long),
            SymbolicValue::reg64(Pair::EBXECX, Type::Long),
        ).unwrap();
        assert_eq!(result, SymbolicValue::reg64(Pair::EDXEAX, Type::Long));
        disassemble(f.code(), vec![
            "push ebx",
            "push ecx",
            "push edi",
            "push esi",
            "call 9",   // unresolved symbol site holds zero
            "add esp,10h",
        ]).unwrap();
        assert_eq!(f.emit.asm.fixup_info().len(), 1);
    }

    #[test]
    fn compare_against_slot_stays_in_memory() {
        let mut f = Fixture::new();
        let result = f.select().compare(
            CompareOp::Eq,
            SymbolicValue::Local {local: int_local(0)},
            SymbolicValue::Literal32 {value: 3, ty: Type::Int},
        ).unwrap();
        assert_eq!(result, SymbolicValue::reg32(EAX, Type::Int));
        disassemble(f.code(), vec![
            "cmp dword [ebp-4],3",
            "mov eax,0",
            "sete al",
        ]).unwrap();
    }

    #[test]
    fn long_compare_result_is_int() {
        let mut f = Fixture::new();
        f.emit.regs.mark_used_pair(Pair::EDIESI);
        let result = f.select().compare(
            CompareOp::Lt,
            SymbolicValue::reg64(Pair::EDIESI, Type::Long),
            SymbolicValue::Literal64 {value: 0, ty: Type::Long},
        ).unwrap();
        assert_eq!(result.ty(), Type::Int);
    }

    #[test]
    fn read_widens_subword_to_int() {
        let mut f = Fixture::new();
        f.emit.regs.mark_used(ECX);
        let result = f.select().read(
            SymbolicValue::reg32(ECX, Type::Ref), Type::Byte,
        ).unwrap();
        assert_eq!(result, SymbolicValue::reg32(EAX, Type::Int));
        disassemble(f.code(), vec![
            "movsx eax,byte [ecx]",
        ]).unwrap();
        assert!(f.emit.regs.is_free(ECX));
    }

    #[test]
    fn narrow_write_moves_to_byte_register() {
        let mut f = Fixture::new();
        f.emit.regs.mark_used(ECX);
        f.emit.regs.mark_used(ESI);
        f.select().write(
            SymbolicValue::reg32(ECX, Type::Ref),
            SymbolicValue::reg32(ESI, Type::Int),
            Type::Byte,
        ).unwrap();
        // ESI has no 8-bit form; the value detours through EAX.
        disassemble(f.code(), vec![
            "mov eax,esi",
            "mov [ecx],al",
        ]).unwrap();
        assert!(f.emit.regs.is_free(EAX));
        assert!(f.emit.regs.is_free(ECX));
        assert!(f.emit.regs.is_free(ESI));
    }

    #[test]
    fn literal_parm_index_folds() {
        let mut f = Fixture::new();
        let result = f.select().load_parm(SymbolicValue::Literal32 {
            value: 1, ty: Type::Int,
        }).unwrap();
        assert_eq!(result, SymbolicValue::reg32(EAX, Type::Int));
        disassemble(f.code(), vec![
            "mov eax,[ebp+0Ch]",
        ]).unwrap();
    }

    #[test]
    fn computed_parm_index_scales() {
        let mut f = Fixture::new();
        f.emit.regs.mark_used(EDX);
        f.select().load_parm(SymbolicValue::reg32(EDX, Type::Int)).unwrap();
        disassemble(f.code(), vec![
            "mov eax,[ebp+edx*4+8]",
        ]).unwrap();
        assert!(f.emit.regs.is_free(EDX));
    }

    #[test]
    fn call_spills_caller_saved_registers() {
        let mut f = Fixture::new();
        f.emit.regs.mark_used(EAX);
        f.emit.regs.mark_used(EDX);
        f.emit.regs.mark_used(EBX);
        f.stack.push(SymbolicValue::reg32(EAX, Type::Int));
        f.stack.push(SymbolicValue::reg32(EBX, Type::Int));
        f.stack.push(SymbolicValue::reg32(EDX, Type::Int));
        f.select().call(
            SymbolicValue::FixupSymbol {name: "helper".to_string()},
            1, Type::Void, Convention::Normal,
        ).unwrap();
        // EDX is the argument; EAX spills around the call, EBX is
        // ABI-preserved and stays put.
        disassemble(f.code(), vec![
            "push eax",
            "push edx",
            "call 7",
            "add esp,4",
            "pop eax",
        ]).unwrap();
        assert_eq!(f.stack.len(), 2);
        match f.stack.element_at(0) {
            Some(SymbolicValue::Reg32 {reg, spilled, ..}) => {
                assert_eq!(*reg, EAX);
                assert!(!spilled);
            },
            other => panic!("unexpected value: {:?}", other),
        }
    }

    #[test]
    fn call_return_value_lands_on_the_stack() {
        let mut f = Fixture::new();
        f.select().call(
            SymbolicValue::FixupSymbol {name: "getval".to_string()},
            0, Type::Int, Convention::Normal,
        ).unwrap();
        assert_eq!(
            f.stack.pop(),
            Some(SymbolicValue::reg32(EAX, Type::Int)),
        );
        assert!(!f.emit.regs.is_free(EAX));
    }

    #[test]
    fn jvm_call_loads_the_call_register() {
        let mut f = Fixture::new();
        f.emit.regs.mark_used(ECX);
        f.select().call(
            SymbolicValue::reg32(ECX, Type::Ref),
            0, Type::Void, Convention::Jvm,
        ).unwrap();
        disassemble(f.code(), vec![
            "mov eax,ecx",
            "call ecx",
        ]).unwrap();
    }

    #[test]
    fn conversions_fold_literals() {
        let mut f = Fixture::new();
        let widened = f.select().convert(
            SymbolicValue::Literal32 {value: -2, ty: Type::Int}, Type::Long,
        ).unwrap();
        assert_eq!(widened, SymbolicValue::Literal64 {value: -2, ty: Type::Long});
        let narrowed = f.select().convert(
            SymbolicValue::Literal64 {value: 0x1_0000_0005, ty: Type::Long},
            Type::Int,
        ).unwrap();
        assert_eq!(narrowed, SymbolicValue::Literal32 {value: 5, ty: Type::Int});
        assert_eq!(f.emit.asm.get_pos(), 0);
    }

    #[test]
    fn ret_moves_the_value_to_eax() {
        let mut f = Fixture::new();
        f.emit.enter(None).unwrap();
        f.emit.regs.mark_used(EDX);
        f.select().ret(SymbolicValue::reg32(EDX, Type::Int)).unwrap();
        f.emit.leave(0).unwrap();
        disassemble(f.code(), vec![
            "push ebp",
            "mov ebp,esp",
            "sub esp,0",
            "nop",
            "nop",
            "nop",
            "mov eax,edx",
            "jmp 00000010h",
            "mov esp,ebp",
            "pop ebp",
            "ret",
        ]).unwrap();
        assert!(f.emit.regs.is_free(EAX));
        assert!(f.emit.regs.is_free(EDX));
    }

    #[test]
    fn alloca_tracks_the_stack_segment() {
        let mut f = Fixture::new();
        let ss = Address::base_disp(EBP, -8);
        let result = f.select().alloca(
            SymbolicValue::Literal32 {value: 12, ty: Type::Int}, Some(ss),
        ).unwrap();
        assert_eq!(result, SymbolicValue::reg32(ESP, Type::Ref));
        disassemble(f.code(), vec![
            "sub esp,0Ch",
            "mov [ebp-8],esp",
        ]).unwrap();
    }
}
