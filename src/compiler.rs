/*!
 * The compiler driver: a fluent, stack-machine-shaped API over one function
 * at a time. The driver owns the shadow stack and the per-function context
 * (parameters, locals, frame extent, result type, scope depth), validates
 * each operation's typing rules, and hands the operand dispatch to the
 * [`Selector`].
 */

use indexmap::{IndexMap};

use super::buffer::{Buffer, VecU8};
use super::emitter::{ArithOp, CompareOp, Emitter, Preamble, UnaryOp};
use super::error::{CodegenError, Result};
use super::select::{Convention, Selector};
use super::types::{Type};
use super::value::{DataValue, Local, ShadowStack, SymbolicValue};
use super::x86::{Address, Assembler, Label, Register};

/** What the prologue leaves in the method-pointer slot. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleKind {
    /// Nothing; the function has no method-pointer slot.
    None,
    /// Literal zero.
    Null,
    /// The method pointer passed by the caller in the fixed call register.
    Register,
    /// The address of the function itself.
    Address,
}

/**
 * The frame layout summary captured at [`leave`](Compiler::leave): slot
 * counts for parameters and locals, plus oop maps with one bit per slot,
 * set for the slots the garbage collector must scan.
 */
#[derive(Debug, Clone, Default)]
pub struct MethodMap {
    local_slots: usize,
    local_oop_map: Vec<u8>,
    param_slots: usize,
    param_oop_map: Vec<u8>,
}

impl MethodMap {
    pub fn new() -> Self {
        MethodMap::default()
    }

    pub fn local_slots(&self) -> usize { self.local_slots }
    pub fn local_oop_map(&self) -> &[u8] { &self.local_oop_map }
    pub fn param_slots(&self) -> usize { self.param_slots }
    pub fn param_oop_map(&self) -> &[u8] { &self.param_oop_map }
}

/** One bit per slot, slot 0 in the least significant bit of byte 0. */
fn oop_map(slots: &[Local]) -> Vec<u8> {
    let mut map = vec![0u8; (slots.len() + 7) / 8];
    for (i, local) in slots.iter().enumerate() {
        if local.ty == Type::Oop {
            map[i / 8] |= 1 << (i % 8);
        }
    }
    map
}

//-----------------------------------------------------------------------------

/**
 * Compiles one function at a time into machine code. Operations mirror the
 * source stack machine: operands are pushed symbolically and committed to
 * registers as late as possible. Every fluent method returns
 * `Result<&mut Self>` so a malformed program aborts the unit via `?`.
 */
#[derive(Debug)]
pub struct Compiler<B: Buffer> {
    emit: Emitter<B>,
    stack: ShadowStack,
    params: Vec<Local>,
    locals: Vec<Local>,
    locals_offset: i32,
    result_ty: Type,
    scope_depth: i32,
    preamble: PreambleKind,
    mp_declared: bool,
    entry: Option<Label>,
    ss_slot: Option<Address>,
    forward_branches: IndexMap<Label, ShadowStack>,
    relocation_info: Vec<i32>,
}

impl Compiler<VecU8> {
    pub fn new() -> Self {
        Compiler::with_buffer(VecU8::new())
    }
}

impl Default for Compiler<VecU8> {
    fn default() -> Self { Compiler::new() }
}

impl<B: Buffer> Compiler<B> {
    pub fn with_buffer(buffer: B) -> Self {
        Compiler {
            emit: Emitter::new(Assembler::new(buffer)),
            stack: ShadowStack::new(),
            params: Vec::new(),
            locals: Vec::new(),
            locals_offset: 0,
            result_ty: Type::Void,
            scope_depth: 0,
            preamble: PreambleKind::None,
            mp_declared: false,
            entry: None,
            ss_slot: None,
            forward_branches: IndexMap::new(),
            relocation_info: Vec::new(),
        }
    }

    fn select(&mut self) -> Selector<'_, B> {
        Selector {
            emit: &mut self.emit,
            stack: &mut self.stack,
            locals_offset: &mut self.locals_offset,
        }
    }

    fn pop_operand(&mut self) -> Result<SymbolicValue> {
        self.stack.pop().ok_or(CodegenError::Misuse("evaluation stack is empty"))
    }

    //-------------------------------------------------------------------------
    // Labels.

    /** A fresh, unbound label. */
    pub fn label(&mut self) -> Label {
        self.emit.asm.new_label()
    }

    /**
     * Binds `label` to the current code position. If the label was the
     * target of a forward branch, the shadow stack recorded at the branch
     * site replaces the current one.
     */
    pub fn bind(&mut self, label: Label) -> Result<&mut Self> {
        if let Some(snapshot) = self.forward_branches.shift_remove(&label) {
            self.stack = snapshot;
        }
        self.emit.asm.bind(label)?;
        Ok(self)
    }

    //-------------------------------------------------------------------------
    // Function definition.

    /**
     * Starts a function: resets the per-function context and emits the
     * prologue. The frame-allocation instruction is patched with the final
     * frame size at [`leave`](Compiler::leave).
     */
    pub fn enter(&mut self, label: Option<Label>, preamble: PreambleKind)
    -> Result<&mut Self> {
        self.params.clear();
        self.locals.clear();
        self.locals_offset = 0;
        self.result_ty = Type::Void;
        self.scope_depth = 0;
        self.stack.clear();
        self.ss_slot = None;
        self.preamble = preamble;
        self.mp_declared = false;
        self.entry = if preamble == PreambleKind::Address {
            let entry = self.emit.asm.new_label();
            self.emit.asm.bind(entry)?;
            Some(entry)
        } else {
            None
        };
        self.emit.enter(label)?;
        Ok(self)
    }

    /** Declares the function's result type. */
    pub fn result(&mut self, ty: Type) -> &mut Self {
        self.result_ty = ty;
        self
    }

    /**
     * Ends the function: emits the shared epilogue, patches the frame size,
     * flushes deferred data, and (optionally) captures the frame layout.
     */
    pub fn leave(&mut self, map: Option<&mut MethodMap>) -> Result<&mut Self> {
        if self.scope_depth != 0 {
            return Err(CodegenError::Misuse("leave inside an open scope"));
        }
        if self.preamble != PreambleKind::None && !self.mp_declared {
            return Err(CodegenError::Misuse(
                "preamble declared but no MP slot"));
        }
        self.emit.leave(self.locals_offset)?;
        if let Some(map) = map {
            map.local_slots = self.locals.len();
            map.local_oop_map = oop_map(&self.locals);
            map.param_slots = self.params.len();
            map.param_oop_map = oop_map(&self.params);
        }
        Ok(self)
    }

    pub fn begin(&mut self) -> &mut Self {
        self.scope_depth += 1;
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.scope_depth -= 1;
        self
    }

    //-------------------------------------------------------------------------
    // Parameter and local declaration.

    /** Declares the next parameter; slots are assigned left to right. */
    pub fn parm(&mut self, ty: Type) -> Local {
        let slot_offset: i32 = self.params.iter()
            .map(|p| p.ty.structure_size() as i32)
            .sum();
        let param = Local {ty, slot_offset, is_param: true};
        self.params.push(param);
        param
    }

    /**
     * Declares the next local variable. Declaring an `Mp` local emits the
     * preamble store into its slot; declaring an `Ss` local records the
     * slot used to track the dynamic stack extent.
     */
    pub fn local(&mut self, ty: Type) -> Result<Local> {
        let local = Local {ty, slot_offset: self.locals_offset, is_param: false};
        self.locals_offset += ty.structure_size() as i32;
        self.locals.push(local);
        match ty {
            Type::Mp => {
                let preamble = match self.preamble {
                    PreambleKind::None => Preamble::None,
                    PreambleKind::Null => Preamble::Null,
                    PreambleKind::Register => Preamble::Register,
                    PreambleKind::Address => {
                        let entry = self.entry
                            .ok_or(CodegenError::Misuse("no entry label"))?;
                        Preamble::Address(entry)
                    },
                };
                self.emit.local_mp(preamble)?;
                self.mp_declared = true;
            },
            Type::Ss => self.ss_slot = Some(local.address()),
            _ => {},
        }
        Ok(local)
    }

    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /** The number of symbolic values currently on the shadow stack. */
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    //-------------------------------------------------------------------------
    // Literals, loads and stores.

    /** Pushes a 32-bit integer literal. */
    pub fn literal(&mut self, n: i32) -> &mut Self {
        self.stack.push(SymbolicValue::Literal32 {value: n, ty: Type::Int});
        self
    }

    /** Pushes a 64-bit integer literal. */
    pub fn literal64(&mut self, n: i64) -> &mut Self {
        self.stack.push(SymbolicValue::Literal64 {value: n, ty: Type::Long});
        self
    }

    pub fn literal_bool(&mut self, n: bool) -> &mut Self {
        self.literal(if n { 1 } else { 0 })
    }

    /** Pushes the address of a code label. */
    pub fn literal_label(&mut self, label: Label) -> &mut Self {
        self.stack.push(SymbolicValue::LabelRef {label});
        self
    }

    /**
     * Pushes the address of a constant datum, queued for emission after
     * the epilogue.
     */
    pub fn literal_object(&mut self, value: DataValue) -> &mut Self {
        let label = self.emit.asm.new_label();
        self.emit.defer_data(label, value);
        self.stack.push(SymbolicValue::Object {label});
        self
    }

    /** Pushes the address of an external symbol, resolved by the linker. */
    pub fn symbol(&mut self, name: &str) -> &mut Self {
        self.stack.push(SymbolicValue::FixupSymbol {name: name.to_string()});
        self
    }

    /** Queues a data block for emission after the epilogue. */
    pub fn data(&mut self, label: Label, value: DataValue) -> &mut Self {
        self.emit.defer_data(label, value);
        self
    }

    /** Pushes the value of a local or parameter; no code is emitted. */
    pub fn load(&mut self, local: Local) -> &mut Self {
        self.stack.push(SymbolicValue::Local {local});
        self
    }

    /** Pops a value and stores it into a local or parameter slot. */
    pub fn store(&mut self, local: Local) -> Result<&mut Self> {
        let value = self.pop_operand()?;
        if !(local.ty.is_primary() || local.ty.is_pointer()) {
            return Err(CodegenError::TypeMismatch(
                "store needs a primary or pointer slot"));
        }
        if !(value.ty().is_primary() || value.ty().is_pointer()) {
            return Err(CodegenError::TypeMismatch(
                "store needs a primary or pointer value"));
        }
        self.select().store(local, value)?;
        Ok(self)
    }

    /** Pops a pointer and pushes the `ty`-typed datum it points at. */
    pub fn read(&mut self, ty: Type) -> Result<&mut Self> {
        let addr = self.pop_operand()?;
        if !addr.ty().is_pointer() {
            return Err(CodegenError::TypeMismatch("read needs a pointer"));
        }
        if !(ty.is_primary() || ty.is_secondary()) {
            return Err(CodegenError::TypeMismatch(
                "read needs a primary or secondary type"));
        }
        let value = self.select().read(addr, ty)?;
        self.stack.push(value);
        Ok(self)
    }

    /** Pops a pointer, then a value, and stores the value through it. */
    pub fn write(&mut self, ty: Type) -> Result<&mut Self> {
        let addr = self.pop_operand()?;
        let value = self.pop_operand()?;
        if addr.ty().primitive() != Type::Ref {
            return Err(CodegenError::TypeMismatch("write needs a pointer"));
        }
        if ty.primitive() != value.ty().primitive() {
            return Err(CodegenError::TypeMismatch(
                "write value disagrees with the given type"));
        }
        self.select().write(addr, value, ty)?;
        Ok(self)
    }

    //-------------------------------------------------------------------------
    // Stack manipulation.

    /** Duplicates the top of the stack. */
    pub fn dup(&mut self) -> Result<&mut Self> {
        let tos = self.pop_operand()?;
        let copy = self.select().dup(&tos)?;
        self.stack.push(copy);
        self.stack.push(tos);
        Ok(self)
    }

    /**
     * Duplicates the receiver of a call about to be assembled. Parameters
     * are pushed right to left here, so the receiver is the top element.
     */
    pub fn dup_receiver(&mut self) -> Result<&mut Self> {
        self.dup()
    }

    /** Pops and discards the top of the stack, releasing its registers. */
    pub fn drop_top(&mut self) -> Result<&mut Self> {
        let tos = self.pop_operand()?;
        self.select().drop_value(tos);
        Ok(self)
    }

    /** Discards the whole shadow stack, releasing any registers held. */
    pub fn dump_all(&mut self) -> &mut Self {
        while let Some(value) = self.stack.pop() {
            self.select().drop_value(value);
        }
        self
    }

    /** Swaps the top two elements; no code is emitted. */
    pub fn swap(&mut self) -> Result<&mut Self> {
        let top = self.pop_operand()?;
        let under = self.pop_operand()?;
        self.stack.push(top);
        self.stack.push(under);
        Ok(self)
    }

    /** Reverses the whole shadow stack. */
    pub fn swap_all(&mut self) -> &mut Self {
        self.stack.reverse();
        self
    }

    /** Puts the stack in the argument order the ABI expects. */
    pub fn swap_for_abi(&mut self) -> &mut Self {
        // x86 arguments go right to left, which is the reversal.
        self.swap_all()
    }

    /** Pops a value and pushes it onto the native runtime stack. */
    pub fn push(&mut self) -> Result<&mut Self> {
        let value = self.pop_operand()?;
        self.select().push(value)?;
        Ok(self)
    }

    /** Pops a `ty`-typed value off the native runtime stack. */
    pub fn pop(&mut self, ty: Type) -> Result<&mut Self> {
        let value = self.select().pop(ty)?;
        self.stack.push(value);
        Ok(self)
    }

    /** Unwinds the native stack to the saved stack-segment extent. */
    pub fn pop_all(&mut self) -> Result<&mut Self> {
        let slot = self.ss_slot
            .ok_or(CodegenError::Misuse("pop_all without an SS local"))?;
        self.select().pop_all(&slot);
        Ok(self)
    }

    //-------------------------------------------------------------------------
    // Forcing and conversion.

    /**
     * Retags the top of the stack as type `to` without emitting code. Both
     * types must be primary and of the same size.
     */
    pub fn force(&mut self, to: Type) -> Result<&mut Self> {
        let tos = self.pop_operand()?;
        let from = tos.ty();
        if !from.is_primary() || !to.is_primary() {
            return Err(CodegenError::TypeMismatch(
                "force needs primary types"));
        }
        if from.structure_size() != to.structure_size() {
            return Err(CodegenError::TypeMismatch(
                "force cannot change the size"));
        }
        let forced = if from == to { tos } else { self.select().force(tos, to) };
        self.stack.push(forced);
        Ok(self)
    }

    /** Converts the top of the stack to type `to`, emitting code. */
    pub fn convert(&mut self, to: Type) -> Result<&mut Self> {
        let tos = self.pop_operand()?;
        let from = tos.ty();
        if !from.is_primary() {
            return Err(CodegenError::TypeMismatch(
                "convert needs a primary source"));
        }
        if from != Type::Int && !to.is_primary() {
            return Err(CodegenError::TypeMismatch(
                "convert needs a primary destination"));
        }
        let converted = if from == to {
            tos
        } else {
            self.select().convert(tos, to)?
        };
        self.stack.push(converted);
        Ok(self)
    }

    //-------------------------------------------------------------------------
    // Arithmetic, logic and comparison.

    pub fn add(&mut self) -> Result<&mut Self> {
        self.arithmetic_logical(ArithOp::Add)
    }

    pub fn sub(&mut self) -> Result<&mut Self> {
        self.arithmetic_logical(ArithOp::Sub)
    }

    pub fn mul(&mut self) -> Result<&mut Self> {
        self.arithmetic_logical(ArithOp::Mul)
    }

    pub fn div(&mut self) -> Result<&mut Self> {
        self.arithmetic_logical(ArithOp::Div)
    }

    pub fn rem(&mut self) -> Result<&mut Self> {
        self.arithmetic_logical(ArithOp::Rem)
    }

    pub fn and(&mut self) -> Result<&mut Self> {
        self.arithmetic_logical(ArithOp::And)
    }

    pub fn or(&mut self) -> Result<&mut Self> {
        self.arithmetic_logical(ArithOp::Or)
    }

    pub fn xor(&mut self) -> Result<&mut Self> {
        self.arithmetic_logical(ArithOp::Xor)
    }

    pub fn shl(&mut self) -> Result<&mut Self> {
        self.arithmetic_logical(ArithOp::Shl)
    }

    pub fn shr(&mut self) -> Result<&mut Self> {
        self.arithmetic_logical(ArithOp::Shr)
    }

    pub fn ushr(&mut self) -> Result<&mut Self> {
        self.arithmetic_logical(ArithOp::Ushr)
    }

    pub fn neg(&mut self) -> Result<&mut Self> {
        self.unary(UnaryOp::Neg)
    }

    pub fn com(&mut self) -> Result<&mut Self> {
        self.unary(UnaryOp::Com)
    }

    pub fn eq(&mut self) -> Result<&mut Self> {
        self.comparison(CompareOp::Eq)
    }

    pub fn ne(&mut self) -> Result<&mut Self> {
        self.comparison(CompareOp::Ne)
    }

    pub fn le(&mut self) -> Result<&mut Self> {
        self.comparison(CompareOp::Le)
    }

    pub fn lt(&mut self) -> Result<&mut Self> {
        self.comparison(CompareOp::Lt)
    }

    pub fn ge(&mut self) -> Result<&mut Self> {
        self.comparison(CompareOp::Ge)
    }

    pub fn gt(&mut self) -> Result<&mut Self> {
        self.comparison(CompareOp::Gt)
    }

    /**
     * Pops the top two operands, applies `op` under the typing rules, and
     * pushes the result. A pointer operand restricts the operation to add
     * and subtract against an integer; shifts need an integer count;
     * anything else requires both operands to have the same type.
     */
    fn arithmetic_logical(&mut self, op: ArithOp) -> Result<&mut Self> {
        let op2 = self.pop_operand()?;
        let op1 = self.pop_operand()?;
        if op1.ty().is_pointer() {
            if op != ArithOp::Add && op != ArithOp::Sub {
                return Err(CodegenError::TypeMismatch(
                    "pointers only add and subtract"));
            }
            if op2.ty() != Type::Int {
                return Err(CodegenError::TypeMismatch(
                    "pointer arithmetic needs an integer operand"));
            }
        } else if op2.ty().is_pointer() {
            if op != ArithOp::Add && op != ArithOp::Sub {
                return Err(CodegenError::TypeMismatch(
                    "pointers only add and subtract"));
            }
            if op1.ty() != Type::Int {
                return Err(CodegenError::TypeMismatch(
                    "pointer arithmetic needs an integer operand"));
            }
        } else if matches!(op, ArithOp::Shl | ArithOp::Shr | ArithOp::Ushr) {
            if op2.ty() != Type::Int {
                return Err(CodegenError::TypeMismatch(
                    "shift count must be an integer"));
            }
        } else if op1.ty() != op2.ty() {
            return Err(CodegenError::TypeMismatch(
                "operands must have the same type"));
        }
        let result = self.select().binop(op, op1, op2)?;
        self.stack.push(result);
        Ok(self)
    }

    fn unary(&mut self, op: UnaryOp) -> Result<&mut Self> {
        let operand = self.pop_operand()?;
        let result = self.select().unary(op, operand)?;
        self.stack.push(result);
        Ok(self)
    }

    /**
     * Pops the top two operands and pushes their comparison as an `Int` 0
     * or 1. Operands must be primary and of the same type, except that a
     * pointer may be compared with an integer for equality only.
     */
    fn comparison(&mut self, op: CompareOp) -> Result<&mut Self> {
        let op2 = self.pop_operand()?;
        let op1 = self.pop_operand()?;
        if !op1.ty().is_primary() || !op2.ty().is_primary() {
            return Err(CodegenError::TypeMismatch(
                "comparison needs primary operands"));
        }
        let pointer_vs_int = (op1.ty().is_pointer() && op2.ty() == Type::Int)
            || (op2.ty().is_pointer() && op1.ty() == Type::Int);
        if pointer_vs_int {
            if op != CompareOp::Eq && op != CompareOp::Ne {
                return Err(CodegenError::TypeMismatch(
                    "pointers only compare for equality"));
            }
        } else if op1.ty() != op2.ty() {
            return Err(CodegenError::TypeMismatch(
                "comparison operands must have the same type"));
        }
        let result = self.select().compare(op, op1, op2)?;
        self.stack.push(result);
        Ok(self)
    }

    //-------------------------------------------------------------------------
    // Branches.

    /**
     * Unconditional branch to `label`. A backward branch (the label is
     * bound) requires an empty shadow stack; a forward branch records the
     * stack for replay when the label binds.
     */
    pub fn br(&mut self, label: Label) -> Result<&mut Self> {
        self.note_branch_target(label)?;
        self.emit.jump(label);
        Ok(self)
    }

    /** Branch to `label` if the popped `Int` condition is true (1). */
    pub fn bt(&mut self, label: Label) -> Result<&mut Self> {
        self.branch(label, true)
    }

    /** Branch to `label` if the popped `Int` condition is false (0). */
    pub fn bf(&mut self, label: Label) -> Result<&mut Self> {
        self.branch(label, false)
    }

    /** Unconditional branch to a known code offset; stack must be empty. */
    pub fn br_offset(&mut self, target: usize) -> Result<&mut Self> {
        self.require_empty_stack("branch to an offset")?;
        self.emit.jump_to(target);
        Ok(self)
    }

    pub fn bt_offset(&mut self, target: usize) -> Result<&mut Self> {
        self.branch_offset(target, true)
    }

    pub fn bf_offset(&mut self, target: usize) -> Result<&mut Self> {
        self.branch_offset(target, false)
    }

    /** Pops a pointer and jumps to it; the stack must then be empty. */
    pub fn jump(&mut self) -> Result<&mut Self> {
        let target = self.pop_operand()?;
        if !target.ty().is_pointer() {
            return Err(CodegenError::TypeMismatch("jump needs an address"));
        }
        self.require_empty_stack("jump")?;
        self.select().jump(target)?;
        Ok(self)
    }

    fn branch(&mut self, label: Label, when: bool) -> Result<&mut Self> {
        let condition = self.pop_operand()?;
        self.note_branch_target(label)?;
        if condition.ty() != Type::Int {
            return Err(CodegenError::TypeMismatch(
                "branch condition must be an integer"));
        }
        self.select().branch(label, condition, when)?;
        Ok(self)
    }

    fn branch_offset(&mut self, target: usize, when: bool) -> Result<&mut Self> {
        let condition = self.pop_operand()?;
        self.require_empty_stack("branch to an offset")?;
        if condition.ty() != Type::Int {
            return Err(CodegenError::TypeMismatch(
                "branch condition must be an integer"));
        }
        self.select().branch_to_offset(target, condition, when)?;
        Ok(self)
    }

    fn note_branch_target(&mut self, label: Label) -> Result<()> {
        if self.emit.asm.is_bound(label) {
            self.require_empty_stack("backward branch")
        } else {
            self.forward_branches.insert(label, self.stack.clone());
            Ok(())
        }
    }

    fn require_empty_stack(&self, what: &'static str) -> Result<()> {
        if self.stack.is_empty() {
            Ok(())
        } else {
            Err(CodegenError::Misuse(what))
        }
    }

    //-------------------------------------------------------------------------
    // Calls and returns.

    /**
     * Pops the callee address, then `nparms` arguments, and emits the
     * call; the return value (if `ty` is not `Void`) lands back on the
     * shadow stack.
     */
    pub fn call(&mut self, nparms: usize, ty: Type, convention: Convention)
    -> Result<&mut Self> {
        if self.stack.len() < nparms + 1 {
            return Err(CodegenError::Misuse(
                "call with too few operands"));
        }
        let address = self.pop_operand()?;
        if address.ty().structure_size() != 4 {
            return Err(CodegenError::TypeMismatch(
                "call needs a 32-bit address"));
        }
        self.select().call(address, nparms, ty, convention)?;
        Ok(self)
    }

    /** As [`call`](Compiler::call), consuming the whole shadow stack. */
    pub fn call_all(&mut self, ty: Type, convention: Convention)
    -> Result<&mut Self> {
        let nparms = self.stack.len().saturating_sub(1);
        self.call(nparms, ty, convention)
    }

    /**
     * Returns from the function: for a non-void result type, pops the
     * return value into the convention's registers; either way jumps to
     * the shared epilogue.
     */
    pub fn ret(&mut self) -> Result<&mut Self> {
        if self.result_ty == Type::Void {
            self.require_empty_stack("void return with operands left")?;
            self.emit.branch_to_leave();
        } else {
            let value = self.pop_operand()?;
            self.select().ret(value)?;
        }
        Ok(self)
    }

    /** Declares the result type and returns, in one step. */
    pub fn ret_ty(&mut self, ty: Type) -> Result<&mut Self> {
        self.result_ty = ty;
        self.ret()
    }

    //-------------------------------------------------------------------------
    // Interpreter support.

    /**
     * Pops a byte count and grows the dynamic stack area, pushing the new
     * extent as a `Ref`. The extent is recorded in the stack-segment slot
     * when an `Ss` local has been declared.
     */
    pub fn alloca(&mut self) -> Result<&mut Self> {
        let size = self.pop_operand()?;
        let ss_slot = self.ss_slot;
        let result = self.select().alloca(size, ss_slot)?;
        self.stack.push(result);
        Ok(self)
    }

    /**
     * Pops the extra stack and locals sizes. The underlying check is not
     * implemented; the operands are validated and discarded.
     */
    pub fn stack_check(&mut self) -> Result<&mut Self> {
        let extra_stack = self.pop_operand()?;
        let extra_locals = self.pop_operand()?;
        if extra_stack.ty() != Type::Int || extra_locals.ty() != Type::Int {
            return Err(CodegenError::TypeMismatch(
                "stack check needs integer sizes"));
        }
        self.select().drop_value(extra_stack);
        self.select().drop_value(extra_locals);
        Ok(self)
    }

    /** Pushes the receiver from the top of the native runtime stack. */
    pub fn peek_receiver(&mut self) -> Result<&mut Self> {
        let receiver = self.select().peek_receiver()?;
        self.stack.push(receiver);
        Ok(self)
    }

    /** Pushes the frame pointer as a `Ref`. */
    pub fn frame_pointer(&mut self) -> &mut Self {
        self.stack.push(SymbolicValue::reg32(Register::EBP, Type::Ref));
        self
    }

    /** Pops an `Int` parameter index and pushes that parameter word. */
    pub fn load_parm(&mut self) -> Result<&mut Self> {
        let index = self.pop_operand()?;
        if index.ty() != Type::Int {
            return Err(CodegenError::TypeMismatch(
                "parameter index must be an integer"));
        }
        let value = self.select().load_parm(index)?;
        self.stack.push(value);
        Ok(self)
    }

    /** Pops an `Int` index, then a value, and stores into that parameter. */
    pub fn store_parm(&mut self) -> Result<&mut Self> {
        let index = self.pop_operand()?;
        if index.ty() != Type::Int {
            return Err(CodegenError::TypeMismatch(
                "parameter index must be an integer"));
        }
        let value = self.pop_operand()?;
        self.select().store_parm(value, index)?;
        Ok(self)
    }

    /** Attaches a comment to the current code position. */
    pub fn comment(&mut self, text: &str) -> &mut Self {
        self.emit.comment(text);
        self
    }

    //-------------------------------------------------------------------------
    // Finishing.

    /**
     * Finishes the compilation unit: checks the shadow stack is empty and
     * resolves the relocation records against a load address of zero.
     */
    pub fn compile(&mut self) -> Result<&mut Self> {
        self.require_empty_stack("compile with operands left")?;
        self.relocation_info = self.emit.asm.relocate(0)?;
        Ok(self)
    }

    /** The generated machine code. */
    pub fn code(&self) -> &[u8] {
        let len = self.emit.asm.get_pos();
        &self.emit.asm.buffer[..len]
    }

    pub fn code_size(&self) -> usize {
        self.emit.asm.get_pos()
    }

    /** The packed relocation records produced by [`compile`](Compiler::compile). */
    pub fn relocation_info(&self) -> &[i32] {
        &self.relocation_info
    }

    /** The linker fixup table: intra-code offset keys to symbol names. */
    pub fn fixup_info(&self) -> &IndexMap<i32, String> {
        self.emit.asm.fixup_info()
    }

    /** The comment side table, keyed by code position. */
    pub fn comments(&self) -> &IndexMap<usize, String> {
        self.emit.comments()
    }

    // Interpreter trampolines.

    /** The size in bytes of a direct jump, as built by [`jump_byte`](Compiler::jump_byte). */
    pub fn jump_size(&self) -> usize {
        5
    }

    /**
     * Byte `offset` of a `jmp rel32` placed at `bytecodes` and landing on
     * `interp`. An embedder writes the five bytes in sequence to turn a
     * bytecode array into a springboard into the interpreter.
     */
    pub fn jump_byte(&self, bytecodes: i32, interp: i32, offset: usize) -> u8 {
        if offset == 0 {
            return 0xE9;
        }
        let rel = interp.wrapping_sub(bytecodes).wrapping_sub(5);
        (rel >> (8 * (offset - 1))) as u8
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::x86::assembler::tests::{disassemble};

    fn compile(
        build: impl FnOnce(&mut Compiler<VecU8>) -> Result<()>,
    ) -> Compiler<VecU8> {
        let mut c = Compiler::new();
        build(&mut c).unwrap();
        c
    }

    #[test]
    fn add2_round_trip() {
        let c = compile(|c| {
            c.enter(None, PreambleKind::None)?;
            let a = c.parm(Type::Int);
            let b = c.parm(Type::Int);
            c.result(Type::Int);
            c.load(a).load(b).add()?.ret()?;
            c.leave(None)?.compile()?;
            Ok(())
        });
        disassemble(c.code(), vec![
            "push ebp",
            "mov ebp,esp",
            "sub esp,0",
            "nop",
            "nop",
            "nop",
            "mov eax,[ebp+8]",
            "add eax,[ebp+0Ch]",
            "jmp 00000014h",
            "mov esp,ebp",
            "pop ebp",
            "ret",
        ]).unwrap();
    }

    #[test]
    fn frame_size_reflects_locals() {
        let c = compile(|c| {
            c.enter(None, PreambleKind::None)?;
            c.local(Type::Int)?;
            c.local(Type::Long)?;
            c.leave(None)?.compile()?;
            Ok(())
        });
        disassemble(c.code(), vec![
            "push ebp",
            "mov ebp,esp",
            "sub esp,0Ch",
            "nop",
            "nop",
            "nop",
            "mov esp,ebp",
            "pop ebp",
            "ret",
        ]).unwrap();
    }

    #[test]
    fn mp_local_emits_the_preamble() {
        let c = compile(|c| {
            c.enter(None, PreambleKind::Register)?;
            c.local(Type::Mp)?;
            c.leave(None)?.compile()?;
            Ok(())
        });
        disassemble(c.code(), vec![
            "push ebp",
            "mov ebp,esp",
            "sub esp,4",
            "nop",
            "nop",
            "nop",
            "mov [ebp-4],eax",
            "mov esp,ebp",
            "pop ebp",
            "ret",
        ]).unwrap();
    }

    #[test]
    fn forward_branch_replays_the_stack() {
        let mut c = Compiler::new();
        c.enter(None, PreambleKind::None).unwrap();
        let target = c.label();
        c.literal(42);
        c.literal(1);
        c.bt(target).unwrap();
        assert_eq!(c.stack_size(), 1);
        c.drop_top().unwrap();
        assert_eq!(c.stack_size(), 0);
        // Binding restores the snapshot taken at the branch site.
        c.bind(target).unwrap();
        assert_eq!(c.stack_size(), 1);
        c.drop_top().unwrap();
        c.leave(None).unwrap();
        c.compile().unwrap();
    }

    #[test]
    fn backward_branch_needs_an_empty_stack() {
        let mut c = Compiler::new();
        c.enter(None, PreambleKind::None).unwrap();
        let top = c.label();
        c.bind(top).unwrap();
        c.literal(5);
        assert_eq!(
            c.br(top).unwrap_err(),
            CodegenError::Misuse("backward branch"),
        );
    }

    #[test]
    fn arithmetic_rejects_mixed_types() {
        let mut c = Compiler::new();
        c.enter(None, PreambleKind::None).unwrap();
        c.literal(1);
        c.literal64(2);
        assert!(matches!(
            c.add().unwrap_err(),
            CodegenError::TypeMismatch(_),
        ));
    }

    #[test]
    fn pointer_arithmetic_is_add_and_sub_only() {
        let mut c = Compiler::new();
        c.enter(None, PreambleKind::None).unwrap();
        let p = c.parm(Type::Ref);
        c.load(p).literal(8);
        c.add().unwrap();
        assert_eq!(c.stack_size(), 1);
        c.literal(2);
        assert!(matches!(
            c.mul().unwrap_err(),
            CodegenError::TypeMismatch(_),
        ));
    }

    #[test]
    fn pointer_compares_for_equality_only() {
        let mut c = Compiler::new();
        c.enter(None, PreambleKind::None).unwrap();
        let p = c.parm(Type::Ref);
        c.load(p).literal(0);
        assert!(matches!(
            c.lt().unwrap_err(),
            CodegenError::TypeMismatch(_),
        ));
    }

    #[test]
    fn method_map_captures_oop_slots() {
        let mut map = MethodMap::new();
        compile(|c| {
            c.enter(None, PreambleKind::None)?;
            c.parm(Type::Int);
            c.parm(Type::Oop);
            c.local(Type::Oop)?;
            c.local(Type::Int)?;
            c.leave(Some(&mut map))?.compile()?;
            Ok(())
        });
        assert_eq!(map.param_slots(), 2);
        assert_eq!(map.param_oop_map(), &[0b10]);
        assert_eq!(map.local_slots(), 2);
        assert_eq!(map.local_oop_map(), &[0b01]);
    }

    #[test]
    fn spill_around_call_round_trip() {
        let c = compile(|c| {
            c.enter(None, PreambleKind::None)?;
            // Three live caller-saved registers on the shadow stack.
            c.literal(10).literal(0).add()?;
            c.literal(20).literal(0).add()?;
            c.literal(30).literal(0).add()?;
            c.symbol("helper");
            c.call(0, Type::Void, Convention::Normal)?;
            c.dump_all();
            c.leave(None)?.compile()?;
            Ok(())
        });
        disassemble(c.code(), vec![
            "push ebp",
            "mov ebp,esp",
            "sub esp,0",
            "nop",
            "nop",
            "nop",
            "mov eax,0Ah",
            "add eax,0",
            "mov edx,14h",
            "add edx,0",
            "mov ecx,1Eh",
            "add ecx,0",
            "push ecx",
            "push edx",
            "push eax",
            "call 00000029h",
            "pop eax",
            "pop edx",
            "pop ecx",
            "mov esp,ebp",
            "pop ebp",
            "ret",
        ]).unwrap();
    }

    #[test]
    fn call_unwinds_its_arguments() {
        let c = compile(|c| {
            c.enter(None, PreambleKind::None)?;
            c.literal(7);
            c.symbol("consume");
            c.call(1, Type::Int, Convention::Normal)?;
            c.drop_top()?;
            c.leave(None)?.compile()?;
            Ok(())
        });
        disassemble(c.code(), vec![
            "push ebp",
            "mov ebp,esp",
            "sub esp,0",
            "nop",
            "nop",
            "nop",
            "push 7",
            "call 00000010h",
            "add esp,4",
            "mov esp,ebp",
            "pop ebp",
            "ret",
        ]).unwrap();
    }

    #[test]
    fn data_blocks_follow_the_epilogue() {
        let mut c = Compiler::new();
        c.enter(None, PreambleKind::None).unwrap();
        c.literal_object(DataValue::Bytes(vec![1, 2, 3]));
        c.drop_top().unwrap();
        c.leave(None).unwrap();
        c.compile().unwrap();
        // The bytes land after the prologue/epilogue skeleton.
        let code = c.code();
        assert_eq!(&code[code.len() - 3..], &[1, 2, 3]);
    }

    #[test]
    fn alloca_requires_popped_size() {
        let c = compile(|c| {
            c.enter(None, PreambleKind::None)?;
            c.local(Type::Ss)?;
            c.literal(16);
            c.alloca()?;
            c.drop_top()?;
            c.leave(None)?.compile()?;
            Ok(())
        });
        disassemble(c.code(), vec![
            "push ebp",
            "mov ebp,esp",
            "sub esp,4",
            "nop",
            "nop",
            "nop",
            "sub esp,10h",
            "mov [ebp-4],esp",
            "mov esp,ebp",
            "pop ebp",
            "ret",
        ]).unwrap();
    }

    #[test]
    fn scope_imbalance_is_rejected() {
        let mut c = Compiler::new();
        c.enter(None, PreambleKind::None).unwrap();
        c.begin();
        assert_eq!(
            c.leave(None).unwrap_err(),
            CodegenError::Misuse("leave inside an open scope"),
        );
        c.end();
        c.leave(None).unwrap();
    }

    #[test]
    fn long_arithmetic_through_the_driver() {
        let c = compile(|c| {
            c.enter(None, PreambleKind::None)?;
            c.result(Type::Long);
            c.literal64(1).literal64(2).add()?;
            c.ret()?;
            c.leave(None)?.compile()?;
            Ok(())
        });
        disassemble(c.code(), vec![
            "push ebp",
            "mov ebp,esp",
            "sub esp,0",
            "nop",
            "nop",
            "nop",
            "mov esi,1",
            "mov edi,0",
            "add esi,2",
            "adc edi,0",
            "mov eax,esi",
            "mov edx,edi",
            "jmp 00000022h",
            "mov esp,ebp",
            "pop ebp",
            "ret",
        ]).unwrap();
    }

    #[test]
    fn fixups_survive_to_the_table() {
        let c = compile(|c| {
            c.enter(None, PreambleKind::None)?;
            c.symbol("puts");
            c.call(0, Type::Void, Convention::Normal)?;
            c.leave(None)?.compile()?;
            Ok(())
        });
        let fixups = c.fixup_info();
        assert_eq!(fixups.len(), 1);
        assert_eq!(fixups.values().next().map(String::as_str), Some("puts"));
    }

    #[test]
    fn jump_bytes_form_a_rel32_jmp() {
        let c = Compiler::new();
        let bytecodes = 0x1000;
        let interp = 0x4000_0000;
        let bytes: Vec<u8> = (0..c.jump_size())
            .map(|i| c.jump_byte(bytecodes, interp, i))
            .collect();
        // jmp rel32, displacement relative to the end of the instruction.
        assert_eq!(bytes[0], 0xE9);
        let rel = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        assert_eq!(bytecodes + c.jump_size() as i32 + rel, interp);
    }
}
