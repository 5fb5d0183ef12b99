use indexmap::{IndexMap};

use super::super::buffer::{Buffer};
use super::super::error::{CodegenError, Result};
use super::label::{Label, LabelState, Patch, Reloc, RelocKind, UNKNOWN_DISP, ABS_PLACEHOLDER};
use super::{Address, BinaryOp, Condition, Disp, Register, ShiftOp};

/** The filler byte used by `align()` and the frame-size placeholder. */
pub const NOP: u8 = 0x90;

/**
 * An assembler that encodes 32-bit x86 instructions into a [`Buffer`].
 *
 * The assembler owns the label arena, the relocation records and the linker
 * fixup table, because all three are keyed by buffer positions only it
 * knows. Instructions that reference an unbound [`Label`] write a
 * placeholder field and queue a patch; binding the label patches every
 * queued field using the buffer's save-position/write/restore protocol.
 */
#[derive(Debug)]
pub struct Assembler<B: Buffer> {
    pub buffer: B,
    labels: Vec<LabelState>,
    relocs: Vec<Reloc>,
    fixups: IndexMap<i32, String>,
}

fn is8bit(imm: i32) -> bool {
    imm >= -128 && imm < 128
}

impl<B: Buffer> Assembler<B> {
    pub fn new(buffer: B) -> Self {
        Assembler {
            buffer,
            labels: Vec::new(),
            relocs: Vec::new(),
            fixups: IndexMap::new(),
        }
    }

    /** Apply `callback` to the contained [`Buffer`]. */
    pub fn use_buffer<T>(mut self, callback: impl FnOnce(B) -> std::io::Result<(B, T)>)
    -> std::io::Result<(Self, T)> {
        let (buffer, ret) = callback(self.buffer)?;
        self.buffer = buffer;
        Ok((self, ret))
    }

    pub fn get_pos(&self) -> usize {
        self.buffer.get_pos()
    }

    pub fn set_pos(&mut self, pos: usize) {
        self.buffer.set_pos(pos);
    }

    /** Emit `NOP` bytes until the position is a multiple of `modulus`. */
    pub fn align(&mut self, modulus: usize) {
        while self.buffer.get_pos() % modulus != 0 {
            self.buffer.write_byte(NOP);
        }
    }

    /** Overwrite the 32-bit word at `pos`, preserving the write pointer. */
    pub fn patch_word(&mut self, pos: usize, word: i32) {
        let save = self.buffer.get_pos();
        self.buffer.set_pos(pos);
        self.buffer.write_word(word);
        self.buffer.set_pos(save);
    }

    pub fn read_word(&self, pos: usize) -> i32 {
        self.buffer.read_word(pos)
    }

    //-------------------------------------------------------------------------
    // Labels, relocation and fixups.

    /** Creates a fresh unbound [`Label`]. */
    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState::new());
        Label(self.labels.len() - 1)
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.labels[label.0].is_bound()
    }

    /** The code offset `label` is bound to, if bound. */
    pub fn target(&self, label: Label) -> Option<usize> {
        self.labels[label.0].target
    }

    /**
     * Binds `label` to the current write position and patches every queued
     * reference. A label can be bound exactly once.
     */
    pub fn bind(&mut self, label: Label) -> Result<()> {
        let target = self.buffer.get_pos();
        let state = &mut self.labels[label.0];
        if state.is_bound() {
            return Err(CodegenError::Misuse("label can be bound once only"));
        }
        state.target = Some(target);
        let patches: Vec<Patch> = state.patches.drain(..).collect();
        for patch in patches {
            match patch {
                Patch::Relative(pos) => {
                    debug_assert_eq!(self.read_word(pos), UNKNOWN_DISP);
                    self.patch_word(pos, target as i32 - (pos as i32 + 4));
                },
                Patch::Absolute(pos) => {
                    debug_assert_eq!(self.read_word(pos), ABS_PLACEHOLDER);
                    self.patch_word(pos, target as i32);
                },
            }
        }
        Ok(())
    }

    /**
     * Emits a 32-bit field holding a displacement to `label`, relative to
     * the end of the field.
     */
    fn rel32(&mut self, label: Label) {
        let pos = self.buffer.get_pos();
        match self.labels[label.0].target {
            Some(target) => {
                self.buffer.write_word(target as i32 - (pos as i32 + 4));
            },
            None => {
                self.labels[label.0].patches.push(Patch::Relative(pos));
                self.buffer.write_word(UNKNOWN_DISP);
            },
        }
    }

    /**
     * Emits a 32-bit field holding the absolute address of `label`, and a
     * relocation record for it. Until the code is relocated the field holds
     * the label's buffer offset.
     */
    pub fn emit_label_word(&mut self, label: Label) {
        let pos = self.buffer.get_pos();
        self.relocs.push(Reloc {kind: RelocKind::Absolute, pos});
        match self.labels[label.0].target {
            Some(target) => {
                self.buffer.write_word(target as i32);
            },
            None => {
                self.labels[label.0].patches.push(Patch::Absolute(pos));
                self.buffer.write_word(ABS_PLACEHOLDER);
            },
        }
    }

    /**
     * Records that the 32-bit field at the current write position must be
     * resolved to the external symbol `name` by the linker, then emits a
     * zero placeholder field.
     */
    fn emit_fixup_word(&mut self, kind: RelocKind, name: &str) {
        let pos = self.buffer.get_pos();
        self.relocs.push(Reloc {kind, pos});
        self.fixups.insert(((kind as i32) << 24) | pos as i32, String::from(name));
        self.buffer.write_word(0);
    }

    /** The linker fixup table: packed `(kind << 24) | offset` to symbol name. */
    pub fn fixup_info(&self) -> &IndexMap<i32, String> {
        &self.fixups
    }

    /**
     * Rewrites every absolute field for a final load address of `base` and
     * returns the packed relocation records. Fails if any referenced label
     * is still unbound. Call once, after all code has been emitted.
     */
    pub fn relocate(&mut self, base: i32) -> Result<Vec<i32>> {
        if self.labels.iter().any(|s| !s.is_bound() && !s.patches.is_empty()) {
            return Err(CodegenError::Misuse("unbound label at relocation"));
        }
        let relocs: Vec<Reloc> = self.relocs.clone();
        for reloc in &relocs {
            match reloc.kind {
                RelocKind::Absolute => {
                    let word = self.read_word(reloc.pos);
                    self.patch_word(reloc.pos, word.wrapping_add(base));
                },
                RelocKind::Relative => {
                    // Symbol fixup sites are the linker's to fill in whole.
                    let key = ((RelocKind::Relative as i32) << 24) | reloc.pos as i32;
                    if !self.fixups.contains_key(&key) {
                        let word = self.read_word(reloc.pos);
                        self.patch_word(reloc.pos, word.wrapping_sub(base));
                    }
                },
            }
        }
        Ok(relocs.iter().map(|r| r.pack()).collect())
    }

    //-------------------------------------------------------------------------
    // Encoding helpers.

    fn write_byte(&mut self, byte: u8) {
        self.buffer.write_byte(byte);
    }

    /** Emits a ModRM byte with register-direct addressing. */
    fn write_modrm_reg(&mut self, reg: u8, rm: Register) {
        self.write_byte(0xC0 | (reg << 3) | rm.number());
    }

    /** Emits the displacement of a memory operand. */
    fn write_disp32(&mut self, disp: Disp) {
        match disp {
            Disp::Imm(d) => self.buffer.write_word(d),
            Disp::Label(label) => self.emit_label_word(label),
        }
    }

    /**
     * Emits the ModRM byte, optional SIB byte and displacement selecting
     * the memory operand `addr`, with `reg` in the ModRM `reg` field.
     * Label displacements always use the 32-bit form.
     */
    fn write_mem(&mut self, reg: u8, addr: &Address) {
        let imm_disp = match addr.disp {
            Disp::Imm(d) => Some(d),
            Disp::Label(_) => None,
        };
        match (addr.base, addr.index) {
            (Some(base), Some((index, scale))) => {
                assert!(index != Register::ESP, "illegal addressing mode");
                let sib = ((scale as u8) << 6) | (index.number() << 3) | base.number();
                match imm_disp {
                    Some(0) if base != Register::EBP => {
                        self.write_byte(0x04 | (reg << 3));
                        self.write_byte(sib);
                    },
                    Some(d) if is8bit(d) => {
                        self.write_byte(0x44 | (reg << 3));
                        self.write_byte(sib);
                        self.write_byte(d as u8);
                    },
                    _ => {
                        self.write_byte(0x84 | (reg << 3));
                        self.write_byte(sib);
                        self.write_disp32(addr.disp);
                    },
                }
            },
            (Some(Register::ESP), None) => {
                match imm_disp {
                    Some(0) => {
                        self.write_byte(0x04 | (reg << 3));
                        self.write_byte(0x24);
                    },
                    Some(d) if is8bit(d) => {
                        self.write_byte(0x44 | (reg << 3));
                        self.write_byte(0x24);
                        self.write_byte(d as u8);
                    },
                    _ => {
                        self.write_byte(0x84 | (reg << 3));
                        self.write_byte(0x24);
                        self.write_disp32(addr.disp);
                    },
                }
            },
            (Some(base), None) => {
                match imm_disp {
                    Some(0) if base != Register::EBP => {
                        self.write_byte(0x00 | (reg << 3) | base.number());
                    },
                    Some(d) if is8bit(d) => {
                        self.write_byte(0x40 | (reg << 3) | base.number());
                        self.write_byte(d as u8);
                    },
                    _ => {
                        self.write_byte(0x80 | (reg << 3) | base.number());
                        self.write_disp32(addr.disp);
                    },
                }
            },
            (None, Some((index, scale))) => {
                assert!(index != Register::ESP, "illegal addressing mode");
                self.write_byte(0x04 | (reg << 3));
                self.write_byte(((scale as u8) << 6) | (index.number() << 3) | 0x05);
                self.write_disp32(addr.disp);
            },
            (None, None) => {
                self.write_byte(0x05 | (reg << 3));
                self.write_disp32(addr.disp);
            },
        }
    }

    //-------------------------------------------------------------------------
    // Moves.

    /** `mov dst, imm32`. */
    pub fn mov_ri(&mut self, dst: Register, imm: i32) {
        self.write_byte(0xB8 | dst.number());
        self.buffer.write_word(imm);
    }

    /** `mov dst, label-address` (absolute, relocated). */
    pub fn mov_ri_label(&mut self, dst: Register, label: Label) {
        self.write_byte(0xB8 | dst.number());
        self.emit_label_word(label);
    }

    /** `mov dst, symbol-address` (absolute, resolved by the linker). */
    pub fn mov_ri_fixup(&mut self, dst: Register, name: &str) {
        self.write_byte(0xB8 | dst.number());
        self.emit_fixup_word(RelocKind::Absolute, name);
    }

    /** `mov dst, src`. */
    pub fn mov_rr(&mut self, dst: Register, src: Register) {
        self.write_byte(0x8B);
        self.write_modrm_reg(dst.number(), src);
    }

    /** `mov dst, dword [addr]`. */
    pub fn mov_rm(&mut self, dst: Register, addr: &Address) {
        self.write_byte(0x8B);
        self.write_mem(dst.number(), addr);
    }

    /** `mov dword [addr], src`. */
    pub fn mov_mr(&mut self, addr: &Address, src: Register) {
        self.write_byte(0x89);
        self.write_mem(src.number(), addr);
    }

    /** `mov dword [addr], imm32`. */
    pub fn mov_mi(&mut self, addr: &Address, imm: i32) {
        self.write_byte(0xC7);
        self.write_mem(0, addr);
        self.buffer.write_word(imm);
    }

    /** `mov dword [addr], label-address`. */
    pub fn mov_mi_label(&mut self, addr: &Address, label: Label) {
        self.write_byte(0xC7);
        self.write_mem(0, addr);
        self.emit_label_word(label);
    }

    /** `mov dword [addr], symbol-address`. */
    pub fn mov_mi_fixup(&mut self, addr: &Address, name: &str) {
        self.write_byte(0xC7);
        self.write_mem(0, addr);
        self.emit_fixup_word(RelocKind::Absolute, name);
    }

    /** `mov byte [addr], src` (low byte of `src`). */
    pub fn movb_mr(&mut self, addr: &Address, src: Register) {
        assert!(src.has_byte_form(), "must have byte register");
        self.write_byte(0x88);
        self.write_mem(src.number(), addr);
    }

    /** `mov word [addr], src` (low word of `src`). */
    pub fn movw_mr(&mut self, addr: &Address, src: Register) {
        self.write_byte(0x66);
        self.write_byte(0x89);
        self.write_mem(src.number(), addr);
    }

    /** `movsx dst, src8`. */
    pub fn movsx_b_rr(&mut self, dst: Register, src: Register) {
        assert!(src.has_byte_form(), "must have byte register");
        self.write_byte(0x0F);
        self.write_byte(0xBE);
        self.write_modrm_reg(dst.number(), src);
    }

    /** `movzx dst, src8`. */
    pub fn movzx_b_rr(&mut self, dst: Register, src: Register) {
        assert!(src.has_byte_form(), "must have byte register");
        self.write_byte(0x0F);
        self.write_byte(0xB6);
        self.write_modrm_reg(dst.number(), src);
    }

    /** `movsx dst, src16`. */
    pub fn movsx_w_rr(&mut self, dst: Register, src: Register) {
        self.write_byte(0x0F);
        self.write_byte(0xBF);
        self.write_modrm_reg(dst.number(), src);
    }

    /** `movzx dst, src16`. */
    pub fn movzx_w_rr(&mut self, dst: Register, src: Register) {
        self.write_byte(0x0F);
        self.write_byte(0xB7);
        self.write_modrm_reg(dst.number(), src);
    }

    /** `movsx dst, byte [addr]`. */
    pub fn movsx_b_rm(&mut self, dst: Register, addr: &Address) {
        self.write_byte(0x0F);
        self.write_byte(0xBE);
        self.write_mem(dst.number(), addr);
    }

    /** `movzx dst, byte [addr]`. */
    pub fn movzx_b_rm(&mut self, dst: Register, addr: &Address) {
        self.write_byte(0x0F);
        self.write_byte(0xB6);
        self.write_mem(dst.number(), addr);
    }

    /** `movsx dst, word [addr]`. */
    pub fn movsx_w_rm(&mut self, dst: Register, addr: &Address) {
        self.write_byte(0x0F);
        self.write_byte(0xBF);
        self.write_mem(dst.number(), addr);
    }

    /** `movzx dst, word [addr]`. */
    pub fn movzx_w_rm(&mut self, dst: Register, addr: &Address) {
        self.write_byte(0x0F);
        self.write_byte(0xB7);
        self.write_mem(dst.number(), addr);
    }

    //-------------------------------------------------------------------------
    // Arithmetic and logic.

    /** `op dst, imm32`, using the sign-extended 8-bit form when possible. */
    pub fn op_ri(&mut self, op: BinaryOp, dst: Register, imm: i32) {
        if is8bit(imm) {
            self.write_byte(0x83);
            self.write_modrm_reg(op.reg_field(), dst);
            self.write_byte(imm as u8);
        } else {
            self.write_byte(0x81);
            self.write_modrm_reg(op.reg_field(), dst);
            self.buffer.write_word(imm);
        }
    }

    /** `op dst, imm32` with a fixed full-width encoding (patchable). */
    pub fn op_ri_wide(&mut self, op: BinaryOp, dst: Register, imm: i32) {
        self.write_byte(0x81);
        self.write_modrm_reg(op.reg_field(), dst);
        self.buffer.write_word(imm);
    }

    /** `op dst, src`. */
    pub fn op_rr(&mut self, op: BinaryOp, dst: Register, src: Register) {
        self.write_byte(op.reg_rm());
        self.write_modrm_reg(dst.number(), src);
    }

    /** `op dst, dword [addr]`. */
    pub fn op_rm(&mut self, op: BinaryOp, dst: Register, addr: &Address) {
        self.write_byte(op.reg_rm());
        self.write_mem(dst.number(), addr);
    }

    /** `op dword [addr], src`. */
    pub fn op_mr(&mut self, op: BinaryOp, addr: &Address, src: Register) {
        self.write_byte(op.rm_reg());
        self.write_mem(src.number(), addr);
    }

    /** `op dword [addr], imm32`. */
    pub fn op_mi(&mut self, op: BinaryOp, addr: &Address, imm: i32) {
        if is8bit(imm) {
            self.write_byte(0x83);
            self.write_mem(op.reg_field(), addr);
            self.write_byte(imm as u8);
        } else {
            self.write_byte(0x81);
            self.write_mem(op.reg_field(), addr);
            self.buffer.write_word(imm);
        }
    }

    /** `op dst, imm` where `imm` is an external symbol address. */
    pub fn op_ri_fixup(&mut self, op: BinaryOp, dst: Register, name: &str) {
        self.write_byte(0x81);
        self.write_modrm_reg(op.reg_field(), dst);
        self.emit_fixup_word(RelocKind::Absolute, name);
    }

    /** `shift dst, imm8`. */
    pub fn shift_ri(&mut self, op: ShiftOp, dst: Register, imm: u8) {
        if imm == 1 {
            self.write_byte(0xD1);
            self.write_modrm_reg(op.reg_field(), dst);
        } else {
            self.write_byte(0xC1);
            self.write_modrm_reg(op.reg_field(), dst);
            self.write_byte(imm);
        }
    }

    /** `shift dst, cl`. */
    pub fn shift_r_cl(&mut self, op: ShiftOp, dst: Register) {
        self.write_byte(0xD3);
        self.write_modrm_reg(op.reg_field(), dst);
    }

    /** `shift dword [addr], imm8`. */
    pub fn shift_mi(&mut self, op: ShiftOp, addr: &Address, imm: u8) {
        if imm == 1 {
            self.write_byte(0xD1);
            self.write_mem(op.reg_field(), addr);
        } else {
            self.write_byte(0xC1);
            self.write_mem(op.reg_field(), addr);
            self.write_byte(imm);
        }
    }

    /** `shift dword [addr], cl`. */
    pub fn shift_m_cl(&mut self, op: ShiftOp, addr: &Address) {
        self.write_byte(0xD3);
        self.write_mem(op.reg_field(), addr);
    }

    /** `imul dst, src`. */
    pub fn mul_rr(&mut self, dst: Register, src: Register) {
        self.write_byte(0x0F);
        self.write_byte(0xAF);
        self.write_modrm_reg(dst.number(), src);
    }

    /** `imul dst, dword [addr]`. */
    pub fn mul_rm(&mut self, dst: Register, addr: &Address) {
        self.write_byte(0x0F);
        self.write_byte(0xAF);
        self.write_mem(dst.number(), addr);
    }

    /** `imul dst, src, imm32`. */
    pub fn mul_rri(&mut self, dst: Register, src: Register, imm: i32) {
        if is8bit(imm) {
            self.write_byte(0x6B);
            self.write_modrm_reg(dst.number(), src);
            self.write_byte(imm as u8);
        } else {
            self.write_byte(0x69);
            self.write_modrm_reg(dst.number(), src);
            self.buffer.write_word(imm);
        }
    }

    /** `imul src`: EDX:EAX = EAX * src. */
    pub fn imul_r(&mut self, src: Register) {
        self.write_byte(0xF7);
        self.write_modrm_reg(5, src);
    }

    /** `idiv src`: divides EDX:EAX, quotient to EAX, remainder to EDX. */
    pub fn idiv_r(&mut self, src: Register) {
        self.write_byte(0xF7);
        self.write_modrm_reg(7, src);
    }

    /** `neg dst`. */
    pub fn neg_r(&mut self, dst: Register) {
        self.write_byte(0xF7);
        self.write_modrm_reg(3, dst);
    }

    /** `not dst`. */
    pub fn not_r(&mut self, dst: Register) {
        self.write_byte(0xF7);
        self.write_modrm_reg(2, dst);
    }

    /** `inc dst`. */
    pub fn inc_r(&mut self, dst: Register) {
        self.write_byte(0x40 | dst.number());
    }

    /** `dec dst`. */
    pub fn dec_r(&mut self, dst: Register) {
        self.write_byte(0x48 | dst.number());
    }

    /** `inc dword [addr]`. */
    pub fn inc_m(&mut self, addr: &Address) {
        self.write_byte(0xFF);
        self.write_mem(0, addr);
    }

    /** `dec dword [addr]`. */
    pub fn dec_m(&mut self, addr: &Address) {
        self.write_byte(0xFF);
        self.write_mem(1, addr);
    }

    //-------------------------------------------------------------------------
    // Stack operations.

    /** `push src`. */
    pub fn push_r(&mut self, src: Register) {
        self.write_byte(0x50 | src.number());
    }

    /** `push imm32`. */
    pub fn push_i(&mut self, imm: i32) {
        if is8bit(imm) {
            self.write_byte(0x6A);
            self.write_byte(imm as u8);
        } else {
            self.write_byte(0x68);
            self.buffer.write_word(imm);
        }
    }

    /** `push label-address`. */
    pub fn push_i_label(&mut self, label: Label) {
        self.write_byte(0x68);
        self.emit_label_word(label);
    }

    /** `push symbol-address`. */
    pub fn push_i_fixup(&mut self, name: &str) {
        self.write_byte(0x68);
        self.emit_fixup_word(RelocKind::Absolute, name);
    }

    /** `push dword [addr]`. */
    pub fn push_m(&mut self, addr: &Address) {
        self.write_byte(0xFF);
        self.write_mem(6, addr);
    }

    /** `pop dst`. */
    pub fn pop_r(&mut self, dst: Register) {
        self.write_byte(0x58 | dst.number());
    }

    /** `pop dword [addr]`. */
    pub fn pop_m(&mut self, addr: &Address) {
        self.write_byte(0x8F);
        self.write_mem(0, addr);
    }

    //-------------------------------------------------------------------------
    // Conditions, branches, calls.

    /** `setcc dst8`. */
    pub fn set_if(&mut self, cc: Condition, dst: Register) {
        assert!(dst.has_byte_form(), "must have byte register");
        self.write_byte(0x0F);
        self.write_byte(0x90 | cc.cc());
        self.write_modrm_reg(0, dst);
    }

    /** `jcc label` (rel32 form, patched when the label binds). */
    pub fn jump_if(&mut self, cc: Condition, label: Label) {
        self.write_byte(0x0F);
        self.write_byte(0x80 | cc.cc());
        self.rel32(label);
    }

    /** `jmp label` (rel32 form, patched when the label binds). */
    pub fn const_jump(&mut self, label: Label) {
        self.write_byte(0xE9);
        self.rel32(label);
    }

    /** `jmp` to a known code offset. */
    pub fn jump_abs(&mut self, dst: usize) {
        self.write_byte(0xE9);
        let pos = self.buffer.get_pos();
        self.buffer.write_word(dst as i32 - (pos as i32 + 4));
    }

    /** `jcc` to a known code offset. */
    pub fn jump_if_abs(&mut self, cc: Condition, dst: usize) {
        self.write_byte(0x0F);
        self.write_byte(0x80 | cc.cc());
        let pos = self.buffer.get_pos();
        self.buffer.write_word(dst as i32 - (pos as i32 + 4));
    }

    /** `jmp dst` (register-indirect). */
    pub fn jump_r(&mut self, dst: Register) {
        self.write_byte(0xFF);
        self.write_modrm_reg(4, dst);
    }

    /** `jmp dword [addr]`. */
    pub fn jump_m(&mut self, addr: &Address) {
        self.write_byte(0xFF);
        self.write_mem(4, addr);
    }

    /** `call label`. */
    pub fn const_call(&mut self, label: Label) {
        self.write_byte(0xE8);
        self.rel32(label);
    }

    /** `call` to an absolute address; records a relative relocation. */
    pub fn call_abs(&mut self, dst: i32) {
        self.write_byte(0xE8);
        let pos = self.buffer.get_pos();
        self.relocs.push(Reloc {kind: RelocKind::Relative, pos});
        self.buffer.write_word(dst.wrapping_sub(pos as i32 + 4));
    }

    /** `call symbol` (relative field resolved by the linker). */
    pub fn call_fixup(&mut self, name: &str) {
        self.write_byte(0xE8);
        self.emit_fixup_word(RelocKind::Relative, name);
    }

    /** `call dst` (register-indirect). */
    pub fn call_r(&mut self, dst: Register) {
        self.write_byte(0xFF);
        self.write_modrm_reg(2, dst);
    }

    /** `call dword [addr]`. */
    pub fn call_m(&mut self, addr: &Address) {
        self.write_byte(0xFF);
        self.write_mem(2, addr);
    }

    /** `ret`. */
    pub fn ret(&mut self) {
        self.write_byte(0xC3);
    }

    //-------------------------------------------------------------------------
    // Raw data.

    pub fn emit_byte(&mut self, byte: u8) {
        self.buffer.write_byte(byte);
    }

    pub fn emit_word(&mut self, word: i32) {
        self.buffer.write_word(word);
    }
}

//-----------------------------------------------------------------------------

#[cfg(test)]
pub mod tests {
    use std::cmp::{max};
    use iced_x86::{Decoder, Formatter, NasmFormatter};

    use super::*;
    use super::super::{Pair, Scale};
    use super::super::super::buffer::{VecU8};
    use super::super::{Address, BinaryOp, Condition, Register, ShiftOp};
    use Register::*;
    use BinaryOp::*;
    use ShiftOp::*;
    use Condition::*;

    pub fn new_assembler() -> Assembler<VecU8> {
        Assembler::new(VecU8::new())
    }

    /** Disassemble `code_bytes` as 32-bit code and compare to `expected`. */
    pub fn disassemble(code_bytes: &[u8], expected: Vec<&str>)
    -> std::result::Result<(), Vec<String>> {
        let mut decoder = Decoder::new(32, code_bytes, 0);
        decoder.set_ip(0);
        let mut formatter = NasmFormatter::new();
        let mut ips = Vec::new();
        let mut byteses = Vec::new();
        let mut observed = Vec::new();
        for instruction in decoder {
            let start = instruction.ip() as usize;
            let len = instruction.len();
            ips.push(start);
            byteses.push(code_bytes[start..][..len].iter().map(
                |b| format!("{:02X}", b)
            ).collect::<Vec<String>>().join(" "));
            let mut assembly = String::with_capacity(80);
            formatter.format(&instruction, &mut assembly);
            observed.push(assembly);
        }

        let mut error = false;
        for i in 0..max(expected.len(), observed.len()) {
            let e_line = if i < expected.len() { expected[i] } else { "missing" };
            let o_line = if i < observed.len() { &observed[i] } else { "missing" };
            if e_line != o_line {
                println!("Difference in line {}", i + 1);
                println!("{:08X}   {:>24}   {}", ips.get(i).copied().unwrap_or(0),
                    byteses.get(i).map(String::as_str).unwrap_or(""), o_line);
                println!("{:>8}   {:>24}   {}", "Expected", "", e_line);
                error = true;
            }
        }
        if error { Err(observed) } else { Ok(()) }
    }

    const ALL_REGISTERS: [Register; 8] = [EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI];
    const ALL_BINARY_OPS: [BinaryOp; 8] = [Add, Or, Adc, Sbb, And, Sub, Xor, Cmp];
    const ALL_CONDITIONS: [Condition; 16] =
        [O, NO, B, AE, Z, NZ, BE, A, S, NS, P, NP, L, GE, LE, G];

    const IMM: i32 = 0x76543210;
    const DISP: i32 = 0x12345678;

    #[test]
    fn regs() {
        let mut a = new_assembler();
        for &r in &ALL_REGISTERS {
            a.mov_rr(r, r);
        }
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "mov eax,eax",
            "mov ecx,ecx",
            "mov edx,edx",
            "mov ebx,ebx",
            "mov esp,esp",
            "mov ebp,ebp",
            "mov esi,esi",
            "mov edi,edi",
        ]).unwrap();
    }

    #[test]
    fn moves() {
        let mut a = new_assembler();
        a.mov_ri(EAX, IMM);
        a.mov_rm(ECX, &Address::base_disp(EBP, 8));
        a.mov_rm(EDX, &Address::base_disp(EBP, DISP));
        a.mov_mr(&Address::base_disp(EBP, -8), EBX);
        a.mov_mi(&Address::base_disp(ESP, 4), IMM);
        a.mov_rm(ESI, &Address::base(EBP));
        a.mov_rm(EDI, &Address::base(ESP));
        a.mov_rm(EAX, &Address::base_index(EBX, ECX, Scale::Four));
        a.mov_rm(EAX, &Address::index_disp(EDX, Scale::Eight, DISP));
        a.mov_rm(EAX, &Address::absolute(DISP));
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "mov eax,76543210h",
            "mov ecx,[ebp+8]",
            "mov edx,[ebp+12345678h]",
            "mov [ebp-8],ebx",
            "mov dword [esp+4],76543210h",
            "mov esi,[ebp]",
            "mov edi,[esp]",
            "mov eax,[ebx+ecx*4]",
            "mov eax,[edx*8+12345678h]",
            "mov eax,[12345678h]",
        ]).unwrap();
    }

    #[test]
    fn narrow() {
        let mut a = new_assembler();
        a.movb_mr(&Address::base_disp(EBP, -4), EAX);
        a.movw_mr(&Address::base_disp(EBP, -4), ECX);
        a.movsx_b_rr(EDX, EAX);
        a.movzx_b_rr(EDX, EBX);
        a.movsx_w_rr(ESI, ECX);
        a.movzx_w_rr(EDI, EDX);
        a.movsx_b_rm(EAX, &Address::base_disp(EBP, 8));
        a.movzx_b_rm(ECX, &Address::base_disp(EBP, 8));
        a.movsx_w_rm(EDX, &Address::base_disp(EBP, 8));
        a.movzx_w_rm(EBX, &Address::base_disp(EBP, 8));
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "mov [ebp-4],al",
            "mov [ebp-4],cx",
            "movsx edx,al",
            "movzx edx,bl",
            "movsx esi,cx",
            "movzx edi,dx",
            "movsx eax,byte [ebp+8]",
            "movzx ecx,byte [ebp+8]",
            "movsx edx,word [ebp+8]",
            "movzx ebx,word [ebp+8]",
        ]).unwrap();
    }

    #[test]
    fn binary_op() {
        let mut a = new_assembler();
        for &op in &ALL_BINARY_OPS {
            a.op_rr(op, EAX, ECX);
        }
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "add eax,ecx",
            "or eax,ecx",
            "adc eax,ecx",
            "sbb eax,ecx",
            "and eax,ecx",
            "sub eax,ecx",
            "xor eax,ecx",
            "cmp eax,ecx",
        ]).unwrap();
    }

    #[test]
    fn binary_mode() {
        let mut a = new_assembler();
        a.op_ri(Add, EAX, 7);
        a.op_ri(Add, EAX, IMM);
        a.op_ri_wide(Sub, ESP, 7);
        a.op_rm(Sub, ECX, &Address::base_disp(EBP, 8));
        a.op_mr(Xor, &Address::base_disp(EBP, -12), EDX);
        a.op_mi(Cmp, &Address::base_disp(EBP, 8), 0);
        a.op_mi(And, &Address::base_disp(EBP, 8), IMM);
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "add eax,7",
            "add eax,76543210h",
            "sub esp,7",
            "sub ecx,[ebp+8]",
            "xor [ebp-0Ch],edx",
            "cmp dword [ebp+8],0",
            "and dword [ebp+8],76543210h",
        ]).unwrap();
    }

    #[test]
    fn shift_op() {
        let mut a = new_assembler();
        a.shift_ri(Shl, EAX, 1);
        a.shift_ri(Shl, EAX, 5);
        a.shift_ri(Sar, EDX, 31);
        a.shift_ri(Rcl, ECX, 1);
        a.shift_ri(Rcr, EBX, 1);
        a.shift_r_cl(Shr, ESI);
        a.shift_mi(Shl, &Address::base_disp(EBP, -8), 1);
        a.shift_m_cl(Sar, &Address::base_disp(EBP, -8));
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "shl eax,1",
            "shl eax,5",
            "sar edx,1Fh",
            "rcl ecx,1",
            "rcr ebx,1",
            "shr esi,cl",
            "shl dword [ebp-8],1",
            "sar dword [ebp-8],cl",
        ]).unwrap();
    }

    #[test]
    fn mul_div() {
        let mut a = new_assembler();
        a.mul_rr(EAX, ECX);
        a.mul_rm(EDX, &Address::base_disp(EBP, -16));
        a.mul_rri(EDX, ESI, IMM);
        a.mul_rri(EAX, EAX, 10);
        a.imul_r(EDX);
        a.idiv_r(ESI);
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "imul eax,ecx",
            "imul edx,[ebp-10h]",
            "imul edx,esi,76543210h",
            "imul eax,0Ah",
            "imul edx",
            "idiv esi",
        ]).unwrap();
    }

    #[test]
    fn unary() {
        let mut a = new_assembler();
        a.neg_r(ECX);
        a.not_r(EBX);
        a.inc_r(EAX);
        a.dec_r(EDI);
        a.inc_m(&Address::base_disp(EBP, -4));
        a.dec_m(&Address::base_disp(EBP, -4));
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "neg ecx",
            "not ebx",
            "inc eax",
            "dec edi",
            "inc dword [ebp-4]",
            "dec dword [ebp-4]",
        ]).unwrap();
    }

    #[test]
    fn push_pop() {
        let mut a = new_assembler();
        a.push_r(EAX);
        a.push_i(IMM);
        a.push_m(&Address::base_disp(EBP, 8));
        a.pop_r(ECX);
        a.pop_m(&Address::base_disp(EBP, -4));
        a.ret();
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "push eax",
            "push 76543210h",
            "push dword [ebp+8]",
            "pop ecx",
            "pop dword [ebp-4]",
            "ret",
        ]).unwrap();
    }

    #[test]
    fn condition() {
        let mut a = new_assembler();
        let label = a.new_label();
        a.bind(label).unwrap();
        for &cc in &ALL_CONDITIONS {
            a.jump_if(cc, label);
        }
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "jo near 0",
            "jno near 0",
            "jb near 0",
            "jae near 0",
            "je near 0",
            "jne near 0",
            "jbe near 0",
            "ja near 0",
            "js near 0",
            "jns near 0",
            "jp near 0",
            "jnp near 0",
            "jl near 0",
            "jge near 0",
            "jle near 0",
            "jg near 0",
        ]).unwrap();
    }

    #[test]
    fn set_if() {
        let mut a = new_assembler();
        a.set_if(Z, EAX);
        a.set_if(L, EBX);
        a.set_if(A, ECX);
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "sete al",
            "setl bl",
            "seta cl",
        ]).unwrap();
    }

    #[test]
    fn jump_call() {
        let mut a = new_assembler();
        let label = a.new_label();
        a.bind(label).unwrap();
        a.jump_r(EAX);
        a.jump_m(&Address::base_disp(EBP, 8));
        a.const_jump(label);
        a.const_call(label);
        a.call_r(ECX);
        a.call_m(&Address::base_disp(EBP, 8));
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "jmp eax",
            "jmp dword [ebp+8]",
            "jmp 0",
            "call 0",
            "call ecx",
            "call dword [ebp+8]",
        ]).unwrap();
    }

    /** Forward references are patched exactly once, when the label binds. */
    #[test]
    fn patch() {
        let mut a = new_assembler();
        let label = a.new_label();
        a.jump_if(Z, label);
        a.const_jump(label);
        let len = a.get_pos();
        disassemble(&a.buffer[..len], vec![
            "je near 80000006h",
            "jmp 8000000Bh",
        ]).unwrap();
        a.bind(label).unwrap();
        disassemble(&a.buffer[..len], vec![
            "je near 0000000Bh",
            "jmp 0000000Bh",
        ]).unwrap();
        assert_eq!(a.target(label), Some(0x0B));
        assert!(a.bind(label).is_err());
    }

    /** Absolute label words hold the code offset until relocation. */
    #[test]
    fn absolute_words() {
        let mut a = new_assembler();
        let label = a.new_label();
        a.mov_ri_label(EAX, label);
        a.emit_label_word(label);
        a.bind(label).unwrap();
        assert_eq!(a.read_word(1), 9);
        assert_eq!(a.read_word(5), 9);
        let relocs = a.relocate(0x1000).unwrap();
        assert_eq!(relocs, vec![1, 5]);
        assert_eq!(a.read_word(1), 0x1009);
        assert_eq!(a.read_word(5), 0x1009);
    }

    #[test]
    fn fixups() {
        let mut a = new_assembler();
        a.call_fixup("div64");
        a.mov_ri_fixup(EAX, "handler");
        let fixups = a.fixup_info();
        assert_eq!(fixups.get(&(0x0100_0000 | 1)), Some(&String::from("div64")));
        assert_eq!(fixups.get(&6), Some(&String::from("handler")));
        let mut a2 = new_assembler();
        a2.call_fixup("rem64");
        let relocs = a2.relocate(0x4000).unwrap();
        assert_eq!(relocs, vec![0x0100_0001]);
        // The linker owns symbol sites; relocation must not touch them.
        assert_eq!(a2.read_word(1), 0);
    }

    #[test]
    fn unbound_label_rejected() {
        let mut a = new_assembler();
        let label = a.new_label();
        a.const_jump(label);
        assert!(a.relocate(0).is_err());
    }

    #[test]
    fn align() {
        let mut a = new_assembler();
        a.emit_byte(1);
        a.align(4);
        assert_eq!(a.get_pos(), 4);
        a.align(4);
        assert_eq!(a.get_pos(), 4);
        a.emit_word(-1);
        a.align(1);
        assert_eq!(a.get_pos(), 8);
    }

    #[test]
    fn pair_smoke() {
        // The allocator relies on these never aliasing.
        for &p in &[Pair::EDXEAX, Pair::EBXECX, Pair::EDIESI] {
            assert_ne!(p.hi(), p.lo());
        }
    }
}
