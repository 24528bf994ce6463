//! MIPS64 assembler with label support.
//!
//! Provides mnemonic-level emission into a growable code buffer with:
//! - Label management and forward references
//! - Branch relocation resolution
//! - Fixed-shape 64-bit immediate materialization for patchable sites
//!
//! Every branch has an architectural delay slot; this layer emits exactly
//! what it is told and leaves slot discipline to the delay-slot
//! coordinator above it.

use super::encoder::{self, EncodedInst};
use super::registers::Gpr;
use crate::error::{JitError, JitResult};

// =============================================================================
// Labels
// =============================================================================

/// A label representing a position in the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Label(id)
    }

    #[inline]
    pub const fn id(self) -> u32 {
        self.0
    }
}

/// Relocation type for MIPS64 label references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationType {
    /// 18-bit signed word displacement in an I-type branch (±128KB).
    Branch16,
}

/// A relocation entry.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    /// Offset in the code buffer where the relocation applies.
    pub offset: u32,
    /// The label this relocation refers to.
    pub label: Label,
    /// Type of relocation.
    pub kind: RelocationType,
}

// =============================================================================
// Assembler
// =============================================================================

/// MIPS64 assembler over a byte buffer.
pub struct Mips64Assembler {
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    relocations: Vec<Relocation>,
    next_label: u32,
}

impl Mips64Assembler {
    /// Create a new assembler.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create with the given code-buffer capacity.
    pub fn with_capacity(cap: usize) -> Self {
        Mips64Assembler {
            code: Vec::with_capacity(cap),
            labels: Vec::new(),
            relocations: Vec::new(),
            next_label: 0,
        }
    }

    /// Current code position in bytes.
    #[inline]
    pub fn position(&self) -> u32 {
        self.code.len() as u32
    }

    /// Create a new unbound label.
    pub fn create_label(&mut self) -> Label {
        let id = self.next_label;
        self.next_label += 1;
        self.labels.push(None);
        Label::new(id)
    }

    /// Bind a label to the current position.
    pub fn bind_label(&mut self, label: Label) {
        let pos = self.position();
        self.labels[label.id() as usize] = Some(pos);
    }

    /// Bound position of a label, `None` while still a forward reference.
    #[inline]
    pub fn label_offset(&self, label: Label) -> Option<u32> {
        self.labels.get(label.id() as usize).copied().flatten()
    }

    /// Ids of all labels that are still unbound.
    pub fn unbound_labels(&self) -> Vec<u32> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, bind)| bind.is_none())
            .map(|(id, _)| id as u32)
            .collect()
    }

    /// Clear all code, labels and relocations for a fresh emission pass.
    pub fn reset(&mut self) {
        self.code.clear();
        self.labels.clear();
        self.relocations.clear();
        self.next_label = 0;
    }

    /// Emit a raw instruction.
    fn emit(&mut self, inst: EncodedInst) {
        self.code.extend_from_slice(&inst.to_le_bytes());
    }

    /// Emit with a label relocation.
    fn emit_with_reloc(&mut self, inst: EncodedInst, label: Label, kind: RelocationType) {
        let offset = self.position();
        self.relocations.push(Relocation { offset, label, kind });
        self.emit(inst);
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Resolve all branch relocations in place.
    ///
    /// Fails on any reference to a still-unbound label or a displacement
    /// that does not fit the branch format.
    pub fn resolve_relocations(&mut self) -> JitResult<()> {
        for reloc in &self.relocations {
            let target = self.labels[reloc.label.id() as usize].ok_or_else(|| {
                JitError::invariant(format!("unbound label L{}", reloc.label.id()))
            })?;

            match reloc.kind {
                RelocationType::Branch16 => {
                    // Displacement counts words from the delay slot.
                    let diff = target as i64 - (reloc.offset as i64 + 4);
                    let words = diff >> 2;
                    if words < i16::MIN as i64 || words > i16::MAX as i64 {
                        return Err(JitError::invariant(format!(
                            "branch at {:#x} to L{} out of range ({} bytes)",
                            reloc.offset,
                            reloc.label.id(),
                            diff
                        )));
                    }
                    let at = reloc.offset as usize;
                    let mut bytes = [0u8; 4];
                    bytes.copy_from_slice(&self.code[at..at + 4]);
                    let inst = (u32::from_le_bytes(bytes) & !0xffff) | (words as u16 as u32);
                    self.code[at..at + 4].copy_from_slice(&inst.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    /// The assembled bytes.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Take ownership of the assembled bytes.
    pub fn take_code(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.code)
    }

    // =========================================================================
    // Arithmetic / Logical
    // =========================================================================

    /// DADDU rd, rs, rt
    pub fn daddu(&mut self, rd: Gpr, rs: Gpr, rt: Gpr) {
        self.emit(encoder::encode_daddu(rd, rs, rt));
    }

    /// DSUBU rd, rs, rt
    pub fn dsubu(&mut self, rd: Gpr, rs: Gpr, rt: Gpr) {
        self.emit(encoder::encode_dsubu(rd, rs, rt));
    }

    /// AND rd, rs, rt
    pub fn and_(&mut self, rd: Gpr, rs: Gpr, rt: Gpr) {
        self.emit(encoder::encode_and(rd, rs, rt));
    }

    /// OR rd, rs, rt
    pub fn or_(&mut self, rd: Gpr, rs: Gpr, rt: Gpr) {
        self.emit(encoder::encode_or(rd, rs, rt));
    }

    /// XOR rd, rs, rt
    pub fn xor_(&mut self, rd: Gpr, rs: Gpr, rt: Gpr) {
        self.emit(encoder::encode_xor(rd, rs, rt));
    }

    /// NOR rd, rs, rt
    pub fn nor(&mut self, rd: Gpr, rs: Gpr, rt: Gpr) {
        self.emit(encoder::encode_nor(rd, rs, rt));
    }

    /// SLT rd, rs, rt
    pub fn slt(&mut self, rd: Gpr, rs: Gpr, rt: Gpr) {
        self.emit(encoder::encode_slt(rd, rs, rt));
    }

    /// SLTU rd, rs, rt
    pub fn sltu(&mut self, rd: Gpr, rs: Gpr, rt: Gpr) {
        self.emit(encoder::encode_sltu(rd, rs, rt));
    }

    /// MOVE rd, rs (DADDU rd, rs, zero)
    pub fn mov(&mut self, rd: Gpr, rs: Gpr) {
        self.emit(encoder::encode_daddu(rd, rs, Gpr::Zero));
    }

    /// DADDIU rt, rs, #imm
    pub fn daddiu(&mut self, rt: Gpr, rs: Gpr, imm: i16) {
        self.emit(encoder::encode_daddiu(rt, rs, imm));
    }

    /// ANDI rt, rs, #imm
    pub fn andi(&mut self, rt: Gpr, rs: Gpr, imm: u16) {
        self.emit(encoder::encode_andi(rt, rs, imm));
    }

    /// ORI rt, rs, #imm
    pub fn ori(&mut self, rt: Gpr, rs: Gpr, imm: u16) {
        self.emit(encoder::encode_ori(rt, rs, imm));
    }

    /// XORI rt, rs, #imm
    pub fn xori(&mut self, rt: Gpr, rs: Gpr, imm: u16) {
        self.emit(encoder::encode_xori(rt, rs, imm));
    }

    /// LUI rt, #imm
    pub fn lui(&mut self, rt: Gpr, imm: u16) {
        self.emit(encoder::encode_lui(rt, imm));
    }

    // =========================================================================
    // Shifts
    // =========================================================================

    /// DSLL rd, rt, #sa (sa < 32)
    pub fn dsll(&mut self, rd: Gpr, rt: Gpr, sa: u8) {
        self.emit(encoder::encode_dsll(rd, rt, sa));
    }

    /// DSRL rd, rt, #sa (sa < 32)
    pub fn dsrl(&mut self, rd: Gpr, rt: Gpr, sa: u8) {
        self.emit(encoder::encode_dsrl(rd, rt, sa));
    }

    /// DSRA rd, rt, #sa, accepting the full 0..64 range.
    pub fn dsra(&mut self, rd: Gpr, rt: Gpr, sa: u8) {
        if sa < 32 {
            self.emit(encoder::encode_dsra(rd, rt, sa));
        } else {
            self.emit(encoder::encode_dsra32(rd, rt, sa - 32));
        }
    }

    // =========================================================================
    // Loads / Stores
    // =========================================================================

    /// LD rt, offset(base)
    pub fn ld(&mut self, rt: Gpr, base: Gpr, offset: i16) {
        self.emit(encoder::encode_ld(rt, base, offset));
    }

    /// SD rt, offset(base)
    pub fn sd(&mut self, rt: Gpr, base: Gpr, offset: i16) {
        self.emit(encoder::encode_sd(rt, base, offset));
    }

    /// LW rt, offset(base)
    pub fn lw(&mut self, rt: Gpr, base: Gpr, offset: i16) {
        self.emit(encoder::encode_lw(rt, base, offset));
    }

    /// SW rt, offset(base)
    pub fn sw(&mut self, rt: Gpr, base: Gpr, offset: i16) {
        self.emit(encoder::encode_sw(rt, base, offset));
    }

    /// LHU rt, offset(base)
    pub fn lhu(&mut self, rt: Gpr, base: Gpr, offset: i16) {
        self.emit(encoder::encode_lhu(rt, base, offset));
    }

    /// LLD rt, offset(base)
    pub fn lld(&mut self, rt: Gpr, base: Gpr, offset: i16) {
        self.emit(encoder::encode_lld(rt, base, offset));
    }

    /// SCD rt, offset(base)
    pub fn scd(&mut self, rt: Gpr, base: Gpr, offset: i16) {
        self.emit(encoder::encode_scd(rt, base, offset));
    }

    // =========================================================================
    // Branches
    // =========================================================================

    /// BEQ rs, rt, label
    pub fn beq(&mut self, rs: Gpr, rt: Gpr, target: Label) {
        self.emit_with_reloc(encoder::encode_beq(rs, rt, 0), target, RelocationType::Branch16);
    }

    /// BNE rs, rt, label
    pub fn bne(&mut self, rs: Gpr, rt: Gpr, target: Label) {
        self.emit_with_reloc(encoder::encode_bne(rs, rt, 0), target, RelocationType::Branch16);
    }

    /// BLTZ rs, label
    pub fn bltz(&mut self, rs: Gpr, target: Label) {
        self.emit_with_reloc(encoder::encode_bltz(rs, 0), target, RelocationType::Branch16);
    }

    /// BGEZ rs, label
    pub fn bgez(&mut self, rs: Gpr, target: Label) {
        self.emit_with_reloc(encoder::encode_bgez(rs, 0), target, RelocationType::Branch16);
    }

    /// BLEZ rs, label
    pub fn blez(&mut self, rs: Gpr, target: Label) {
        self.emit_with_reloc(encoder::encode_blez(rs, 0), target, RelocationType::Branch16);
    }

    /// BGTZ rs, label
    pub fn bgtz(&mut self, rs: Gpr, target: Label) {
        self.emit_with_reloc(encoder::encode_bgtz(rs, 0), target, RelocationType::Branch16);
    }

    /// B label (BEQ zero, zero)
    pub fn b(&mut self, target: Label) {
        self.beq(Gpr::Zero, Gpr::Zero, target);
    }

    /// JR rs
    pub fn jr(&mut self, rs: Gpr) {
        self.emit(encoder::encode_jr(rs));
    }

    /// JALR rd, rs
    pub fn jalr(&mut self, rd: Gpr, rs: Gpr) {
        self.emit(encoder::encode_jalr(rd, rs));
    }

    // =========================================================================
    // System
    // =========================================================================

    /// NOP
    pub fn nop(&mut self) {
        self.emit(encoder::encode_nop());
    }

    /// BREAK #code
    pub fn break_(&mut self, code: u16) {
        self.emit(encoder::encode_break(code));
    }

    /// SYNC
    pub fn sync(&mut self) {
        self.emit(encoder::encode_sync());
    }

    /// Pad with NOPs to the given power-of-two alignment.
    pub fn align_to(&mut self, align: u32) {
        debug_assert!(align.is_power_of_two());
        while self.position() % align != 0 {
            self.nop();
        }
    }

    // =========================================================================
    // Immediate materialization
    // =========================================================================

    /// Load a full 64-bit immediate with a fixed six-instruction shape:
    /// `LUI; ORI; DSLL 16; ORI; DSLL 16; ORI`.
    ///
    /// The shape never varies with the value so patch records can rewrite
    /// the four 16-bit immediate fields in place. Returns the offset of
    /// the first instruction.
    pub fn mov_imm64_fixed(&mut self, rd: Gpr, val: u64) -> u32 {
        let start = self.position();
        self.lui(rd, (val >> 48) as u16);
        self.ori(rd, rd, (val >> 32) as u16);
        self.dsll(rd, rd, 16);
        self.ori(rd, rd, (val >> 16) as u16);
        self.dsll(rd, rd, 16);
        self.ori(rd, rd, val as u16);
        start
    }
}

impl Default for Mips64Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte length of the [`Mips64Assembler::mov_imm64_fixed`] sequence.
pub const MOV_IMM64_BYTES: u32 = 24;

// =============================================================================
// Tests
// =============================================================================
