//! MIPS64 instruction encoder.
//!
//! This module provides low-level encoding for MIPS64 instructions.
//! All instructions are exactly 32 bits (4 bytes), little-endian in the
//! code buffer.
//!
//! Formats:
//! - R-type: `op(6) rs(5) rt(5) rd(5) sa(5) funct(6)`
//! - I-type: `op(6) rs(5) rt(5) imm(16)`
//! - J-type: `op(6) index(26)`

use super::registers::Gpr;

// =============================================================================
// Encoded Instruction
// =============================================================================

/// An encoded MIPS64 instruction (always 32 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedInst(u32);

impl EncodedInst {
    /// Create from raw bits.
    #[inline(always)]
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    /// Get the raw bits.
    #[inline(always)]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Get as little-endian bytes.
    #[inline(always)]
    pub const fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl Default for EncodedInst {
    fn default() -> Self {
        Self(0)
    }
}

// =============================================================================
// Field assembly helpers
// =============================================================================

const OP_SPECIAL: u32 = 0x00;
const OP_REGIMM: u32 = 0x01;

#[inline(always)]
const fn r_type(rs: u32, rt: u32, rd: u32, sa: u32, funct: u32) -> EncodedInst {
    EncodedInst::new((OP_SPECIAL << 26) | (rs << 21) | (rt << 16) | (rd << 11) | (sa << 6) | funct)
}

#[inline(always)]
const fn i_type(op: u32, rs: u32, rt: u32, imm: u16) -> EncodedInst {
    EncodedInst::new((op << 26) | (rs << 21) | (rt << 16) | imm as u32)
}

// =============================================================================
// Arithmetic / Logical (register)
// =============================================================================

/// DADDU rd, rs, rt
#[inline]
pub fn encode_daddu(rd: Gpr, rs: Gpr, rt: Gpr) -> EncodedInst {
    r_type(rs.field(), rt.field(), rd.field(), 0, 0x2d)
}

/// DSUBU rd, rs, rt
#[inline]
pub fn encode_dsubu(rd: Gpr, rs: Gpr, rt: Gpr) -> EncodedInst {
    r_type(rs.field(), rt.field(), rd.field(), 0, 0x2f)
}

/// AND rd, rs, rt
#[inline]
pub fn encode_and(rd: Gpr, rs: Gpr, rt: Gpr) -> EncodedInst {
    r_type(rs.field(), rt.field(), rd.field(), 0, 0x24)
}

/// OR rd, rs, rt
#[inline]
pub fn encode_or(rd: Gpr, rs: Gpr, rt: Gpr) -> EncodedInst {
    r_type(rs.field(), rt.field(), rd.field(), 0, 0x25)
}

/// XOR rd, rs, rt
#[inline]
pub fn encode_xor(rd: Gpr, rs: Gpr, rt: Gpr) -> EncodedInst {
    r_type(rs.field(), rt.field(), rd.field(), 0, 0x26)
}

/// NOR rd, rs, rt
#[inline]
pub fn encode_nor(rd: Gpr, rs: Gpr, rt: Gpr) -> EncodedInst {
    r_type(rs.field(), rt.field(), rd.field(), 0, 0x27)
}

/// SLT rd, rs, rt
#[inline]
pub fn encode_slt(rd: Gpr, rs: Gpr, rt: Gpr) -> EncodedInst {
    r_type(rs.field(), rt.field(), rd.field(), 0, 0x2a)
}

/// SLTU rd, rs, rt
#[inline]
pub fn encode_sltu(rd: Gpr, rs: Gpr, rt: Gpr) -> EncodedInst {
    r_type(rs.field(), rt.field(), rd.field(), 0, 0x2b)
}

// =============================================================================
// Arithmetic / Logical (immediate)
// =============================================================================

/// DADDIU rt, rs, #imm (sign-extended)
#[inline]
pub fn encode_daddiu(rt: Gpr, rs: Gpr, imm: i16) -> EncodedInst {
    i_type(0x19, rs.field(), rt.field(), imm as u16)
}

/// ADDIU rt, rs, #imm (32-bit, sign-extended result)
#[inline]
pub fn encode_addiu(rt: Gpr, rs: Gpr, imm: i16) -> EncodedInst {
    i_type(0x09, rs.field(), rt.field(), imm as u16)
}

/// ANDI rt, rs, #imm (zero-extended)
#[inline]
pub fn encode_andi(rt: Gpr, rs: Gpr, imm: u16) -> EncodedInst {
    i_type(0x0c, rs.field(), rt.field(), imm)
}

/// ORI rt, rs, #imm (zero-extended)
#[inline]
pub fn encode_ori(rt: Gpr, rs: Gpr, imm: u16) -> EncodedInst {
    i_type(0x0d, rs.field(), rt.field(), imm)
}

/// XORI rt, rs, #imm (zero-extended)
#[inline]
pub fn encode_xori(rt: Gpr, rs: Gpr, imm: u16) -> EncodedInst {
    i_type(0x0e, rs.field(), rt.field(), imm)
}

/// LUI rt, #imm
#[inline]
pub fn encode_lui(rt: Gpr, imm: u16) -> EncodedInst {
    i_type(0x0f, 0, rt.field(), imm)
}

// =============================================================================
// Shifts
// =============================================================================

/// DSLL rd, rt, #sa (sa in 0..32)
#[inline]
pub fn encode_dsll(rd: Gpr, rt: Gpr, sa: u8) -> EncodedInst {
    debug_assert!(sa < 32);
    r_type(0, rt.field(), rd.field(), sa as u32, 0x38)
}

/// DSRL rd, rt, #sa (sa in 0..32)
#[inline]
pub fn encode_dsrl(rd: Gpr, rt: Gpr, sa: u8) -> EncodedInst {
    debug_assert!(sa < 32);
    r_type(0, rt.field(), rd.field(), sa as u32, 0x3a)
}

/// DSRA rd, rt, #sa (sa in 0..32)
#[inline]
pub fn encode_dsra(rd: Gpr, rt: Gpr, sa: u8) -> EncodedInst {
    debug_assert!(sa < 32);
    r_type(0, rt.field(), rd.field(), sa as u32, 0x3b)
}

/// DSLL32 rd, rt, #sa (shifts by sa+32)
#[inline]
pub fn encode_dsll32(rd: Gpr, rt: Gpr, sa: u8) -> EncodedInst {
    debug_assert!(sa < 32);
    r_type(0, rt.field(), rd.field(), sa as u32, 0x3c)
}

/// DSRA32 rd, rt, #sa (shifts by sa+32)
#[inline]
pub fn encode_dsra32(rd: Gpr, rt: Gpr, sa: u8) -> EncodedInst {
    debug_assert!(sa < 32);
    r_type(0, rt.field(), rd.field(), sa as u32, 0x3f)
}

// =============================================================================
// Loads / Stores
// =============================================================================

/// LD rt, offset(base)
#[inline]
pub fn encode_ld(rt: Gpr, base: Gpr, offset: i16) -> EncodedInst {
    i_type(0x37, base.field(), rt.field(), offset as u16)
}

/// SD rt, offset(base)
#[inline]
pub fn encode_sd(rt: Gpr, base: Gpr, offset: i16) -> EncodedInst {
    i_type(0x3f, base.field(), rt.field(), offset as u16)
}

/// LW rt, offset(base)
#[inline]
pub fn encode_lw(rt: Gpr, base: Gpr, offset: i16) -> EncodedInst {
    i_type(0x23, base.field(), rt.field(), offset as u16)
}

/// SW rt, offset(base)
#[inline]
pub fn encode_sw(rt: Gpr, base: Gpr, offset: i16) -> EncodedInst {
    i_type(0x2b, base.field(), rt.field(), offset as u16)
}

/// LHU rt, offset(base)
#[inline]
pub fn encode_lhu(rt: Gpr, base: Gpr, offset: i16) -> EncodedInst {
    i_type(0x25, base.field(), rt.field(), offset as u16)
}

/// LLD rt, offset(base) — load linked doubleword
#[inline]
pub fn encode_lld(rt: Gpr, base: Gpr, offset: i16) -> EncodedInst {
    i_type(0x34, base.field(), rt.field(), offset as u16)
}

/// SCD rt, offset(base) — store conditional doubleword
#[inline]
pub fn encode_scd(rt: Gpr, base: Gpr, offset: i16) -> EncodedInst {
    i_type(0x3c, base.field(), rt.field(), offset as u16)
}

// =============================================================================
// Branches
// =============================================================================

/// BEQ rs, rt, #disp (word displacement from the delay slot)
#[inline]
pub fn encode_beq(rs: Gpr, rt: Gpr, disp: i16) -> EncodedInst {
    i_type(0x04, rs.field(), rt.field(), disp as u16)
}

/// BNE rs, rt, #disp
#[inline]
pub fn encode_bne(rs: Gpr, rt: Gpr, disp: i16) -> EncodedInst {
    i_type(0x05, rs.field(), rt.field(), disp as u16)
}

/// BLEZ rs, #disp
#[inline]
pub fn encode_blez(rs: Gpr, disp: i16) -> EncodedInst {
    i_type(0x06, rs.field(), 0, disp as u16)
}

/// BGTZ rs, #disp
#[inline]
pub fn encode_bgtz(rs: Gpr, disp: i16) -> EncodedInst {
    i_type(0x07, rs.field(), 0, disp as u16)
}

/// BLTZ rs, #disp
#[inline]
pub fn encode_bltz(rs: Gpr, disp: i16) -> EncodedInst {
    i_type(OP_REGIMM, rs.field(), 0x00, disp as u16)
}

/// BGEZ rs, #disp
#[inline]
pub fn encode_bgez(rs: Gpr, disp: i16) -> EncodedInst {
    i_type(OP_REGIMM, rs.field(), 0x01, disp as u16)
}

/// JR rs
#[inline]
pub fn encode_jr(rs: Gpr) -> EncodedInst {
    r_type(rs.field(), 0, 0, 0, 0x08)
}

/// JALR rd, rs
#[inline]
pub fn encode_jalr(rd: Gpr, rs: Gpr) -> EncodedInst {
    r_type(rs.field(), 0, rd.field(), 0, 0x09)
}

// =============================================================================
// System
// =============================================================================

/// NOP (SLL zero, zero, 0)
#[inline]
pub fn encode_nop() -> EncodedInst {
    EncodedInst::new(0)
}

/// BREAK #code
#[inline]
pub fn encode_break(code: u16) -> EncodedInst {
    EncodedInst::new(((code as u32) << 6) | 0x0d)
}

/// SYNC
#[inline]
pub fn encode_sync() -> EncodedInst {
    EncodedInst::new(0x0f)
}
