//! Patch records, the data section, and layout marks.
//!
//! Everything here is append-only during emission and consumed after
//! finalization by the code installer: data-section references, call
//! sites, implicit-exception sites, named layout marks, and the barrier
//! immediates the collector rewrites at phase changes.

use crate::error::{BailoutReason, JitResult};
use crate::lir::FrameStateId;
use crate::options::StubId;
use rustc_hash::FxHashMap;

// =============================================================================
// Marks
// =============================================================================

/// Named semantic offsets consumed by the runtime's stack walker and
/// deoptimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkId {
    /// First byte after the prologue.
    PrologueEnd,
    /// First byte of the (first) epilogue.
    EpilogueStart,
    /// Entry of the deopt handler trampoline area.
    DeoptHandler,
    /// First byte of the deferred barrier medium/slow paths.
    BarrierSlowPathsStart,
}

/// A recorded mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkRecord {
    pub offset: u32,
    pub id: MarkId,
}

// =============================================================================
// Data section
// =============================================================================

/// Index of an entry in the data section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataId(pub u32);

/// A constant placed in the data section. Structural equality drives the
/// per-compilation dedup cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataConstant {
    U32(u32),
    U64(u64),
}

impl DataConstant {
    /// Payload size in bytes.
    pub const fn size(self) -> u32 {
        match self {
            DataConstant::U32(_) => 4,
            DataConstant::U64(_) => 8,
        }
    }

    fn write(self, out: &mut Vec<u8>) {
        match self {
            DataConstant::U32(v) => out.extend_from_slice(&v.to_le_bytes()),
            DataConstant::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

/// One placed data-section entry.
#[derive(Debug, Clone, Copy)]
pub struct DataEntry {
    pub constant: DataConstant,
    /// Byte offset within the data section.
    pub offset: u32,
}

/// The per-compilation data section with its constant cache.
///
/// Equal constants collapse to one entry; unequal constants never do.
#[derive(Debug, Default)]
pub struct DataSection {
    entries: Vec<DataEntry>,
    cache: FxHashMap<DataConstant, DataId>,
    size: u32,
}

impl DataSection {
    pub fn new() -> Self {
        DataSection::default()
    }

    /// Intern a constant, returning the existing entry on structural
    /// equality. Alignment must be a power of two no larger than 16.
    pub fn intern(&mut self, constant: DataConstant, align: u32) -> JitResult<DataId> {
        if !align.is_power_of_two() || align > 16 {
            return Err(BailoutReason::UnsupportedAlignment { align }.into());
        }
        if let Some(&id) = self.cache.get(&constant) {
            return Ok(id);
        }
        let offset = (self.size + align - 1) & !(align - 1);
        let id = DataId(self.entries.len() as u32);
        self.entries.push(DataEntry { constant, offset });
        self.size = offset + constant.size();
        self.cache.insert(constant, id);
        Ok(id)
    }

    pub fn entry(&self, id: DataId) -> &DataEntry {
        &self.entries[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the section bytes, zero-filling alignment gaps.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size as usize);
        for entry in &self.entries {
            while (out.len() as u32) < entry.offset {
                out.push(0);
            }
            entry.constant.write(&mut out);
        }
        out
    }

    /// Drop all entries and the cache for a repeated emission pass.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.cache.clear();
        self.size = 0;
    }
}

// =============================================================================
// Patch records
// =============================================================================

/// Rewrite the 16-bit immediate field of the instruction at `offset`.
fn patch_imm16(code: &mut [u8], offset: u32, value: u16) {
    let at = offset as usize;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&code[at..at + 4]);
    let inst = (u32::from_le_bytes(bytes) & !0xffff) | value as u32;
    code[at..at + 4].copy_from_slice(&inst.to_le_bytes());
}

/// A reference from code to a data-section entry, resolved to the
/// entry's byte offset at finalization.
///
/// Points at a fixed-shape 64-bit materialization sequence; the installer
/// patches the absolute entry address once the method's layout is fixed.
#[derive(Debug, Clone, Copy)]
pub struct DataRefRecord {
    /// Offset of the first instruction of the materialization sequence.
    pub code_offset: u32,
    /// Byte offset of the entry within the data section.
    pub data_offset: u32,
}

impl DataRefRecord {
    /// Patch the absolute address `data_base + data_offset` into the
    /// materialization sequence.
    pub fn apply(&self, code: &mut [u8], data_base: u64) {
        let addr = data_base + self.data_offset as u64;
        let off = self.code_offset;
        patch_imm16(code, off, (addr >> 48) as u16); // lui
        patch_imm16(code, off + 4, (addr >> 32) as u16); // ori
        patch_imm16(code, off + 12, (addr >> 16) as u16); // ori
        patch_imm16(code, off + 20, addr as u16); // ori
    }
}

/// A reference from code to an absolute position in the same method
/// (long-form branches that materialize their target address).
///
/// Offsets are buffer-relative; the installer adds the code base.
#[derive(Debug, Clone, Copy)]
pub struct CodeRefRecord {
    /// Offset of the first instruction of the materialization sequence.
    pub code_offset: u32,
    /// Buffer-relative offset of the branch target.
    pub target_offset: u32,
}

impl CodeRefRecord {
    /// Patch the absolute target address into the sequence.
    pub fn apply(&self, code: &mut [u8], code_base: u64) {
        let addr = code_base + self.target_offset as u64;
        let off = self.code_offset;
        patch_imm16(code, off, (addr >> 48) as u16); // lui
        patch_imm16(code, off + 4, (addr >> 32) as u16); // ori
        patch_imm16(code, off + 12, (addr >> 16) as u16); // ori
        patch_imm16(code, off + 20, addr as u16); // ori
    }
}

/// Which collector pattern a patchable barrier immediate holds.
///
/// Distinct from data references and call sites: the collector rewrites
/// these in place on phase changes, and locates them by this tag alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierImmKind {
    LoadBadMask,
    StoreBadMask,
    StoreGoodColor,
    YoungNull,
}

/// A patchable barrier immediate site.
#[derive(Debug, Clone, Copy)]
pub struct BarrierPatchRecord {
    /// Offset of the instruction whose imm16 field holds the pattern.
    pub code_offset: u32,
    pub kind: BarrierImmKind,
}

impl BarrierPatchRecord {
    /// Rewrite the pattern, as the collector does on a phase change.
    pub fn apply(&self, code: &mut [u8], value: u16) {
        patch_imm16(code, self.code_offset, value);
    }
}

// =============================================================================
// Call sites and exceptions
// =============================================================================

/// What a call site targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSiteTarget {
    /// Direct call to a runtime stub; the installer may re-link the
    /// materialized address.
    Stub(StubId),
    /// Indirect call through a register.
    Indirect,
}

/// A recorded call site.
#[derive(Debug, Clone, Copy)]
pub struct CallSiteRecord {
    /// Offset of the JALR instruction.
    pub offset: u32,
    pub target: CallSiteTarget,
    /// Frame state for deopt/debug at this call, when the call has one.
    pub frame_state: Option<FrameStateId>,
}

/// An exception-table entry: a call that may unwind, and where to land.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionRecord {
    /// Offset of the potentially-throwing call site.
    pub from_offset: u32,
    /// Offset of the handler's first instruction.
    pub handler_offset: u32,
}

/// A faulting-instruction site: the runtime turns the hardware fault at
/// `offset` into a dispatch through the recovery descriptor.
#[derive(Debug, Clone, Copy)]
pub struct ImplicitExceptionRecord {
    /// Offset of the instruction that may fault.
    pub offset: u32,
    pub state: FrameStateId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JitError;

    #[test]
    fn equal_constants_share_an_entry() {
        let mut section = DataSection::new();
        let a = section.intern(DataConstant::U64(0x1234), 8).unwrap();
        let b = section.intern(DataConstant::U64(0x1234), 8).unwrap();
        let c = section.intern(DataConstant::U64(0x5678), 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(section.len(), 2);
    }

    #[test]
    fn unequal_widths_never_collapse() {
        let mut section = DataSection::new();
        let a = section.intern(DataConstant::U32(7), 4).unwrap();
        let b = section.intern(DataConstant::U64(7), 8).unwrap();
        assert_ne!(a, b);
        assert_eq!(section.len(), 2);
    }

    #[test]
    fn alignment_gaps_are_zero_filled() {
        let mut section = DataSection::new();
        section.intern(DataConstant::U32(0xaaaa_bbbb), 4).unwrap();
        let id = section.intern(DataConstant::U64(0xcccc_dddd), 8).unwrap();
        assert_eq!(section.entry(id).offset, 8);
        let bytes = section.to_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn bad_alignment_bails_out() {
        let mut section = DataSection::new();
        let err = section.intern(DataConstant::U64(1), 3).unwrap_err();
        assert!(matches!(err, JitError::Bailout(_)));
    }

    #[test]
    fn barrier_patch_rewrites_imm16() {
        // ori at, at, 0x000c
        let mut code = 0x3421_000cu32.to_le_bytes().to_vec();
        let patch = BarrierPatchRecord { code_offset: 0, kind: BarrierImmKind::LoadBadMask };
        patch.apply(&mut code, 0x00f0);
        assert_eq!(u32::from_le_bytes(code[0..4].try_into().unwrap()), 0x3421_00f0);
    }
}
