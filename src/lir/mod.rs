//! Architecture-neutral LIR scaffolding.
//!
//! The register allocator upstream delivers a [`LirFunction`]: basic blocks
//! holding already-allocated instructions, a fixed code-emitting order, the
//! successor relation, and the frame layout. Instructions themselves are
//! architecture-specific; the only capability this layer asks of them is
//! the narrow [`InstEmit`] interface.

use crate::emit::context::EmissionContext;
use crate::error::{BailoutReason, JitResult};
use smallvec::SmallVec;
use std::fmt;

// =============================================================================
// Identifiers
// =============================================================================

/// A basic block id, dense from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Identity of an instruction: its block and list position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstId {
    pub block: BlockId,
    pub index: u32,
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.block, self.index)
    }
}

/// A spill/local slot in the frame, resolved through [`FrameLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u32);

/// Reference to a frame state owned by the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameStateId(pub u32);

// =============================================================================
// Operands
// =============================================================================

/// How an instruction relates to one of its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandRole {
    /// Written by the instruction.
    Def,
    /// Read by the instruction.
    Use,
    /// Scratch the allocator reserved for the instruction's internal use.
    Temp,
    /// Alive across the instruction but not modified.
    Alive,
    /// Deopt/recovery metadata, not a machine value.
    State,
}

/// An allocated operand as the register allocator produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(crate::backend::mips64::registers::Gpr),
    Slot(SlotId),
    Imm(i64),
    Block(BlockId),
    State(FrameStateId),
}

// =============================================================================
// Size estimation
// =============================================================================

/// Conservative pre-emission size estimate for one instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeEstimate {
    /// Upper bound on emitted code bytes, including deferred paths.
    pub code_bytes: u32,
    /// Upper bound on data-section bytes.
    pub data_bytes: u32,
}

impl SizeEstimate {
    pub const fn new(code_bytes: u32, data_bytes: u32) -> Self {
        SizeEstimate { code_bytes, data_bytes }
    }

    /// Accumulate another estimate.
    pub fn add(&mut self, other: SizeEstimate) {
        self.code_bytes += other.code_bytes;
        self.data_bytes += other.data_bytes;
    }
}

// =============================================================================
// The emission capability
// =============================================================================

/// The one capability the pipeline requires of an instruction family.
///
/// Implementations encode themselves into the context's assembler. A
/// second architecture would provide its own instruction enum behind this
/// same interface.
pub trait InstEmit: fmt::Display {
    /// Encode this instruction.
    fn emit(&self, ctx: &mut EmissionContext) -> JitResult<()>;

    /// Conservative size estimate used to pre-size buffers.
    fn size_estimate(&self) -> SizeEstimate;

    /// Visit the instruction's operands with their roles.
    fn for_each_operand(&self, f: &mut dyn FnMut(OperandRole, Operand));

    /// Clear per-instruction emission state (delay-slot holders) before a
    /// repeated pass.
    fn reset_emit_state(&self) {}

    /// False when control cannot continue to the lexically next
    /// instruction/block (unconditional jumps, returns, traps).
    fn falls_through(&self) -> bool {
        true
    }
}

// =============================================================================
// Frame layout
// =============================================================================

/// Frame geometry decided by the register allocator.
///
/// Offsets are from the stack pointer after the prologue's adjustment.
#[derive(Debug, Clone)]
pub struct FrameLayout {
    /// Total frame size in bytes, 16-aligned.
    pub frame_size: u32,
    /// Where the return address is saved.
    pub ra_offset: i32,
    /// Where the caller's frame pointer is saved.
    pub fp_offset: i32,
    /// Byte offsets for spill/local slots, indexed by [`SlotId`].
    pub slot_offsets: Vec<i32>,
}

impl FrameLayout {
    /// Minimal layout with the given spill slots (8 bytes each) following
    /// the ra/fp save area.
    pub fn with_slots(slot_count: u32) -> Self {
        let mut slot_offsets = Vec::with_capacity(slot_count as usize);
        for i in 0..slot_count {
            slot_offsets.push(16 + (i as i32) * 8);
        }
        let raw = 16 + slot_count * 8;
        FrameLayout {
            frame_size: (raw + 15) & !15,
            ra_offset: 0,
            fp_offset: 8,
            slot_offsets,
        }
    }

    /// Resolve a slot to a 16-bit displacement, bailing out when the frame
    /// has outgrown the load/store format.
    pub fn slot_offset(&self, slot: SlotId) -> JitResult<i16> {
        let off = self.slot_offsets[slot.0 as usize];
        i16::try_from(off)
            .map_err(|_| BailoutReason::FrameTooLarge { offset: off as i64 }.into())
    }

    /// The prologue's stack adjustment, checked against the immediate
    /// format.
    pub fn stack_adjust(&self) -> JitResult<i16> {
        i16::try_from(self.frame_size as i64)
            .map_err(|_| BailoutReason::FrameTooLarge { offset: self.frame_size as i64 }.into())
    }
}

// =============================================================================
// Frame states
// =============================================================================

/// Recovery descriptor consumed by the deoptimizer: enough to rebuild the
/// interpreter frame at the associated point.
#[derive(Debug, Clone)]
pub struct FrameState {
    /// Bytecode index to resume at.
    pub bci: u32,
    /// Frame slots holding live values at this point.
    pub live_slots: SmallVec<[SlotId; 8]>,
}

// =============================================================================
// Blocks and functions
// =============================================================================

/// A basic block of allocated instructions.
#[derive(Debug)]
pub struct Block<I> {
    pub id: BlockId,
    pub insts: Vec<I>,
    /// Control-flow successors, taken-target first.
    pub successors: SmallVec<[BlockId; 2]>,
    /// True for blocks that head a loop; candidates for alignment.
    pub loop_header: bool,
}

impl<I> Block<I> {
    pub fn new(id: BlockId) -> Self {
        Block {
            id,
            insts: Vec::new(),
            successors: SmallVec::new(),
            loop_header: false,
        }
    }
}

/// A register-allocated function ready for emission.
#[derive(Debug)]
pub struct LirFunction<I> {
    /// Blocks indexed by [`BlockId`].
    pub blocks: Vec<Block<I>>,
    /// Code-emitting order decided by the upstream scheduler.
    pub order: Vec<BlockId>,
    /// Frame geometry.
    pub frame: FrameLayout,
    /// Frame states referenced by instructions, indexed by
    /// [`FrameStateId`].
    pub frame_states: Vec<FrameState>,
}

impl<I> LirFunction<I> {
    /// New function with the given frame; blocks appended via
    /// [`LirFunction::add_block`].
    pub fn new(frame: FrameLayout) -> Self {
        LirFunction {
            blocks: Vec::new(),
            order: Vec::new(),
            frame,
            frame_states: Vec::new(),
        }
    }

    /// Append an empty block, which is also appended to the emission
    /// order.
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(id));
        self.order.push(id);
        id
    }

    /// Register a frame state.
    pub fn add_frame_state(&mut self, state: FrameState) -> FrameStateId {
        let id = FrameStateId(self.frame_states.len() as u32);
        self.frame_states.push(state);
        id
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> &Block<I> {
        &self.blocks[id.index()]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block<I> {
        &mut self.blocks[id.index()]
    }
}
