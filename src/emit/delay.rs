//! Branch delay slot coordination.
//!
//! MIPS executes the instruction physically following a branch before the
//! branch takes effect. Every branch-shaped LIR instruction owns a
//! [`DelaySlotHolder`] tracking where its slot opened, so that exactly one
//! instruction lands there: never zero (a NOP is filled in), never more
//! than one (an invariant failure). Elided branches (target is the next
//! block in emission order) have no slot at all.
//!
//! Ordering contract: condition-producing instructions, then the branch
//! opcode, then exactly one filler instruction, then the taken or
//! fallthrough path.
//!
//! The holder is per-instruction state with interior mutability because a
//! compilation may run the emission pass twice; [`DelaySlotHolder::reset`]
//! restores the initial state between passes.

use crate::backend::mips64::assembler::Label;
use crate::emit::context::EmissionContext;
use crate::error::{JitError, JitResult};
use std::cell::Cell;

/// Word size of one instruction — the size of a delay slot.
const SLOT_BYTES: u32 = 4;

/// Emission state of one delayed branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayState {
    /// Nothing emitted yet.
    NotEmitted,
    /// The branch was a no-op fallthrough; no opcode, no slot.
    Elided,
    /// Branch opcode emitted; the value is the slot's byte position.
    ControlTransferEmitted(u32),
    /// Slot verified/filled; the branch is complete.
    Done,
}

/// Per-branch delay-slot state machine.
#[derive(Debug, Clone)]
pub struct DelaySlotHolder {
    state: Cell<DelayState>,
}

impl Default for DelaySlotHolder {
    fn default() -> Self {
        DelaySlotHolder { state: Cell::new(DelayState::NotEmitted) }
    }
}

impl DelaySlotHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, for assertions and tests.
    pub fn state(&self) -> DelayState {
        self.state.get()
    }

    /// True once the transfer was skipped as a fallthrough.
    pub fn is_elided(&self) -> bool {
        matches!(self.state.get(), DelayState::Elided)
    }

    /// Restore the initial state; required before a repeated emission
    /// pass.
    pub fn reset(&self) {
        self.state.set(DelayState::NotEmitted);
    }

    /// Emit the control transfer.
    ///
    /// With a `target` whose block is the lexical successor the branch is
    /// elided and nothing is emitted. Otherwise `branch` must emit exactly
    /// the branch opcode; the position immediately after it is recorded as
    /// the delay slot. Pass `target: None` for transfers that are never
    /// elided (returns, indirect jumps).
    pub fn emit_control_transfer(
        &self,
        ctx: &mut EmissionContext,
        target: Option<Label>,
        branch: impl FnOnce(&mut EmissionContext),
    ) -> JitResult<()> {
        if self.state.get() != DelayState::NotEmitted {
            return Err(JitError::invariant(format!(
                "control transfer emitted twice (state {:?})",
                self.state.get()
            )));
        }
        if let Some(label) = target {
            if ctx.is_successor_edge(label) {
                self.state.set(DelayState::Elided);
                return Ok(());
            }
        }
        let before = ctx.position();
        branch(ctx);
        let after = ctx.position();
        if after != before + SLOT_BYTES {
            return Err(JitError::invariant(format!(
                "branch opcode must be one instruction, got {} bytes",
                after - before
            )));
        }
        self.state.set(DelayState::ControlTransferEmitted(after));
        Ok(())
    }

    /// Close the slot after the instruction produced its trailing code.
    ///
    /// Verifies that exactly one instruction occupies the slot. When the
    /// emitter produced nothing after the branch, a NOP is filled in;
    /// tail-delayed instructions that emitted their own side-effect-free
    /// trailing instruction are accepted by the byte-count delta alone.
    pub fn finish(&self, ctx: &mut EmissionContext) -> JitResult<()> {
        match self.state.get() {
            DelayState::Elided => {
                self.state.set(DelayState::Done);
                Ok(())
            }
            DelayState::ControlTransferEmitted(slot) => {
                let filled = ctx.position() - slot;
                match filled {
                    0 => ctx.asm.nop(),
                    SLOT_BYTES => {}
                    _ => {
                        return Err(JitError::invariant(format!(
                            "delay slot at {:#x} holds {} bytes, expected exactly one instruction",
                            slot, filled
                        )))
                    }
                }
                self.state.set(DelayState::Done);
                Ok(())
            }
            state => Err(JitError::invariant(format!(
                "delay slot finished in state {:?}",
                state
            ))),
        }
    }
}
