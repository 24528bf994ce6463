//! MIPS64 LIR instruction emitters.
//!
//! The register allocator hands these down with concrete registers and
//! stack slots; each instruction knows how to encode itself into the
//! emission context's assembler. Branch-shaped instructions own their
//! delay-slot state and elide themselves when their target is the next
//! block in emission order.

use super::assembler::Label;
use super::barrier::{self, BarrieredCas, BarrieredStore, BarrieredSwap};
use super::registers::{Gpr, CALL_TARGET, SCRATCH0};
use crate::emit::context::EmissionContext;
use crate::emit::delay::DelaySlotHolder;
use crate::emit::patch::{DataConstant, MarkId};
use crate::error::{JitError, JitResult};
use crate::lir::{
    BlockId, FrameStateId, InstEmit, Operand, OperandRole, SizeEstimate, SlotId,
};
use crate::options::StubId;
use std::fmt;

/// Conservative reach of a 16-bit branch displacement, with margin for
/// code that may still move between passes.
const BRANCH16_REACH: u32 = 0x1f000;

/// Convert a validated frame offset to the load/store immediate.
fn frame_disp(off: i32) -> JitResult<i16> {
    i16::try_from(off)
        .map_err(|_| JitError::invariant(format!("frame offset {off} escaped validation")))
}

// =============================================================================
// Conditions
// =============================================================================

/// Branch condition over two registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchCond {
    Eq,
    Ne,
    /// Signed less-than, expanded through SLT.
    Lt,
    /// Signed greater-or-equal, expanded through SLT.
    Ge,
}

impl BranchCond {
    /// The condition selecting the opposite arm.
    pub const fn invert(self) -> Self {
        match self {
            BranchCond::Eq => BranchCond::Ne,
            BranchCond::Ne => BranchCond::Eq,
            BranchCond::Lt => BranchCond::Ge,
            BranchCond::Ge => BranchCond::Lt,
        }
    }

    const fn mnemonic(self) -> &'static str {
        match self {
            BranchCond::Eq => "beq",
            BranchCond::Ne => "bne",
            BranchCond::Lt => "blt",
            BranchCond::Ge => "bge",
        }
    }
}

/// ALU operation for three-register instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Slt,
    Sltu,
}

impl AluOp {
    const fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "daddu",
            AluOp::Sub => "dsubu",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Slt => "slt",
            AluOp::Sltu => "sltu",
        }
    }
}

/// Target of a call instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// A runtime stub, called through a patchable absolute address.
    Stub(StubId),
    /// Computed target already in a register.
    Reg(Gpr),
}

// =============================================================================
// The instruction family
// =============================================================================

/// One register-allocated MIPS64 LIR instruction.
#[derive(Debug, Clone)]
pub enum Mips64Inst {
    /// Frame setup; first instruction of the entry block.
    Prologue,
    /// Register copy.
    Move { dst: Gpr, src: Gpr },
    /// Inline 32-bit immediate.
    LoadImm { dst: Gpr, value: i32 },
    /// 64-bit constant loaded through the data section.
    LoadConst { dst: Gpr, value: u64 },
    /// Three-register ALU operation.
    Alu { op: AluOp, dst: Gpr, lhs: Gpr, rhs: Gpr },
    /// Reload from a spill slot.
    LoadStack { dst: Gpr, slot: SlotId },
    /// Spill to a stack slot.
    StoreStack { src: Gpr, slot: SlotId },
    /// Unconditional branch to a block.
    Jump { target: BlockId, delay: DelaySlotHolder },
    /// Two-way conditional branch; falls through to the next block.
    CondBranch {
        cond: BranchCond,
        lhs: Gpr,
        rhs: Gpr,
        target: BlockId,
        delay: DelaySlotHolder,
    },
    /// Call with optional frame state and exception edge.
    Call {
        target: CallTarget,
        state: Option<FrameStateId>,
        exception: Option<BlockId>,
    },
    /// Epilogue and return.
    Return { delay: DelaySlotHolder },
    /// Reference load through the read barrier.
    BarrieredLoad {
        dst: Gpr,
        base: Gpr,
        offset: i16,
        state: Option<FrameStateId>,
    },
    /// Reference store through the write barrier.
    BarrieredStore(BarrieredStore),
    /// Compare-and-swap through the barrier.
    BarrieredCas(BarrieredCas),
    /// Atomic exchange through the barrier.
    BarrieredSwap(BarrieredSwap),
    /// Explicit no-op.
    Nop,
    /// Unreachable trap.
    Trap,
}

impl Mips64Inst {
    /// Emit the condition-production prelude for SLT-expanded branches.
    fn emit_branch_compare(&self, ctx: &mut EmissionContext, cond: BranchCond, lhs: Gpr, rhs: Gpr) {
        if matches!(cond, BranchCond::Lt | BranchCond::Ge) {
            ctx.asm.slt(SCRATCH0, lhs, rhs);
        }
    }

    /// Emit the single branch opcode for `cond` toward `label`.
    fn branch_opcode(
        ctx: &mut EmissionContext,
        cond: BranchCond,
        lhs: Gpr,
        rhs: Gpr,
        label: Label,
    ) {
        match cond {
            BranchCond::Eq => ctx.asm.beq(lhs, rhs, label),
            BranchCond::Ne => ctx.asm.bne(lhs, rhs, label),
            // SLT result was produced into the scratch just before.
            BranchCond::Lt => ctx.asm.bne(SCRATCH0, Gpr::Zero, label),
            BranchCond::Ge => ctx.asm.beq(SCRATCH0, Gpr::Zero, label),
        }
    }

    fn emit_cond_branch(
        &self,
        ctx: &mut EmissionContext,
        cond: BranchCond,
        lhs: Gpr,
        rhs: Gpr,
        target: BlockId,
        delay: &DelaySlotHolder,
    ) -> JitResult<()> {
        let label = ctx.block_label(target);
        if ctx.is_successor_edge(label) {
            // Taken and fallthrough arms coincide: the whole branch is a
            // no-op, including its condition materialization.
            delay.emit_control_transfer(ctx, Some(label), |_| {})?;
            return delay.finish(ctx);
        }

        self.emit_branch_compare(ctx, cond, lhs, rhs);

        let in_range = ctx
            .current_inst()
            .map(|inst| ctx.label_within_range(inst, label, BRANCH16_REACH))
            .unwrap_or(false);
        if in_range {
            delay.emit_control_transfer(ctx, Some(label), |ctx| {
                Self::branch_opcode(ctx, cond, lhs, rhs, label)
            })?;
            delay.finish(ctx)
        } else {
            // Long form: hop over an absolute jump. The inverted branch
            // reads the scratch before the materialization clobbers it.
            let skip = ctx.asm.create_label();
            Self::branch_opcode(ctx, cond.invert(), lhs, rhs, skip);
            ctx.asm.nop();
            let seq = ctx.asm.mov_imm64_fixed(SCRATCH0, 0);
            ctx.record_code_ref(seq, label);
            delay.emit_control_transfer(ctx, None, |ctx| ctx.asm.jr(SCRATCH0))?;
            delay.finish(ctx)?;
            ctx.asm.bind_label(skip);
            Ok(())
        }
    }

    fn emit_jump(
        &self,
        ctx: &mut EmissionContext,
        target: BlockId,
        delay: &DelaySlotHolder,
    ) -> JitResult<()> {
        let label = ctx.block_label(target);
        if ctx.is_successor_edge(label) {
            delay.emit_control_transfer(ctx, Some(label), |_| {})?;
            return delay.finish(ctx);
        }
        let in_range = ctx
            .current_inst()
            .map(|inst| ctx.label_within_range(inst, label, BRANCH16_REACH))
            .unwrap_or(false);
        if in_range {
            delay.emit_control_transfer(ctx, Some(label), |ctx| ctx.asm.b(label))?;
            delay.finish(ctx)
        } else {
            let seq = ctx.asm.mov_imm64_fixed(SCRATCH0, 0);
            ctx.record_code_ref(seq, label);
            delay.emit_control_transfer(ctx, None, |ctx| ctx.asm.jr(SCRATCH0))?;
            delay.finish(ctx)
        }
    }

    fn emit_call(
        &self,
        ctx: &mut EmissionContext,
        target: CallTarget,
        state: Option<FrameStateId>,
        exception: Option<BlockId>,
    ) -> JitResult<()> {
        let handler = exception.map(|b| ctx.block_label(b));
        match target {
            CallTarget::Stub(stub) => {
                let addr = ctx.stubs.address(stub);
                ctx.asm.mov_imm64_fixed(CALL_TARGET, addr);
                let call_off = ctx.position();
                ctx.asm.jalr(Gpr::Ra, CALL_TARGET);
                ctx.asm.nop();
                ctx.record_direct_call(call_off, stub, state, handler);
            }
            CallTarget::Reg(reg) => {
                let call_off = ctx.position();
                ctx.asm.jalr(Gpr::Ra, reg);
                ctx.asm.nop();
                ctx.record_indirect_call(call_off, state, handler);
            }
        }
        Ok(())
    }

    fn emit_return(&self, ctx: &mut EmissionContext, delay: &DelaySlotHolder) -> JitResult<()> {
        let frame = ctx.frame()?;
        let ra_off = frame_disp(frame.ra_offset)?;
        let fp_off = frame_disp(frame.fp_offset)?;
        let adjust = frame.stack_adjust()?;

        ctx.mark(MarkId::EpilogueStart);
        ctx.asm.ld(Gpr::Ra, Gpr::Sp, ra_off);
        ctx.asm.ld(Gpr::Fp, Gpr::Sp, fp_off);
        delay.emit_control_transfer(ctx, None, |ctx| ctx.asm.jr(Gpr::Ra))?;
        // Tail-delayed: the stack adjustment rides in the delay slot.
        ctx.asm.daddiu(Gpr::Sp, Gpr::Sp, adjust);
        delay.finish(ctx)
    }
}

impl InstEmit for Mips64Inst {
    fn emit(&self, ctx: &mut EmissionContext) -> JitResult<()> {
        match self {
            Mips64Inst::Prologue => {
                let frame = ctx.frame()?;
                let adjust = frame.stack_adjust()?;
                let ra_off = frame_disp(frame.ra_offset)?;
                let fp_off = frame_disp(frame.fp_offset)?;
                ctx.asm.daddiu(Gpr::Sp, Gpr::Sp, -adjust);
                ctx.asm.sd(Gpr::Ra, Gpr::Sp, ra_off);
                ctx.asm.sd(Gpr::Fp, Gpr::Sp, fp_off);
                ctx.asm.mov(Gpr::Fp, Gpr::Sp);
                ctx.mark(MarkId::PrologueEnd);
                Ok(())
            }
            Mips64Inst::Move { dst, src } => {
                ctx.asm.mov(*dst, *src);
                Ok(())
            }
            Mips64Inst::LoadImm { dst, value } => {
                let v = *value;
                if let Ok(imm) = i16::try_from(v) {
                    ctx.asm.daddiu(*dst, Gpr::Zero, imm);
                } else {
                    ctx.asm.lui(*dst, (v >> 16) as u16);
                    if v as u16 != 0 {
                        ctx.asm.ori(*dst, *dst, v as u16);
                    }
                }
                Ok(())
            }
            Mips64Inst::LoadConst { dst, value } => {
                let id = ctx.intern_data(DataConstant::U64(*value), 8)?;
                let seq = ctx.asm.mov_imm64_fixed(SCRATCH0, 0);
                ctx.record_data_ref(seq, id);
                ctx.asm.ld(*dst, SCRATCH0, 0);
                Ok(())
            }
            Mips64Inst::Alu { op, dst, lhs, rhs } => {
                match op {
                    AluOp::Add => ctx.asm.daddu(*dst, *lhs, *rhs),
                    AluOp::Sub => ctx.asm.dsubu(*dst, *lhs, *rhs),
                    AluOp::And => ctx.asm.and_(*dst, *lhs, *rhs),
                    AluOp::Or => ctx.asm.or_(*dst, *lhs, *rhs),
                    AluOp::Xor => ctx.asm.xor_(*dst, *lhs, *rhs),
                    AluOp::Slt => ctx.asm.slt(*dst, *lhs, *rhs),
                    AluOp::Sltu => ctx.asm.sltu(*dst, *lhs, *rhs),
                }
                Ok(())
            }
            Mips64Inst::LoadStack { dst, slot } => {
                let off = ctx.frame()?.slot_offset(*slot)?;
                ctx.asm.ld(*dst, Gpr::Sp, off);
                Ok(())
            }
            Mips64Inst::StoreStack { src, slot } => {
                let off = ctx.frame()?.slot_offset(*slot)?;
                ctx.asm.sd(*src, Gpr::Sp, off);
                Ok(())
            }
            Mips64Inst::Jump { target, delay } => self.emit_jump(ctx, *target, delay),
            Mips64Inst::CondBranch { cond, lhs, rhs, target, delay } => {
                self.emit_cond_branch(ctx, *cond, *lhs, *rhs, *target, delay)
            }
            Mips64Inst::Call { target, state, exception } => {
                self.emit_call(ctx, *target, *state, *exception)
            }
            Mips64Inst::Return { delay } => self.emit_return(ctx, delay),
            Mips64Inst::BarrieredLoad { dst, base, offset, state } => {
                barrier::emit_read_barrier(ctx, *dst, *base, *offset, *state)
            }
            Mips64Inst::BarrieredStore(op) => barrier::emit_barriered_store(ctx, op),
            Mips64Inst::BarrieredCas(op) => barrier::emit_barriered_cas(ctx, op),
            Mips64Inst::BarrieredSwap(op) => barrier::emit_barriered_swap(ctx, op),
            Mips64Inst::Nop => {
                ctx.asm.nop();
                Ok(())
            }
            Mips64Inst::Trap => {
                ctx.asm.break_(0);
                Ok(())
            }
        }
    }

    fn size_estimate(&self) -> SizeEstimate {
        match self {
            Mips64Inst::Prologue => SizeEstimate::new(16, 0),
            Mips64Inst::Move { .. } | Mips64Inst::Nop | Mips64Inst::Trap => SizeEstimate::new(4, 0),
            Mips64Inst::LoadImm { .. } => SizeEstimate::new(8, 0),
            Mips64Inst::LoadConst { .. } => SizeEstimate::new(28, 16),
            Mips64Inst::Alu { .. } => SizeEstimate::new(4, 0),
            Mips64Inst::LoadStack { .. } | Mips64Inst::StoreStack { .. } => SizeEstimate::new(4, 0),
            Mips64Inst::Jump { .. } => SizeEstimate::new(36, 0),
            Mips64Inst::CondBranch { .. } => SizeEstimate::new(44, 0),
            Mips64Inst::Call { .. } => SizeEstimate::new(32, 0),
            Mips64Inst::Return { .. } => SizeEstimate::new(16, 0),
            Mips64Inst::BarrieredLoad { .. } => SizeEstimate::new(72, 0),
            Mips64Inst::BarrieredStore(_) => SizeEstimate::new(128, 0),
            Mips64Inst::BarrieredCas(_) | Mips64Inst::BarrieredSwap(_) => SizeEstimate::new(96, 0),
        }
    }

    fn for_each_operand(&self, f: &mut dyn FnMut(OperandRole, Operand)) {
        use OperandRole::{Alive, Def, State, Temp, Use};
        let reg = Operand::Reg;
        match self {
            Mips64Inst::Move { dst, src } => {
                f(Def, reg(*dst));
                f(Use, reg(*src));
            }
            Mips64Inst::LoadImm { dst, value } => {
                f(Def, reg(*dst));
                f(Use, Operand::Imm(*value as i64));
            }
            Mips64Inst::LoadConst { dst, value } => {
                f(Def, reg(*dst));
                f(Use, Operand::Imm(*value as i64));
            }
            Mips64Inst::Alu { dst, lhs, rhs, .. } => {
                f(Def, reg(*dst));
                f(Use, reg(*lhs));
                f(Use, reg(*rhs));
            }
            Mips64Inst::LoadStack { dst, slot } => {
                f(Def, reg(*dst));
                f(Use, Operand::Slot(*slot));
            }
            Mips64Inst::StoreStack { src, slot } => {
                f(Use, reg(*src));
                f(Def, Operand::Slot(*slot));
            }
            Mips64Inst::Jump { target, .. } => f(Use, Operand::Block(*target)),
            Mips64Inst::CondBranch { lhs, rhs, target, .. } => {
                f(Use, reg(*lhs));
                f(Use, reg(*rhs));
                f(Use, Operand::Block(*target));
            }
            Mips64Inst::Call { target, state, exception } => {
                if let CallTarget::Reg(r) = target {
                    f(Use, reg(*r));
                }
                if let Some(s) = state {
                    f(State, Operand::State(*s));
                }
                if let Some(b) = exception {
                    f(Use, Operand::Block(*b));
                }
            }
            Mips64Inst::Prologue | Mips64Inst::Return { .. } => {}
            Mips64Inst::BarrieredLoad { dst, base, state, .. } => {
                f(Def, reg(*dst));
                f(Use, reg(*base));
                if let Some(s) = state {
                    f(State, Operand::State(*s));
                }
            }
            Mips64Inst::BarrieredStore(op) => {
                f(Use, reg(op.src));
                f(Use, reg(op.base));
                f(Temp, reg(op.tmp1));
                f(Temp, reg(op.tmp2));
                if let Some(s) = op.state {
                    f(State, Operand::State(s));
                }
            }
            Mips64Inst::BarrieredCas(op) => {
                f(Def, reg(op.dst));
                f(Use, reg(op.expected));
                // The barrier loop re-reads new_value on every retry.
                f(Alive, reg(op.new_value));
                f(Use, reg(op.base));
                f(Temp, reg(op.tmp1));
                f(Temp, reg(op.tmp2));
                if let Some(s) = op.state {
                    f(State, Operand::State(s));
                }
            }
            Mips64Inst::BarrieredSwap(op) => {
                f(Def, reg(op.dst));
                f(Alive, reg(op.new_value));
                f(Use, reg(op.base));
                f(Temp, reg(op.tmp1));
                f(Temp, reg(op.tmp2));
                if let Some(s) = op.state {
                    f(State, Operand::State(s));
                }
            }
            Mips64Inst::Nop | Mips64Inst::Trap => {}
        }
    }

    fn reset_emit_state(&self) {
        match self {
            Mips64Inst::Jump { delay, .. }
            | Mips64Inst::CondBranch { delay, .. }
            | Mips64Inst::Return { delay } => delay.reset(),
            _ => {}
        }
    }

    fn falls_through(&self) -> bool {
        !matches!(
            self,
            Mips64Inst::Jump { .. } | Mips64Inst::Return { .. } | Mips64Inst::Trap
        )
    }
}

impl fmt::Display for Mips64Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mips64Inst::Prologue => write!(f, "prologue"),
            Mips64Inst::Move { dst, src } => write!(f, "move {dst}, {src}"),
            Mips64Inst::LoadImm { dst, value } => write!(f, "li {dst}, {value}"),
            Mips64Inst::LoadConst { dst, value } => write!(f, "ldc {dst}, {value:#x}"),
            Mips64Inst::Alu { op, dst, lhs, rhs } => {
                write!(f, "{} {dst}, {lhs}, {rhs}", op.mnemonic())
            }
            Mips64Inst::LoadStack { dst, slot } => write!(f, "ld {dst}, slot{}", slot.0),
            Mips64Inst::StoreStack { src, slot } => write!(f, "sd {src}, slot{}", slot.0),
            Mips64Inst::Jump { target, .. } => write!(f, "b {target}"),
            Mips64Inst::CondBranch { cond, lhs, rhs, target, .. } => {
                write!(f, "{} {lhs}, {rhs}, {target}", cond.mnemonic())
            }
            Mips64Inst::Call { target: CallTarget::Stub(stub), .. } => {
                write!(f, "call {stub:?}")
            }
            Mips64Inst::Call { target: CallTarget::Reg(reg), .. } => write!(f, "call [{reg}]"),
            Mips64Inst::Return { .. } => write!(f, "ret"),
            Mips64Inst::BarrieredLoad { dst, base, offset, .. } => {
                write!(f, "ld.ref {dst}, {offset}({base})")
            }
            Mips64Inst::BarrieredStore(op) => {
                write!(f, "sd.ref {}, {}({}) [{:?}]", op.src, op.offset, op.base, op.kind)
            }
            Mips64Inst::BarrieredCas(op) => {
                write!(f, "cas.ref {}, {}({}) exp={}", op.dst, op.offset, op.base, op.expected)
            }
            Mips64Inst::BarrieredSwap(op) => {
                write!(f, "swap.ref {}, {}({})", op.dst, op.offset, op.base)
            }
            Mips64Inst::Nop => write!(f, "nop"),
            Mips64Inst::Trap => write!(f, "trap"),
        }
    }
}
