//! MIPS64 code sequences for colored-pointer GC barriers.
//!
//! Compiled code works on decolored pointers: loads strip the color bits
//! with an arithmetic shift, stores publish the value re-colored with the
//! current store-good bits. Fast paths compare against patchable 16-bit
//! mask immediates the collector rewrites on phase changes; mismatches
//! branch to out-of-line medium/slow paths registered as deferred
//! generators and emitted after the last block.
//!
//! Register contract: the reserved scratches carry the barrier arguments —
//! `SCRATCH0` holds the field address, `SCRATCH1` the previous/current
//! colored value. Barrier stubs preserve every other register and clobber
//! only the scratches and `ra` (which the prologue has saved).

use super::assembler::Label;
use super::registers::{
    Gpr, CALL_TARGET, SCRATCH0, SCRATCH1, STORE_BUFFER_ENTRY_BYTES, THREAD,
    THREAD_STORE_BUFFER_BASE_OFFSET, THREAD_STORE_BUFFER_CURSOR_OFFSET,
};
use crate::emit::barrier::{BarrierDescriptor, StoreKind};
use crate::emit::context::EmissionContext;
use crate::emit::patch::BarrierImmKind;
use crate::error::{JitError, JitResult};
use crate::lir::FrameStateId;
use crate::options::{MediumPathKind, StubId};

/// Reject operands that alias the backend's reserved registers.
fn check_not_reserved(regs: &[Gpr]) -> JitResult<()> {
    for &r in regs {
        if r == SCRATCH0 || r == SCRATCH1 || r == CALL_TARGET || r == THREAD
            || r == Gpr::K0 || r == Gpr::K1
        {
            return Err(JitError::invariant(format!(
                "operand uses reserved register {r}"
            )));
        }
    }
    Ok(())
}

/// Call a runtime stub: fixed-shape address materialization, `jalr`, NOP
/// delay slot, and a call-site record at the `jalr`.
pub(crate) fn emit_stub_call(
    ctx: &mut EmissionContext,
    stub: StubId,
    state: Option<FrameStateId>,
) -> JitResult<()> {
    let addr = ctx.stubs.address(stub);
    ctx.asm.mov_imm64_fixed(CALL_TARGET, addr);
    let call_off = ctx.position();
    ctx.asm.jalr(Gpr::Ra, CALL_TARGET);
    ctx.asm.nop();
    ctx.record_direct_call(call_off, stub, state, None);
    Ok(())
}

// =============================================================================
// Read barrier
// =============================================================================

/// Load a reference field through the read barrier.
///
/// Fast path (the common case, four instructions):
/// ```text
/// ld    dst, offset(base)        ; colored pointer
/// andi  AT, dst, <load-bad>      ; patchable phase mask
/// bne   AT, zero, slow
/// dsra  dst, dst, #shift         ; delay slot: decolor (harmless if taken)
/// cont:
/// ```
/// The slow path heals the field through the runtime, reloads the now
/// good-colored pointer, decolors it and jumps back to `cont`.
pub fn emit_read_barrier(
    ctx: &mut EmissionContext,
    dst: Gpr,
    base: Gpr,
    offset: i16,
    state: Option<FrameStateId>,
) -> JitResult<()> {
    check_not_reserved(&[dst, base])?;
    if dst == base {
        return Err(JitError::invariant(
            "read barrier requires dst distinct from base",
        ));
    }
    let colors = ctx.options.colors;
    let slow = ctx.asm.create_label();
    let cont = ctx.asm.create_label();

    if let Some(s) = state {
        ctx.record_implicit_exception(ctx.position(), s);
    }
    ctx.asm.ld(dst, base, offset);
    let mask_at = ctx.position();
    ctx.asm.andi(SCRATCH0, dst, colors.load_bad_mask);
    ctx.record_barrier_imm(mask_at, BarrierImmKind::LoadBadMask);
    ctx.asm.bne(SCRATCH0, Gpr::Zero, slow);
    ctx.asm.dsra(dst, dst, colors.decolor_shift);
    ctx.asm.bind_label(cont);

    let shift = colors.decolor_shift;
    ctx.defer(slow, "read barrier slow path", move |ctx| {
        ctx.asm.daddiu(SCRATCH0, base, offset); // field address
        ctx.asm.mov(SCRATCH1, base); // holder
        emit_stub_call(ctx, StubId::LoadBarrierSlow, state)?;
        ctx.asm.ld(dst, base, offset); // reload the healed pointer
        ctx.asm.b(cont);
        ctx.asm.dsra(dst, dst, shift); // delay slot
        Ok(())
    });
    Ok(())
}

// =============================================================================
// Write barrier
// =============================================================================

/// A barrier-protected reference store, with the allocator-provided
/// temporaries the out-of-line paths use.
#[derive(Debug, Clone, Copy)]
pub struct BarrieredStore {
    pub src: Gpr,
    pub base: Gpr,
    pub offset: i16,
    pub kind: StoreKind,
    pub tmp1: Gpr,
    pub tmp2: Gpr,
    pub state: Option<FrameStateId>,
}

/// Emit the store-barrier check followed by the store itself.
///
/// Fast path:
/// ```text
/// lhu/ld T8, offset(base)        ; previous value (16 bits suffice for
///                                ; atomic accesses)
/// andi   AT, T8, <store-bad>     ; patchable phase mask
/// bne    AT, zero, medium
/// daddiu AT, base, #offset       ; delay slot: field address
/// cont:
/// dsll   tmp1, src, #shift       ; publish store-good colored pointer
/// ori    tmp1, tmp1, <good>      ; patchable color bits
/// sd     tmp1, offset(base)
/// ```
/// Atomic stores bracket the publish with SYNC. The medium path follows
/// the externally supplied policy for the store kind.
pub fn emit_barriered_store(ctx: &mut EmissionContext, op: &BarrieredStore) -> JitResult<()> {
    check_not_reserved(&[op.src, op.base, op.tmp1, op.tmp2])?;
    if op.tmp1 == op.base || op.tmp1 == op.tmp2 {
        return Err(JitError::invariant(
            "barriered store temporaries must be distinct from base and each other",
        ));
    }
    let colors = ctx.options.colors;
    let medium = op.kind.medium_path(&ctx.options);
    let out_of_line = ctx.asm.create_label();
    let cont = ctx.asm.create_label();
    let atomic = op.kind == StoreKind::Atomic;

    if let Some(s) = op.state {
        ctx.record_implicit_exception(ctx.position(), s);
    }
    if atomic {
        ctx.asm.lhu(SCRATCH1, op.base, op.offset);
    } else {
        ctx.asm.ld(SCRATCH1, op.base, op.offset);
    }
    let mask_at = ctx.position();
    ctx.asm.andi(SCRATCH0, SCRATCH1, colors.store_bad_mask);
    ctx.record_barrier_imm(mask_at, BarrierImmKind::StoreBadMask);
    ctx.asm.bne(SCRATCH0, Gpr::Zero, out_of_line);
    ctx.asm.daddiu(SCRATCH0, op.base, op.offset);
    ctx.asm.bind_label(cont);

    // The store itself: publish with the current store-good color.
    if atomic {
        ctx.asm.sync();
    }
    ctx.asm.dsll(op.tmp1, op.src, colors.decolor_shift);
    let good_at = ctx.position();
    ctx.asm.ori(op.tmp1, op.tmp1, colors.store_good_color);
    ctx.record_barrier_imm(good_at, BarrierImmKind::StoreGoodColor);
    ctx.asm.sd(op.tmp1, op.base, op.offset);
    if atomic {
        ctx.asm.sync();
    }

    let desc = BarrierDescriptor {
        kind: op.kind,
        compare: BarrierImmKind::StoreBadMask,
        medium,
        out_of_line,
        cont,
    };
    defer_store_paths(ctx, desc, op.tmp1, op.tmp2, op.state);
    Ok(())
}

/// Register the deferred medium/slow paths for one barriered store.
fn defer_store_paths(
    ctx: &mut EmissionContext,
    desc: BarrierDescriptor,
    tmp1: Gpr,
    tmp2: Gpr,
    state: Option<FrameStateId>,
) {
    match desc.medium {
        MediumPathKind::SlowOnly => {
            ctx.defer(desc.out_of_line, "store barrier slow path", move |ctx| {
                emit_store_slow_tail(ctx, desc.cont, state)
            });
        }
        MediumPathKind::StoreBuffer => {
            let slow = ctx.asm.create_label();
            ctx.defer(desc.out_of_line, "store barrier buffered path", move |ctx| {
                emit_store_buffer_path(ctx, desc.cont, slow, tmp1, tmp2)
            });
            ctx.defer(slow, "store barrier slow path", move |ctx| {
                emit_store_slow_tail(ctx, desc.cont, state)
            });
        }
        MediumPathKind::SelfHeal => {
            let slow = ctx.asm.create_label();
            let colors = ctx.options.colors;
            ctx.defer(desc.out_of_line, "store barrier self-heal path", move |ctx| {
                // SCRATCH1 holds the previous raw value. Anything but the
                // benign young raw null goes to the runtime.
                let retry = ctx.asm.create_label();
                let young_at = ctx.position();
                ctx.asm.xori(tmp1, SCRATCH1, colors.young_null);
                ctx.record_barrier_imm(young_at, BarrierImmKind::YoungNull);
                ctx.asm.bne(tmp1, Gpr::Zero, slow);
                ctx.asm.nop();
                // Publish a store-good null in place of the young null.
                // Interference of any kind falls to the slow path, which
                // bounds the retry.
                ctx.asm.bind_label(retry);
                ctx.asm.lld(tmp1, SCRATCH0, 0);
                ctx.asm.bne(tmp1, SCRATCH1, slow);
                let good_at = ctx.position();
                ctx.asm.ori(tmp2, Gpr::Zero, colors.store_good_color); // delay slot
                ctx.record_barrier_imm(good_at, BarrierImmKind::StoreGoodColor);
                ctx.asm.scd(tmp2, SCRATCH0, 0);
                ctx.asm.beq(tmp2, Gpr::Zero, retry);
                ctx.asm.nop();
                ctx.asm.b(desc.cont);
                ctx.asm.nop();
                Ok(())
            });
            ctx.defer(slow, "store barrier slow path", move |ctx| {
                emit_store_slow_tail(ctx, desc.cont, state)
            });
        }
    }
}

/// The buffered medium path: log (field address, previous value) into the
/// thread-local store buffer, slow path when the cursor reaches zero.
fn emit_store_buffer_path(
    ctx: &mut EmissionContext,
    cont: Label,
    slow: Label,
    tmp1: Gpr,
    tmp2: Gpr,
) -> JitResult<()> {
    ctx.asm.ld(tmp1, THREAD, THREAD_STORE_BUFFER_CURSOR_OFFSET);
    ctx.asm.beq(tmp1, Gpr::Zero, slow);
    // Delay slot: decrement the register image; the memory cursor is only
    // written on the buffered path.
    ctx.asm.daddiu(tmp1, tmp1, -(STORE_BUFFER_ENTRY_BYTES as i16));
    ctx.asm.sd(tmp1, THREAD, THREAD_STORE_BUFFER_CURSOR_OFFSET);
    ctx.asm.ld(tmp2, THREAD, THREAD_STORE_BUFFER_BASE_OFFSET);
    ctx.asm.daddu(tmp2, tmp2, tmp1);
    ctx.asm.sd(SCRATCH0, tmp2, 0); // field address
    ctx.asm.sd(SCRATCH1, tmp2, 8); // previous value
    ctx.asm.b(cont);
    ctx.asm.nop();
    Ok(())
}

/// Slow-path tail shared by every store flavor: runtime call with the
/// field address and previous value in the scratches, then back inline.
fn emit_store_slow_tail(
    ctx: &mut EmissionContext,
    cont: Label,
    state: Option<FrameStateId>,
) -> JitResult<()> {
    emit_stub_call(ctx, StubId::StoreBarrierSlow, state)?;
    ctx.asm.b(cont);
    ctx.asm.nop();
    Ok(())
}

// =============================================================================
// Atomic read-modify-write accesses
// =============================================================================

/// A barrier-protected compare-and-swap. `dst` receives the decolored
/// previous value; the access succeeded iff `dst == expected` afterwards.
#[derive(Debug, Clone, Copy)]
pub struct BarrieredCas {
    pub dst: Gpr,
    pub expected: Gpr,
    pub new_value: Gpr,
    pub base: Gpr,
    pub offset: i16,
    pub tmp1: Gpr,
    pub tmp2: Gpr,
    pub state: Option<FrameStateId>,
}

/// Emit a CAS with the read barrier folded into its LL/SC loop.
///
/// A bad-colored current value goes out of line: the runtime heals the
/// field and the whole loop re-runs against the good-colored field.
pub fn emit_barriered_cas(ctx: &mut EmissionContext, op: &BarrieredCas) -> JitResult<()> {
    check_not_reserved(&[op.dst, op.expected, op.new_value, op.base, op.tmp1, op.tmp2])?;
    if op.dst == op.expected || op.dst == op.new_value || op.dst == op.base {
        return Err(JitError::invariant(
            "cas requires dst distinct from expected, new_value and base",
        ));
    }
    if op.tmp1 == op.tmp2 {
        return Err(JitError::invariant("cas temporaries must be distinct"));
    }
    let colors = ctx.options.colors;
    let slow = ctx.asm.create_label();
    let cont = ctx.asm.create_label();
    let retry = ctx.asm.create_label();

    ctx.asm.daddiu(SCRATCH0, op.base, op.offset);
    ctx.asm.bind_label(retry);
    if let Some(s) = op.state {
        ctx.record_implicit_exception(ctx.position(), s);
    }
    ctx.asm.lld(SCRATCH1, SCRATCH0, 0);
    let mask_at = ctx.position();
    ctx.asm.andi(op.tmp1, SCRATCH1, colors.load_bad_mask);
    ctx.record_barrier_imm(mask_at, BarrierImmKind::LoadBadMask);
    ctx.asm.bne(op.tmp1, Gpr::Zero, slow);
    ctx.asm.dsra(op.tmp2, SCRATCH1, colors.decolor_shift); // delay: decolored current
    ctx.asm.bne(op.tmp2, op.expected, cont);
    ctx.asm.mov(op.dst, op.tmp2); // delay: previous value, both exits
    ctx.asm.dsll(op.tmp1, op.new_value, colors.decolor_shift);
    let good_at = ctx.position();
    ctx.asm.ori(op.tmp1, op.tmp1, colors.store_good_color);
    ctx.record_barrier_imm(good_at, BarrierImmKind::StoreGoodColor);
    ctx.asm.scd(op.tmp1, SCRATCH0, 0);
    ctx.asm.beq(op.tmp1, Gpr::Zero, retry);
    ctx.asm.nop();
    ctx.asm.bind_label(cont);

    let state = op.state;
    let (base, offset) = (op.base, op.offset);
    ctx.defer(slow, "atomic barrier slow path", move |ctx| {
        // SCRATCH0 = field address, SCRATCH1 = bad-colored current value.
        emit_stub_call(ctx, StubId::AtomicBarrierSlow, state)?;
        ctx.asm.b(retry); // re-run the loop against the healed field
        ctx.asm.daddiu(SCRATCH0, base, offset); // stub clobbered the scratch
        Ok(())
    });
    Ok(())
}

/// A barrier-protected atomic exchange. `dst` receives the decolored
/// previous value.
#[derive(Debug, Clone, Copy)]
pub struct BarrieredSwap {
    pub dst: Gpr,
    pub new_value: Gpr,
    pub base: Gpr,
    pub offset: i16,
    pub tmp1: Gpr,
    pub tmp2: Gpr,
    pub state: Option<FrameStateId>,
}

/// Emit an atomic swap with the read barrier folded into its LL/SC loop.
pub fn emit_barriered_swap(ctx: &mut EmissionContext, op: &BarrieredSwap) -> JitResult<()> {
    check_not_reserved(&[op.dst, op.new_value, op.base, op.tmp1, op.tmp2])?;
    if op.dst == op.new_value || op.dst == op.base {
        return Err(JitError::invariant(
            "swap requires dst distinct from new_value and base",
        ));
    }
    if op.tmp1 == op.tmp2 {
        return Err(JitError::invariant("swap temporaries must be distinct"));
    }
    let colors = ctx.options.colors;
    let slow = ctx.asm.create_label();
    let retry = ctx.asm.create_label();

    ctx.asm.daddiu(SCRATCH0, op.base, op.offset);
    ctx.asm.bind_label(retry);
    if let Some(s) = op.state {
        ctx.record_implicit_exception(ctx.position(), s);
    }
    ctx.asm.lld(SCRATCH1, SCRATCH0, 0);
    let mask_at = ctx.position();
    ctx.asm.andi(op.tmp1, SCRATCH1, colors.load_bad_mask);
    ctx.record_barrier_imm(mask_at, BarrierImmKind::LoadBadMask);
    ctx.asm.bne(op.tmp1, Gpr::Zero, slow);
    ctx.asm.dsra(op.tmp2, SCRATCH1, colors.decolor_shift); // delay: decolored old
    ctx.asm.dsll(op.tmp1, op.new_value, colors.decolor_shift);
    let good_at = ctx.position();
    ctx.asm.ori(op.tmp1, op.tmp1, colors.store_good_color);
    ctx.record_barrier_imm(good_at, BarrierImmKind::StoreGoodColor);
    ctx.asm.scd(op.tmp1, SCRATCH0, 0);
    ctx.asm.beq(op.tmp1, Gpr::Zero, retry);
    ctx.asm.mov(op.dst, op.tmp2); // delay: old value, harmless on retry

    let state = op.state;
    let (base, offset) = (op.base, op.offset);
    ctx.defer(slow, "atomic barrier slow path", move |ctx| {
        emit_stub_call(ctx, StubId::AtomicBarrierSlow, state)?;
        ctx.asm.b(retry);
        ctx.asm.daddiu(SCRATCH0, base, offset); // stub clobbered the scratch
        Ok(())
    });
    Ok(())
}
