//! End-to-end emission tests.
//!
//! Functions are built the way the register allocator would hand them
//! down, emitted through the full pipeline, installed at fixed addresses
//! (applying data/code reference patches) and executed on the test
//! simulator with architectural delay-slot and LL/SC semantics.

use crate::backend::mips64::barrier::{BarrieredCas, BarrieredStore, BarrieredSwap};
use crate::backend::mips64::encoder;
use crate::backend::mips64::lir::{BranchCond, CallTarget, Mips64Inst};
use crate::backend::mips64::registers::{
    Gpr, THREAD_STORE_BUFFER_BASE_OFFSET, THREAD_STORE_BUFFER_CURSOR_OFFSET,
};
use crate::backend::mips64::sim::{Machine, Outcome};
use crate::emit::barrier::StoreKind;
use crate::emit::context::CompiledCode;
use crate::emit::delay::DelaySlotHolder;
use crate::emit::patch::MarkId;
use crate::emit::schedule::emit_function;
use crate::error::JitError;
use crate::lir::{FrameLayout, FrameState, LirFunction};
use crate::options::{EmitOptions, StubId, StubTable};
use smallvec::SmallVec;
use std::cell::Cell;
use std::rc::Rc;

const CODE_BASE: u64 = 0x0010_0000;
const DATA_BASE: u64 = 0x0020_0000;
const HEAP: u64 = 0x0030_0000;
const THREAD_BASE: u64 = 0x0040_0000;
const BUFFER_BASE: u64 = 0x0050_0000;
const STACK_TOP: u64 = 0x0060_0000;

const LOAD_SLOW: u64 = 0x7000_0000;
const STORE_SLOW: u64 = 0x7000_0100;
const ATOMIC_SLOW: u64 = 0x7000_0200;
const DEOPT: u64 = 0x7000_0300;

fn stubs() -> StubTable {
    StubTable {
        load_barrier_slow: LOAD_SLOW,
        store_barrier_slow: STORE_SLOW,
        atomic_barrier_slow: ATOMIC_SLOW,
        deopt_handler: DEOPT,
    }
}

fn options() -> EmitOptions {
    EmitOptions::default()
}

/// Apply install-time patches and boot a machine with the artifact.
fn boot(code: &mut CompiledCode) -> Machine {
    for r in &code.data_refs {
        r.apply(&mut code.code, DATA_BASE);
    }
    for r in &code.code_refs {
        r.apply(&mut code.code, CODE_BASE);
    }
    let mut m = Machine::new();
    m.load_bytes(CODE_BASE, &code.code);
    m.load_bytes(DATA_BASE, &code.data);
    m.set_reg(Gpr::Sp, STACK_TOP);
    m.set_reg(Gpr::S7, THREAD_BASE);
    m
}

/// A one-block leaf function: prologue, body, return.
fn leaf(body: Vec<Mips64Inst>) -> LirFunction<Mips64Inst> {
    let mut func = LirFunction::new(FrameLayout::with_slots(2));
    let entry = func.add_block();
    let block = func.block_mut(entry);
    block.insts.push(Mips64Inst::Prologue);
    block.insts.extend(body);
    block.insts.push(Mips64Inst::Return { delay: DelaySlotHolder::new() });
    func
}

/// A colored pointer under the default [`crate::options::ColorConfig`]:
/// value in the high bits, good color in the low four.
fn good_colored(value: u64) -> u64 {
    (value << 4) | 0x1
}

// =============================================================================
// Branch elision and delay slots
// =============================================================================

/// Scenario: a move, then a conditional branch whose target is the next
/// block. Only the move's encoding may appear.
#[test]
fn fallthrough_conditional_branch_emits_nothing() {
    let mut func = LirFunction::new(FrameLayout::with_slots(0));
    let b0 = func.add_block();
    let b1 = func.add_block();
    func.block_mut(b0).insts.push(Mips64Inst::Move { dst: Gpr::V0, src: Gpr::A0 });
    func.block_mut(b0).insts.push(Mips64Inst::CondBranch {
        cond: BranchCond::Eq,
        lhs: Gpr::A0,
        rhs: Gpr::A1,
        target: b1,
        delay: DelaySlotHolder::new(),
    });
    func.block_mut(b1).insts.push(Mips64Inst::Trap);

    let code = emit_function(&func, &options(), &stubs()).unwrap();
    assert_eq!(code.code.len(), 8); // move + trap, zero bytes for the branch
    let first = u32::from_le_bytes(code.code[0..4].try_into().unwrap());
    assert_eq!(first, encoder::encode_daddu(Gpr::V0, Gpr::A0, Gpr::Zero).bits());
}

/// A taken branch has exactly one instruction in its delay slot: the
/// NOP filler, never zero, never two.
#[test]
fn taken_branch_carries_one_slot_instruction() {
    let mut func = LirFunction::new(FrameLayout::with_slots(0));
    let b0 = func.add_block();
    let b1 = func.add_block();
    let b2 = func.add_block();
    func.block_mut(b0).insts.push(Mips64Inst::CondBranch {
        cond: BranchCond::Ne,
        lhs: Gpr::A0,
        rhs: Gpr::Zero,
        target: b2,
        delay: DelaySlotHolder::new(),
    });
    func.block_mut(b1).insts.push(Mips64Inst::Nop);
    func.block_mut(b2).insts.push(Mips64Inst::Trap);

    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    // bne at 0, filler at 4, B1's nop at 8, B2's trap at 12.
    let filler = u32::from_le_bytes(code.code[4..8].try_into().unwrap());
    assert_eq!(filler, 0);
    assert_eq!(code.code.len(), 16);

    // Executing with a0 != 0 must land on the trap in B2.
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, 1);
    assert_eq!(m.run(CODE_BASE, 100), Outcome::Trap(0));
}

/// The return's stack adjustment rides in the delay slot of `jr ra` and
/// still takes effect.
#[test]
fn return_restores_stack_in_delay_slot() {
    let func = leaf(vec![]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    let mut m = boot(&mut code);
    assert_eq!(m.run(CODE_BASE, 100), Outcome::Returned);
    assert_eq!(m.reg(Gpr::Sp), STACK_TOP);
}

// =============================================================================
// Constants and the data section
// =============================================================================

/// Scenario: two loads of the same 64-bit constant create one data entry
/// and two references; a different constant gets its own entry.
#[test]
fn equal_constants_share_one_data_entry() {
    let func = leaf(vec![
        Mips64Inst::LoadConst { dst: Gpr::V0, value: 0xfeed_f00d_dead_beef },
        Mips64Inst::LoadConst { dst: Gpr::V1, value: 0xfeed_f00d_dead_beef },
        Mips64Inst::LoadConst { dst: Gpr::A3, value: 0x1111_2222_3333_4444 },
    ]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    assert_eq!(code.data_refs.len(), 3);
    assert_eq!(code.data.len(), 16); // two 8-byte entries
    assert_eq!(code.data_refs[0].data_offset, code.data_refs[1].data_offset);
    assert_ne!(code.data_refs[0].data_offset, code.data_refs[2].data_offset);

    let mut m = boot(&mut code);
    assert_eq!(m.run(CODE_BASE, 1_000), Outcome::Returned);
    assert_eq!(m.reg(Gpr::V0), 0xfeed_f00d_dead_beef);
    assert_eq!(m.reg(Gpr::V1), 0xfeed_f00d_dead_beef);
    assert_eq!(m.reg(Gpr::A3), 0x1111_2222_3333_4444);
}

// =============================================================================
// Read barrier
// =============================================================================

/// A good-colored pointer never reaches the slow path and comes out
/// arithmetically shifted by the decolor amount.
#[test]
fn read_barrier_good_color_stays_inline() {
    let func = leaf(vec![Mips64Inst::BarrieredLoad {
        dst: Gpr::V0,
        base: Gpr::A0,
        offset: 8,
        state: None,
    }]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.write_u64(HEAP + 8, good_colored(0x1234));

    assert_eq!(m.run(CODE_BASE, 1_000), Outcome::Returned);
    assert_eq!(m.reg(Gpr::V0), 0x1234);
    assert_eq!(m.executed("jalr"), 0); // no runtime call
}

/// A bad-colored pointer takes the slow path once; the healed field is
/// reloaded and decolored.
#[test]
fn read_barrier_bad_color_heals_through_runtime() {
    let func = leaf(vec![Mips64Inst::BarrieredLoad {
        dst: Gpr::V0,
        base: Gpr::A0,
        offset: 8,
        state: None,
    }]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.write_u64(HEAP + 8, (0x5678 << 4) | 0x8); // load-bad bit set

    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    m.install_stub(LOAD_SLOW, move |m| {
        seen.set(seen.get() + 1);
        // The stub receives the field address in the first scratch and
        // heals the field to the good color.
        let field = m.reg(Gpr::At);
        let old = m.read_u64(field);
        m.write_u64(field, (old & !0xf) | 0x1);
    });

    assert_eq!(m.run(CODE_BASE, 1_000), Outcome::Returned);
    assert_eq!(m.reg(Gpr::V0), 0x5678);
    assert_eq!(calls.get(), 1);
}

// =============================================================================
// Write barrier
// =============================================================================

fn normal_store(offset: i16) -> Mips64Inst {
    Mips64Inst::BarrieredStore(BarrieredStore {
        src: Gpr::A1,
        base: Gpr::A0,
        offset,
        kind: StoreKind::Normal,
        tmp1: Gpr::T0,
        tmp2: Gpr::T1,
        state: None,
    })
}

/// A store over a store-good previous value never leaves the fast path
/// and publishes the re-colored source.
#[test]
fn store_barrier_good_previous_value_stays_inline() {
    let func = leaf(vec![normal_store(0)]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.set_reg(Gpr::A1, 0x77);
    m.write_u64(HEAP, good_colored(0x9999));

    assert_eq!(m.run(CODE_BASE, 1_000), Outcome::Returned);
    assert_eq!(m.read_u64(HEAP), good_colored(0x77));
    assert_eq!(m.executed("jalr"), 0);
}

/// Overflowing the store buffer routes exactly the overflowing entry to
/// the slow path; the preceding store is buffered.
#[test]
fn store_buffer_overflow_goes_slow_exactly_once() {
    let func = leaf(vec![normal_store(0), normal_store(8)]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.set_reg(Gpr::A1, 0x42);
    // Both fields hold store-bad values, so both stores leave the fast
    // path.
    m.write_u64(HEAP, 0x8);
    m.write_u64(HEAP + 8, 0x8);
    // Room for exactly one 16-byte entry.
    m.write_u64(THREAD_BASE + THREAD_STORE_BUFFER_CURSOR_OFFSET as u64, 16);
    m.write_u64(THREAD_BASE + THREAD_STORE_BUFFER_BASE_OFFSET as u64, BUFFER_BASE);

    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    m.install_stub(STORE_SLOW, move |_| seen.set(seen.get() + 1));

    assert_eq!(m.run(CODE_BASE, 2_000), Outcome::Returned);
    assert_eq!(calls.get(), 1);
    // First store was buffered: (field address, previous value).
    assert_eq!(m.read_u64(THREAD_BASE + THREAD_STORE_BUFFER_CURSOR_OFFSET as u64), 0);
    assert_eq!(m.read_u64(BUFFER_BASE), HEAP);
    assert_eq!(m.read_u64(BUFFER_BASE + 8), 0x8);
    // Both stores still published their values.
    assert_eq!(m.read_u64(HEAP), good_colored(0x42));
    assert_eq!(m.read_u64(HEAP + 8), good_colored(0x42));
}

/// With buffering administratively disabled, the medium path degrades to
/// the slow path even with buffer space available.
#[test]
fn disabled_buffer_always_goes_slow() {
    let func = leaf(vec![normal_store(0)]);
    let opts = EmitOptions { store_buffer_enabled: false, ..options() };
    let mut code = emit_function(&func, &opts, &stubs()).unwrap();
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.set_reg(Gpr::A1, 0x42);
    m.write_u64(HEAP, 0x8);
    m.write_u64(THREAD_BASE + THREAD_STORE_BUFFER_CURSOR_OFFSET as u64, 4096);
    m.write_u64(THREAD_BASE + THREAD_STORE_BUFFER_BASE_OFFSET as u64, BUFFER_BASE);

    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    m.install_stub(STORE_SLOW, move |_| seen.set(seen.get() + 1));

    assert_eq!(m.run(CODE_BASE, 2_000), Outcome::Returned);
    assert_eq!(calls.get(), 1);
    // Nothing was buffered.
    assert_eq!(m.read_u64(BUFFER_BASE), 0);
}

/// Scenario: an atomic store over the young-raw-null marker self-heals
/// with one LL/SC round trip and zero runtime calls.
#[test]
fn atomic_store_over_young_null_self_heals() {
    let func = leaf(vec![Mips64Inst::BarrieredStore(BarrieredStore {
        src: Gpr::A1,
        base: Gpr::A0,
        offset: 0,
        kind: StoreKind::Atomic,
        tmp1: Gpr::T0,
        tmp2: Gpr::T1,
        state: None,
    })]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.set_reg(Gpr::A1, 0x42);
    m.write_u64(HEAP, 0x4); // young raw null marker

    assert_eq!(m.run(CODE_BASE, 2_000), Outcome::Returned);
    assert_eq!(m.executed("jalr"), 0); // zero runtime calls
    assert_eq!(m.executed("lld"), 1); // one LL/SC round trip
    assert_eq!(m.executed("scd"), 1);
    // The program's store then published over the healed null.
    assert_eq!(m.read_u64(HEAP), good_colored(0x42));
}

/// An atomic store over anything but the young null goes to the runtime.
#[test]
fn atomic_store_over_foreign_value_goes_slow() {
    let func = leaf(vec![Mips64Inst::BarrieredStore(BarrieredStore {
        src: Gpr::A1,
        base: Gpr::A0,
        offset: 0,
        kind: StoreKind::Atomic,
        tmp1: Gpr::T0,
        tmp2: Gpr::T1,
        state: None,
    })]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.set_reg(Gpr::A1, 0x42);
    m.write_u64(HEAP, 0x8); // store-bad, but not the young null

    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    m.install_stub(STORE_SLOW, move |_| seen.set(seen.get() + 1));

    assert_eq!(m.run(CODE_BASE, 2_000), Outcome::Returned);
    assert_eq!(calls.get(), 1);
}

// =============================================================================
// Atomic read-modify-write
// =============================================================================

#[test]
fn cas_succeeds_inline_on_good_color() {
    let func = leaf(vec![Mips64Inst::BarrieredCas(BarrieredCas {
        dst: Gpr::V0,
        expected: Gpr::A1,
        new_value: Gpr::A2,
        base: Gpr::A0,
        offset: 0,
        tmp1: Gpr::T0,
        tmp2: Gpr::T1,
        state: None,
    })]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.set_reg(Gpr::A1, 100);
    m.set_reg(Gpr::A2, 200);
    m.write_u64(HEAP, good_colored(100));

    assert_eq!(m.run(CODE_BASE, 2_000), Outcome::Returned);
    assert_eq!(m.reg(Gpr::V0), 100); // previous value; == expected means success
    assert_eq!(m.read_u64(HEAP), good_colored(200));
    assert_eq!(m.executed("jalr"), 0);
}

#[test]
fn cas_mismatch_fails_without_store() {
    let func = leaf(vec![Mips64Inst::BarrieredCas(BarrieredCas {
        dst: Gpr::V0,
        expected: Gpr::A1,
        new_value: Gpr::A2,
        base: Gpr::A0,
        offset: 0,
        tmp1: Gpr::T0,
        tmp2: Gpr::T1,
        state: None,
    })]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.set_reg(Gpr::A1, 100);
    m.set_reg(Gpr::A2, 200);
    m.write_u64(HEAP, good_colored(55));

    assert_eq!(m.run(CODE_BASE, 2_000), Outcome::Returned);
    assert_eq!(m.reg(Gpr::V0), 55); // != expected: failure
    assert_eq!(m.read_u64(HEAP), good_colored(55)); // untouched
}

#[test]
fn cas_on_bad_color_heals_then_retries() {
    let func = leaf(vec![Mips64Inst::BarrieredCas(BarrieredCas {
        dst: Gpr::V0,
        expected: Gpr::A1,
        new_value: Gpr::A2,
        base: Gpr::A0,
        offset: 0,
        tmp1: Gpr::T0,
        tmp2: Gpr::T1,
        state: None,
    })]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.set_reg(Gpr::A1, 100);
    m.set_reg(Gpr::A2, 200);
    m.write_u64(HEAP, (100 << 4) | 0x8); // bad color

    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    m.install_stub(ATOMIC_SLOW, move |m| {
        seen.set(seen.get() + 1);
        let field = m.reg(Gpr::At);
        let old = m.read_u64(field);
        m.write_u64(field, (old & !0xf) | 0x1);
    });

    assert_eq!(m.run(CODE_BASE, 2_000), Outcome::Returned);
    assert_eq!(calls.get(), 1);
    assert_eq!(m.reg(Gpr::V0), 100);
    assert_eq!(m.read_u64(HEAP), good_colored(200));
}

#[test]
fn swap_returns_decolored_old_value() {
    let func = leaf(vec![Mips64Inst::BarrieredSwap(BarrieredSwap {
        dst: Gpr::V0,
        new_value: Gpr::A1,
        base: Gpr::A0,
        offset: 0,
        tmp1: Gpr::T0,
        tmp2: Gpr::T1,
        state: None,
    })]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();
    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.set_reg(Gpr::A1, 0xbeef);
    m.write_u64(HEAP, good_colored(0x77));

    assert_eq!(m.run(CODE_BASE, 2_000), Outcome::Returned);
    assert_eq!(m.reg(Gpr::V0), 0x77);
    assert_eq!(m.read_u64(HEAP), good_colored(0xbeef));
    assert_eq!(m.executed("jalr"), 0);
}

// =============================================================================
// Calls, exceptions and metadata
// =============================================================================

#[test]
fn call_with_exception_edge_fills_the_tables() {
    let mut func = LirFunction::new(FrameLayout::with_slots(0));
    let state = func.add_frame_state(FrameState { bci: 7, live_slots: SmallVec::new() });
    let b0 = func.add_block();
    let b1 = func.add_block();
    func.block_mut(b0).insts.push(Mips64Inst::Prologue);
    func.block_mut(b0).insts.push(Mips64Inst::Call {
        target: CallTarget::Stub(StubId::DeoptHandler),
        state: Some(state),
        exception: Some(b1),
    });
    func.block_mut(b0)
        .insts
        .push(Mips64Inst::Return { delay: DelaySlotHolder::new() });
    func.block_mut(b1).insts.push(Mips64Inst::Trap);

    let code = emit_function(&func, &options(), &stubs()).unwrap();
    assert_eq!(code.call_sites.len(), 1);
    assert_eq!(code.call_sites[0].frame_state, Some(state));
    assert_eq!(code.exception_table.len(), 1);
    assert_eq!(code.exception_table[0].from_offset, code.call_sites[0].offset);
    // The handler offset is B1's entry, past the epilogue.
    let epilogue = code.mark(MarkId::EpilogueStart).unwrap();
    assert!(code.exception_table[0].handler_offset > epilogue);
}

#[test]
fn implicit_exception_sites_are_recorded() {
    let mut func = LirFunction::new(FrameLayout::with_slots(0));
    let state = func.add_frame_state(FrameState { bci: 3, live_slots: SmallVec::new() });
    let b0 = func.add_block();
    func.block_mut(b0).insts.push(Mips64Inst::Prologue);
    func.block_mut(b0).insts.push(Mips64Inst::BarrieredLoad {
        dst: Gpr::V0,
        base: Gpr::A0,
        offset: 0,
        state: Some(state),
    });
    func.block_mut(b0)
        .insts
        .push(Mips64Inst::Return { delay: DelaySlotHolder::new() });

    let code = emit_function(&func, &options(), &stubs()).unwrap();
    assert_eq!(code.implicit_exceptions.len(), 1);
    assert_eq!(code.implicit_exceptions[0].state, state);
    // The faulting instruction is the barrier's initial load, right after
    // the 16-byte prologue.
    assert_eq!(code.implicit_exceptions[0].offset, 16);
}

/// Patchable barrier immediates carry their own relocation kind and can
/// be rewritten in place, flipping the fast path's verdict.
#[test]
fn rewriting_the_load_mask_changes_the_phase() {
    use crate::emit::patch::BarrierImmKind;

    let func = leaf(vec![Mips64Inst::BarrieredLoad {
        dst: Gpr::V0,
        base: Gpr::A0,
        offset: 0,
        state: None,
    }]);
    let mut code = emit_function(&func, &options(), &stubs()).unwrap();

    // Collector phase change: what used to be a good color is now bad.
    for patch in code.barrier_patches.clone() {
        if patch.kind == BarrierImmKind::LoadBadMask {
            patch.apply(&mut code.code, 0x000f);
        }
    }

    let mut m = boot(&mut code);
    m.set_reg(Gpr::A0, HEAP);
    m.write_u64(HEAP, good_colored(0x1234)); // good under the OLD mask

    let calls = Rc::new(Cell::new(0u32));
    let seen = calls.clone();
    m.install_stub(LOAD_SLOW, move |m| {
        seen.set(seen.get() + 1);
        let field = m.reg(Gpr::At);
        let old = m.read_u64(field);
        m.write_u64(field, (old >> 4) << 4); // heal to colorless-good
    });

    assert_eq!(m.run(CODE_BASE, 2_000), Outcome::Returned);
    assert_eq!(calls.get(), 1);
}

/// The verifier hook sees every instruction with its exact bytes, and a
/// rejection surfaces as a verification failure attached to the
/// offending instruction.
#[test]
fn verifier_hook_is_wired_through_the_scheduler() {
    use crate::verify::{self, InstVerifier};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Counting(Arc<AtomicU32>);
    impl InstVerifier for Counting {
        fn verify(&self, _inst: &str, _bytes: &[u8]) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    // Rejects only the marker constant below so concurrent tests are
    // unaffected while this verifier is installed.
    struct RejectMarker;
    impl InstVerifier for RejectMarker {
        fn verify(&self, inst: &str, _bytes: &[u8]) -> Result<(), String> {
            if inst.contains("0xa11ed") {
                Err("marker constant is forbidden".to_string())
            } else {
                Ok(())
            }
        }
    }

    let count = Arc::new(AtomicU32::new(0));
    verify::registry().install(Arc::new(Counting(count.clone())));
    verify::registry().install(Arc::new(RejectMarker));

    let opts = EmitOptions { two_pass: false, ..options() };
    let func = leaf(vec![Mips64Inst::Nop]);
    emit_function(&func, &opts, &stubs()).unwrap();
    // prologue, nop, return at minimum (other tests may add more).
    assert!(count.load(Ordering::Relaxed) >= 3);

    let bad = leaf(vec![Mips64Inst::LoadConst { dst: Gpr::A3, value: 0xa11ed }]);
    let err = emit_function(&bad, &opts, &stubs()).unwrap_err();
    verify::registry().clear();
    match err {
        JitError::Verification { inst_text, bytes, .. } => {
            assert!(inst_text.contains("0xa11ed"));
            assert!(!bytes.is_empty());
        }
        other => panic!("expected verification failure, got {other}"),
    }
}

/// Diagnostic dumps are gated and off the hot path; exercising the flag
/// must not disturb the artifact.
#[test]
fn dump_flag_does_not_change_the_artifact() {
    let _ = env_logger::builder().is_test(true).try_init();
    let func = leaf(vec![Mips64Inst::Move { dst: Gpr::V0, src: Gpr::A0 }]);
    let plain = emit_function(&func, &options(), &stubs()).unwrap();
    let dumped = emit_function(
        &func,
        &EmitOptions { dump_code: true, ..options() },
        &stubs(),
    )
    .unwrap();
    assert_eq!(plain.code, dumped.code);
}

/// A bailing-out function surfaces the bailout unwrapped through the
/// whole pipeline.
#[test]
fn pipeline_propagates_bailouts() {
    let mut func = leaf(vec![Mips64Inst::LoadStack {
        dst: Gpr::V0,
        slot: crate::lir::SlotId(0),
    }]);
    func.frame.slot_offsets[0] = 0x4_0000;
    let err = emit_function(&func, &options(), &stubs()).unwrap_err();
    assert!(matches!(err, JitError::Bailout(_)));
}
