//! Block scheduling and the emission pass driver.
//!
//! Walks the function's blocks in the precomputed code-emitting order,
//! aligns loop headers not entered by fallthrough, emits each instruction
//! through its [`InstEmit`] capability, and then runs every deferred
//! out-of-line path with a trap appended after each so control can never
//! fall through from one path into the next.
//!
//! Failures that are not bailouts are wrapped with the offending block
//! and instruction identity and surface as internal errors; nothing is
//! retried here.

use crate::emit::context::{CompiledCode, EmissionContext};
use crate::emit::patch::MarkId;
use crate::error::{JitError, JitResult};
use crate::lir::{InstEmit, InstId, LirFunction, SizeEstimate};
use crate::options::{EmitOptions, StubTable};
use crate::verify;
use log::{debug, trace};

/// BREAK code marking the unreachable gap after each deferred path.
const UNREACHABLE_BREAK_CODE: u16 = 0x101;

/// Wrap a non-bailout failure with the offending instruction's identity.
fn wrap_internal(err: JitError, inst_id: InstId, inst_text: String) -> JitError {
    match err {
        JitError::Bailout(_) | JitError::Internal { .. } | JitError::Verification { .. } => err,
        other => JitError::Internal {
            block: inst_id.block.0,
            inst: inst_id.index,
            inst_text,
            detail: other.to_string(),
        },
    }
}

/// Conservative whole-function size estimate for buffer pre-sizing.
fn estimate_function<I: InstEmit>(func: &LirFunction<I>) -> SizeEstimate {
    let mut estimate = SizeEstimate::new(64, 0);
    for block in &func.blocks {
        // Worst-case alignment padding per block.
        estimate.code_bytes += 16;
        for inst in &block.insts {
            estimate.add(inst.size_estimate());
        }
    }
    estimate
}

/// Emit a function to completion: validate the barrier policy, run the
/// two-pass strategy when configured, and finalize the artifact.
pub fn emit_function<I: InstEmit>(
    func: &LirFunction<I>,
    options: &EmitOptions,
    stubs: &StubTable,
) -> JitResult<CompiledCode> {
    options.barrier_policy.validate()?;

    let estimate = estimate_function(func);
    let mut ctx = EmissionContext::new(
        func.blocks.len(),
        &func.order,
        *options,
        *stubs,
        estimate,
    );
    ctx.set_frame(func.frame.clone());

    if options.two_pass {
        debug!("estimation pass over {} blocks", func.order.len());
        ctx.set_conservative_ranges(true);
        emit_pass(func, &mut ctx)?;
        ctx.build_label_offsets();
        ctx.reset_for_reemission();
        ctx.set_conservative_ranges(options.conservative_ranges);
    }

    debug!("final pass over {} blocks", func.order.len());
    emit_pass(func, &mut ctx)?;

    let code = ctx.finalize()?;
    if options.dump_code {
        dump_code(&code.code);
    }
    Ok(code)
}

/// One full emission pass: all blocks, then all deferred paths.
fn emit_pass<I: InstEmit>(func: &LirFunction<I>, ctx: &mut EmissionContext) -> JitResult<()> {
    // Per-instruction emission state (delay-slot holders) must start
    // every pass in its initial state.
    for block in &func.blocks {
        for inst in &block.insts {
            inst.reset_emit_state();
        }
    }

    for (pos, &block_id) in func.order.iter().enumerate() {
        let block = func.block(block_id);

        // Align loop headers, but only when the lexical predecessor does
        // not fall through into them (padding on a fallthrough edge would
        // execute the NOPs on every iteration's entry).
        if block.loop_header && ctx.options.loop_align > 1 {
            let entered_by_fallthrough = pos > 0
                && func
                    .block(func.order[pos - 1])
                    .insts
                    .last()
                    .map(|inst| inst.falls_through())
                    .unwrap_or(true);
            if !entered_by_fallthrough {
                ctx.asm.align_to(ctx.options.loop_align);
            }
        }

        ctx.begin_block(block_id);
        trace!("block {} at {:#x}", block_id, ctx.position());

        for (index, inst) in block.insts.iter().enumerate() {
            let inst_id = InstId { block: block_id, index: index as u32 };
            ctx.begin_inst(inst_id);
            let start = ctx.position() as usize;
            inst.emit(ctx)
                .map_err(|e| wrap_internal(e, inst_id, inst.to_string()))?;

            let registry = verify::registry();
            if !registry.is_empty() {
                let bytes = &ctx.asm.code()[start..ctx.position() as usize];
                if let Err(detail) = registry.verify_all(&inst.to_string(), bytes) {
                    return Err(JitError::Verification {
                        inst_text: inst.to_string(),
                        bytes: bytes.to_vec(),
                        detail,
                    });
                }
            }
        }
    }

    run_deferred_paths(ctx)
}

/// Bind and generate every deferred path, trapping the gap after each.
fn run_deferred_paths(ctx: &mut EmissionContext) -> JitResult<()> {
    ctx.mark(MarkId::BarrierSlowPathsStart);
    let mut paths = ctx.take_deferred();
    while !paths.is_empty() {
        debug!("emitting {} deferred paths", paths.len());
        for path in paths {
            ctx.asm.bind_label(path.label);
            let what = path.what;
            let origin = path.origin;
            (path.gen)(ctx).map_err(|e| match e {
                JitError::Bailout(_) => e,
                other => JitError::Internal {
                    block: origin.map(|i| i.block.0).unwrap_or(u32::MAX),
                    inst: origin.map(|i| i.index).unwrap_or(u32::MAX),
                    inst_text: what.to_string(),
                    detail: other.to_string(),
                },
            })?;
            ctx.asm.break_(UNREACHABLE_BREAK_CODE);
        }
        // Generators may themselves have registered further paths.
        paths = ctx.take_deferred();
    }
    Ok(())
}

/// Hex-dump the finished code through the logging facade.
fn dump_code(code: &[u8]) {
    for (i, chunk) in code.chunks(16).enumerate() {
        let words: Vec<String> = chunk
            .chunks(4)
            .map(|w| {
                let mut bytes = [0u8; 4];
                bytes[..w.len()].copy_from_slice(w);
                format!("{:08x}", u32::from_le_bytes(bytes))
            })
            .collect();
        debug!("{:6x}: {}", i * 16, words.join(" "));
    }
}
