//! Per-compilation emission state.
//!
//! [`EmissionContext`] owns the assembler plus all bookkeeping produced
//! while blocks are walked: label and instruction position maps, the data
//! section with its constant cache, patch/call/exception/mark records and
//! the deferred out-of-line path list. It contains no encoding logic of
//! its own.
//!
//! One context is created per compilation attempt and either discarded or
//! cleared with [`EmissionContext::reset_for_reemission`] when the
//! two-pass strategy runs the emission again.

use crate::backend::mips64::assembler::{Label, Mips64Assembler};
use crate::emit::patch::{
    BarrierImmKind, BarrierPatchRecord, CallSiteRecord, CallSiteTarget, CodeRefRecord,
    DataConstant, DataId, DataRefRecord, DataSection, ExceptionRecord, ImplicitExceptionRecord,
    MarkId, MarkRecord,
};
use crate::error::{JitError, JitResult};
use crate::lir::{BlockId, FrameLayout, FrameStateId, InstId, SizeEstimate};
use crate::options::{EmitOptions, StubId, StubTable};
use rustc_hash::FxHashMap;

/// A deferred out-of-line code path (barrier medium/slow paths).
///
/// Registered while a block is emitted, bound and generated by the block
/// scheduler after all block code, so the inline fast path stays small.
pub struct DeferredPath {
    /// Label the scheduler binds at the path's first instruction.
    pub label: Label,
    /// Short description for logs and error context.
    pub what: &'static str,
    /// The instruction that registered the path.
    pub origin: Option<InstId>,
    /// The generator closure.
    pub gen: Box<dyn FnOnce(&mut EmissionContext) -> JitResult<()>>,
}

/// The finished compilation artifact handed to the code installer.
#[derive(Debug)]
pub struct CompiledCode {
    /// Machine code bytes.
    pub code: Vec<u8>,
    /// Data section bytes (constants, deduplicated).
    pub data: Vec<u8>,
    /// Frame size in bytes.
    pub frame_size: u32,
    /// Call-site table.
    pub call_sites: Vec<CallSiteRecord>,
    /// Exception table: call offset → handler offset.
    pub exception_table: Vec<ExceptionRecord>,
    /// Implicit-exception sites.
    pub implicit_exceptions: Vec<ImplicitExceptionRecord>,
    /// Data-section references to patch at install time.
    pub data_refs: Vec<DataRefRecord>,
    /// In-method absolute code references to patch at install time.
    pub code_refs: Vec<CodeRefRecord>,
    /// Patchable barrier immediates, located by the collector.
    pub barrier_patches: Vec<BarrierPatchRecord>,
    /// Named layout marks.
    pub marks: Vec<MarkRecord>,
}

impl CompiledCode {
    /// Offset of a mark, when recorded.
    pub fn mark(&self, id: MarkId) -> Option<u32> {
        self.marks.iter().find(|m| m.id == id).map(|m| m.offset)
    }
}

/// Mutable per-compilation emission state.
pub struct EmissionContext {
    /// The low-level assembler handle instruction emitters write through.
    pub asm: Mips64Assembler,
    /// Emission options for this compilation.
    pub options: EmitOptions,
    /// Runtime stub entry points.
    pub stubs: StubTable,

    block_count: usize,
    /// Position of each block in the code-emitting order.
    order_index: Vec<u32>,
    /// Entry label per block.
    block_labels: Vec<Label>,
    /// Reverse map for successor-edge queries.
    label_block: FxHashMap<Label, BlockId>,
    current_block: Option<BlockId>,

    /// Byte position of each instruction's first emitted byte.
    inst_positions: FxHashMap<InstId, u32>,
    current_inst: Option<InstId>,
    /// Frame geometry of the function being emitted.
    frame: Option<FrameLayout>,
    /// Label bind positions snapshot, filled by `build_label_offsets`.
    label_offsets: FxHashMap<Label, u32>,
    /// Distances are unknown until layout settles.
    conservative_ranges: bool,

    data: DataSection,
    /// (sequence offset, data id); resolved at finalize.
    data_ref_edges: Vec<(u32, DataId)>,
    /// (sequence offset, target label); resolved at finalize.
    code_ref_edges: Vec<(u32, Label)>,
    barrier_patches: Vec<BarrierPatchRecord>,
    call_sites: Vec<CallSiteRecord>,
    /// (call offset, handler label); resolved at finalize.
    exception_edges: Vec<(u32, Label)>,
    implicit_exceptions: Vec<ImplicitExceptionRecord>,
    marks: Vec<MarkRecord>,
    deferred: Vec<DeferredPath>,
    frame_size: u32,
}

impl EmissionContext {
    /// Create a context for a function with `block_count` blocks emitted
    /// in `order`. The size estimate pre-sizes the code buffer.
    pub fn new(
        block_count: usize,
        order: &[BlockId],
        options: EmitOptions,
        stubs: StubTable,
        estimate: SizeEstimate,
    ) -> Self {
        let mut ctx = EmissionContext {
            asm: Mips64Assembler::with_capacity(estimate.code_bytes.max(64) as usize),
            options,
            stubs,
            block_count,
            order_index: vec![u32::MAX; block_count],
            block_labels: Vec::new(),
            label_block: FxHashMap::default(),
            current_block: None,
            inst_positions: FxHashMap::default(),
            current_inst: None,
            frame: None,
            label_offsets: FxHashMap::default(),
            conservative_ranges: options.conservative_ranges,
            data: DataSection::new(),
            data_ref_edges: Vec::new(),
            code_ref_edges: Vec::new(),
            barrier_patches: Vec::new(),
            call_sites: Vec::new(),
            exception_edges: Vec::new(),
            implicit_exceptions: Vec::new(),
            marks: Vec::new(),
            deferred: Vec::new(),
            frame_size: 0,
        };
        for (pos, &block) in order.iter().enumerate() {
            ctx.order_index[block.index()] = pos as u32;
        }
        ctx.create_block_labels();
        ctx
    }

    fn create_block_labels(&mut self) {
        self.block_labels.clear();
        self.label_block.clear();
        for i in 0..self.block_count {
            let label = self.asm.create_label();
            self.block_labels.push(label);
            self.label_block.insert(label, BlockId(i as u32));
        }
    }

    // =========================================================================
    // Positions and blocks
    // =========================================================================

    /// Current byte position of the code cursor.
    #[inline]
    pub fn position(&self) -> u32 {
        self.asm.position()
    }

    /// Entry label of a block.
    #[inline]
    pub fn block_label(&self, block: BlockId) -> Label {
        self.block_labels[block.index()]
    }

    /// Enter a block: bind its entry label and make it current.
    pub fn begin_block(&mut self, block: BlockId) {
        let label = self.block_label(block);
        self.asm.bind_label(label);
        self.current_block = Some(block);
    }

    /// The block currently being emitted.
    #[inline]
    pub fn current_block(&self) -> Option<BlockId> {
        self.current_block
    }

    /// Record the position of an instruction's first byte and make it
    /// current.
    pub fn begin_inst(&mut self, inst: InstId) {
        self.inst_positions.insert(inst, self.position());
        self.current_inst = Some(inst);
    }

    /// The instruction currently being emitted.
    #[inline]
    pub fn current_inst(&self) -> Option<InstId> {
        self.current_inst
    }

    /// Install the frame geometry for the function being emitted.
    pub fn set_frame(&mut self, frame: FrameLayout) {
        self.frame_size = frame.frame_size;
        self.frame = Some(frame);
    }

    /// The installed frame geometry.
    pub fn frame(&self) -> JitResult<&FrameLayout> {
        self.frame
            .as_ref()
            .ok_or_else(|| JitError::invariant("no frame installed in emission context"))
    }

    /// True when a branch to `label` would be a no-op fallthrough: the
    /// label's block is the next one in the code-emitting order.
    pub fn is_successor_edge(&self, label: Label) -> bool {
        let Some(current) = self.current_block else {
            return false;
        };
        let Some(&target) = self.label_block.get(&label) else {
            return false;
        };
        let cur = self.order_index[current.index()];
        let tgt = self.order_index[target.index()];
        cur != u32::MAX && tgt == cur + 1
    }

    // =========================================================================
    // Range queries
    // =========================================================================

    /// Snapshot every bound label's position for distance queries.
    ///
    /// Run after a full pass; positions of labels still unbound at that
    /// point stay unknown.
    pub fn build_label_offsets(&mut self) {
        self.label_offsets.clear();
        for i in 0..self.block_count {
            let label = self.block_labels[i];
            if let Some(off) = self.asm.label_offset(label) {
                self.label_offsets.insert(label, off);
            }
        }
    }

    /// Position of a bound label after [`Self::build_label_offsets`];
    /// `None` means unknown, never a failure.
    pub fn label_position(&self, label: Label) -> Option<u32> {
        self.label_offsets.get(&label).copied()
    }

    /// Position recorded for an instruction, if the pass reached it.
    pub fn inst_position(&self, inst: InstId) -> Option<u32> {
        self.inst_positions.get(&inst).copied()
    }

    /// Whether `label` is provably within `max_distance` bytes of the
    /// instruction. Answers `false` conservatively when either position
    /// is unknown or conservative mode is on.
    pub fn label_within_range(&self, inst: InstId, label: Label, max_distance: u32) -> bool {
        if self.conservative_ranges {
            return false;
        }
        let (Some(from), Some(to)) = (self.inst_position(inst), self.label_position(label)) else {
            return false;
        };
        from.abs_diff(to) <= max_distance
    }

    /// Force conservative range answers (used during the estimation pass).
    pub fn set_conservative_ranges(&mut self, conservative: bool) {
        self.conservative_ranges = conservative;
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Record a named layout mark at the current position.
    pub fn mark(&mut self, id: MarkId) {
        let offset = self.position();
        self.marks.push(MarkRecord { offset, id });
    }

    /// Intern a constant in the data section (structural dedup).
    pub fn intern_data(&mut self, constant: DataConstant, align: u32) -> JitResult<DataId> {
        self.data.intern(constant, align)
    }

    /// Record that the materialization sequence at `code_offset` refers
    /// to `data`.
    pub fn record_data_ref(&mut self, code_offset: u32, data: DataId) {
        self.data_ref_edges.push((code_offset, data));
    }

    /// Record that the materialization sequence at `code_offset` refers
    /// to the in-method position of `target`.
    pub fn record_code_ref(&mut self, code_offset: u32, target: Label) {
        self.code_ref_edges.push((code_offset, target));
    }

    /// Record a patchable barrier immediate at `code_offset`.
    pub fn record_barrier_imm(&mut self, code_offset: u32, kind: BarrierImmKind) {
        self.barrier_patches.push(BarrierPatchRecord { code_offset, kind });
    }

    /// Record a direct call site, optionally with an exception edge.
    pub fn record_direct_call(
        &mut self,
        offset: u32,
        stub: StubId,
        frame_state: Option<FrameStateId>,
        exception_edge: Option<Label>,
    ) {
        self.call_sites.push(CallSiteRecord {
            offset,
            target: CallSiteTarget::Stub(stub),
            frame_state,
        });
        if let Some(handler) = exception_edge {
            self.exception_edges.push((offset, handler));
        }
    }

    /// Record an indirect call site, optionally with an exception edge.
    pub fn record_indirect_call(
        &mut self,
        offset: u32,
        frame_state: Option<FrameStateId>,
        exception_edge: Option<Label>,
    ) {
        self.call_sites.push(CallSiteRecord {
            offset,
            target: CallSiteTarget::Indirect,
            frame_state,
        });
        if let Some(handler) = exception_edge {
            self.exception_edges.push((offset, handler));
        }
    }

    /// Record an instruction that may fault, with its recovery state.
    pub fn record_implicit_exception(&mut self, offset: u32, state: FrameStateId) {
        self.implicit_exceptions.push(ImplicitExceptionRecord { offset, state });
    }

    // =========================================================================
    // Deferred paths
    // =========================================================================

    /// Register a deferred out-of-line path for the scheduler's second
    /// pass.
    pub fn defer(
        &mut self,
        label: Label,
        what: &'static str,
        gen: impl FnOnce(&mut EmissionContext) -> JitResult<()> + 'static,
    ) {
        self.deferred.push(DeferredPath {
            label,
            what,
            origin: self.current_inst,
            gen: Box::new(gen),
        });
    }

    /// Drain the deferred paths registered so far, in registration order.
    pub fn take_deferred(&mut self) -> Vec<DeferredPath> {
        std::mem::take(&mut self.deferred)
    }

    /// Number of deferred paths currently pending.
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    // =========================================================================
    // Pass control
    // =========================================================================

    /// Clear everything the emission pass produced, keeping the LIR-level
    /// inputs (options, stubs, block order) so the pass can run again.
    pub fn reset_for_reemission(&mut self) {
        self.asm.reset();
        self.create_block_labels();
        self.current_block = None;
        self.current_inst = None;
        self.inst_positions.clear();
        self.data.clear();
        self.data_ref_edges.clear();
        self.code_ref_edges.clear();
        self.barrier_patches.clear();
        self.call_sites.clear();
        self.exception_edges.clear();
        self.implicit_exceptions.clear();
        self.marks.clear();
        self.deferred.clear();
        // label_offsets intentionally survives: the next pass consults the
        // previous layout for range queries.
    }

    /// Resolve relocations and exception edges and snapshot the artifact.
    ///
    /// Fails the compilation if any referenced label is still unbound.
    pub fn finalize(mut self) -> JitResult<CompiledCode> {
        self.asm.resolve_relocations()?;

        let mut exception_table = Vec::with_capacity(self.exception_edges.len());
        for &(from_offset, handler) in &self.exception_edges {
            let handler_offset = self.asm.label_offset(handler).ok_or_else(|| {
                JitError::invariant(format!(
                    "exception edge at {:#x} targets unbound label L{}",
                    from_offset,
                    handler.id()
                ))
            })?;
            exception_table.push(ExceptionRecord { from_offset, handler_offset });
        }

        let data_refs = self
            .data_ref_edges
            .iter()
            .map(|&(code_offset, id)| DataRefRecord {
                code_offset,
                data_offset: self.data.entry(id).offset,
            })
            .collect();

        let mut code_refs = Vec::with_capacity(self.code_ref_edges.len());
        for &(code_offset, target) in &self.code_ref_edges {
            let target_offset = self.asm.label_offset(target).ok_or_else(|| {
                JitError::invariant(format!(
                    "code reference at {:#x} targets unbound label L{}",
                    code_offset,
                    target.id()
                ))
            })?;
            code_refs.push(CodeRefRecord { code_offset, target_offset });
        }

        Ok(CompiledCode {
            code: self.asm.take_code(),
            data: self.data.to_bytes(),
            frame_size: self.frame_size,
            call_sites: self.call_sites,
            exception_table,
            implicit_exceptions: self.implicit_exceptions,
            data_refs,
            code_refs,
            barrier_patches: self.barrier_patches,
            marks: self.marks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::BlockId;

    fn test_stubs() -> StubTable {
        StubTable {
            load_barrier_slow: 0x7000_0000,
            store_barrier_slow: 0x7000_0100,
            atomic_barrier_slow: 0x7000_0200,
            deopt_handler: 0x7000_0300,
        }
    }

    fn ctx_with_blocks(n: usize) -> EmissionContext {
        let order: Vec<BlockId> = (0..n as u32).map(BlockId).collect();
        EmissionContext::new(
            n,
            &order,
            EmitOptions::default(),
            test_stubs(),
            SizeEstimate::new(256, 0),
        )
    }

    #[test]
    fn successor_edge_follows_emit_order() {
        let mut ctx = ctx_with_blocks(3);
        ctx.begin_block(BlockId(0));
        assert!(ctx.is_successor_edge(ctx.block_label(BlockId(1))));
        assert!(!ctx.is_successor_edge(ctx.block_label(BlockId(2))));
        ctx.begin_block(BlockId(1));
        assert!(ctx.is_successor_edge(ctx.block_label(BlockId(2))));
        assert!(!ctx.is_successor_edge(ctx.block_label(BlockId(0))));
    }

    #[test]
    fn unknown_label_position_is_none_not_a_crash() {
        let mut ctx = ctx_with_blocks(2);
        let label = ctx.block_label(BlockId(1));
        assert_eq!(ctx.label_position(label), None);
        ctx.build_label_offsets();
        // Still unbound: still unknown.
        assert_eq!(ctx.label_position(label), None);
    }

    #[test]
    fn label_offsets_snapshot_bound_positions() {
        let mut ctx = ctx_with_blocks(2);
        ctx.begin_block(BlockId(0));
        ctx.asm.nop();
        ctx.asm.nop();
        ctx.begin_block(BlockId(1));
        ctx.build_label_offsets();
        assert_eq!(ctx.label_position(ctx.block_label(BlockId(0))), Some(0));
        assert_eq!(ctx.label_position(ctx.block_label(BlockId(1))), Some(8));
    }

    #[test]
    fn range_query_is_conservative_without_positions() {
        let mut ctx = ctx_with_blocks(2);
        let inst = InstId { block: BlockId(0), index: 0 };
        let label = ctx.block_label(BlockId(1));
        assert!(!ctx.label_within_range(inst, label, 0x1000));

        ctx.begin_block(BlockId(0));
        ctx.begin_inst(inst);
        ctx.asm.nop();
        ctx.begin_block(BlockId(1));
        ctx.build_label_offsets();
        assert!(ctx.label_within_range(inst, label, 0x1000));
        assert!(!ctx.label_within_range(inst, label, 2));

        ctx.set_conservative_ranges(true);
        assert!(!ctx.label_within_range(inst, label, 0x1000));
    }

    #[test]
    fn reset_clears_pass_state() {
        let mut ctx = ctx_with_blocks(1);
        ctx.begin_block(BlockId(0));
        ctx.asm.nop();
        ctx.mark(MarkId::PrologueEnd);
        ctx.intern_data(DataConstant::U64(1), 8).unwrap();
        ctx.reset_for_reemission();
        assert_eq!(ctx.position(), 0);
        assert_eq!(ctx.current_block(), None);
        let code = ctx.finalize().unwrap();
        assert!(code.marks.is_empty());
        assert!(code.data.is_empty());
    }

    #[test]
    fn finalize_rejects_unbound_exception_handler() {
        let mut ctx = ctx_with_blocks(2);
        ctx.begin_block(BlockId(0));
        let handler = ctx.block_label(BlockId(1)); // never bound
        ctx.record_direct_call(0, StubId::DeoptHandler, None, Some(handler));
        assert!(ctx.finalize().is_err());
    }
}
