//! Emission configuration supplied by the surrounding VM.
//!
//! The collector owns the barrier color protocol: mask images, the decolor
//! shift and the store-kind policy table all arrive here as data and are
//! validated against the collector's contract rather than hard-coded.

use crate::error::{JitError, JitResult};

/// Initial images of the collector's color bit patterns.
///
/// These are only the values emitted into the code; every occurrence is
/// recorded as a patchable immediate so the runtime can rewrite them as
/// the collector's phase changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorConfig {
    /// Load barrier: a pointer with any of these bits set needs healing.
    pub load_bad_mask: u16,
    /// Store barrier: a previous value with any of these bits set routes
    /// to the medium path.
    pub store_bad_mask: u16,
    /// Color bits stamped onto published pointers; also the image of the
    /// store-good null the self-healing path publishes.
    pub store_good_color: u16,
    /// The benign young-generation raw null marker.
    pub young_null: u16,
    /// Arithmetic right-shift amount that strips color bits.
    pub decolor_shift: u8,
}

impl Default for ColorConfig {
    fn default() -> Self {
        ColorConfig {
            load_bad_mask: 0x000c,
            store_bad_mask: 0x000c,
            store_good_color: 0x0001,
            young_null: 0x0004,
            decolor_shift: 4,
        }
    }
}

/// What a store barrier's medium path does on a fast-path mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediumPathKind {
    /// Log (field address, previous value) into the thread-local store
    /// buffer; slow path only when the buffer is full or disabled.
    StoreBuffer,
    /// Bounded LL/SC retry publishing a self-healed pointer; slow path on
    /// any interference.
    SelfHeal,
    /// Always call the runtime.
    SlowOnly,
}

/// Store-kind to medium-path mapping.
///
/// The table changes between collector versions, so it is supplied by the
/// collector and checked against its invariants here instead of being
/// baked into the emitters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierPolicy {
    /// Policy for ordinary reference stores.
    pub normal: MediumPathKind,
    /// Policy for atomic (CAS/swap/volatile) stores.
    pub atomic: MediumPathKind,
    /// Policy for native-memory stores.
    pub native: MediumPathKind,
}

impl Default for BarrierPolicy {
    fn default() -> Self {
        BarrierPolicy {
            normal: MediumPathKind::StoreBuffer,
            atomic: MediumPathKind::SelfHeal,
            native: MediumPathKind::SlowOnly,
        }
    }
}

impl BarrierPolicy {
    /// Validate the table against the collector contract.
    ///
    /// Native stores have no local healing protocol and atomic stores may
    /// not be deferred through the buffer, so those combinations are
    /// rejected up front.
    pub fn validate(&self) -> JitResult<()> {
        if self.native != MediumPathKind::SlowOnly {
            return Err(JitError::invariant(
                "barrier policy: native stores must use the slow path",
            ));
        }
        if self.atomic == MediumPathKind::StoreBuffer {
            return Err(JitError::invariant(
                "barrier policy: atomic stores may not use the store buffer",
            ));
        }
        if self.normal == MediumPathKind::SelfHeal {
            return Err(JitError::invariant(
                "barrier policy: normal stores have no self-heal protocol",
            ));
        }
        Ok(())
    }
}

/// Runtime entry points the emitted code may call.
///
/// Barrier stubs are register-preserving trampolines: they clobber nothing
/// except the reserved scratch registers and `ra`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubTable {
    /// Load barrier slow path: heals the field named by the scratch
    /// registers (holder, field address).
    pub load_barrier_slow: u64,
    /// Store barrier slow path.
    pub store_barrier_slow: u64,
    /// Atomic-update (CAS/swap) slow path: performs the access on behalf
    /// of compiled code when the field needs healing first.
    pub atomic_barrier_slow: u64,
    /// Deoptimization handler.
    pub deopt_handler: u64,
}

/// A runtime stub referenced by a direct call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StubId {
    LoadBarrierSlow,
    StoreBarrierSlow,
    AtomicBarrierSlow,
    DeoptHandler,
}

impl StubTable {
    /// Resolve a stub id to its entry address.
    pub fn address(&self, stub: StubId) -> u64 {
        match stub {
            StubId::LoadBarrierSlow => self.load_barrier_slow,
            StubId::StoreBarrierSlow => self.store_barrier_slow,
            StubId::AtomicBarrierSlow => self.atomic_barrier_slow,
            StubId::DeoptHandler => self.deopt_handler,
        }
    }
}

/// Per-compilation emission options.
#[derive(Debug, Clone, Copy)]
pub struct EmitOptions {
    /// Whether store-barrier medium paths may use the deferred buffer.
    /// When off, buffered policies degrade to the slow path.
    pub store_buffer_enabled: bool,
    /// Store-kind policy table, validated before emission starts.
    pub barrier_policy: BarrierPolicy,
    /// Collector color bit images.
    pub colors: ColorConfig,
    /// Alignment for loop headers not reached by fallthrough; 0 disables.
    pub loop_align: u32,
    /// Run the size-estimation pass before the final pass so short branch
    /// forms can be used where targets are provably in range.
    pub two_pass: bool,
    /// Treat every label distance as unknown. Forced on during the
    /// estimation pass; may be set for single-pass emission when layout
    /// could still shift.
    pub conservative_ranges: bool,
    /// Dump emitted code through the `log` facade after finalization.
    pub dump_code: bool,
}

impl Default for EmitOptions {
    fn default() -> Self {
        EmitOptions {
            store_buffer_enabled: true,
            barrier_policy: BarrierPolicy::default(),
            colors: ColorConfig::default(),
            loop_align: 16,
            two_pass: true,
            conservative_ranges: false,
            dump_code: false,
        }
    }
}
