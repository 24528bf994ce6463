//! GC barrier plumbing: store kinds, policy resolution and descriptors.
//!
//! The collector uses colored pointers: a loaded reference carries phase
//! bits that are checked inline against patchable mask immediates. The
//! fast path is a handful of instructions; everything else is deferred to
//! out-of-line medium/slow paths generated after all block code. This
//! module holds the architecture-neutral pieces; the actual MIPS64
//! sequences live in `backend::mips64::barrier`.

use crate::backend::mips64::assembler::Label;
use crate::emit::patch::BarrierImmKind;
use crate::options::{EmitOptions, MediumPathKind};

/// The kind of a barrier-protected store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Ordinary reference store.
    Normal,
    /// Atomic access (CAS, swap, volatile store).
    Atomic,
    /// Store into native memory.
    Native,
}

impl StoreKind {
    /// Resolve the medium path this store takes under the given options.
    ///
    /// The policy table is externally supplied (and validated); the
    /// store-buffer toggle degrades buffered policies to the slow path at
    /// emission time.
    pub fn medium_path(self, options: &EmitOptions) -> MediumPathKind {
        let policy = &options.barrier_policy;
        let kind = match self {
            StoreKind::Normal => policy.normal,
            StoreKind::Atomic => policy.atomic,
            StoreKind::Native => policy.native,
        };
        match kind {
            MediumPathKind::StoreBuffer if !options.store_buffer_enabled => {
                MediumPathKind::SlowOnly
            }
            other => other,
        }
    }
}

/// One barriered access, as handed to the deferred-path generators.
///
/// Fast path, medium path and slow path all converge on `cont`; the
/// out-of-line labels are bound by the block scheduler when it runs the
/// deferred generators after the last block.
#[derive(Debug, Clone, Copy)]
pub struct BarrierDescriptor {
    /// Store kind, for stores; reads use `Normal`.
    pub kind: StoreKind,
    /// Which patchable pattern the fast path compares against.
    pub compare: BarrierImmKind,
    /// Resolved medium-path flavor.
    pub medium: MediumPathKind,
    /// Entry label of the first out-of-line path.
    pub out_of_line: Label,
    /// The shared continuation every path ends at.
    pub cont: Label,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BarrierPolicy;

    #[test]
    fn policy_resolution_follows_the_table() {
        let options = EmitOptions::default();
        assert_eq!(StoreKind::Normal.medium_path(&options), MediumPathKind::StoreBuffer);
        assert_eq!(StoreKind::Atomic.medium_path(&options), MediumPathKind::SelfHeal);
        assert_eq!(StoreKind::Native.medium_path(&options), MediumPathKind::SlowOnly);
    }

    #[test]
    fn disabled_buffer_degrades_to_slow() {
        let options = EmitOptions {
            store_buffer_enabled: false,
            barrier_policy: BarrierPolicy::default(),
            ..EmitOptions::default()
        };
        assert_eq!(StoreKind::Normal.medium_path(&options), MediumPathKind::SlowOnly);
        // Self-heal is unaffected by the buffer toggle.
        assert_eq!(StoreKind::Atomic.medium_path(&options), MediumPathKind::SelfHeal);
    }
}
