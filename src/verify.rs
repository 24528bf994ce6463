//! Optional per-instruction verification hooks.
//!
//! External correctness tools can register an [`InstVerifier`]; the block
//! scheduler then hands every instruction and the exact bytes it emitted
//! to each registered verifier. The registry is the only state shared
//! between concurrent compilations: it is initialized once and guarded by
//! a read-write lock, and the empty check keeps the hot path to a single
//! atomic load.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// A plugged-in instruction verifier.
///
/// `inst_text` is the instruction's rendered form; `bytes` are exactly
/// the bytes it emitted (deferred out-of-line code is attributed to its
/// originating instruction and not re-verified).
pub trait InstVerifier: Send + Sync {
    fn verify(&self, inst_text: &str, bytes: &[u8]) -> Result<(), String>;
}

/// Registry of installed verifiers.
pub struct VerifierRegistry {
    verifiers: RwLock<Vec<Arc<dyn InstVerifier>>>,
    any: AtomicBool,
}

impl VerifierRegistry {
    fn new() -> Self {
        VerifierRegistry {
            verifiers: RwLock::new(Vec::new()),
            any: AtomicBool::new(false),
        }
    }

    /// Install a verifier for all subsequent compilations.
    pub fn install(&self, verifier: Arc<dyn InstVerifier>) {
        self.verifiers.write().push(verifier);
        self.any.store(true, Ordering::Release);
    }

    /// Remove every installed verifier.
    pub fn clear(&self) {
        self.verifiers.write().clear();
        self.any.store(false, Ordering::Release);
    }

    /// Cheap emptiness check for the emission hot path.
    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.any.load(Ordering::Acquire)
    }

    /// Run every verifier; the first rejection wins.
    pub fn verify_all(&self, inst_text: &str, bytes: &[u8]) -> Result<(), String> {
        for verifier in self.verifiers.read().iter() {
            verifier.verify(inst_text, bytes)?;
        }
        Ok(())
    }
}

/// The process-wide registry, created on first use.
pub fn registry() -> &'static VerifierRegistry {
    static REGISTRY: OnceLock<VerifierRegistry> = OnceLock::new();
    REGISTRY.get_or_init(VerifierRegistry::new)
}
