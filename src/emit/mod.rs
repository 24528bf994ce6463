//! The emission pipeline.
//!
//! - `context`: per-compilation bookkeeping and finalization
//! - `schedule`: block walking, deferred paths, the two-pass driver
//! - `delay`: branch delay slot coordination
//! - `barrier`: GC barrier kinds, policy and descriptors
//! - `patch`: relocation/call/exception/mark records and the data section

pub mod barrier;
pub mod context;
pub mod delay;
pub mod patch;
pub mod schedule;

#[cfg(test)]
mod integration_tests;

pub use barrier::StoreKind;
pub use context::{CompiledCode, DeferredPath, EmissionContext};
pub use delay::{DelaySlotHolder, DelayState};
pub use patch::{BarrierImmKind, MarkId};
pub use schedule::emit_function;
