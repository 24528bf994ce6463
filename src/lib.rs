//! Tier-2 code emission backend for the Kestrel VM.
//!
//! This crate is the final stage of the optimizing JIT: it lowers a
//! register-allocated, architecture-specific LIR into a linear byte buffer
//! of MIPS64 machine code, inserting read/write barriers for the
//! concurrent colored-pointer collector inline, and produces the
//! relocation, exception, call-site, data-section and layout-mark metadata
//! the runtime needs to install, unwind and deoptimize the method.
//!
//! Instruction selection and register allocation happen upstream; this
//! crate consumes a finished [`lir::LirFunction`] with concrete registers
//! and stack slots and a fixed code-emitting block order.
#![deny(unsafe_op_in_unsafe_fn)]
pub mod backend;
pub mod emit;
pub mod error;
pub mod lir;
pub mod options;
pub mod verify;

pub use emit::context::CompiledCode;
pub use emit::schedule::emit_function;
pub use error::{BailoutReason, JitError, JitResult};
pub use options::{BarrierPolicy, ColorConfig, EmitOptions, MediumPathKind, StubTable};
