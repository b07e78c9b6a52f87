//! WBTk is a toolkit for emitting the write-barrier code sequences a
//! concurrent, region-based garbage collector needs around every reference
//! store: a pre-write barrier that logs overwritten values into a
//! snapshot-at-the-beginning (SATB) buffer while marking is active, and a
//! post-write barrier that dirties the card covering a cross-region store
//! and logs the card for refinement.
//!
//! The crate splits along the fast-path/slow-path boundary of the scheme:
//!
//! * [`isa`] defines the instruction-emission primitives a host compiler
//!   backend provides ([`isa::Emitter`]); WBTk itself encodes nothing.
//! * [`codegen`] is the barrier code generator: the shared queue-insertion
//!   sequence, the two barriers, the reference load/store composition, bulk
//!   array barriers, and two slow-path materialization strategies (inline
//!   calls or shared out-of-line stubs).
//! * [`runtime`] is what the generated slow paths call into: per-thread log
//!   buffers with descending cursors, the global queue sets that collect
//!   full buffers, and the runtime entry points.
//! * [`policy`] holds the region/card geometry and the card table.
//!
//! No locks are taken in any generated fast path; the mutator's only slow
//! operation is the runtime call when a log buffer fills.

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate static_assertions;

pub mod codegen;
pub mod isa;
pub mod policy;
pub mod runtime;
pub mod util;

pub use crate::codegen::{
    AccessAttrs, BarrierAssembler, BarrierConfig, PreservationLevel, SlowPathStrategy,
};
pub use crate::isa::{Emitter, RegOrOffset, RuntimeEntry};
pub use crate::util::Address;
