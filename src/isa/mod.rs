//! The instruction-emission boundary.
//!
//! WBTk does not encode instructions. A host compiler backend implements
//! [`Emitter`] for its target ISA, and the barrier code generator drives that
//! trait to lay down the fast-path/slow-path sequences. Any target providing
//! these primitives suffices; nothing in `crate::codegen` is ISA-specific.

mod emitter;

pub use self::emitter::*;
