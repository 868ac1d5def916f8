//! A small stored-program virtual machine for the comma-separated integer
//! instruction set, plus the plumbing to wire many machines together.
//!
//! Machines talk to the outside world only through a [`port::Port`], so the
//! same interpreter runs standalone, in a feedback ring, or in a routed mesh.

pub mod connector;
pub mod memory;
pub mod network;
pub mod opcode;
pub mod pipeline;
pub mod port;
pub mod program;
pub mod vm;

/// A single memory cell / machine word
pub type Word = i64;
