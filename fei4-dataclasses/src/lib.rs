//! # Dataclasses for the FE-I4 readout chain
//!
//! This crate holds everything downstream of the hardware FIFO:
//! the raw 32-bit word classification, the stateful interpreter
//! which reconstructs events and hits from the word stream, the
//! fixed-size histograms filled during interpretation and the
//! append-only raw record file the readout loop persists its
//! chunks to.
//!
//! Nothing in here talks to hardware. The companion crate
//! `fei4-daq` produces the raw word chunks consumed here.
//!

pub mod constants;
pub mod errors;
pub mod serialization;
pub mod words;
pub mod events;
pub mod chunk;
pub mod histograms;
pub mod interpreter;
pub mod cluster;
pub mod io;

#[macro_use] extern crate log;

pub use crate::words::ChipFlavor;
pub use crate::chunk::RawWordChunk;
pub use crate::interpreter::WordInterpreter;
