//! # DAQ crate for the FE-I4 pixel front-end
//!
//! Builds bit-exact command sequences for the chip, streams
//! them through the command memory of the readout board and
//! drains the receive FIFO into timestamped raw word chunks.
//! The scan driver on top runs the external trigger scan with
//! its stop conditions.
//!
//! Everything decoded lives in `fei4-dataclasses`.

pub mod bitcmd;
pub mod registers;
pub mod bus;
pub mod chipregs;
pub mod masks;
pub mod commands;
pub mod channel;
pub mod readout;
pub mod scan;
pub mod settings;

extern crate crossbeam_channel;

#[macro_use] extern crate log;
