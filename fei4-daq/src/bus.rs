//! Access to the readout board hardware
//!
//! `FeBus` is the seam between the engine and the device:
//! everything above it (command channel, readout loop, scan
//! driver) is hardware agnostic and tested against mock
//! buses.
//!
//! `UioBus` implements the trait over the memory mapped
//! register files at /dev/uio*. Remember this is a 32bit
//! system, one register occupies 4 bytes.

extern crate memmap;

use std::fs::File;

use memmap::{Mmap,
             MmapMut};

use fei4_dataclasses::constants::NCHANNELS;
use fei4_dataclasses::errors::TransportError;

use crate::registers::*;

/// The hardware transactions the engine needs
///
/// All methods take &mut self - the bus is shared behind a
/// single acquisition lock, command sends and FIFO reads
/// must never interleave on the wire.
pub trait FeBus : Send {

  /// Read a 32bit control register
  fn read_reg(&mut self, addr : u32) -> Result<u32, TransportError>;

  /// Write a 32bit control register
  fn write_reg(&mut self, addr : u32, value : u32) -> Result<(), TransportError>;

  /// Write the serialized command into the command memory
  fn write_command_memory(&mut self, data : &[u8]) -> Result<(), TransportError>;

  /// Receive FIFO occupancy in 16bit units
  fn fifo_occupancy(&mut self) -> Result<u32, TransportError>;

  /// Pop `n_words` 32bit words from the receive FIFO.
  /// Callers must bound `n_words` by the reported occupancy.
  fn read_fifo(&mut self, n_words : u32) -> Result<Vec<u32>, TransportError>;

  fn reset_fifo(&mut self) -> Result<(), TransportError> {
    self.write_reg(FIFO_RESET, 0)
  }

  fn reset_rx(&mut self) -> Result<(), TransportError> {
    for base in RX_BASE {
      self.write_reg(base + RX_RESET_OFF, 0)?;
    }
    Ok(())
  }

  fn rx_sync_status(&mut self) -> Result<[bool; NCHANNELS], TransportError> {
    let mut status = [false; NCHANNELS];
    for (ch, base) in RX_BASE.iter().enumerate() {
      status[ch] = self.read_reg(base + RX_SYNC_OFF)? & 0x1 == 0x1;
    }
    Ok(status)
  }

  fn rx_8b10b_error_count(&mut self) -> Result<[u8; NCHANNELS], TransportError> {
    let mut counts = [0u8; NCHANNELS];
    for (ch, base) in RX_BASE.iter().enumerate() {
      counts[ch] = self.read_reg(base + RX_8B10B_ERR_OFF)? as u8;
    }
    Ok(counts)
  }

  fn rx_fifo_discard_count(&mut self) -> Result<[u8; NCHANNELS], TransportError> {
    let mut counts = [0u8; NCHANNELS];
    for (ch, base) in RX_BASE.iter().enumerate() {
      counts[ch] = self.read_reg(base + RX_DISCARD_OFF)? as u8;
    }
    Ok(counts)
  }

  /// Current value of the trigger counter
  fn trigger_number(&mut self) -> Result<u32, TransportError> {
    self.read_reg(TRG_COUNTER)
  }

  fn reset_trigger_counter(&mut self) -> Result<(), TransportError> {
    self.write_reg(TRG_COUNTER_RST, 1)
  }

  fn set_trigger_mode(&mut self, mode : u8) -> Result<(), TransportError> {
    self.write_reg(TRG_MODE, mode as u32 & 0x3)
  }

  fn enable_ext_trigger(&mut self, enable : bool) -> Result<(), TransportError> {
    self.write_reg(TRG_EXT_ENABLE, enable as u32)
  }

  fn enable_tdc(&mut self, enable : bool) -> Result<(), TransportError> {
    self.write_reg(TDC_ENABLE, enable as u32)
  }
}

/// Memory mapped uio implementation
///
/// * ctrl_path : register file, e.g. /dev/uio0
/// * data_path : receive FIFO window, e.g. /dev/uio1
pub struct UioBus {
  ctrl_path : String,
  data_path : String,
}

impl UioBus {

  pub fn new(ctrl_path : &str, data_path : &str) -> Self {
    Self {
      ctrl_path : String::from(ctrl_path),
      data_path : String::from(data_path),
    }
  }

  fn map_read(&self, path : &str, addr : u32, len : usize)
    -> Result<Mmap, TransportError> {
    let file = match File::open(path) {
      Ok(file) => file,
      Err(err) => {
        error!("Failed to open {}: {}", path, err);
        return Err(TransportError::BusError);
      }
    };
    let m = unsafe {
      memmap::MmapOptions::new()
        .offset(addr as u64)
        .len(len)
        .map(&file)
    };
    match m {
      Ok(m)    => Ok(m),
      Err(err) => {
        error!("Failed to mmap {}: {}", path, err);
        Err(TransportError::BusError)
      }
    }
  }

  fn map_write(&self, path : &str, addr : u32, len : usize)
    -> Result<MmapMut, TransportError> {
    let file = match File::options().read(true).write(true).open(path) {
      Ok(file) => file,
      Err(err) => {
        error!("Failed to open {}: {}", path, err);
        return Err(TransportError::BusError);
      }
    };
    let m = unsafe {
      memmap::MmapOptions::new()
        .offset(addr as u64)
        .len(len)
        .map_mut(&file)
    };
    match m {
      Ok(m)    => Ok(m),
      Err(err) => {
        error!("Failed to mmap {}: {}", path, err);
        Err(TransportError::BusError)
      }
    }
  }
}

impl FeBus for UioBus {

  fn read_reg(&mut self, addr : u32) -> Result<u32, TransportError> {
    let m = self.map_read(&self.ctrl_path, addr, 4)?;
    let p = m.as_ptr() as *const u32;
    let value : u32;
    unsafe {
      value = std::ptr::read_volatile(p);
    }
    Ok(value)
  }

  fn write_reg(&mut self, addr : u32, value : u32) -> Result<(), TransportError> {
    trace!("writing {} to register 0x{:04x}", value, addr);
    let m = self.map_write(&self.ctrl_path, addr, 4)?;
    let p = m.as_ptr() as *mut u32;
    unsafe {
      std::ptr::write_volatile(p, value);
    }
    Ok(())
  }

  fn write_command_memory(&mut self, data : &[u8]) -> Result<(), TransportError> {
    if data.len() > CMD_MEM_SIZE - CMD_MEM_OFFSET as usize {
      return Err(TransportError::CommandTooLong);
    }
    let m = self.map_write(&self.ctrl_path, CMD_MEM_OFFSET, data.len())?;
    let p = m.as_ptr() as *mut u8;
    unsafe {
      for (idx, &byte) in data.iter().enumerate() {
        std::ptr::write_volatile(p.add(idx), byte);
      }
    }
    Ok(())
  }

  fn fifo_occupancy(&mut self) -> Result<u32, TransportError> {
    let value = self.read_reg(FIFO_SIZE)?;
    Ok(value & 0x00FFFFFF)
  }

  fn read_fifo(&mut self, n_words : u32) -> Result<Vec<u32>, TransportError> {
    let mut words = Vec::<u32>::with_capacity(n_words as usize);
    if n_words == 0 {
      return Ok(words);
    }
    let m = self.map_read(&self.data_path, FIFO_DATA, 4)?;
    let p = m.as_ptr() as *const u32;
    unsafe {
      for _ in 0..n_words {
        // the read port pops one word per access
        words.push(std::ptr::read_volatile(p));
      }
    }
    Ok(words)
  }
}
