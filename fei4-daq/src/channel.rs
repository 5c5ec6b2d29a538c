//! The command channel - owns the command memory of the
//! readout board
//!
//! Commands are packed into as few hardware transfers as
//! possible (the chip needs a zero bit between commands),
//! written into the command memory, started, and the READY
//! flag is awaited with a bounded backoff. Every transaction
//! holds the bus lock so command sends never interleave with
//! FIFO reads.

use std::error::Error;
use std::fmt;
use std::sync::{Arc,
                Mutex};
use std::{thread, time};

use fei4_dataclasses::errors::{ConfigError,
                               SerializationError,
                               TransportError};

use crate::bitcmd::BitCommand;
use crate::bus::FeBus;
use crate::chipregs::RegisterModel;
use crate::commands::{build_commands,
                      ChipOp};
use crate::registers::{CMD_MEM_OFFSET,
                       CMD_MEM_SIZE,
                       CMD_REPEAT,
                       CMD_READY,
                       CMD_SIZE,
                       CMD_START};

/// Command memory available for payload, in bytes
pub const COMMAND_MEMORY_BYTES : usize = CMD_MEM_SIZE - CMD_MEM_OFFSET as usize;
/// Serializer overhead per transfer, in bit times
pub const CMD_OVERHEAD_BITS    : usize = 500;
/// One bit time on the 40 MHz command link
pub const BIT_PERIOD_SECS      : f64 = 25e-9;
/// READY poll attempts before giving up
pub const READY_ATTEMPTS       : u32 = 1000;
/// Backoff between READY polls
pub const READY_BACKOFF_MICROS : u64 = 20;

/// Errors of the combined build-and-send helpers
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ChannelError {
  Config(ConfigError),
  Transport(TransportError),
  /// the raw record file refused an append
  Serialization(SerializationError),
}

impl fmt::Display for ChannelError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      ChannelError::Config(err)        => write!(f, "<ChannelError: {}>", err),
      ChannelError::Transport(err)     => write!(f, "<ChannelError: {}>", err),
      ChannelError::Serialization(err) => write!(f, "<ChannelError: {}>", err),
    }
  }
}

impl Error for ChannelError {
}

impl From<ConfigError> for ChannelError {
  fn from(err : ConfigError) -> Self {
    ChannelError::Config(err)
  }
}

impl From<TransportError> for ChannelError {
  fn from(err : TransportError) -> Self {
    ChannelError::Transport(err)
  }
}

impl From<SerializationError> for ChannelError {
  fn from(err : SerializationError) -> Self {
    ChannelError::Serialization(err)
  }
}

/// Streams command sequences to the chip
pub struct CommandChannel<B : FeBus> {
  bus          : Arc<Mutex<B>>,
  /// payload budget of one transfer, in bits
  memory_bits  : usize,
}

impl<B : FeBus> CommandChannel<B> {

  pub fn new(bus : Arc<Mutex<B>>) -> Self {
    Self {
      bus,
      memory_bits : COMMAND_MEMORY_BYTES * 8,
    }
  }

  /// Shrink the transfer window, for tests
  pub fn with_memory_bytes(bus : Arc<Mutex<B>>, memory_bytes : usize) -> Self {
    Self {
      bus,
      memory_bits : memory_bytes * 8,
    }
  }

  /// Send a command sequence
  ///
  /// With `concatenate` the commands are merged (zero bit or
  /// byte padded separators) into the minimum number of
  /// transfers fitting the memory window; a command that
  /// would overflow the window forces a flush of what has
  /// accumulated. Without, every command is transferred
  /// individually with the hardware `repeat` count.
  ///
  /// Returns the number of hardware transfers.
  pub fn send_commands(&self,
                       commands        : &[BitCommand],
                       repeat          : u16,
                       wait_for_finish : bool,
                       concatenate     : bool,
                       byte_padding    : bool,
                       clear_memory    : bool) -> Result<usize, TransportError> {
    for command in commands {
      if command.len() > self.memory_bits {
        error!("Command of {} bits exceeds the {} bit memory window",
               command.len(), self.memory_bits);
        return Err(TransportError::CommandTooLong);
      }
    }
    let mut n_transfers = 0usize;
    if concatenate {
      let mut iter = commands.iter();
      let mut accumulated = match iter.next() {
        Some(command) => command.clone(),
        None          => return Ok(0),
      };
      for command in iter {
        let merged = if byte_padding {
          accumulated.append_byte_padded(command)
        } else {
          accumulated.append(command)
        };
        if merged.len() > self.memory_bits {
          self.send_command(&accumulated, repeat, wait_for_finish, clear_memory)?;
          n_transfers += 1;
          accumulated = command.clone();
        } else {
          accumulated = merged;
        }
      }
      self.send_command(&accumulated, repeat, wait_for_finish, clear_memory)?;
      n_transfers += 1;
    } else {
      let mut max_length = 0usize;
      for command in commands {
        max_length = max_length.max(command.len());
        self.send_command(command, repeat, wait_for_finish, false)?;
        n_transfers += 1;
      }
      if clear_memory {
        self.clear_command_memory(max_length)?;
      }
    }
    Ok(n_transfers)
  }

  /// Transfer and execute a single command
  pub fn send_command(&self,
                      command         : &BitCommand,
                      repeat          : u16,
                      wait_for_finish : bool,
                      clear_memory    : bool) -> Result<(), TransportError> {
    if command.len() > self.memory_bits {
      return Err(TransportError::CommandTooLong);
    }
    {
      let mut bus = self.bus.lock().expect("bus lock poisoned");
      bus.write_reg(CMD_REPEAT, repeat as u32)?;
      bus.write_reg(CMD_SIZE, command.len() as u32)?;
      bus.write_command_memory(&command.to_bytes())?;
      bus.write_reg(CMD_START, 1)?;
    }
    if wait_for_finish {
      self.wait_for_command(command.len(), repeat)?;
    }
    if clear_memory {
      self.clear_command_memory(command.len())?;
    }
    Ok(())
  }

  /// Write a command into the memory without starting it.
  /// Used to preload the trigger FSM replay command.
  pub fn preload_command(&self, command : &BitCommand)
    -> Result<(), TransportError> {
    if command.len() > self.memory_bits {
      return Err(TransportError::CommandTooLong);
    }
    let mut bus = self.bus.lock().expect("bus lock poisoned");
    bus.write_reg(CMD_SIZE, command.len() as u32)?;
    bus.write_command_memory(&command.to_bytes())?;
    Ok(())
  }

  /// Overwrite the command payload with zeros
  pub fn clear_command_memory(&self, length : usize)
    -> Result<(), TransportError> {
    let length = length.min(self.memory_bits);
    let zeros  = BitCommand::zeros(length);
    let mut bus = self.bus.lock().expect("bus lock poisoned");
    bus.write_command_memory(&zeros.to_bytes())?;
    Ok(())
  }

  /// Wait until the sequencer reports READY
  ///
  /// Sleeps the estimated streaming time first, then polls
  /// with a fixed backoff. The wait is bounded - if READY
  /// never comes up we fail instead of spinning forever.
  fn wait_for_command(&self, length : usize, repeat : u16)
    -> Result<(), TransportError> {
    let estimate =
      (length + CMD_OVERHEAD_BITS) as f64 * BIT_PERIOD_SECS * repeat.max(1) as f64;
    thread::sleep(time::Duration::from_secs_f64(estimate));
    let backoff = time::Duration::from_micros(READY_BACKOFF_MICROS);
    for _ in 0..READY_ATTEMPTS {
      {
        let mut bus = self.bus.lock().expect("bus lock poisoned");
        if bus.read_reg(CMD_READY)? & 0x1 == 0x1 {
          return Ok(());
        }
      }
      thread::sleep(backoff);
    }
    error!("Command sequencer never reported READY, giving up after {} polls",
           READY_ATTEMPTS);
    Err(TransportError::ReadyTimeout)
  }

  //========== compound sequences =========
  //
  // The documented operation sequences. Each goes through
  // configuration mode and returns to run mode.
  //=======================================

  fn send_ops(&self, ops : &[ChipOp], model : &RegisterModel)
    -> Result<(), ChannelError> {
    let mut commands = Vec::<BitCommand>::new();
    for op in ops {
      commands.extend(build_commands(op, model)?);
    }
    self.send_commands(&commands, 1, true, true, false, false)?;
    Ok(())
  }

  /// Global reset sequence
  ///
  /// The command order matters, the chip ends up in an odd
  /// state otherwise.
  pub fn global_reset(&self, model : &mut RegisterModel)
    -> Result<(), ChannelError> {
    info!("Sending global reset");
    self.send_ops(&[ChipOp::ConfMode, ChipOp::GlobalReset], model)?;
    thread::sleep(time::Duration::from_millis(100));
    self.send_ops(&[ChipOp::ConfMode, ChipOp::RunMode], model)?;
    model.invalidate();
    Ok(())
  }

  /// Reset the bunch counter
  pub fn reset_bunch_counter(&self, model : &RegisterModel)
    -> Result<(), ChannelError> {
    info!("Resetting bunch counter");
    self.send_ops(&[ChipOp::ConfMode, ChipOp::Bcr], model)?;
    thread::sleep(time::Duration::from_millis(100));
    self.send_ops(&[ChipOp::ConfMode, ChipOp::RunMode], model)
  }

  /// Reset the event counter
  pub fn reset_event_counter(&self, model : &RegisterModel)
    -> Result<(), ChannelError> {
    info!("Resetting event counter");
    self.send_ops(&[ChipOp::ConfMode, ChipOp::Ecr], model)?;
    thread::sleep(time::Duration::from_millis(100));
    self.send_ops(&[ChipOp::ConfMode, ChipOp::RunMode], model)
  }

  /// Reset the service record counters. Also brings back
  /// front-ends with a stuck output FIFO.
  pub fn reset_service_records(&self, model : &mut RegisterModel)
    -> Result<(), ChannelError> {
    info!("Resetting service records");
    let mut commands = build_commands(&ChipOp::ConfMode, model)?;
    model.set_global_value("ReadErrorReq", 1)?;
    let names = vec![String::from("ReadErrorReq")];
    commands.extend(build_commands(&ChipOp::WrRegister { names : names.clone() },
                                   model)?);
    commands.extend(build_commands(&ChipOp::GlobalPulse { width : 0 }, model)?);
    model.set_global_value("ReadErrorReq", 0)?;
    commands.extend(build_commands(&ChipOp::WrRegister { names }, model)?);
    commands.extend(build_commands(&ChipOp::RunMode, model)?);
    self.send_commands(&commands, 1, true, true, false, false)?;
    Ok(())
  }

  /// Send the full global configuration
  pub fn configure_global(&self, model : &mut RegisterModel)
    -> Result<(), ChannelError> {
    info!("Sending global configuration to the front-end");
    self.send_ops(&[ChipOp::ConfMode,
                    ChipOp::WrAllRegisters,
                    ChipOp::RunMode], model)?;
    model.mark_synced();
    Ok(())
  }

  /// Send the full pixel configuration
  ///
  /// The same mask for every double column is in general not
  /// what you want for the DACs, so those always go per-DC.
  pub fn configure_pixel(&self, model : &RegisterModel,
                         same_mask_for_all_dc : bool)
    -> Result<(), ChannelError> {
    info!("Sending pixel configuration to the front-end");
    let dacs = ChipOp::WrFrontend {
      names : vec![String::from("TDAC"), String::from("FDAC")],
      same_mask_for_all_dc : false,
    };
    let masks = ChipOp::WrFrontend {
      names : vec![String::from("Imon"), String::from("Enable"),
                   String::from("C_High"), String::from("C_Low")],
      same_mask_for_all_dc,
    };
    // EnableDigInj has to go last
    let diginj = ChipOp::WrFrontend {
      names : vec![String::from("EnableDigInj")],
      same_mask_for_all_dc,
    };
    self.send_ops(&[ChipOp::ConfMode, dacs, masks, diginj, ChipOp::RunMode],
                  model)
  }

  /// Set the global threshold DAC pair
  pub fn set_gdac(&self, model : &mut RegisterModel, value : u16)
    -> Result<(), ChannelError> {
    let mut commands = build_commands(&ChipOp::ConfMode, model)?;
    model.set_gdac(value)?;
    let names = vec![String::from("Vthin_AltCoarse"),
                     String::from("Vthin_AltFine")];
    commands.extend(build_commands(&ChipOp::WrRegister { names }, model)?);
    commands.extend(build_commands(&ChipOp::RunMode, model)?);
    self.send_commands(&commands, 1, true, true, false, false)?;
    info!("Set GDAC to {} (coarse/fine = {}/{})", value,
          model.global_value("Vthin_AltCoarse")?,
          model.global_value("Vthin_AltFine")?);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bus::FeBus;
  use std::collections::HashMap;

  /// Mock bus recording every transfer
  struct MockBus {
    regs          : HashMap<u32, u32>,
    transfers     : Vec<(usize, Vec<u8>)>, // (bits, payload)
    ready         : bool,
  }

  impl MockBus {
    fn new() -> Self {
      Self {
        regs      : HashMap::new(),
        transfers : Vec::new(),
        ready     : true,
      }
    }
  }

  impl FeBus for MockBus {
    fn read_reg(&mut self, addr : u32) -> Result<u32, TransportError> {
      if addr == CMD_READY {
        return Ok(self.ready as u32);
      }
      Ok(*self.regs.get(&addr).unwrap_or(&0))
    }
    fn write_reg(&mut self, addr : u32, value : u32) -> Result<(), TransportError> {
      self.regs.insert(addr, value);
      Ok(())
    }
    fn write_command_memory(&mut self, data : &[u8]) -> Result<(), TransportError> {
      let bits = *self.regs.get(&CMD_SIZE).unwrap_or(&0) as usize;
      self.transfers.push((bits, data.to_vec()));
      Ok(())
    }
    fn fifo_occupancy(&mut self) -> Result<u32, TransportError> {
      Ok(0)
    }
    fn read_fifo(&mut self, _n_words : u32) -> Result<Vec<u32>, TransportError> {
      Ok(Vec::new())
    }
  }

  fn channel_with_window(window_bytes : usize)
    -> (CommandChannel<MockBus>, Arc<Mutex<MockBus>>) {
    let bus = Arc::new(Mutex::new(MockBus::new()));
    let channel = CommandChannel::with_memory_bytes(bus.clone(), window_bytes);
    (channel, bus)
  }

  #[test]
  fn one_window_means_one_transfer() {
    let (channel, bus) = channel_with_window(16); // 128 bits
    let commands = vec![BitCommand::zeros(30),
                       BitCommand::zeros(30),
                       BitCommand::zeros(30)];
    let n = channel.send_commands(&commands, 1, true, true, false, false).unwrap();
    assert_eq!(n, 1);
    let bus = bus.lock().unwrap();
    assert_eq!(bus.transfers.len(), 1);
    // 30+1+30+1+30 bits merged
    assert_eq!(bus.transfers[0].0, 92);
  }

  #[test]
  fn overflowing_sequences_split_within_the_window() {
    let (channel, bus) = channel_with_window(16); // 128 bits
    let commands : Vec<BitCommand> =
      (0..5).map(|_| BitCommand::zeros(60)).collect();
    let n = channel.send_commands(&commands, 1, true, true, false, false).unwrap();
    assert!(n >= 2);
    let bus = bus.lock().unwrap();
    assert_eq!(bus.transfers.len(), n);
    for (bits, _payload) in &bus.transfers {
      assert!(*bits <= 128);
    }
    // nothing lost: total payload bits minus separators
    let total : usize = bus.transfers.iter().map(|(bits, _)| *bits).sum();
    let separators = total - 5*60;
    assert_eq!(separators, 5 - n);
  }

  #[test]
  fn a_command_bigger_than_the_window_is_fatal() {
    let (channel, bus) = channel_with_window(16);
    let commands = vec![BitCommand::zeros(129)];
    assert_eq!(channel.send_commands(&commands, 1, true, true, false, false),
               Err(TransportError::CommandTooLong));
    assert!(bus.lock().unwrap().transfers.is_empty());
  }

  #[test]
  fn unconcatenated_commands_transfer_individually() {
    let (channel, bus) = channel_with_window(16);
    let commands = vec![BitCommand::zeros(10), BitCommand::zeros(20)];
    let n = channel.send_commands(&commands, 3, true, false, false, false).unwrap();
    assert_eq!(n, 2);
    let bus = bus.lock().unwrap();
    assert_eq!(bus.transfers.len(), 2);
    assert_eq!(bus.transfers[0].0, 10);
    assert_eq!(bus.transfers[1].0, 20);
    assert_eq!(*bus.regs.get(&CMD_REPEAT).unwrap(), 3);
  }

  #[test]
  fn ready_wait_is_bounded() {
    let (channel, bus) = channel_with_window(16);
    bus.lock().unwrap().ready = false;
    let commands = vec![BitCommand::zeros(8)];
    assert_eq!(channel.send_commands(&commands, 1, true, true, false, false),
               Err(TransportError::ReadyTimeout));
  }

  #[test]
  fn byte_padded_packing() {
    let (channel, bus) = channel_with_window(16);
    let commands = vec![BitCommand::zeros(5), BitCommand::zeros(9)];
    channel.send_commands(&commands, 1, true, true, true, false).unwrap();
    let bus = bus.lock().unwrap();
    // ceil(5/8)*8 + 8 + ceil(9/8)*8
    assert_eq!(bus.transfers[0].0, 8 + 8 + 16);
  }
}
