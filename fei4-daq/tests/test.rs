#[cfg(test)]
pub mod tests {

  use std::sync::{Arc,
                  Mutex};

  use fei4_dataclasses::errors::TransportError;
  use fei4_dataclasses::words::ChipFlavor;

  use fei4_daq::bitcmd::BitCommand;
  use fei4_daq::bus::FeBus;
  use fei4_daq::channel::CommandChannel;
  use fei4_daq::chipregs::RegisterModel;
  use fei4_daq::commands::{build_commands,
                           ChipOp};
  use fei4_daq::registers::{CMD_SIZE,
                            CMD_START,
                            CMD_READY};

  /// Minimal bus capturing what arrives in the command memory
  struct CaptureBus {
    memory   : Vec<Vec<u8>>,
    sizes    : Vec<u32>,
    starts   : u32,
  }

  impl CaptureBus {
    fn new() -> Self {
      Self {
        memory : Vec::new(),
        sizes  : Vec::new(),
        starts : 0,
      }
    }
  }

  impl FeBus for CaptureBus {
    fn read_reg(&mut self, addr : u32) -> Result<u32, TransportError> {
      if addr == CMD_READY {
        return Ok(1);
      }
      Ok(0)
    }
    fn write_reg(&mut self, addr : u32, value : u32) -> Result<(), TransportError> {
      if addr == CMD_SIZE {
        self.sizes.push(value);
      }
      if addr == CMD_START {
        self.starts += 1;
      }
      Ok(())
    }
    fn write_command_memory(&mut self, data : &[u8]) -> Result<(), TransportError> {
      self.memory.push(data.to_vec());
      Ok(())
    }
    fn fifo_occupancy(&mut self) -> Result<u32, TransportError> {
      Ok(0)
    }
    fn read_fifo(&mut self, _n_words : u32) -> Result<Vec<u32>, TransportError> {
      Ok(Vec::new())
    }
  }

  #[test]
  fn a_register_write_reaches_the_wire_bit_exact() {
    let bus = Arc::new(Mutex::new(CaptureBus::new()));
    let channel = CommandChannel::new(bus.clone());
    let mut model = RegisterModel::new(ChipFlavor::FeI4A, 0);
    model.set_global_value("PlsrDAC", 0x155).unwrap();

    let names = vec![String::from("PlsrDAC")];
    let commands = build_commands(&ChipOp::WrRegister { names }, &model).unwrap();
    channel.send_commands(&commands, 1, true, true, false, false).unwrap();

    let bus = bus.lock().unwrap();
    assert_eq!(bus.starts, 1);
    assert_eq!(bus.sizes, vec![39]);
    // 10110 1000 0010 0000 011111 + 16 register bits,
    // PlsrDelay (2) sits at offset 10 above PlsrDAC 0x155
    let word : u16 = (2 << 10) | 0x155;
    let expected = BitCommand::new()
      .push_bits(0b10110, 5)
      .push_bits(0b1000, 4)
      .push_bits(0b0010, 4)
      .push_bits(0, 4)
      .push_bits(31, 6)
      .push_bits(word as u64, 16);
    assert_eq!(bus.memory, vec![expected.to_bytes()]);
  }

  #[test]
  fn a_full_configuration_sequence_goes_through() {
    let bus = Arc::new(Mutex::new(CaptureBus::new()));
    let channel = CommandChannel::new(bus.clone());
    let mut model = RegisterModel::new(ChipFlavor::FeI4A, 0);
    channel.configure_global(&mut model).unwrap();
    assert!(model.is_synced());
    {
      let bus = bus.lock().unwrap();
      assert!(bus.starts >= 1);
      // every transfer respects the memory window
      for bits in &bus.sizes {
        assert!(*bits <= (2048 - 16)*8);
      }
    }
    // a global reset leaves the model unsynced again
    channel.global_reset(&mut model).unwrap();
    assert!(!model.is_synced());
  }

  #[test]
  fn trigger_replay_preload_does_not_start_the_sequencer() {
    let bus = Arc::new(Mutex::new(CaptureBus::new()));
    let channel = CommandChannel::new(bus.clone());
    let model = RegisterModel::new(ChipFlavor::FeI4A, 0);
    let delay = build_commands(&ChipOp::Zeros { length : 14 }, &model).unwrap();
    let lv1   = build_commands(&ChipOp::Lv1, &model).unwrap();
    let reply = delay[0].append(&lv1[0]);
    channel.preload_command(&reply).unwrap();
    let bus = bus.lock().unwrap();
    assert_eq!(bus.starts, 0);
    assert_eq!(bus.sizes, vec![20]);
    // 14 zeros, the separator and the 11101 trigger pattern
    assert_eq!(bus.memory[0], vec![0b00000000, 0b00000001, 0b11010000]);
  }
}
