//! Translation of chip operations into bit-exact command
//! sequences
//!
//! `build_commands` is a pure function of the register model:
//! the scan logic mutates the model first, then asks for the
//! matching commands. The operation set is a closed enum, a
//! typo in a register name surfaces as `UnknownRegister` from
//! the model lookup, not as silently wrong bits.

use fei4_dataclasses::constants::{NDC, NROWS, DC_SHIFT_BITS};
use fei4_dataclasses::errors::ConfigError;

use crate::bitcmd::BitCommand;
use crate::chipregs::RegisterModel;
use crate::registers::*;

/// Colpr_Mode value addressing a single double column
pub const COLPR_MODE_SINGLE : u16 = 0;
/// Colpr_Mode value addressing all double columns at once
pub const COLPR_MODE_ALL    : u16 = 3;

/// Shift-outs needed to drain one 672 bit double column
/// register in 32 bit portions
pub const SHIFT_OUT_PULSES  : usize = DC_SHIFT_BITS / 32;

/// The operations the chip understands
#[derive(Debug, Clone, PartialEq)]
pub enum ChipOp {
  /// switch to configuration mode
  ConfMode,
  /// switch to run mode
  RunMode,
  GlobalReset,
  /// bunch counter reset
  Bcr,
  /// event counter reset
  Ecr,
  /// write the named global registers
  WrRegister { names : Vec<String> },
  /// write every writable global register
  WrAllRegisters,
  /// shift the named pixel registers into the matrix
  WrFrontend { names : Vec<String>, same_mask_for_all_dc : bool },
  /// shift a pixel register out of the given double columns
  RdFrontend { name : String, dcs : Vec<u8> },
  /// calibration pulse
  Cal,
  /// level 1 trigger
  Lv1,
  GlobalPulse { width : u8 },
  Zeros { length : usize },
}

fn slow_command(chip_address : u8, field2 : u64) -> BitCommand {
  BitCommand::new()
    .push_bits(CMD_HEADER, CMD_HEADER_BITS)
    .push_bits(FIELD1_SLOW, FIELD1_BITS)
    .push_bits(field2, FIELD2_BITS)
    .push_bits(chip_address as u64, CHIP_ADDRESS_BITS)
}

fn fast_command(field1 : u64) -> BitCommand {
  BitCommand::new()
    .push_bits(CMD_HEADER, CMD_HEADER_BITS)
    .push_bits(field1, FIELD1_BITS)
}

fn run_mode_command(chip_address : u8, run : bool) -> BitCommand {
  let mode = if run { RUNMODE_RUN } else { RUNMODE_CONF };
  slow_command(chip_address, FIELD2_RUN_MODE)
    .push_bits(mode, RUNMODE_BITS)
}

fn wr_register_command(model : &RegisterModel, address : u8, word : u16)
  -> BitCommand {
  slow_command(model.chip_address, FIELD2_WR_REGISTER)
    .push_bits(address as u64, REG_ADDRESS_BITS)
    .push_bits(word as u64, REG_DATA_BITS)
}

fn rd_register_command(model : &RegisterModel, address : u8) -> BitCommand {
  slow_command(model.chip_address, FIELD2_RD_REGISTER)
    .push_bits(address as u64, REG_ADDRESS_BITS)
}

fn global_pulse_command(chip_address : u8, width : u8) -> BitCommand {
  slow_command(chip_address, FIELD2_GLOBAL_PULSE)
    .push_bits(width as u64, PULSE_WIDTH_BITS)
}

/// Serialize one bit plane of one double column into the
/// 672 bit shift payload. The register snakes through the
/// column pair: left column top to bottom, right column
/// bottom to top.
fn dc_shift_payload(mask_plane : impl Fn(usize, usize) -> bool,
                    dc         : usize) -> BitCommand {
  let left  = 2*dc;
  let right = 2*dc + 1;
  let mut payload = BitCommand::new();
  for row in 0..NROWS {
    payload = payload.push_bits(mask_plane(left, row) as u64, 1);
  }
  for row in (0..NROWS).rev() {
    payload = payload.push_bits(mask_plane(right, row) as u64, 1);
  }
  payload
}

fn wr_frontend_command(model : &RegisterModel, payload : BitCommand)
  -> BitCommand {
  let mut command = slow_command(model.chip_address, FIELD2_WR_FRONTEND)
    .push_bits(0, REG_ADDRESS_BITS);
  for idx in 0..payload.len() {
    command = command.push_bits(payload.bit(idx) as u64, 1);
  }
  command
}

/// Commands selecting the pixel latch strobe
fn select_strobe(model : &RegisterModel, strobes : u16)
  -> Result<BitCommand, ConfigError> {
  let field = model.global_field("Pixel_Strobes")?;
  let word  = model.register_word_with(field.address,
                                       &[("Pixel_Strobes", strobes)])?;
  Ok(wr_register_command(model, field.address, word))
}

/// Commands selecting a double column (or all of them)
fn select_double_column(model : &RegisterModel, mode : u16, dc : u16)
  -> Result<BitCommand, ConfigError> {
  let field = model.global_field("Colpr_Addr")?;
  let word  = model.register_word_with(field.address,
                                       &[("Colpr_Mode", mode),
                                         ("Colpr_Addr", dc)])?;
  Ok(wr_register_command(model, field.address, word))
}

fn build_wr_frontend(model : &RegisterModel,
                     names : &[String],
                     same_mask_for_all_dc : bool)
  -> Result<Vec<BitCommand>, ConfigError> {
  let mut commands = Vec::<BitCommand>::new();
  for name in names {
    let reg  = model.pixel_register(name)?;
    let mask = model.pixel_mask(name)?;
    for plane in 0..reg.width {
      let strobe = 1u16 << (reg.latch_base + plane);
      commands.push(select_strobe(model, strobe)?);
      let plane_bit = |col : usize, row : usize| {
        (mask.cell(col, row) >> plane) & 0x1 == 0x1
      };
      if same_mask_for_all_dc {
        commands.push(select_double_column(model, COLPR_MODE_ALL, 0)?);
        commands.push(wr_frontend_command(model, dc_shift_payload(&plane_bit, 0)));
        commands.push(global_pulse_command(model.chip_address, 0));
      } else {
        for dc in 0..NDC {
          commands.push(select_double_column(model, COLPR_MODE_SINGLE, dc as u16)?);
          commands.push(wr_frontend_command(model, dc_shift_payload(&plane_bit, dc)));
          commands.push(global_pulse_command(model.chip_address, 0));
        }
      }
    }
  }
  // release the latch strobes again
  commands.push(select_strobe(model, 0)?);
  Ok(commands)
}

fn build_rd_frontend(model : &RegisterModel,
                     name  : &str,
                     dcs   : &[u8])
  -> Result<Vec<BitCommand>, ConfigError> {
  let reg = model.pixel_register(name)?;
  let mut commands = Vec::<BitCommand>::new();
  commands.push(select_strobe(model, 1u16 << reg.latch_base)?);
  for &dc in dcs {
    if dc as usize >= NDC {
      return Err(ConfigError::OutOfRange);
    }
    commands.push(select_double_column(model, COLPR_MODE_SINGLE, dc as u16)?);
    // each pulse shifts 32 bit out as address/value records
    for _ in 0..SHIFT_OUT_PULSES {
      commands.push(global_pulse_command(model.chip_address, 0));
    }
  }
  commands.push(select_strobe(model, 0)?);
  Ok(commands)
}

/// Build the command sequence for one chip operation
///
/// Pure function of the model - callers mutate the model
/// first and send the returned commands right after.
pub fn build_commands(op : &ChipOp, model : &RegisterModel)
  -> Result<Vec<BitCommand>, ConfigError> {
  match op {
    ChipOp::ConfMode => {
      Ok(vec![run_mode_command(model.chip_address, false)])
    }
    ChipOp::RunMode => {
      Ok(vec![run_mode_command(model.chip_address, true)])
    }
    ChipOp::GlobalReset => {
      Ok(vec![slow_command(model.chip_address, FIELD2_GLOBAL_RESET)])
    }
    ChipOp::Bcr => {
      Ok(vec![fast_command(FIELD1_BCR)])
    }
    ChipOp::Ecr => {
      Ok(vec![fast_command(FIELD1_ECR)])
    }
    ChipOp::Cal => {
      Ok(vec![fast_command(FIELD1_CAL)])
    }
    ChipOp::Lv1 => {
      Ok(vec![BitCommand::new().push_bits(CMD_LV1, CMD_LV1_BITS)])
    }
    ChipOp::GlobalPulse { width } => {
      Ok(vec![global_pulse_command(model.chip_address, *width)])
    }
    ChipOp::Zeros { length } => {
      Ok(vec![BitCommand::zeros(*length)])
    }
    ChipOp::WrRegister { names } => {
      let mut addresses = Vec::<u8>::new();
      for name in names {
        let field = model.global_field(name)?;
        if !addresses.contains(&field.address) {
          addresses.push(field.address);
        }
      }
      Ok(addresses.iter()
                  .map(|&addr| wr_register_command(model, addr,
                                                   model.register_word(addr)))
                  .collect())
    }
    ChipOp::WrAllRegisters => {
      Ok(model.writable_addresses()
              .iter()
              .map(|&addr| wr_register_command(model, addr,
                                               model.register_word(addr)))
              .collect())
    }
    ChipOp::WrFrontend { names, same_mask_for_all_dc } => {
      build_wr_frontend(model, names, *same_mask_for_all_dc)
    }
    ChipOp::RdFrontend { name, dcs } => {
      build_rd_frontend(model, name, dcs)
    }
  }
}

/// Read back a global register (the reply arrives as
/// address/value records in the word stream)
pub fn build_rd_register(model : &RegisterModel, name : &str)
  -> Result<BitCommand, ConfigError> {
  let field = model.global_field(name)?;
  Ok(rd_register_command(model, field.address))
}
