//! The chip register model
//!
//! An owned, explicitly passed mirror of the chip state:
//! named fields of the global register file plus the pixel
//! registers with their 80x336 masks. The model is a
//! write-through cache - the scan logic mutates it and
//! immediately emits the matching write commands, and it has
//! to be re-synced after any hardware reset.
//!
//! Several named fields can share one 16bit register word;
//! the wire word for an address is the OR of all its fields.

use std::fmt;

use fei4_dataclasses::errors::ConfigError;
use fei4_dataclasses::words::ChipFlavor;

use crate::masks::PixelMask;

/// One named field of the global register file
///
/// `offset` is the bit position of the field's LSB within
/// the 16bit register word at `address`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct GlobalField {
  pub name     : &'static str,
  pub address  : u8,
  pub offset   : u8,
  pub width    : u8,
  pub value    : u16,
  pub readonly : bool,
}

impl GlobalField {

  pub fn max_value(&self) -> u16 {
    if self.width >= 16 {
      u16::MAX
    } else {
      (1u16 << self.width) - 1
    }
  }

  /// The field's contribution to its register word
  pub fn wire_bits(&self) -> u16 {
    (self.value & self.max_value()) << self.offset
  }
}

/// A pixel register: per-pixel latches of `width` bits
///
/// The mask stays unset until the scan logic assigns one,
/// writing an unset register is a configuration error.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelRegister {
  pub name       : &'static str,
  pub width      : u8,
  /// first pixel latch strobe index of this register
  pub latch_base : u8,
  pub mask       : Option<PixelMask>,
}

/// Default global register table
///
/// A representative subset of the global register file; the
/// fields the command and scan layers touch. Address/offset
/// pairs only need to be consistent, the chip-specific
/// address map is configuration, not code.
fn default_global_fields() -> Vec<GlobalField> {
  vec![
    GlobalField { name : "Trig_Count",      address :  2, offset : 12, width :  4, value :     0, readonly : false },
    GlobalField { name : "Conf_AddrEnable", address :  2, offset : 11, width :  1, value :     1, readonly : false },
    GlobalField { name : "ErrorMask_0",     address :  3, offset :  0, width : 16, value :     0, readonly : false },
    GlobalField { name : "ErrorMask_1",     address :  4, offset :  0, width : 16, value :     0, readonly : false },
    GlobalField { name : "Vthin_AltCoarse", address :  6, offset :  8, width :  8, value :     0, readonly : false },
    GlobalField { name : "Vthin_AltFine",   address :  6, offset :  0, width :  8, value :   150, readonly : false },
    GlobalField { name : "Pixel_Strobes",   address : 13, offset :  0, width : 14, value :     0, readonly : false },
    GlobalField { name : "S0",              address : 13, offset : 15, width :  1, value :     0, readonly : false },
    GlobalField { name : "S1",              address : 13, offset : 14, width :  1, value :     0, readonly : false },
    GlobalField { name : "Colpr_Mode",      address : 22, offset :  8, width :  2, value :     0, readonly : false },
    GlobalField { name : "Colpr_Addr",      address : 22, offset :  2, width :  6, value :     0, readonly : false },
    GlobalField { name : "Trig_Lat",        address : 25, offset :  0, width :  8, value :   210, readonly : false },
    GlobalField { name : "CalPulseWidth",   address : 26, offset :  8, width :  8, value :    10, readonly : false },
    GlobalField { name : "CalPulseDelay",   address : 26, offset :  0, width :  8, value :     0, readonly : false },
    GlobalField { name : "ReadErrorReq",    address : 27, offset : 12, width :  1, value :     0, readonly : false },
    GlobalField { name : "SR_Clr",          address : 27, offset : 11, width :  1, value :     0, readonly : false },
    GlobalField { name : "GateHitOr",       address : 27, offset :  9, width :  1, value :     0, readonly : false },
    GlobalField { name : "PlsrDAC",         address : 31, offset :  0, width : 10, value :     0, readonly : false },
    GlobalField { name : "PlsrDelay",       address : 31, offset : 10, width :  6, value :     2, readonly : false },
    GlobalField { name : "Chip_SN",         address : 35, offset :  0, width : 16, value :     0, readonly : true  },
  ]
}

/// Default pixel register table. Latch strobe indices are
/// consecutive over the bit planes.
fn default_pixel_registers() -> Vec<PixelRegister> {
  vec![
    PixelRegister { name : "Enable",       width : 1, latch_base :  0, mask : None },
    PixelRegister { name : "TDAC",         width : 5, latch_base :  1, mask : None },
    PixelRegister { name : "C_High",       width : 1, latch_base :  6, mask : None },
    PixelRegister { name : "C_Low",        width : 1, latch_base :  7, mask : None },
    PixelRegister { name : "FDAC",         width : 4, latch_base :  8, mask : None },
    PixelRegister { name : "EnableDigInj", width : 1, latch_base : 12, mask : None },
    PixelRegister { name : "Imon",         width : 1, latch_base : 13, mask : None },
  ]
}

/// Owned mirror of the chip configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterModel {
  pub flavor       : ChipFlavor,
  pub chip_address : u8,
  globals          : Vec<GlobalField>,
  pixels           : Vec<PixelRegister>,
  synced           : bool,
}

impl RegisterModel {

  pub fn new(flavor : ChipFlavor, chip_address : u8) -> Self {
    Self {
      flavor,
      chip_address : chip_address & 0xF,
      globals      : default_global_fields(),
      pixels       : default_pixel_registers(),
      synced       : false,
    }
  }

  pub fn global_field(&self, name : &str) -> Result<&GlobalField, ConfigError> {
    self.globals.iter()
                .find(|field| field.name == name)
                .ok_or(ConfigError::UnknownRegister)
  }

  pub fn global_value(&self, name : &str) -> Result<u16, ConfigError> {
    Ok(self.global_field(name)?.value)
  }

  /// Set a named field. The value has to fit the declared
  /// width, truncation is an error here - never silent.
  pub fn set_global_value(&mut self, name : &str, value : u16)
    -> Result<(), ConfigError> {
    let field = self.globals.iter_mut()
                            .find(|field| field.name == name)
                            .ok_or(ConfigError::UnknownRegister)?;
    if value > field.max_value() {
      return Err(ConfigError::ValueTooWide);
    }
    field.value = value;
    Ok(())
  }

  /// The 16bit wire word for a register address: OR of all
  /// fields living at that address
  pub fn register_word(&self, address : u8) -> u16 {
    self.globals.iter()
                .filter(|field| field.address == address)
                .fold(0u16, |word, field| word | field.wire_bits())
  }

  /// Wire word with some fields overridden, without touching
  /// the model. Used by the command builder to address
  /// double columns while staying a pure function.
  pub fn register_word_with(&self,
                            address   : u8,
                            overrides : &[(&str, u16)])
    -> Result<u16, ConfigError> {
    let mut word = 0u16;
    for field in self.globals.iter().filter(|field| field.address == address) {
      let mut value = field.value;
      for &(name, override_value) in overrides {
        if field.name == name {
          if override_value > field.max_value() {
            return Err(ConfigError::ValueTooWide);
          }
          value = override_value;
        }
      }
      word |= (value & field.max_value()) << field.offset;
    }
    // overrides must name fields at this address
    for &(name, _) in overrides {
      let field = self.global_field(name)?;
      if field.address != address {
        return Err(ConfigError::UnknownRegister);
      }
    }
    Ok(word)
  }

  /// All distinct writable register addresses, ascending
  pub fn writable_addresses(&self) -> Vec<u8> {
    let mut addresses : Vec<u8> =
      self.globals.iter()
                  .filter(|field| !field.readonly)
                  .map(|field| field.address)
                  .collect();
    addresses.sort();
    addresses.dedup();
    addresses
  }

  pub fn pixel_register(&self, name : &str) -> Result<&PixelRegister, ConfigError> {
    self.pixels.iter()
               .find(|reg| reg.name == name)
               .ok_or(ConfigError::UnknownRegister)
  }

  /// The mask of a pixel register; MaskNotSet until the
  /// scan logic assigned one
  pub fn pixel_mask(&self, name : &str) -> Result<&PixelMask, ConfigError> {
    self.pixel_register(name)?
        .mask.as_ref()
        .ok_or(ConfigError::MaskNotSet)
  }

  pub fn set_pixel_mask(&mut self, name : &str, mask : PixelMask)
    -> Result<(), ConfigError> {
    let reg = self.pixels.iter_mut()
                         .find(|reg| reg.name == name)
                         .ok_or(ConfigError::UnknownRegister)?;
    reg.mask = Some(mask);
    Ok(())
  }

  pub fn pixel_register_names(&self) -> Vec<&'static str> {
    self.pixels.iter().map(|reg| reg.name).collect()
  }

  /// Split a threshold DAC value over the coarse/fine pair.
  /// The two flavors cut at different bits.
  pub fn set_gdac(&mut self, value : u16) -> Result<(), ConfigError> {
    let fine   = value & 0xFF;
    let coarse = match self.flavor {
      ChipFlavor::FeI4A => value >> 8,
      // FE-I4B only takes every second coarse value
      ChipFlavor::FeI4B => (value >> 7) & !0x01,
    };
    self.set_global_value("Vthin_AltCoarse", coarse)?;
    self.set_global_value("Vthin_AltFine", fine)?;
    Ok(())
  }

  /// The model no longer mirrors the chip, e.g. after a
  /// global reset. Builders keep working, but the scan
  /// driver has to reconfigure before trusting it.
  pub fn invalidate(&mut self) {
    self.synced = false;
  }

  pub fn mark_synced(&mut self) {
    self.synced = true;
  }

  pub fn is_synced(&self) -> bool {
    self.synced
  }
}

impl fmt::Display for RegisterModel {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<RegisterModel: {} chip {} - {} global fields, {} pixel registers, synced {}>",
           self.flavor, self.chip_address, self.globals.len(),
           self.pixels.len(), self.synced)
  }
}
