//! Aggregate settings for the DAQ
//!
//! Everything the binary needs to run a scan, in one TOML
//! file: which chip we talk to, where the hardware is
//! mapped, where the data goes, and the scan parameters.

use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io::{Read,
              Write};

use fei4_dataclasses::words::ChipFlavor;

use crate::scan::ScanConfig;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DaqSettings {
  /// chip flavor, decides the data header splits
  pub chip_flavor  : ChipFlavor,
  /// 4 bit chip address on the command bus (8 = broadcast)
  pub chip_address : u8,
  /// control register file
  pub uio_ctrl     : String,
  /// receive FIFO window
  pub uio_data     : String,
  /// raw record files end up here
  pub data_dir     : String,
  /// short identifier used in the file names
  pub scan_id      : String,
  pub scan         : ScanConfig,
}

impl DaqSettings {

  pub fn new() -> Self {
    Self {
      chip_flavor  : ChipFlavor::FeI4A,
      chip_address : 0,
      uio_ctrl     : String::from("/dev/uio0"),
      uio_data     : String::from("/dev/uio1"),
      data_dir     : String::from("."),
      scan_id      : String::from("ext_trigger_scan"),
      scan         : ScanConfig::new(),
    }
  }

  pub fn from_toml_file(path : &str) -> Result<Self, Box<dyn Error>> {
    let mut file = File::open(path)?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    let settings : DaqSettings = toml::from_str(&content)?;
    Ok(settings)
  }

  pub fn to_toml_file(&self, path : &str) -> Result<(), Box<dyn Error>> {
    let content = toml::to_string_pretty(self)?;
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
  }
}

impl Default for DaqSettings {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for DaqSettings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match toml::to_string(self) {
      Ok(disp) => write!(f, "<DaqSettings:\n{}>", disp),
      Err(_)   => write!(f, "<DaqSettings: serialization error>"),
    }
  }
}
