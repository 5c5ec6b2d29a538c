//! The external trigger scan driver
//!
//! Configures the enable/hitbus masks for the selected
//! column/row window, arms the trigger FSM and runs the
//! polling loop until one of the stop conditions fires.
//!
//! Stop conditions, checked once per iteration in priority
//! order:
//!   1. RX desync or nonzero error/discard counters
//!   2. configured trigger maximum reached
//!   3. wall clock scan timeout
//!   4. no data for timeout_no_data seconds - but only after
//!      the first data has been seen, a scan on a slow
//!      external source must not die before anything happens

use std::fmt;
use std::sync::{Arc,
                Mutex};
use std::sync::atomic::{AtomicBool,
                        Ordering};
use std::thread;
use std::time::{Duration,
                Instant};

use indicatif::{ProgressBar,
                ProgressStyle};

use fei4_dataclasses::errors::{SerializationError,
                               TransportError};
use fei4_dataclasses::io::{RawRecordReader,
                           RawRecordWriter};
use fei4_dataclasses::words::ChipFlavor;
use fei4_dataclasses::WordInterpreter;

use crate::bus::FeBus;
use crate::channel::{ChannelError,
                     CommandChannel};
use crate::chipregs::RegisterModel;
use crate::commands::{build_commands,
                      ChipOp};
use crate::masks::{MaskOp,
                   PixelMask};
use crate::readout::ReadoutLoop;

/// Scan parameters, loadable from the settings file
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ScanConfig {
  /// 0: lemo only, 1: tlu no handshake, 2: tlu simple
  /// handshake, 3: tlu data handshake
  pub trigger_mode      : u8,
  /// chip Trig_Lat value
  pub trigger_latency   : u16,
  /// zero bits between external trigger and LV1
  pub trigger_delay     : u16,
  /// consecutive bcid windows per trigger (0 means 16)
  pub trig_count        : u8,
  /// 1-based inclusive column window
  pub col_span          : [u8; 2],
  /// 1-based inclusive row window
  pub row_span          : [u16; 2],
  /// seconds without data before the run stops, once data
  /// has been seen
  pub timeout_no_data   : f64,
  /// wall clock budget for the whole scan, seconds
  pub scan_timeout      : f64,
  /// stop when this many triggers have been collected
  pub max_triggers      : u32,
  pub enable_hitbus     : bool,
  pub enable_tdc        : bool,
  /// poll interval of the scan loop and the readout, seconds
  pub readout_interval  : f64,
  /// graceful FIFO drain budget when the readout stops, seconds
  pub readout_stop_timeout : f64,
  /// push the scan deadline by the scheduler jitter while
  /// the system has been idle for more than 10 s (soft
  /// policy, see DESIGN.md)
  pub extend_scan_timeout_when_idle : bool,
}

impl ScanConfig {

  pub fn new() -> Self {
    Self {
      trigger_mode      : 0,
      trigger_latency   : 232,
      trigger_delay     : 14,
      trig_count        : 0,
      col_span          : [1, 80],
      row_span          : [1, 336],
      timeout_no_data   : 10.0,
      scan_timeout      : 60.0,
      max_triggers      : 10000,
      enable_hitbus     : false,
      enable_tdc        : false,
      readout_interval  : 0.05,
      readout_stop_timeout : 10.0,
      extend_scan_timeout_when_idle : true,
    }
  }
}

impl Default for ScanConfig {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for ScanConfig {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match toml::to_string(self) {
      Ok(disp) => write!(f, "<ScanConfig:\n{}>", disp),
      Err(_)   => write!(f, "<ScanConfig: serialization error>"),
    }
  }
}

/// Why a run ended. All of these are normal, logged
/// termination causes, not errors.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum StopReason {
  RxError,
  MaxTriggers,
  ScanTimeout,
  NoDataTimeout,
  UserStop,
}

impl fmt::Display for StopReason {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      StopReason::RxError       => "rx_error",
      StopReason::MaxTriggers   => "max_triggers",
      StopReason::ScanTimeout   => "scan_timeout",
      StopReason::NoDataTimeout => "no_data_timeout",
      StopReason::UserStop      => "user_stop",
    };
    write!(f, "{}", repr)
  }
}

/// Drives one external trigger scan
pub struct ExtTriggerScan<B : FeBus + 'static> {
  bus       : Arc<Mutex<B>>,
  channel   : CommandChannel<B>,
  readout   : ReadoutLoop<B>,
  config    : ScanConfig,
  /// external stop request (ctrl-c)
  stop_flag : Arc<AtomicBool>,
}

impl<B : FeBus + 'static> ExtTriggerScan<B> {

  pub fn new(bus : Arc<Mutex<B>>, config : ScanConfig) -> Self {
    let interval = Duration::from_secs_f64(config.readout_interval);
    Self {
      bus       : bus.clone(),
      channel   : CommandChannel::new(bus.clone()),
      readout   : ReadoutLoop::new(bus, interval),
      config,
      stop_flag : Arc::new(AtomicBool::new(false)),
    }
  }

  /// The flag a signal handler can set to end the run
  pub fn stop_flag(&self) -> Arc<AtomicBool> {
    self.stop_flag.clone()
  }

  pub fn channel(&self) -> &CommandChannel<B> {
    &self.channel
  }

  pub fn readout(&self) -> &ReadoutLoop<B> {
    &self.readout
  }

  fn with_bus<T>(&self,
                 action : impl FnOnce(&mut B) -> Result<T, TransportError>)
    -> Result<T, TransportError> {
    let mut bus = self.bus.lock().expect("bus lock poisoned");
    action(&mut bus)
  }

  /// Write the scan masks and trigger registers to the chip
  ///
  /// Enable is restricted to the configured column/row box
  /// (AND with whatever is enabled already), the hitbus Imon
  /// mask opens the same box when requested, injection
  /// capacitors are disabled for source/trigger data taking.
  pub fn configure(&self, model : &mut RegisterModel)
    -> Result<(), ChannelError> {
    let config  = &self.config;
    let columns = [config.col_span[0], config.col_span[1]];
    let rows    = [config.row_span[0], config.row_span[1]];

    let mut commands = build_commands(&ChipOp::ConfMode, model)?;

    let box_mask = PixelMask::box_mask(&columns, &rows, 0, 1)?;
    let enable   = match model.pixel_mask("Enable") {
      Ok(current) => box_mask.combine(current, MaskOp::And),
      Err(_)      => box_mask,
    };
    model.set_pixel_mask("Enable", enable)?;
    commands.extend(build_commands(&ChipOp::WrFrontend {
      names : vec![String::from("Enable")],
      same_mask_for_all_dc : false,
    }, model)?);

    let imon = if config.enable_hitbus {
      let hitbus_box = PixelMask::box_mask(&columns, &rows, 1, 0)?;
      match model.pixel_mask("Imon") {
        Ok(current) => hitbus_box.combine(current, MaskOp::Or),
        Err(_)      => hitbus_box,
      }
    } else {
      PixelMask::filled(1)
    };
    model.set_pixel_mask("Imon", imon)?;
    commands.extend(build_commands(&ChipOp::WrFrontend {
      names : vec![String::from("Imon")],
      same_mask_for_all_dc : false,
    }, model)?);

    // no charge injection during trigger scans
    model.set_pixel_mask("C_High", PixelMask::filled(0))?;
    model.set_pixel_mask("C_Low", PixelMask::filled(0))?;
    commands.extend(build_commands(&ChipOp::WrFrontend {
      names : vec![String::from("C_High"), String::from("C_Low")],
      same_mask_for_all_dc : true,
    }, model)?);

    model.set_global_value("Trig_Lat", config.trigger_latency)?;
    model.set_global_value("Trig_Count", config.trig_count as u16)?;
    commands.extend(build_commands(&ChipOp::WrRegister {
      names : vec![String::from("Trig_Lat"), String::from("Trig_Count")],
    }, model)?);

    commands.extend(build_commands(&ChipOp::RunMode, model)?);
    self.channel.send_commands(&commands, 1, true, true, false, false)?;
    Ok(())
  }

  /// Run the scan loop until a stop condition fires
  ///
  /// Every chunk from the readout queue goes to the raw
  /// record file; the run always ends with a drained queue
  /// and a recorded stop reason.
  pub fn run(&mut self,
             model         : &RegisterModel,
             writer        : &mut RawRecordWriter,
             show_progress : bool) -> Result<StopReason, ChannelError> {
    let config   = self.config.clone();
    let interval = Duration::from_secs_f64(config.readout_interval);

    if let Err(err) = self.readout.start() {
      error!("Can not start the readout loop: {}", err);
      return Err(ChannelError::Transport(TransportError::BusError));
    }
    let chunk_rx = self.readout.receiver();

    // preload the trigger reply: delay plus LV1, replayed by
    // the FSM on every external trigger
    let delay = build_commands(&ChipOp::Zeros {
      length : config.trigger_delay as usize,
    }, model)?;
    let lv1   = build_commands(&ChipOp::Lv1, model)?;
    let reply = delay[0].append(&lv1[0]);
    self.channel.preload_command(&reply)?;

    self.with_bus(|bus| {
      bus.enable_tdc(config.enable_tdc)?;
      bus.set_trigger_mode(config.trigger_mode)?;
      bus.reset_trigger_counter()?;
      bus.enable_ext_trigger(true)
    })?;

    let progress = if show_progress {
      let bar = ProgressBar::new(config.max_triggers as u64);
      let template = "[{elapsed_precise}] {msg} {spinner} {bar:60.green/grey} {pos:>7}/{len:7}";
      if let Ok(style) = ProgressStyle::with_template(template) {
        bar.set_style(style);
      }
      bar.set_message("TRIGGERS");
      bar
    } else {
      ProgressBar::hidden()
    };

    let mut wait_for_first_trigger = true;
    let scan_start          = Instant::now();
    let mut scan_deadline   = scan_start + Duration::from_secs_f64(config.scan_timeout);
    let mut iteration_start = Instant::now();
    let mut saw_data_at     = Instant::now();
    let mut saw_no_data_at  = Instant::now();

    let stop_reason = 'scan: loop {
      if self.stop_flag.load(Ordering::SeqCst) {
        info!("Stop requested, stopping scan");
        break 'scan StopReason::UserStop;
      }
      thread::sleep(interval);
      let iteration_latency = iteration_start.elapsed();
      iteration_start = Instant::now();

      // (1) rx health
      match self.readout.rx_errors_present() {
        Ok(false) => (),
        Ok(true)  => {
          error!("RX desync or error counters nonzero, stopping scan");
          self.readout.print_readout_status();
          break 'scan StopReason::RxError;
        }
        Err(err)  => {
          error!("Can not query RX status: {}", err);
          break 'scan StopReason::RxError;
        }
      }

      // (2) trigger budget
      let trigger_number = match self.with_bus(|bus| bus.trigger_number()) {
        Ok(trigger_number) => trigger_number,
        Err(err) => {
          error!("Can not read the trigger counter: {}", err);
          break 'scan StopReason::RxError;
        }
      };
      progress.set_position(trigger_number.min(config.max_triggers) as u64);
      if trigger_number >= config.max_triggers {
        info!("Reached maximum triggers, stopping scan");
        break 'scan StopReason::MaxTriggers;
      }

      // (3) wall clock budget
      if Instant::now() > scan_deadline {
        info!("Reached maximum scan time, stopping scan");
        break 'scan StopReason::ScanTimeout;
      }

      // (4) drain the queue; empty chunks only tick the clock
      let mut got_data = false;
      while let Ok(chunk) = chunk_rx.try_recv() {
        if !chunk.is_empty() {
          got_data = true;
        }
        writer.append(&chunk, &[])?;
      }
      let now = Instant::now();
      if got_data {
        saw_data_at = now;
        if wait_for_first_trigger {
          info!("Taking data...");
          wait_for_first_trigger = false;
        }
      } else {
        if !wait_for_first_trigger {
          let no_data_budget = Duration::from_secs_f64(config.timeout_no_data);
          if saw_no_data_at > saw_data_at + no_data_budget {
            info!("Reached no data timeout, stopping scan");
            break 'scan StopReason::NoDataTimeout;
          }
          saw_no_data_at = now;
        }
        // soft correction for scheduler jitter while long
        // idle: only the latency beyond the nominal interval
        // counts, the deadline itself stays in force
        if config.extend_scan_timeout_when_idle
           && now > saw_data_at + Duration::from_secs(10) {
          scan_deadline += iteration_latency.saturating_sub(interval);
        }
      }
    };

    // shut the trigger path down and drain what is left
    if let Err(err) = self.with_bus(|bus| {
      bus.enable_ext_trigger(false)?;
      bus.enable_tdc(false)?;
      bus.set_trigger_mode(0)
    }) {
      error!("Can not disarm the trigger FSM: {}", err);
    }
    progress.finish();
    match self.with_bus(|bus| bus.trigger_number()) {
      Ok(total) => info!("Total triggers collected: {}", total),
      Err(_)    => (),
    }
    let drain = Duration::from_secs_f64(config.readout_stop_timeout);
    if let Err(err) = self.readout.stop(drain) {
      error!("Readout stop failed: {}", err);
    }
    while let Ok(chunk) = chunk_rx.try_recv() {
      writer.append(&chunk, &[])?;
    }
    writer.flush()?;
    info!("Scan done after {:.1} s, stop reason: {}",
          scan_start.elapsed().as_secs_f64(), stop_reason);
    Ok(stop_reason)
  }
}

/// Interpret a persisted raw record file
pub fn analyze_raw_file(path       : &str,
                        flavor     : ChipFlavor,
                        trig_count : u8)
  -> Result<WordInterpreter, SerializationError> {
  let mut reader = RawRecordReader::new(path)?;
  let mut interpreter = WordInterpreter::new(flavor);
  interpreter.set_trig_count(trig_count);
  while let Some((chunk, _values)) = reader.next_chunk()? {
    interpreter.interpret_chunk(&chunk);
  }
  interpreter.finalize();
  Ok(interpreter)
}

#[cfg(test)]
mod tests {
  use super::*;
  use fei4_dataclasses::words::{ChipFlavor,
                                DataHeader,
                                DataRecord};
  use crate::registers::{TRG_COUNTER,
                         RX_BASE,
                         RX_SYNC_OFF,
                         RX_8B10B_ERR_OFF,
                         RX_DISCARD_OFF,
                         CMD_READY,
                         FIFO_SIZE};

  /// A bus faking a healthy chip: triggers tick up at a
  /// fixed rate, the FIFO yields a canned event per read.
  struct FakeChip {
    trigger_number   : u32,
    triggers_per_poll : u32,
    /// halfword occupancy returned per poll, 0 = silent
    occupancy        : u32,
    desync           : bool,
    event_lvl1id     : u16,
  }

  impl FakeChip {
    fn new() -> Self {
      Self {
        trigger_number    : 0,
        triggers_per_poll : 0,
        occupancy         : 0,
        desync            : false,
        event_lvl1id      : 0,
      }
    }
  }

  impl FeBus for FakeChip {
    fn read_reg(&mut self, addr : u32) -> Result<u32, TransportError> {
      if addr == TRG_COUNTER {
        self.trigger_number += self.triggers_per_poll;
        return Ok(self.trigger_number);
      }
      if addr == CMD_READY {
        return Ok(1);
      }
      if addr == FIFO_SIZE {
        return Ok(self.occupancy);
      }
      for base in RX_BASE {
        if addr == base + RX_SYNC_OFF {
          return Ok(!self.desync as u32);
        }
        if addr == base + RX_8B10B_ERR_OFF || addr == base + RX_DISCARD_OFF {
          return Ok(0);
        }
      }
      Ok(0)
    }
    fn write_reg(&mut self, _addr : u32, _value : u32) -> Result<(), TransportError> {
      Ok(())
    }
    fn write_command_memory(&mut self, _data : &[u8]) -> Result<(), TransportError> {
      Ok(())
    }
    fn fifo_occupancy(&mut self) -> Result<u32, TransportError> {
      Ok(self.occupancy)
    }
    fn read_fifo(&mut self, n_words : u32) -> Result<Vec<u32>, TransportError> {
      let mut words = Vec::with_capacity(n_words as usize);
      let mut idx = 0u32;
      while idx < n_words {
        self.event_lvl1id = (self.event_lvl1id + 1) & 0x7F;
        words.push(DataHeader {
          channel : 1,
          flag    : false,
          lvl1id  : self.event_lvl1id,
          bcid    : 0,
        }.to_word(ChipFlavor::FeI4A));
        idx += 1;
        if idx < n_words {
          words.push(DataRecord {
            channel : 1,
            column  : 3,
            row     : 30,
            tot1    : 5,
            tot2    : 15,
          }.to_word());
          idx += 1;
        }
      }
      Ok(words)
    }
  }

  fn fast_config() -> ScanConfig {
    let mut config = ScanConfig::new();
    config.readout_interval     = 0.005;
    config.readout_stop_timeout = 0.05;
    config.scan_timeout         = 30.0;
    config.timeout_no_data      = 0.05;
    config.max_triggers         = 20;
    config
  }

  fn tmp_writer(tag : &str) -> (RawRecordWriter, String) {
    let mut path = std::env::temp_dir();
    path.push(format!("fei4_scan_test_{}_{}.f4raw", std::process::id(), tag));
    let path = path.to_string_lossy().to_string();
    (RawRecordWriter::new(&path, &[]).unwrap(), path)
  }

  fn scan_with(chip : FakeChip, config : ScanConfig)
    -> (ExtTriggerScan<FakeChip>, Arc<Mutex<FakeChip>>) {
    let bus = Arc::new(Mutex::new(chip));
    (ExtTriggerScan::new(bus.clone(), config), bus)
  }

  #[test]
  fn max_triggers_stops_on_the_boundary_iteration() {
    let mut chip = FakeChip::new();
    chip.triggers_per_poll = 5;
    chip.occupancy = 8;
    let (mut scan, bus) = scan_with(chip, fast_config());
    let model = RegisterModel::new(ChipFlavor::FeI4A, 0);
    let (mut writer, path) = tmp_writer("maxtrig");
    let reason = scan.run(&model, &mut writer, false).unwrap();
    assert_eq!(reason, StopReason::MaxTriggers);
    // the loop reads 5,10,15,20 and stops right at the
    // boundary; only the final summary read follows. One
    // iteration too late would leave the counter at 30.
    assert_eq!(bus.lock().unwrap().trigger_number, 25);
    std::fs::remove_file(&path).ok();
  }

  #[test]
  fn no_data_timeout_needs_first_data() {
    // data flows briefly, then the source goes quiet
    let mut chip = FakeChip::new();
    chip.occupancy = 8;
    let config = fast_config();
    let (mut scan, bus) = scan_with(chip, config);
    let model = RegisterModel::new(ChipFlavor::FeI4A, 0);
    let (mut writer, path) = tmp_writer("nodata");
    let bus_clone = bus.clone();
    let silencer = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(40));
      bus_clone.lock().unwrap().occupancy = 0;
    });
    let reason = scan.run(&model, &mut writer, false).unwrap();
    silencer.join().unwrap();
    assert_eq!(reason, StopReason::NoDataTimeout);
    assert!(writer.n_words() > 0);
    std::fs::remove_file(&path).ok();
  }

  #[test]
  fn without_any_data_only_the_scan_timeout_fires() {
    let chip = FakeChip::new(); // forever silent
    let mut config = fast_config();
    config.scan_timeout = 0.15;
    let (mut scan, _bus) = scan_with(chip, config);
    let model = RegisterModel::new(ChipFlavor::FeI4A, 0);
    let (mut writer, path) = tmp_writer("timeout");
    let started = Instant::now();
    let reason = scan.run(&model, &mut writer, false).unwrap();
    assert_eq!(reason, StopReason::ScanTimeout);
    // well past several timeout_no_data periods
    assert!(started.elapsed() >= Duration::from_millis(150));
    std::fs::remove_file(&path).ok();
  }

  #[test]
  fn rx_desync_aborts_with_priority() {
    let mut chip = FakeChip::new();
    chip.desync = true;
    chip.occupancy = 8;
    let (mut scan, _bus) = scan_with(chip, fast_config());
    let model = RegisterModel::new(ChipFlavor::FeI4A, 0);
    let (mut writer, path) = tmp_writer("desync");
    let reason = scan.run(&model, &mut writer, false).unwrap();
    assert_eq!(reason, StopReason::RxError);
    std::fs::remove_file(&path).ok();
  }

  #[test]
  fn user_stop_flag_ends_the_run() {
    let mut chip = FakeChip::new();
    chip.occupancy = 4;
    let (mut scan, _bus) = scan_with(chip, fast_config());
    let model = RegisterModel::new(ChipFlavor::FeI4A, 0);
    let (mut writer, path) = tmp_writer("userstop");
    let flag = scan.stop_flag();
    let stopper = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(30));
      flag.store(true, Ordering::SeqCst);
    });
    let reason = scan.run(&model, &mut writer, false).unwrap();
    stopper.join().unwrap();
    assert_eq!(reason, StopReason::UserStop);
    std::fs::remove_file(&path).ok();
  }

  #[test]
  fn recorded_scan_interprets_end_to_end() {
    let mut chip = FakeChip::new();
    chip.occupancy = 8;
    chip.triggers_per_poll = 2;
    let (mut scan, _bus) = scan_with(chip, fast_config());
    let mut model = RegisterModel::new(ChipFlavor::FeI4A, 0);
    scan.configure(&mut model).unwrap();
    let (mut writer, path) = tmp_writer("endtoend");
    let reason = scan.run(&model, &mut writer, false).unwrap();
    assert_eq!(reason, StopReason::MaxTriggers);
    let interpreter = analyze_raw_file(&path, ChipFlavor::FeI4A, 0).unwrap();
    assert!(interpreter.n_events() > 0);
    assert!(interpreter.hits().len() > 0);
    // every fake data record sits at column 3, row 30
    assert!(interpreter.hits().iter()
                       .all(|hit| hit.column == 3 && hit.row == 30));
    std::fs::remove_file(&path).ok();
  }
}
