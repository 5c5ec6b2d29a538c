//! # DAQ for the FE-I4 pixel front-end
//!
//! Configures the chip, runs the external trigger scan and
//! records the raw word stream. With `--analyze` the recorded
//! file is interpreted afterwards and a decoding summary is
//! printed.

use std::process::exit;
use std::sync::{Arc,
                Mutex};
use std::sync::atomic::Ordering;

extern crate fei4_daq;

use colored::Colorize;

use fei4_dataclasses::io::{get_runfilename,
                           RawRecordWriter};

use fei4_daq::bus::UioBus;
use fei4_daq::chipregs::RegisterModel;
use fei4_daq::scan::{analyze_raw_file,
                     ExtTriggerScan};
use fei4_daq::settings::DaqSettings;

#[macro_use] extern crate log;

extern crate clap;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
  /// Settings file (TOML). Defaults are used when omitted.
  #[arg(short, long)]
  settings : Option<String>,

  /// Write a default settings file to the given path and exit
  #[arg(long)]
  write_default_settings : Option<String>,

  /// Override the configured trigger maximum
  #[arg(long)]
  max_triggers : Option<u32>,

  /// Override the configured scan timeout (seconds)
  #[arg(long)]
  scan_timeout : Option<f64>,

  /// Interpret the recorded file after the scan
  #[arg(short, long)]
  analyze : bool,

  /// Show a trigger progress bar
  #[arg(short, long)]
  progress : bool,
}

fn main() {
  env_logger::init();
  let args = Args::parse();

  if let Some(path) = args.write_default_settings {
    match DaqSettings::new().to_toml_file(&path) {
      Ok(_)    => {
        println!("Wrote default settings to {}", path);
        exit(0);
      }
      Err(err) => {
        error!("Can not write settings file: {}", err);
        exit(1);
      }
    }
  }

  let mut settings = match args.settings {
    Some(ref path) => {
      match DaqSettings::from_toml_file(path) {
        Ok(settings) => settings,
        Err(err)     => {
          error!("Can not load settings from {}: {}", path, err);
          exit(1);
        }
      }
    }
    None => DaqSettings::new(),
  };
  if let Some(max_triggers) = args.max_triggers {
    settings.scan.max_triggers = max_triggers;
  }
  if let Some(scan_timeout) = args.scan_timeout {
    settings.scan.scan_timeout = scan_timeout;
  }

  println!("{}", "** FE-I4 DAQ **".green().bold());
  println!("{}", settings);

  let bus = Arc::new(Mutex::new(UioBus::new(&settings.uio_ctrl,
                                            &settings.uio_data)));
  let mut model = RegisterModel::new(settings.chip_flavor,
                                     settings.chip_address);
  let mut scan = ExtTriggerScan::new(bus, settings.scan.clone());

  // ctrl-c requests a graceful stop with the data flushed
  let stop_flag = scan.stop_flag();
  match signal_hook::flag::register(signal_hook::consts::SIGINT,
                                    stop_flag.clone()) {
    Ok(_)    => (),
    Err(err) => warn!("Can not register the SIGINT handler: {}", err),
  }
  match signal_hook::flag::register(signal_hook::consts::SIGTERM, stop_flag) {
    Ok(_)    => (),
    Err(err) => warn!("Can not register the SIGTERM handler: {}", err),
  }

  info!("Configuring the front-end");
  if let Err(err) = scan.channel().configure_global(&mut model) {
    error!("Global configuration failed: {}", err);
    exit(1);
  }
  if let Err(err) = scan.configure(&mut model) {
    error!("Scan configuration failed: {}", err);
    exit(1);
  }

  let file_name = get_runfilename(&settings.scan_id, 0);
  let file_path = format!("{}/{}", settings.data_dir, file_name);
  let mut writer = match RawRecordWriter::new(&file_path, &[]) {
    Ok(writer) => writer,
    Err(err)   => {
      error!("Can not open the raw record file {}: {}", file_path, err);
      exit(1);
    }
  };

  let stop_reason = match scan.run(&model, &mut writer, args.progress) {
    Ok(reason) => reason,
    Err(err)   => {
      error!("Scan failed: {}", err);
      // whatever was flushed before the failure stays on disk
      exit(1);
    }
  };
  println!("Run complete, stop reason: {}, {} chunks / {} words recorded",
           stop_reason, writer.n_chunks(), writer.n_words());
  if scan.stop_flag().load(Ordering::SeqCst) {
    info!("Run was ended by an external stop request");
  }

  let summary = serde_json::json!({
    "stop_reason" : stop_reason.to_string(),
    "n_chunks"    : writer.n_chunks(),
    "n_words"     : writer.n_words(),
  });
  if let Err(err) = std::fs::write(format!("{}.meta.json", file_path),
                                   summary.to_string()) {
    warn!("Can not write the run summary: {}", err);
  }

  if args.analyze {
    println!("Interpreting {} ...", file_path);
    match analyze_raw_file(&file_path,
                           settings.chip_flavor,
                           settings.scan.trig_count) {
      Ok(interpreter) => {
        interpreter.print_summary();
      }
      Err(err) => {
        error!("Interpretation failed: {}", err);
        exit(1);
      }
    }
  }
}
