//! The polling readout loop
//!
//! A worker thread drains the receive FIFO once per interval
//! into timestamped `RawWordChunk`s on a channel. The consumer
//! (the scan driver) polls that channel in its own iteration,
//! there is no pushed stream.
//!
//! Lifecycle: Idle -> Running -> Stopping -> Idle. Stopping is
//! entered by `stop()` (graceful drain with timeout) or by the
//! worker itself on any bus error - hardware errors are fatal
//! for the run, never silently retried.

use std::sync::{Arc,
                Mutex};
use std::sync::atomic::{AtomicBool,
                        Ordering};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration,
                Instant};

use chrono::Utc;

use crossbeam_channel::{unbounded,
                        Receiver,
                        Sender};

use fei4_dataclasses::chunk::RawWordChunk;
use fei4_dataclasses::constants::NCHANNELS;
use fei4_dataclasses::errors::ReadoutError;

use crate::bus::FeBus;

/// Seconds since the epoch, as the chunk timestamps store it
pub fn get_float_time() -> f64 {
  Utc::now().timestamp_micros() as f64 * 1e-6
}

/// Drains the receive FIFO into the chunk queue
pub struct ReadoutLoop<B : FeBus + 'static> {
  bus       : Arc<Mutex<B>>,
  interval  : Duration,
  chunk_tx  : Sender<RawWordChunk>,
  chunk_rx  : Receiver<RawWordChunk>,
  stop_flag : Arc<AtomicBool>,
  worker    : Option<JoinHandle<()>>,
}

impl<B : FeBus + 'static> ReadoutLoop<B> {

  pub fn new(bus : Arc<Mutex<B>>, interval : Duration) -> Self {
    let (chunk_tx, chunk_rx) = unbounded::<RawWordChunk>();
    Self {
      bus,
      interval,
      chunk_tx,
      chunk_rx,
      stop_flag : Arc::new(AtomicBool::new(false)),
      worker    : None,
    }
  }

  /// The consuming end of the chunk queue
  pub fn receiver(&self) -> Receiver<RawWordChunk> {
    self.chunk_rx.clone()
  }

  pub fn is_running(&self) -> bool {
    self.worker.is_some()
  }

  /// Start polling
  ///
  /// Clears the pending chunk queue, resets the receive FIFO
  /// and the RX counters, then spawns the worker.
  pub fn start(&mut self) -> Result<(), ReadoutError> {
    if self.worker.is_some() {
      return Err(ReadoutError::AlreadyRunning);
    }
    while self.chunk_rx.try_recv().is_ok() {
      // drop stale chunks of the previous run
    }
    {
      let mut bus = self.bus.lock().expect("bus lock poisoned");
      bus.reset_rx().map_err(|_| ReadoutError::BusError)?;
      bus.reset_fifo().map_err(|_| ReadoutError::BusError)?;
    }
    self.stop_flag.store(false, Ordering::SeqCst);
    let bus       = self.bus.clone();
    let chunk_tx  = self.chunk_tx.clone();
    let stop_flag = self.stop_flag.clone();
    let interval  = self.interval;
    info!("Starting readout");
    self.worker = Some(thread::spawn(move || {
      worker_loop(bus, chunk_tx, stop_flag, interval);
    }));
    Ok(())
  }

  /// Stop polling
  ///
  /// Waits up to `timeout` for the FIFO to reach and stay at
  /// zero occupancy over consecutive polls, then terminates
  /// the worker regardless.
  pub fn stop(&mut self, timeout : Duration) -> Result<(), ReadoutError> {
    let worker = match self.worker.take() {
      Some(worker) => worker,
      None         => return Err(ReadoutError::NotRunning),
    };
    let deadline = Instant::now() + timeout;
    let mut old_occupancy = u32::MAX;
    loop {
      let occupancy = {
        let mut bus = self.bus.lock().expect("bus lock poisoned");
        match bus.fifo_occupancy() {
          Ok(occupancy) => occupancy,
          Err(_)        => break,
        }
      };
      if occupancy == 0 && old_occupancy == 0 {
        break;
      }
      if Instant::now() > deadline {
        warn!("FIFO not drained after {:?}, forcing readout stop", timeout);
        break;
      }
      old_occupancy = occupancy;
      thread::sleep(self.interval.mul_f64(1.5));
    }
    self.stop_flag.store(true, Ordering::SeqCst);
    if worker.join().is_err() {
      error!("Readout worker panicked");
    }
    info!("Stopped readout");
    Ok(())
  }

  //========== RX status =================

  pub fn rx_sync_status(&self) -> Result<[bool; NCHANNELS], ReadoutError> {
    let mut bus = self.bus.lock().expect("bus lock poisoned");
    bus.rx_sync_status().map_err(|_| ReadoutError::BusError)
  }

  pub fn rx_8b10b_error_count(&self) -> Result<[u8; NCHANNELS], ReadoutError> {
    let mut bus = self.bus.lock().expect("bus lock poisoned");
    bus.rx_8b10b_error_count().map_err(|_| ReadoutError::BusError)
  }

  pub fn rx_fifo_discard_count(&self) -> Result<[u8; NCHANNELS], ReadoutError> {
    let mut bus = self.bus.lock().expect("bus lock poisoned");
    bus.rx_fifo_discard_count().map_err(|_| ReadoutError::BusError)
  }

  /// Any channel out of sync or reporting errors?
  pub fn rx_errors_present(&self) -> Result<bool, ReadoutError> {
    let sync    = self.rx_sync_status()?;
    let errors  = self.rx_8b10b_error_count()?;
    let discard = self.rx_fifo_discard_count()?;
    Ok(!sync.iter().any(|&s| s)
       || errors.iter().any(|&c| c != 0)
       || discard.iter().any(|&c| c != 0))
  }

  /// Log the channel states, the queue fill and the FIFO size
  pub fn print_readout_status(&self) {
    let sync    = self.rx_sync_status().unwrap_or([false; NCHANNELS]);
    let errors  = self.rx_8b10b_error_count().unwrap_or([0; NCHANNELS]);
    let discard = self.rx_fifo_discard_count().unwrap_or([0; NCHANNELS]);
    info!("Chunk queue length: {}", self.chunk_rx.len());
    info!("RX sync:            {:?}", sync);
    info!("RX 8b10b errors:    {:?}", errors);
    info!("RX FIFO discards:   {:?}", discard);
    if !sync.iter().any(|&s| s)
       || errors.iter().any(|&c| c != 0)
       || discard.iter().any(|&c| c != 0) {
      warn!("RX errors detected");
    }
  }
}

/// The poll iteration, running on the worker thread
///
/// Occupancy is reported in 16bit units; an odd value means
/// we caught the hardware mid-write, so round down to a full
/// 32bit word count. Empty chunks are enqueued too - the
/// consumer uses them to track poll timing.
fn worker_loop<B : FeBus>(bus       : Arc<Mutex<B>>,
                          chunk_tx  : Sender<RawWordChunk>,
                          stop_flag : Arc<AtomicBool>,
                          interval  : Duration) {
  let mut timestamp = get_float_time();
  while !stop_flag.load(Ordering::SeqCst) {
    thread::sleep(interval);
    let words = {
      let mut bus = match bus.lock() {
        Ok(bus) => bus,
        Err(_)  => {
          error!("Bus lock poisoned, stopping readout");
          stop_flag.store(true, Ordering::SeqCst);
          continue;
        }
      };
      let mut occupancy = match bus.fifo_occupancy() {
        Ok(occupancy) => occupancy,
        Err(err)      => {
          error!("Stopping readout: {}", err);
          stop_flag.store(true, Ordering::SeqCst);
          continue;
        }
      };
      if occupancy % 2 == 1 {
        occupancy -= 1;
      }
      match bus.read_fifo(occupancy / 2) {
        Ok(words) => words,
        Err(err)  => {
          error!("Stopping readout: {}", err);
          stop_flag.store(true, Ordering::SeqCst);
          continue;
        }
      }
    };
    let timestamp_stop = get_float_time();
    let chunk = RawWordChunk {
      words,
      timestamp_start : timestamp,
      timestamp_stop,
      error_flag      : 0,
    };
    timestamp = timestamp_stop;
    if chunk_tx.send(chunk).is_err() {
      // consumer gone, nothing left to do
      break;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use fei4_dataclasses::errors::TransportError;

  /// Bus scripting a sequence of FIFO occupancies
  struct ScriptedBus {
    occupancies : Vec<u32>,
    cursor      : usize,
    fail_reads  : bool,
    next_word   : u32,
  }

  impl ScriptedBus {
    fn new(occupancies : Vec<u32>) -> Self {
      Self {
        occupancies,
        cursor     : 0,
        fail_reads : false,
        next_word  : 0,
      }
    }
  }

  impl FeBus for ScriptedBus {
    fn read_reg(&mut self, _addr : u32) -> Result<u32, TransportError> {
      Ok(1)
    }
    fn write_reg(&mut self, _addr : u32, _value : u32) -> Result<(), TransportError> {
      Ok(())
    }
    fn write_command_memory(&mut self, _data : &[u8]) -> Result<(), TransportError> {
      Ok(())
    }
    fn fifo_occupancy(&mut self) -> Result<u32, TransportError> {
      if self.fail_reads {
        return Err(TransportError::BusError);
      }
      let occupancy = match self.occupancies.get(self.cursor) {
        Some(&occupancy) => occupancy,
        None             => 0,
      };
      self.cursor += 1;
      Ok(occupancy)
    }
    fn read_fifo(&mut self, n_words : u32) -> Result<Vec<u32>, TransportError> {
      if self.fail_reads {
        return Err(TransportError::BusError);
      }
      let mut words = Vec::with_capacity(n_words as usize);
      for _ in 0..n_words {
        words.push(self.next_word);
        self.next_word += 1;
      }
      Ok(words)
    }
  }

  fn make_readout(occupancies : Vec<u32>)
    -> (ReadoutLoop<ScriptedBus>, Arc<Mutex<ScriptedBus>>) {
    let bus = Arc::new(Mutex::new(ScriptedBus::new(occupancies)));
    (ReadoutLoop::new(bus.clone(), Duration::from_millis(2)), bus)
  }

  #[test]
  fn start_twice_is_refused() {
    let (mut readout, _bus) = make_readout(vec![]);
    readout.start().unwrap();
    assert_eq!(readout.start(), Err(ReadoutError::AlreadyRunning));
    readout.stop(Duration::from_millis(50)).unwrap();
    assert_eq!(readout.stop(Duration::from_millis(50)),
               Err(ReadoutError::NotRunning));
    // after a full stop a new start is fine again
    readout.start().unwrap();
    readout.stop(Duration::from_millis(50)).unwrap();
  }

  #[test]
  fn odd_occupancy_rounds_down() {
    // 7 halfwords -> 3 words, 4 -> 2 words
    let (mut readout, _bus) = make_readout(vec![7, 4]);
    let rx = readout.receiver();
    readout.start().unwrap();
    thread::sleep(Duration::from_millis(30));
    readout.stop(Duration::from_millis(50)).unwrap();
    let mut sizes = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
      sizes.push(chunk.len());
    }
    assert!(sizes.len() >= 2);
    assert_eq!(sizes[0], 3);
    assert_eq!(sizes[1], 2);
    // the trailing polls enqueue empty chunks
    assert!(sizes[2..].iter().all(|&s| s == 0));
  }

  #[test]
  fn words_arrive_in_order_across_chunks() {
    let (mut readout, _bus) = make_readout(vec![8, 8, 8]);
    let rx = readout.receiver();
    readout.start().unwrap();
    thread::sleep(Duration::from_millis(40));
    readout.stop(Duration::from_millis(50)).unwrap();
    let mut words = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
      assert!(chunk.timestamp_start <= chunk.timestamp_stop);
      words.extend(chunk.words);
    }
    let expected : Vec<u32> = (0..12).collect();
    assert_eq!(words, expected);
  }

  #[test]
  fn bus_errors_stop_the_loop() {
    let (mut readout, bus) = make_readout(vec![2]);
    readout.start().unwrap();
    thread::sleep(Duration::from_millis(10));
    bus.lock().unwrap().fail_reads = true;
    thread::sleep(Duration::from_millis(20));
    // the worker set the stop flag itself; stop() must
    // still join it cleanly
    readout.stop(Duration::from_millis(20)).unwrap();
  }

  #[test]
  fn queue_is_cleared_on_start() {
    let (mut readout, _bus) = make_readout(vec![2]);
    let rx = readout.receiver();
    readout.start().unwrap();
    thread::sleep(Duration::from_millis(20));
    readout.stop(Duration::from_millis(50)).unwrap();
    assert!(rx.len() > 0);
    // restarting drops everything still queued
    readout.start().unwrap();
    readout.stop(Duration::from_millis(50)).unwrap();
    let drained : Vec<RawWordChunk> = rx.try_iter().collect();
    assert!(drained.iter().all(|chunk| chunk.is_empty()));
  }
}
