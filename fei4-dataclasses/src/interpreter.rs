//! Stateful interpretation of the raw word stream
//!
//! The interpreter consumes 32-bit words (chunked or not,
//! the result is identical), reconstructs event boundaries
//! from the data header sequencing and emits hits, per-event
//! records and a set of fixed size histograms.
//!
//! Stream-consistency problems (bcid jumps, lvl1id mismatches,
//! records out of order) are counted in the error histogram
//! and never abort the stream - a noisy source must still
//! yield an analyzable bulk dataset.

use std::fmt;

use crate::constants::*;
use crate::chunk::RawWordChunk;
use crate::cluster::clusterize;
use crate::events::{Hit,
                    FeEvent,
                    EventMeta};
use crate::histograms::{Histogram1D,
                        OccupancyMap,
                        ErrorCode};
use crate::words::{classify,
                   ChipFlavor,
                   DataHeader,
                   DataRecord,
                   DecodedRecord};

/// Where we are in the word stream
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DecoderState {
  AwaitingHeader,
  InEvent,
}

/// The event currently being accumulated
///
/// Opened on the first header of a new event, flushed when
/// the next event starts or the stream ends.
#[derive(Debug, Copy, Clone)]
struct EventAccumulator {
  event_number    : u64,
  trigger_number  : u32,
  lvl1id          : u16,
  bcid_start      : u16,
  last_bcid       : u16,
  n_headers       : u8,
  hit_index_start : u64,
}

/// Stateful decoder of the raw 32-bit word stream
pub struct WordInterpreter {
  flavor             : ChipFlavor,
  /// consecutive bcid windows read out per trigger
  trig_count         : u8,
  event              : Option<EventAccumulator>,
  last_lvl1id        : Option<u16>,
  trigger_number     : u32,

  hits               : Vec<Hit>,
  events             : Vec<FeEvent>,
  event_meta         : Vec<EventMeta>,

  occupancy          : OccupancyMap,
  tot_hist           : Histogram1D,
  rel_bcid_hist      : Histogram1D,
  service_hist       : Histogram1D,
  error_hist         : Histogram1D,
  cluster_size_hist  : Histogram1D,
  cluster_tot_hist   : Histogram1D,
  clusterize_events  : bool,

  n_words            : u64,
  n_chunks           : u64,
  n_trigger_words    : u64,
  n_tdc_words        : u64,
  n_status_words     : u64,
  n_service_records  : u64,
  n_register_records : u64,
}

impl WordInterpreter {

  pub fn new(flavor : ChipFlavor) -> Self {
    Self {
      flavor,
      trig_count         : 16,
      event              : None,
      last_lvl1id        : None,
      trigger_number     : 0,
      hits               : Vec::<Hit>::new(),
      events             : Vec::<FeEvent>::new(),
      event_meta         : Vec::<EventMeta>::new(),
      occupancy          : OccupancyMap::new(),
      tot_hist           : Histogram1D::new(N_TOT_BINS),
      rel_bcid_hist      : Histogram1D::new(N_REL_BCID_BINS),
      service_hist       : Histogram1D::new(N_SERVICE_CODES),
      error_hist         : Histogram1D::new(N_ERROR_CODES),
      cluster_size_hist  : Histogram1D::new(N_CLUSTER_BINS),
      cluster_tot_hist   : Histogram1D::new(N_CLUSTER_BINS),
      clusterize_events  : true,
      n_words            : 0,
      n_chunks           : 0,
      n_trigger_words    : 0,
      n_tdc_words        : 0,
      n_status_words     : 0,
      n_service_records  : 0,
      n_register_records : 0,
    }
  }

  /// Number of consecutive bcid windows per trigger, as
  /// configured in the chip's Trig_Count register. The
  /// register value 0 means 16.
  pub fn set_trig_count(&mut self, trig_count : u8) {
    self.trig_count = if trig_count == 0 { 16 } else { trig_count };
  }

  pub fn set_clusterize(&mut self, on : bool) {
    self.clusterize_events = on;
  }

  /// Interpret a bare word slice
  pub fn interpret_words(&mut self, words : &[u32]) {
    for &word in words {
      self.interpret_word(word);
    }
  }

  /// Interpret one chunk from the readout queue or the
  /// record file. Carries no state across chunk boundaries
  /// apart from the decoder state itself, so any split of
  /// the same stream decodes identically.
  pub fn interpret_chunk(&mut self, chunk : &RawWordChunk) {
    let index_start       = self.n_words;
    let event_index_start = self.events.len() as u64;
    if chunk.error_flag != 0 {
      self.error_hist.fill(ErrorCode::Truncation.bucket());
    }
    self.interpret_words(&chunk.words);
    self.event_meta.push(EventMeta {
      event_index_start,
      event_index_stop  : self.events.len() as u64,
      timestamp_start   : chunk.timestamp_start,
      timestamp_stop    : chunk.timestamp_stop,
      data_length       : chunk.words.len() as u32,
      index_start,
      index_stop        : self.n_words,
      error_flag        : chunk.error_flag,
    });
    self.n_chunks += 1;
  }

  /// Flush the open event, if any. Call once at the end
  /// of the stream.
  pub fn finalize(&mut self) {
    if let Some(acc) = self.event.take() {
      self.flush_event(acc);
    }
  }

  fn interpret_word(&mut self, word : u32) {
    self.n_words += 1;
    match classify(word, self.flavor) {
      DecodedRecord::TriggerWord(tw) => {
        self.trigger_number = tw.counter;
        self.n_trigger_words += 1;
      }
      DecodedRecord::Status => {
        self.n_status_words += 1;
      }
      DecodedRecord::TdcWord(_) => {
        self.n_tdc_words += 1;
      }
      DecodedRecord::DataHeader(dh) => {
        self.handle_header(dh);
      }
      DecodedRecord::DataRecord(dr) => {
        self.handle_data_record(dr);
      }
      DecodedRecord::ServiceRecord(sr) => {
        self.service_hist.fill(sr.code as usize);
        self.n_service_records += 1;
      }
      DecodedRecord::AddressRecord(_) | DecodedRecord::ValueRecord(_) => {
        // register readback traffic, not event data
        self.n_register_records += 1;
      }
      DecodedRecord::Unknown(w) => {
        debug!("unknown word 0x{:08x}", w);
        self.error_hist.fill(ErrorCode::UnknownWord.bucket());
      }
    }
  }

  fn handle_header(&mut self, dh : DataHeader) {
    let continues = match self.event {
      Some(ref acc) => {
        acc.lvl1id == dh.lvl1id && acc.n_headers < self.trig_count
      }
      None => false,
    };
    if continues {
      let bcid_mask = self.flavor.bcid_mask();
      if let Some(acc) = self.event.as_mut() {
        let expected_bcid = acc.last_bcid.wrapping_add(1) & bcid_mask;
        if dh.bcid != expected_bcid {
          self.error_hist.fill(ErrorCode::BcidJump.bucket());
        }
        acc.last_bcid  = dh.bcid;
        acc.n_headers += 1;
      }
      return;
    }
    // a new event starts here
    if let Some(acc) = self.event.take() {
      self.flush_event(acc);
    }
    if let Some(last) = self.last_lvl1id {
      let expected = last.wrapping_add(1) & self.flavor.l1id_mask();
      if dh.lvl1id != expected {
        self.error_hist.fill(ErrorCode::L1idJump.bucket());
      }
    }
    self.last_lvl1id = Some(dh.lvl1id);
    self.event = Some(EventAccumulator {
      event_number    : self.events.len() as u64,
      trigger_number  : self.trigger_number,
      lvl1id          : dh.lvl1id,
      bcid_start      : dh.bcid,
      last_bcid       : dh.bcid,
      n_headers       : 1,
      hit_index_start : self.hits.len() as u64,
    });
  }

  fn handle_data_record(&mut self, dr : DataRecord) {
    let acc = match self.event {
      Some(ref acc) => *acc,
      None => {
        self.error_hist.fill(ErrorCode::UnexpectedRecord.bucket());
        return;
      }
    };
    // tot1 of 14/15 marks a late/no hit, the whole word
    // is discarded then
    if dr.tot1 >= TOT_INVALID {
      return;
    }
    let rel_bcid = acc.n_headers - 1;
    self.push_hit(&acc, rel_bcid, dr.column, dr.row, dr.tot1);
    if dr.tot2 != TOT_NO_HIT {
      if (dr.row as usize) + 1 > NROWS {
        self.error_hist.fill(ErrorCode::RowOverflow.bucket());
      } else {
        self.push_hit(&acc, rel_bcid, dr.column, dr.row + 1, dr.tot2);
      }
    }
  }

  fn push_hit(&mut self, acc : &EventAccumulator, rel_bcid : u8,
              column : u8, row : u16, tot : u8) {
    self.hits.push(Hit {
      event_number   : acc.event_number,
      trigger_number : acc.trigger_number,
      lvl1id         : acc.lvl1id,
      rel_bcid,
      column,
      row,
      tot,
    });
    self.occupancy.fill(column, row);
    self.tot_hist.fill(tot as usize);
    self.rel_bcid_hist.fill(rel_bcid as usize);
  }

  fn flush_event(&mut self, acc : EventAccumulator) {
    let hit_start = acc.hit_index_start as usize;
    let n_hits    = self.hits.len() - hit_start;
    if self.clusterize_events && n_hits > 0 {
      for cluster in clusterize(&self.hits[hit_start..]) {
        self.cluster_size_hist.fill(cluster.n_hits as usize);
        self.cluster_tot_hist.fill(cluster.charge as usize);
      }
    }
    self.events.push(FeEvent {
      event_number    : acc.event_number,
      trigger_number  : acc.trigger_number,
      lvl1id          : acc.lvl1id,
      bcid            : acc.bcid_start,
      n_headers       : acc.n_headers,
      n_hits          : n_hits as u32,
      hit_index_start : acc.hit_index_start,
    });
  }

  /// Current position in the stream state machine
  pub fn state(&self) -> DecoderState {
    match self.event {
      Some(_) => DecoderState::InEvent,
      None    => DecoderState::AwaitingHeader,
    }
  }

  pub fn hits(&self) -> &[Hit] {
    &self.hits
  }

  pub fn events(&self) -> &[FeEvent] {
    &self.events
  }

  pub fn event_meta(&self) -> &[EventMeta] {
    &self.event_meta
  }

  pub fn hits_of(&self, event : &FeEvent) -> &[Hit] {
    let start = event.hit_index_start as usize;
    &self.hits[start..start + event.n_hits as usize]
  }

  pub fn occupancy(&self) -> &OccupancyMap {
    &self.occupancy
  }

  pub fn tot_hist(&self) -> &Histogram1D {
    &self.tot_hist
  }

  pub fn rel_bcid_hist(&self) -> &Histogram1D {
    &self.rel_bcid_hist
  }

  pub fn service_hist(&self) -> &Histogram1D {
    &self.service_hist
  }

  pub fn error_hist(&self) -> &Histogram1D {
    &self.error_hist
  }

  pub fn cluster_size_hist(&self) -> &Histogram1D {
    &self.cluster_size_hist
  }

  pub fn cluster_tot_hist(&self) -> &Histogram1D {
    &self.cluster_tot_hist
  }

  pub fn n_words(&self) -> u64 {
    self.n_words
  }

  pub fn n_events(&self) -> u64 {
    self.events.len() as u64
  }

  /// Human readable decoding summary
  pub fn summary(&self) -> String {
    let mut repr = String::from("-- interpretation summary --");
    repr += &format!("\n  words            : {}", self.n_words);
    repr += &format!("\n  chunks           : {}", self.n_chunks);
    repr += &format!("\n  events           : {}", self.events.len());
    repr += &format!("\n  hits             : {}", self.hits.len());
    repr += &format!("\n  trigger words    : {}", self.n_trigger_words);
    repr += &format!("\n  tdc words        : {}", self.n_tdc_words);
    repr += &format!("\n  status words     : {}", self.n_status_words);
    repr += &format!("\n  service records  : {}", self.n_service_records);
    repr += &format!("\n  register records : {}", self.n_register_records);
    repr += &format!("\n  decoding errors  : {}", self.error_hist.total());
    repr
  }

  pub fn print_summary(&self) {
    println!("{}", self.summary());
  }
}

impl fmt::Display for WordInterpreter {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<WordInterpreter: {} words, {} events, {} hits>",
           self.n_words, self.events.len(), self.hits.len())
  }
}
