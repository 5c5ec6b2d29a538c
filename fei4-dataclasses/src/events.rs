//! Event and hit records produced by the interpreter
//!

use std::fmt;

/// A single pixel hit, fully attributed to its event
///
/// Column and row are 1-based like the external chip
/// geometry. The relative bcid counts the header within
/// the trigger readout window the hit was seen in.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Hit {
  pub event_number   : u64,
  pub trigger_number : u32,
  pub lvl1id         : u16,
  pub rel_bcid       : u8,
  pub column         : u8,
  pub row            : u16,
  pub tot            : u8,
}

impl Hit {

  pub fn new() -> Self {
    Self {
      event_number   : 0,
      trigger_number : 0,
      lvl1id         : 0,
      rel_bcid       : 0,
      column         : 1,
      row            : 1,
      tot            : 0,
    }
  }
}

impl Default for Hit {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for Hit {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<Hit: ev {} trg {} col {} row {} tot {} rel bcid {}>",
           self.event_number, self.trigger_number, self.column,
           self.row, self.tot, self.rel_bcid)
  }
}

/// Per-event summary after the event has been flushed
///
/// The hits themselves live in the interpreter's hit table,
/// this record points into it.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct FeEvent {
  pub event_number    : u64,
  pub trigger_number  : u32,
  pub lvl1id          : u16,
  /// bcid of the first header of this event
  pub bcid            : u16,
  /// number of bcid windows (data headers) seen
  pub n_headers       : u8,
  pub n_hits          : u32,
  /// index of the first hit in the hit table
  pub hit_index_start : u64,
}

impl FeEvent {

  pub fn new() -> Self {
    Self {
      event_number    : 0,
      trigger_number  : 0,
      lvl1id          : 0,
      bcid            : 0,
      n_headers       : 0,
      n_hits          : 0,
      hit_index_start : 0,
    }
  }
}

impl Default for FeEvent {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for FeEvent {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<FeEvent: ev {} trg {} lvl1id {} bcid {} headers {} hits {}>",
           self.event_number, self.trigger_number, self.lvl1id,
           self.bcid, self.n_headers, self.n_hits)
  }
}

/// Chunk metadata with event indices substituted in,
/// one row per interpreted raw chunk
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct EventMeta {
  pub event_index_start : u64,
  pub event_index_stop  : u64,
  pub timestamp_start   : f64,
  pub timestamp_stop    : f64,
  pub data_length       : u32,
  pub index_start       : u64,
  pub index_stop        : u64,
  pub error_flag        : u8,
}
