//! Fixed-size histograms filled during interpretation
//!
//! All histograms have their size fixed at construction,
//! out of range fills saturate into the last bin so a noisy
//! stream can never grow them.

use std::fmt;

use crate::constants::{NCOLS, NROWS};

/// A plain fixed-size counting histogram
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram1D {
  bins : Vec<u64>,
}

impl Histogram1D {

  pub fn new(n_bins : usize) -> Self {
    Self {
      bins : vec![0u64; n_bins],
    }
  }

  /// Count one entry. Out of range bins saturate into
  /// the last bin.
  pub fn fill(&mut self, bin : usize) {
    let idx = bin.min(self.bins.len() - 1);
    self.bins[idx] += 1;
  }

  pub fn bin(&self, idx : usize) -> u64 {
    self.bins[idx]
  }

  pub fn n_bins(&self) -> usize {
    self.bins.len()
  }

  pub fn total(&self) -> u64 {
    self.bins.iter().sum()
  }

  pub fn bins(&self) -> &[u64] {
    &self.bins
  }
}

impl fmt::Display for Histogram1D {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<Histogram1D: {} bins, {} entries>",
           self.bins.len(), self.total())
  }
}

/// Per-pixel hit counts over the full matrix
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyMap {
  counts : Vec<u32>,
}

impl OccupancyMap {

  pub fn new() -> Self {
    Self {
      counts : vec![0u32; NCOLS*NROWS],
    }
  }

  /// Count a hit at the given 1-based column/row. Hits
  /// outside the matrix are ignored here, the interpreter
  /// screens them beforehand.
  pub fn fill(&mut self, column : u8, row : u16) {
    if column < 1 || column as usize > NCOLS || row < 1 || row as usize > NROWS {
      return;
    }
    let idx = (column as usize - 1)*NROWS + (row as usize - 1);
    self.counts[idx] += 1;
  }

  pub fn count(&self, column : u8, row : u16) -> u32 {
    let idx = (column as usize - 1)*NROWS + (row as usize - 1);
    self.counts[idx]
  }

  pub fn total(&self) -> u64 {
    self.counts.iter().map(|&c| c as u64).sum()
  }
}

impl Default for OccupancyMap {
  fn default() -> Self {
    Self::new()
  }
}

/// Stream-consistency error codes
///
/// These never abort interpretation, each occurrence counts
/// into its bucket of the error histogram.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ErrorCode {
  /// bcid not contiguous between headers of one event
  BcidJump         = 0,
  /// lvl1id did not follow the expected increment
  L1idJump         = 1,
  /// a data record arrived with no event open
  UnexpectedRecord = 2,
  /// the chunk carried a hardware truncation flag
  Truncation       = 3,
  /// word matched no known pattern
  UnknownWord      = 4,
  /// second hit would land beyond the last row
  RowOverflow      = 5,
}

impl ErrorCode {
  pub fn bucket(&self) -> usize {
    *self as usize
  }
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let repr = match self {
      ErrorCode::BcidJump         => "BcidJump",
      ErrorCode::L1idJump         => "L1idJump",
      ErrorCode::UnexpectedRecord => "UnexpectedRecord",
      ErrorCode::Truncation       => "Truncation",
      ErrorCode::UnknownWord      => "UnknownWord",
      ErrorCode::RowOverflow      => "RowOverflow",
    };
    write!(f, "{}", repr)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fill_saturates_into_last_bin() {
    let mut hist = Histogram1D::new(4);
    hist.fill(0);
    hist.fill(3);
    hist.fill(17);
    assert_eq!(hist.bin(0), 1);
    assert_eq!(hist.bin(3), 2);
    assert_eq!(hist.total(), 3);
  }

  #[test]
  fn occupancy_corners() {
    let mut occ = OccupancyMap::new();
    occ.fill(1, 1);
    occ.fill(80, 336);
    occ.fill(80, 336);
    assert_eq!(occ.count(1, 1), 1);
    assert_eq!(occ.count(80, 336), 2);
    assert_eq!(occ.total(), 3);
  }
}
