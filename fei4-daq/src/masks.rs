//! Pixel mask generation
//!
//! Masks select which pixels receive configuration or
//! calibration pulses. Columns and rows are 1-based in the
//! whole external API (like the chip documentation counts
//! them), storage is 0-based.

use std::fmt;

use fei4_dataclasses::constants::{NCOLS, NROWS};
use fei4_dataclasses::errors::ConfigError;

/// How to combine two masks cell by cell
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum MaskOp {
  And,
  Or,
}

/// An 80 x 336 matrix of small integer values
///
/// For plain enable masks the cells are 0/1, DAC registers
/// (TDAC, FDAC) store their per-pixel values in the same
/// shape.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMask {
  cells : Vec<u8>,
}

impl PixelMask {

  /// Every cell set to `value`
  pub fn filled(value : u8) -> Self {
    Self {
      cells : vec![value; NCOLS*NROWS],
    }
  }

  fn check_col(column : u8) -> Result<usize, ConfigError> {
    if column < 1 || column as usize > NCOLS {
      return Err(ConfigError::OutOfRange);
    }
    Ok(column as usize - 1)
  }

  fn check_row(row : u16) -> Result<usize, ConfigError> {
    if row < 1 || row as usize > NROWS {
      return Err(ConfigError::OutOfRange);
    }
    Ok(row as usize - 1)
  }

  pub fn get(&self, column : u8, row : u16) -> Result<u8, ConfigError> {
    let col = Self::check_col(column)?;
    let row = Self::check_row(row)?;
    Ok(self.cells[col*NROWS + row])
  }

  pub fn set(&mut self, column : u8, row : u16, value : u8)
    -> Result<(), ConfigError> {
    let col = Self::check_col(column)?;
    let row = Self::check_row(row)?;
    self.cells[col*NROWS + row] = value;
    Ok(())
  }

  /// Cell access with 0-based indices, for the command
  /// serializers
  pub fn cell(&self, col : usize, row : usize) -> u8 {
    self.cells[col*NROWS + row]
  }

  /// Number of cells not at zero
  pub fn n_set(&self) -> usize {
    self.cells.iter().filter(|&&c| c != 0).count()
  }

  /// Box mask: the bounding rectangle of the given column
  /// and row lists is set to `value`, everything else to
  /// `default`. An empty column or row list yields the
  /// all-default mask.
  pub fn box_mask(columns : &[u8],
                  rows    : &[u16],
                  default : u8,
                  value   : u8) -> Result<Self, ConfigError> {
    let mut mask = Self::filled(default);
    if columns.is_empty() || rows.is_empty() {
      return Ok(mask);
    }
    let mut col_min = usize::MAX;
    let mut col_max = 0usize;
    for &column in columns {
      let col = Self::check_col(column)?;
      col_min = col_min.min(col);
      col_max = col_max.max(col);
    }
    let mut row_min = usize::MAX;
    let mut row_max = 0usize;
    for &row in rows {
      let row = Self::check_row(row)?;
      row_min = row_min.min(row);
      row_max = row_max.max(row);
    }
    for col in col_min..=col_max {
      for row in row_min..=row_max {
        mask.cells[col*NROWS + row] = value;
      }
    }
    Ok(mask)
  }

  /// Step mask: every `steps`th row is selected, shifted
  /// down by `shift`. Even (1-based) columns are offset by
  /// another steps/2 so neighbouring columns never pulse
  /// adjacent pixels in the same step.
  pub fn step_mask(steps   : u16,
                   shift   : u16,
                   default : u8,
                   value   : u8) -> Result<Self, ConfigError> {
    let all_columns : Vec<u8> = (1..=NCOLS as u8).collect();
    Self::step_mask_in_columns(steps, shift, default, value, &all_columns)
  }

  /// Step mask restricted to the given 1-based columns,
  /// everything else stays at `default`
  pub fn step_mask_in_columns(steps   : u16,
                              shift   : u16,
                              default : u8,
                              value   : u8,
                              columns : &[u8]) -> Result<Self, ConfigError> {
    if steps == 0 || steps as usize > NROWS || shift >= steps {
      return Err(ConfigError::OutOfRange);
    }
    let mut mask = Self::filled(default);
    let odd_offset  = (shift % steps) as usize;
    let even_offset = ((steps/2 + shift) % steps) as usize;
    for &column in columns {
      let col = Self::check_col(column)?;
      let offset = if column % 2 == 1 { odd_offset } else { even_offset };
      let mut row = offset;
      while row < NROWS {
        mask.cells[col*NROWS + row] = value;
        row += steps as usize;
      }
    }
    Ok(mask)
  }

  /// Invert: 0 becomes 1, everything else becomes 0
  pub fn invert(&self) -> Self {
    let cells = self.cells.iter()
                          .map(|&c| if c == 0 { 1 } else { 0 })
                          .collect();
    Self { cells }
  }

  /// Cellwise combination, total over the full matrix
  pub fn combine(&self, other : &PixelMask, op : MaskOp) -> Self {
    let cells = self.cells.iter()
                          .zip(other.cells.iter())
                          .map(|(&a, &b)| {
                            let set = match op {
                              MaskOp::And => a != 0 && b != 0,
                              MaskOp::Or  => a != 0 || b != 0,
                            };
                            set as u8
                          })
                          .collect();
    Self { cells }
  }
}

impl fmt::Display for PixelMask {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<PixelMask: {}/{} cells set>", self.n_set(), NCOLS*NROWS)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn box_mask_fills_exactly_the_rectangle() {
    let mask = PixelMask::box_mask(&[10, 20], &[50, 100], 0, 1).unwrap();
    for col in 1..=NCOLS as u8 {
      for row in 1..=NROWS as u16 {
        let inside = (10..=20).contains(&col) && (50..=100).contains(&row);
        assert_eq!(mask.get(col, row).unwrap(), inside as u8,
                   "wrong cell at {}/{}", col, row);
      }
    }
  }

  #[test]
  fn box_mask_takes_min_max_of_the_lists() {
    let a = PixelMask::box_mask(&[20, 10], &[100, 50], 0, 1).unwrap();
    let b = PixelMask::box_mask(&[10, 20], &[50, 100], 0, 1).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn empty_lists_give_the_all_default_mask() {
    let mask = PixelMask::box_mask(&[], &[], 7, 1).unwrap();
    assert_eq!(mask.n_set(), NCOLS*NROWS);
    assert_eq!(mask.get(40, 150).unwrap(), 7);
  }

  #[test]
  fn out_of_range_is_rejected() {
    assert_eq!(PixelMask::box_mask(&[0], &[10], 0, 1),
               Err(ConfigError::OutOfRange));
    assert_eq!(PixelMask::box_mask(&[81], &[10], 0, 1),
               Err(ConfigError::OutOfRange));
    assert_eq!(PixelMask::box_mask(&[10], &[337], 0, 1),
               Err(ConfigError::OutOfRange));
    let mask = PixelMask::filled(0);
    assert_eq!(mask.get(1, 0), Err(ConfigError::OutOfRange));
  }

  #[test]
  fn step_mask_selects_the_right_row_count() {
    // steps dividing 336 select 336/steps rows in every
    // column, for every shift
    for steps in [3u16, 4, 6, 8, 12] {
      for shift in 0..steps {
        let mask = PixelMask::step_mask(steps, shift, 0, 1).unwrap();
        assert_eq!(mask.n_set(), NCOLS*(NROWS/steps as usize),
                   "steps {} shift {}", steps, shift);
        for col in [1u8, 2, 79, 80] {
          let mut rows_set = 0;
          for row in 1..=NROWS as u16 {
            rows_set += mask.get(col, row).unwrap() as usize;
          }
          assert_eq!(rows_set, NROWS/steps as usize);
        }
      }
    }
  }

  #[test]
  fn neighbouring_columns_are_offset_by_half_a_step() {
    let steps = 6u16;
    let shift = 1u16;
    let mask  = PixelMask::step_mask(steps, shift, 0, 1).unwrap();
    // column 1 starts at shift, column 2 at steps/2 + shift
    assert_eq!(mask.get(1, 1 + shift).unwrap(), 1);
    assert_eq!(mask.get(2, 1 + steps/2 + shift).unwrap(), 1);
    assert_eq!(mask.get(2, 1 + shift).unwrap(), 0);
  }

  #[test]
  fn step_mask_rejects_bad_parameters() {
    assert_eq!(PixelMask::step_mask(0, 0, 0, 1), Err(ConfigError::OutOfRange));
    assert_eq!(PixelMask::step_mask(4, 4, 0, 1), Err(ConfigError::OutOfRange));
  }

  #[test]
  fn step_mask_in_columns_leaves_other_columns_alone() {
    let mask = PixelMask::step_mask_in_columns(3, 0, 0, 1, &[5, 6]).unwrap();
    assert_eq!(mask.n_set(), 2*(NROWS/3));
    for row in 1..=NROWS as u16 {
      assert_eq!(mask.get(7, row).unwrap(), 0);
    }
  }

  #[test]
  fn invert_flips_set_and_unset() {
    let mask = PixelMask::box_mask(&[1, 80], &[1, 336], 0, 3).unwrap();
    let inverted = mask.invert();
    assert_eq!(inverted.n_set(), 0);
    assert_eq!(PixelMask::filled(0).invert().n_set(), NCOLS*NROWS);
  }

  #[test]
  fn combine_is_total_and_cellwise() {
    let a = PixelMask::box_mask(&[1, 40], &[1, 336], 0, 1).unwrap();
    let b = PixelMask::box_mask(&[20, 60], &[1, 336], 0, 1).unwrap();
    let and = a.combine(&b, MaskOp::And);
    let or  = a.combine(&b, MaskOp::Or);
    assert_eq!(and.n_set(), 21*NROWS);
    assert_eq!(or.n_set(),  60*NROWS);
  }
}
