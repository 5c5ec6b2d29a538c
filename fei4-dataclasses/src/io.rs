//! The append-only raw record file
//!
//! Chunks from the readout queue are written sequentially,
//! each as a framed block of its raw words plus the chunk
//! metadata. An optional set of scan parameter values (keyed
//! by names fixed at file creation) rides along with every
//! chunk.
//!
//! The reader restores the chunk sequence together with the
//! cumulative word-index metadata table.

use std::fs::File;
use std::io::{Read,
              Write};
use std::path::Path;

use chrono::{DateTime,
             Utc};

use crate::chunk::{ChunkMeta,
                   RawWordChunk};
use crate::serialization::{parse_u8,
                           parse_u16,
                           parse_u32,
                           parse_f64,
                           Serialization,
                           SerializationError,
                           HEAD,
                           TAIL};

/// Identifies a raw record file, first bytes after the header marker
pub const FILE_MAGIC   : u32 = 0x46344257; // "F4BW"
pub const FILE_VERSION : u16 = 1;

/// The timestamp format for human readable file names
pub static HUMAN_TIMESTAMP_FORMAT : &str = "%y%m%d_%H%M%S";

/// A standardized name for raw record files
///
/// # Arguments
///
/// * scan_id : short identifier of the scan type,
///             e.g. "ext_trigger_scan"
/// * run     : run number
pub fn get_runfilename(scan_id : &str, run : u32) -> String {
  let now : DateTime<Utc> = Utc::now();
  let ts = now.format(HUMAN_TIMESTAMP_FORMAT).to_string();
  format!("{}_{}_run{:04}.f4raw", ts, scan_id, run)
}

/// Sequential writer for raw word chunks
///
/// Chunks are appended one at a time and synced to disk on
/// `flush`. The writer keeps the metadata table with the
/// cumulative word indices in memory.
pub struct RawRecordWriter {
  file                : File,
  pub file_path       : String,
  /// scan parameter names, fixed at file creation
  scan_parameters     : Vec<String>,
  meta                : Vec<ChunkMeta>,
  n_words             : u64,
}

impl RawRecordWriter {

  pub fn new(file_path : &str,
             scan_parameters : &[String])
    -> Result<Self, SerializationError> {
    info!("Opening new raw record file {}", file_path);
    let mut file = File::create(file_path)?;
    let mut header = Vec::<u8>::new();
    header.extend_from_slice(&HEAD.to_le_bytes());
    header.extend_from_slice(&FILE_MAGIC.to_le_bytes());
    header.extend_from_slice(&FILE_VERSION.to_le_bytes());
    header.extend_from_slice(&(scan_parameters.len() as u8).to_le_bytes());
    for name in scan_parameters {
      header.extend_from_slice(&(name.len() as u8).to_le_bytes());
      header.extend_from_slice(name.as_bytes());
    }
    header.extend_from_slice(&TAIL.to_le_bytes());
    file.write_all(&header)?;
    Ok(Self {
      file,
      file_path       : String::from(file_path),
      scan_parameters : scan_parameters.to_vec(),
      meta            : Vec::<ChunkMeta>::new(),
      n_words         : 0,
    })
  }

  /// Append one chunk together with the current scan
  /// parameter values
  ///
  /// The number of values has to match the parameter names
  /// declared at file creation; missing values are recorded
  /// as NaN.
  pub fn append(&mut self,
                chunk       : &RawWordChunk,
                scan_values : &[f64]) -> Result<(), SerializationError> {
    if scan_values.len() != self.scan_parameters.len() {
      warn!("Got {} scan parameter values but {} declared names",
            scan_values.len(), self.scan_parameters.len());
    }
    self.file.write_all(&chunk.to_bytestream())?;
    if !self.scan_parameters.is_empty() {
      let mut block = Vec::<u8>::with_capacity(4 + 8*self.scan_parameters.len());
      block.extend_from_slice(&HEAD.to_le_bytes());
      for idx in 0..self.scan_parameters.len() {
        let value = scan_values.get(idx).copied().unwrap_or(f64::NAN);
        block.extend_from_slice(&value.to_le_bytes());
      }
      block.extend_from_slice(&TAIL.to_le_bytes());
      self.file.write_all(&block)?;
    }
    self.meta.push(ChunkMeta::from_chunk(chunk, self.n_words));
    self.n_words += chunk.words.len() as u64;
    Ok(())
  }

  pub fn flush(&mut self) -> Result<(), SerializationError> {
    self.file.flush()?;
    Ok(())
  }

  pub fn meta(&self) -> &[ChunkMeta] {
    &self.meta
  }

  pub fn n_chunks(&self) -> usize {
    self.meta.len()
  }

  pub fn n_words(&self) -> u64 {
    self.n_words
  }
}

/// Reader for raw record files
///
/// Restores chunks in order and accumulates the metadata
/// table with cumulative word indices while reading.
pub struct RawRecordReader {
  stream          : Vec<u8>,
  pos             : usize,
  scan_parameters : Vec<String>,
  meta            : Vec<ChunkMeta>,
  n_words         : u64,
}

impl RawRecordReader {

  pub fn new(file_path : &str) -> Result<Self, SerializationError> {
    let path = Path::new(file_path);
    let mut file = File::open(path)?;
    let mut stream = Vec::<u8>::new();
    file.read_to_end(&mut stream)?;
    let mut pos = 0usize;
    if parse_u16(&stream, &mut pos)? != HEAD {
      return Err(SerializationError::HeadInvalid);
    }
    if parse_u32(&stream, &mut pos)? != FILE_MAGIC {
      return Err(SerializationError::HeadInvalid);
    }
    let version = parse_u16(&stream, &mut pos)?;
    if version != FILE_VERSION {
      warn!("Raw record file version {} read by code for version {}",
            version, FILE_VERSION);
    }
    let n_params = parse_u8(&stream, &mut pos)? as usize;
    let mut scan_parameters = Vec::<String>::with_capacity(n_params);
    for _ in 0..n_params {
      let len = parse_u8(&stream, &mut pos)? as usize;
      if pos + len > stream.len() {
        return Err(SerializationError::StreamTooShort);
      }
      let name = String::from_utf8_lossy(&stream[pos..pos+len]).to_string();
      pos += len;
      scan_parameters.push(name);
    }
    if parse_u16(&stream, &mut pos)? != TAIL {
      return Err(SerializationError::TailInvalid);
    }
    Ok(Self {
      stream,
      pos,
      scan_parameters,
      meta    : Vec::<ChunkMeta>::new(),
      n_words : 0,
    })
  }

  pub fn scan_parameters(&self) -> &[String] {
    &self.scan_parameters
  }

  /// Read the next chunk and its scan parameter values.
  /// Returns Ok(None) at a clean end of file.
  pub fn next_chunk(&mut self)
    -> Result<Option<(RawWordChunk, Vec<f64>)>, SerializationError> {
    if self.pos >= self.stream.len() {
      return Ok(None);
    }
    let chunk = RawWordChunk::from_bytestream(&self.stream, &mut self.pos)?;
    let mut values = Vec::<f64>::with_capacity(self.scan_parameters.len());
    if !self.scan_parameters.is_empty() {
      if parse_u16(&self.stream, &mut self.pos)? != HEAD {
        return Err(SerializationError::HeadInvalid);
      }
      for _ in 0..self.scan_parameters.len() {
        values.push(parse_f64(&self.stream, &mut self.pos)?);
      }
      if parse_u16(&self.stream, &mut self.pos)? != TAIL {
        return Err(SerializationError::TailInvalid);
      }
    }
    self.meta.push(ChunkMeta::from_chunk(&chunk, self.n_words));
    self.n_words += chunk.words.len() as u64;
    Ok(Some((chunk, values)))
  }

  /// Metadata rows of all chunks read so far
  pub fn meta(&self) -> &[ChunkMeta] {
    &self.meta
  }
}
