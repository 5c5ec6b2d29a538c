//! Raw word chunks - the transport unit between the
//! readout loop, the chunk queue and the record file
//!

use std::fmt;

use crc::Crc;

use crate::serialization::{parse_u8,
                           parse_u32,
                           parse_f64,
                           u32_to_u8,
                           u8_to_u32,
                           Serialization,
                           SerializationError,
                           HEAD,
                           TAIL};

pub const CRC32 : Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// One drain of the receive FIFO
///
/// Created once per poll iteration of the readout loop and
/// never mutated afterwards. Chunk boundaries are a transport
/// artifact - the interpreter guarantees that decoding does
/// not depend on them.
#[derive(Debug, Clone, PartialEq)]
pub struct RawWordChunk {
  pub words           : Vec<u32>,
  pub timestamp_start : f64,
  pub timestamp_stop  : f64,
  pub error_flag      : u8,
}

impl RawWordChunk {

  pub fn new() -> Self {
    Self {
      words           : Vec::<u32>::new(),
      timestamp_start : 0.0,
      timestamp_stop  : 0.0,
      error_flag      : 0,
    }
  }

  pub fn len(&self) -> usize {
    self.words.len()
  }

  pub fn is_empty(&self) -> bool {
    self.words.is_empty()
  }
}

impl Default for RawWordChunk {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for RawWordChunk {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<RawWordChunk: {} words, ts {:.6} .. {:.6}, error {}>",
           self.words.len(), self.timestamp_start,
           self.timestamp_stop, self.error_flag)
  }
}

impl Serialization for RawWordChunk {

  fn from_bytestream(bytestream : &[u8],
                     pos        : &mut usize)
    -> Result<Self, SerializationError> {
    Self::expect_head(bytestream, pos)?;
    let mut chunk = RawWordChunk::new();
    chunk.timestamp_start = parse_f64(bytestream, pos)?;
    chunk.timestamp_stop  = parse_f64(bytestream, pos)?;
    chunk.error_flag      = parse_u8(bytestream, pos)?;
    let n_words           = parse_u32(bytestream, pos)? as usize;
    let n_bytes           = n_words * 4;
    if *pos + n_bytes > bytestream.len() {
      return Err(SerializationError::StreamTooShort);
    }
    let word_bytes = &bytestream[*pos..*pos + n_bytes];
    chunk.words    = u8_to_u32(word_bytes);
    *pos += n_bytes;
    let checksum = parse_u32(bytestream, pos)?;
    if checksum != CRC32.checksum(word_bytes) {
      return Err(SerializationError::ChecksumMismatch);
    }
    Self::expect_tail(bytestream, pos)?;
    Ok(chunk)
  }

  fn to_bytestream(&self) -> Vec<u8> {
    let word_bytes = u32_to_u8(&self.words);
    let checksum   = CRC32.checksum(&word_bytes);
    let mut stream = Vec::<u8>::with_capacity(29 + word_bytes.len());
    stream.extend_from_slice(&HEAD.to_le_bytes());
    stream.extend_from_slice(&self.timestamp_start.to_le_bytes());
    stream.extend_from_slice(&self.timestamp_stop.to_le_bytes());
    stream.extend_from_slice(&self.error_flag.to_le_bytes());
    stream.extend_from_slice(&(self.words.len() as u32).to_le_bytes());
    stream.extend_from_slice(&word_bytes);
    stream.extend_from_slice(&checksum.to_le_bytes());
    stream.extend_from_slice(&TAIL.to_le_bytes());
    stream
  }
}

/// Bookkeeping row of the raw record file, one per chunk
///
/// index_start/index_stop are cumulative word indices into
/// the concatenated word stream of the whole file.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ChunkMeta {
  pub timestamp_start : f64,
  pub timestamp_stop  : f64,
  pub data_length     : u32,
  pub index_start     : u64,
  pub index_stop      : u64,
  pub error_flag      : u8,
}

impl ChunkMeta {

  pub fn from_chunk(chunk : &RawWordChunk, index_start : u64) -> Self {
    Self {
      timestamp_start : chunk.timestamp_start,
      timestamp_stop  : chunk.timestamp_stop,
      data_length     : chunk.words.len() as u32,
      index_start,
      index_stop      : index_start + chunk.words.len() as u64,
      error_flag      : chunk.error_flag,
    }
  }
}

impl fmt::Display for ChunkMeta {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<ChunkMeta: {} words [{}..{}], error {}>",
           self.data_length, self.index_start, self.index_stop,
           self.error_flag)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chunk_bytestream_roundtrip() {
    let chunk = RawWordChunk {
      words           : vec![0x80000001, 0x01E90005, 0x010A0A35, 0],
      timestamp_start : 1700000000.25,
      timestamp_stop  : 1700000000.30,
      error_flag      : 0,
    };
    let stream = chunk.to_bytestream();
    let mut pos = 0usize;
    let decoded = RawWordChunk::from_bytestream(&stream, &mut pos).unwrap();
    assert_eq!(decoded, chunk);
    assert_eq!(pos, stream.len());
  }

  #[test]
  fn empty_chunk_roundtrip() {
    let chunk = RawWordChunk::new();
    let stream = chunk.to_bytestream();
    let mut pos = 0usize;
    let decoded = RawWordChunk::from_bytestream(&stream, &mut pos).unwrap();
    assert!(decoded.is_empty());
  }

  #[test]
  fn corrupt_words_fail_the_checksum() {
    let chunk = RawWordChunk {
      words           : vec![1, 2, 3],
      timestamp_start : 0.0,
      timestamp_stop  : 0.0,
      error_flag      : 0,
    };
    let mut stream = chunk.to_bytestream();
    // flip a bit inside the word payload
    stream[24] ^= 0x01;
    let mut pos = 0usize;
    assert_eq!(RawWordChunk::from_bytestream(&stream, &mut pos),
               Err(SerializationError::ChecksumMismatch));
  }

  #[test]
  fn meta_indices_are_cumulative() {
    let chunk = RawWordChunk {
      words : vec![0; 7],
      ..RawWordChunk::new()
    };
    let meta = ChunkMeta::from_chunk(&chunk, 10);
    assert_eq!(meta.index_start, 10);
    assert_eq!(meta.index_stop, 17);
    assert_eq!(meta.data_length, 7);
  }
}
