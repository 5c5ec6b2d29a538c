//! Error taxonomy for the readout chain.
//!
//! Configuration errors are raised before any hardware
//! transaction, transport errors end the current run,
//! stream-consistency issues never show up here - they
//! are tallied in the interpreter's error histogram
//! instead (see `histograms::ErrorCode`).

use std::error::Error;
use std::fmt;

/// Errors caught before anything is sent to the chip
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ConfigError {
  UnknownRegister,
  OutOfRange,
  MaskNotSet,
  ValueTooWide,
}

impl fmt::Display for ConfigError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      ConfigError::UnknownRegister => "UnknownRegister",
      ConfigError::OutOfRange      => "OutOfRange",
      ConfigError::MaskNotSet      => "MaskNotSet",
      ConfigError::ValueTooWide    => "ValueTooWide",
    };
    write!(f, "<ConfigError: {}>", etype)
  }
}

impl Error for ConfigError {
}

/// Errors on the way to/from the hardware. Fatal for
/// the current run, partial data is kept.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum TransportError {
  /// a single command does not fit the command memory
  CommandTooLong,
  /// the READY flag never came up within the attempt budget
  ReadyTimeout,
  /// a bus level read/write failed
  BusError,
}

impl fmt::Display for TransportError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      TransportError::CommandTooLong => "CommandTooLong",
      TransportError::ReadyTimeout   => "ReadyTimeout",
      TransportError::BusError       => "BusError",
    };
    write!(f, "<TransportError: {}>", etype)
  }
}

impl Error for TransportError {
}

/// Readout loop lifecycle errors
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ReadoutError {
  AlreadyRunning,
  NotRunning,
  BusError,
}

impl fmt::Display for ReadoutError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      ReadoutError::AlreadyRunning => "AlreadyRunning",
      ReadoutError::NotRunning     => "NotRunning",
      ReadoutError::BusError       => "BusError",
    };
    write!(f, "<ReadoutError: {}>", etype)
  }
}

impl Error for ReadoutError {
}

/// Errors while decoding persisted bytestreams
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum SerializationError {
  HeadInvalid,
  TailInvalid,
  StreamTooShort,
  ChecksumMismatch,
  IoError,
}

impl fmt::Display for SerializationError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let etype = match self {
      SerializationError::HeadInvalid      => "HeadInvalid",
      SerializationError::TailInvalid      => "TailInvalid",
      SerializationError::StreamTooShort   => "StreamTooShort",
      SerializationError::ChecksumMismatch => "ChecksumMismatch",
      SerializationError::IoError          => "IoError",
    };
    write!(f, "<SerializationError: {}>", etype)
  }
}

impl Error for SerializationError {
}

impl From<std::io::Error> for SerializationError {
  fn from(_err : std::io::Error) -> Self {
    SerializationError::IoError
  }
}
