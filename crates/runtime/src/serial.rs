//! Object streams.
//!
//! A stream starts with a four byte header followed by records. Each record
//! is a big-endian `u32` length and that many bytes of JSON.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::Runtime;
use crate::unit::{CodeUnit, HookError};

pub const OUTPUT_UNIT: &str = "serial.ObjectOutputStream";
pub const INPUT_UNIT: &str = "serial.ObjectInputStream";

/// Stream magic and version.
pub const STREAM_HEADER: [u8; 4] = [0xAC, 0xED, 0x00, 0x05];

const MAX_RECORD: u32 = 16 * 1024 * 1024;

pub fn output_unit() -> CodeUnit {
    CodeUnit::new(OUTPUT_UNIT).method("new")
}

pub fn input_unit() -> CodeUnit {
    CodeUnit::new(INPUT_UNIT).method("new")
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SerialError {
    #[error("object stream unavailable")]
    Blocked {
        #[source]
        source: HookError,
    },

    #[error("invalid stream header {0:02x?}")]
    BadHeader([u8; 4]),

    #[error("record of {0} bytes exceeds limit")]
    TooLarge(u64),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Load(#[from] crate::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

fn guard(runtime: &Runtime, unit: &str) -> Result<()> {
    runtime
        .load(unit)?
        .enter("new")
        .map_err(|source| SerialError::Blocked { source })
}

/// Writes objects to an underlying writer.
#[derive(Debug)]
pub struct ObjectOutputStream<W: Write> {
    inner: W,
}

impl<W: Write> ObjectOutputStream<W> {
    /// Open a stream, writing its header.
    pub fn new(runtime: &Runtime, mut inner: W) -> Result<Self> {
        guard(runtime, OUTPUT_UNIT)?;
        inner.write_all(&STREAM_HEADER)?;
        Ok(Self { inner })
    }

    pub fn write_object<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        let len = u32::try_from(bytes.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD)
            .ok_or(SerialError::TooLarge(bytes.len() as u64))?;
        self.inner.write_all(&len.to_be_bytes())?;
        self.inner.write_all(&bytes)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reads objects written by [`ObjectOutputStream`].
#[derive(Debug)]
pub struct ObjectInputStream<R: Read> {
    inner: R,
}

impl<R: Read> ObjectInputStream<R> {
    /// Open a stream, validating its header.
    pub fn new(runtime: &Runtime, mut inner: R) -> Result<Self> {
        guard(runtime, INPUT_UNIT)?;
        let mut header = [0u8; 4];
        inner.read_exact(&mut header)?;
        if header != STREAM_HEADER {
            return Err(SerialError::BadHeader(header));
        }
        Ok(Self { inner })
    }

    /// Read the next object. `Ok(None)` at a clean end of stream.
    pub fn read_object<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut len = [0u8; 4];
        loop {
            match self.inner.read(&mut len[..1]) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        // A prefix cut short is a truncated stream, not its end.
        self.inner.read_exact(&mut len[1..])?;
        let len = u32::from_be_bytes(len);
        if len > MAX_RECORD {
            return Err(SerialError::TooLarge(len.into()));
        }
        let mut bytes = vec![0u8; len as usize];
        self.inner.read_exact(&mut bytes)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        items: Vec<String>,
    }

    #[test]
    fn test_objects_survive_a_stream() {
        let rt = Runtime::new();
        let mut out = ObjectOutputStream::new(&rt, Vec::new()).unwrap();
        let order = Order {
            id: 7,
            items: vec!["tea".into(), "milk".into()],
        };
        out.write_object(&order).unwrap();
        out.write_object("trailer").unwrap();
        out.flush().unwrap();
        let bytes = out.into_inner();
        assert_eq!(bytes[..4], STREAM_HEADER);

        let mut input = ObjectInputStream::new(&rt, bytes.as_slice()).unwrap();
        assert_eq!(input.read_object::<Order>().unwrap(), Some(order));
        assert_eq!(input.read_object::<String>().unwrap().as_deref(), Some("trailer"));
        assert!(input.read_object::<String>().unwrap().is_none());
    }

    #[test]
    fn test_truncated_length_prefix_is_an_error() {
        let rt = Runtime::new();
        let mut bytes = STREAM_HEADER.to_vec();
        bytes.extend_from_slice(&[0, 0]);
        let mut input = ObjectInputStream::new(&rt, bytes.as_slice()).unwrap();
        let err = input.read_object::<String>().unwrap_err();
        assert!(matches!(err, SerialError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let rt = Runtime::new();
        let mut bytes = STREAM_HEADER.to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 9, b'"']);
        let mut input = ObjectInputStream::new(&rt, bytes.as_slice()).unwrap();
        assert!(matches!(input.read_object::<String>(), Err(SerialError::Io(_))));
    }

    #[test]
    fn test_rejects_foreign_header() {
        let rt = Runtime::new();
        let err = ObjectInputStream::new(&rt, &b"PK\x03\x04"[..]).unwrap_err();
        assert!(matches!(err, SerialError::BadHeader([b'P', b'K', 3, 4])));
    }

    #[test]
    fn test_rejects_oversized_records() {
        let rt = Runtime::new();
        let mut bytes = STREAM_HEADER.to_vec();
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut input = ObjectInputStream::new(&rt, bytes.as_slice()).unwrap();
        assert!(matches!(input.read_object::<String>(), Err(SerialError::TooLarge(_))));
    }
}
