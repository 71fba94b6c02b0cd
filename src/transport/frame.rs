//! Transport framing: length prefix + crc32c.
//!
//! ```text
//! [u32 length LE][u32 crc32c LE][payload]
//! ```

use std::io::{ErrorKind, Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zero-length frame")]
    ZeroLength,
    #[error("frame of {got} bytes exceeds limit of {max}")]
    TooLarge { max: usize, got: usize },
    #[error("frame crc mismatch: header says {expected:#010x}, payload is {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Next frame payload, or `None` on a clean close at a frame boundary.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(header) = self.read_header()? else {
            return Ok(None);
        };

        let mut word = [0u8; 4];
        word.copy_from_slice(&header[0..4]);
        let length = u32::from_le_bytes(word) as usize;
        word.copy_from_slice(&header[4..8]);
        let expected = u32::from_le_bytes(word);

        if length == 0 {
            return Err(FrameError::ZeroLength);
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                max: self.max_frame_bytes,
                got: length,
            });
        }

        let mut payload = vec![0u8; length];
        self.reader.read_exact(&mut payload)?;

        let got = crc32c(&payload);
        if got != expected {
            return Err(FrameError::CrcMismatch { expected, got });
        }
        Ok(Some(payload))
    }

    fn read_header(&mut self) -> Result<Option<[u8; FRAME_HEADER_LEN]>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut filled = 0usize;
        while filled < header.len() {
            match self.reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "frame header truncated",
                    )
                    .into());
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Some(header))
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.is_empty() {
            return Err(FrameError::ZeroLength);
        }
        if payload.len() > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                max: self.max_frame_bytes,
                got: payload.len(),
            });
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[4..8].copy_from_slice(&crc32c(payload).to_le_bytes());
        self.writer.write_all(&header)?;
        self.writer.write_all(payload)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), FrameError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn written(payload: &[u8], max: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf, max).write_frame(payload).unwrap();
        buf
    }

    #[test]
    fn roundtrip_validates_crc() {
        let wire = written(b"payload", 1024);
        let mut reader = FrameReader::new(Cursor::new(wire), 1024);
        assert_eq!(reader.read_next().unwrap().unwrap(), b"payload");
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let mut wire = written(b"payload", 1024);
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let mut reader = FrameReader::new(Cursor::new(wire), 1024);
        assert!(matches!(
            reader.read_next().unwrap_err(),
            FrameError::CrcMismatch { .. }
        ));
    }

    #[test]
    fn oversize_frame_rejected_on_both_sides() {
        let mut buf = Vec::new();
        let err = FrameWriter::new(&mut buf, 4)
            .write_frame(b"too long")
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { max: 4, got: 8 }));

        let wire = written(b"too long", 1024);
        let mut reader = FrameReader::new(Cursor::new(wire), 4);
        assert!(matches!(
            reader.read_next().unwrap_err(),
            FrameError::TooLarge { .. }
        ));
    }

    #[test]
    fn truncated_header_is_unexpected_eof() {
        let wire = written(b"x", 16);
        let mut reader = FrameReader::new(Cursor::new(&wire[..3]), 16);
        match reader.read_next().unwrap_err() {
            FrameError::Io(err) => assert_eq!(err.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_length_frame_rejected() {
        let mut wire = vec![0u8; FRAME_HEADER_LEN];
        wire[4..8].copy_from_slice(&crc32c(b"").to_le_bytes());
        let mut reader = FrameReader::new(Cursor::new(wire), 16);
        assert!(matches!(
            reader.read_next().unwrap_err(),
            FrameError::ZeroLength
        ));
    }
}
