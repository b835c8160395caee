//! Length-Prefixed Frame Encoding
//!
//! Gives the sidecar pipes message boundaries. Each frame is a little-endian
//! `u32` length followed by an rkyv archive of that many bytes.

use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{Archive, CheckBytes, Deserialize, Infallible, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use thiserror::Error;

/// Largest frame either side will accept (1 MB). Sampler traffic is a few
/// dozen bytes per message, so anything bigger means the stream is corrupt.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Errors raised while encoding or decoding frames
#[derive(Debug, Error)]
pub enum FrameError {
    /// Reading or writing the pipe failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// rkyv could not encode the message
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The payload failed validation or decoding
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Length prefix above [`MAX_FRAME_SIZE`]
    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Announced or encoded length
        size: usize,
        /// Limit in force
        max: usize,
    },

    /// Structurally impossible frame, e.g. a zero length prefix
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The peer closed the pipe between frames
    #[error("End of stream")]
    EndOfStream,
}

/// Encode `message` and write it as one frame, flushing afterwards.
///
/// ```text
/// +----------------+------------------+
/// | length (4 LE)  | rkyv payload     |
/// +----------------+------------------+
/// ```
pub fn write_frame<W, T>(writer: &mut BufWriter<W>, message: &T) -> Result<(), FrameError>
where
    W: Write,
    T: Serialize<AllocSerializer<256>>,
{
    let bytes =
        rkyv::to_bytes::<_, 256>(message).map_err(|e| FrameError::Serialization(e.to_string()))?;

    if bytes.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&bytes)?;
    // The peer blocks on this frame; never leave it sitting in the buffer.
    writer.flush()?;
    Ok(())
}

/// Read exactly one frame and decode it into `T`.
///
/// A clean EOF before the length prefix is reported as
/// [`FrameError::EndOfStream`] so callers can tell a closed pipe from a
/// truncated frame.
pub fn read_frame<R, T>(reader: &mut BufReader<R>) -> Result<T, FrameError>
where
    R: Read,
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::EndOfStream);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 {
        return Err(FrameError::InvalidFrame("zero-length frame".to_string()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = rkyv::AlignedVec::with_capacity(len);
    buf.resize(len, 0);
    reader.read_exact(&mut buf)?;

    let archived = rkyv::check_archived_root::<T>(&buf)
        .map_err(|e| FrameError::Deserialization(e.to_string()))?;

    archived
        .deserialize(&mut Infallible)
        .map_err(|_| FrameError::Deserialization("infallible deserializer failed".to_string()))
}

/// Buffered frame writer over one end of a pipe
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Wrap a raw writer
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(8 * 1024, writer),
        }
    }

    /// Send one message
    pub fn write<T>(&mut self, message: &T) -> Result<(), FrameError>
    where
        T: Serialize<AllocSerializer<256>>,
    {
        write_frame(&mut self.writer, message)
    }
}

/// Buffered frame reader over one end of a pipe
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    /// Wrap a raw reader
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(8 * 1024, reader),
        }
    }

    /// Receive one message, blocking until a full frame is available
    pub fn read<T>(&mut self) -> Result<T, FrameError>
    where
        T: Archive,
        T::Archived: for<'a> CheckBytes<DefaultValidator<'a>> + Deserialize<T, Infallible>,
    {
        read_frame(&mut self.reader)
    }
}
