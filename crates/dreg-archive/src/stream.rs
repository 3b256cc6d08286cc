//! Forward-only stream adapter
//!
//! Wraps a byte source that can only be consumed front to back (a streamed
//! HTTP body, a channel of chunks, any `Read`) and exposes the small amount
//! of "seek" the tar reader needs: skipping ahead. Nothing is buffered
//! beyond the chunk currently being consumed, so seeking backwards is a hard
//! error rather than a silent re-read.

use std::io::{self, Read, Seek, SeekFrom};

use bytes::{Buf, Bytes};
use thiserror::Error;
use tokio::sync::mpsc;

/// Size of chunks pulled from a plain `Read` source.
pub const READER_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("cannot seek backward from {position} to {target}")]
    NotSeekableBackward { position: u64, target: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;

impl From<StreamError> for io::Error {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Io(e) => e,
            e @ StreamError::NotSeekableBackward { .. } => {
                io::Error::new(io::ErrorKind::Unsupported, e)
            }
        }
    }
}

/// The three operations archive code needs from a non-rewindable source.
pub trait ForwardSeek {
    /// Bytes consumed so far.
    fn position(&self) -> u64;

    /// Read up to `n` bytes, or everything that is left when `n` is `None`.
    ///
    /// Fewer than `n` bytes come back only at end of stream.
    fn read_up_to(&mut self, n: Option<usize>) -> Result<Vec<u8>>;

    /// Discard bytes until `position() == target`.
    ///
    /// Fails with [`StreamError::NotSeekableBackward`] if `target` is behind
    /// the current position. Stops early (without error) at end of stream.
    fn seek_forward(&mut self, target: u64) -> Result<()>;
}

/// Forward-only stream over a sequence of byte chunks.
pub struct ForwardStream<I> {
    chunks: I,
    current: Bytes,
    position: u64,
    exhausted: bool,
}

impl<I> ForwardStream<I>
where
    I: Iterator<Item = io::Result<Bytes>>,
{
    pub fn new(chunks: I) -> Self {
        Self {
            chunks,
            current: Bytes::new(),
            position: 0,
            exhausted: false,
        }
    }

    /// Make sure `current` has bytes, pulling the next non-empty chunk.
    /// Returns false at end of stream.
    fn fill(&mut self) -> io::Result<bool> {
        while !self.current.has_remaining() {
            if self.exhausted {
                return Ok(false);
            }
            match self.chunks.next() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
                None => {
                    self.exhausted = true;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Drop up to `n` bytes; returns how many were dropped.
    fn discard(&mut self, mut n: u64) -> io::Result<u64> {
        let mut dropped = 0;
        while n > 0 && self.fill()? {
            let step = (self.current.remaining() as u64).min(n) as usize;
            self.current.advance(step);
            self.position += step as u64;
            dropped += step as u64;
            n -= step as u64;
        }
        Ok(dropped)
    }
}

impl<R: Read> ForwardStream<ReaderChunks<R>> {
    /// Adapt a plain reader.
    pub fn from_reader(reader: R) -> Self {
        Self::new(ReaderChunks::new(reader))
    }
}

impl ForwardStream<ChannelChunks> {
    /// Adapt the receiving end of a chunk channel. Must be consumed from a
    /// blocking thread.
    pub fn from_channel(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self::new(ChannelChunks::new(rx))
    }
}

impl<I> ForwardSeek for ForwardStream<I>
where
    I: Iterator<Item = io::Result<Bytes>>,
{
    fn position(&self) -> u64 {
        self.position
    }

    fn read_up_to(&mut self, n: Option<usize>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(n.unwrap_or(0).min(READER_CHUNK_SIZE));
        let limit = n.unwrap_or(usize::MAX);
        while out.len() < limit && self.fill()? {
            let step = self.current.remaining().min(limit - out.len());
            out.extend_from_slice(&self.current[..step]);
            self.current.advance(step);
            self.position += step as u64;
        }
        Ok(out)
    }

    fn seek_forward(&mut self, target: u64) -> Result<()> {
        if target < self.position {
            return Err(StreamError::NotSeekableBackward {
                position: self.position,
                target,
            });
        }
        self.discard(target - self.position)?;
        Ok(())
    }
}

impl<I> Read for ForwardStream<I>
where
    I: Iterator<Item = io::Result<Bytes>>,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || !self.fill()? {
            return Ok(0);
        }
        let step = self.current.remaining().min(buf.len());
        self.current.copy_to_slice(&mut buf[..step]);
        self.position += step as u64;
        Ok(step)
    }
}

/// Forward-only `Seek`: `Start(p)` and `Current(d)` that do not move
/// backwards are honoured by discarding; anything else is `Unsupported`.
/// Seeking past the end of the stream is `UnexpectedEof`, which is how a
/// truncated archive shows up to the tar reader.
impl<I> Seek for ForwardStream<I>
where
    I: Iterator<Item = io::Result<Bytes>>,
{
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::Current(d) if d >= 0 => self.position.saturating_add(d as u64),
            SeekFrom::Current(d) => {
                let back = d.unsigned_abs();
                return Err(StreamError::NotSeekableBackward {
                    position: self.position,
                    target: self.position.saturating_sub(back),
                }
                .into());
            }
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "forward-only stream has no known end",
                ))
            }
        };
        self.seek_forward(target)?;
        if self.position < target {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended at {} before seek target {}", self.position, target),
            ));
        }
        Ok(self.position)
    }

    fn stream_position(&mut self) -> io::Result<u64> {
        Ok(self.position)
    }
}

/// Chunk iterator over a plain reader.
pub struct ReaderChunks<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: Read> ReaderChunks<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: vec![0u8; READER_CHUNK_SIZE],
        }
    }
}

impl<R: Read> Iterator for ReaderChunks<R> {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            return match self.reader.read(&mut self.buf) {
                Ok(0) => None,
                Ok(n) => Some(Ok(Bytes::copy_from_slice(&self.buf[..n]))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Some(Err(e)),
            };
        }
    }
}

/// Chunk iterator over a tokio channel, bridging an async producer (an HTTP
/// body) to synchronous archive code.
///
/// `next` blocks the current thread, so this must only be driven from
/// `spawn_blocking` or a plain thread.
pub struct ChannelChunks {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl ChannelChunks {
    pub fn new(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self { rx }
    }
}

impl Iterator for ChannelChunks {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.blocking_recv()
    }
}
