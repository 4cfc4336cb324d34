//! # Data Stage Streams
//!
//! An IN data stage is fed from an [`InStream`], one packet at a time. This
//! lets descriptors and class buffers be served lazily: the engine asks for
//! the total length once and then only for the bytes of the next packet.

use std::borrow::Cow;
use std::fmt::Debug;

/// A producer for the bytes of an IN data stage.
pub trait InStream: Debug {
    /// The total number of bytes the stream can provide.
    ///
    /// `None` means the data is not available yet. The engine pauses the
    /// transfer in that case and asks again when it is resumed.
    fn total_len(&self) -> Option<usize>;

    /// Return at most `max_len` bytes starting at `offset`.
    ///
    /// The engine never asks for bytes beyond [`total_len`](Self::total_len).
    fn next_chunk(&mut self, offset: usize, max_len: usize) -> &[u8];
}

/// A stream over bytes that are already in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BytesStream {
    bytes: Cow<'static, [u8]>,
}

impl BytesStream {
    /// Serve a static table, e.g. a descriptor.
    #[must_use]
    pub const fn from_static(bytes: &'static [u8]) -> Self {
        Self {
            bytes: Cow::Borrowed(bytes),
        }
    }

    /// Serve an owned buffer.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Cow::Owned(bytes),
        }
    }

    /// Box the stream for handing it to the engine.
    #[must_use]
    pub fn boxed(self) -> Box<dyn InStream> {
        Box::new(self)
    }
}

impl InStream for BytesStream {
    fn total_len(&self) -> Option<usize> {
        Some(self.bytes.len())
    }

    fn next_chunk(&mut self, offset: usize, max_len: usize) -> &[u8] {
        let start = offset.min(self.bytes.len());
        let end = start.saturating_add(max_len).min(self.bytes.len());

        &self.bytes[start..end]
    }
}
