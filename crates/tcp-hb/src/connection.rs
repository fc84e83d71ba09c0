// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat framing over a byte stream.
//!
//! The transport may coalesce several messages into one read or split a
//! message across reads, so [`FrameReader`] buffers until a full
//! [`MESSAGE_LEN`]-byte frame is available. Works over any
//! `AsyncRead`/`AsyncWrite` half (TCP, `tokio::io::duplex`, ...).

use crate::protocol::{self, HeartbeatMessage, ProtocolError, MESSAGE_LEN};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 512;

/// Reading half of a heartbeat connection.
pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
    scratch: [u8; READ_CHUNK],
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reading half.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(READ_CHUNK),
            scratch: [0u8; READ_CHUNK],
        }
    }

    /// Read the next raw frame.
    ///
    /// Returns `Ok(None)` if the peer closed the stream on a frame boundary.
    /// Cancel-safe: bytes are only moved into the buffer once a read has
    /// completed, so this may be raced against a timeout.
    pub async fn read_frame(&mut self) -> Result<Option<[u8; MESSAGE_LEN]>, ConnectionError> {
        loop {
            if self.buffer.len() >= MESSAGE_LEN {
                let mut frame = [0u8; MESSAGE_LEN];
                frame.copy_from_slice(&self.buffer[..MESSAGE_LEN]);
                self.buffer.drain(..MESSAGE_LEN);
                return Ok(Some(frame));
            }

            let n = self.inner.read(&mut self.scratch).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ConnectionError::Closed {
                    partial: self.buffer.len(),
                });
            }
            self.buffer.extend_from_slice(&self.scratch[..n]);
        }
    }

    /// Read and decode the next message.
    ///
    /// A frame with an unknown tag yields `ConnectionError::Protocol`; the
    /// stream stays aligned, so the caller may keep reading.
    pub async fn read_message(&mut self) -> Result<Option<HeartbeatMessage>, ConnectionError> {
        match self.read_frame().await? {
            Some(frame) => Ok(Some(protocol::decode(&frame)?)),
            None => Ok(None),
        }
    }
}

/// Writing half of a heartbeat connection.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writing half.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one raw frame and flush it.
    pub async fn write_frame(&mut self, frame: &[u8; MESSAGE_LEN]) -> Result<(), ConnectionError> {
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Encode and write one message.
    pub async fn write_message(&mut self, msg: &HeartbeatMessage) -> Result<(), ConnectionError> {
        self.write_frame(&msg.encode()).await
    }

    /// Shutdown the write direction.
    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Connection error types.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed mid-frame ({partial} bytes buffered)")]
    Closed { partial: usize },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// Whether the connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}
