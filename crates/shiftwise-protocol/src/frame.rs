// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for the worker link.
//!
//! Every message on the TCP stream is one frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - N bytes: JSON payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (4 MB). Work orders and responses are small.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type)
pub const HEADER_SIZE: usize = 6;

/// Message types carried on the worker link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Worker → orchestrator registration ([`crate::WorkerHello`])
    Hello = 1,
    /// Orchestrator → worker ([`crate::WorkOrder`])
    WorkOrder = 2,
    /// Worker → orchestrator ([`crate::TaskResponse`])
    TaskResponse = 3,
    /// Keepalive in either direction, empty payload
    Heartbeat = 4,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Hello),
            2 => Ok(MessageType::WorkOrder),
            3 => Ok(MessageType::TaskResponse),
            4 => Ok(MessageType::Heartbeat),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("unexpected message type: expected {expected:?}, got {actual:?}")]
    UnexpectedMessageType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with type and payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given type and message
    pub fn new<M: Serialize>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload: Bytes::from(payload),
        })
    }

    /// Heartbeat frame with an empty payload
    pub fn heartbeat() -> Self {
        Self {
            message_type: MessageType::Heartbeat,
            payload: Bytes::new(),
        }
    }

    /// Decode the payload
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decode the payload, requiring a specific message type
    pub fn decode_as<M: DeserializeOwned>(&self, expected: MessageType) -> Result<M, FrameError> {
        if self.message_type != expected {
            return Err(FrameError::UnexpectedMessageType {
                expected,
                actual: self.message_type,
            });
        }
        self.decode()
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let message_type = MessageType::try_from(bytes.get_u16())?;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self {
            message_type,
            payload,
        })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let message_type = MessageType::try_from(u16::from_be_bytes([header[4], header[5]]))?;

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        payload: Bytes::from(payload),
    })
}

/// Framed codec for encoding/decoding frames on a stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }

    /// Serialize and send a message
    pub async fn send<M: Serialize>(
        &mut self,
        message_type: MessageType,
        msg: &M,
    ) -> Result<(), FrameError> {
        let frame = Frame::new(message_type, msg)?;
        self.write_frame(&frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{TaskResponse, TaskResult, WorkerHello};

    #[test]
    fn test_message_type_conversions() {
        assert_eq!(MessageType::try_from(1u16).unwrap(), MessageType::Hello);
        assert_eq!(MessageType::try_from(2u16).unwrap(), MessageType::WorkOrder);
        assert_eq!(
            MessageType::try_from(3u16).unwrap(),
            MessageType::TaskResponse
        );
        assert_eq!(MessageType::try_from(4u16).unwrap(), MessageType::Heartbeat);
    }

    #[test]
    fn test_message_type_invalid_conversion() {
        assert!(MessageType::try_from(0u16).is_err());
        assert!(MessageType::try_from(5u16).is_err());
        assert!(MessageType::try_from(u16::MAX).is_err());
    }

    #[test]
    fn test_frame_encode_decode() {
        let hello = WorkerHello {
            worker_id: "worker-1".to_string(),
            version: "0.1.0".to_string(),
        };
        let frame = Frame::new(MessageType::Hello, &hello).unwrap();
        let decoded = Frame::decode_from_bytes(frame.encode()).unwrap();

        assert_eq!(decoded.message_type, MessageType::Hello);
        let back: WorkerHello = decoded.decode().unwrap();
        assert_eq!(back, hello);
    }

    #[test]
    fn test_decode_from_bytes_incomplete_header() {
        let result = Frame::decode_from_bytes(Bytes::from_static(&[0, 0, 1]));
        assert!(matches!(result, Err(FrameError::Io(_))));
    }

    #[test]
    fn test_decode_from_bytes_truncated_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_u16(MessageType::Heartbeat as u16);
        buf.put_slice(b"abc");
        let result = Frame::decode_from_bytes(buf.freeze());
        assert!(matches!(result, Err(FrameError::Io(_))));
    }

    #[test]
    fn test_decode_as_rejects_wrong_type() {
        let frame = Frame::heartbeat();
        let result: Result<TaskResponse, _> = frame.decode_as(MessageType::TaskResponse);
        assert!(matches!(
            result,
            Err(FrameError::UnexpectedMessageType {
                expected: MessageType::TaskResponse,
                actual: MessageType::Heartbeat,
            })
        ));
    }

    #[test]
    fn test_frame_error_display() {
        let msg = FrameError::FrameTooLarge(10_000_000).to_string();
        assert!(msg.contains("frame too large"));
        assert!(msg.contains(&MAX_FRAME_SIZE.to_string()));
        assert!(
            FrameError::ConnectionClosed
                .to_string()
                .contains("connection closed")
        );
    }

    #[tokio::test]
    async fn test_framed_stream_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = FramedStream::new(client);
        let mut server = FramedStream::new(server);

        let response = TaskResponse::success("act-1", TaskResult::Empty);
        client
            .send(MessageType::TaskResponse, &response)
            .await
            .unwrap();

        let frame = server.read_frame().await.unwrap();
        let received: TaskResponse = frame.decode_as(MessageType::TaskResponse).unwrap();
        assert_eq!(received, response);
    }

    #[tokio::test]
    async fn test_read_frame_reports_closed_connection() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut server = FramedStream::new(server);
        assert!(matches!(
            server.read_frame().await,
            Err(FrameError::ConnectionClosed)
        ));
    }
}
