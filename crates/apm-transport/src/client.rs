// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Network boundary of the transport. Channels only talk to these traits, so tests swap in
//! in-memory peers and production uses the TCP implementations in [`crate::tcp`].

use apm_codec::message::Ack;
use async_trait::async_trait;

use crate::channel::Frame;
use crate::errors::TransportError;

/// Opens client streams for one streaming channel.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ClientStream>, TransportError>;
}

/// One open client stream. Dropping it releases the connection.
#[async_trait]
pub trait ClientStream: Send {
    /// Writes one frame. An error means the stream is unusable and the frame was not delivered.
    async fn on_next(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Half-closes the stream after the last frame.
    async fn on_completed(&mut self) -> Result<(), TransportError>;

    /// Resolves once the peer closed the stream or the connection broke.
    async fn closed(&mut self) -> TransportError;
}

/// Unary request/response client for metadata.
#[async_trait]
pub trait UnaryClient: Send + Sync {
    async fn request(&self, request_id: u64, frame: &Frame) -> Result<Ack, TransportError>;

    /// Releases any open connection.
    async fn close(&self) {}
}
