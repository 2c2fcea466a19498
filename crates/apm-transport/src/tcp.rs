// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use apm_codec::message::Ack;

use crate::channel::{decode_ack, encode_frame, encode_request, Frame};
use crate::client::{ClientStream, StreamConnector, UnaryClient};
use crate::errors::TransportError;

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Length-delimited codec shared by both ends of every connection.
pub fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

type FramedTcp = Framed<TcpStream, LengthDelimitedCodec>;

async fn open(address: &str, max_frame_length: usize) -> Result<FramedTcp, TransportError> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    debug!("Connected to {}", address);
    Ok(Framed::new(stream, frame_codec(max_frame_length)))
}

pub struct TcpStreamConnector {
    address: String,
    max_frame_length: usize,
}

impl TcpStreamConnector {
    pub fn new(address: impl Into<String>, max_frame_length: usize) -> Self {
        TcpStreamConnector {
            address: address.into(),
            max_frame_length,
        }
    }
}

#[async_trait]
impl StreamConnector for TcpStreamConnector {
    async fn connect(&self) -> Result<Box<dyn ClientStream>, TransportError> {
        let (sink, stream) = open(&self.address, self.max_frame_length).await?.split();
        Ok(Box::new(TcpClientStream { sink, stream }))
    }
}

struct TcpClientStream {
    sink: SplitSink<FramedTcp, Bytes>,
    stream: SplitStream<FramedTcp>,
}

#[async_trait]
impl ClientStream for TcpClientStream {
    async fn on_next(&mut self, frame: &Frame) -> Result<(), TransportError> {
        self.sink.send(encode_frame(frame)).await?;
        Ok(())
    }

    async fn on_completed(&mut self) -> Result<(), TransportError> {
        self.sink.close().await?;
        Ok(())
    }

    async fn closed(&mut self) -> TransportError {
        // The collector never writes on a streaming connection, anything it sends is ignored.
        loop {
            match self.stream.next().await {
                Some(Ok(_)) => continue,
                Some(Err(e)) => return TransportError::Io(e),
                None => return TransportError::ConnectionClosed,
            }
        }
    }
}

/// Sends one request at a time over a lazily opened connection and waits for its ack.
pub struct TcpUnaryClient {
    address: String,
    max_frame_length: usize,
    request_timeout: Duration,
    connection: Mutex<Option<FramedTcp>>,
}

impl TcpUnaryClient {
    pub fn new(address: impl Into<String>, max_frame_length: usize, request_timeout: Duration) -> Self {
        TcpUnaryClient {
            address: address.into(),
            max_frame_length,
            request_timeout,
            connection: Mutex::new(None),
        }
    }

    async fn exchange(
        framed: &mut FramedTcp,
        request_id: u64,
        frame: &Frame,
    ) -> Result<Ack, TransportError> {
        framed.send(encode_request(request_id, frame)).await?;
        match framed.next().await {
            Some(Ok(bytes)) => decode_ack(&bytes, request_id),
            Some(Err(e)) => Err(TransportError::Io(e)),
            None => Err(TransportError::ConnectionClosed),
        }
    }
}

#[async_trait]
impl UnaryClient for TcpUnaryClient {
    async fn request(&self, request_id: u64, frame: &Frame) -> Result<Ack, TransportError> {
        let mut connection = self.connection.lock().await;
        if connection.is_none() {
            *connection = Some(open(&self.address, self.max_frame_length).await?);
        }
        let Some(framed) = connection.as_mut() else {
            return Err(TransportError::ConnectionClosed);
        };

        let result = tokio::time::timeout(
            self.request_timeout,
            Self::exchange(framed, request_id, frame),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout(self.request_timeout)));

        if result.is_err() {
            // The connection may hold a late ack, never reuse it.
            *connection = None;
        }
        result
    }

    async fn close(&self) {
        if let Some(mut framed) = self.connection.lock().await.take() {
            let _ = SinkExt::<Bytes>::close(&mut framed).await;
        }
    }
}
