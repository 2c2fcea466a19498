// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use apm_transport::channel::{decode_frame, decode_request, encode_frame, Frame};
use apm_transport::tcp::frame_codec;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::receiver::CollectorReceiver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listener {
    Span,
    Stat,
    Metadata,
}

/// Accepts agent connections on the span, stat and metadata ports.
///
/// A connection lives until the agent closes it, its framing breaks, or the server is cancelled.
/// Frames that fail to decode or store are dropped one at a time.
pub struct CollectorServer {
    span: TcpListener,
    stat: TcpListener,
    metadata: TcpListener,
    receiver: Arc<CollectorReceiver>,
    max_frame_length: usize,
    cancel_token: CancellationToken,
}

impl CollectorServer {
    pub async fn bind(
        config: &CollectorConfig,
        receiver: Arc<CollectorReceiver>,
        cancel_token: CancellationToken,
    ) -> std::io::Result<CollectorServer> {
        let server = CollectorServer {
            span: TcpListener::bind(config.span_address()).await?,
            stat: TcpListener::bind(config.stat_address()).await?,
            metadata: TcpListener::bind(config.metadata_address()).await?,
            receiver,
            max_frame_length: config.max_frame_length,
            cancel_token,
        };
        info!(
            "Collector listening on span {}, stat {}, metadata {}",
            server.span.local_addr()?,
            server.stat.local_addr()?,
            server.metadata.local_addr()?
        );
        Ok(server)
    }

    /// Bound addresses of the span, stat and metadata listeners.
    pub fn local_addrs(&self) -> std::io::Result<(SocketAddr, SocketAddr, SocketAddr)> {
        Ok((
            self.span.local_addr()?,
            self.stat.local_addr()?,
            self.metadata.local_addr()?,
        ))
    }

    /// Serves until the cancel token fires.
    pub async fn spin(self) {
        let CollectorServer {
            span,
            stat,
            metadata,
            receiver,
            max_frame_length,
            cancel_token,
        } = self;
        let accept = |listener, kind| {
            tokio::spawn(accept_loop(
                listener,
                kind,
                Arc::clone(&receiver),
                max_frame_length,
                cancel_token.clone(),
            ))
        };
        let loops = [
            accept(span, Listener::Span),
            accept(stat, Listener::Stat),
            accept(metadata, Listener::Metadata),
        ];
        for handle in loops {
            if let Err(e) = handle.await {
                error!("Collector accept loop failed: {}", e);
            }
        }
        info!("Collector stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    kind: Listener,
    receiver: Arc<CollectorReceiver>,
    max_frame_length: usize,
    cancel_token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel_token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!("Accepted {:?} connection from {}", kind, peer);
                let _ = stream.set_nodelay(true);
                tokio::spawn(serve_connection(
                    stream,
                    peer,
                    kind,
                    Arc::clone(&receiver),
                    max_frame_length,
                    cancel_token.clone(),
                ));
            }
            Err(e) => warn!("Failed to accept {:?} connection: {}", kind, e),
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    kind: Listener,
    receiver: Arc<CollectorReceiver>,
    max_frame_length: usize,
    cancel_token: CancellationToken,
) {
    let mut framed = Framed::new(stream, frame_codec(max_frame_length));
    loop {
        let next = tokio::select! {
            _ = cancel_token.cancelled() => break,
            next = framed.next() => next,
        };
        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                warn!("Closing connection from {}: {}", peer, e);
                break;
            }
            None => {
                debug!("Connection from {} closed", peer);
                break;
            }
        };

        if kind == Listener::Metadata {
            let (request_id, frame) = match decode_request(&bytes) {
                Ok(request) => request,
                Err(e) => {
                    receiver.record_unreadable(peer, &e);
                    continue;
                }
            };
            let ack = receiver.handle_request(request_id, frame).await;
            if let Err(e) = framed.send(encode_frame(&Frame::ack(&ack))).await {
                warn!("Failed to answer request {} from {}: {}", request_id, peer, e);
                break;
            }
        } else {
            match decode_frame(&bytes) {
                // Failures are counted and logged by the receiver.
                Ok(frame) => {
                    let _ = receiver.handle(frame).await;
                }
                Err(e) => receiver.record_unreadable(peer, &e),
            }
        }
    }
}
