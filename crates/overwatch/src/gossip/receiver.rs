//! UDP gossip receiver.
//!
//! Decrypts and decodes each datagram, then hands the message to the
//! handler queue without ever blocking on it.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::sync::mpsc::error::TrySendError;

use gslb_common::GossipMessage;

use super::HandlerStats;
use super::frame;

/// Largest UDP payload
const MAX_DATAGRAM: usize = 65_536;

pub struct GossipReceiver {
    socket: UdpSocket,
    key: [u8; 32],
    queue: mpsc::Sender<GossipMessage>,
    stats: Arc<HandlerStats>,
}

impl GossipReceiver {
    pub async fn bind(
        bind_addr: &str,
        key: [u8; 32],
        queue: mpsc::Sender<GossipMessage>,
        stats: Arc<HandlerStats>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .context("Failed to bind gossip receiver socket")?;

        Ok(Self {
            socket,
            key,
            queue,
            stats,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive until shutdown
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        tracing::info!(
            addr = ?self.socket.local_addr().ok(),
            "Gossip receiver started"
        );

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => self.handle_datagram(&buf[..len], addr),
                        Err(e) => {
                            tracing::warn!(error = %e, "Gossip receive error");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Gossip receiver shutting down");
                    break;
                }
            }
        }
    }

    fn handle_datagram(&self, data: &[u8], addr: SocketAddr) {
        let body = match frame::open(&self.key, data) {
            Ok(body) => body,
            Err(e) => {
                HandlerStats::incr(&self.stats.bad_frames);
                tracing::warn!(addr = %addr, error = %e, "Dropping undecryptable gossip");
                return;
            }
        };

        let msg = match GossipMessage::decode(&body) {
            Ok(msg) => msg,
            Err(e) => {
                HandlerStats::incr(&self.stats.decode_errors);
                tracing::warn!(addr = %addr, error = %e, "Invalid gossip message");
                return;
            }
        };

        tracing::trace!(
            addr = %addr,
            agent_id = %msg.agent_id,
            kind = %msg.message_type(),
            "Received gossip"
        );

        match self.queue.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                HandlerStats::incr(&self.stats.queue_full);
                tracing::warn!(
                    agent_id = %msg.agent_id,
                    kind = %msg.message_type(),
                    "Gossip queue full, dropping message"
                );
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Gossip handler gone, dropping message");
            }
        }
    }
}
