//! Transport layer for network communication.
//!
//! A transport moves [`NetworkMessage`] envelopes to a peer's listen address
//! and hands everything it receives to a single inbound channel. Frames are
//! one-way: replies travel over the replier's own outbound connection.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::message::NetworkMessage;

/// Capacity of the inbound queue shared by all connections.
const INBOUND_QUEUE: usize = 10_000;

/// Capacity of each outbound connection's queue.
const OUTBOUND_QUEUE: usize = 1_000;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connecting to {0} timed out")]
    Timeout(String),

    #[error("no route to {0}")]
    Unreachable(String),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("message of {0} bytes exceeds the frame limit")]
    TooLarge(usize),

    #[error("encoding failed: {0}")]
    Encode(#[from] bincode::Error),

    #[error("transport is closed")]
    Closed,
}

/// Moves envelopes between listen addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start listening. Returns the address peers should dial.
    async fn start(&self) -> Result<String, TransportError>;

    /// Address peers should dial.
    fn local_addr(&self) -> String;

    /// Deliver a message to the peer listening on `addr`.
    async fn send(&self, addr: &str, message: NetworkMessage) -> Result<(), TransportError>;

    /// Take the inbound message receiver. Only the first call gets it.
    fn take_receiver(&self) -> Option<mpsc::Receiver<NetworkMessage>>;

    /// Drop the outbound connection to `addr`, if any.
    ///
    /// Returns whether a connection was open. A later send reconnects.
    fn disconnect(&self, addr: &str) -> bool;

    /// Stop listening and drop every connection.
    async fn shutdown(&self);
}

/// TCP transport configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,

    /// Address announced to peers, defaults to the bound address
    pub advertise_addr: Option<String>,

    /// Maximum message size (bytes)
    pub max_message_size: usize,

    /// Connection timeout
    pub connect_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 30303)),
            advertise_addr: None,
            max_message_size: 1024 * 1024, // 1 MB
            connect_timeout_ms: 5000,
        }
    }
}

/// TCP transport with length-prefixed frames.
pub struct TcpTransport {
    /// Configuration
    config: TransportConfig,

    /// Bound listen address, once started
    bound_addr: RwLock<Option<SocketAddr>>,

    /// Outbound connection queues by peer address
    connections: RwLock<HashMap<String, mpsc::Sender<Vec<u8>>>>,

    /// Channel for incoming messages
    incoming_tx: mpsc::Sender<NetworkMessage>,
    incoming_rx: Mutex<Option<mpsc::Receiver<NetworkMessage>>>,

    /// Listener and writer tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,

    closed: AtomicBool,
}

impl TcpTransport {
    /// Create a new TCP transport.
    pub fn new(config: TransportConfig) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);

        Self {
            config,
            bound_addr: RwLock::new(None),
            connections: RwLock::new(HashMap::new()),
            incoming_tx: tx,
            incoming_rx: Mutex::new(Some(rx)),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Get number of outbound connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Open an outbound connection and spawn its writer.
    async fn connect(&self, addr: &str) -> Result<mpsc::Sender<Vec<u8>>, TransportError> {
        let socket: SocketAddr = addr
            .parse()
            .map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;

        let stream = tokio::time::timeout(
            Duration::from_millis(self.config.connect_timeout_ms),
            TcpStream::connect(socket),
        )
        .await
        .map_err(|_| TransportError::Timeout(addr.to_string()))??;
        stream.set_nodelay(true)?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        let peer_addr = addr.to_string();

        let writer = tokio::spawn(async move {
            let mut writer = stream;
            while let Some(data) = rx.recv().await {
                // Write length prefix (4 bytes)
                let len = (data.len() as u32).to_be_bytes();
                if writer.write_all(&len).await.is_err() {
                    break;
                }
                if writer.write_all(&data).await.is_err() {
                    break;
                }
            }
            debug!("Writer to {} finished", peer_addr);
        });

        {
            let mut tasks = self.tasks.lock();
            tasks.retain(|t| !t.is_finished());
            tasks.push(writer);
        }
        self.connections.write().insert(addr.to_string(), tx.clone());
        Ok(tx)
    }

    /// Read frames from an accepted connection until it closes.
    async fn read_frames(
        mut stream: TcpStream,
        remote: SocketAddr,
        max_size: usize,
        incoming_tx: mpsc::Sender<NetworkMessage>,
    ) {
        let mut len_buf = [0u8; 4];

        loop {
            // Read length prefix
            if stream.read_exact(&mut len_buf).await.is_err() {
                break;
            }

            let len = u32::from_be_bytes(len_buf) as usize;

            // Validate message size
            if len > max_size {
                warn!("Dropping connection from {}: frame of {} bytes", remote, len);
                break;
            }

            // Read message
            let mut data = vec![0u8; len];
            if stream.read_exact(&mut data).await.is_err() {
                break;
            }

            // Parse message
            match NetworkMessage::from_bytes(&data) {
                Some(msg) => {
                    if incoming_tx.send(msg).await.is_err() {
                        break;
                    }
                }
                None => debug!("Undecodable frame from {}", remote),
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> Result<String, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let bound = listener.local_addr()?;
        *self.bound_addr.write() = Some(bound);
        info!("Listening on {}", bound);

        let incoming_tx = self.incoming_tx.clone();
        let max_size = self.config.max_message_size;

        let accept_loop = tokio::spawn(async move {
            // Dropping the set aborts every reader with the listener.
            let mut readers = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, remote)) => {
                            readers.spawn(TcpTransport::read_frames(
                                stream,
                                remote,
                                max_size,
                                incoming_tx.clone(),
                            ));
                        }
                        Err(e) => {
                            warn!("Accept failed: {}", e);
                        }
                    },
                    Some(_) = readers.join_next(), if !readers.is_empty() => {}
                }
            }
        });
        self.tasks.lock().push(accept_loop);

        Ok(self.local_addr())
    }

    fn local_addr(&self) -> String {
        if let Some(advertised) = &self.config.advertise_addr {
            return advertised.clone();
        }
        let bound = *self.bound_addr.read();
        bound.unwrap_or(self.config.listen_addr).to_string()
    }

    async fn send(&self, addr: &str, message: NetworkMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let bytes = message.to_bytes()?;
        if bytes.len() > self.config.max_message_size {
            return Err(TransportError::TooLarge(bytes.len()));
        }

        let cached = self.connections.read().get(addr).cloned();
        let sender = match cached {
            Some(sender) if !sender.is_closed() => sender,
            _ => self.connect(addr).await?,
        };

        if sender.send(bytes).await.is_err() {
            self.connections.write().remove(addr);
            return Err(TransportError::Unreachable(addr.to_string()));
        }
        Ok(())
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<NetworkMessage>> {
        self.incoming_rx.lock().take()
    }

    fn disconnect(&self, addr: &str) -> bool {
        // The writer exits once its queue sender is gone, closing the socket.
        let removed = self.connections.write().remove(addr).is_some();
        if removed {
            debug!("Closed outbound connection to {}", addr);
        }
        removed
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connections.write().clear();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("TCP transport shut down");
    }
}
