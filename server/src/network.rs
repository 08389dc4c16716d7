//! Server network layer handling WebSocket connections
//!
//! Each accepted TCP stream is upgraded to a WebSocket and given its own
//! reader loop and writer task. The reader turns frames into relay events;
//! the writer drains a bounded per-connection queue, so a slow client only
//! ever fills its own queue and never holds up anyone else.
//!
//! Plain HTTP requests that do not ask for an upgrade are answered with a
//! short text banner and closed, which lets load balancers and operators use
//! the same port as a liveness check.

use crate::error::ChannelError;
use crate::registry::{ConnectionId, Registry};
use crate::relay::{Channel, Event, Relay};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::ServerMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub const DEFAULT_QUEUE_SIZE: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Body returned to plain HTTP requests
pub const INDEX_BANNER: &str = "Position relay server is running!";

/// How long a closing connection may spend flushing its queue
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest request head inspected before deciding how to serve a connection
const MAX_REQUEST_HEAD: usize = 8192;
const PREFACE_TIMEOUT: Duration = Duration::from_secs(5);

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Tunables for the WebSocket front end
///
/// Values are normalised by [`Server::bind`]: a zero queue size is raised
/// to one so every connection can hold at least one pending message.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Capacity of each connection's outbound queue
    pub queue_size: usize,
    /// A connection that sends nothing (not even a pong) for this long is
    /// treated as dead
    pub idle_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_QUEUE_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl ServerSettings {
    fn normalized(mut self) -> Self {
        self.queue_size = self.queue_size.max(1);
        self
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.idle_timeout / 2).max(Duration::from_millis(10))
    }
}

/// Outbound queues of every open WebSocket, keyed by connection id
///
/// The hub is the transport side of [`Channel`]: the relay decides who gets
/// a message, the hub only knows how to reach one connection. Sends never
/// wait; a full queue is reported back as [`ChannelError::Full`].
#[derive(Debug, Default)]
pub struct Hub {
    peers: DashMap<ConnectionId, mpsc::Sender<Message>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an outbound queue. Returns false if the id is already taken.
    pub fn attach(&self, id: ConnectionId, sender: mpsc::Sender<Message>) -> bool {
        match self.peers.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(sender);
                true
            }
        }
    }

    /// Drops the outbound queue of a closed connection
    ///
    /// Once every sender is gone the connection's writer task drains what is
    /// left and exits. Returns false if the id was not attached.
    pub fn detach(&self, id: &ConnectionId) -> bool {
        self.peers.remove(id).is_some()
    }

    /// Number of attached connections
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Channel for Hub {
    fn send(&self, to: &ConnectionId, message: &ServerMessage) -> Result<(), ChannelError> {
        let sender = self
            .peers
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ChannelError::Closed(to.clone()))?;

        let text = message.to_text()?;
        sender.try_send(Message::Text(text)).map_err(|err| match err {
            TrySendError::Full(_) => ChannelError::Full(to.clone()),
            TrySendError::Closed(_) => ChannelError::Closed(to.clone()),
        })
    }
}

/// What a freshly accepted connection is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Preface {
    WebSocket,
    /// Ordinary HTTP request whose head spans `head_len` bytes
    Plain { head_len: usize },
    Closed,
}

/// Classifies the start of an HTTP request
///
/// Returns `None` while the head is still incomplete. A head that never
/// terminates within [`MAX_REQUEST_HEAD`] bytes is treated as plain HTTP.
fn classify_request_head(bytes: &[u8]) -> Option<Preface> {
    let head_len = match bytes.windows(4).position(|window| window == b"\r\n\r\n") {
        Some(pos) => pos + 4,
        None if bytes.len() >= MAX_REQUEST_HEAD => bytes.len(),
        None => return None,
    };

    let head = String::from_utf8_lossy(&bytes[..head_len]).to_ascii_lowercase();
    let wants_upgrade = head.lines().skip(1).any(|line| match line.split_once(':') {
        Some((name, value)) => name.trim() == "upgrade" && value.contains("websocket"),
        None => false,
    });

    Some(if wants_upgrade {
        Preface::WebSocket
    } else {
        Preface::Plain { head_len }
    })
}

/// Peeks at the request head without consuming it, so the WebSocket
/// handshake can still read it afterwards
async fn read_preface(stream: &TcpStream) -> std::io::Result<Preface> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(Preface::Closed);
        }
        if let Some(preface) = classify_request_head(&buf[..n]) {
            return Ok(preface);
        }
        // peek returns as soon as anything is buffered; give the rest of the
        // head time to arrive
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Answers a non-upgrade request with the banner and closes the socket
async fn serve_index(mut stream: TcpStream, head_len: usize) -> ConnectionResult {
    let mut head = vec![0u8; head_len];
    stream.read_exact(&mut head).await?;

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        INDEX_BANNER.len(),
        INDEX_BANNER
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// WebSocket front end of the relay
pub struct Server {
    listener: TcpListener,
    relay: Arc<Relay<Arc<Hub>>>,
    settings: ServerSettings,
}

impl Server {
    /// Binds the listener and builds an empty registry and hub
    ///
    /// Nothing is accepted until [`Server::run`] is awaited. Binding to port
    /// 0 picks a free port; use [`Server::local_addr`] to find out which.
    pub async fn bind(
        addr: &str,
        settings: ServerSettings,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);

        let relay = Relay::new(Arc::new(Registry::new()), Arc::new(Hub::new()));

        Ok(Server {
            listener,
            relay: Arc::new(relay),
            settings: settings.normalized(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle to the registry backing this server
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.relay.registry())
    }

    /// Accepts connections until the task is dropped
    ///
    /// Every connection runs in its own task; a failing handshake or a
    /// broken socket is logged and only ends that connection.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Server started successfully");

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let relay = Arc::clone(&self.relay);
            let settings = self.settings.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, relay, settings).await {
                    warn!("Connection from {} ended with error: {}", addr, e);
                }
            });
        }
    }
}

/// Drives one client from handshake to disconnect
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay: Arc<Relay<Arc<Hub>>>,
    settings: ServerSettings,
) -> ConnectionResult {
    match timeout(PREFACE_TIMEOUT, read_preface(&stream)).await {
        Err(_) => return Err("timed out waiting for request head".into()),
        Ok(Err(e)) => return Err(e.into()),
        Ok(Ok(Preface::Closed)) => return Ok(()),
        Ok(Ok(Preface::Plain { head_len })) => {
            debug!("Serving index banner to {}", addr);
            return serve_index(stream, head_len).await;
        }
        Ok(Ok(Preface::WebSocket)) => {}
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(settings.queue_size);
    let hub = relay.channel();
    let id = loop {
        let candidate = ConnectionId::generate();
        if hub.attach(candidate.clone(), tx.clone()) {
            break candidate;
        }
    };
    info!("Client {} connected from {}", id, addr);

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_write.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    relay.dispatch(&id, Event::Connect).await;

    let mut heartbeat = interval(settings.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately
    heartbeat.tick().await;

    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = ws_read.next() => {
                last_seen = Instant::now();
                match frame {
                    Some(Ok(Message::Text(text))) => relay.handle_frame(&id, &text).await,
                    Some(Ok(Message::Binary(data))) => {
                        debug!("Ignoring {} byte binary frame from {}", data.len(), id);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Read error on {}: {}", id, e);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > settings.idle_timeout {
                    warn!("Client {} timed out", id);
                    break;
                }
                if let Err(TrySendError::Full(_)) = tx.try_send(Message::Ping(Vec::new())) {
                    debug!("Outbound queue for {} is full, skipping ping", id);
                }
            }
        }
    }

    relay.dispatch(&id, Event::Disconnect).await;
    hub.detach(&id);
    drop(tx);

    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!("Client {} from {} closed", id, addr);

    Ok(())
}
