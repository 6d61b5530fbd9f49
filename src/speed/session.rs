//! Per-connection protocol handling.
//!
//! Every accepted socket is split: the session task reads and interprets
//! messages, while a writer task owns the outbound half and is the single
//! place bytes are written, so heartbeats, tickets and error replies never
//! interleave. A connection identifies as a camera or a dispatcher at most
//! once; breaking any protocol rule gets a descriptive `Error` reply and
//! the connection is closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use super::engine::{Observation, ViolationEngine};
use super::protocol::{self, Message};
use super::registry::{DispatchRegistry, DispatcherHandle};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

enum Role {
    Unidentified,
    Camera { road: u16, mile: u16, limit: u16 },
    Dispatcher,
}

struct Session {
    id: u64,
    role: Role,
    heartbeat_requested: bool,
    heartbeat: Option<JoinHandle<()>>,
    outbox: mpsc::UnboundedSender<Message>,
}

/// Handle one client connection from accept to teardown.
pub(crate) async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    engine: ViolationEngine,
    registry: Arc<DispatchRegistry>,
) {
    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(conn = id, %peer, "connection accepted");

    let (read_half, write_half) = stream.into_split();
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(id, write_half, outbox_rx, Arc::clone(&registry)));

    let mut session = Session {
        id,
        role: Role::Unidentified,
        heartbeat_requested: false,
        heartbeat: None,
        outbox,
    };
    session.read_loop(read_half, &engine, &registry).await;

    // Teardown: stop the heartbeat timer and make sure the registry stops
    // targeting this connection before the session object goes away.
    if let Some(heartbeat) = session.heartbeat.take() {
        heartbeat.abort();
    }
    if matches!(session.role, Role::Dispatcher) {
        registry.unregister(id).await;
    }
    info!(conn = id, %peer, "connection closed");
}

impl Session {
    async fn read_loop(
        &mut self,
        read_half: OwnedReadHalf,
        engine: &ViolationEngine,
        registry: &Arc<DispatchRegistry>,
    ) {
        let mut reader = BufReader::new(read_half);
        loop {
            let message = match protocol::read_message(&mut reader).await {
                Ok(message) => message,
                Err(protocol::DecodeError::Closed) => return,
                Err(err) if err.is_reportable() => {
                    self.refuse(err.to_string());
                    return;
                }
                Err(err) => {
                    debug!(conn = self.id, %err, "dropping broken stream");
                    return;
                }
            };

            debug!(conn = self.id, kind = message.kind(), "received");
            if !self.apply(message, engine, registry).await {
                return;
            }
        }
    }

    /// Apply one message to the session state machine. Returns `false`
    /// once the connection should be closed.
    async fn apply(
        &mut self,
        message: Message,
        engine: &ViolationEngine,
        registry: &Arc<DispatchRegistry>,
    ) -> bool {
        match message {
            Message::Plate { plate, timestamp } => match self.role {
                Role::Camera { road, mile, limit } => {
                    engine.observe(Observation {
                        plate,
                        road,
                        mile,
                        timestamp,
                        limit,
                    });
                    true
                }
                _ => {
                    self.refuse("must be a camera to send plates");
                    false
                }
            },

            Message::WantHeartbeat { interval } => {
                if self.heartbeat_requested {
                    self.refuse("cannot send WantHeartbeat twice");
                    return false;
                }
                self.heartbeat_requested = true;
                if interval > 0 {
                    self.start_heartbeat(interval);
                }
                true
            }

            Message::IAmCamera { road, mile, limit } => {
                if !matches!(self.role, Role::Unidentified) {
                    self.refuse("cannot identify yourself twice");
                    return false;
                }
                info!(conn = self.id, road, mile, limit, "identified as camera");
                self.role = Role::Camera { road, mile, limit };
                true
            }

            Message::IAmDispatcher { roads } => {
                if !matches!(self.role, Role::Unidentified) {
                    self.refuse("cannot identify yourself twice");
                    return false;
                }
                info!(conn = self.id, ?roads, "identified as dispatcher");
                registry
                    .register(
                        &roads,
                        DispatcherHandle {
                            id: self.id,
                            outbox: self.outbox.clone(),
                        },
                    )
                    .await;
                self.role = Role::Dispatcher;
                true
            }

            server_only @ (Message::Error { .. } | Message::Ticket { .. } | Message::Heartbeat) => {
                self.refuse(format!("clients cannot send {}", server_only.kind()));
                false
            }
        }
    }

    /// Send an `Error` reply; the writer closes the connection after it.
    fn refuse(&self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!(conn = self.id, error = %msg, "protocol violation");
        let _ = self.outbox.send(Message::Error { msg });
    }

    fn start_heartbeat(&mut self, interval: u32) {
        let period = Duration::from_millis(u64::from(interval) * 100);
        debug!(conn = self.id, ?period, "heartbeat started");
        let outbox = self.outbox.clone();
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            // The first tick of an interval completes immediately; the
            // first heartbeat is due one full period after the request.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if outbox.send(Message::Heartbeat).is_err() {
                    return;
                }
            }
        }));
    }
}

/// Single writer for one connection. Everything outbound funnels through
/// here; tickets that can no longer be written go back to the registry.
async fn write_loop(
    id: u64,
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<Message>,
    registry: Arc<DispatchRegistry>,
) {
    while let Some(message) = outbox.recv().await {
        let bytes = message.encode();
        if let Err(err) = writer.write_all(&bytes).await {
            warn!(conn = id, %err, "write failed");
            registry.recover(message).await;
            while let Ok(pending) = outbox.try_recv() {
                registry.recover(pending).await;
            }
            return;
        }
        debug!(conn = id, tx = %hex::encode(&bytes), "sent");

        if matches!(message, Message::Error { .. }) {
            let _ = writer.shutdown().await;
            return;
        }
    }
}
