//! Ticket routing to dispatcher connections.
//!
//! Each road gets its own delivery queue and delivery loop, created the
//! first time anything references the road. The loop sleeps while no
//! dispatcher covers the road and drains the queue one ticket at a time
//! once one does. A ticket that cannot be handed over (the chosen
//! dispatcher vanished in between) is kept and offered to the next
//! dispatcher instead of being dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, mpsc};
use tracing::{debug, warn};

use super::engine::Ticket;
use super::protocol::Message;

/// Weak reference to a dispatcher connection: its id plus the sending end
/// of its outbound queue. The connection's own task owns the socket; a
/// closed queue is how the registry learns the connection is gone.
#[derive(Clone)]
pub struct DispatcherHandle {
    pub id: u64,
    pub outbox: mpsc::UnboundedSender<Message>,
}

impl DispatcherHandle {
    fn is_live(&self) -> bool {
        !self.outbox.is_closed()
    }
}

#[derive(Default)]
pub struct DispatchRegistry {
    /// road -> sending end of that road's delivery queue, created lazily.
    lanes: Mutex<HashMap<u16, mpsc::UnboundedSender<Ticket>>>,
    /// road -> dispatchers currently registered for it, in arrival order.
    dispatchers: Mutex<HashMap<u16, Vec<DispatcherHandle>>>,
    /// Signalled whenever a dispatcher registers.
    joined: Notify,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `handle` a delivery target for every road in `roads`.
    pub async fn register(&self, roads: &[u16], handle: DispatcherHandle) {
        {
            let mut dispatchers = self.dispatchers.lock().await;
            for &road in roads {
                dispatchers.entry(road).or_default().push(handle.clone());
            }
        }
        self.joined.notify_waiters();
    }

    /// Remove every registration for the connection `id`. Called on
    /// connection teardown, before the connection object is discarded.
    pub async fn unregister(&self, id: u64) {
        let mut dispatchers = self.dispatchers.lock().await;
        for handles in dispatchers.values_mut() {
            handles.retain(|handle| handle.id != id);
        }
    }

    /// Queue a ticket for delivery on its road. Never blocks beyond
    /// creating the road's queue and loop on first use.
    pub async fn issue(self: &Arc<Self>, ticket: Ticket) {
        let lane = {
            let mut lanes = self.lanes.lock().await;
            lanes
                .entry(ticket.road)
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    tokio::spawn(Arc::clone(self).deliver_road(ticket.road, rx));
                    tx
                })
                .clone()
        };
        // The receiver lives as long as the registry; this cannot fail
        // outside shutdown.
        let _ = lane.send(ticket);
    }

    /// Put an undeliverable outbound message back into circulation.
    ///
    /// Connection writer tasks call this for whatever was still queued when
    /// their socket died. Only tickets carry state worth saving; everything
    /// else is connection-local and evaporates with the connection.
    pub async fn recover(self: &Arc<Self>, message: Message) {
        if let Message::Ticket {
            plate,
            road,
            mile1,
            timestamp1,
            mile2,
            timestamp2,
            speed_x100,
        } = message
        {
            warn!(%plate, road, "recovering undelivered ticket");
            self.issue(Ticket {
                plate,
                road,
                mile1,
                timestamp1,
                mile2,
                timestamp2,
                speed_x100,
            })
            .await;
        }
    }

    /// Delivery loop for one road. Runs for the life of the process.
    async fn deliver_road(self: Arc<Self>, road: u16, mut tickets: mpsc::UnboundedReceiver<Ticket>) {
        let mut undelivered: Option<Ticket> = None;
        loop {
            let target = self.next_dispatcher(road).await;
            loop {
                let ticket = match undelivered.take() {
                    Some(ticket) => ticket,
                    None => match tickets.recv().await {
                        Some(ticket) => ticket,
                        None => return,
                    },
                };
                debug!(road, plate = %ticket.plate, conn = target.id, "delivering ticket");
                if target.outbox.send(ticket.clone().into_message()).is_err() {
                    // The dispatcher dropped between selection and handoff;
                    // keep the ticket for whoever registers next.
                    undelivered = Some(ticket);
                    break;
                }
            }
        }
    }

    /// Wait until some live dispatcher is registered for `road` and return
    /// it. Ties go to the earliest registration still alive.
    async fn next_dispatcher(&self, road: u16) -> DispatcherHandle {
        loop {
            // Arm the notification before checking, so a register() landing
            // in between cannot be missed.
            let joined = self.joined.notified();
            {
                let dispatchers = self.dispatchers.lock().await;
                let live = dispatchers
                    .get(&road)
                    .and_then(|handles| handles.iter().find(|handle| handle.is_live()));
                if let Some(handle) = live {
                    return handle.clone();
                }
            }
            joined.await;
        }
    }
}
