//! ConnectionBroadcaster - fan-out of bus messages to observer connections
//!
//! The connection set is written by several independent tasks (status monitor
//! ticks, command handling, upload handling, connection setup/teardown), so it
//! sits behind its own mutex. Deliveries never block: a connection that cannot
//! take a message right now is treated as dead and evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use super::{BusMessage, Category};

/// Identifier handed out on registration
pub type ConnectionId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("connection backlog full")]
    Backlogged,
}

/// A delivery target. Implementations must not block.
pub trait Connection: Send + Sync {
    fn deliver(&self, message: &BusMessage) -> Result<(), DeliveryError>;
}

/// Connection backed by a bounded channel; the transport task drains the
/// receiver and writes to the socket.
pub struct ChannelConnection {
    tx: mpsc::Sender<BusMessage>,
}

impl ChannelConnection {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BusMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl Connection for ChannelConnection {
    fn deliver(&self, message: &BusMessage) -> Result<(), DeliveryError> {
        self.tx.try_send(message.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backlogged,
        })
    }
}

struct Registered {
    id: ConnectionId,
    connection: Arc<dyn Connection>,
}

/// Registry of observer connections by category
#[derive(Default)]
pub struct ConnectionBroadcaster {
    next_id: AtomicU64,
    connections: Mutex<HashMap<Category, Vec<Registered>>>,
}

impl ConnectionBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under a category
    pub fn register(&self, connection: Arc<dyn Connection>, category: Category) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(category)
            .or_default()
            .push(Registered { id, connection });
        debug!(connection = id, %category, "Observer registered");
        id
    }

    /// Remove a connection. Returns false if it was already gone (e.g. evicted).
    pub fn unregister(&self, id: ConnectionId, category: Category) -> bool {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = connections.get_mut(&category) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.id != id);
        let removed = list.len() != before;
        if removed {
            debug!(connection = id, %category, "Observer unregistered");
        }
        removed
    }

    /// Deliver to every connection in a category, evicting the ones that fail.
    /// Returns the number of successful deliveries.
    pub fn send(&self, category: Category, message: &BusMessage) -> usize {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match connections.get_mut(&category) {
            Some(list) => deliver_to(list, category, message),
            None => 0,
        }
    }

    /// Deliver to every connection in every category
    pub fn send_all(&self, message: &BusMessage) -> usize {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        connections
            .iter_mut()
            .map(|(category, list)| deliver_to(list, *category, message))
            .sum()
    }

    /// Drop every connection; their transports see the channel close
    pub fn close_all(&self) -> usize {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let closed = connections.values().map(Vec::len).sum();
        connections.clear();
        debug!(closed, "All observers closed");
        closed
    }

    pub fn connection_count(&self, category: Category) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&category)
            .map_or(0, Vec::len)
    }

    pub fn total_connections(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

// Delivery happens with the registry locked so two concurrent senders cannot
// interleave their messages differently on different connections.
fn deliver_to(list: &mut Vec<Registered>, category: Category, message: &BusMessage) -> usize {
    let mut delivered = 0;
    list.retain(|r| match r.connection.deliver(message) {
        Ok(()) => {
            delivered += 1;
            true
        }
        Err(e) => {
            debug!(connection = r.id, %category, "Evicting observer: {}", e);
            false
        }
    });
    delivered
}

/// Shared broadcaster
pub type SharedBroadcaster = Arc<ConnectionBroadcaster>;

pub fn create_broadcaster() -> SharedBroadcaster {
    Arc::new(ConnectionBroadcaster::new())
}
