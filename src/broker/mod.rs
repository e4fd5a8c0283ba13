//! Broker core
//!
//! The central shared state: the connection registry (id and lname
//! maps), the subscription table, and the bootstrap/shutdown signals.
//! All mutation happens under one process-wide mutex whose critical
//! sections never await; connection tasks and the control task are the
//! only writers.

pub mod dispatch;
pub mod outbound;

pub use outbound::SendBuffer;

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::control::{self, MemberEvent, MSGQ_GROUP};
use crate::lname::LnameGenerator;
use crate::subs::{ChannelKey, SubscriptionTable};
use crate::wire::header::WILDCARD;

/// Outcome of waiting for the config manager to appear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapWait {
    /// A client subscribed to the config manager group
    Ready,
    /// The broker was asked to stop before that happened
    Aborted,
}

/// Registry entry for one live connection
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    /// Logical name assigned at accept time
    pub lname: String,
    /// Queue drained by the connection's writer task
    pub outbound: mpsc::UnboundedSender<Bytes>,
}

/// State shared between connection tasks and the control task
#[derive(Debug)]
pub(crate) struct BrokerState {
    /// Connection id to registry entry
    pub connections: HashMap<u64, ConnectionHandle>,
    /// lname back to connection id
    pub lnames: HashMap<String, u64>,
    /// Channel subscriptions
    pub table: SubscriptionTable,
    /// Whether the control session exists and events should go out
    pub notifications_on: bool,
    lname_gen: LnameGenerator,
    next_conn_id: u64,
    next_seq: u64,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
            lnames: HashMap::new(),
            table: SubscriptionTable::new(),
            notifications_on: false,
            lname_gen: LnameGenerator::new(),
            next_conn_id: 1,
            next_seq: 1,
        }
    }

    fn insert_connection(&mut self, outbound: mpsc::UnboundedSender<Bytes>) -> (u64, String) {
        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let lname = self.lname_gen.next_lname();
        self.connections.insert(
            id,
            ConnectionHandle {
                lname: lname.clone(),
                outbound,
            },
        );
        self.lnames.insert(lname.clone(), id);
        (id, lname)
    }

    /// Next sequence id for a broker-originated message
    pub fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Hand encoded bytes to a connection's writer task.
    ///
    /// A closed queue means the connection is already tearing itself
    /// down; the delivery is simply skipped.
    pub fn enqueue(&self, conn: u64, bytes: Bytes) -> bool {
        match self.connections.get(&conn) {
            Some(handle) => handle.outbound.send(bytes).is_ok(),
            None => false,
        }
    }

    /// lname of a connection, if it is still registered
    pub fn lname_of(&self, conn: u64) -> Option<String> {
        self.connections.get(&conn).map(|handle| handle.lname.clone())
    }
}

/// The message bus broker
pub struct Broker {
    pub(crate) state: Mutex<BrokerState>,
    shutdown: watch::Sender<bool>,
    config_ready: watch::Sender<bool>,
}

impl Broker {
    /// Create a broker with empty state
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (config_ready, _) = watch::channel(false);
        Self {
            state: Mutex::new(BrokerState::new()),
            shutdown,
            config_ready,
        }
    }

    /// Register a newly accepted connection.
    ///
    /// Assigns the lname, records both registry maps, and publishes the
    /// `connected` membership event. Frames queued on `outbound` are
    /// the connection's to write.
    pub(crate) fn register_connection(
        &self,
        outbound: mpsc::UnboundedSender<Bytes>,
    ) -> (u64, String) {
        let mut state = self.state.lock();
        let (id, lname) = state.insert_connection(outbound);
        control::publish_event(
            &mut state,
            &MemberEvent::Connected {
                client: lname.clone(),
            },
        );
        (id, lname)
    }

    /// Register the broker's own control session.
    ///
    /// The session joins the admin group and switches membership
    /// notifications on; it does not announce itself.
    pub(crate) fn register_control_session(
        &self,
        outbound: mpsc::UnboundedSender<Bytes>,
    ) -> (u64, String) {
        let mut state = self.state.lock();
        let (id, lname) = state.insert_connection(outbound);
        state.table.subscribe(ChannelKey::new(MSGQ_GROUP, WILDCARD), id);
        state.notifications_on = true;
        (id, lname)
    }

    /// Tear down a connection: registry maps, subscriptions, and the
    /// outbound queue all go; `unsubscribed` events (one per distinct
    /// group) are published before `disconnected`.
    ///
    /// Idempotent; the second caller finds nothing to remove.
    pub(crate) fn destroy_connection(&self, conn: u64) {
        let mut state = self.state.lock();
        let Some(handle) = state.connections.remove(&conn) else {
            return;
        };
        state.lnames.remove(&handle.lname);
        let groups = state.table.unsubscribe_all(conn);
        for group in groups {
            control::publish_event(
                &mut state,
                &MemberEvent::Unsubscribed {
                    client: handle.lname.clone(),
                    group,
                },
            );
        }
        control::publish_event(
            &mut state,
            &MemberEvent::Disconnected {
                client: handle.lname.clone(),
            },
        );
        debug!(conn, lname = %handle.lname, "Connection destroyed");
    }

    /// Drop every connection without emitting events (shutdown path)
    pub(crate) fn close_all(&self) {
        let mut state = self.state.lock();
        let count = state.connections.len();
        state.connections.clear();
        state.lnames.clear();
        state.table = SubscriptionTable::new();
        if count > 0 {
            debug!(connections = count, "Closed all connections");
        }
    }

    /// Request orderly shutdown
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Whether shutdown has been requested
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// A receiver observing the shutdown flag
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Mark that a config manager has subscribed
    pub(crate) fn signal_config_ready(&self) {
        self.config_ready.send_replace(true);
    }

    /// Block until a client subscribes to the config manager group, or
    /// until shutdown is requested first.
    pub async fn wait_for_config_manager(&self) -> BootstrapWait {
        let mut ready = self.config_ready.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                return BootstrapWait::Aborted;
            }
            if *ready.borrow() {
                return BootstrapWait::Ready;
            }
            tokio::select! {
                changed = ready.changed() => {
                    if changed.is_err() {
                        return BootstrapWait::Aborted;
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
    }

    /// lnames of all connected clients, sorted
    pub fn member_lnames(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut members: Vec<String> = state
            .connections
            .values()
            .map(|handle| handle.lname.clone())
            .collect();
        members.sort_unstable();
        members
    }

    /// lnames subscribed to a group, sorted.
    ///
    /// Looks up instance `""`, which the wildcard union resolves to the
    /// group's wildcard subscribers as well.
    pub fn group_member_lnames(&self, group: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut members: Vec<String> = state
            .table
            .find(group, "")
            .into_iter()
            .filter_map(|conn| state.lname_of(conn))
            .collect();
        members.sort_unstable();
        members
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
