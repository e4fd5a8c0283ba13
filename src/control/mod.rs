//! Control and notification surface
//!
//! Membership events go out on the `cc_members` channel, and
//! administrative queries are answered on the `Msgq` group by the
//! broker's own control session. The session is the broker acting as a
//! client of itself: a registered connection whose outbound queue is
//! drained by a task in this module instead of a socket writer.
//!
//! The session only comes up after the bootstrap peer (the
//! configuration manager) has subscribed; until then no membership
//! events are published.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_cbor::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::broker::{BootstrapWait, Broker, BrokerState};
use crate::wire::header::{
    encode_payload_map, COMMAND_SEND, KEY_FROM, KEY_GROUP, KEY_INSTANCE, KEY_REPLY, KEY_SEQ,
    KEY_TO, MSGQ_LNAME, WILDCARD,
};
use crate::wire::{decode_payload_map, Frame, FrameError, RoutingHeader};

/// Channel carrying membership notifications
pub const NOTIFY_GROUP: &str = "cc_members";

/// Group whose first subscriber unblocks the bootstrap wait
pub const CONFIG_MANAGER_GROUP: &str = "ConfigManager";

/// Group the control session listens on for admin commands
pub const MSGQ_GROUP: &str = "Msgq";

/// A membership change worth telling the bus about
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MemberEvent {
    /// A connection was accepted
    Connected {
        /// lname of the new connection
        client: String,
    },
    /// A connection went away
    Disconnected {
        /// lname of the former connection
        client: String,
    },
    /// A subscription was added
    Subscribed {
        /// lname of the subscriber
        client: String,
        /// Group subscribed to
        group: String,
    },
    /// A subscription was dropped
    Unsubscribed {
        /// lname of the former subscriber
        client: String,
        /// Group unsubscribed from
        group: String,
    },
}

impl MemberEvent {
    fn event_name(&self) -> &'static str {
        match self {
            MemberEvent::Connected { .. } => "connected",
            MemberEvent::Disconnected { .. } => "disconnected",
            MemberEvent::Subscribed { .. } => "subscribed",
            MemberEvent::Unsubscribed { .. } => "unsubscribed",
        }
    }

    fn client(&self) -> &str {
        match self {
            MemberEvent::Connected { client }
            | MemberEvent::Disconnected { client }
            | MemberEvent::Subscribed { client, .. }
            | MemberEvent::Unsubscribed { client, .. } => client,
        }
    }

    fn group(&self) -> Option<&str> {
        match self {
            MemberEvent::Subscribed { group, .. } | MemberEvent::Unsubscribed { group, .. } => {
                Some(group)
            }
            _ => None,
        }
    }
}

/// Publish a membership event to the `cc_members` subscribers.
///
/// Called right after the state change it describes, under the same
/// lock, so a client subscribing to `cc_members` sees its own
/// subscription but never its own unsubscription. Silently skipped
/// until the control session has switched notifications on.
pub(crate) fn publish_event(state: &mut BrokerState, event: &MemberEvent) {
    if !state.notifications_on {
        return;
    }
    let recipients = state.table.find(NOTIFY_GROUP, WILDCARD);
    if recipients.is_empty() {
        return;
    }

    let seq = state.allocate_seq();
    let encoded = match build_event_frame(seq, event) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Unable to encode membership event");
            return;
        }
    };
    for conn in recipients {
        state.enqueue(conn, encoded.clone());
    }
}

fn build_event_frame(seq: u64, event: &MemberEvent) -> Result<Bytes, FrameError> {
    let mut header = RoutingHeader::new(COMMAND_SEND)
        .with_str(KEY_GROUP, NOTIFY_GROUP)
        .with_str(KEY_INSTANCE, WILDCARD)
        .with_str(KEY_TO, WILDCARD)
        .with_str(KEY_FROM, MSGQ_LNAME);
    header.set(KEY_SEQ, Value::Integer(seq.into()));

    let mut payload = vec![
        (
            "event".to_string(),
            Value::Text(event.event_name().to_string()),
        ),
        ("client".to_string(), Value::Text(event.client().to_string())),
    ];
    if let Some(group) = event.group() {
        payload.push(("group".to_string(), Value::Text(group.to_string())));
    }

    Frame::new(header.to_bytes()?, encode_payload_map(payload)?).encode()
}

/// Run the control session.
///
/// Waits for the configuration manager to subscribe, then joins the bus
/// as the broker's own client and answers admin commands until
/// shutdown. If the broker stops before a config manager ever appears,
/// the session is never opened.
pub async fn run(broker: Arc<Broker>) {
    match broker.wait_for_config_manager().await {
        BootstrapWait::Aborted => {
            debug!("Shutdown before a config manager subscribed, control session not started");
            return;
        }
        BootstrapWait::Ready => {}
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (_id, lname) = broker.register_control_session(tx);
    info!(lname = %lname, "Control session established");

    let mut shutdown = broker.shutdown_rx();
    loop {
        if broker.is_shutting_down() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            received = rx.recv() => match received {
                Some(bytes) => handle_frame(&broker, &bytes),
                None => break,
            }
        }
    }
    debug!("Control session closed");
}

/// Handle one frame routed to the control session
fn handle_frame(broker: &Broker, bytes: &Bytes) {
    let parsed = Frame::decode(bytes)
        .and_then(|frame| Ok((RoutingHeader::from_bytes(&frame.routing)?, frame)));
    let (header, frame) = match parsed {
        Ok(decoded) => decoded,
        Err(e) => {
            error!(error = %e, "Malformed frame on control session");
            return;
        }
    };
    if header.msg_type() != Some(COMMAND_SEND) {
        return;
    }
    let Ok(command) = decode_payload_map(&frame.payload) else {
        debug!("Non-map payload on control session, ignoring");
        return;
    };

    match command.get("command") {
        Some(Value::Text(name)) if name == "members" => {
            handle_members(broker, &header, &command);
        }
        other => {
            debug!(command = ?other, "Unknown admin command, ignoring");
        }
    }
}

/// Answer a `members` query with the matching lnames
fn handle_members(broker: &Broker, header: &RoutingHeader, command: &BTreeMap<String, Value>) {
    let members = match command.get("group") {
        Some(Value::Text(group)) => broker.group_member_lnames(group),
        _ => broker.member_lnames(),
    };
    let Some(requester) = header.sender() else {
        debug!("members query without a from field, cannot reply");
        return;
    };

    let mut reply = RoutingHeader::new(COMMAND_SEND)
        .with_str(KEY_FROM, MSGQ_LNAME)
        .with_str(KEY_TO, requester);
    if let Some(seq) = header.seq() {
        reply.set(KEY_REPLY, seq.clone());
    }
    let payload = encode_payload_map([(
        "members".to_string(),
        Value::Array(members.into_iter().map(Value::Text).collect()),
    )]);

    let encoded = match reply.to_bytes().and_then(|routing| {
        let payload = payload?;
        Frame::new(routing, payload).encode()
    }) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Unable to encode members reply");
            return;
        }
    };

    let state = broker.state.lock();
    let Some(&conn) = state.lnames.get(requester) else {
        debug!(requester, "members requester vanished before the reply");
        return;
    };
    state.enqueue(conn, encoded);
}
