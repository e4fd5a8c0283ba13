//! Command dispatch
//!
//! Interprets decoded frames as bus commands and drives the
//! subscription table and connection registry. Routing failures are
//! contained to the offending message or connection; the only command
//! that reaches beyond that is STOP.

use serde_cbor::Value;
use tracing::{debug, error, info};

use crate::control::{self, MemberEvent, CONFIG_MANAGER_GROUP};
use crate::subs::ChannelKey;
use crate::wire::header::{
    error_answer, encode_payload_map, CC_REPLY_NO_RECPT, COMMAND_GET_LNAME, COMMAND_PING,
    COMMAND_PONG, COMMAND_SEND, COMMAND_STOP, COMMAND_SUBSCRIBE, COMMAND_UNSUBSCRIBE, KEY_FROM,
    KEY_REPLY, KEY_TO, KEY_TYPE, MSGQ_LNAME, WILDCARD,
};
use crate::wire::{Frame, RoutingHeader};

use super::{Broker, BrokerState};

impl Broker {
    /// Handle one decoded frame from a connection
    pub(crate) fn dispatch(&self, sender: u64, header: &RoutingHeader, frame: &Frame) {
        match header.msg_type() {
            Some(COMMAND_SEND) => self.handle_send(sender, header, frame),
            Some(COMMAND_SUBSCRIBE) => self.handle_subscribe(sender, header),
            Some(COMMAND_UNSUBSCRIBE) => self.handle_unsubscribe(sender, header),
            Some(COMMAND_GET_LNAME) => self.handle_get_lname(sender),
            Some(COMMAND_PING) => self.handle_ping(sender, header, frame),
            Some(COMMAND_STOP) => {
                info!(conn = sender, "Stop requested over the bus");
                self.shutdown();
            }
            other => {
                error!(conn = sender, msg_type = ?other, "Unknown command type, discarding");
            }
        }
    }

    fn handle_send(&self, sender: u64, header: &RoutingHeader, frame: &Frame) {
        let (Some(group), Some(instance)) = (header.group(), header.instance()) else {
            debug!(conn = sender, "SEND without group or instance, dropping");
            return;
        };

        let mut state = self.state.lock();
        let mut recipients: Vec<u64> = match header.to() {
            Some(WILDCARD) => state.table.find(group, instance),
            Some(to) => state.lnames.get(to).copied().into_iter().collect(),
            None => Vec::new(),
        };
        recipients.retain(|&conn| conn != sender);

        if recipients.is_empty() {
            // Requests that demand an answer get a synthesized error,
            // unless the message is itself a reply (no error loops).
            if header.wants_answer() && header.reply().is_none() {
                synthesize_no_recipient(&mut state, sender, header);
            }
            return;
        }

        let encoded = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(conn = sender, error = %e, "Unable to re-encode frame for delivery");
                return;
            }
        };
        for conn in recipients {
            if !state.enqueue(conn, encoded.clone()) {
                debug!(conn, "Recipient queue closed, skipping delivery");
            }
        }
    }

    fn handle_subscribe(&self, sender: u64, header: &RoutingHeader) {
        let (Some(group), Some(instance)) = (header.group(), header.instance()) else {
            debug!(conn = sender, "SUBSCRIBE without group or instance, dropping");
            return;
        };

        let mut state = self.state.lock();
        let Some(lname) = state.lname_of(sender) else {
            return;
        };
        if !state.table.subscribe(ChannelKey::new(group, instance), sender) {
            return;
        }
        debug!(conn = sender, lname = %lname, group, instance, "Subscribed");

        if group == CONFIG_MANAGER_GROUP {
            self.signal_config_ready();
        }
        control::publish_event(
            &mut state,
            &MemberEvent::Subscribed {
                client: lname,
                group: group.to_string(),
            },
        );
    }

    fn handle_unsubscribe(&self, sender: u64, header: &RoutingHeader) {
        let (Some(group), Some(instance)) = (header.group(), header.instance()) else {
            debug!(conn = sender, "UNSUBSCRIBE without group or instance, dropping");
            return;
        };

        let mut state = self.state.lock();
        let Some(lname) = state.lname_of(sender) else {
            return;
        };
        if !state.table.unsubscribe(&ChannelKey::new(group, instance), sender) {
            return;
        }
        debug!(conn = sender, lname = %lname, group, instance, "Unsubscribed");

        control::publish_event(
            &mut state,
            &MemberEvent::Unsubscribed {
                client: lname,
                group: group.to_string(),
            },
        );
    }

    fn handle_get_lname(&self, sender: u64) {
        let state = self.state.lock();
        let Some(lname) = state.lname_of(sender) else {
            return;
        };
        let header = RoutingHeader::new(COMMAND_GET_LNAME)
            .with_str(KEY_FROM, MSGQ_LNAME)
            .with_str(KEY_TO, &lname);
        let payload = encode_payload_map([("lname".to_string(), Value::Text(lname))]);
        post_to_conn(&state, sender, &header, payload);
    }

    fn handle_ping(&self, sender: u64, header: &RoutingHeader, frame: &Frame) {
        let state = self.state.lock();
        let Some(lname) = state.lname_of(sender) else {
            return;
        };
        let mut reply = header.clone();
        reply.set_str(KEY_TYPE, COMMAND_PONG);
        reply.set_str(KEY_FROM, MSGQ_LNAME);
        reply.set_str(KEY_TO, &lname);
        post_to_conn(&state, sender, &reply, Ok(frame.payload.to_vec()));
    }
}

/// Build the error reply for a want-answer SEND that reached nobody.
///
/// The original header is shallow-copied, `reply` echoes the request
/// `seq`, and the answer goes back to the submitting connection with
/// `to` set to whatever the sender claimed as `from`.
fn synthesize_no_recipient(state: &mut BrokerState, sender: u64, header: &RoutingHeader) {
    let mut reply = header.clone();
    reply.set(KEY_REPLY, header.seq().cloned().unwrap_or(Value::Null));
    reply.set_str(KEY_FROM, MSGQ_LNAME);
    if let Some(from) = header.sender() {
        reply.set_str(KEY_TO, from);
    }
    debug!(conn = sender, "No recipient for want-answer SEND, synthesizing reply");
    post_to_conn(
        state,
        sender,
        &reply,
        error_answer(CC_REPLY_NO_RECPT, "no such recipient"),
    );
}

/// Encode a broker-originated frame and queue it on one connection
fn post_to_conn(
    state: &BrokerState,
    conn: u64,
    header: &RoutingHeader,
    payload: Result<Vec<u8>, crate::wire::FrameError>,
) {
    let frame = match header.to_bytes().and_then(|routing| {
        let payload = payload?;
        Frame::new(routing, payload).encode()
    }) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(conn, error = %e, "Unable to encode broker reply");
            return;
        }
    };
    if !state.enqueue(conn, frame) {
        debug!(conn, "Reply dropped, connection queue closed");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::broker::BootstrapWait;
    use crate::wire::header::{decode_payload_map, KEY_GROUP, KEY_INSTANCE, KEY_SEQ, KEY_WANT_ANSWER};

    use super::*;

    struct TestPeer {
        id: u64,
        lname: String,
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    impl TestPeer {
        fn join(broker: &Broker) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let (id, lname) = broker.register_connection(tx);
            Self { id, lname, rx }
        }

        fn recv(&mut self) -> (RoutingHeader, Frame) {
            let bytes = self.rx.try_recv().expect("expected a queued frame");
            let frame = Frame::decode(&bytes).expect("queued frame must decode");
            let header = RoutingHeader::from_bytes(&frame.routing).expect("routing must parse");
            (header, frame)
        }

        fn assert_empty(&mut self) {
            assert!(self.rx.try_recv().is_err(), "unexpected frame queued");
        }
    }

    fn send_frame(group: &str, instance: &str, to: &str, from: &str) -> (RoutingHeader, Frame) {
        let header = RoutingHeader::new(COMMAND_SEND)
            .with_str(KEY_GROUP, group)
            .with_str(KEY_INSTANCE, instance)
            .with_str(KEY_TO, to)
            .with_str(KEY_FROM, from);
        let frame = Frame::new(header.to_bytes().unwrap(), Bytes::from_static(b"body"));
        (header, frame)
    }

    fn subscribe(broker: &Broker, peer: &TestPeer, group: &str, instance: &str) {
        let header = RoutingHeader::new(COMMAND_SUBSCRIBE)
            .with_str(KEY_GROUP, group)
            .with_str(KEY_INSTANCE, instance);
        let frame = Frame::new(header.to_bytes().unwrap(), Bytes::new());
        broker.dispatch(peer.id, &header, &frame);
    }

    #[test]
    fn test_send_reaches_subscriber_not_sender() {
        let broker = Broker::new();
        let mut alice = TestPeer::join(&broker);
        let mut bob = TestPeer::join(&broker);

        subscribe(&broker, &alice, "g1", "i1");
        subscribe(&broker, &bob, "g1", "i1");

        let (header, frame) = send_frame("g1", "i1", WILDCARD, &alice.lname);
        broker.dispatch(alice.id, &header, &frame);

        let (received, received_frame) = bob.recv();
        assert_eq!(received.group(), Some("g1"));
        assert_eq!(received_frame.payload, frame.payload);
        alice.assert_empty();
    }

    #[test]
    fn test_wildcard_subscriber_gets_one_copy() {
        let broker = Broker::new();
        let mut carol = TestPeer::join(&broker);
        let dave = TestPeer::join(&broker);

        subscribe(&broker, &carol, "g1", WILDCARD);
        subscribe(&broker, &carol, "g1", "iX");

        let (header, frame) = send_frame("g1", "iX", WILDCARD, &dave.lname);
        broker.dispatch(dave.id, &header, &frame);

        carol.recv();
        carol.assert_empty();
    }

    #[test]
    fn test_send_to_specific_lname() {
        let broker = Broker::new();
        let alice = TestPeer::join(&broker);
        let mut bob = TestPeer::join(&broker);

        let (header, frame) = send_frame("g1", "i1", &bob.lname, &alice.lname);
        broker.dispatch(alice.id, &header, &frame);

        let (received, _) = bob.recv();
        assert_eq!(received.sender(), Some(alice.lname.as_str()));
    }

    #[test]
    fn test_send_without_group_is_dropped() {
        let broker = Broker::new();
        let mut alice = TestPeer::join(&broker);
        let mut bob = TestPeer::join(&broker);
        subscribe(&broker, &bob, "g1", "i1");

        let header = RoutingHeader::new(COMMAND_SEND)
            .with_str(KEY_INSTANCE, "i1")
            .with_str(KEY_TO, WILDCARD);
        let frame = Frame::new(header.to_bytes().unwrap(), Bytes::new());
        broker.dispatch(alice.id, &header, &frame);

        bob.assert_empty();
        alice.assert_empty();
    }

    #[test]
    fn test_no_recipient_synthesizes_reply() {
        let broker = Broker::new();
        let mut eve = TestPeer::join(&broker);

        let mut header = RoutingHeader::new(COMMAND_SEND)
            .with_str(KEY_GROUP, "g2")
            .with_str(KEY_INSTANCE, "i2")
            .with_str(KEY_TO, WILDCARD)
            .with_str(KEY_FROM, &eve.lname);
        header.set(KEY_SEQ, Value::Integer(42));
        header.set(KEY_WANT_ANSWER, Value::Bool(true));
        let frame = Frame::new(header.to_bytes().unwrap(), Bytes::new());

        broker.dispatch(eve.id, &header, &frame);

        let (reply, reply_frame) = eve.recv();
        assert_eq!(reply.reply(), Some(&Value::Integer(42)));
        assert_eq!(reply.sender(), Some(MSGQ_LNAME));
        assert_eq!(reply.to(), Some(eve.lname.as_str()));

        let payload = decode_payload_map(&reply_frame.payload).unwrap();
        let Some(Value::Array(result)) = payload.get("result") else {
            panic!("missing result");
        };
        assert_eq!(result[0], Value::Integer(CC_REPLY_NO_RECPT.into()));
    }

    #[test]
    fn test_no_reply_synthesized_for_replies() {
        let broker = Broker::new();
        let mut eve = TestPeer::join(&broker);

        let mut header = RoutingHeader::new(COMMAND_SEND)
            .with_str(KEY_GROUP, "g2")
            .with_str(KEY_INSTANCE, "i2")
            .with_str(KEY_TO, WILDCARD)
            .with_str(KEY_FROM, &eve.lname);
        header.set(KEY_WANT_ANSWER, Value::Bool(true));
        header.set(KEY_REPLY, Value::Integer(7));
        let frame = Frame::new(header.to_bytes().unwrap(), Bytes::new());

        broker.dispatch(eve.id, &header, &frame);
        eve.assert_empty();
    }

    #[test]
    fn test_no_reply_without_want_answer() {
        let broker = Broker::new();
        let mut eve = TestPeer::join(&broker);

        let (header, frame) = send_frame("g2", "i2", WILDCARD, &eve.lname);
        broker.dispatch(eve.id, &header, &frame);
        eve.assert_empty();
    }

    #[test]
    fn test_duplicate_subscribe_single_delivery() {
        let broker = Broker::new();
        let alice = TestPeer::join(&broker);
        let mut bob = TestPeer::join(&broker);

        subscribe(&broker, &bob, "g1", "i1");
        subscribe(&broker, &bob, "g1", "i1");

        let (header, frame) = send_frame("g1", "i1", WILDCARD, &alice.lname);
        broker.dispatch(alice.id, &header, &frame);

        bob.recv();
        bob.assert_empty();
    }

    #[test]
    fn test_get_lname() {
        let broker = Broker::new();
        let mut frank = TestPeer::join(&broker);

        let header = RoutingHeader::new(COMMAND_GET_LNAME);
        let frame = Frame::new(header.to_bytes().unwrap(), Bytes::new());
        broker.dispatch(frank.id, &header, &frame);

        let (reply, reply_frame) = frank.recv();
        assert_eq!(reply.msg_type(), Some(COMMAND_GET_LNAME));
        assert_eq!(reply.sender(), Some(MSGQ_LNAME));

        let payload = decode_payload_map(&reply_frame.payload).unwrap();
        assert_eq!(payload.get("lname"), Some(&Value::Text(frank.lname.clone())));
    }

    #[test]
    fn test_ping_pong_echoes_payload() {
        let broker = Broker::new();
        let mut grace = TestPeer::join(&broker);

        let mut header = RoutingHeader::new(COMMAND_PING);
        header.set(KEY_SEQ, Value::Integer(9));
        let frame = Frame::new(header.to_bytes().unwrap(), Bytes::from_static(b"echo me"));
        broker.dispatch(grace.id, &header, &frame);

        let (reply, reply_frame) = grace.recv();
        assert_eq!(reply.msg_type(), Some(COMMAND_PONG));
        assert_eq!(reply.seq(), Some(&Value::Integer(9)));
        assert_eq!(reply_frame.payload, Bytes::from_static(b"echo me"));
    }

    #[test]
    fn test_stop_requests_shutdown() {
        let broker = Broker::new();
        let peer = TestPeer::join(&broker);

        let header = RoutingHeader::new(COMMAND_STOP);
        let frame = Frame::new(header.to_bytes().unwrap(), Bytes::new());
        broker.dispatch(peer.id, &header, &frame);

        assert!(broker.is_shutting_down());
    }

    #[test]
    fn test_unknown_command_discarded() {
        let broker = Broker::new();
        let mut peer = TestPeer::join(&broker);

        let header = RoutingHeader::new("frobnicate");
        let frame = Frame::new(header.to_bytes().unwrap(), Bytes::new());
        broker.dispatch(peer.id, &header, &frame);

        peer.assert_empty();
        assert!(!broker.is_shutting_down());
    }

    #[test]
    fn test_config_manager_subscription_signals_bootstrap() {
        let broker = Broker::new();
        let cm = TestPeer::join(&broker);

        subscribe(&broker, &cm, CONFIG_MANAGER_GROUP, WILDCARD);

        assert_eq!(
            futures_ready(broker.wait_for_config_manager()),
            BootstrapWait::Ready
        );
    }

    /// Drive a future expected to be immediately ready
    fn futures_ready<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }
}
