//! Minimal message bus client
//!
//! Enough of the client side of the protocol for peer daemons, tools,
//! and the integration tests: connect, subscribe, publish, ping, and
//! receive. Payload marshalling beyond opaque bytes is the business of
//! the callers.

use std::path::Path;

use bytes::Bytes;
use serde_cbor::Value;
use tokio::net::UnixStream;

use crate::error::{Error, Result};
use crate::wire::header::{
    COMMAND_GET_LNAME, COMMAND_PING, COMMAND_SEND, COMMAND_STOP, COMMAND_SUBSCRIBE,
    COMMAND_UNSUBSCRIBE, KEY_FROM, KEY_GROUP, KEY_INSTANCE, KEY_SEQ, KEY_TO, KEY_WANT_ANSWER,
    WILDCARD,
};
use crate::wire::{decode_payload_map, read_frame, write_frame, Frame, RoutingHeader, MAX_FRAME_SIZE};

/// A connection to the message bus
pub struct MsgqClient {
    stream: UnixStream,
    lname: String,
    next_seq: u64,
}

impl MsgqClient {
    /// Connect to the broker and fetch this session's lname.
    ///
    /// The GET_LNAME exchange happens before anything else, so the
    /// reply is guaranteed to be the first frame on the stream.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let mut stream = UnixStream::connect(path.as_ref()).await?;

        let request = RoutingHeader::new(COMMAND_GET_LNAME);
        let frame = Frame::new(request.to_bytes()?, Bytes::new());
        write_frame(&mut stream, &frame).await?;

        let reply = read_frame(&mut stream, MAX_FRAME_SIZE)
            .await?
            .ok_or(Error::ConnectionClosed)?;
        let payload = decode_payload_map(&reply.payload)?;
        let lname = match payload.get("lname") {
            Some(Value::Text(lname)) => lname.clone(),
            _ => return Err(Error::BadReply("getlname reply without an lname".into())),
        };

        Ok(Self {
            stream,
            lname,
            next_seq: 1,
        })
    }

    /// The lname the broker assigned to this session
    pub fn lname(&self) -> &str {
        &self.lname
    }

    /// Subscribe to a `(group, instance)` channel
    pub async fn group_subscribe(&mut self, group: &str, instance: &str) -> Result<()> {
        let header = RoutingHeader::new(COMMAND_SUBSCRIBE)
            .with_str(KEY_GROUP, group)
            .with_str(KEY_INSTANCE, instance);
        self.send_header(header, &[]).await
    }

    /// Drop a `(group, instance)` subscription
    pub async fn group_unsubscribe(&mut self, group: &str, instance: &str) -> Result<()> {
        let header = RoutingHeader::new(COMMAND_UNSUBSCRIBE)
            .with_str(KEY_GROUP, group)
            .with_str(KEY_INSTANCE, instance);
        self.send_header(header, &[]).await
    }

    /// Publish a payload to every subscriber of `(group, instance)`.
    ///
    /// With `want_answer` the broker sends back a synthesized error
    /// when nobody is there to receive it. Returns the sequence id used
    /// for the message.
    pub async fn group_sendmsg(
        &mut self,
        group: &str,
        instance: &str,
        payload: &[u8],
        want_answer: bool,
    ) -> Result<u64> {
        self.sendmsg(WILDCARD, group, instance, payload, want_answer)
            .await
    }

    /// Send a payload to one specific lname
    pub async fn sendmsg_to(
        &mut self,
        to: &str,
        group: &str,
        instance: &str,
        payload: &[u8],
    ) -> Result<u64> {
        self.sendmsg(to, group, instance, payload, false).await
    }

    /// Ping the broker; the pong echoes the payload
    pub async fn ping(&mut self, payload: &[u8]) -> Result<u64> {
        let seq = self.allocate_seq();
        let lname = self.lname.clone();
        let mut header = RoutingHeader::new(COMMAND_PING).with_str(KEY_FROM, &lname);
        header.set(KEY_SEQ, Value::Integer(seq.into()));
        self.send_header(header, payload).await?;
        Ok(seq)
    }

    /// Ask the broker to shut down
    pub async fn stop_broker(&mut self) -> Result<()> {
        self.send_header(RoutingHeader::new(COMMAND_STOP), &[]).await
    }

    /// Receive the next routed frame.
    ///
    /// Returns `None` when the broker closed the connection.
    pub async fn recvmsg(&mut self) -> Result<Option<(RoutingHeader, Bytes)>> {
        let Some(frame) = read_frame(&mut self.stream, MAX_FRAME_SIZE).await? else {
            return Ok(None);
        };
        let header = RoutingHeader::from_bytes(&frame.routing)?;
        Ok(Some((header, frame.payload)))
    }

    async fn sendmsg(
        &mut self,
        to: &str,
        group: &str,
        instance: &str,
        payload: &[u8],
        want_answer: bool,
    ) -> Result<u64> {
        let seq = self.allocate_seq();
        let lname = self.lname.clone();
        let mut header = RoutingHeader::new(COMMAND_SEND)
            .with_str(KEY_GROUP, group)
            .with_str(KEY_INSTANCE, instance)
            .with_str(KEY_TO, to)
            .with_str(KEY_FROM, &lname);
        header.set(KEY_SEQ, Value::Integer(seq.into()));
        if want_answer {
            header.set(KEY_WANT_ANSWER, Value::Bool(true));
        }
        self.send_header(header, payload).await?;
        Ok(seq)
    }

    async fn send_header(&mut self, header: RoutingHeader, payload: &[u8]) -> Result<()> {
        let frame = Frame::new(header.to_bytes()?, Bytes::copy_from_slice(payload));
        write_frame(&mut self.stream, &frame).await?;
        Ok(())
    }

    fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}
