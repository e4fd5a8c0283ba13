//! End-to-end broker scenarios over a real UNIX socket

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_cbor::Value;
use tempfile::TempDir;
use tokio::time::{sleep, timeout};

use msgq::wire::header::{COMMAND_PONG, MSGQ_LNAME};
use msgq::wire::{decode_payload_map, encode_payload_map};
use msgq::{control, Broker, MsgqClient, MsgqServer, RoutingHeader, ServerConfig};

const WAIT: Duration = Duration::from_secs(5);

struct TestBus {
    broker: Arc<Broker>,
    socket: PathBuf,
    server_task: tokio::task::JoinHandle<msgq::Result<()>>,
    _dir: TempDir,
}

/// Start a broker on a socket in a fresh temp dir and wait until it
/// accepts connections.
async fn start_bus() -> TestBus {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("msgq_socket");
    let broker = Arc::new(Broker::new());

    let server = MsgqServer::new(
        ServerConfig::with_socket_path(&socket),
        Arc::clone(&broker),
    );
    tokio::spawn(control::run(Arc::clone(&broker)));
    let server_task = tokio::spawn(async move { server.run().await });

    let probe = socket.clone();
    timeout(WAIT, async move {
        while tokio::net::UnixStream::connect(&probe).await.is_err() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("broker did not come up");

    TestBus {
        broker,
        socket,
        server_task,
        _dir: dir,
    }
}

/// Subscribe a client to the config manager group and wait for the
/// broker's control session to join the bus.
async fn bootstrap_config_manager(bus: &TestBus) -> MsgqClient {
    let mut cm = MsgqClient::connect(&bus.socket).await.unwrap();
    cm.group_subscribe("ConfigManager", "*").await.unwrap();

    let broker = Arc::clone(&bus.broker);
    timeout(WAIT, async move {
        // cm plus the control session itself
        while broker.member_lnames().len() < 2 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("control session did not come up");
    cm
}

async fn recv(client: &mut MsgqClient) -> (RoutingHeader, bytes::Bytes) {
    timeout(WAIT, client.recvmsg())
        .await
        .expect("timed out waiting for a frame")
        .expect("receive failed")
        .expect("broker closed the connection")
}

async fn assert_no_frame(client: &mut MsgqClient) {
    match timeout(Duration::from_millis(200), client.recvmsg()).await {
        Err(_) => {}
        Ok(received) => panic!("unexpected frame: {received:?}"),
    }
}

/// Round-trip a ping so every earlier frame from this client has been
/// processed by the broker.
async fn sync(client: &mut MsgqClient) {
    client.ping(b"sync").await.unwrap();
    let (header, payload) = recv(client).await;
    assert_eq!(header.msg_type(), Some(COMMAND_PONG));
    assert_eq!(&payload[..], b"sync");
}

async fn recv_event(client: &mut MsgqClient) -> (String, BTreeMap<String, Value>) {
    let (header, payload) = recv(client).await;
    assert_eq!(header.group(), Some("cc_members"));
    assert_eq!(header.sender(), Some(MSGQ_LNAME));
    let map = decode_payload_map(&payload).unwrap();
    let Some(Value::Text(event)) = map.get("event") else {
        panic!("notification without an event name: {map:?}");
    };
    (event.clone(), map)
}

fn payload_text(map: &BTreeMap<String, Value>, key: &str) -> String {
    match map.get(key) {
        Some(Value::Text(text)) => text.clone(),
        other => panic!("expected text under {key:?}, got {other:?}"),
    }
}

#[tokio::test]
async fn test_publish_reaches_subscriber_but_not_sender() {
    let bus = start_bus().await;
    let mut alice = MsgqClient::connect(&bus.socket).await.unwrap();
    let mut bob = MsgqClient::connect(&bus.socket).await.unwrap();

    alice.group_subscribe("g1", "i1").await.unwrap();
    bob.group_subscribe("g1", "i1").await.unwrap();
    sync(&mut alice).await;
    sync(&mut bob).await;

    alice
        .group_sendmsg("g1", "i1", b"hello subscribers", false)
        .await
        .unwrap();

    let (header, payload) = recv(&mut bob).await;
    assert_eq!(header.group(), Some("g1"));
    assert_eq!(header.instance(), Some("i1"));
    assert_eq!(header.sender(), Some(alice.lname()));
    assert_eq!(&payload[..], b"hello subscribers");

    // No self-bounce even though alice is subscribed herself
    assert_no_frame(&mut alice).await;
}

#[tokio::test]
async fn test_wildcard_subscriber_receives_exactly_one_copy() {
    let bus = start_bus().await;
    let mut carol = MsgqClient::connect(&bus.socket).await.unwrap();
    let mut dave = MsgqClient::connect(&bus.socket).await.unwrap();

    carol.group_subscribe("g1", "*").await.unwrap();
    carol.group_subscribe("g1", "iX").await.unwrap();
    sync(&mut carol).await;

    dave.group_sendmsg("g1", "iX", b"fan out", false).await.unwrap();

    let (_, payload) = recv(&mut carol).await;
    assert_eq!(&payload[..], b"fan out");
    assert_no_frame(&mut carol).await;
}

#[tokio::test]
async fn test_want_answer_without_recipients_gets_error_reply() {
    let bus = start_bus().await;
    let mut eve = MsgqClient::connect(&bus.socket).await.unwrap();

    let seq = eve
        .group_sendmsg("g2", "i2", b"anyone there?", true)
        .await
        .unwrap();

    let (header, payload) = recv(&mut eve).await;
    assert_eq!(header.reply(), Some(&Value::Integer(seq.into())));
    assert_eq!(header.sender(), Some(MSGQ_LNAME));
    assert_eq!(header.to(), Some(eve.lname()));

    let map = decode_payload_map(&payload).unwrap();
    let Some(Value::Array(result)) = map.get("result") else {
        panic!("missing result in error answer: {map:?}");
    };
    assert_eq!(result[0], Value::Integer((-1).into()));
}

#[tokio::test]
async fn test_fire_and_forget_send_gets_no_reply() {
    let bus = start_bus().await;
    let mut eve = MsgqClient::connect(&bus.socket).await.unwrap();

    eve.group_sendmsg("g2", "i2", b"into the void", false)
        .await
        .unwrap();
    assert_no_frame(&mut eve).await;
}

#[tokio::test]
async fn test_lname_has_expected_shape() {
    let bus = start_bus().await;
    let frank = MsgqClient::connect(&bus.socket).await.unwrap();

    // ^[0-9a-f]+_[0-9a-f]+@<hostname>$
    let (prefix, host) = frank.lname().split_once('@').expect("missing hostname");
    assert!(!host.is_empty());
    let (time_part, counter_part) = prefix.split_once('_').expect("missing counter");
    assert!(!time_part.is_empty() && time_part.chars().all(|c| c.is_ascii_hexdigit()));
    assert!(!counter_part.is_empty() && counter_part.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn test_direct_send_to_lname() {
    let bus = start_bus().await;
    let mut alice = MsgqClient::connect(&bus.socket).await.unwrap();
    let mut bob = MsgqClient::connect(&bus.socket).await.unwrap();

    alice
        .sendmsg_to(bob.lname(), "g1", "i1", b"just for you")
        .await
        .unwrap();

    let (header, payload) = recv(&mut bob).await;
    assert_eq!(header.to(), Some(bob.lname()));
    assert_eq!(&payload[..], b"just for you");
}

#[tokio::test]
async fn test_membership_event_sequence() {
    let bus = start_bus().await;
    let _cm = bootstrap_config_manager(&bus).await;

    let mut watcher = MsgqClient::connect(&bus.socket).await.unwrap();
    watcher.group_subscribe("cc_members", "*").await.unwrap();

    // A subscriber to cc_members sees its own subscription
    let (event, map) = recv_event(&mut watcher).await;
    assert_eq!(event, "subscribed");
    assert_eq!(payload_text(&map, "client"), watcher.lname());
    assert_eq!(payload_text(&map, "group"), "cc_members");

    let mut newcomer = MsgqClient::connect(&bus.socket).await.unwrap();
    let newcomer_lname = newcomer.lname().to_string();

    let (event, map) = recv_event(&mut watcher).await;
    assert_eq!(event, "connected");
    assert_eq!(payload_text(&map, "client"), newcomer_lname);

    newcomer.group_subscribe("g3", "i3").await.unwrap();
    let (event, map) = recv_event(&mut watcher).await;
    assert_eq!(event, "subscribed");
    assert_eq!(payload_text(&map, "client"), newcomer_lname);
    assert_eq!(payload_text(&map, "group"), "g3");

    drop(newcomer);

    let (event, map) = recv_event(&mut watcher).await;
    assert_eq!(event, "unsubscribed");
    assert_eq!(payload_text(&map, "client"), newcomer_lname);
    assert_eq!(payload_text(&map, "group"), "g3");

    let (event, map) = recv_event(&mut watcher).await;
    assert_eq!(event, "disconnected");
    assert_eq!(payload_text(&map, "client"), newcomer_lname);
}

#[tokio::test]
async fn test_members_admin_command() {
    let bus = start_bus().await;
    let mut cm = bootstrap_config_manager(&bus).await;

    let mut worker = MsgqClient::connect(&bus.socket).await.unwrap();
    worker.group_subscribe("g7", "*").await.unwrap();
    sync(&mut worker).await;

    // All members
    let query =
        encode_payload_map([("command".to_string(), Value::Text("members".to_string()))]).unwrap();
    let seq = cm.group_sendmsg("Msgq", "*", &query, true).await.unwrap();

    let (header, payload) = recv(&mut cm).await;
    assert_eq!(header.reply(), Some(&Value::Integer(seq.into())));
    assert_eq!(header.sender(), Some(MSGQ_LNAME));
    let map = decode_payload_map(&payload).unwrap();
    let Some(Value::Array(members)) = map.get("members") else {
        panic!("missing members list: {map:?}");
    };
    assert!(members.contains(&Value::Text(cm.lname().to_string())));
    assert!(members.contains(&Value::Text(worker.lname().to_string())));

    // Members of one group
    let query = encode_payload_map([
        ("command".to_string(), Value::Text("members".to_string())),
        ("group".to_string(), Value::Text("g7".to_string())),
    ])
    .unwrap();
    cm.group_sendmsg("Msgq", "*", &query, true).await.unwrap();

    let (_, payload) = recv(&mut cm).await;
    let map = decode_payload_map(&payload).unwrap();
    assert_eq!(
        map.get("members"),
        Some(&Value::Array(vec![Value::Text(worker.lname().to_string())]))
    );
}

#[tokio::test]
async fn test_stop_command_shuts_the_broker_down() {
    let bus = start_bus().await;
    let mut client = MsgqClient::connect(&bus.socket).await.unwrap();

    client.stop_broker().await.unwrap();

    let result = timeout(WAIT, bus.server_task)
        .await
        .expect("broker did not stop")
        .unwrap();
    assert!(result.is_ok());

    // Socket file removed, further connects refused
    assert!(!bus.socket.exists());
    assert!(MsgqClient::connect(&bus.socket).await.is_err());
}

#[tokio::test]
async fn test_pong_is_addressed_to_the_getlname_identity() {
    let bus = start_bus().await;
    // connect() performs the GET_LNAME exchange; the broker must keep
    // addressing this session by the same name afterwards
    let mut client = MsgqClient::connect(&bus.socket).await.unwrap();
    let connected_lname = client.lname().to_string();

    client.ping(b"").await.unwrap();
    let (header, _) = recv(&mut client).await;
    assert_eq!(header.msg_type(), Some(COMMAND_PONG));
    assert_eq!(header.to(), Some(connected_lname.as_str()));
}
