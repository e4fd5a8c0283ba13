//! msgq: inter-process message bus for the bundy server suite
//!
//! A central broker listens on a UNIX-domain stream socket. Daemons
//! connect, get a unique lname assigned, subscribe to `(group,
//! instance)` channels, and publish length-framed messages the broker
//! routes to matching subscribers. The broker also publishes membership
//! events on the `cc_members` channel and synthesizes "no recipient"
//! error replies for requests that demand an answer but reach nobody.
//!
//! ```no_run
//! use msgq::{Broker, MsgqClient, MsgqServer, ServerConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> msgq::Result<()> {
//! let broker = Arc::new(Broker::new());
//! let server = MsgqServer::new(
//!     ServerConfig::with_socket_path("/tmp/msgq_socket"),
//!     Arc::clone(&broker),
//! );
//! tokio::spawn(msgq::control::run(Arc::clone(&broker)));
//! tokio::spawn(async move { server.run().await });
//!
//! let mut client = MsgqClient::connect("/tmp/msgq_socket").await?;
//! client.group_subscribe("Zonemgr", "*").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod broker;
pub mod client;
pub mod control;
pub mod error;
pub mod lname;
pub mod server;
pub mod subs;
pub mod wire;

pub use broker::{BootstrapWait, Broker};
pub use client::MsgqClient;
pub use error::{Error, Result};
pub use lname::LnameGenerator;
pub use server::{MsgqServer, ServerConfig};
pub use subs::{ChannelKey, SubscriptionTable};
pub use wire::{Frame, FrameError, RoutingHeader};
