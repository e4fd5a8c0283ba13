//! bundy-msgq: the message bus daemon

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use msgq::server::default_socket_path;
use msgq::{control, Broker, MsgqServer, ServerConfig};

#[derive(Parser)]
#[command(
    name = "bundy-msgq",
    version,
    about = "Inter-process message bus for the bundy server suite"
)]
struct Args {
    /// Enable debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// UNIX socket to listen on (overrides BUNDY_MSGQ_SOCKET_FILE)
    #[arg(short = 's', long, value_name = "PATH")]
    socket_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let socket_path = args.socket_file.unwrap_or_else(default_socket_path);
    let config = ServerConfig::default().socket_path(socket_path);
    let broker = Arc::new(Broker::new());

    spawn_signal_handler(Arc::clone(&broker));
    tokio::spawn(control::run(Arc::clone(&broker)));

    let server = MsgqServer::new(config, broker);
    if let Err(e) = server.run().await {
        error!(error = %e, "Message bus failed");
        std::process::exit(1);
    }
    info!("Message bus stopped");
}

/// Turn SIGTERM or Ctrl-C into an orderly shutdown request
fn spawn_signal_handler(broker: Arc<Broker>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "Unable to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received"),
            _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
        }
        broker.shutdown();
    });
}
