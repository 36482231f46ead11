mod chat;
mod logging;
mod relay;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::error;

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "mesh-chat", about = "Full-mesh chat over WebRTC data channels")]
struct Cli {
    #[arg(
        long,
        value_enum,
        default_value_t = LogLevel::Warn,
        env = "MESH_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long, env = "MESH_LOG_FILE", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling relay.
    Relay {
        #[arg(long, default_value = "127.0.0.1:8787", env = "MESH_RELAY_LISTEN")]
        listen: SocketAddr,
    },
    /// Join a room and chat with everyone in it.
    Join(JoinArgs),
}

#[derive(Args, Debug)]
struct JoinArgs {
    /// Relay base URL, e.g. ws://127.0.0.1:8787
    #[arg(long, env = "MESH_RELAY_URL")]
    relay: String,

    #[arg(long)]
    room: String,

    /// Our participant id.
    #[arg(long)]
    peer: String,

    /// Participants already in the room.
    #[arg(long, value_delimiter = ',')]
    existing: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_config = LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    };
    if let Err(err) = logging::init(&log_config) {
        eprintln!("mesh-chat: {err}");
    }

    if let Err(err) = run(cli.command).await {
        error!("{err:#}");
        eprintln!("mesh-chat: {err:#}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> Result<()> {
    match command {
        Command::Relay { listen } => relay::serve(listen).await,
        Command::Join(args) => {
            chat::run(chat::JoinOptions {
                relay: args.relay,
                room: args.room,
                peer: args.peer,
                existing: args.existing,
            })
            .await
        }
    }
}
