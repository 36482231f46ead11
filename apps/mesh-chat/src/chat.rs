use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use room_mesh::{MeshConfig, MeshEvent, Participant, PeerId, RoomMesh, RtcConfig, RtcLinkFactory};
use serde::{Deserialize, Serialize};
use signal_bus::WsBus;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Application payload carried over the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatMessage {
    Chat { text: String },
}

pub struct JoinOptions {
    pub relay: String,
    pub room: String,
    pub peer: String,
    pub existing: Vec<String>,
}

pub async fn run(options: JoinOptions) -> Result<()> {
    let JoinOptions {
        relay,
        room,
        peer,
        existing,
    } = options;

    let url = format!("{}/ws", relay.trim_end_matches('/'));
    let bus = WsBus::connect(&url, Some(peer.clone()))
        .await
        .with_context(|| format!("connecting to relay {url}"))?;
    let bus = Arc::new(bus);
    let links = RtcLinkFactory::new(RtcConfig::from_env());
    let (mesh, mut events) = RoomMesh::spawn(
        PeerId::from(peer),
        room,
        bus.clone(),
        Arc::new(links),
        MeshConfig::from_env(),
    );

    let existing: Vec<Participant> = existing
        .into_iter()
        .filter(|id| !id.trim().is_empty())
        .map(Participant::new)
        .collect();
    mesh.join(existing).await.context("joining room")?;
    println!("joined {} as {}; type to chat, /quit to leave", mesh.room(), mesh.local_peer());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => report(event),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                if text == "/quit" {
                    break;
                }
                if text == "/peers" {
                    println!("connected: {:?}", mesh.connected_peers().await);
                    if !bus.is_connected() {
                        println!("relay connection lost; no new peers can join");
                    }
                    continue;
                }
                let payload = serde_json::to_vec(&ChatMessage::Chat { text: text.to_owned() })?;
                let delivered = mesh.send_to_all(Bytes::from(payload)).await;
                if delivered == 0 {
                    warn!("no connected peers to receive message");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("leaving room");
    mesh.leave().await.context("leaving room")?;
    Ok(())
}

fn report(event: MeshEvent) {
    match event {
        MeshEvent::PeerConnected(peer) => println!("* {peer} connected"),
        MeshEvent::DataChannelOpen(peer) => println!("* channel to {peer} open"),
        MeshEvent::PeerDisconnected(peer) => println!("* {peer} disconnected"),
        MeshEvent::DataReceived { peer, data } => match serde_json::from_slice(&data) {
            Ok(ChatMessage::Chat { text }) => println!("<{peer}> {text}"),
            Err(err) => {
                warn!(peer = %peer, error = %err, bytes = data.len(), "unrecognized message")
            }
        },
    }
}
