use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use causeway_proto::{ClientMessage, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "causeway-relay")]
#[command(about = "Causeway handshake relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Listen port (overrides CAUSEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Bind address (overrides CAUSEWAY_BIND)
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Probe a running relay: join a channel, ping, report the stored offer
    Check {
        /// Relay URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Channel name to probe
        #[arg(short, long, default_value = "causeway-check")]
        channel: String,
    },
}

/// Connect to a relay, exercise join/ping/getOffer, and print what came back.
pub async fn run_check(url: String, channel: String) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("connecting to {ws_url}");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => return Err(anyhow::anyhow!("connection failed: {e}")),
        Err(_) => return Err(anyhow::anyhow!("connection to {ws_url} timed out")),
    };
    let (mut write, mut read) = ws_stream.split();

    let send = |msg: &ClientMessage| serde_json::to_string(msg).map(Message::from);

    write
        .send(send(&ClientMessage::Join {
            channel_name: channel.clone(),
        })?)
        .await?;
    write.send(send(&ClientMessage::Ping)?).await?;
    write
        .send(send(&ClientMessage::GetOffer {
            channel_name: channel.clone(),
        })?)
        .await?;

    let mut joined = false;
    let mut ponged = false;
    let deadline = Duration::from_secs(5);
    while let Ok(Some(frame)) = timeout(deadline, read.next()).await {
        let frame = frame?;
        let Message::Text(text) = frame else { continue };
        match serde_json::from_str::<ServerMessage>(text.as_ref())? {
            ServerMessage::Joined { channel_name } => {
                println!("joined channel {channel_name}");
                joined = true;
            }
            ServerMessage::Pong => {
                println!("pong");
                ponged = true;
            }
            ServerMessage::OfferRetrieved { offer, .. } => {
                match offer {
                    Some(offer) => println!("stored offer: {} bytes", offer.len()),
                    None => println!("no stored offer"),
                }
                break;
            }
            ServerMessage::Error { message } => {
                return Err(anyhow::anyhow!("relay error: {message}"));
            }
            other => debug!("ignoring {other:?}"),
        }
    }

    if !joined || !ponged {
        return Err(anyhow::anyhow!(
            "relay did not acknowledge (joined={joined}, ponged={ponged})"
        ));
    }
    Ok(())
}
