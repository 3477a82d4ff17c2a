use anyhow::{Context, Result};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite::Message;

use assist_hub::protocol::Outbound;

#[derive(Parser)]
#[command(name = "client", about = "Line-oriented client: each stdin line is sent as one command")]
struct Args {
    #[arg(long, default_value = "ws://localhost:8080")]
    url: String,

    /// Print frames as received instead of pretty-printing them
    #[arg(long)]
    raw: bool,
}

fn render(text: &str, raw: bool) -> String {
    if raw {
        return text.to_string();
    }
    match serde_json::from_str::<Outbound>(text) {
        Ok(msg) => serde_json::to_string_pretty(&msg).unwrap_or_else(|_| text.to_string()),
        Err(_) => text.to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (ws, _) = tokio_tungstenite::connect_async(args.url.as_str())
        .await
        .with_context(|| format!("connecting to {}", args.url))?;
    let (mut sink, mut stream) = ws.split();
    eprintln!("connected to {}", args.url);

    let raw = args.raw;
    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => println!("{}", render(&text, raw)),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    eprintln!("read error: {}", e);
                    break;
                }
            }
        }
        eprintln!("server closed the connection");
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if reader.is_finished() {
            break;
        }
        sink.send(Message::Text(line.to_string())).await?;
    }
    sink.send(Message::Close(None)).await.ok();
    reader.await.ok();
    Ok(())
}
