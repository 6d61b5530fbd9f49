use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

/// name -> sending end of that member's inbox.
type Roster = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

pub async fn run(addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "chat room listening");

    let roster: Roster = Arc::new(Mutex::new(HashMap::new()));
    let name_pattern = Arc::new(Regex::new(r"^[a-zA-Z0-9]+$").context("name pattern")?);

    loop {
        let (stream, peer) = listener.accept().await.context("accepting connection")?;
        let roster = Arc::clone(&roster);
        let name_pattern = Arc::clone(&name_pattern);
        tokio::spawn(async move {
            if let Err(err) = handle(stream, roster, name_pattern).await {
                debug!(%peer, %err, "chat session ended");
            }
        });
    }
}

async fn handle(stream: TcpStream, roster: Roster, name_pattern: Arc<Regex>) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    writer
        .write_all(b"Welcome to budgetchat! What shall I call you?\n")
        .await?;
    let Some(name) = lines.next_line().await? else {
        return Ok(());
    };

    let (inbox_tx, inbox) = mpsc::unbounded_channel();
    {
        let mut roster = roster.lock().await;
        if !name_pattern.is_match(&name) || roster.contains_key(&name) {
            debug!(%name, "rejected name");
            return Ok(());
        }

        let present = roster.keys().cloned().collect::<Vec<_>>().join(", ");
        for member in roster.values() {
            let _ = member.send(format!("* {name} has entered the room"));
        }
        writer
            .write_all(format!("* The room contains: {present}\n").as_bytes())
            .await?;
        roster.insert(name.clone(), inbox_tx);
    }
    info!(%name, "joined the room");

    let result = relay(&name, &roster, lines, inbox, &mut writer).await;

    // Leave announcements must go out even when the session errored.
    let mut roster = roster.lock().await;
    roster.remove(&name);
    for member in roster.values() {
        let _ = member.send(format!("* {name} has left the room"));
    }
    info!(%name, "left the room");

    result
}

async fn relay(
    name: &str,
    roster: &Roster,
    mut lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    mut inbox: mpsc::UnboundedReceiver<String>,
    writer: &mut OwnedWriteHalf,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            delivery = inbox.recv() => match delivery {
                Some(message) => {
                    writer.write_all(message.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                None => return Ok(()),
            },
            line = lines.next_line() => match line? {
                Some(text) => {
                    let roster = roster.lock().await;
                    for (member, sender) in roster.iter() {
                        if member != name {
                            let _ = sender.send(format!("[{name}] {text}"));
                        }
                    }
                }
                None => return Ok(()),
            },
        }
    }
}
