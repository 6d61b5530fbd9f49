use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

const UPSTREAM_ADDR: &str = "chat.protohackers.com:16963";
const TONY_ADDRESS: &str = "7YWHMfk9JZe0LM0g1ZauHuiSxhI";

/// Transparent chat proxy that rewrites Boguscoin addresses to Tony's.
pub async fn run(addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, upstream = UPSTREAM_ADDR, "proxy listening");

    let address_pattern = Arc::new(Regex::new(r"^7[a-zA-Z0-9]{25,34}$").context("address pattern")?);

    loop {
        let (client, peer) = listener.accept().await.context("accepting connection")?;
        let address_pattern = Arc::clone(&address_pattern);
        tokio::spawn(async move {
            if let Err(err) = handle(client, address_pattern).await {
                debug!(%peer, %err, "proxy session ended");
            }
        });
    }
}

async fn handle(client: TcpStream, address_pattern: Arc<Regex>) -> std::io::Result<()> {
    let upstream = TcpStream::connect(UPSTREAM_ADDR).await?;

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let mut up = {
        let pattern = Arc::clone(&address_pattern);
        tokio::spawn(async move { rewrite_lines(client_read, upstream_write, pattern).await })
    };
    let mut down =
        tokio::spawn(async move { rewrite_lines(upstream_read, client_write, address_pattern).await });

    // Either direction closing tears the whole session down.
    tokio::select! {
        _ = &mut up => down.abort(),
        _ = &mut down => up.abort(),
    }
    Ok(())
}

async fn rewrite_lines<R, W>(reader: R, mut writer: W, pattern: Arc<Regex>) -> std::io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWriteExt + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(());
        }
        // Only complete lines are chat messages; a trailing fragment at
        // disconnect is dropped rather than forwarded half-rewritten.
        if line.last() != Some(&b'\n') {
            return Ok(());
        }

        let text = String::from_utf8_lossy(&line[..line.len() - 1]);
        let rewritten = rewrite_message(&text, &pattern);
        writer.write_all(rewritten.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
}

fn rewrite_message(message: &str, pattern: &Regex) -> String {
    message
        .split(' ')
        .map(|word| {
            if pattern.is_match(word) {
                TONY_ADDRESS
            } else {
                word
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> Regex {
        Regex::new(r"^7[a-zA-Z0-9]{25,34}$").unwrap()
    }

    #[test]
    fn rewrites_addresses_wherever_they_appear() {
        let pattern = pattern();
        assert_eq!(
            rewrite_message("please pay 7iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX to me", &pattern),
            format!("please pay {TONY_ADDRESS} to me"),
        );
        assert_eq!(
            rewrite_message("7iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX", &pattern),
            TONY_ADDRESS,
        );
    }

    #[test]
    fn leaves_near_misses_alone() {
        let pattern = pattern();
        // Too short, wrong prefix, and embedded in a larger word.
        for message in [
            "7short",
            "87iKDZEwPZSqIvDnHvVN2r0hUWXD5rHX",
            "x7iKDZEwPZSqIvDnHvVN2r0hUWXD5rHXx",
        ] {
            assert_eq!(rewrite_message(message, &pattern), message);
        }
    }
}
