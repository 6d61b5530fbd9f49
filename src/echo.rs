use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub async fn run(addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "echo service listening");

    loop {
        let (mut stream, peer) = listener.accept().await.context("accepting connection")?;
        tokio::spawn(async move {
            let (mut reader, mut writer) = stream.split();
            match tokio::io::copy(&mut reader, &mut writer).await {
                Ok(bytes) => debug!(%peer, bytes, "echo session finished"),
                Err(err) => warn!(%peer, %err, "echo session failed"),
            }
        });
    }
}
