use std::collections::HashMap;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const VERSION_KEY: &[u8] = b"version";
const VERSION: &[u8] = b"roadwatch key-value store 1.0";

/// UDP key-value store. Datagrams with an `=` insert (first `=` splits key
/// from value); anything else retrieves. The version key is reserved.
pub async fn run(addr: &str) -> Result<()> {
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "key-value store listening");

    let mut store = HashMap::<Vec<u8>, Vec<u8>>::new();
    let mut buf = [0u8; 1000];

    loop {
        let (len, peer) = socket.recv_from(&mut buf).await.context("receiving datagram")?;
        let datagram = &buf[..len];

        if let Some(split) = datagram.iter().position(|&b| b == b'=') {
            let key = &datagram[..split];
            if key == VERSION_KEY {
                debug!(%peer, "ignored version overwrite");
                continue;
            }
            store.insert(key.to_vec(), datagram[split + 1..].to_vec());
            continue;
        }

        let value = if datagram == VERSION_KEY {
            VERSION
        } else {
            match store.get(datagram) {
                Some(value) => value.as_slice(),
                None => continue,
            }
        };

        let mut reply = Vec::with_capacity(datagram.len() + 1 + value.len());
        reply.extend_from_slice(datagram);
        reply.push(b'=');
        reply.extend_from_slice(value);
        if let Err(err) = socket.send_to(&reply, peer).await {
            warn!(%peer, %err, "reply failed");
        }
    }
}
