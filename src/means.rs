use std::collections::BTreeMap;
use std::io::ErrorKind;

use anyhow::{Context, Result};
use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

pub async fn run(addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "price statistics service listening");

    loop {
        let (stream, peer) = listener.accept().await.context("accepting connection")?;
        tokio::spawn(async move {
            if let Err(err) = handle(stream).await {
                debug!(%peer, %err, "price session ended");
            }
        });
    }
}

/// Each client gets its own isolated price store. Frames are 9 bytes:
/// one ASCII type byte and two big-endian `i32` fields.
async fn handle(stream: TcpStream) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut prices = BTreeMap::<i32, i32>::new();

    loop {
        let mut frame = [0u8; 9];
        match reader.read_exact(&mut frame).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }

        let first = BigEndian::read_i32(&frame[1..5]);
        let second = BigEndian::read_i32(&frame[5..9]);

        match frame[0] {
            b'I' => {
                prices.insert(first, second);
            }
            b'Q' => {
                let mean = query_mean(&prices, first, second);
                writer.write_i32(mean).await?;
            }
            other => {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("invalid frame type 0x{other:02x}"),
                ));
            }
        }
    }
}

fn query_mean(prices: &BTreeMap<i32, i32>, mintime: i32, maxtime: i32) -> i32 {
    if mintime > maxtime {
        return 0;
    }

    let mut sum: i64 = 0;
    let mut count: i64 = 0;
    for price in prices.range(mintime..=maxtime).map(|(_, price)| *price) {
        sum += i64::from(price);
        count += 1;
    }

    if count == 0 { 0 } else { (sum / count) as i32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn means_over_inclusive_ranges() {
        let mut prices = BTreeMap::new();
        for (timestamp, price) in [(12345, 101), (12346, 102), (12347, 100), (40960, 5)] {
            prices.insert(timestamp, price);
        }
        assert_eq!(query_mean(&prices, 12288, 16384), 101);
    }

    #[test]
    fn empty_and_inverted_ranges_are_zero() {
        let prices = BTreeMap::from([(10, 100)]);
        assert_eq!(query_mean(&prices, 20, 30), 0);
        assert_eq!(query_mean(&prices, 30, 20), 0);
    }

    #[test]
    fn large_sums_do_not_overflow() {
        let mut prices = BTreeMap::new();
        for timestamp in 0..1000 {
            prices.insert(timestamp, i32::MAX);
        }
        assert_eq!(query_mean(&prices, 0, 999), i32::MAX);
    }
}
