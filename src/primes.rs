use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct Request {
    method: String,
    // Optional so a missing field is distinguishable from zero.
    number: Option<f64>,
}

#[derive(Debug, Default, Serialize)]
struct Response {
    method: String,
    prime: bool,
}

pub async fn run(addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "prime checker listening");

    loop {
        let (stream, peer) = listener.accept().await.context("accepting connection")?;
        tokio::spawn(async move {
            if let Err(err) = handle(stream).await {
                debug!(%peer, %err, "prime session ended");
            }
        });
    }
}

async fn handle(stream: tokio::net::TcpStream) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let response = match check(&line) {
            Some(response) => response,
            None => {
                // Any malformed reply works; an all-defaults response is
                // one, and the connection closes right after.
                warn!(%line, "malformed request");
                write_json(&mut writer, &Response::default()).await?;
                return Ok(());
            }
        };
        write_json(&mut writer, &response).await?;
    }

    Ok(())
}

async fn write_json<W: AsyncWriteExt + Unpin>(writer: &mut W, response: &Response) -> std::io::Result<()> {
    let mut payload = serde_json::to_vec(response).map_err(std::io::Error::other)?;
    payload.push(b'\n');
    writer.write_all(&payload).await
}

fn check(line: &str) -> Option<Response> {
    let request: Request = serde_json::from_str(line).ok()?;
    if request.method != "isPrime" {
        return None;
    }
    let number = request.number?;

    // Non-integers are never prime.
    let prime = number.fract() == 0.0 && number >= 2.0 && is_prime(number as u64);
    Some(Response {
        method: "isPrime".to_string(),
        prime,
    })
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut divisor = 3;
    while divisor * divisor <= n {
        if n % divisor == 0 {
            return false;
        }
        divisor += 2;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_primes_and_rejects_composites() {
        for (n, expected) in [(2.0, true), (3.0, true), (4.0, false), (97.0, true), (1.0, false)] {
            let response = check(&format!(r#"{{"method":"isPrime","number":{n}}}"#)).unwrap();
            assert_eq!(response.prime, expected, "n = {n}");
        }
    }

    #[test]
    fn non_integers_and_negatives_are_not_prime() {
        assert!(!check(r#"{"method":"isPrime","number":3.5}"#).unwrap().prime);
        assert!(!check(r#"{"method":"isPrime","number":-7}"#).unwrap().prime);
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert!(check("not json").is_none());
        assert!(check(r#"{"method":"isOdd","number":3}"#).is_none());
        assert!(check(r#"{"method":"isPrime"}"#).is_none());
    }
}
