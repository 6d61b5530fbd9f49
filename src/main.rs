use std::env;

use anyhow::{Result, bail};
use tracing_subscriber::EnvFilter;

mod chat;
mod echo;
mod kvstore;
mod means;
mod primes;
mod proxy;
mod speed;

const DEFAULT_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(service) = args.get(1) else {
        bail!("usage: roadwatch <service 0-6> [listen addr]");
    };
    let addr = args.get(2).map(String::as_str).unwrap_or(DEFAULT_ADDR);

    match service.as_str() {
        "0" => echo::run(addr).await,
        "1" => primes::run(addr).await,
        "2" => means::run(addr).await,
        "3" => chat::run(addr).await,
        "4" => kvstore::run(addr).await,
        "5" => proxy::run(addr).await,
        "6" => speed::run(addr).await,
        other => bail!("unknown service {other}; expected 0-6"),
    }
}
