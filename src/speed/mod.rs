//! Speed enforcement service.
//!
//! Cameras report plate sightings over a binary TCP protocol; the server
//! infers average speed between two sightings of the same plate on the
//! same road and issues tickets to whichever dispatcher connection covers
//! that road, buffering per road while none does. One process owns a
//! single [`DispatchRegistry`] and a single [`ViolationEngine`] for its
//! whole lifetime; every accepted connection gets its own task.

mod engine;
pub mod protocol;
mod registry;
mod session;
#[cfg(test)]
mod tests;

pub use engine::{Observation, Ticket, ViolationEngine};
pub use registry::{DispatchRegistry, DispatcherHandle};

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

pub async fn run(addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "speed enforcement service listening");

    let registry = Arc::new(DispatchRegistry::new());
    let engine = ViolationEngine::spawn(Arc::clone(&registry));

    loop {
        let (stream, peer) = listener.accept().await.context("accepting connection")?;
        let engine = engine.clone();
        let registry = Arc::clone(&registry);
        tokio::spawn(session::serve(stream, peer, engine, registry));
    }
}
