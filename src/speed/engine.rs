//! Speed-violation detection.
//!
//! Cameras feed plate observations into a single consumer task, which owns
//! the per-road sighting history and the per-plate ticket calendar. Keeping
//! one mutator serializes every decision, so the "at most one ticket per
//! plate per day" invariant holds no matter how observations interleave
//! across connections.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::protocol::Message;
use super::registry::DispatchRegistry;

const DAY_SECONDS: u32 = 86_400;

/// Minimum excess over the limit, in mph, before a ticket is issued.
/// Guards against float rounding for vehicles at exactly the limit.
const SPEED_MARGIN_MPH: f64 = 0.5;

/// A timestamped sighting of a plate at a camera's fixed position.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub plate: String,
    pub road: u16,
    pub mile: u16,
    pub timestamp: u32,
    pub limit: u16,
}

/// A record asserting a plate averaged an illegal speed between two
/// observations on one road. Timestamps are normalized so that
/// `timestamp1 <= timestamp2` regardless of arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Ticket {
    pub plate: String,
    pub road: u16,
    pub mile1: u16,
    pub timestamp1: u32,
    pub mile2: u16,
    pub timestamp2: u32,
    pub speed_x100: u16,
}

impl Ticket {
    pub fn into_message(self) -> Message {
        Message::Ticket {
            plate: self.plate,
            road: self.road,
            mile1: self.mile1,
            timestamp1: self.timestamp1,
            mile2: self.mile2,
            timestamp2: self.timestamp2,
            speed_x100: self.speed_x100,
        }
    }

    fn days(&self) -> std::ops::RangeInclusive<u32> {
        (self.timestamp1 / DAY_SECONDS)..=(self.timestamp2 / DAY_SECONDS)
    }
}

/// Handle for submitting observations to the engine task.
#[derive(Clone)]
pub struct ViolationEngine {
    observations: mpsc::UnboundedSender<Observation>,
}

impl ViolationEngine {
    /// Spawn the consumer task. Tickets it issues go to `registry`.
    pub fn spawn(registry: Arc<DispatchRegistry>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Observation>();
        tokio::spawn(async move {
            let mut ledger = Ledger::default();
            while let Some(observation) = rx.recv().await {
                debug!(
                    plate = %observation.plate,
                    road = observation.road,
                    mile = observation.mile,
                    timestamp = observation.timestamp,
                    "observation"
                );
                for ticket in ledger.record(observation) {
                    info!(
                        plate = %ticket.plate,
                        road = ticket.road,
                        speed_x100 = ticket.speed_x100,
                        "issuing ticket"
                    );
                    registry.issue(ticket).await;
                }
            }
        });
        Self { observations: tx }
    }

    /// Submit one observation. Observations from a single connection are
    /// processed in submission order.
    pub fn observe(&self, observation: Observation) {
        let _ = self.observations.send(observation);
    }
}

/// The engine's state: sighting history and ticket calendars.
///
/// Only ever touched by the consumer task; kept separate so the ticketing
/// rules can be exercised without a runtime.
#[derive(Default)]
struct Ledger {
    /// road -> plate -> every observation seen, in arrival order.
    sightings: HashMap<u16, HashMap<String, Vec<Observation>>>,
    /// plate -> calendar days (timestamp / 86400) already covered by a
    /// ticket, across all roads.
    calendars: HashMap<String, HashSet<u32>>,
}

impl Ledger {
    /// Fold one observation into the ledger and return the tickets it
    /// triggers. Marking the day span and deciding to issue happen together,
    /// so no later pair can claim an overlapping span.
    fn record(&mut self, observation: Observation) -> Vec<Ticket> {
        let history = self
            .sightings
            .entry(observation.road)
            .or_default()
            .entry(observation.plate.clone())
            .or_default();
        let calendar = self.calendars.entry(observation.plate.clone()).or_default();

        let mut issued = Vec::new();
        for prior in history.iter() {
            let Some(ticket) = violation(prior, &observation) else {
                continue;
            };
            if ticket.days().any(|day| calendar.contains(&day)) {
                continue;
            }
            calendar.extend(ticket.days());
            issued.push(ticket);
        }

        history.push(observation);
        issued
    }
}

/// Average-speed check for a pair of observations of one plate on one road.
///
/// The pair is normalized to chronological order first. Pairs with equal
/// timestamps carry no speed information and never form a violation.
fn violation(prior: &Observation, current: &Observation) -> Option<Ticket> {
    let (first, second) = if current.timestamp < prior.timestamp {
        (current, prior)
    } else {
        (prior, current)
    };

    let elapsed = second.timestamp - first.timestamp;
    if elapsed == 0 {
        return None;
    }

    let distance = f64::from(second.mile.abs_diff(first.mile));
    let speed_mph = distance / f64::from(elapsed) * 3600.0;
    if speed_mph - f64::from(current.limit) < SPEED_MARGIN_MPH {
        return None;
    }

    Some(Ticket {
        plate: current.plate.clone(),
        road: current.road,
        mile1: first.mile,
        timestamp1: first.timestamp,
        mile2: second.mile,
        timestamp2: second.timestamp,
        speed_x100: (speed_mph * 100.0).round() as u16,
    })
}
