//! Hybrid logical clock for conflict resolution across devices.
//!
//! Timestamps combine wall-clock milliseconds with a logical counter and the
//! generating node's id, giving a total order that needs no coordination
//! between devices. The wire form is `"<physical_ms>:<counter>:<node_id>"`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::{Error, Result};

/// A single hybrid logical clock reading.
///
/// Field order matters: the derived `Ord` compares physical time, then the
/// counter, then the node id byte-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HlcTimestamp {
    /// Milliseconds since the UNIX epoch, as seen by the generating node
    pub physical_ms: u64,
    /// Logical counter for events within the same physical millisecond
    pub counter: u32,
    /// Stable id of the generating node
    pub node_id: String,
}

impl HlcTimestamp {
    pub fn new(physical_ms: u64, counter: u32, node_id: impl Into<String>) -> Self {
        Self {
            physical_ms,
            counter,
            node_id: node_id.into(),
        }
    }

    /// Parse from `"physical:counter:node_id"`.
    ///
    /// Only the first two colons separate fields, so node ids may contain
    /// colons themselves.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(physical), Some(counter), Some(node_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidTimestamp(format!("expected 3 fields: {s:?}")));
        };

        let physical_ms = physical
            .parse::<u64>()
            .map_err(|e| Error::InvalidTimestamp(format!("physical time in {s:?}: {e}")))?;
        let counter = counter
            .parse::<u32>()
            .map_err(|e| Error::InvalidTimestamp(format!("counter in {s:?}: {e}")))?;
        if node_id.is_empty() {
            return Err(Error::InvalidTimestamp(format!("empty node id: {s:?}")));
        }

        Ok(Self::new(physical_ms, counter, node_id))
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.physical_ms, self.counter, self.node_id)
    }
}

impl FromStr for HlcTimestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for HlcTimestamp {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<HlcTimestamp> for String {
    fn from(ts: HlcTimestamp) -> Self {
        ts.to_string()
    }
}

/// Compare two stored HLC strings.
///
/// The empty string is the "never written" sentinel and sorts before
/// everything else. Non-empty strings that fail to parse sort after the
/// sentinel and before every valid timestamp, ordered among themselves
/// byte-wise, which keeps the function total.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }

    match (HlcTimestamp::parse(a), HlcTimestamp::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Source of physical time in milliseconds.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall-clock time source.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually driven time source, used to replay clock stutter and backward
/// jumps deterministically.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    now_ms: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, AtomicOrdering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct ClockState {
    last_physical_ms: u64,
    counter: u32,
}

/// Per-node hybrid logical clock.
///
/// Shared by every mutation path in the process; `generate` is the only way
/// to read or advance the internal state.
pub struct HybridClock {
    node_id: String,
    source: Arc<dyn TimeSource>,
    state: Mutex<ClockState>,
}

impl HybridClock {
    /// Create a clock backed by the system wall clock.
    pub fn new(node_id: impl Into<String>) -> Result<Self> {
        Self::with_time_source(node_id, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(
        node_id: impl Into<String>,
        source: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        let node_id = node_id.into();
        if node_id.is_empty() {
            return Err(Error::InvalidArgument("node id cannot be empty".to_string()));
        }

        Ok(Self {
            node_id,
            source,
            state: Mutex::new(ClockState::default()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Wall-clock reading of the underlying time source, for `updated_at`.
    pub fn wall_ms(&self) -> i64 {
        self.source.now_ms() as i64
    }

    /// Generate a timestamp for a local mutation.
    ///
    /// If physical time moved forward the counter resets; if it stalled or
    /// went backwards the previous physical time is kept and the counter
    /// increments, so consecutive calls are always strictly ordered.
    pub fn generate(&self) -> HlcTimestamp {
        let now = self.source.now_ms();
        let mut state = self.state.lock();

        if now > state.last_physical_ms {
            state.last_physical_ms = now;
            state.counter = 0;
        } else {
            match state.counter.checked_add(1) {
                Some(next) => state.counter = next,
                None => {
                    state.last_physical_ms += 1;
                    state.counter = 0;
                }
            }
        }

        HlcTimestamp::new(state.last_physical_ms, state.counter, self.node_id.clone())
    }

    /// Raise the clock state to at least `last_issued`.
    ///
    /// Called at startup with the highest timestamp persisted for this node so
    /// that restarts never hand out a smaller timestamp. Never lowers state.
    pub fn restore(&self, last_issued: &HlcTimestamp) {
        let mut state = self.state.lock();
        match last_issued.physical_ms.cmp(&state.last_physical_ms) {
            Ordering::Greater => {
                state.last_physical_ms = last_issued.physical_ms;
                state.counter = last_issued.counter;
            }
            Ordering::Equal => {
                state.counter = state.counter.max(last_issued.counter);
            }
            Ordering::Less => {}
        }
    }
}

impl fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClock")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
