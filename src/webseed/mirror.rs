//! Mirror sources
//!
//! One HTTP origin per [`Mirror`]. Capability probing and quarantine are
//! modelled as an explicit state machine; every change goes through
//! [`Mirror::transition`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Index of a mirror in the engine's mirror table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MirrorId(pub usize);

impl fmt::Display for MirrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mirror#{}", self.0)
    }
}

/// Scheduling state of a mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    /// Never probed
    Unprobed,
    /// Probe request in flight
    Probing,
    /// Probed successfully
    Ready {
        /// Server honours `Range` requests
        ranges: bool,
        /// Size reported for the probe target, if any
        length: Option<u64>,
    },
    /// Excluded from scheduling until the deadline passes
    Quarantined { until: Instant },
}

/// Input to [`Mirror::transition`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    ProbeStarted,
    ProbeSucceeded { ranges: bool, length: Option<u64> },
    Failed { until: Instant, error: String },
}

/// One HTTP origin serving the torrent's content
#[derive(Debug)]
pub struct Mirror {
    pub url: String,
    state: MirrorState,
    /// Tasks currently assigned to this mirror
    pub active: usize,
    /// Bytes written from this mirror, shared with its running tasks
    pub downloaded: Arc<AtomicU64>,
    pub last_error: Option<String>,
}

impl Mirror {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: MirrorState::Unprobed,
            active: 0,
            downloaded: Arc::new(AtomicU64::new(0)),
            last_error: None,
        }
    }

    pub fn state(&self) -> MirrorState {
        self.state
    }

    /// Apply `event`. Returns false (and leaves the state alone) when the
    /// event makes no sense in the current state.
    pub fn transition(&mut self, event: MirrorEvent) -> bool {
        let next = match (&self.state, event) {
            (MirrorState::Unprobed | MirrorState::Quarantined { .. }, MirrorEvent::ProbeStarted) => {
                debug!("Probing {}", self.url);
                MirrorState::Probing
            }
            (MirrorState::Probing, MirrorEvent::ProbeSucceeded { ranges, length }) => {
                info!("Mirror {} ready (ranges: {}, length: {:?})", self.url, ranges, length);
                self.last_error = None;
                MirrorState::Ready { ranges, length }
            }
            (_, MirrorEvent::Failed { until, error }) => {
                warn!("Quarantining mirror {}: {}", self.url, error);
                self.last_error = Some(error);
                MirrorState::Quarantined { until }
            }
            (state, event) => {
                debug!("Ignoring {:?} for mirror {} in state {:?}", event, self.url, state);
                return false;
            }
        };
        self.state = next;
        true
    }

    /// Ready to take another task (capacity is checked separately)
    pub fn usable_now(&self) -> bool {
        matches!(self.state, MirrorState::Ready { .. })
    }

    /// Never probed, or quarantined with an expired deadline
    pub fn probe_due(&self, now: Instant) -> bool {
        match self.state {
            MirrorState::Unprobed => true,
            MirrorState::Quarantined { until } => until <= now,
            _ => false,
        }
    }

    pub fn supports_ranges(&self) -> bool {
        matches!(self.state, MirrorState::Ready { ranges: true, .. })
    }

    pub fn quarantined_until(&self) -> Option<Instant> {
        match self.state {
            MirrorState::Quarantined { until } => Some(until),
            _ => None,
        }
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }
}
