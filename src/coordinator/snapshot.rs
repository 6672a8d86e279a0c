use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::kamstrup::Reading;

/// All readings of one successful poll cycle, keyed by command code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub readings: BTreeMap<u16, Reading>,
}

impl Snapshot {
    pub fn new(readings: BTreeMap<u16, Reading>) -> Self {
        return Snapshot {
            taken_at: Utc::now(),
            readings,
        };
    }

    pub fn get(&self, command: u16) -> Option<&Reading> {
        self.readings.get(&command)
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Sent to subscribers after every completed cycle.
#[derive(Debug, Clone)]
pub enum PollEvent {
    Updated(Arc<Snapshot>),
    /// Not a single register could be read, the last snapshot stays in place
    UpdateFailed,
}

/// Result of one call to `refresh`.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Updated(Arc<Snapshot>),
    Failed,
    /// Cancelled at a register boundary, nothing was published
    Cancelled,
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Updated(_))
    }
}
