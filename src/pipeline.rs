//! Location sample pipeline.
//!
//! Each sample is written to two independent sinks:
//! 1. **History** - append-only, one row per sample, arrival order not
//!    guaranteed
//! 2. **Current position** - one row per driver, last write wins by the
//!    server's clock
//!
//! The writes do not gate each other. The product need is "where is the
//! driver now", so a failed history append must not hold back the projection.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::error::Result;
use crate::types::{LocationRecord, LocationSample};
use crate::elapsed_ms;

/// Destination for location records (remote store in production).
pub trait LocationSink: Send + Sync {
    /// Append one row to the history.
    fn append_history(&self, record: &LocationRecord) -> Result<()>;
    /// Overwrite the driver's current-position row. The store stamps the
    /// write with its own clock; a failed write leaves the row untouched.
    fn upsert_current(&self, record: &LocationRecord) -> Result<()>;
}

/// Result of one sink write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    Failed(String),
    /// Not attempted (invalid sample)
    Skipped,
}

impl WriteStatus {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteStatus::Written)
    }
}

/// What happened to one sample. For logging only; callers must not use it
/// to gate further tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub history: WriteStatus,
    pub projection: WriteStatus,
}

impl RecordOutcome {
    pub fn is_complete(&self) -> bool {
        self.history.is_written() && self.projection.is_written()
    }

    pub fn is_total_failure(&self) -> bool {
        !self.history.is_written() && !self.projection.is_written()
    }
}

pub struct LocationPipeline {
    sink: Arc<dyn LocationSink>,
}

impl LocationPipeline {
    pub fn new(sink: Arc<dyn LocationSink>) -> Self {
        Self { sink }
    }

    /// Write one sample to history and projection. Never fails.
    pub fn record(&self, sample: &LocationSample) -> RecordOutcome {
        if let Err(e) = sample.validate() {
            warn!("[Pipeline] Dropping invalid sample: {}", e);
            return RecordOutcome {
                history: WriteStatus::Skipped,
                projection: WriteStatus::Skipped,
            };
        }

        let start = Instant::now();
        let record = sample.to_record();

        let history = match self.sink.append_history(&record) {
            Ok(()) => WriteStatus::Written,
            Err(e) => {
                warn!(
                    "[Pipeline] History write failed for driver {}: {}",
                    record.driver_id, e
                );
                WriteStatus::Failed(e.to_string())
            }
        };

        let projection = match self.sink.upsert_current(&record) {
            Ok(()) => WriteStatus::Written,
            Err(e) => {
                warn!(
                    "[Pipeline] Current position write failed for driver {}: {}",
                    record.driver_id, e
                );
                WriteStatus::Failed(e.to_string())
            }
        };

        debug!(
            "[Pipeline] Sample for {} at {} recorded (history: {}, projection: {}) ({} ms)",
            record.driver_id,
            record.timestamp,
            history.is_written(),
            projection.is_written(),
            elapsed_ms(start)
        );

        RecordOutcome {
            history,
            projection,
        }
    }
}
