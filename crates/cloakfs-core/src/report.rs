//! Corruption reporting channel.
//!
//! Authentication failures and structural corruption are surfaced to the
//! caller as I/O errors, and additionally emitted on a bounded channel that
//! integrity-check tooling can subscribe to. The producer side never blocks:
//! if the consumer is slow, reports are dropped.

use std::path::PathBuf;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::warn;

/// One detected-corruption event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
    /// Backing path of the corrupt item.
    pub path: PathBuf,
    /// What failed (block number, sidecar name, attribute name, ...).
    pub detail: String,
}

/// Producer handle, cheap to clone.
#[derive(Debug, Clone)]
pub struct CorruptionSink {
    tx: Sender<CorruptionReport>,
}

impl CorruptionSink {
    /// Emit a report without blocking. A full channel drops the report.
    pub fn emit(&self, report: CorruptionReport) {
        match self.tx.try_send(report) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Create a corruption channel with the given capacity.
///
/// Dropping the receiver ends the scan: subsequent reports are discarded,
/// normal I/O is unaffected.
pub fn corruption_channel(capacity: usize) -> (CorruptionSink, Receiver<CorruptionReport>) {
    let (tx, rx) = bounded(capacity);
    (CorruptionSink { tx }, rx)
}

/// Internal reporting front: always logs, forwards to a sink when attached.
#[derive(Debug, Clone, Default)]
pub(crate) struct Reporter {
    sink: Option<CorruptionSink>,
}

impl Reporter {
    pub(crate) fn new(sink: Option<CorruptionSink>) -> Self {
        Reporter { sink }
    }

    pub(crate) fn corrupt(&self, path: impl Into<PathBuf>, detail: impl Into<String>) {
        let report = CorruptionReport {
            path: path.into(),
            detail: detail.into(),
        };
        warn!(path = %report.path.display(), detail = %report.detail, "corruption detected");
        if let Some(sink) = &self.sink {
            sink.emit(report);
        }
    }
}
