//! Boot telemetry shared by firmware and host targets.
//!
//! The core never formats log lines itself. It hands structured
//! [`BootEvent`]s to a [`TelemetrySink`]; the firmware forwards them to defmt
//! and the emulator prints them, while tests keep them in a
//! [`TelemetryRecorder`] ring for inspection.

use core::fmt;

use heapless::{HistoryBuf, OldestOrdered};

use crate::boot::{BootError, Decision};
use crate::env::{BootFlag, RecordSource, SaveOutcome, SwapPhase};

/// Monotonic identifier assigned to each recorded event.
pub type EventId = u32;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Everything the boot flow reports while it runs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootEvent {
    WriteProtection { enabled: bool },
    EnvironmentLoaded { flag: BootFlag, source: RecordSource },
    /// No sealed record existed; the factory default was written.
    EnvironmentInitialized,
    EnvironmentSaved { flag: BootFlag, outcome: SaveOutcome },
    Decided(Decision),
    SwapPhaseDone {
        phase: SwapPhase,
        origin_offset: u32,
        update_offset: u32,
    },
    SwapFinished,
    RestoreChunk { copied: u32, total: u32 },
    RestoreFinished,
    HandOff { address: u32 },
    Fatal(BootError),
    ResetCountdown { remaining_secs: u32 },
}

impl BootEvent {
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            BootEvent::EnvironmentLoaded {
                source: RecordSource::Rescue,
                ..
            }
            | BootEvent::EnvironmentInitialized
            | BootEvent::Decided(Decision::Rollback) => Severity::Warn,
            BootEvent::Fatal(_) | BootEvent::ResetCountdown { .. } => Severity::Error,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for BootEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootEvent::WriteProtection { enabled } => {
                write!(f, "write-protection {}", if *enabled { "on" } else { "off" })
            }
            BootEvent::EnvironmentLoaded {
                flag,
                source: RecordSource::Primary { slot },
            } => write!(f, "env-loaded {flag} slot={slot}"),
            BootEvent::EnvironmentLoaded {
                flag,
                source: RecordSource::Rescue,
            } => write!(f, "env-loaded {flag} from rescue bank"),
            BootEvent::EnvironmentInitialized => f.write_str("env-initialized factory default"),
            BootEvent::EnvironmentSaved {
                flag,
                outcome: SaveOutcome::Appended { slot },
            } => write!(f, "env-saved {flag} slot={slot}"),
            BootEvent::EnvironmentSaved {
                flag,
                outcome: SaveOutcome::Compacted,
            } => write!(f, "env-saved {flag} after compaction"),
            BootEvent::Decided(decision) => write!(f, "decision {decision}"),
            BootEvent::SwapPhaseDone {
                phase,
                origin_offset,
                update_offset,
            } => write!(
                f,
                "swap {phase} origin={origin_offset:#x} update={update_offset:#x}"
            ),
            BootEvent::SwapFinished => f.write_str("swap finished"),
            BootEvent::RestoreChunk { copied, total } => {
                write!(f, "restore {copied:#x}/{total:#x}")
            }
            BootEvent::RestoreFinished => f.write_str("restore finished"),
            BootEvent::HandOff { address } => write!(f, "hand-off {address:#010x}"),
            BootEvent::Fatal(err) => write!(f, "fatal: {err}"),
            BootEvent::ResetCountdown { remaining_secs } => {
                write!(f, "reset in {remaining_secs}s")
            }
        }
    }
}

/// Destination for boot events.
pub trait TelemetrySink {
    fn record(&mut self, event: BootEvent);
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for &mut T {
    fn record(&mut self, event: BootEvent) {
        (**self).record(event);
    }
}

/// Sink that discards every event.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&mut self, _event: BootEvent) {}
}

/// Telemetry record stored in the ring buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub id: EventId,
    pub event: BootEvent,
}

/// Telemetry ring buffer type alias.
pub type TelemetryRing<const CAPACITY: usize = TELEMETRY_RING_CAPACITY> =
    HistoryBuf<TelemetryRecord, CAPACITY>;

/// Records boot events into a fixed-size ring buffer, oldest entries first out.
pub struct TelemetryRecorder<const CAPACITY: usize = TELEMETRY_RING_CAPACITY> {
    ring: TelemetryRing<CAPACITY>,
    next_event_id: EventId,
}

impl<const CAPACITY: usize> TelemetryRecorder<CAPACITY> {
    /// Creates a new telemetry recorder with an empty history.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            next_event_id: 0,
        }
    }

    /// Returns an iterator over the recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord> {
        self.ring.oldest_ordered()
    }

    /// Returns the most recent telemetry record, if available.
    pub fn latest(&self) -> Option<&TelemetryRecord> {
        self.ring.recent()
    }

    /// Returns the number of records currently stored.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns `true` when no telemetry records are stored.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Returns `true` if any retained event satisfies `predicate`.
    pub fn contains(&self, predicate: impl Fn(&BootEvent) -> bool) -> bool {
        self.oldest_first().any(|record| predicate(&record.event))
    }
}

impl<const CAPACITY: usize> Default for TelemetryRecorder<CAPACITY> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAPACITY: usize> TelemetrySink for TelemetryRecorder<CAPACITY> {
    fn record(&mut self, event: BootEvent) {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);
        self.ring.write(TelemetryRecord { id, event });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_keeps_newest_events() {
        let mut recorder = TelemetryRecorder::<2>::new();
        recorder.record(BootEvent::SwapFinished);
        recorder.record(BootEvent::RestoreFinished);
        recorder.record(BootEvent::HandOff {
            address: 0x0800_7000,
        });

        let ids: heapless::Vec<EventId, 2> =
            recorder.oldest_first().map(|record| record.id).collect();
        assert_eq!(ids.as_slice(), &[1, 2]);
        assert_eq!(recorder.len(), 2);
        assert!(!recorder.contains(|event| *event == BootEvent::SwapFinished));
    }

    #[test]
    fn rescue_load_is_a_warning() {
        let event = BootEvent::EnvironmentLoaded {
            flag: BootFlag::Normal,
            source: RecordSource::Rescue,
        };
        assert_eq!(event.severity(), Severity::Warn);
        assert_eq!(
            BootEvent::ResetCountdown { remaining_secs: 3 }.severity(),
            Severity::Error
        );
    }
}
