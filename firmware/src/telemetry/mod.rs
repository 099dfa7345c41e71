//! Log sink that mirrors boot events to defmt (or stdout on the host).
//!
//! Each event gets a sequence number so a reader of the RTT stream can spot
//! dropped lines; the level follows [`BootEvent::severity`].

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use bootloader_core::telemetry::{BootEvent, EventId, Severity, TelemetrySink};

pub struct DefmtTelemetry {
    next_event_id: EventId,
}

impl DefmtTelemetry {
    pub const fn new() -> Self {
        Self { next_event_id: 0 }
    }
}

impl TelemetrySink for DefmtTelemetry {
    fn record(&mut self, event: BootEvent) {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);
        emit_log(id, &event);
    }
}

#[cfg(not(target_os = "none"))]
const fn level_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "INFO",
        Severity::Warn => "WARN",
        Severity::Error => "ERROR",
    }
}

#[cfg(target_os = "none")]
fn emit_log(id: EventId, event: &BootEvent) {
    let line = defmt::Display2Format(event);
    match event.severity() {
        Severity::Info => defmt::info!("boot#{} {}", id, line),
        Severity::Warn => defmt::warn!("boot#{} {}", id, line),
        Severity::Error => defmt::error!("boot#{} {}", id, line),
    }
}

#[cfg(not(target_os = "none"))]
fn emit_log(id: EventId, event: &BootEvent) {
    println!("{:<5} boot#{id} {event}", level_label(event.severity()));
}
