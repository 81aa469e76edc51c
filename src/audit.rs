//! Security audit trail.
//!
//! Events are metadata only: prekey ids, peer addresses, public key
//! prefixes. Never key bytes or plaintext.

use crate::address::DeviceAddress;
use crate::clock::Clock;

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AuditEvent {
    IdentityCreated { identity: String },
    SignedPrekeyCreated { id: u32 },
    SignedPrekeyRotated { previous: Option<u32>, current: u32 },
    SignedPrekeyPurged { id: u32 },
    OneTimePrekeysGenerated { first_id: u32, count: u32 },
    OneTimePrekeyConsumed { id: u32 },
    /// The directory did not acknowledge consumption; the key is parked.
    OneTimePrekeyConsumptionDeferred { id: u32 },
    SessionEstablished { peer: DeviceAddress, initiator: bool },
    SessionExpired { peer: DeviceAddress },
    SessionRevoked { peer: DeviceAddress },
    PeerIdentityChanged { peer: DeviceAddress },
    PasswordChanged,
    DeviceReset,
}

/// An event stamped with the owning device and unix time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub device: DeviceAddress,
    pub at: i64,
    pub event: AuditEvent,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Emits audit records as `tracing` events on target `e2ee_core::audit`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: AuditRecord) {
        tracing::info!(
            target: "e2ee_core::audit",
            device = %record.device,
            at = record.at,
            event = ?record.event,
            "audit"
        );
    }
}

/// Collects records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// Stamps events for one device and forwards them to a sink.
#[derive(Clone)]
pub(crate) struct Auditor {
    device: DeviceAddress,
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl Auditor {
    pub(crate) fn new(device: DeviceAddress, sink: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            device,
            sink,
            clock,
        }
    }

    pub(crate) fn emit(&self, event: AuditEvent) {
        self.sink.record(AuditRecord {
            device: self.device.clone(),
            at: self.clock.now(),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_records_are_stamped() {
        let sink = Arc::new(MemoryAuditSink::new());
        let clock = Arc::new(ManualClock::new(42));
        let auditor = Auditor::new(DeviceAddress::new("alice", 1), sink.clone(), clock);

        auditor.emit(AuditEvent::OneTimePrekeyConsumed { id: 3 });

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].at, 42);
        assert_eq!(records[0].device, DeviceAddress::new("alice", 1));
        assert_eq!(sink.events(), vec![AuditEvent::OneTimePrekeyConsumed { id: 3 }]);
    }

    #[test]
    fn test_tracing_sink_does_not_panic() {
        TracingAuditSink.record(AuditRecord {
            device: DeviceAddress::new("bob", 2),
            at: 0,
            event: AuditEvent::DeviceReset,
        });
    }
}
