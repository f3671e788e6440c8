use fxsim_core::{EngineEvent, EventSink};
use tracing::debug;

/// Append-only in-memory ledger of engine events: the default `EventSink`.
///
/// Downstream persistence/reporting layers consume `entries()`; the core
/// itself never touches the filesystem. `checkpoint()` only advances the
/// flushed watermark; durable writes are the sink wrapper's concern
/// (temp-file-then-rename or whatever the caller chooses).
#[derive(Debug, Default)]
pub struct Ledger {
    entries: Vec<EngineEvent>,
    flushed: usize,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[EngineEvent] {
        &self.entries
    }

    /// Entries appended since the last checkpoint.
    pub fn unflushed(&self) -> &[EngineEvent] {
        &self.entries[self.flushed..]
    }

    /// Canonical JSON of the deterministic entries. Two batch runs over
    /// identical inputs must produce byte-identical fingerprints; system
    /// events carry per-run identifiers and are excluded.
    pub fn fingerprint(&self) -> serde_json::Result<String> {
        let deterministic: Vec<&EngineEvent> = self
            .entries
            .iter()
            .filter(|e| !matches!(e, EngineEvent::System(_)))
            .collect();
        serde_json::to_string(&deterministic)
    }
}

impl EventSink for Ledger {
    fn record(&mut self, event: &EngineEvent) {
        self.entries.push(event.clone());
    }

    fn checkpoint(&mut self) {
        let pending = self.entries.len() - self.flushed;
        self.flushed = self.entries.len();
        debug!(pending, total = self.flushed, "ledger checkpoint");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fxsim_core::SystemEvent;
    use uuid::Uuid;

    #[test]
    fn checkpoint_advances_watermark() {
        let mut ledger = Ledger::new();
        ledger.record(&EngineEvent::System(SystemEvent::Stopped {
            message: "done".to_string(),
        }));
        assert_eq!(ledger.unflushed().len(), 1);
        ledger.checkpoint();
        assert!(ledger.unflushed().is_empty());
        assert_eq!(ledger.entries().len(), 1);
    }

    #[test]
    fn fingerprint_excludes_run_specific_events() {
        let mut a = Ledger::new();
        let mut b = Ledger::new();
        a.record(&EngineEvent::System(SystemEvent::Started {
            run_id: Uuid::new_v4(),
            message: "run".to_string(),
        }));
        b.record(&EngineEvent::System(SystemEvent::Started {
            run_id: Uuid::new_v4(),
            message: "run".to_string(),
        }));
        assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }
}
