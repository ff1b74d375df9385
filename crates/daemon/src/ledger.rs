use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use usbgate_common::types::{DecisionRecord, DeviceIdentifier, InterceptionDecision, MountTarget};

/// Decisions reached during this process run, keyed by device instance. Never persisted.
#[derive(Clone, Default)]
pub struct DecisionLedger {
    inner: Arc<Mutex<Vec<DecisionRecord>>>,
}

impl DecisionLedger {
    fn lock(&self) -> MutexGuard<'_, Vec<DecisionRecord>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(
        &self,
        instance: u64,
        identifier: &DeviceIdentifier,
        target: Option<&MountTarget>,
        decision: InterceptionDecision,
    ) {
        let mut records = self.lock();
        let now = Utc::now();
        match records.iter_mut().find(|r| r.instance == instance) {
            Some(r) => {
                r.decision = decision;
                r.decided_at = now;
            }
            None => records.push(DecisionRecord {
                instance,
                identifier: identifier.clone(),
                target: target.cloned(),
                decision,
                decided_at: now,
            }),
        }
    }

    pub fn get(&self, instance: u64) -> Option<DecisionRecord> {
        self.lock().iter().find(|r| r.instance == instance).cloned()
    }

    pub fn snapshot(&self) -> Vec<DecisionRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
