use crate::map::types::{MapOperation, OPERATION_KINDS};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free operation counters, one per operation kind.
pub struct OperationStats {
    executed: [AtomicU64; OPERATION_KINDS.len()],
    rejected: AtomicU64,
}

impl OperationStats {
    pub fn new() -> Self {
        Self {
            executed: std::array::from_fn(|_| AtomicU64::new(0)),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn record(&self, operation: &MapOperation) {
        if let Some(idx) = OPERATION_KINDS.iter().position(|k| *k == operation.kind()) {
            self.executed[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn executed(&self, kind: &str) -> u64 {
        OPERATION_KINDS
            .iter()
            .position(|k| *k == kind)
            .map(|idx| self.executed[idx].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn collect(&self) -> BTreeMap<String, u64> {
        let mut stats: BTreeMap<String, u64> = OPERATION_KINDS
            .iter()
            .zip(self.executed.iter())
            .map(|(kind, count)| (format!("op.{}", kind), count.load(Ordering::Relaxed)))
            .collect();
        stats.insert(
            "requests.rejected".to_string(),
            self.rejected.load(Ordering::Relaxed),
        );
        stats
    }
}

impl Default for OperationStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps only the statistics named in `names`.
pub fn select(stats: BTreeMap<String, u64>, names: &[&str]) -> BTreeMap<String, u64> {
    stats
        .into_iter()
        .filter(|(name, _)| names.contains(&name.as_str()))
        .collect()
}
