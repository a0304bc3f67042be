#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileOutcome {
    Compiled,
    Failed,
}

/// What one compile decided: which values cross from forward to backward
/// and what the two halves look like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileRecord {
    pub key_digest: String,
    pub partitioner: String,
    pub outcome: CompileOutcome,
    pub num_saved: usize,
    pub saved_names: Vec<String>,
    /// `None` when a saved value has no known size.
    pub saved_bytes: Option<u64>,
    pub cut_value: Option<u64>,
    pub forward_nodes: usize,
    pub backward_nodes: usize,
    pub detail: Option<String>,
    pub timestamp_unix_ms: u128,
}

impl CompileRecord {
    #[must_use]
    pub fn compiled(key_digest: impl Into<String>, partitioner: impl Into<String>) -> Self {
        Self {
            key_digest: key_digest.into(),
            partitioner: partitioner.into(),
            outcome: CompileOutcome::Compiled,
            num_saved: 0,
            saved_names: Vec::new(),
            saved_bytes: None,
            cut_value: None,
            forward_nodes: 0,
            backward_nodes: 0,
            detail: None,
            timestamp_unix_ms: now_unix_ms(),
        }
    }

    #[must_use]
    pub fn failed(
        key_digest: impl Into<String>,
        partitioner: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            outcome: CompileOutcome::Failed,
            detail: Some(detail.into()),
            ..Self::compiled(key_digest, partitioner)
        }
    }

    #[must_use]
    pub fn with_saved(
        mut self,
        saved_names: Vec<String>,
        saved_bytes: Option<u64>,
        cut_value: Option<u64>,
    ) -> Self {
        self.num_saved = saved_names.len();
        self.saved_names = saved_names;
        self.saved_bytes = saved_bytes;
        self.cut_value = cut_value;
        self
    }

    #[must_use]
    pub fn with_graph_sizes(mut self, forward_nodes: usize, backward_nodes: usize) -> Self {
        self.forward_nodes = forward_nodes;
        self.backward_nodes = backward_nodes;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileLedger {
    records: Vec<CompileRecord>,
}

impl CompileLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn append(&mut self, record: CompileRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> &[CompileRecord] {
        &self.records
    }

    pub fn count(&self, outcome: CompileOutcome) -> usize {
        self.records
            .iter()
            .filter(|record| record.outcome == outcome)
            .count()
    }

    #[must_use]
    pub fn last(&self) -> Option<&CompileRecord> {
        self.records.last()
    }
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use super::{CompileLedger, CompileOutcome, CompileRecord};

    #[test]
    fn record_includes_timestamp() {
        let record = CompileRecord::compiled("agc-00", "default");
        assert!(record.timestamp_unix_ms > 0);
        assert_eq!(record.outcome, CompileOutcome::Compiled);
    }

    #[test]
    fn saved_count_follows_names() {
        let record = CompileRecord::compiled("agc-00", "min_cut")
            .with_saved(vec!["primals_2".to_owned()], Some(96), Some(96))
            .with_graph_sizes(5, 4);
        assert_eq!(record.num_saved, 1);
        assert_eq!(record.saved_bytes, Some(96));
        assert_eq!((record.forward_nodes, record.backward_nodes), (5, 4));
    }

    #[test]
    fn ledger_counts_outcomes() {
        let mut ledger = CompileLedger::new();
        assert!(ledger.is_empty());
        ledger.append(CompileRecord::failed("agc-01", "default", "backend down"));
        ledger.append(CompileRecord::compiled("agc-01", "default"));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.count(CompileOutcome::Failed), 1);
        assert_eq!(
            ledger.last().map(|record| record.outcome),
            Some(CompileOutcome::Compiled)
        );
    }

    #[test]
    fn ledger_serializes() {
        let mut ledger = CompileLedger::new();
        ledger.append(CompileRecord::compiled("agc-02", "min_cut"));
        let encoded = serde_json::to_string(&ledger).expect("serialize");
        let decoded: CompileLedger = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, ledger);
    }
}
