//! # Telemetria de Consulta — Ring Buffer
//!
//! Um registro por recuperação, num ring buffer limitado (default 500)
//! atrás de um lock próprio. É a única superfície de observabilidade
//! além dos logs — exposta em `GET /api/telemetry/rag`.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;

/// Capacidade default do ring.
pub const TELEMETRY_CAP: usize = 500;

/// Um registro de recuperação.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTelemetry {
    pub timestamp: String,
    pub question: String,
    pub brand_filter: Option<String>,
    pub num_queries: usize,
    pub candidates: usize,
    pub selected: usize,
    pub top_similarity: f32,
    pub sources: Vec<String>,
    pub cache_hit: bool,
    pub search_time_ms: u64,
}

/// Ring buffer de telemetria, descarte O(1) do mais antigo.
pub struct TelemetryRing {
    entries: Mutex<VecDeque<QueryTelemetry>>,
    cap: usize,
}

impl TelemetryRing {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
            cap,
        }
    }

    pub fn record(&self, entry: QueryTelemetry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.cap {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot em ordem de chegada (mais antigo primeiro).
    pub fn snapshot(&self) -> Vec<QueryTelemetry> {
        self.entries.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(question: &str) -> QueryTelemetry {
        QueryTelemetry {
            timestamp: String::new(),
            question: question.to_string(),
            brand_filter: None,
            num_queries: 1,
            candidates: 0,
            selected: 0,
            top_similarity: 0.0,
            sources: Vec::new(),
            cache_hit: false,
            search_time_ms: 0,
        }
    }

    /// Passando da capacidade, o mais antigo sai.
    #[test]
    fn test_ring_eviction() {
        let ring = TelemetryRing::new(2);
        ring.record(entry("a"));
        ring.record(entry("b"));
        ring.record(entry("c"));
        let snap = ring.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].question, "b");
        assert_eq!(snap[1].question, "c");
    }
}
