//! Tool usage counters, owned by whoever builds the pipeline and shared by
//! every orchestrator generation.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolUsage {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl ToolUsage {
    pub fn avg_latency_ms(&self) -> u64 {
        if self.calls == 0 {
            0
        } else {
            self.total_latency_ms / self.calls
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub tools: BTreeMap<String, ToolUsage>,
    pub ai_selections: u64,
    pub rule_selections: u64,
    pub orchestrations: u64,
}

#[derive(Debug, Default)]
pub struct ToolUsageStats {
    tools: DashMap<String, ToolUsage>,
    ai_selections: AtomicU64,
    rule_selections: AtomicU64,
    orchestrations: AtomicU64,
}

impl ToolUsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, tool: &str, success: bool, latency_ms: u64) {
        let mut usage = self.tools.entry(tool.to_string()).or_default();
        usage.calls += 1;
        if success {
            usage.successes += 1;
        } else {
            usage.failures += 1;
        }
        usage.total_latency_ms += latency_ms;
        usage.last_used = Some(Utc::now());
    }

    pub fn record_selection(&self, ai: bool) {
        let counter = if ai { &self.ai_selections } else { &self.rule_selections };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orchestration(&self) {
        self.orchestrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            tools: self
                .tools
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            ai_selections: self.ai_selections.load(Ordering::Relaxed),
            rule_selections: self.rule_selections.load(Ordering::Relaxed),
            orchestrations: self.orchestrations.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.tools.clear();
        self.ai_selections.store(0, Ordering::Relaxed);
        self.rule_selections.store(0, Ordering::Relaxed);
        self.orchestrations.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_reset() {
        let stats = ToolUsageStats::new();
        stats.record_call("calculator", true, 10);
        stats.record_call("calculator", false, 30);
        stats.record_selection(false);

        let snapshot = stats.snapshot();
        let calc = &snapshot.tools["calculator"];
        assert_eq!((calc.calls, calc.successes, calc.failures), (2, 1, 1));
        assert_eq!(calc.avg_latency_ms(), 20);
        assert_eq!(snapshot.rule_selections, 1);

        stats.reset();
        assert!(stats.snapshot().tools.is_empty());
        assert_eq!(stats.snapshot().rule_selections, 0);
    }
}
