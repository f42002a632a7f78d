//! `CompactionConfig`: a plain serde struct with per-field
//! `#[serde(default = "...")]` functions so `CompactionConfig::default()`
//! and an empty TOML table agree.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_context_threshold")]
    pub context_threshold: f64,
    #[serde(default = "default_fresh_tail_count")]
    pub fresh_tail_count: usize,
    #[serde(default = "default_leaf_chunk_tokens")]
    pub leaf_chunk_tokens: u32,
    #[serde(default = "default_leaf_target_tokens")]
    pub leaf_target_tokens: u32,
    #[serde(default = "default_condensed_target_tokens")]
    pub condensed_target_tokens: u32,
    #[serde(default = "default_leaf_min_fanout")]
    pub leaf_min_fanout: usize,
    #[serde(default = "default_condensed_min_fanout")]
    pub condensed_min_fanout: usize,
    #[serde(default = "default_condensed_min_fanout_hard")]
    pub condensed_min_fanout_hard: usize,
    #[serde(default = "default_incremental_max_depth")]
    pub incremental_max_depth: u32,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

fn default_context_threshold() -> f64 {
    0.8
}
fn default_fresh_tail_count() -> usize {
    8
}
fn default_leaf_chunk_tokens() -> u32 {
    20_000
}
fn default_leaf_target_tokens() -> u32 {
    600
}
fn default_condensed_target_tokens() -> u32 {
    900
}
fn default_leaf_min_fanout() -> usize {
    2
}
fn default_condensed_min_fanout() -> usize {
    3
}
fn default_condensed_min_fanout_hard() -> usize {
    2
}
fn default_incremental_max_depth() -> u32 {
    1
}
fn default_max_rounds() -> u32 {
    5
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_threshold: default_context_threshold(),
            fresh_tail_count: default_fresh_tail_count(),
            leaf_chunk_tokens: default_leaf_chunk_tokens(),
            leaf_target_tokens: default_leaf_target_tokens(),
            condensed_target_tokens: default_condensed_target_tokens(),
            leaf_min_fanout: default_leaf_min_fanout(),
            condensed_min_fanout: default_condensed_min_fanout(),
            condensed_min_fanout_hard: default_condensed_min_fanout_hard(),
            incremental_max_depth: default_incremental_max_depth(),
            max_rounds: default_max_rounds(),
        }
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.context_threshold > 0.0 && self.context_threshold <= 1.0,
            "context_threshold must be in (0, 1], got {}",
            self.context_threshold
        );
        anyhow::ensure!(
            self.leaf_min_fanout >= 2,
            "leaf_min_fanout must be >= 2, got {}",
            self.leaf_min_fanout
        );
        anyhow::ensure!(
            self.condensed_min_fanout_hard >= 2,
            "condensed_min_fanout_hard must be >= 2, got {}",
            self.condensed_min_fanout_hard
        );
        anyhow::ensure!(
            self.condensed_min_fanout >= self.condensed_min_fanout_hard,
            "condensed_min_fanout ({}) must be >= condensed_min_fanout_hard ({})",
            self.condensed_min_fanout,
            self.condensed_min_fanout_hard
        );
        anyhow::ensure!(self.max_rounds > 0, "max_rounds must be > 0");
        anyhow::ensure!(self.leaf_chunk_tokens > 0, "leaf_chunk_tokens must be > 0");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_equals_empty_table() {
        let from_empty: CompactionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(from_empty, CompactionConfig::default());
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let mut cfg = CompactionConfig::default();
        cfg.context_threshold = 0.0;
        assert!(cfg.validate().is_err());
        cfg.context_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_low_leaf_fanout() {
        let mut cfg = CompactionConfig::default();
        cfg.leaf_min_fanout = 1;
        assert!(cfg.validate().is_err());
    }
}
