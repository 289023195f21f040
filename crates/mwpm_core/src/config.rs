//! Configuration for partitioning, the worker pool and streaming.
//!
//! Every struct here deserializes from JSON with defaults for missing keys and
//! rejects unknown keys. A few legacy key names from older benchmark scripts
//! are still accepted; `SolverConfig::validate` folds them into the current
//! fields before any thread is started. Those scripts also split the solver
//! keys into `primal` and `dual` sections, which `SolverConfig::from_json`
//! lifts to the top level.

use crate::error::{MwpmError, Result};
use mwpm_common::VertexRange;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Explicit leaf layout and fusion order.
///
/// Units are numbered leaves first (`0..partitions.len()`), then one unit per
/// entry of `fusions` in order. Each fusion references two earlier units.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    pub partitions: Vec<VertexRange>,
    #[serde(default)]
    pub fusions: Vec<(usize, usize)>,
}

/// How leaves are cut from the graph.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionStrategy {
    /// One leaf holding the whole graph.
    #[default]
    None,

    /// Even split of the segment axis into `partition_num` leaves.
    #[serde(alias = "phenomenological-planar-code-time-partition")]
    TimeAxis,

    /// Caller-provided layout.
    Manual(PartitionConfig),
}

/// Partitioner options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionSettings {
    #[serde(default)]
    pub strategy: PartitionStrategy,

    /// Leaf count for the time-axis strategy.
    #[serde(default = "default_partition_num")]
    pub partition_num: usize,

    /// Balanced fusion tree when true, left-deep chain otherwise.
    #[serde(default = "default_true")]
    pub enable_tree_fusion: bool,

    /// Largest leaf, in segments, before it is split in half.
    #[serde(default)]
    pub maximum_tree_leaf_size: Option<usize>,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            strategy: PartitionStrategy::None,
            partition_num: default_partition_num(),
            enable_tree_fusion: true,
            maximum_tree_leaf_size: None,
        }
    }
}

impl PartitionSettings {
    /// Time-axis split into `partition_num` leaves with a balanced tree.
    pub fn time_axis(partition_num: usize) -> Self {
        Self {
            strategy: PartitionStrategy::TimeAxis,
            partition_num,
            ..Self::default()
        }
    }

    pub fn manual(config: PartitionConfig) -> Self {
        Self {
            strategy: PartitionStrategy::Manual(config),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| MwpmError::Config(e.to_string()))
    }
}

/// Wait style used by idle workers and by per-node result slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStyle {
    /// Busy-wait on an atomic flag. Lowest latency, burns a core per worker.
    Spin,
    /// Park on a condition variable.
    #[default]
    Blocking,
}

/// Streaming controller options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    /// Time between two measurement rounds, in nanoseconds.
    #[serde(default)]
    pub measure_interval_ns: u64,

    /// Round `k` must be decoded before round `k + backlog_limit` arrives.
    #[serde(default = "default_backlog_limit")]
    pub backlog_limit: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            measure_interval_ns: 0,
            backlog_limit: default_backlog_limit(),
        }
    }
}

impl StreamConfig {
    pub fn measure_interval(&self) -> Duration {
        Duration::from_nanos(self.measure_interval_ns)
    }
}

/// Worker pool and scheduling options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolverConfig {
    /// Worker count; 0 means one per available core.
    #[serde(default)]
    pub thread_pool_size: usize,

    #[serde(default)]
    pub pin_threads_to_cores: bool,

    #[serde(default)]
    pub sync_style: SyncStyle,

    /// Leaf jobs started before a ready fusion job takes priority.
    /// 0 means `2 * threads + 1`.
    #[serde(default, alias = "interleaving_base_fusion")]
    pub interleaving_depth: usize,

    #[serde(default)]
    pub stream: StreamConfig,

    /// Legacy spelling of `sync_style = "spin"`.
    #[serde(default, rename = "streaming_decode_use_spin_lock", skip_serializing)]
    pub legacy_spin_lock: Option<bool>,

    /// Legacy round interval in seconds.
    #[serde(default, rename = "streaming_decode_mock_measure_interval", skip_serializing)]
    pub legacy_measure_interval: Option<f64>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: 0,
            pin_threads_to_cores: false,
            sync_style: SyncStyle::Blocking,
            interleaving_depth: 0,
            stream: StreamConfig::default(),
            legacy_spin_lock: None,
            legacy_measure_interval: None,
        }
    }
}

impl SolverConfig {
    pub fn with_threads(thread_pool_size: usize) -> Self {
        Self {
            thread_pool_size,
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| MwpmError::Config(e.to_string()))?;
        let mut config: Self = serde_json::from_value(lift_sections(value)?)
            .map_err(|e| MwpmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Folds legacy keys into current fields and checks ranges.
    pub fn validate(&mut self) -> Result<()> {
        if let Some(spin) = self.legacy_spin_lock.take() {
            self.sync_style = if spin { SyncStyle::Spin } else { SyncStyle::Blocking };
        }
        if let Some(seconds) = self.legacy_measure_interval.take() {
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(MwpmError::Config(format!(
                    "invalid measure interval {} s",
                    seconds
                )));
            }
            self.stream.measure_interval_ns = (seconds * 1e9).round() as u64;
        }
        if self.stream.backlog_limit == 0 {
            return Err(MwpmError::Config("backlog_limit must be at least 1".into()));
        }
        Ok(())
    }

    /// Worker count after resolving the 0 default.
    pub fn resolved_threads(&self) -> usize {
        if self.thread_pool_size > 0 {
            return self.thread_pool_size;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Interleaving depth after resolving the 0 default.
    pub fn resolved_interleaving_depth(&self) -> usize {
        if self.interleaving_depth > 0 {
            self.interleaving_depth
        } else {
            2 * self.resolved_threads() + 1
        }
    }
}

/// Moves the keys of `primal` and `dual` sections into the enclosing object.
/// A key given twice must carry the same value everywhere.
fn lift_sections(value: Value) -> Result<Value> {
    let Value::Object(mut top) = value else {
        return Ok(value);
    };
    for section in ["primal", "dual"] {
        let Some(inner) = top.remove(section) else {
            continue;
        };
        let Value::Object(inner) = inner else {
            return Err(MwpmError::Config(format!("`{}` must be an object", section)));
        };
        for (key, v) in inner {
            match top.get(&key) {
                Some(existing) if *existing != v => {
                    return Err(MwpmError::Config(format!(
                        "conflicting values for `{}` in `{}`",
                        key, section
                    )));
                }
                Some(_) => {}
                None => {
                    top.insert(key, v);
                }
            }
        }
    }
    Ok(Value::Object(top))
}

fn default_partition_num() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_backlog_limit() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_settings_accept_strategy_aliases() {
        let s = PartitionSettings::from_json(
            r#"{"strategy":"phenomenological-planar-code-time-partition","partition_num":4,"maximum_tree_leaf_size":2}"#,
        )
        .unwrap();
        assert_eq!(s.strategy, PartitionStrategy::TimeAxis);
        assert_eq!(s.partition_num, 4);
        assert!(s.enable_tree_fusion);
        assert_eq!(s.maximum_tree_leaf_size, Some(2));
    }

    #[test]
    fn manual_layout_round_trips_through_json() {
        let s = PartitionSettings::manual(PartitionConfig {
            partitions: vec![VertexRange::new(0, 2), VertexRange::new(2, 5)],
            fusions: vec![(0, 1)],
        });
        let text = serde_json::to_string(&s).unwrap();
        assert_eq!(PartitionSettings::from_json(&text).unwrap(), s);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(PartitionSettings::from_json(r#"{"partitions_num":3}"#).is_err());
        assert!(SolverConfig::from_json(r#"{"threads":3}"#).is_err());
    }

    #[test]
    fn legacy_solver_keys_are_folded() {
        let c = SolverConfig::from_json(
            r#"{"thread_pool_size":2,"pin_threads_to_cores":true,"streaming_decode_use_spin_lock":true,
                "streaming_decode_mock_measure_interval":0.000002,"interleaving_base_fusion":5}"#,
        )
        .unwrap();
        assert_eq!(c.sync_style, SyncStyle::Spin);
        assert_eq!(c.stream.measure_interval_ns, 2000);
        assert_eq!(c.resolved_interleaving_depth(), 5);
        assert_eq!(c.resolved_threads(), 2);
    }

    #[test]
    fn primal_and_dual_sections_are_lifted() {
        let c = SolverConfig::from_json(
            r#"{"primal":{"thread_pool_size":2,"pin_threads_to_cores":true},"dual":{"thread_pool_size":2}}"#,
        )
        .unwrap();
        assert_eq!(c.resolved_threads(), 2);
        assert!(c.pin_threads_to_cores);

        let c = SolverConfig::from_json(
            r#"{"primal":{"thread_pool_size":4,"streaming_decode_mock_measure_interval":0.5,
                "streaming_decode_use_spin_lock":true,"interleaving_base_fusion":3},
                "dual":{"thread_pool_size":4}}"#,
        )
        .unwrap();
        assert_eq!(c.sync_style, SyncStyle::Spin);
        assert_eq!(c.stream.measure_interval_ns, 500_000_000);
        assert_eq!(c.resolved_interleaving_depth(), 3);
    }

    #[test]
    fn sections_must_agree_and_use_known_keys() {
        let conflict = r#"{"primal":{"thread_pool_size":2},"dual":{"thread_pool_size":4}}"#;
        assert!(matches!(SolverConfig::from_json(conflict), Err(MwpmError::Config(_))));
        assert!(SolverConfig::from_json(r#"{"primal":{"threads":2}}"#).is_err());
        assert!(SolverConfig::from_json(r#"{"dual":3}"#).is_err());
    }

    #[test]
    fn zero_backlog_limit_is_a_config_error() {
        let err = SolverConfig::from_json(r#"{"stream":{"backlog_limit":0}}"#).unwrap_err();
        assert!(matches!(err, MwpmError::Config(_)));
    }

    #[test]
    fn interleaving_defaults_to_twice_threads_plus_one() {
        let c = SolverConfig::with_threads(3);
        assert_eq!(c.resolved_interleaving_depth(), 7);
    }
}
