//! Memory pressure probe and local-tier compaction task.

use crate::local::LocalTier;
use crate::observability::CacheMetrics;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Reports the resident memory of the current process.
pub trait MemoryProbe: Send + Sync {
    /// `None` when the platform gives no answer.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`. Returns `None` off Linux.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    Some(kib * 1024)
}

/// Settings for the compaction task.
#[derive(Clone, Copy, Debug)]
pub struct CompactionPolicy {
    pub ceiling_bytes: u64,
    /// Share of local entries evicted per compaction, in `0.0..=1.0`.
    pub fraction: f64,
    pub interval: Duration,
}

/// Run one compaction check. Returns the number of evicted entries.
pub fn compact_if_needed(
    local: &LocalTier,
    probe: &dyn MemoryProbe,
    policy: &CompactionPolicy,
) -> usize {
    let Some(resident) = probe.resident_bytes() else {
        return 0;
    };
    if resident <= policy.ceiling_bytes {
        return 0;
    }

    let evicted = local.compact(policy.fraction);
    info!(
        "Memory {} bytes over ceiling {} bytes: evicted {} local entries",
        resident, policy.ceiling_bytes, evicted
    );
    evicted
}

/// Spawn the periodic compaction task.
///
/// The task holds only a weak reference to the tier and ends once the tier
/// is dropped.
pub fn spawn_compaction(
    local: Weak<LocalTier>,
    probe: Arc<dyn MemoryProbe>,
    metrics: Arc<dyn CacheMetrics>,
    policy: CompactionPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(tier) = local.upgrade() else {
                debug!("Local tier dropped, compaction task exiting");
                break;
            };
            let evicted = compact_if_needed(&tier, probe.as_ref(), &policy);
            if evicted > 0 {
                metrics.record_eviction(evicted);
            }
        }
    })
}
