//! Deterministic shard assignment
//!
//! Strategies map a sorted candidate list to item ranges. Every strategy is
//! total (covers `0..total` exactly once) and a pure function of its inputs.

use tracing::debug;

use super::instance::JobInstance;
use crate::error::{JobMeshError, Result};

/// Items per instance, in candidate order
pub type Assignment = Vec<(JobInstance, Vec<u32>)>;

/// Pluggable allocation of shard items to instances
pub trait ShardingStrategy: Send + Sync {
    /// Registry name
    fn name(&self) -> &'static str;

    /// `instances` arrive sorted by instance id
    fn sharding(&self, instances: &[JobInstance], job_name: &str, total: u32) -> Assignment;
}

/// Contiguous blocks; the first `total % n` instances take one extra item
///
/// `T=10, [a, b, c]` yields `a: 0-3, b: 4-6, c: 7-9`.
pub fn average_allocation(instances: &[JobInstance], total: u32) -> Assignment {
    let n = instances.len() as u32;
    if n == 0 {
        return Vec::new();
    }
    let per = total / n;
    let remainder = total % n;

    let mut next = 0;
    let assignment: Assignment = instances
        .iter()
        .enumerate()
        .map(|(idx, instance)| {
            let count = per + u32::from((idx as u32) < remainder);
            let items = (next..next + count).collect();
            next += count;
            (instance.clone(), items)
        })
        .collect();

    debug!("Allocated {} items across {} instances", total, n);
    assignment
}

/// Default strategy
pub struct AverageAllocation;

impl ShardingStrategy for AverageAllocation {
    fn name(&self) -> &'static str {
        "AVG_ALLOCATION"
    }

    fn sharding(&self, instances: &[JobInstance], _job_name: &str, total: u32) -> Assignment {
        average_allocation(instances, total)
    }
}

/// Ascending order for odd job-name hashes, descending for even ones
///
/// Spreads the extra items of several small jobs over different instances.
pub struct OdevitySortByName;

impl ShardingStrategy for OdevitySortByName {
    fn name(&self) -> &'static str {
        "ODEVITY"
    }

    fn sharding(&self, instances: &[JobInstance], job_name: &str, total: u32) -> Assignment {
        let mut ordered = instances.to_vec();
        if name_hash(job_name) % 2 == 0 {
            ordered.reverse();
        }
        average_allocation(&ordered, total)
    }
}

/// Rotate the candidate list by the job-name hash before allocating
pub struct RotateByName;

impl ShardingStrategy for RotateByName {
    fn name(&self) -> &'static str {
        "ROUND_ROBIN"
    }

    fn sharding(&self, instances: &[JobInstance], job_name: &str, total: u32) -> Assignment {
        if instances.is_empty() {
            return Vec::new();
        }
        let offset = (name_hash(job_name).unsigned_abs() as usize) % instances.len();
        let mut ordered = instances.to_vec();
        ordered.rotate_left(offset);
        average_allocation(&ordered, total)
    }
}

/// Stable 31-multiplier string hash; must not change across releases
pub fn name_hash(name: &str) -> i32 {
    name.encode_utf16()
        .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32))
}

static AVERAGE: AverageAllocation = AverageAllocation;
static ODEVITY: OdevitySortByName = OdevitySortByName;
static ROTATE: RotateByName = RotateByName;

/// Named strategies selectable from [`JobConfig::sharding_strategy`](crate::config::JobConfig)
pub struct StrategyRegistry;

impl StrategyRegistry {
    pub const DEFAULT: &'static str = "AVG_ALLOCATION";

    fn all() -> [&'static dyn ShardingStrategy; 3] {
        [&AVERAGE, &ODEVITY, &ROTATE]
    }

    /// Look up a strategy; empty names select the default
    pub fn resolve(name: &str) -> Result<&'static dyn ShardingStrategy> {
        let name = if name.is_empty() { Self::DEFAULT } else { name };
        Self::all()
            .into_iter()
            .find(|s| s.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| JobMeshError::UnknownStrategy { name: name.to_string() })
    }

    pub fn contains(name: &str) -> bool {
        Self::resolve(name).is_ok()
    }

    pub fn names() -> Vec<&'static str> {
        Self::all().iter().map(|s| s.name()).collect()
    }
}
