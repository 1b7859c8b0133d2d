use crate::version::FirmwareVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STAGE_PERCENTAGES: [u8; 4] = [5, 25, 50, 100];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RolloutStatus {
    Active,
    Paused,
    Completing,
    Completed,
    Cancelled,
}

/// A percentage-staged deployment of one firmware version across the fleet.
///
/// `current_stage` is 1-based; `stage_percentages` is non-decreasing and ends
/// at 100. The device cut for stage *k* is `ceil(total * p_k / 100)` over a
/// stable fleet ordering, so each stage's target set contains the previous
/// stage's.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedRollout {
    pub id: i64,
    pub version: FirmwareVersion,
    pub current_stage: usize,
    pub stage_percentages: Vec<u8>,
    pub status: RolloutStatus,
    pub total_devices: usize,
    pub updated_devices: usize,
    pub failed_devices: usize,
    pub auto_expand: bool,
    pub expand_after_minutes: i64,
    /// Pause instead of expanding when `failed/updated` reaches this percent.
    pub failure_threshold: u8,
    pub last_expanded: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl StagedRollout {
    /// Number of devices covered once stage `stage` (1-based) is active.
    pub fn stage_cut(&self, stage: usize) -> usize {
        let pct = self
            .stage_percentages
            .get(stage - 1)
            .copied()
            .unwrap_or(100) as usize;
        (self.total_devices * pct).div_ceil(100).max(1)
    }

    pub fn is_last_stage(&self, stage: usize) -> bool {
        stage >= self.stage_percentages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rollout(total: usize, stages: &[u8]) -> StagedRollout {
        StagedRollout {
            id: 1,
            version: FirmwareVersion::parse("v3.0.0").unwrap(),
            current_stage: 1,
            stage_percentages: stages.to_vec(),
            status: RolloutStatus::Active,
            total_devices: total,
            updated_devices: 0,
            failed_devices: 0,
            auto_expand: false,
            expand_after_minutes: 30,
            failure_threshold: 10,
            last_expanded: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_stage_cuts_round_up_and_never_shrink() {
        let r = rollout(20, &DEFAULT_STAGE_PERCENTAGES);
        assert_eq!(r.stage_cut(1), 1); // ceil(20 * 0.05)
        assert_eq!(r.stage_cut(2), 5);
        assert_eq!(r.stage_cut(3), 10);
        assert_eq!(r.stage_cut(4), 20);

        for k in 2..=4 {
            assert!(r.stage_cut(k) >= r.stage_cut(k - 1));
        }
    }

    #[test]
    fn test_stage_cut_minimum_is_one_device() {
        let r = rollout(3, &[5, 100]);
        assert_eq!(r.stage_cut(1), 1);
        assert_eq!(r.stage_cut(2), 3);
    }
}
