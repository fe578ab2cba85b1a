use crate::hw::HwInfo;

/// workers = multiplier * logical cores, capped by the batch size.
/// An explicit override still wins over the multiplier.
pub fn auto_tune_workers(hw: &HwInfo, multiplier: usize, jobs: usize, overridden: Option<usize>) -> usize {
    let tuned = hw.logical_cpus.max(1) * multiplier.max(1);
    overridden.unwrap_or(tuned).max(1).min(jobs.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiplier_scales_with_cores() {
        let hw = HwInfo { logical_cpus: 8 };
        assert_eq!(auto_tune_workers(&hw, 2, 100, None), 16);
        assert_eq!(auto_tune_workers(&hw, 2, 3, None), 3);
    }

    #[test]
    fn override_and_floor() {
        let hw = HwInfo { logical_cpus: 4 };
        assert_eq!(auto_tune_workers(&hw, 2, 100, Some(5)), 5);
        assert_eq!(auto_tune_workers(&hw, 2, 0, None), 1);
        assert_eq!(auto_tune_workers(&hw, 0, 100, Some(0)), 1);
    }
}
