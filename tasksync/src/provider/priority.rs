use crate::model::Priority;

/// Maps the four local priority levels onto a provider scale of `levels`
/// steps numbered from 1 (least urgent).
///
/// Local rank `r` lands in bucket `floor(r * levels / 4) + 1`, which is
/// monotonic and sends uneven splits to the less urgent bucket. Going back,
/// each bucket maps to the least urgent local level it contains, so on scales
/// shorter than four steps some levels do not survive a round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityScale {
    levels: u8,
}

impl PriorityScale {
    pub const fn new(levels: u8) -> Self {
        let levels = if levels == 0 { 1 } else { levels };
        Self { levels }
    }

    pub fn to_provider(&self, priority: Priority) -> u8 {
        let rank = priority.rank();
        let bucket = rank * usize::from(self.levels) / Priority::ALL.len();
        // bucket < levels, so the cast cannot truncate
        bucket as u8 + 1
    }

    pub fn to_local(&self, level: u8) -> Priority {
        let level = level.clamp(1, self.levels);
        Priority::ALL
            .into_iter()
            .find(|priority| self.to_provider(*priority) >= level)
            .unwrap_or(Priority::Critical)
    }

    pub fn is_lossless(&self) -> bool {
        Priority::ALL
            .into_iter()
            .all(|priority| self.to_local(self.to_provider(priority)) == priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_level_scale_is_exact() {
        let scale = PriorityScale::new(4);
        let provider: Vec<_> = Priority::ALL.iter().map(|p| scale.to_provider(*p)).collect();
        assert_eq!(provider, vec![1, 2, 3, 4]);
        assert!(scale.is_lossless());
    }

    #[test]
    fn three_level_scale_compresses_toward_less_urgent() {
        let scale = PriorityScale::new(3);
        let provider: Vec<_> = Priority::ALL.iter().map(|p| scale.to_provider(*p)).collect();
        assert_eq!(provider, vec![1, 1, 2, 3]);
        assert_eq!(scale.to_local(1), Priority::Low);
        assert_eq!(scale.to_local(2), Priority::High);
        assert_eq!(scale.to_local(3), Priority::Critical);
        assert!(!scale.is_lossless());
    }

    #[test]
    fn mapping_is_monotonic_for_every_scale() {
        for levels in 1..=9 {
            let scale = PriorityScale::new(levels);
            let mapped: Vec<_> = Priority::ALL.iter().map(|p| scale.to_provider(*p)).collect();
            assert!(mapped.windows(2).all(|w| w[0] <= w[1]), "levels={levels}");
            assert!(mapped.iter().all(|level| (1..=levels).contains(level)));
        }
    }

    #[test]
    fn out_of_range_levels_are_clamped() {
        let scale = PriorityScale::new(4);
        assert_eq!(scale.to_local(0), Priority::Low);
        assert_eq!(scale.to_local(9), Priority::Critical);
    }
}
