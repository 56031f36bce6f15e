//! Sleep level selection

use crate::client::SleepLevel;

/// Level 1 parks the weights in host RAM, so it is only chosen when they fit.
pub fn determine_sleep_level(available_ram_gb: f64, memory_gb: f64) -> SleepLevel {
    if available_ram_gb >= memory_gb {
        SleepLevel::L1
    } else {
        SleepLevel::L2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plenty_of_room(64.0, 16.0, SleepLevel::L1)]
    #[case::exact_fit(24.0, 24.0, SleepLevel::L1)]
    #[case::just_short(23.9, 24.0, SleepLevel::L2)]
    #[case::no_room(8.0, 70.0, SleepLevel::L2)]
    #[case::unknown_ram(0.0, 16.0, SleepLevel::L2)]
    fn test_determine_sleep_level(
        #[case] available: f64,
        #[case] footprint: f64,
        #[case] expected: SleepLevel,
    ) {
        assert_eq!(determine_sleep_level(available, footprint), expected);
    }
}
