//! ---
//! vfab_section: "03-device-reconciler"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Per-device poll/report/react reconciliation loop."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use v_fab_msg::DeviceErrorFlags;

/// Delta bookkeeping for one device's shadow record.
///
/// Owned exclusively by the device's reconciler task. The reported record is
/// written only when the current rate or flags differ from the last-reported
/// snapshot; the snapshot starts unset so the first cycle always reports.
#[derive(Debug, Clone, Default)]
pub struct DeviceShadowState {
    /// Current production rate, updated every cycle.
    pub production_rate: i64,
    /// Error flags observed in the current cycle.
    pub error_flags: DeviceErrorFlags,
    /// Rate last written to the reported record.
    pub last_reported_rate: Option<i64>,
    /// Flags last written to the reported record. Compared numerically.
    pub last_reported_flags: Option<DeviceErrorFlags>,
    /// Active error count of the previous cycle, for edge detection.
    pub last_error_count: u32,
}

impl DeviceShadowState {
    /// State for a device assumed to start at `initial_rate`.
    pub fn new(initial_rate: i64) -> Self {
        Self {
            production_rate: initial_rate,
            ..Self::default()
        }
    }

    /// Whether the current rate differs from the last-reported one.
    pub fn rate_changed(&self) -> bool {
        self.last_reported_rate != Some(self.production_rate)
    }

    /// Whether the current flags differ from the last-reported ones.
    pub fn flags_changed(&self) -> bool {
        self.last_reported_flags != Some(self.error_flags)
    }

    /// Record that the current rate and flags reached the reported record.
    pub fn mark_reported(&mut self) {
        self.last_reported_rate = Some(self.production_rate);
        self.last_reported_flags = Some(self.error_flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_cycle_always_counts_as_changed() {
        let state = DeviceShadowState::new(60);
        assert!(state.rate_changed());
        assert!(state.flags_changed());
    }

    #[test]
    fn marking_reported_clears_the_delta() {
        let mut state = DeviceShadowState::new(60);
        state.mark_reported();
        assert!(!state.rate_changed());
        assert!(!state.flags_changed());

        state.production_rate = 50;
        assert!(state.rate_changed());
        assert!(!state.flags_changed());

        state.error_flags = DeviceErrorFlags::POWER_FAILURE;
        assert!(state.flags_changed());
    }

    #[test]
    fn same_count_different_flags_still_counts_as_changed() {
        let mut state = DeviceShadowState::new(60);
        state.error_flags = DeviceErrorFlags::POWER_FAILURE;
        state.mark_reported();

        state.error_flags = DeviceErrorFlags::SENSOR_FAILURE;
        // bitset comparison, not count comparison
        assert!(state.flags_changed());
    }
}
