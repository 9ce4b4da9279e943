//! Cipher-suite registry for a bus attachment.
//!
//! Three suites exist; priority is the numeric suite id, highest first,
//! so ECDSA > PSK > NULL. ECDSA is only usable from auth version 3 (the
//! keying-material encoding changed there). PSK is auto-enabled when a
//! password callback is registered.

pub const SUITE_ECDHE_NULL: u32 = 0x0001_0100;
pub const SUITE_ECDHE_PSK: u32 = 0x0001_0101;
pub const SUITE_ECDHE_ECDSA: u32 = 0x0001_0102;

/// Auth version at which ECDHE_ECDSA becomes available.
const ECDSA_MIN_AUTH_VERSION: u16 = 3;

#[derive(Debug, Clone, Default)]
pub struct SuiteRegistry {
    null_enabled: bool,
    psk_enabled: bool,
    ecdsa_enabled: bool,
}

impl SuiteRegistry {
    pub fn new() -> SuiteRegistry {
        SuiteRegistry::default()
    }

    pub fn enable(&mut self, suite: u32) {
        match suite {
            SUITE_ECDHE_NULL => self.null_enabled = true,
            SUITE_ECDHE_PSK => self.psk_enabled = true,
            SUITE_ECDHE_ECDSA => self.ecdsa_enabled = true,
            _ => {}
        }
    }

    pub fn disable(&mut self, suite: u32) {
        match suite {
            SUITE_ECDHE_NULL => self.null_enabled = false,
            SUITE_ECDHE_PSK => self.psk_enabled = false,
            SUITE_ECDHE_ECDSA => self.ecdsa_enabled = false,
            _ => {}
        }
    }

    /// Whether a suite is both enabled and supported at an auth version.
    pub fn is_enabled(&self, suite: u32, auth_version: u16) -> bool {
        match suite {
            SUITE_ECDHE_NULL => self.null_enabled,
            SUITE_ECDHE_PSK => self.psk_enabled,
            SUITE_ECDHE_ECDSA => self.ecdsa_enabled && auth_version >= ECDSA_MIN_AUTH_VERSION,
            _ => false,
        }
    }

    /// Suites to offer, highest priority first.
    pub fn offered(&self, auth_version: u16) -> Vec<u32> {
        [SUITE_ECDHE_ECDSA, SUITE_ECDHE_PSK, SUITE_ECDHE_NULL]
            .into_iter()
            .filter(|s| self.is_enabled(*s, auth_version))
            .collect()
    }

    /// The highest-priority suite both sides support, if any. Priority
    /// order coincides with the numeric order of the suite ids.
    pub fn highest_common(&self, offered: &[u32], auth_version: u16) -> Option<u32> {
        offered
            .iter()
            .copied()
            .filter(|s| self.is_enabled(*s, auth_version))
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order() {
        let mut reg = SuiteRegistry::new();
        reg.enable(SUITE_ECDHE_NULL);
        reg.enable(SUITE_ECDHE_PSK);
        reg.enable(SUITE_ECDHE_ECDSA);
        assert_eq!(
            reg.offered(4),
            vec![SUITE_ECDHE_ECDSA, SUITE_ECDHE_PSK, SUITE_ECDHE_NULL]
        );
    }

    #[test]
    fn ecdsa_gated_by_version() {
        let mut reg = SuiteRegistry::new();
        reg.enable(SUITE_ECDHE_ECDSA);
        assert!(reg.is_enabled(SUITE_ECDHE_ECDSA, 4));
        assert!(!reg.is_enabled(SUITE_ECDHE_ECDSA, 2));
    }

    #[test]
    fn highest_common_picks_strongest() {
        let mut reg = SuiteRegistry::new();
        reg.enable(SUITE_ECDHE_NULL);
        reg.enable(SUITE_ECDHE_PSK);
        let offered = [SUITE_ECDHE_NULL, SUITE_ECDHE_PSK, SUITE_ECDHE_ECDSA];
        assert_eq!(reg.highest_common(&offered, 4), Some(SUITE_ECDHE_PSK));
        assert_eq!(reg.highest_common(&[SUITE_ECDHE_ECDSA], 4), None);
    }

    #[test]
    fn unknown_suite_never_enabled() {
        let mut reg = SuiteRegistry::new();
        reg.enable(0xdead_beef);
        assert!(!reg.is_enabled(0xdead_beef, 4));
    }
}
