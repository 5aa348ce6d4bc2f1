//! Per-process bookkeeping of the `ensure` loop.
//!
//! None of this is persisted: a daemon restart runs every one-shot step
//! again and resets the registration backoff.

const BACKOFF_INITIAL_MS: i64 = 5 * 60 * 1000;
const BACKOFF_MAX_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Default)]
pub(crate) struct EnsureLifecycle {
    pub ensure_installed_ran: bool,
    pub ensure_factory_reset_ran: bool,
    pub boot_ok_ran: bool,
    pub cloud_init_done: bool,
    pub tried_recovery_system_ran: bool,
    pub no_registration_until_reboot: bool,

    last_become_operational_ms: Option<i64>,
    become_operational_backoff_ms: i64,
}

impl EnsureLifecycle {
    /// Whether a new registration attempt may start at `now_ms`.
    ///
    /// The first attempt is immediate. Each following one waits for the
    /// current backoff, which starts at 5 minutes and doubles up to a day.
    pub fn try_become_operational(&mut self, now_ms: i64) -> bool {
        if let Some(last) = self.last_become_operational_ms {
            if now_ms - last < self.become_operational_backoff_ms {
                return false;
            }
            self.become_operational_backoff_ms =
                (self.become_operational_backoff_ms * 2).min(BACKOFF_MAX_MS);
        } else {
            self.become_operational_backoff_ms = BACKOFF_INITIAL_MS;
        }
        self.last_become_operational_ms = Some(now_ms);
        true
    }

    pub fn reset_registration_backoff(&mut self) {
        self.last_become_operational_ms = None;
        self.become_operational_backoff_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60 * 1000;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut lc = EnsureLifecycle::default();
        assert!(lc.try_become_operational(0));
        assert!(!lc.try_become_operational(4 * MIN));
        assert!(lc.try_become_operational(5 * MIN));

        // next window is 10 minutes
        assert!(!lc.try_become_operational(14 * MIN));
        assert!(lc.try_become_operational(15 * MIN));

        let mut now = 15 * MIN;
        for _ in 0..20 {
            now += BACKOFF_MAX_MS;
            assert!(lc.try_become_operational(now));
        }
        assert_eq!(lc.become_operational_backoff_ms, BACKOFF_MAX_MS);
    }

    #[test]
    fn reset_allows_immediate_attempt() {
        let mut lc = EnsureLifecycle::default();
        assert!(lc.try_become_operational(0));
        assert!(!lc.try_become_operational(1));
        lc.reset_registration_backoff();
        assert!(lc.try_become_operational(2));
    }
}
