use chrono::{DateTime, Utc};

pub trait ClockPort: Send + Sync {
    fn now_ms(&self) -> i64;

    fn now(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.now_ms()).unwrap_or_default()
    }
}

#[cfg(test)]
mockall::mock! {
    pub Clock {}

    impl ClockPort for Clock {
        fn now_ms(&self) -> i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_derived_from_millis() {
        let mut clock = MockClock::new();
        clock.expect_now_ms().return_const(1_700_000_000_123_i64);
        assert_eq!(clock.now().timestamp_millis(), 1_700_000_000_123);
    }
}
