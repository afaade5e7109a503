use std::time::Duration;

/// Exponential backoff with an optional cap. Doubles on every `next()` call;
/// `reset` restarts it after a successful operation.
pub struct Backoff {
    initial: Duration,
    current: Duration,
    cap: Option<Duration>,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Option<Duration>) -> Self {
        Self {
            initial,
            current: initial,
            cap,
        }
    }

    /// 1s doubling, capped at 30s — the shape both capture variants and the
    /// buffer's KV retries use per spec's error-handling taxonomy.
    pub fn capped_30s() -> Self {
        Self::new(Duration::from_secs(1), Some(Duration::from_secs(30)))
    }

    /// 1s doubling, uncapped — PostgreSQL capture's connection-retry policy.
    pub fn uncapped() -> Self {
        Self::new(Duration::from_secs(1), None)
    }

    /// Returns the delay to wait before the next attempt, then advances.
    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        let doubled = self.current * 2;
        self.current = match self.cap {
            Some(cap) if doubled > cap => cap,
            _ => doubled,
        };
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_secs(1), Some(Duration::from_secs(5)));
        assert_eq!(b.next(), Duration::from_secs(1));
        assert_eq!(b.next(), Duration::from_secs(2));
        assert_eq!(b.next(), Duration::from_secs(4));
        assert_eq!(b.next(), Duration::from_secs(5));
        assert_eq!(b.next(), Duration::from_secs(5));
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut b = Backoff::new(Duration::from_secs(1), None);
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(1));
    }
}
