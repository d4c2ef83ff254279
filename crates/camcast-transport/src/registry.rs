//! Subscriber registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Subscriber address to last-seen time.
///
/// Iteration order is unspecified.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscribers: HashMap<SocketAddr, Instant>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh `addr`. Returns `true` if it was not subscribed.
    pub fn touch(&mut self, addr: SocketAddr, now: Instant) -> bool {
        self.subscribers.insert(addr, now).is_none()
    }

    /// Refresh `addr` if subscribed. Returns whether it was.
    pub fn refresh(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.subscribers.get_mut(&addr) {
            Some(last_seen) => {
                *last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Remove every subscriber not seen within `timeout` of `now`.
    pub fn evict_stale(&mut self, now: Instant, timeout: Duration) -> Vec<SocketAddr> {
        let mut evicted = Vec::new();
        self.subscribers.retain(|addr, last_seen| {
            let fresh = now.saturating_duration_since(*last_seen) < timeout;
            if !fresh {
                evicted.push(*addr);
            }
            fresh
        });
        evicted
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.subscribers.contains_key(addr)
    }

    pub fn last_seen(&self, addr: &SocketAddr) -> Option<Instant> {
        self.subscribers.get(addr).copied()
    }

    pub fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.subscribers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_touch_then_evict_within_timeout_keeps() {
        let mut registry = SubscriptionRegistry::new();
        let start = Instant::now();
        let a = addr("1.2.3.4:5000");

        assert!(registry.touch(a, start));
        let evicted = registry.evict_stale(start + Duration::from_secs(29), Duration::from_secs(30));

        assert!(evicted.is_empty());
        assert!(registry.contains(&a));
    }

    #[test]
    fn test_evict_at_timeout_removes() {
        let mut registry = SubscriptionRegistry::new();
        let start = Instant::now();
        let a = addr("1.2.3.4:5000");

        registry.touch(a, start);
        let evicted = registry.evict_stale(start + Duration::from_secs(30), Duration::from_secs(30));

        assert_eq!(evicted, vec![a]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_touch_existing_refreshes() {
        let mut registry = SubscriptionRegistry::new();
        let start = Instant::now();
        let a = addr("1.2.3.4:5000");

        registry.touch(a, start);
        assert!(!registry.touch(a, start + Duration::from_secs(20)));
        assert_eq!(registry.len(), 1);

        let evicted = registry.evict_stale(start + Duration::from_secs(40), Duration::from_secs(30));
        assert!(evicted.is_empty());
    }

    #[test]
    fn test_refresh_does_not_insert() {
        let mut registry = SubscriptionRegistry::new();
        let now = Instant::now();
        let a = addr("9.9.9.9:6000");

        assert!(!registry.refresh(a, now));
        assert!(registry.is_empty());

        registry.touch(a, now);
        let later = now + Duration::from_secs(5);
        assert!(registry.refresh(a, later));
        assert_eq!(registry.last_seen(&a), Some(later));
    }

    #[test]
    fn test_partial_eviction() {
        let mut registry = SubscriptionRegistry::new();
        let start = Instant::now();
        let a = addr("1.2.3.4:5000");
        let b = addr("9.9.9.9:6000");

        registry.touch(a, start);
        registry.touch(b, start + Duration::from_secs(20));

        let evicted = registry.evict_stale(start + Duration::from_secs(35), Duration::from_secs(30));
        assert_eq!(evicted, vec![a]);

        let remaining: Vec<_> = registry.addrs().collect();
        assert_eq!(remaining, vec![b]);
    }

    #[test]
    fn test_touch_time_after_now_is_not_stale() {
        let mut registry = SubscriptionRegistry::new();
        let now = Instant::now();
        let a = addr("1.2.3.4:5000");

        registry.touch(a, now + Duration::from_secs(1));
        assert!(registry.evict_stale(now, Duration::from_millis(1)).is_empty());
    }
}
