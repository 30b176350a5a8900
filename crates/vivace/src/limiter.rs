use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

struct TokenBucket {
    tokens: u32,
    last_refill: Instant,
}

struct IpEntry {
    connection_count: u32,
    bucket: TokenBucket,
}

/// Per-IP admission control: a live-connection cap plus a token-bucket
/// request limiter, both keyed on the normalized peer address (v4-mapped v6
/// collapses to v4 so one host cannot double its budget).
pub struct IpLimiter {
    entries: HashMap<IpAddr, IpEntry>,
    max_connections_per_ip: u32,
    burst: u32,
    refill_per_sec: u32,
}

impl IpLimiter {
    pub fn new(max_connections_per_ip: u32, burst: u32, refill_per_sec: u32) -> Self {
        Self {
            entries: HashMap::with_capacity(512),
            max_connections_per_ip,
            burst,
            refill_per_sec,
        }
    }

    fn normalize(ip: IpAddr) -> IpAddr {
        match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => ip,
            },
            v4 => v4,
        }
    }

    /// Admit a new connection, initializing the token bucket to the full
    /// burst on the address's first connection.
    pub fn allow_connection(&mut self, ip: IpAddr) -> bool {
        let burst = self.burst;
        let entry = self
            .entries
            .entry(Self::normalize(ip))
            .or_insert_with(|| IpEntry {
                connection_count: 0,
                bucket: TokenBucket {
                    tokens: 0,
                    last_refill: Instant::now(),
                },
            });

        if entry.connection_count >= self.max_connections_per_ip {
            return false;
        }

        if entry.connection_count == 0 && entry.bucket.tokens == 0 {
            entry.bucket.tokens = burst;
            entry.bucket.last_refill = Instant::now();
        }

        entry.connection_count += 1;
        true
    }

    /// Consume one request token, refilling `elapsed_ms * rate / 1000` first
    /// (capped at the burst size).
    pub fn allow_request(&mut self, ip: IpAddr) -> bool {
        self.allow_request_at(ip, Instant::now())
    }

    fn allow_request_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        let Some(entry) = self.entries.get_mut(&Self::normalize(ip)) else {
            return false;
        };

        let bucket = &mut entry.bucket;
        let elapsed_ms = now.duration_since(bucket.last_refill).as_millis() as u64;
        let refill = elapsed_ms * self.refill_per_sec as u64 / 1000;

        if refill > 0 {
            bucket.tokens = self.burst.min(bucket.tokens.saturating_add(refill as u32));
            bucket.last_refill = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Drop one connection, erasing the entry when the count reaches zero.
    pub fn release_connection(&mut self, ip: IpAddr) {
        let key = Self::normalize(ip);
        let erase = match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.connection_count = entry.connection_count.saturating_sub(1);
                entry.connection_count == 0
            }
            None => false,
        };
        if erase {
            self.entries.remove(&key);
        }
    }

    pub fn tracked_ips(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::time::Duration;

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    #[test]
    fn connection_cap() {
        let mut lim = IpLimiter::new(2, 10, 5);
        assert!(lim.allow_connection(ip()));
        assert!(lim.allow_connection(ip()));
        assert!(!lim.allow_connection(ip()));

        lim.release_connection(ip());
        assert!(lim.allow_connection(ip()));
    }

    #[test]
    fn entry_erased_on_last_release() {
        let mut lim = IpLimiter::new(4, 10, 5);
        assert!(lim.allow_connection(ip()));
        assert_eq!(lim.tracked_ips(), 1);
        lim.release_connection(ip());
        assert_eq!(lim.tracked_ips(), 0);
    }

    #[test]
    fn burst_then_starve() {
        let mut lim = IpLimiter::new(4, 2, 1);
        assert!(lim.allow_connection(ip()));

        assert!(lim.allow_request(ip()));
        assert!(lim.allow_request(ip()));
        assert!(!lim.allow_request(ip()), "third request within the burst window is refused");
    }

    #[test]
    fn refills_at_the_configured_rate() {
        let mut lim = IpLimiter::new(4, 2, 4); // 4 tokens per second
        assert!(lim.allow_connection(ip()));
        let start = Instant::now();
        assert!(lim.allow_request_at(ip(), start));
        assert!(lim.allow_request_at(ip(), start));
        assert!(!lim.allow_request_at(ip(), start));

        // 500 ms later: 2 tokens refilled
        let later = start + Duration::from_millis(500);
        assert!(lim.allow_request_at(ip(), later));
        assert!(lim.allow_request_at(ip(), later));
        assert!(!lim.allow_request_at(ip(), later));
    }

    #[test]
    fn refill_caps_at_burst() {
        let mut lim = IpLimiter::new(4, 3, 10);
        assert!(lim.allow_connection(ip()));
        let start = Instant::now();
        // A long quiet period must not accumulate more than the burst
        let later = start + Duration::from_secs(60);
        for _ in 0..3 {
            assert!(lim.allow_request_at(ip(), later));
        }
        assert!(!lim.allow_request_at(ip(), later));
    }

    #[test]
    fn mapped_v6_shares_the_v4_budget() {
        let mut lim = IpLimiter::new(1, 10, 5);
        let v4 = ip();
        let mapped = IpAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0xcb00, 0x7107));
        assert!(lim.allow_connection(v4));
        assert!(!lim.allow_connection(mapped));
    }

    #[test]
    fn unknown_ip_has_no_tokens() {
        let mut lim = IpLimiter::new(4, 10, 5);
        assert!(!lim.allow_request(ip()));
    }
}
