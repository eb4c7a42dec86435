use ahash::{AHashMap, AHashSet};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::collections::VecDeque;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

const HOUR_WINDOW: Duration = Duration::from_secs(3600);

/// Decision for one unauthenticated request from an IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVerdict {
    Allowed,
    /// Per-minute quota exceeded; the caller backs off and may return.
    Throttled,
    /// Permanently banned. `newly` marks the request that crossed the hourly
    /// limit, so the caller can persist the ban exactly once.
    Banned { newly: bool },
}

/// Sliding-window IP filter for unauthenticated callers.
///
/// The per-minute quota is a keyed governor limiter; the hourly ban rule keeps
/// an explicit window because crossing it must produce a durable ban, not a
/// temporary denial. The banned set is the only state shared with the store:
/// hydrated from it at startup, appended to on new bans.
pub struct IpFilter {
    minute: DefaultKeyedRateLimiter<IpAddr>,
    hour_windows: Mutex<AHashMap<IpAddr, VecDeque<Instant>>>,
    banned: RwLock<AHashSet<IpAddr>>,
    ban_limit: usize,
}

impl IpFilter {
    pub fn new(per_minute: u32, ban_limit: usize) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN));
        Self {
            minute: RateLimiter::keyed(quota),
            hour_windows: Mutex::new(AHashMap::new()),
            banned: RwLock::new(AHashSet::new()),
            ban_limit,
        }
    }

    /// Seed the in-memory banned set, typically from persisted bans at startup.
    pub fn hydrate_bans<I: IntoIterator<Item = IpAddr>>(&self, ips: I) {
        let mut banned = self.banned.write().expect("banned set poisoned");
        banned.extend(ips);
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.read().expect("banned set poisoned").contains(&ip)
    }

    /// Register one request from `ip` and decide whether it may pass.
    pub fn check(&self, ip: IpAddr) -> IpVerdict {
        if self.is_banned(ip) {
            return IpVerdict::Banned { newly: false };
        }

        let hour_count = {
            let mut windows = self.hour_windows.lock().expect("hour windows poisoned");
            let window = windows.entry(ip).or_default();
            let now = Instant::now();
            while window
                .front()
                .is_some_and(|t| now.duration_since(*t) >= HOUR_WINDOW)
            {
                window.pop_front();
            }
            window.push_back(now);
            window.len()
        };

        if hour_count > self.ban_limit {
            let mut banned = self.banned.write().expect("banned set poisoned");
            banned.insert(ip);
            self.hour_windows
                .lock()
                .expect("hour windows poisoned")
                .remove(&ip);
            return IpVerdict::Banned { newly: true };
        }

        if self.minute.check_key(&ip).is_err() {
            return IpVerdict::Throttled;
        }

        IpVerdict::Allowed
    }
}
