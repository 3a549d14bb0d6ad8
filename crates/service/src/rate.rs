//! Admission control for unauthenticated messages.
//!
//! HELLO and PRESENTATION are the only messages a stranger can make the
//! node process, so each class gets its own per-source token bucket, and a
//! configurable list of forbidden prefixes short-circuits everything before
//! any crypto work.

use std::net::IpAddr;

use ahash::{HashMap, HashMapExt};

use crate::net::IpNetwork;

/// How long an idle bucket survives before its entry is reclaimed.
const RECLAIM_AFTER_SECS: u64 = 300;

struct Bucket {
    tokens: u32,
    last_activity: u64,
}

/// A per-source token bucket set refilled once per second.
struct Limiter {
    rate: u32,
    buckets: HashMap<IpAddr, Bucket>,
    last_refill: u64,
}

impl Limiter {
    fn new(rate: u32) -> Self {
        Self {
            rate,
            buckets: HashMap::with_capacity(64),
            last_refill: 0,
        }
    }

    fn allow(&mut self, source: IpAddr, now: u64) -> bool {
        if now > self.last_refill {
            let elapsed = (now - self.last_refill).min(u64::from(u32::MAX)) as u32;
            for bucket in self.buckets.values_mut() {
                bucket.tokens = bucket
                    .tokens
                    .saturating_add(self.rate.saturating_mul(elapsed))
                    .min(self.rate);
            }

            self.last_refill = now;
        }

        let bucket = self.buckets.entry(source).or_insert(Bucket {
            tokens: self.rate,
            last_activity: now,
        });
        bucket.last_activity = now;

        if bucket.tokens == 0 {
            return false;
        }

        bucket.tokens -= 1;
        true
    }

    fn reclaim(&mut self, now: u64) {
        self.buckets
            .retain(|_, bucket| now.saturating_sub(bucket.last_activity) < RECLAIM_AFTER_SECS);
    }
}

pub struct AdmissionOptions {
    /// Token refill rate for each unauthenticated message class.
    pub max_unauthenticated_messages_per_second: u32,
    /// Prefixes whose HELLO and PRESENTATION are rejected outright.
    pub never_contact: Vec<IpNetwork>,
}

impl Default for AdmissionOptions {
    fn default() -> Self {
        Self {
            max_unauthenticated_messages_per_second: 50,
            never_contact: Vec::new(),
        }
    }
}

pub struct AdmissionControl {
    hello: Limiter,
    presentation: Limiter,
    never_contact: Vec<IpNetwork>,
}

impl AdmissionControl {
    pub fn new(options: AdmissionOptions) -> Self {
        Self {
            hello: Limiter::new(options.max_unauthenticated_messages_per_second),
            presentation: Limiter::new(options.max_unauthenticated_messages_per_second),
            never_contact: options.never_contact,
        }
    }

    /// Whether the source is on the forbidden list. Checked for inbound
    /// greetings and before acting on learned contacts.
    pub fn is_never_contact(&self, address: IpAddr) -> bool {
        self.never_contact.iter().any(|it| it.contains(address))
    }

    pub fn allow_hello(&mut self, source: IpAddr, now: u64) -> bool {
        !self.is_never_contact(source) && self.hello.allow(source, now)
    }

    pub fn allow_presentation(&mut self, source: IpAddr, now: u64) -> bool {
        !self.is_never_contact(source) && self.presentation.allow(source, now)
    }

    /// Drop bucket state for sources idle longer than the reclaim window.
    pub fn reclaim(&mut self, now: u64) {
        self.hello.reclaim(now);
        self.presentation.reclaim(now);
    }
}
