//! Fixed-window rate limiting keyed by client IP

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

// Hard bound on tracked windows; eviction runs when an insert would pass it
const MAX_TRACKED_IPS: usize = 10_000;

struct WindowSlot {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    slots: RwLock<HashMap<String, WindowSlot>>,
    window: Duration,
    max_requests: u32,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_window(Duration::from_secs(config.window_secs), config.max_requests)
    }

    pub fn with_window(window: Duration, max_requests: u32) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            window,
            max_requests,
        }
    }

    /// Count a request against the IP's current window.
    /// Returns false once the window's allowance is used up.
    pub fn check(&self, ip: &str) -> bool {
        let mut slots = match self.slots.write() {
            Ok(guard) => guard,
            // A poisoned lock still holds a usable map
            Err(poisoned) => poisoned.into_inner(),
        };

        if slots.len() >= MAX_TRACKED_IPS && !slots.contains_key(ip) {
            let window = self.window;
            slots.retain(|_, slot| slot.started.elapsed() < window);

            // Still full with nothing expired: drop the oldest window
            if slots.len() >= MAX_TRACKED_IPS {
                if let Some(oldest) = slots
                    .iter()
                    .min_by_key(|(_, slot)| slot.started)
                    .map(|(key, _)| key.clone())
                {
                    slots.remove(&oldest);
                }
            }
        }

        match slots.get_mut(ip) {
            Some(slot) if slot.started.elapsed() < self.window => {
                slot.count += 1;
                slot.count <= self.max_requests
            }
            _ => {
                slots.insert(
                    ip.to_string(),
                    WindowSlot {
                        started: Instant::now(),
                        count: 1,
                    },
                );
                true
            }
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        match self.slots.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
