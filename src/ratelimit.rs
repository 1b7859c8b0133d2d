use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed-window request counter, keyed by caller. A window opens on the first
/// hit and admits `capacity` requests until it ages out. Device endpoints key
/// by MAC; the global download limiter uses a single key.
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    hits: Mutex<HashMap<String, Window>>,
}

struct Window {
    started: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn per_minute(capacity: u32) -> Self {
        RateLimiter::new(capacity, Duration::from_secs(60))
    }

    pub fn new(capacity: u32, window: Duration) -> Self {
        RateLimiter {
            capacity,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records a hit for `key` and reports whether it is admitted.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().expect("rate limiter lock poisoned");

        // Opportunistic prune keeps the map bounded by active callers.
        if hits.len() > 4096 {
            let window = self.window;
            hits.retain(|_, w| now.duration_since(w.started) < window);
        }

        let entry = hits.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }
        entry.count += 1;
        entry.count <= self.capacity
    }
}

/// The device-facing limiters of the OTA protocol.
pub struct DeviceRateLimits {
    /// `check` requests, per MAC.
    pub check: RateLimiter,
    /// Firmware downloads, fleet-wide.
    pub download: RateLimiter,
}

impl DeviceRateLimits {
    pub fn new(check_per_minute: u32, download_per_minute: u32) -> Self {
        DeviceRateLimits {
            check: RateLimiter::per_minute(check_per_minute),
            download: RateLimiter::per_minute(download_per_minute),
        }
    }

    pub fn allow_download(&self) -> bool {
        self.download.allow("global")
    }
}
