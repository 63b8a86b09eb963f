use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Token-bucket settings shared by every `(backend, source ip)` key.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitConfig {
	pub enabled: bool,
	/// Burst size: tokens a fresh key may spend immediately.
	pub max_tokens: u64,
	pub tokens_per_fill: u64,
	pub fill_interval_ms: u64,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		RateLimitConfig {
			enabled: true,
			max_tokens: 100,
			tokens_per_fill: 100,
			fill_interval_ms: 1_000,
		}
	}
}

#[derive(Debug, Eq, PartialEq)]
pub enum Passage {
	Granted,
	Denied,
}

struct Bucket {
	available: u64,
	refill_at: Instant,
}

/// Per-backend, per-source-IP admission control. `request_passage` is O(1)
/// and never waits; it runs on the request hot path before auth.
pub struct RateLimiter {
	config: RateLimitConfig,
	buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
	pub fn new(config: RateLimitConfig) -> Self {
		RateLimiter {
			config,
			buckets: Mutex::new(HashMap::new()),
		}
	}

	fn fill_interval(&self) -> Duration {
		Duration::from_millis(self.config.fill_interval_ms.max(1))
	}

	/// Spend one token for the `(backend endpoint, source ip)` pair. The key
	/// is the backend `host:port`, deliberately ignoring the path.
	pub fn request_passage(&self, endpoint: &str, source_ip: IpAddr) -> Passage {
		if !self.config.enabled {
			return Passage::Granted;
		}
		let key = format!("{endpoint}|{source_ip}");
		let now = Instant::now();
		let mut buckets = self.buckets.lock().expect("ratelimit lock poisoned");
		let bucket = buckets.entry(key).or_insert_with(|| Bucket {
			available: self.config.max_tokens,
			refill_at: now + self.fill_interval(),
		});
		if now >= bucket.refill_at {
			let interval = self.fill_interval();
			let elapsed = now.duration_since(bucket.refill_at);
			let intervals = elapsed.as_millis() as u64 / interval.as_millis().max(1) as u64 + 1;
			bucket.available = bucket
				.available
				.saturating_add(intervals.saturating_mul(self.config.tokens_per_fill))
				.min(self.config.max_tokens);
			bucket.refill_at = now + interval;
		}
		if bucket.available == 0 {
			return Passage::Denied;
		}
		bucket.available -= 1;
		Passage::Granted
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ip(last: u8) -> IpAddr {
		IpAddr::from([1, 2, 3, last])
	}

	fn limiter(max_tokens: u64, fill_interval_ms: u64) -> RateLimiter {
		RateLimiter::new(RateLimitConfig {
			enabled: true,
			max_tokens,
			tokens_per_fill: max_tokens,
			fill_interval_ms,
		})
	}

	#[test]
	fn denies_once_tokens_are_spent() {
		let limiter = limiter(2, 60_000);
		assert_eq!(limiter.request_passage("svc:8080", ip(4)), Passage::Granted);
		assert_eq!(limiter.request_passage("svc:8080", ip(4)), Passage::Granted);
		assert_eq!(limiter.request_passage("svc:8080", ip(4)), Passage::Denied);
	}

	#[test]
	fn keys_are_isolated_per_source_and_backend() {
		let limiter = limiter(1, 60_000);
		assert_eq!(limiter.request_passage("svc:8080", ip(4)), Passage::Granted);
		assert_eq!(limiter.request_passage("svc:8080", ip(4)), Passage::Denied);
		assert_eq!(limiter.request_passage("svc:8080", ip(5)), Passage::Granted);
		assert_eq!(limiter.request_passage("other:9090", ip(4)), Passage::Granted);
	}

	#[test]
	fn refills_after_the_interval() {
		let limiter = limiter(1, 10);
		assert_eq!(limiter.request_passage("svc:8080", ip(4)), Passage::Granted);
		assert_eq!(limiter.request_passage("svc:8080", ip(4)), Passage::Denied);
		std::thread::sleep(Duration::from_millis(25));
		assert_eq!(limiter.request_passage("svc:8080", ip(4)), Passage::Granted);
	}

	#[test]
	fn disabled_limiter_always_grants() {
		let limiter = RateLimiter::new(RateLimitConfig {
			enabled: false,
			max_tokens: 0,
			..Default::default()
		});
		assert_eq!(limiter.request_passage("svc:8080", ip(4)), Passage::Granted);
	}
}
