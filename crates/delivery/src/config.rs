use std::{collections::HashMap, fs, time::Duration as StdDuration};

use chrono::Duration;

/// Tuning knobs of the outbound service.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Age after which a held lease counts as stale and becomes reclaimable.
    pub lease_duration: Duration,
    /// Interval between unsolicited worker passes.
    pub poll_interval: StdDuration,
    /// Maximum number of messages claimed per batch.
    pub claim_batch_size: i64,
    /// Delay before a transiently failed message becomes claimable again.
    pub message_retry_backoff: Duration,
    /// Resync attempts before the request is dropped and surfaced as fatal.
    pub resync_max_attempts: i64,
    /// Base delay of the exponential resync backoff.
    pub resync_backoff_base: Duration,
    /// Generations of joining material retained past supersession.
    pub retained_generations: i64,
    /// Most recent generations of joining material kept live concurrently.
    pub live_generations: i64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::seconds(30),
            poll_interval: StdDuration::from_secs(10),
            claim_batch_size: 32,
            message_retry_backoff: Duration::seconds(30),
            resync_max_attempts: 5,
            resync_backoff_base: Duration::seconds(10),
            retained_generations: 2,
            live_generations: 2,
        }
    }
}

impl DeliveryConfig {
    /// Loads the defaults, applies an optional `delivery.toml` from the
    /// working directory, then environment overrides. Every knob is a plain
    /// seconds/count value, env vars under a `DELIVERY__` prefix.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = fs::read_to_string("delivery.toml") {
            config.apply_file_overrides(&raw);
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env_i64 = |key: &str| -> Option<i64> { lookup(key)?.trim().parse().ok() };

        if let Some(v) = env_i64("DELIVERY__LEASE_SECONDS") {
            self.lease_duration = Duration::seconds(v);
        }
        if let Some(v) = env_i64("DELIVERY__POLL_INTERVAL_SECONDS") {
            self.poll_interval = StdDuration::from_secs(v.max(1) as u64);
        }
        if let Some(v) = env_i64("DELIVERY__CLAIM_BATCH_SIZE") {
            self.claim_batch_size = v;
        }
        if let Some(v) = env_i64("DELIVERY__MESSAGE_RETRY_BACKOFF_SECONDS") {
            self.message_retry_backoff = Duration::seconds(v);
        }
        if let Some(v) = env_i64("DELIVERY__RESYNC_MAX_ATTEMPTS") {
            self.resync_max_attempts = v;
        }
        if let Some(v) = env_i64("DELIVERY__RESYNC_BACKOFF_SECONDS") {
            self.resync_backoff_base = Duration::seconds(v);
        }
        if let Some(v) = env_i64("DELIVERY__RETAINED_GENERATIONS") {
            self.retained_generations = v;
        }
        if let Some(v) = env_i64("DELIVERY__LIVE_GENERATIONS") {
            self.live_generations = v;
        }
    }

    fn apply_file_overrides(&mut self, raw: &str) {
        let Ok(file_cfg) = toml::from_str::<HashMap<String, i64>>(raw) else {
            return;
        };

        if let Some(v) = file_cfg.get("lease_seconds") {
            self.lease_duration = Duration::seconds(*v);
        }
        if let Some(v) = file_cfg.get("poll_interval_seconds") {
            self.poll_interval = StdDuration::from_secs((*v).max(1) as u64);
        }
        if let Some(v) = file_cfg.get("claim_batch_size") {
            self.claim_batch_size = *v;
        }
        if let Some(v) = file_cfg.get("message_retry_backoff_seconds") {
            self.message_retry_backoff = Duration::seconds(*v);
        }
        if let Some(v) = file_cfg.get("resync_max_attempts") {
            self.resync_max_attempts = *v;
        }
        if let Some(v) = file_cfg.get("resync_backoff_seconds") {
            self.resync_backoff_base = Duration::seconds(*v);
        }
        if let Some(v) = file_cfg.get("retained_generations") {
            self.retained_generations = *v;
        }
        if let Some(v) = file_cfg.get("live_generations") {
            self.live_generations = *v;
        }
    }
}
