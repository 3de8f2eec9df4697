/// Errors reported by [`ReplicationConfig::validate`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("tick_rate must be at least 1 Hz")]
    ZeroTickRate,
    #[error("worker_threads must be at least 1")]
    ZeroWorkers,
    #[error("max_pending_updates must be at least 1")]
    ZeroPendingCap,
    #[error("metrics_port cannot be 0")]
    ZeroMetricsPort,
}

/// Replication engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationConfig {
    /// Ticks per second driven by the host loop
    pub tick_rate: u32,
    /// Size of the fixed worker pool running each stage
    pub worker_threads: usize,
    /// Observers see their own host entity
    pub self_visibility: bool,
    /// Send a message every tick even when there is nothing to say
    pub heartbeat: bool,
    /// Distinct pending updates per observer per tick before a full resync
    pub max_pending_updates: usize,
    /// Outbound queue per observer (0 = unbounded, N = drop when full)
    pub sink_capacity: usize,
    /// Port for the metrics HTTP endpoint
    pub metrics_port: u16,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            self_visibility: false,
            heartbeat: false,
            max_pending_updates: 4096,
            sink_capacity: 0,
            metrics_port: 9090,
        }
    }
}

impl ReplicationConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(rate) = env_parsed::<u32>("TICK_RATE") {
            if (1..=1000).contains(&rate) {
                config.tick_rate = rate;
            } else {
                tracing::warn!("TICK_RATE must be 1-1000, using default");
            }
        }

        if let Some(workers) = env_parsed::<usize>("WORKER_THREADS") {
            if workers > 0 {
                config.worker_threads = workers;
            } else {
                tracing::warn!("WORKER_THREADS must be > 0, using default");
            }
        }

        if let Some(enabled) = env_flag("SELF_VISIBILITY") {
            config.self_visibility = enabled;
        }

        if let Some(enabled) = env_flag("HEARTBEAT") {
            config.heartbeat = enabled;
        }

        if let Some(cap) = env_parsed::<usize>("MAX_PENDING_UPDATES") {
            if cap > 0 {
                config.max_pending_updates = cap;
            } else {
                tracing::warn!("MAX_PENDING_UPDATES must be > 0, using default");
            }
        }

        if let Some(capacity) = env_parsed::<usize>("SINK_CAPACITY") {
            config.sink_capacity = capacity;
        }

        if let Some(port) = env_parsed::<u16>("METRICS_PORT") {
            if port > 0 {
                config.metrics_port = port;
            } else {
                tracing::warn!("METRICS_PORT must be > 0, using default");
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.max_pending_updates == 0 {
            return Err(ConfigError::ZeroPendingCap);
        }
        if self.metrics_port == 0 {
            return Err(ConfigError::ZeroMetricsPort);
        }
        Ok(())
    }

    /// Wall-clock length of one tick
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(1_000_000_000 / u64::from(self.tick_rate.max(1)))
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", key, raw);
            None
        }
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let raw = std::env::var(key).ok()?;
    let parsed = parse_flag(&raw);
    if parsed.is_none() {
        tracing::warn!("Invalid {} '{}', expected true/false, using default", key, raw);
    }
    parsed
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
