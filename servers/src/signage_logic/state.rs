use lib_signage::{ConnectionRegistry, ScheduleEngine};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::signage_logic::config::Settings;

/// Keep-alive policy applied to every monitor socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub register_timeout: Duration,
}

impl From<&Settings> for Liveness {
    fn from(settings: &Settings) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval,
            idle_timeout: settings.idle_timeout,
            register_timeout: settings.register_timeout,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ScheduleEngine>,
    pub registry: Arc<ConnectionRegistry>,
    pub liveness: Liveness,
    started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<ScheduleEngine>, registry: Arc<ConnectionRegistry>, liveness: Liveness) -> Self {
        Self {
            engine,
            registry,
            liveness,
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
