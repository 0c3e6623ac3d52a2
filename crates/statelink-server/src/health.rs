//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered connections, including ones awaiting recovery.
    pub connections: usize,
    /// Connections currently awaiting recovery.
    pub recovering: usize,
    /// Current global state version.
    pub state_version: u64,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    recovering: usize,
    state_version: u64,
) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        recovering,
        state_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, 0, 0);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        assert!(health_check(start, 0, 0, 0).uptime_secs >= 59);
    }

    #[test]
    fn serializes_counters() {
        let json = serde_json::to_value(health_check(Instant::now(), 3, 1, 42)).unwrap();
        assert_eq!(json["connections"], 3);
        assert_eq!(json["recovering"], 1);
        assert_eq!(json["state_version"], 42);
    }
}
