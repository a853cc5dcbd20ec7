//! Server status polling while disconnected.
//!
//! Polls fast until the first successful answer, slowly after that, and
//! never while a session is joining or live.

use crate::connection::ConnectionState;
use crate::error::StatusError;
use crate::types::SyncConfig;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerHealth {
    Online,
    Busy,
    #[default]
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerStatus {
    pub health: ServerHealth,
    pub version: String,
    /// Feature flags advertised by the server.
    pub flags: Vec<String>,
}

pub trait StatusSource {
    fn fetch_status(&mut self) -> impl Future<Output = Result<ServerStatus, StatusError>> + Send;
}

#[derive(Debug)]
pub struct StatusPoller {
    fast: Duration,
    slow: Duration,
    next_poll: Option<Instant>,
    last: Option<ServerStatus>,
    had_success: bool,
}

impl StatusPoller {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            fast: config.status_poll_fast(),
            slow: config.status_poll_slow(),
            next_poll: None,
            last: None,
            had_success: false,
        }
    }

    pub fn interval(&self) -> Duration {
        if self.had_success {
            self.slow
        } else {
            self.fast
        }
    }

    pub fn last_status(&self) -> Option<&ServerStatus> {
        self.last.as_ref()
    }

    pub fn is_due(&self, state: ConnectionState, now: Instant) -> bool {
        !state.is_active() && self.next_poll.map_or(true, |t| now >= t)
    }

    /// Poll if due. Returns the fresh status, or `None` when suppressed,
    /// not yet due, or failed.
    pub async fn poll<S: StatusSource>(
        &mut self,
        source: &mut S,
        state: ConnectionState,
        now: Instant,
    ) -> Option<&ServerStatus> {
        if !self.is_due(state, now) {
            return None;
        }
        let result = source.fetch_status().await;
        match result {
            Ok(status) => {
                debug!("Server status {:?} version {}", status.health, status.version);
                self.had_success = true;
                self.next_poll = Some(now + self.slow);
                self.last = Some(status);
                self.last.as_ref()
            }
            Err(e) => {
                warn!("Status poll failed: {}", e);
                self.next_poll = Some(now + self.interval());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::block_on;

    struct Flaky {
        fail: bool,
        calls: u32,
    }

    impl StatusSource for Flaky {
        async fn fetch_status(&mut self) -> Result<ServerStatus, StatusError> {
            self.calls += 1;
            if self.fail {
                Err(StatusError::Unavailable("down".into()))
            } else {
                Ok(ServerStatus {
                    health: ServerHealth::Online,
                    version: "0.9".into(),
                    flags: vec!["events".into()],
                })
            }
        }
    }

    #[test]
    fn fast_until_first_success_then_slow() {
        let t0 = Instant::now();
        let cfg = SyncConfig::default();
        let mut poller = StatusPoller::new(&cfg);
        let mut src = Flaky { fail: true, calls: 0 };

        assert!(block_on(poller.poll(&mut src, ConnectionState::Disconnected, t0)).is_none());
        assert_eq!(poller.interval(), cfg.status_poll_fast());
        assert!(!poller.is_due(ConnectionState::Disconnected, t0 + Duration::from_secs(1)));

        src.fail = false;
        let t1 = t0 + cfg.status_poll_fast();
        let status = block_on(poller.poll(&mut src, ConnectionState::Disconnected, t1)).cloned();
        assert_eq!(status.map(|s| s.health), Some(ServerHealth::Online));
        assert_eq!(poller.interval(), cfg.status_poll_slow());
        assert!(!poller.is_due(ConnectionState::Disconnected, t1 + cfg.status_poll_fast()));
        assert_eq!(src.calls, 2);
    }

    #[test]
    fn suppressed_while_session_active() {
        let t0 = Instant::now();
        let mut poller = StatusPoller::new(&SyncConfig::default());
        let mut src = Flaky { fail: false, calls: 0 };
        for state in [ConnectionState::Joining, ConnectionState::Playing] {
            assert!(block_on(poller.poll(&mut src, state, t0)).is_none());
        }
        assert_eq!(src.calls, 0);
    }

    #[test]
    fn status_json_tolerates_missing_fields() {
        let s: ServerStatus = serde_json::from_str(r#"{"health":"busy"}"#).unwrap();
        assert_eq!(s.health, ServerHealth::Busy);
        assert!(s.flags.is_empty());
    }
}
