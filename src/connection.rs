//! Connection lifecycle manager.
//!
//! ```text
//! Disconnected ──join()──▶ Joining ──transport_opened()──▶ Connected
//!                                                            │
//!                         queue(n > 0) ──▶ QueuedWaiting ◀───┤
//!                                             │              │
//!                         handshake_complete()▼              ▼
//!                                          Playing ◀── queue(0)
//!
//! any state ──leave()──▶ Disconnected
//! ```
//!
//! A transport drop does not leave immediately: [`ConnectionManager::disconnected`]
//! starts a grace timer and only a timer that expires while the session is
//! still not safely left produces `leave(Timeout)`.

use crate::error::JoinError;
use crate::events::ConnectionEvent;
use crate::protocol::LeaveReason;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::types::{EntityId, SyncConfig};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Joining,
    Connected,
    Playing,
    QueuedWaiting,
}

impl ConnectionState {
    /// Joined or joining: status polling is suppressed.
    pub fn is_active(self) -> bool {
        self != ConnectionState::Disconnected
    }
}

/// Answer of the account API to a join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResponse {
    Admitted { token: String },
    /// No token. `alert` is a blocking account message, if any.
    Denied { alert: Option<String> },
    /// Account-creation limit hit; retrying later may succeed.
    CreationLimited,
}

/// HTTP account/session API that hands out join tokens.
pub trait AccountApi {
    fn request_join(
        &mut self,
        character_id: &str,
    ) -> impl Future<Output = Result<JoinResponse, JoinError>> + Send;
}

/// Resolves with the local player's id once the server sent `myEntity`.
/// Rejects with [`JoinError::Cancelled`] if the join is abandoned first.
#[derive(Debug)]
pub struct JoinHandshake {
    rx: oneshot::Receiver<EntityId>,
}

impl Future for JoinHandshake {
    type Output = Result<EntityId, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| JoinError::Cancelled))
    }
}

/// Token plus handshake future, returned by a successful `join`.
#[derive(Debug)]
pub struct JoinTicket {
    pub token: String,
    pub attempts: u32,
    pub handshake: JoinHandshake,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnTimer {
    DisconnectGrace,
}

#[derive(Debug)]
pub struct ConnectionManager {
    config: SyncConfig,
    transport_supported: bool,
    state: ConnectionState,
    queue_position: u32,
    safely_left: bool,
    transport_up: bool,
    last_packet: Option<Instant>,
    timers: Scheduler<ConnTimer>,
    grace_timer: Option<TimerHandle>,
    handshake: Option<oneshot::Sender<EntityId>>,
    events: VecDeque<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            transport_supported: true,
            state: ConnectionState::Disconnected,
            queue_position: 0,
            safely_left: true,
            transport_up: false,
            last_packet: None,
            timers: Scheduler::new(),
            grace_timer: None,
            handshake: None,
            events: VecDeque::new(),
        }
    }

    /// Mark the environment's transport as unavailable; joins then fail fast.
    pub fn with_transport_support(mut self, supported: bool) -> Self {
        self.transport_supported = supported;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn queue_position(&self) -> u32 {
        self.queue_position
    }

    pub fn is_safely_left(&self) -> bool {
        self.safely_left
    }

    pub fn is_transport_up(&self) -> bool {
        self.transport_up
    }

    pub fn drain_events(&mut self) -> Vec<ConnectionEvent> {
        self.events.drain(..).collect()
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    // -----------------------------------------------------------------------
    // Join
    // -----------------------------------------------------------------------

    /// Ask the account API for a join token.
    ///
    /// Creation-limit answers are retried after the configured delay, up to
    /// the configured attempt count. Every other failure is returned as is.
    pub async fn join<A: AccountApi>(
        &mut self,
        api: &mut A,
        character_id: &str,
    ) -> Result<JoinTicket, JoinError> {
        match self.state {
            ConnectionState::Joining => return Err(JoinError::AlreadyJoining),
            ConnectionState::Disconnected => {}
            _ => return Err(JoinError::AlreadyPlaying),
        }
        if !self.transport_supported {
            return Err(JoinError::UnsupportedTransport);
        }

        self.set_state(ConnectionState::Joining);
        self.events.push_back(ConnectionEvent::Joining);

        let attempts = self.config.account_retry_attempts.max(1);
        let mut attempt = 0;
        let token = loop {
            attempt += 1;
            match api.request_join(character_id).await {
                Ok(JoinResponse::Admitted { token }) => break token,
                Ok(JoinResponse::Denied { alert }) => {
                    self.abort_join();
                    return Err(JoinError::Denied { alert });
                }
                Ok(JoinResponse::CreationLimited) if attempt < attempts => {
                    warn!(
                        "Account creation limit (attempt {}/{}), retrying",
                        attempt, attempts
                    );
                    tokio::time::sleep(self.config.account_retry_delay()).await;
                }
                Ok(JoinResponse::CreationLimited) => {
                    self.abort_join();
                    return Err(JoinError::AccountCreationLimit { attempts: attempt });
                }
                Err(e) => {
                    self.abort_join();
                    return Err(e);
                }
            }
        };

        let (tx, rx) = oneshot::channel();
        self.handshake = Some(tx);
        self.safely_left = false;
        info!("Join admitted after {} attempt(s)", attempt);
        Ok(JoinTicket {
            token,
            attempts: attempt,
            handshake: JoinHandshake { rx },
        })
    }

    fn abort_join(&mut self) {
        self.set_state(ConnectionState::Disconnected);
    }

    // -----------------------------------------------------------------------
    // Session events
    // -----------------------------------------------------------------------

    /// The transport is up (first connect or reconnect within grace).
    pub fn transport_opened(&mut self, now: Instant) {
        if let Some(handle) = self.grace_timer.take() {
            self.timers.cancel(handle);
            info!("Transport restored within grace period");
        }
        self.transport_up = true;
        self.safely_left = false;
        self.last_packet = Some(now);
        self.set_state(ConnectionState::Connected);
        self.events.push_back(ConnectionEvent::Connected);
    }

    /// Place in line; 0 means admitted.
    pub fn queue(&mut self, position: u32) {
        self.queue_position = position;
        if position == 0 {
            self.set_state(ConnectionState::Playing);
        } else {
            self.set_state(ConnectionState::QueuedWaiting);
        }
        self.events.push_back(ConnectionEvent::Queued { position });
    }

    /// The server sent the local player's entity: the session is live.
    pub fn handshake_complete(&mut self, player_id: EntityId) {
        self.queue_position = 0;
        self.set_state(ConnectionState::Playing);
        if let Some(tx) = self.handshake.take() {
            let _ = tx.send(player_id);
        }
        self.events.push_back(ConnectionEvent::Playing);
    }

    pub fn packet_received(&mut self, now: Instant) {
        self.last_packet = Some(now);
    }

    /// No packet within the staleness window while a session is up.
    pub fn is_stale(&self, now: Instant) -> bool {
        if !self.transport_up {
            return false;
        }
        self.last_packet
            .is_some_and(|t| now.saturating_duration_since(t) >= self.config.stale_after())
    }

    /// Transport dropped. Starts the grace timer unless already left.
    pub fn disconnected(&mut self, now: Instant) {
        self.transport_up = false;
        if self.safely_left || self.state == ConnectionState::Disconnected {
            debug!("Transport closed after leave");
            return;
        }
        if self.grace_timer.is_none() {
            let handle =
                self.timers
                    .schedule_after(now, self.config.disconnect_grace(), ConnTimer::DisconnectGrace);
            self.grace_timer = Some(handle);
            info!(
                "Transport lost, waiting {:?} before leaving",
                self.config.disconnect_grace()
            );
            self.events.push_back(ConnectionEvent::Interrupted);
        }
    }

    /// End the session. Safe to call any number of times, in any state;
    /// every call resets local state and emits `Left`.
    pub fn leave(&mut self, reason: LeaveReason) {
        if self.state != ConnectionState::Disconnected {
            info!("Leaving session: {}", reason);
        }
        self.timers.clear();
        self.grace_timer = None;
        // Dropping the sender rejects an unfinished handshake.
        self.handshake = None;
        self.safely_left = true;
        self.transport_up = false;
        self.queue_position = 0;
        self.last_packet = None;
        self.set_state(ConnectionState::Disconnected);
        self.events.push_back(ConnectionEvent::Left { reason });
    }

    /// Fire the grace timer if due. Returns the reason if this left the session.
    pub fn tick(&mut self, now: Instant) -> Option<LeaveReason> {
        let mut left = None;
        for (handle, timer) in self.timers.drain_due(now) {
            match timer {
                ConnTimer::DisconnectGrace => {
                    if self.grace_timer == Some(handle) {
                        self.grace_timer = None;
                    }
                    if !self.safely_left {
                        self.leave(LeaveReason::Timeout);
                        left = Some(LeaveReason::Timeout);
                    }
                }
            }
        }
        left
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Admit;

    impl AccountApi for Admit {
        async fn request_join(&mut self, _character_id: &str) -> Result<JoinResponse, JoinError> {
            Ok(JoinResponse::Admitted {
                token: "tok".into(),
            })
        }
    }

    #[test]
    fn queue_zero_means_playing() {
        let mut c = ConnectionManager::new(SyncConfig::default());
        c.queue(3);
        assert_eq!(c.state(), ConnectionState::QueuedWaiting);
        assert_eq!(c.queue_position(), 3);
        c.queue(0);
        assert_eq!(c.state(), ConnectionState::Playing);
    }

    #[test]
    fn leave_is_idempotent_and_always_notifies() {
        let mut c = ConnectionManager::new(SyncConfig::default());
        c.leave(LeaveReason::Requested);
        c.leave(LeaveReason::Requested);
        let lefts = c
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, ConnectionEvent::Left { .. }))
            .count();
        assert_eq!(lefts, 2);
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stale_after_quiet_window() {
        let t0 = Instant::now();
        let mut c = ConnectionManager::new(SyncConfig::default());
        c.transport_opened(t0);
        assert!(!c.is_stale(t0 + Duration::from_secs(14)));
        assert!(c.is_stale(t0 + Duration::from_secs(15)));
        c.packet_received(t0 + Duration::from_secs(15));
        assert!(!c.is_stale(t0 + Duration::from_secs(16)));
    }

    #[tokio::test]
    async fn join_while_joining_is_rejected() {
        let mut c = ConnectionManager::new(SyncConfig::default());
        let _ticket = c.join(&mut Admit, "pony").await.unwrap();
        assert_eq!(c.state(), ConnectionState::Joining);
        assert_eq!(c.join(&mut Admit, "pony").await.unwrap_err(), JoinError::AlreadyJoining);
    }

    #[test]
    fn handshake_stays_pending_until_my_entity() {
        let mut c = ConnectionManager::new(SyncConfig::default());
        let ticket = tokio_test::block_on(c.join(&mut Admit, "pony")).unwrap();
        let mut handshake = tokio_test::task::spawn(ticket.handshake);

        c.transport_opened(Instant::now());
        tokio_test::assert_pending!(handshake.poll());
        c.queue(2);
        tokio_test::assert_pending!(handshake.poll());

        c.handshake_complete(31);
        assert!(handshake.is_woken());
        assert_eq!(tokio_test::assert_ready!(handshake.poll()), Ok(31));
    }

    #[tokio::test]
    async fn unsupported_transport_fails_fast() {
        let mut c = ConnectionManager::new(SyncConfig::default()).with_transport_support(false);
        assert_eq!(
            c.join(&mut Admit, "pony").await.unwrap_err(),
            JoinError::UnsupportedTransport
        );
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }
}
