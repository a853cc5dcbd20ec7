//! Connection lifecycle tests

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};
    use worldsync::{
        events::ConnectionEvent, AccountApi, ConnectionManager, ConnectionState, JoinError,
        JoinResponse, LeaveReason, SyncConfig,
    };

    struct ScriptedApi {
        answers: VecDeque<JoinResponse>,
        calls: u32,
    }

    impl ScriptedApi {
        fn new(answers: Vec<JoinResponse>) -> Self {
            Self {
                answers: answers.into(),
                calls: 0,
            }
        }
    }

    impl AccountApi for ScriptedApi {
        async fn request_join(&mut self, _character_id: &str) -> Result<JoinResponse, JoinError> {
            self.calls += 1;
            self.answers
                .pop_front()
                .ok_or_else(|| JoinError::Api("script exhausted".into()))
        }
    }

    fn admitted() -> JoinResponse {
        JoinResponse::Admitted {
            token: "tok".into(),
        }
    }

    // -----------------------------------------------------------------------
    // Join
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn handshake_resolves_with_player_id() {
        let mut conn = ConnectionManager::new(SyncConfig::default());
        let mut api = ScriptedApi::new(vec![admitted()]);
        let ticket = conn.join(&mut api, "c1").await.unwrap();
        assert_eq!(ticket.token, "tok");

        conn.transport_opened(Instant::now());
        conn.handshake_complete(12);
        assert_eq!(ticket.handshake.await.unwrap(), 12);
        assert_eq!(conn.state(), ConnectionState::Playing);
    }

    #[tokio::test]
    async fn leaving_before_handshake_rejects_it() {
        let mut conn = ConnectionManager::new(SyncConfig::default());
        let mut api = ScriptedApi::new(vec![admitted()]);
        let ticket = conn.join(&mut api, "c1").await.unwrap();
        conn.leave(LeaveReason::Requested);
        assert!(matches!(ticket.handshake.await, Err(JoinError::Cancelled)));
    }

    #[tokio::test]
    async fn denial_is_returned_without_retry() {
        let mut conn = ConnectionManager::new(SyncConfig::default());
        let mut api = ScriptedApi::new(vec![JoinResponse::Denied {
            alert: Some("banned".into()),
        }]);
        let err = conn.join(&mut api, "c1").await.unwrap_err();
        assert!(matches!(err, JoinError::Denied { alert: Some(ref a) } if a == "banned"));
        assert_eq!(api.calls, 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_limit_backs_off_and_retries() {
        let config = SyncConfig::default();
        let mut conn = ConnectionManager::new(config.clone());
        let mut api = ScriptedApi::new(vec![
            JoinResponse::CreationLimited,
            JoinResponse::CreationLimited,
            admitted(),
        ]);
        let started = tokio::time::Instant::now();
        let ticket = conn.join(&mut api, "c1").await.unwrap();
        assert_eq!(ticket.attempts, 3);
        assert!(started.elapsed() >= config.account_retry_delay() * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_limit_gives_up_after_attempts() {
        let mut conn = ConnectionManager::new(SyncConfig::default());
        let mut api = ScriptedApi::new(vec![JoinResponse::CreationLimited; 5]);
        let err = conn.join(&mut api, "c1").await.unwrap_err();
        assert!(matches!(err, JoinError::AccountCreationLimit { attempts: 3 }));
        assert_eq!(api.calls, 3);
    }

    // -----------------------------------------------------------------------
    // Disconnect grace
    // -----------------------------------------------------------------------

    async fn playing() -> ConnectionManager {
        let mut conn = ConnectionManager::new(SyncConfig::default());
        let mut api = ScriptedApi::new(vec![admitted()]);
        let _ticket = conn.join(&mut api, "c1").await.unwrap();
        conn.transport_opened(Instant::now());
        conn.handshake_complete(1);
        conn.drain_events();
        conn
    }

    #[tokio::test]
    async fn clean_leave_inside_grace_is_not_repeated() {
        let t0 = Instant::now();
        let mut conn = playing().await;
        conn.disconnected(t0);
        conn.leave(LeaveReason::Requested);

        assert_eq!(conn.tick(t0 + Duration::from_secs(60)), None);
        let lefts: Vec<_> = conn
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, ConnectionEvent::Left { .. }))
            .collect();
        assert_eq!(
            lefts,
            vec![ConnectionEvent::Left {
                reason: LeaveReason::Requested
            }]
        );
    }

    #[tokio::test]
    async fn grace_expiry_leaves_with_timeout() {
        let t0 = Instant::now();
        let config = SyncConfig::default();
        let mut conn = playing().await;
        conn.disconnected(t0);
        assert_eq!(conn.tick(t0 + Duration::from_secs(1)), None);
        assert_eq!(
            conn.tick(t0 + config.disconnect_grace()),
            Some(LeaveReason::Timeout)
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_inside_grace_keeps_session() {
        let t0 = Instant::now();
        let mut conn = playing().await;
        conn.disconnected(t0);
        conn.transport_opened(t0 + Duration::from_secs(2));
        assert_eq!(conn.tick(t0 + Duration::from_secs(60)), None);
        assert!(!conn.is_safely_left());
        assert_eq!(conn.pending_timers(), 0);
    }
}
