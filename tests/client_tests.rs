//! SyncClient end-to-end tests over an in-memory transport

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};
    use worldsync::{
        protocol::{FriendEntry, Notification, SayTuple, WorldState},
        update::{encode_region_snapshot, EntitySpawn, RegionSnapshot},
        ClientCall, ClientEvent, ConnectionState, LeaveReason, OutboxHandle, QueuedTransport,
        RegionCoord, ServerMessage, SyncClient, SyncConfig, Vec2, WorldEvent,
    };

    fn connected(now: Instant) -> (SyncClient, OutboxHandle) {
        let mut client = SyncClient::new(SyncConfig::default()).unwrap();
        let transport = QueuedTransport::new();
        let outbox = transport.outbox();
        client.connect(Box::new(transport), now);
        client.drain_events();
        (client, outbox)
    }

    fn feed(client: &mut SyncClient, message: ServerMessage, now: Instant) {
        client.receive_frame(&message.encode(), now);
    }

    fn region_with(entities: Vec<EntitySpawn>) -> Vec<u8> {
        encode_region_snapshot(&RegionSnapshot {
            coord: RegionCoord::new(0, 0),
            tiles: vec![1; 64],
            entities,
        })
        .to_vec()
    }

    fn update(subscribes: Vec<Vec<u8>>, says: Vec<SayTuple>) -> ServerMessage {
        ServerMessage::Update {
            unsubscribes: vec![],
            subscribes,
            updates: vec![],
            regions: vec![],
            says,
        }
    }

    fn enter_world(client: &mut SyncClient, now: Instant) {
        feed(
            client,
            ServerMessage::MyEntity {
                id: 1,
                name: "Me".into(),
                info: vec![7, 7, 1],
                character_id: "char-1".into(),
                crc: 0,
            },
            now,
        );
        feed(
            client,
            update(
                vec![region_with(vec![
                    EntitySpawn::new(1, 1, Vec2::new(2.0, 2.0)),
                    EntitySpawn::new(2, 5, Vec2::new(3.0, 3.0)),
                ])],
                vec![],
            ),
            now,
        );
    }

    // -----------------------------------------------------------------------
    // Session setup
    // -----------------------------------------------------------------------

    #[test]
    fn my_entity_and_snapshot_bring_player_into_world() {
        let now = Instant::now();
        let (mut client, _outbox) = connected(now);
        feed(
            &mut client,
            ServerMessage::WorldState {
                state: WorldState {
                    server: "main".into(),
                    entity_types: BTreeMap::from([(5, "tree".to_string())]),
                    ..WorldState::default()
                },
                initial: true,
            },
            now,
        );
        enter_world(&mut client, now);

        assert_eq!(client.state(), ConnectionState::Playing);
        assert_eq!(client.world().entity_count(), 2);
        assert_eq!(client.world().player_id(), Some(1));
        assert_eq!(client.context().type_name(5), Some("tree"));
        assert_eq!(client.character_id(), Some("char-1"));
        assert_eq!(client.context().player_info(), Some(&[7u8, 7, 1][..]));
        assert_eq!(client.context().display_name(1), Some("Me"));
        assert!(client
            .drain_events()
            .contains(&ClientEvent::World(WorldEvent::PlayerReady { id: 1 })));

        let ui = client.ui_state();
        assert_eq!(ui.read().connection, ConnectionState::Playing);
        assert_eq!(ui.read().player_id, Some(1));
    }

    #[test]
    fn garbage_frames_do_not_break_the_session() {
        let now = Instant::now();
        let (mut client, _outbox) = connected(now);
        client.receive_frame(&[], now);
        client.receive_frame(&[0xee, 0, 1], now);
        enter_world(&mut client, now);
        assert_eq!(client.world().entity_count(), 2);
    }

    // -----------------------------------------------------------------------
    // Outbound traffic
    // -----------------------------------------------------------------------

    #[test]
    fn fix_position_is_acknowledged() {
        let now = Instant::now();
        let (mut client, outbox) = connected(now);
        enter_world(&mut client, now);
        outbox.drain();

        feed(
            &mut client,
            ServerMessage::FixPosition {
                x: 6.0,
                y: 7.0,
                safe: true,
            },
            now,
        );
        assert_eq!(outbox.take_calls(), vec![ClientCall::FixedPositionAck]);
        assert_eq!(
            client.world().player().map(|p| p.position),
            Some(Vec2::new(6.0, 7.0))
        );
    }

    #[test]
    fn say_from_unknown_entity_asks_server_who_it_is() {
        let now = Instant::now();
        let (mut client, outbox) = connected(now);
        enter_world(&mut client, now);
        outbox.drain();

        let say = SayTuple {
            entity: 77,
            message: "hello".into(),
            kind: 0,
        };
        feed(&mut client, update(vec![], vec![say.clone(), say]), now);
        assert_eq!(outbox.take_calls(), vec![ClientCall::ResolveEntity { id: 77 }]);

        client.drain_events();
        feed(
            &mut client,
            ServerMessage::EntityInfo {
                id: 77,
                name: "Stranger".into(),
                crc: 0,
                name_bad: false,
            },
            now,
        );
        let said = client
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, ClientEvent::World(WorldEvent::Said { id: 77, .. })))
            .count();
        assert_eq!(said, 2);
        assert_eq!(client.context().display_name(77), Some("Stranger"));
    }

    #[test]
    fn keyed_values_reach_subscribers() {
        let now = Instant::now();
        let (mut client, outbox) = connected(now);
        client.subscribe("hiding", "stats", |_: &serde_json::Value| {});
        assert_eq!(
            outbox.take_calls(),
            vec![ClientCall::Subscribe {
                collection: "hiding".into(),
                key: "stats".into()
            }]
        );

        feed(
            &mut client,
            ServerMessage::SubscribedValue {
                collection: "hiding".into(),
                key: "stats".into(),
                value: serde_json::json!({ "found": 3 }),
            },
            now,
        );
        assert_eq!(
            client.value("hiding", "stats"),
            Some(&serde_json::json!({ "found": 3 }))
        );
        assert!(client.drain_events().contains(&ClientEvent::ValueChanged {
            collection: "hiding".into(),
            key: "stats".into()
        }));
    }

    // -----------------------------------------------------------------------
    // Side panels
    // -----------------------------------------------------------------------

    #[test]
    fn notifications_and_friends_track_server_lists() {
        let now = Instant::now();
        let (mut client, _outbox) = connected(now);
        feed(
            &mut client,
            ServerMessage::AddNotification(Notification {
                id: 4,
                entity: 2,
                name: "Pal".into(),
                message: "party invite".into(),
                flags: 1,
            }),
            now,
        );
        assert_eq!(client.notifications().count(), 1);
        feed(&mut client, ServerMessage::RemoveNotification { id: 4 }, now);
        feed(&mut client, ServerMessage::RemoveNotification { id: 4 }, now);
        assert_eq!(client.notifications().count(), 0);

        let friend = |id: &str| FriendEntry {
            account_id: id.into(),
            name: id.into(),
            entity: 0,
            online: false,
        };
        feed(
            &mut client,
            ServerMessage::UpdateFriends {
                friends: vec![friend("a"), friend("b")],
                remove_missing: false,
            },
            now,
        );
        feed(
            &mut client,
            ServerMessage::UpdateFriends {
                friends: vec![friend("b")],
                remove_missing: true,
            },
            now,
        );
        let names: Vec<_> = client.friends().map(|f| f.account_id.as_str()).collect();
        assert_eq!(names, vec!["b"]);

        let removed = client
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, ClientEvent::NotificationRemoved { .. }))
            .count();
        assert_eq!(removed, 1);
    }

    // -----------------------------------------------------------------------
    // Leaving
    // -----------------------------------------------------------------------

    #[test]
    fn server_left_clears_world_without_echo() {
        let now = Instant::now();
        let (mut client, outbox) = connected(now);
        enter_world(&mut client, now);
        outbox.drain();

        feed(
            &mut client,
            ServerMessage::Left {
                reason: LeaveReason::Kicked,
            },
            now,
        );
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.world().entity_count(), 0);
        assert!(outbox.take_calls().is_empty());
    }

    #[test]
    fn local_leave_tells_server() {
        let now = Instant::now();
        let (mut client, outbox) = connected(now);
        enter_world(&mut client, now);
        outbox.drain();

        client.leave(LeaveReason::Requested);
        assert_eq!(outbox.take_calls(), vec![ClientCall::Leave]);
        assert!(client.connection().is_safely_left());
    }

    #[test]
    fn lost_transport_times_out_after_grace() {
        let t0 = Instant::now();
        let (mut client, _outbox) = connected(t0);
        enter_world(&mut client, t0);

        client.transport_closed(t0);
        client.tick(t0 + Duration::from_secs(1));
        assert_eq!(client.world().entity_count(), 2);

        client.tick(t0 + SyncConfig::default().disconnect_grace());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.world().entity_count(), 0);
    }
}
