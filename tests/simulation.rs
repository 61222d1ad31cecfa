use std::sync::mpsc;

use approx::assert_relative_eq;
use glam::{Vec2, Vec3};
use plazasim::net::{ChannelPublisher, NullPublisher, Outbound, RosterSender, RosterUpdate, roster_channel};
use plazasim::npc::NpcState;
use plazasim::room::StaticGeometry;
use plazasim::*;
use rstest::rstest;

const DT: f32 = 1.0 / 60.0;

const WORLD: &str = r#"{
    "rooms": [
        {
            "id": "plaza",
            "spawn_points": [[0.0, 0.0, 0.0]],
            "colliders": [
                { "kind": "circular_bound", "center": [0.0, 0.0], "radius": 10.0 }
            ],
            "portals": [
                {
                    "position": [0.0, -8.0],
                    "trigger_radius": 1.5,
                    "destination": "cafe",
                    "arrival": [0.0, 0.0, 2.0],
                    "npc_crossable": false
                }
            ],
            "props": [ { "position": [0.0, 3.0], "radius": 0.35 } ]
        },
        {
            "id": "cafe",
            "colliders": [
                { "kind": "circular_bound", "center": [0.0, 0.0], "radius": 6.0 }
            ]
        }
    ]
}"#;

fn world() -> StaticGeometry {
    StaticGeometry::from_json_str(WORLD).unwrap()
}

fn plaza() -> RoomId {
    RoomId::from("plaza")
}

/// A simulation whose outbound traffic lands on the returned receiver.
fn publishing_sim(local: u64) -> (Simulation, mpsc::Receiver<Outbound>, RosterSender) {
    let (publisher, rx) = ChannelPublisher::new();
    let (tx, feed) = roster_channel();
    let sim = Simulation::new(SimConfig::default(), &world(), &plaza(), EntityId(local), Box::new(publisher), feed)
        .unwrap();
    (sim, rx, tx)
}

fn forward(rx: &mpsc::Receiver<Outbound>, to: &RosterSender) -> usize {
    let mut n = 0;
    for msg in rx.try_iter() {
        for update in msg.into_roster() {
            assert!(to.send(update));
            n += 1;
        }
    }
    n
}

#[test]
fn test_partial_json_config_keeps_defaults() {
    let cfg = SimConfig::from_json_str(r#"{ "seed": 7, "movement": { "walk_speed": 4.0 } }"#).unwrap();
    assert_eq!(cfg.seed, 7);
    assert_eq!(cfg.movement.walk_speed, 4.0);
    assert_eq!(cfg.movement.gravity, SimConfig::default().movement.gravity);

    let (_tx, feed) = roster_channel();
    let mut sim = Simulation::new(cfg, &world(), &plaza(), EntityId(1), Box::new(NullPublisher), feed).unwrap();
    let input = InputSample { forward: true, ..Default::default() };
    for _ in 0..60 {
        sim.tick(&input, DT);
    }
    let p = sim.local().unwrap().position;
    assert_relative_eq!(p.z, 4.0, epsilon = 1e-3);
    assert_relative_eq!(p.x, 0.0, epsilon = 1e-5);
}

#[test]
fn test_invalid_config_is_rejected() {
    let err = SimConfig::from_json_str(r#"{ "prop": { "restitution": 1.5 } }"#).unwrap_err();
    assert!(matches!(err, SimError::InvalidConfig(_)));
    let err = SimConfig::from_json_str("{ not json").unwrap_err();
    assert!(matches!(err, SimError::Json(_)));
}

#[test]
fn test_unknown_start_room() {
    let (_tx, feed) = roster_channel();
    let res = Simulation::new(
        SimConfig::default(),
        &world(),
        &RoomId::from("attic"),
        EntityId(1),
        Box::new(NullPublisher),
        feed,
    );
    assert!(matches!(res, Err(SimError::UnknownRoom(_))));
}

#[test]
fn test_throttle_limits_outbound_rate() {
    let (mut sim, rx, _tx) = publishing_sim(1);
    let input = InputSample { forward: true, ..Default::default() };
    for _ in 0..60 {
        sim.tick(&input, DT);
    }
    let locals = rx.try_iter().filter(|m| matches!(m, Outbound::Local(_))).count();
    // one second of walking at a 0.1 s send interval
    assert!((9..=11).contains(&locals), "sent {locals} samples");

    // standing still sends nothing
    for _ in 0..60 {
        sim.tick(&InputSample::default(), DT);
    }
    let _ = rx.try_iter().count();
    for _ in 0..60 {
        sim.tick(&InputSample::default(), DT);
    }
    // the kicked ball may still be bouncing; only the avatar must be quiet
    assert_eq!(rx.try_iter().filter(|m| matches!(m, Outbound::Local(_))).count(), 0);
}

#[test]
fn test_two_clients_see_each_other() {
    let (mut a, rx_a, _tx_a) = publishing_sim(1);
    let (mut b, _rx_b, tx_b) = publishing_sim(2);

    let walk = InputSample { forward: true, turn_right: true, ..Default::default() };
    for _ in 0..30 {
        a.tick(&walk, DT);
        forward(&rx_a, &tx_b);
        b.tick(&InputSample::default(), DT);
    }
    for _ in 0..180 {
        a.tick(&InputSample::default(), DT);
        forward(&rx_a, &tx_b);
        b.tick(&InputSample::default(), DT);
    }

    let truth = a.local().unwrap();
    let seen = b.entity(EntityId(1)).expect("remote joined implicitly");
    assert!(seen.as_remote().is_some());
    assert_eq!(seen.room, plaza());
    assert_relative_eq!(seen.position.x, truth.position.x, epsilon = 1e-2);
    assert_relative_eq!(seen.position.z, truth.position.z, epsilon = 1e-2);
    assert_eq!(seen.anim, AnimState::Idle);
    assert!(b.visible_entities().any(|e| e.id == EntityId(1)));
}

#[test]
fn test_emote_and_chat_reach_peer() {
    let (mut a, rx_a, _tx_a) = publishing_sim(1);
    let (mut b, _rx_b, tx_b) = publishing_sim(2);

    a.play_emote(EmoteKind::Wave);
    a.set_away("brb");
    for _ in 0..12 {
        a.tick(&InputSample::default(), DT);
        forward(&rx_a, &tx_b);
        b.tick(&InputSample::default(), DT);
    }
    let seen = b.entity(EntityId(1)).unwrap();
    assert_eq!(seen.anim, AnimState::Emote(EmoteKind::Wave));
    let chat = seen.ephemeral.chat.as_ref().unwrap();
    assert_eq!(chat.text, "brb");
    assert!(chat.away);

    a.clear_chat();
    for _ in 0..12 {
        a.tick(&InputSample::default(), DT);
        forward(&rx_a, &tx_b);
        b.tick(&InputSample::default(), DT);
    }
    assert!(b.entity(EntityId(1)).unwrap().ephemeral.chat.is_none());
}

#[test]
fn test_leave_removes_remote() {
    let (mut b, _rx_b, tx_b) = publishing_sim(2);
    tx_b.send(RosterUpdate::Join {
        entity: EntityId(9),
        room: plaza(),
        position: Vec3::new(1.0, 0.0, 1.0),
        rotation: 0.0,
        companion: true,
    });
    let report = b.tick(&InputSample::default(), DT);
    assert_eq!(report.joined, vec![EntityId(9)]);
    assert!(b.entity(EntityId(9)).unwrap().as_remote().unwrap().companion.is_some());

    tx_b.send(RosterUpdate::Leave { entity: EntityId(9) });
    let report = b.tick(&InputSample::default(), DT);
    assert_eq!(report.left, vec![EntityId(9)]);
    assert!(b.entity(EntityId(9)).is_none());
}

#[test]
fn test_roster_update_from_json() {
    let update = RosterUpdate::from_json_str(
        r#"{ "type": "state", "entity": 4, "room": "cafe", "position": [1.0, 0.0, 2.0],
             "rotation": 0.5, "timestamp_ms": 1200 }"#,
    )
    .unwrap();
    let (mut b, _rx_b, tx_b) = publishing_sim(2);
    tx_b.send(update);
    b.tick(&InputSample::default(), DT);
    let e = b.entity(EntityId(4)).unwrap();
    assert_eq!(e.room.as_str(), "cafe");
    // a different room is never drawn
    assert!(!b.visible_entities().any(|e| e.id == EntityId(4)));
}

#[test]
fn test_kicked_prop_resyncs_on_peer() {
    let (mut a, rx_a, _tx_a) = publishing_sim(1);
    let (mut b, _rx_b, tx_b) = publishing_sim(2);

    let walk = InputSample { forward: true, ..Default::default() };
    let mut kicked = false;
    for _ in 0..60 {
        let report = a.tick(&walk, DT);
        kicked |= !report.prop_events.is_empty();
        forward(&rx_a, &tx_b);
        b.tick(&InputSample::default(), DT);
    }
    assert!(kicked);
    let moved = b.props().props()[0].position;
    assert!(moved.distance(Vec2::new(0.0, 3.0)) > 0.1);
    // both stay inside the dome
    assert!(moved.length() <= 10.0);
    assert!(a.props().props()[0].position.length() <= 10.0);
}

#[rstest]
#[case(1)]
#[case(42)]
#[case(9001)]
fn test_npc_conversations_stay_paired(#[case] seed: u64) {
    let cfg = SimConfig { seed, ..Default::default() };
    let (_tx, feed) = roster_channel();
    let mut sim = Simulation::new(cfg, &world(), &plaza(), EntityId(1), Box::new(NullPublisher), feed).unwrap();
    for i in 0..6u64 {
        let angle = i as f32;
        let pos = Vec3::new(angle.cos() * 3.0, 0.0, angle.sin() * 3.0);
        sim.spawn_npc(EntityId(100 + i), &plaza(), pos).unwrap();
    }

    let mut max_sessions = 0;
    for _ in 0..3600 {
        let report = sim.tick(&InputSample::default(), DT);
        max_sessions = max_sessions.max(report.stats.sessions);
        assert_eq!(report.stats.npcs_chatting, report.stats.sessions * 2);
        for e in sim.entities().iter() {
            let Some(agent) = e.as_npc() else {
                continue;
            };
            assert_eq!(e.room, plaza());
            assert!(planar(e.position).length() <= 10.0);
            if let NpcState::Chatting { session } = agent.state {
                let partner = sim.npcs().partner_of(e.id).unwrap();
                let other = sim.entity(partner).unwrap().as_npc().unwrap();
                assert_eq!(other.session(), Some(session));
                if e.ephemeral.emote.is_none() {
                    assert_eq!(e.anim, AnimState::Talk);
                }
            }
        }
    }
    assert!(max_sessions <= 3);
}

#[test]
fn test_despawned_npc_ends_conversation() {
    // two idle neighbours that never wander off must pair on their first decision
    let mut cfg = SimConfig { seed: 3, ..Default::default() };
    cfg.npc.walk_probability = 0.0;
    cfg.npc.chat_radius = 4.0;
    let (_tx, feed) = roster_channel();
    let mut sim = Simulation::new(cfg, &world(), &plaza(), EntityId(1), Box::new(NullPublisher), feed).unwrap();
    sim.spawn_npc(EntityId(100), &plaza(), Vec3::new(2.0, 0.0, 0.0)).unwrap();
    sim.spawn_npc(EntityId(101), &plaza(), Vec3::new(3.0, 0.0, 0.0)).unwrap();

    let mut paired = None;
    for _ in 0..600 {
        sim.tick(&InputSample::default(), DT);
        if let Some(partner) = sim.npcs().partner_of(EntityId(100)) {
            paired = Some(partner);
            break;
        }
    }
    assert_eq!(paired, Some(EntityId(101)));
    let partner = EntityId(101);
    assert_eq!(sim.npcs().session_count(), 1);

    sim.despawn_npc(partner).unwrap();
    sim.tick(&InputSample::default(), DT);
    let agent = sim.entity(EntityId(100)).unwrap().as_npc().unwrap();
    assert!(agent.session().is_none());
    assert_eq!(sim.npcs().session_count(), 0);
    assert!(matches!(sim.despawn_npc(partner), Err(SimError::UnknownEntity(_))));
}

#[test]
fn test_companion_comes_and_goes_on_peer() {
    let (mut a, rx_a, _tx_a) = publishing_sim(1);
    let (mut b, _rx_b, tx_b) = publishing_sim(2);
    let idle = InputSample::default();
    let run = |a: &mut Simulation, b: &mut Simulation, ticks: usize| {
        for _ in 0..ticks {
            a.tick(&idle, DT);
            forward(&rx_a, &tx_b);
            b.tick(&idle, DT);
        }
    };

    run(&mut a, &mut b, 12);
    assert!(b.entity(EntityId(1)).unwrap().as_remote().unwrap().companion.is_none());

    a.spawn_companion(EntityId(50)).unwrap();
    run(&mut a, &mut b, 120);
    let owner = b.entity(EntityId(1)).unwrap().position;
    let seen = b.entity(EntityId(1)).unwrap().as_remote().unwrap().companion.expect("companion shows up");
    let truth = a.companion().unwrap().position;
    assert_relative_eq!(seen.x, truth.x, epsilon = 1e-2);
    assert_relative_eq!(seen.z, truth.z, epsilon = 1e-2);
    assert!(seen.distance(owner) > 0.1);

    assert!(a.dismiss_companion());
    run(&mut a, &mut b, 12);
    assert!(b.entity(EntityId(1)).unwrap().as_remote().unwrap().companion.is_none());
}

#[test]
fn test_logging_init_is_idempotent() {
    plazasim::logging::init(false);
    plazasim::logging::init(true);
}
