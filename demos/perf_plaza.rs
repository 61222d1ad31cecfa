use glam::{Vec2, Vec3};
use plazasim::catalog::{CircularBound, Collider};
use plazasim::net::{NullPublisher, roster_channel, RosterUpdate};
use plazasim::room::{PropSpawn, RoomDescriptor, StaticGeometry};
use plazasim::*;
use std::time::Instant;

fn lcg(seed: &mut u32) -> u32 {
    *seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
    *seed
}

fn unit(seed: &mut u32) -> f32 {
    lcg(seed) as f32 / u32::MAX as f32
}

fn main() {
    plazasim::logging::init(false);

    let mut plaza = RoomDescriptor::new("plaza");
    plaza
        .colliders
        .push(Collider::CircularBound(CircularBound { center: Vec2::ZERO, radius: 40.0 }));
    for i in 0..8 {
        let a = i as f32 * std::f32::consts::TAU / 8.0;
        plaza.props.push(PropSpawn { position: Vec2::new(a.cos(), a.sin()) * 10.0, radius: 0.35 });
    }
    let geometry = StaticGeometry::new(vec![plaza]);
    let room = RoomId::from("plaza");

    let cfg = SimConfig { enable_timing: true, seed: 3, ..Default::default() };
    let (tx, feed) = roster_channel();
    let mut sim = match Simulation::new(cfg, &geometry, &room, EntityId(1), Box::new(NullPublisher), feed) {
        Ok(sim) => sim,
        Err(err) => {
            eprintln!("setup failed: {err}");
            return;
        }
    };

    let n_npcs = 200u64; // wandering NPCs
    let n_remotes = 100u64; // remote avatars fed through the roster channel
    let mut seed = 1u32;
    for i in 0..n_npcs {
        let p = Vec3::new(unit(&mut seed) * 60.0 - 30.0, 0.0, unit(&mut seed) * 60.0 - 30.0);
        if let Err(err) = sim.spawn_npc(EntityId(1000 + i), &room, p * 0.7) {
            eprintln!("spawn failed: {err}");
        }
    }

    let input = InputSample { forward: true, turn_left: true, ..Default::default() };
    let frames = 600;
    let mut worst = 0.0f64;
    let t0 = Instant::now();
    for frame in 0..frames {
        for r in 0..n_remotes {
            let a = (frame as f32 * 0.01) + r as f32;
            tx.send(RosterUpdate::State {
                entity: EntityId(5000 + r),
                room: room.clone(),
                position: Vec3::new(a.cos() * 20.0, 0.0, a.sin() * 20.0),
                rotation: a,
                timestamp_ms: frame as u64 * 16,
                companion: None,
            });
        }
        let report = sim.tick(&input, 1.0 / 60.0);
        if let Some(t) = report.timing {
            worst = worst.max(t.total_ms);
        }
        if frame % 120 == 0 {
            let s = report.stats;
            if let Some(t) = report.timing {
                println!(
                    "frame={} entities={} walking={} chatting={} sessions={} total={:.3}ms (npc={:.3}ms prop={:.3}ms inbound={:.3}ms)",
                    frame, s.entities, s.npcs_walking, s.npcs_chatting, s.sessions, t.total_ms, t.npc_ms, t.prop_ms, t.inbound_ms
                );
            }
        }
    }
    let elapsed = t0.elapsed();
    println!(
        "{} frames in {:.3}ms ({:.3}ms/frame, worst {:.3}ms)",
        frames,
        elapsed.as_secs_f64() * 1000.0,
        elapsed.as_secs_f64() * 1000.0 / frames as f64,
        worst
    );
}
