//! Dynamic Prop Physics: kickable balls that roll, bounce and come to rest.

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::api::NarrowphaseApi;
use crate::catalog::RoomGeometry;
use crate::config::PropConfig;
use crate::narrowphase::Narrowphase;
use crate::resolver::bounce;
use crate::room::RoomDescriptor;
use crate::types::RoomId;

#[derive(Clone, Debug, PartialEq)]
pub struct DynamicProp {
    pub position: Vec2,
    pub velocity: Vec2,
    pub radius: f32,
    pub friction: f32,
    pub restitution: f32,
}

impl DynamicProp {
    pub fn at_rest(&self) -> bool {
        self.velocity == Vec2::ZERO
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropEventKind {
    /// Approaching avatar imparted an impulse.
    Kick,
    /// Overlapping avatar that was not approaching pushed the prop aside.
    Nudge,
    /// Reflected off a wall or piece of furniture.
    Bounce,
}

/// A velocity change, published so peers can resync the trajectory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropEvent {
    pub room: RoomId,
    pub prop: usize,
    pub position: Vec2,
    pub velocity: Vec2,
    pub kind: PropEventKind,
}

/// The body that can kick props this tick (the local avatar).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Kicker {
    pub position: Vec2,
    pub velocity: Vec2,
    pub radius: f32,
}

/// Props of the active room.
pub struct PropPhysics {
    cfg: PropConfig,
    room: Option<RoomId>,
    props: Vec<DynamicProp>,
}

impl PropPhysics {
    pub fn new(cfg: PropConfig) -> Self {
        Self { cfg, room: None, props: Vec::new() }
    }

    /// Spawn the room's props at rest, replacing those of the previous room.
    pub fn activate(&mut self, desc: &RoomDescriptor) {
        self.props = desc
            .props
            .iter()
            .map(|s| DynamicProp {
                position: s.position,
                velocity: Vec2::ZERO,
                radius: s.radius,
                friction: self.cfg.friction,
                restitution: self.cfg.restitution,
            })
            .collect();
        self.room = Some(desc.id.clone());
    }

    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn props(&self) -> &[DynamicProp] {
        &self.props
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Overwrite a prop with a peer's authoritative state. Ignored when it is
    /// for another room or an unknown prop.
    pub fn apply_sync(&mut self, room: &RoomId, prop: usize, position: Vec2, velocity: Vec2) -> bool {
        if self.room.as_ref() != Some(room) {
            return false;
        }
        let Some(p) = self.props.get_mut(prop) else {
            return false;
        };
        p.position = position;
        p.velocity = velocity;
        true
    }

    pub fn tick(&mut self, geom: Option<&RoomGeometry>, kicker: Option<Kicker>, dt: f32) -> Vec<PropEvent> {
        let Some(room) = self.room.clone() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        for (i, p) in self.props.iter_mut().enumerate() {
            let mut push = |kind: PropEventKind, p: &DynamicProp| {
                events.push(PropEvent {
                    room: room.clone(),
                    prop: i,
                    position: p.position,
                    velocity: p.velocity,
                    kind,
                })
            };

            if let Some(k) = kicker {
                if let Some(kind) = kick(&self.cfg, p, &k) {
                    push(kind, p);
                }
            }

            if !p.at_rest() {
                let candidate = p.position + p.velocity * dt;
                let contact = bounce(geom, p.position, candidate, p.radius, p.radius * 2.0);
                p.position = contact.position;
                if let Some(n) = contact.normal {
                    let reflected = Narrowphase::reflect(p.velocity, n, p.restitution);
                    if reflected != p.velocity {
                        p.velocity = reflected;
                        push(PropEventKind::Bounce, p);
                    }
                }
            }

            p.velocity *= (-p.friction * dt).exp();
            if p.velocity.length() < self.cfg.rest_epsilon {
                p.velocity = Vec2::ZERO;
            }
        }
        events
    }
}

/// Resolve avatar/prop overlap: impulse plus separation along the avatar-to-prop normal.
fn kick(cfg: &PropConfig, p: &mut DynamicProp, k: &Kicker) -> Option<PropEventKind> {
    let o = Narrowphase::overlap_circle_circle(p.position, p.radius, k.position, k.radius)?;
    let n = if o.normal == Vec2::ZERO {
        k.velocity.try_normalize().unwrap_or(Vec2::Y)
    } else {
        o.normal
    };
    let approach = k.velocity.dot(n);
    let kind = if approach > 0.0 {
        p.velocity += n * (approach * cfg.kick_scale + cfg.kick_base);
        log::debug!("prop kicked at {} with approach speed {approach:.2}", p.position);
        PropEventKind::Kick
    } else {
        p.velocity += n * cfg.nudge;
        PropEventKind::Nudge
    };
    p.position += n * o.depth;
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CircularBound, Collider};
    use crate::room::PropSpawn;
    use approx::assert_relative_eq;

    fn physics() -> PropPhysics {
        let mut desc = RoomDescriptor::new("plaza");
        desc.props.push(PropSpawn { position: Vec2::ZERO, radius: 0.5 });
        let mut p = PropPhysics::new(PropConfig::default());
        p.activate(&desc);
        p
    }

    fn dome() -> RoomGeometry {
        RoomGeometry::from_colliders([Collider::CircularBound(CircularBound { center: Vec2::ZERO, radius: 5.0 })])
    }

    #[test]
    fn test_prop_at_rest_stays_at_rest() {
        let mut phys = physics();
        let room = RoomId::from("plaza");
        phys.apply_sync(&room, 0, Vec2::new(1.0, 1.0), Vec2::new(0.01, 0.0));
        phys.tick(Some(&dome()), None, 0.016);
        assert!(phys.props()[0].at_rest());
        let rest = phys.props()[0].position;
        for _ in 0..100 {
            assert!(phys.tick(Some(&dome()), None, 0.016).is_empty());
            assert!(phys.props()[0].at_rest());
            assert_eq!(phys.props()[0].position, rest);
        }
    }

    #[test]
    fn test_approaching_avatar_kicks() {
        let mut phys = physics();
        let kicker = Kicker { position: Vec2::new(-0.8, 0.0), velocity: Vec2::new(3.0, 0.0), radius: 0.4 };
        let events = phys.tick(None, Some(kicker), 0.0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PropEventKind::Kick);
        let cfg = PropConfig::default();
        let p = &phys.props()[0];
        assert_relative_eq!(p.velocity.x, 3.0 * cfg.kick_scale + cfg.kick_base, epsilon = 1e-4);
        assert_relative_eq!(p.velocity.y, 0.0, epsilon = 1e-6);
        // separated out of the overlap
        assert_relative_eq!(p.position.x, 0.1, epsilon = 1e-5);
    }

    #[test]
    fn test_receding_avatar_only_nudges() {
        let mut phys = physics();
        let kicker = Kicker { position: Vec2::new(-0.8, 0.0), velocity: Vec2::new(-2.0, 0.0), radius: 0.4 };
        let events = phys.tick(None, Some(kicker), 0.0);
        assert_eq!(events[0].kind, PropEventKind::Nudge);
        assert_relative_eq!(phys.props()[0].velocity.x, PropConfig::default().nudge, epsilon = 1e-5);
    }

    #[test]
    fn test_wall_bounce_reflects_with_restitution() {
        let mut phys = physics();
        let room = RoomId::from("plaza");
        phys.apply_sync(&room, 0, Vec2::new(4.4, 0.0), Vec2::new(10.0, 0.0));
        let events = phys.tick(Some(&dome()), None, 0.1);
        assert!(events.iter().any(|e| e.kind == PropEventKind::Bounce));
        let p = &phys.props()[0];
        assert!(p.position.length() <= 4.5 + 1e-4);
        let cfg = PropConfig::default();
        let expected = -10.0 * cfg.restitution * (-cfg.friction * 0.1).exp();
        assert_relative_eq!(p.velocity.x, expected, epsilon = 1e-3);
    }

    #[test]
    fn test_friction_decays_speed() {
        let mut phys = physics();
        let room = RoomId::from("plaza");
        phys.apply_sync(&room, 0, Vec2::ZERO, Vec2::new(0.0, 1.0));
        let mut last = 1.0;
        for _ in 0..10 {
            phys.tick(Some(&dome()), None, 0.05);
            let speed = phys.props()[0].velocity.length();
            assert!(speed < last);
            last = speed;
        }
    }

    #[test]
    fn test_sync_for_other_room_ignored() {
        let mut phys = physics();
        assert!(!phys.apply_sync(&RoomId::from("cafe"), 0, Vec2::ONE, Vec2::ONE));
        assert!(!phys.apply_sync(&RoomId::from("plaza"), 3, Vec2::ONE, Vec2::ONE));
        assert_eq!(phys.props()[0].position, Vec2::ZERO);
    }
}
