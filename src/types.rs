use std::fmt;

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// Identity of a simulated entity, stable across ticks and shared with peers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Name of a discrete play area ("plaza", "town", "cafe", ...).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomId {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle of a live conversation between two NPCs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

/// Shape class used when asking the geometry provider for a hit radius.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    Avatar,
    Npc,
    Companion,
    Prop,
}

// --- Planar helpers -----------------------------------------------------------
//
// World space is y-up. Everything that walks lives on the x/z plane, which the
// helpers below map onto glam's `Vec2` as (x, z).

/// Project a world position onto the walkable plane.
#[inline]
pub fn planar(p: Vec3) -> Vec2 {
    Vec2::new(p.x, p.z)
}

/// Replace the planar part of `p`, keeping its height.
#[inline]
pub fn with_planar(p: Vec3, xz: Vec2) -> Vec3 {
    Vec3::new(xz.x, p.y, xz.y)
}

/// Unit facing vector for a yaw angle. Yaw 0 faces +z, positive yaw turns toward +x.
#[inline]
pub fn facing(yaw: f32) -> Vec2 {
    Vec2::new(yaw.sin(), yaw.cos())
}

/// Inverse of [`facing`].
#[inline]
pub fn yaw_of(dir: Vec2) -> f32 {
    dir.x.atan2(dir.y)
}

/// Wrap an angle into (-PI, PI].
pub fn wrap_angle(a: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    let mut r = a % TAU;
    if r <= -PI {
        r += TAU;
    } else if r > PI {
        r -= TAU;
    }
    r
}

/// Rotate a local-space offset (x right, z forward) into world space for `yaw`.
#[inline]
pub fn rotate_local(offset: Vec3, yaw: f32) -> Vec3 {
    let (s, c) = yaw.sin_cos();
    Vec3::new(offset.x * c + offset.z * s, offset.y, -offset.x * s + offset.z * c)
}

// --- Ephemeral display state -----------------------------------------------

/// Short canned animations an entity can play.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmoteKind {
    Wave,
    Dance,
    Cheer,
    Laugh,
    Clap,
}

/// An emote that is currently playing.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ActiveEmote {
    pub kind: EmoteKind,
    /// Simulation clock (seconds) at which the emote started.
    pub started_at: f64,
}

/// A speech bubble over an entity's head.
#[derive(Clone, Debug, PartialEq)]
pub struct ChatBubble {
    pub text: String,
    pub posted_at: f64,
    /// "Away" bubbles never time out on their own.
    pub away: bool,
}

/// Per-entity transient display state shared by every entity kind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ephemeral {
    pub emote: Option<ActiveEmote>,
    pub chat: Option<ChatBubble>,
}

impl Ephemeral {
    /// Drop an emote older than `emote_ttl` and a non-away bubble older than
    /// `chat_ttl`. Returns true when anything was cleared.
    pub fn expire(&mut self, now: f64, emote_ttl: f32, chat_ttl: f32) -> bool {
        let mut changed = false;
        if let Some(e) = self.emote {
            if now - e.started_at >= emote_ttl as f64 {
                self.emote = None;
                changed = true;
            }
        }
        if let Some(c) = &self.chat {
            if !c.away && now - c.posted_at >= chat_ttl as f64 {
                self.chat = None;
                changed = true;
            }
        }
        changed
    }
}

/// Where an entity is sitting: seat index within its room and the chosen offset point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SeatRef {
    pub seat: usize,
    pub point: usize,
}

/// Derived per-tick animation state, consumed by whatever renders the entity.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AnimState {
    #[default]
    Idle,
    Walk,
    Airborne,
    Sit,
    Talk,
    Emote(EmoteKind),
}

// --- Input -----------------------------------------------------------------

/// One frame of local control input.
///
/// Digital keys and an analog stick may both be present; a stick outside its
/// deadzone takes precedence.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct InputSample {
    pub forward: bool,
    pub back: bool,
    pub turn_left: bool,
    pub turn_right: bool,
    /// Stick deflection in [-1, 1]^2; x turns, y drives (positive y = forward).
    pub joystick: Option<Vec2>,
    pub jump: bool,
}

impl InputSample {
    pub fn has_movement(&self, deadzone: f32) -> bool {
        let stick = self
            .joystick
            .is_some_and(|j| j.length_squared() > deadzone * deadzone);
        stick || self.forward || self.back || self.turn_left || self.turn_right
    }
}

// --- Interaction surfacing ---------------------------------------------------

/// The single "something is interactable here" value surfaced to the UI each tick.
#[derive(Clone, Debug, PartialEq)]
pub enum InteractionPrompt {
    Portal {
        index: usize,
        destination: RoomId,
        distance: f32,
    },
    Seat {
        index: usize,
        distance: f32,
    },
}

impl InteractionPrompt {
    pub fn distance(&self) -> f32 {
        match self {
            InteractionPrompt::Portal { distance, .. } | InteractionPrompt::Seat { distance, .. } => {
                *distance
            }
        }
    }
}

// --- Diagnostics -------------------------------------------------------------

/// Debug statistics for one completed tick.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TickStats {
    pub entities: usize,
    /// Entities whose room is the active room.
    pub visible: usize,
    pub npcs_walking: usize,
    pub npcs_chatting: usize,
    pub sessions: usize,
    pub props: usize,
    /// Inbound roster updates applied this tick.
    pub updates_applied: usize,
    /// Outbound messages handed to the publisher this tick.
    pub messages_published: usize,
}

/// Timing breakdown of the last tick (only filled when timing is enabled).
#[derive(Copy, Clone, Debug, Default)]
pub struct TickTiming {
    pub total_ms: f64,
    pub local_ms: f64,
    pub npc_ms: f64,
    pub prop_ms: f64,
    pub outbound_ms: f64,
    pub inbound_ms: f64,
    pub anim_ms: f64,
}

/// Overlap contact result (discrete).
#[derive(Copy, Clone, Debug)]
pub struct Overlap {
    /// Separating normal pointing from the obstacle toward the tested body.
    pub normal: Vec2,
    /// Penetration depth (≥ 0).
    pub depth: f32,
    /// A representative contact point.
    pub contact: Vec2,
}
