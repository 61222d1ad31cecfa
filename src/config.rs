//! Simulation tunables.
//!
//! Every section has working defaults; JSON overrides only need to name the
//! fields they change.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Top-level configuration for a [`crate::Simulation`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub movement: MovementConfig,
    pub npc: NpcConfig,
    pub prop: PropConfig,
    pub net: NetConfig,
    pub room: RoomConfig,
    /// Seed for every stochastic decision the simulation makes.
    pub seed: u64,
    /// Enable per-phase timing instrumentation (adds small overhead when true).
    pub enable_timing: bool,
}

/// Local avatar kinematics.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MovementConfig {
    /// Downward acceleration, units/s^2.
    pub gravity: f32,
    /// Maximum fall speed (positive), units/s.
    pub terminal_velocity: f32,
    /// Upward speed applied on a jump, units/s.
    pub jump_impulse: f32,
    /// Base planar speed, units/s.
    pub walk_speed: f32,
    /// Turn rate for digital keys and full stick deflection, rad/s.
    pub turn_rate: f32,
    /// Stick deflections shorter than this are ignored.
    pub analog_deadzone: f32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            gravity: 25.0,
            terminal_velocity: 30.0,
            jump_impulse: 9.0,
            walk_speed: 6.0,
            turn_rate: 3.0,
            analog_deadzone: 0.15,
        }
    }
}

/// NPC behaviour tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NpcConfig {
    /// Walk speed as a fraction of `MovementConfig::walk_speed`.
    pub walk_speed_fraction: f32,
    /// Maximum turn toward the target bearing, rad/s.
    pub turn_rate: f32,
    /// Idle action timer is drawn uniformly from this range (seconds).
    pub action_interval: (f32, f32),
    /// Chance an expired idle timer starts a walk (when no chat partner was found).
    pub walk_probability: f32,
    /// Chance a walk target is a portal instead of a random point.
    pub portal_target_probability: f32,
    /// Rejection-sampling attempts for a walk target.
    pub target_retries: u32,
    /// Keep-out margin around obstacles for sampled targets.
    pub obstacle_margin: f32,
    /// Blocked steps tolerated before a walk is abandoned.
    pub stuck_threshold: u32,
    /// Distance to target that counts as arrived.
    pub arrive_radius: f32,
    /// Hard cap on a single walk.
    pub max_walk_seconds: f32,
    /// Range of the random wide turn used to slide off a wall (radians).
    pub wide_turn: (f32, f32),
    /// How far ahead a wall-slide re-targets along the new bearing.
    pub retarget_distance: f32,
    /// Pairing scan radius.
    pub chat_radius: f32,
    /// Cooldown after an aborted conversation or a failed pairing scan.
    pub chat_cooldown: f32,
    /// Cooldown after a completed conversation.
    pub post_chat_cooldown: f32,
    /// How long each scripted line stays on screen before the turn passes.
    pub line_seconds: f32,
    /// Duration of the shared laugh that closes a conversation.
    pub laugh_seconds: f32,
    /// Per-tick chance of crossing while inside a portal's capture zone.
    pub cross_probability: f32,
    /// Spread of the arrival point on the far side of a portal.
    pub arrival_jitter: f32,
}

impl Default for NpcConfig {
    fn default() -> Self {
        Self {
            walk_speed_fraction: 0.35,
            turn_rate: 2.5,
            action_interval: (2.0, 6.0),
            walk_probability: 0.6,
            portal_target_probability: 0.1,
            target_retries: 8,
            obstacle_margin: 0.75,
            stuck_threshold: 30,
            arrive_radius: 0.5,
            max_walk_seconds: 20.0,
            wide_turn: (1.2, 2.6),
            retarget_distance: 4.0,
            chat_radius: 4.0,
            chat_cooldown: 10.0,
            post_chat_cooldown: 25.0,
            line_seconds: 3.0,
            laugh_seconds: 2.5,
            cross_probability: 0.02,
            arrival_jitter: 1.0,
        }
    }
}

/// Kickable prop tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PropConfig {
    /// Exponential velocity damping rate, 1/s.
    pub friction: f32,
    /// Fraction of speed kept after bouncing off a wall.
    pub restitution: f32,
    /// Impulse added to every approaching kick.
    pub kick_base: f32,
    /// Impulse per unit of approach speed.
    pub kick_scale: f32,
    /// Separation impulse when the avatar overlaps without approaching.
    pub nudge: f32,
    /// Below this speed the prop snaps to rest.
    pub rest_epsilon: f32,
}

impl Default for PropConfig {
    fn default() -> Self {
        Self {
            friction: 1.2,
            restitution: 0.7,
            kick_base: 2.0,
            kick_scale: 1.2,
            nudge: 0.5,
            rest_epsilon: 0.05,
        }
    }
}

/// Network reconciliation tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Outbound sampling period (seconds), independent of the tick rate.
    pub send_interval: f32,
    /// Minimum planar+vertical movement since the last send.
    pub min_position_delta: f32,
    /// Minimum rotation change since the last send (radians).
    pub min_rotation_delta: f32,
    /// Exponential smoothing rate toward the latest snapshot, 1/s.
    pub smoothing_rate: f32,
    /// Remaining distance under which smoothing snaps onto the target.
    pub snap_epsilon: f32,
    /// Client-side fallback lifetime of an emote.
    pub emote_ttl: f32,
    /// Client-side fallback lifetime of a spoken chat bubble.
    pub chat_ttl: f32,
    /// Companion offset from its owner in the owner's local frame.
    pub companion_offset: Vec3,
    /// How long a departed remote's id keeps rejecting late snapshots (seconds).
    pub departure_memory: f32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            send_interval: 0.1,
            min_position_delta: 0.02,
            min_rotation_delta: 0.02,
            smoothing_rate: 10.0,
            snap_epsilon: 1e-3,
            emote_ttl: 4.0,
            chat_ttl: 6.0,
            companion_offset: Vec3::new(-0.8, 0.0, -0.6),
            departure_memory: 30.0,
        }
    }
}

/// Room manager tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Portal / seat proximity polling period (seconds).
    pub poll_interval: f32,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self { poll_interval: 0.25 }
    }
}

impl SimConfig {
    /// Parse a (possibly partial) JSON document and validate it.
    pub fn from_json_str(s: &str) -> SimResult<Self> {
        let cfg: SimConfig = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make the tick misbehave.
    pub fn validate(&self) -> SimResult<()> {
        let fail = |msg: &str| -> SimResult<()> {
            log::warn!("rejecting config: {msg}");
            Err(SimError::InvalidConfig(msg.to_owned()))
        };
        let m = &self.movement;
        if !(m.gravity > 0.0 && m.terminal_velocity > 0.0 && m.walk_speed > 0.0) {
            return fail("gravity, terminal_velocity and walk_speed must be positive");
        }
        if !(0.0..1.0).contains(&m.analog_deadzone) {
            return fail("analog_deadzone must be in [0, 1)");
        }
        let n = &self.npc;
        for (name, p) in [
            ("walk_probability", n.walk_probability),
            ("portal_target_probability", n.portal_target_probability),
            ("cross_probability", n.cross_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return fail(&format!("{name} must be in [0, 1]"));
            }
        }
        if n.action_interval.0 <= 0.0 || n.action_interval.0 > n.action_interval.1 {
            return fail("action_interval must be a positive, ordered range");
        }
        if n.wide_turn.0 > n.wide_turn.1 {
            return fail("wide_turn must be an ordered range");
        }
        if n.line_seconds <= 0.0 || n.max_walk_seconds <= 0.0 {
            return fail("line_seconds and max_walk_seconds must be positive");
        }
        let p = &self.prop;
        if !(0.0..=1.0).contains(&p.restitution) {
            return fail("restitution must be in [0, 1]");
        }
        if p.friction < 0.0 || p.rest_epsilon < 0.0 {
            return fail("friction and rest_epsilon must not be negative");
        }
        let net = &self.net;
        if net.send_interval <= 0.0 || net.smoothing_rate <= 0.0 {
            return fail("send_interval and smoothing_rate must be positive");
        }
        if net.departure_memory < 0.0 {
            return fail("departure_memory must not be negative");
        }
        if self.room.poll_interval <= 0.0 {
            return fail("poll_interval must be positive");
        }
        Ok(())
    }
}
