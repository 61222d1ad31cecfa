//! Network Reconciliation Channel.
//!
//! Outbound: a throttle samples the local avatar on its own timer and only
//! emits when something changed enough to matter. Inbound: roster updates are
//! queued by the I/O side on an mpsc channel, drained once per tick and applied
//! in arrival order (last write wins), then remote entities are smoothed toward
//! their latest snapshot.

use std::collections::HashMap;
use std::sync::mpsc;

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::api::StatePublisher;
use crate::config::NetConfig;
use crate::entity::{Entity, EntityKind, EntityTable};
use crate::prop::PropEvent;
use crate::types::{ActiveEmote, ChatBubble, EmoteKind, EntityId, RoomId, planar, rotate_local, wrap_angle};

// --- Wire types -----------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatLine {
    pub text: String,
    #[serde(default)]
    pub away: bool,
}

/// Ephemeral display state as it travels over the wire. `None` fields are explicit clears.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralUpdate {
    pub emote: Option<EmoteKind>,
    pub chat: Option<ChatLine>,
    pub seated: bool,
}

/// One throttled sample of the local avatar.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboundState {
    pub entity: EntityId,
    pub room: RoomId,
    pub position: Vec3,
    pub rotation: f32,
    /// Present when the ephemeral state changed since the last sample.
    pub ephemeral: Option<EphemeralUpdate>,
    /// Companion position relative to the avatar, world axes.
    pub companion_offset: Option<Vec3>,
    /// The companion was put away since the last sample.
    #[serde(default)]
    pub companion_dismissed: bool,
    pub timestamp_ms: u64,
}

/// Everything the core hands to the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Local(OutboundState),
    Prop(PropEvent),
}

impl Outbound {
    /// How a peer receiving this message would see it.
    pub fn into_roster(self) -> Vec<RosterUpdate> {
        match self {
            Outbound::Local(s) => {
                let mut out = vec![RosterUpdate::State {
                    entity: s.entity,
                    room: s.room,
                    position: s.position,
                    rotation: s.rotation,
                    timestamp_ms: s.timestamp_ms,
                    companion: s.companion_offset,
                }];
                if let Some(update) = s.ephemeral {
                    out.push(RosterUpdate::Ephemeral { entity: s.entity, update });
                }
                if s.companion_dismissed {
                    out.push(RosterUpdate::DismissCompanion { entity: s.entity });
                }
                out
            }
            Outbound::Prop(e) => vec![RosterUpdate::PropSync {
                room: e.room,
                prop: e.prop,
                position: e.position,
                velocity: e.velocity,
            }],
        }
    }
}

/// Inbound roster traffic from the peer/server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RosterUpdate {
    Join {
        entity: EntityId,
        room: RoomId,
        position: Vec3,
        #[serde(default)]
        rotation: f32,
        #[serde(default)]
        companion: bool,
    },
    Leave {
        entity: EntityId,
    },
    /// Latest pose. A snapshot in a different room than the one on record is
    /// a fresh arrival there: the render copy jumps instead of sliding across.
    State {
        entity: EntityId,
        room: RoomId,
        position: Vec3,
        rotation: f32,
        timestamp_ms: u64,
        /// Companion offset from the owner, world axes.
        #[serde(default)]
        companion: Option<Vec3>,
    },
    Ephemeral {
        entity: EntityId,
        update: EphemeralUpdate,
    },
    /// The owner put its companion away.
    DismissCompanion {
        entity: EntityId,
    },
    PropSync {
        room: RoomId,
        prop: usize,
        position: Vec2,
        velocity: Vec2,
    },
}

impl RosterUpdate {
    pub fn from_json_str(s: &str) -> crate::error::SimResult<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

// --- Channels ---------------------------------------------------------------------

/// I/O-side handle for queueing roster updates. Cheap to clone, `Send`.
#[derive(Clone, Debug)]
pub struct RosterSender {
    tx: mpsc::Sender<RosterUpdate>,
}

impl RosterSender {
    /// Queue an update for the next tick. Returns false once the simulation is gone.
    pub fn send(&self, update: RosterUpdate) -> bool {
        self.tx.send(update).is_ok()
    }
}

/// Simulation-side end of the roster channel.
#[derive(Debug)]
pub struct RosterFeed {
    rx: mpsc::Receiver<RosterUpdate>,
}

impl RosterFeed {
    /// Everything queued since the last drain, in arrival order. Never blocks.
    pub fn drain(&self) -> Vec<RosterUpdate> {
        self.rx.try_iter().collect()
    }
}

pub fn roster_channel() -> (RosterSender, RosterFeed) {
    let (tx, rx) = mpsc::channel();
    (RosterSender { tx }, RosterFeed { rx })
}

/// Publisher that forwards outbound traffic onto an mpsc channel, for a
/// transport thread (or a test) to pick up.
pub struct ChannelPublisher {
    tx: mpsc::Sender<Outbound>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl StatePublisher for ChannelPublisher {
    fn publish_local(&mut self, state: &OutboundState) {
        if self.tx.send(Outbound::Local(state.clone())).is_err() {
            log::trace!("outbound receiver dropped; local state discarded");
        }
    }

    fn publish_prop(&mut self, event: &PropEvent) {
        if self.tx.send(Outbound::Prop(event.clone())).is_err() {
            log::trace!("outbound receiver dropped; prop event discarded");
        }
    }
}

/// Publisher for offline play: drops everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullPublisher;

impl StatePublisher for NullPublisher {
    fn publish_local(&mut self, _state: &OutboundState) {}
    fn publish_prop(&mut self, _event: &PropEvent) {}
}

// --- Outbound throttle ------------------------------------------------------------

/// Low-frequency sampler with a bandwidth guard.
#[derive(Clone, Debug)]
pub struct OutboundThrottle {
    interval: f32,
    min_position_delta: f32,
    min_rotation_delta: f32,
    timer: f32,
    last_sent: Option<(Vec3, f32)>,
    pending: Option<EphemeralUpdate>,
    dismissed: bool,
    forced: bool,
}

impl OutboundThrottle {
    pub fn new(cfg: &NetConfig) -> Self {
        Self {
            interval: cfg.send_interval,
            min_position_delta: cfg.min_position_delta,
            min_rotation_delta: cfg.min_rotation_delta,
            timer: 0.0,
            last_sent: None,
            pending: None,
            dismissed: false,
            forced: false,
        }
    }

    /// Attach an ephemeral change to the next sample and force that sample out.
    pub fn queue_ephemeral(&mut self, update: EphemeralUpdate) {
        self.pending = Some(update);
    }

    /// Send the next sample regardless of the movement deltas.
    pub fn force_send(&mut self) {
        self.forced = true;
    }

    /// Tell peers on the next sample that the companion is gone.
    pub fn dismiss_companion(&mut self) {
        self.dismissed = true;
        self.forced = true;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn sample(
        &mut self,
        dt: f32,
        entity: EntityId,
        room: &RoomId,
        position: Vec3,
        rotation: f32,
        companion_offset: Option<Vec3>,
        timestamp_ms: u64,
    ) -> Option<OutboundState> {
        self.timer -= dt;
        if self.timer > 0.0 {
            return None;
        }
        self.timer += self.interval;
        if self.timer <= 0.0 {
            // long stall; do not burst to catch up
            self.timer = self.interval;
        }

        let moved = self.last_sent.is_none_or(|(p, r)| {
            p.distance(position) > self.min_position_delta
                || wrap_angle(rotation - r).abs() > self.min_rotation_delta
        });
        if !(moved || self.forced || self.pending.is_some()) {
            return None;
        }
        self.forced = false;
        self.last_sent = Some((position, rotation));
        Some(OutboundState {
            entity,
            room: room.clone(),
            position,
            rotation,
            ephemeral: self.pending.take(),
            companion_offset,
            companion_dismissed: std::mem::take(&mut self.dismissed),
            timestamp_ms,
        })
    }
}

// --- Inbound ------------------------------------------------------------------------

/// Latest authoritative state received for a remote entity.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkSnapshot {
    pub position: Vec3,
    pub rotation: f32,
    pub timestamp_ms: u64,
    pub ephemeral: EphemeralUpdate,
    /// Simulation clock at which `ephemeral` arrived.
    pub ephemeral_at: f64,
    /// Explicit companion offset from the last state that carried one.
    pub companion_offset: Option<Vec3>,
}

/// Remote-avatar part of an [`Entity`]. The entity's own position/rotation is
/// the smoothed render copy.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteAvatar {
    pub snapshot: NetworkSnapshot,
    pub seated: bool,
    /// Smoothed companion position, when this avatar has a companion.
    pub companion: Option<Vec3>,
    /// Planar render speed over the last smoothing step, units/s.
    pub render_speed: f32,
}

/// What a drain of the roster feed produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InboundOutcome {
    pub applied: usize,
    pub joined: Vec<EntityId>,
    pub left: Vec<EntityId>,
    /// Prop resyncs for the driver to hand to prop physics: (room, prop, position, velocity).
    pub prop_syncs: Vec<(RoomId, usize, Vec2, Vec2)>,
}

/// Upper bound on remembered departures; the oldest is forgotten first.
const MAX_DEPARTURES: usize = 1024;

/// A remote that left: its last snapshot time and when it left (sim clock).
#[derive(Copy, Clone, Debug, PartialEq)]
struct Departure {
    timestamp_ms: u64,
    left_at: f64,
}

pub struct Reconciler {
    cfg: NetConfig,
    departed: HashMap<EntityId, Departure>,
}

impl Reconciler {
    pub fn new(cfg: NetConfig) -> Self {
        Self { cfg, departed: HashMap::new() }
    }

    /// Whether a late snapshot for `entity` is still being rejected.
    pub fn has_departed(&self, entity: EntityId) -> bool {
        self.departed.contains_key(&entity)
    }

    /// Apply roster updates in order. Updates that cannot apply (stale,
    /// unknown target, id owned by a local entity, snapshot of a remote that
    /// already left) are dropped.
    pub fn apply(&mut self, table: &mut EntityTable, updates: Vec<RosterUpdate>, now: f64) -> InboundOutcome {
        let memory = self.cfg.departure_memory as f64;
        self.departed.retain(|_, d| now - d.left_at <= memory);

        let mut out = InboundOutcome::default();
        for update in updates {
            match update {
                RosterUpdate::Join { entity, room, position, rotation, companion } => {
                    if table.contains(entity) {
                        log::trace!("duplicate join for {entity}; ignored");
                        continue;
                    }
                    self.departed.remove(&entity);
                    self.join(table, entity, room, position, rotation, 0, companion.then_some(None));
                    out.joined.push(entity);
                }
                RosterUpdate::Leave { entity } => {
                    let Some(r) = table.get(entity).and_then(Entity::as_remote) else {
                        continue;
                    };
                    let timestamp_ms = r.snapshot.timestamp_ms;
                    table.remove(entity);
                    self.remember_departure(entity, timestamp_ms, now);
                    log::info!("remote {entity} left");
                    out.left.push(entity);
                }
                RosterUpdate::State { entity, room, position, rotation, timestamp_ms, companion } => {
                    let Some(e) = table.get_mut(entity) else {
                        if let Some(d) = self.departed.get(&entity) {
                            if timestamp_ms <= d.timestamp_ms {
                                log::trace!("late snapshot for departed {entity}; ignored");
                                continue;
                            }
                            self.departed.remove(&entity);
                        }
                        // state before join: treat as an implicit join
                        self.join(table, entity, room, position, rotation, timestamp_ms, companion.map(Some));
                        out.joined.push(entity);
                        out.applied += 1;
                        continue;
                    };
                    let EntityKind::Remote(r) = &mut e.kind else {
                        log::warn!("state update for non-remote {entity}; ignored");
                        continue;
                    };
                    if timestamp_ms < r.snapshot.timestamp_ms {
                        log::trace!(
                            "stale snapshot for {entity}: {timestamp_ms} < {}",
                            r.snapshot.timestamp_ms
                        );
                        continue;
                    }
                    r.snapshot.position = position;
                    r.snapshot.rotation = rotation;
                    r.snapshot.timestamp_ms = timestamp_ms;
                    if let Some(offset) = companion {
                        r.snapshot.companion_offset = Some(offset);
                        if r.companion.is_none() {
                            // companion brought out after the join
                            r.companion = Some(e.position + offset);
                        }
                    }
                    if e.room != room {
                        // reappearing elsewhere: a fresh arrival, not a slide
                        e.room = room;
                        e.position = position;
                        e.rotation = rotation;
                        if let Some(c) = r.companion.as_mut() {
                            *c = position + companion_offset(&self.cfg, &r.snapshot);
                        }
                    }
                }
                RosterUpdate::DismissCompanion { entity } => {
                    let Some(EntityKind::Remote(r)) = table.get_mut(entity).map(|e| &mut e.kind) else {
                        continue;
                    };
                    r.companion = None;
                    r.snapshot.companion_offset = None;
                }
                RosterUpdate::Ephemeral { entity, update } => {
                    let Some(e) = table.get_mut(entity) else {
                        log::trace!("ephemeral update for unknown {entity}; ignored");
                        continue;
                    };
                    let EntityKind::Remote(r) = &mut e.kind else {
                        continue;
                    };
                    e.ephemeral.emote = update.emote.map(|kind| ActiveEmote { kind, started_at: now });
                    e.ephemeral.chat = update.chat.as_ref().map(|c| ChatBubble {
                        text: c.text.clone(),
                        posted_at: now,
                        away: c.away,
                    });
                    r.seated = update.seated;
                    r.snapshot.ephemeral = update;
                    r.snapshot.ephemeral_at = now;
                }
                RosterUpdate::PropSync { room, prop, position, velocity } => {
                    out.prop_syncs.push((room, prop, position, velocity));
                }
            }
            out.applied += 1;
        }
        out
    }

    fn remember_departure(&mut self, entity: EntityId, timestamp_ms: u64, now: f64) {
        if self.departed.len() >= MAX_DEPARTURES {
            let oldest = self
                .departed
                .iter()
                .min_by(|a, b| a.1.left_at.total_cmp(&b.1.left_at))
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                self.departed.remove(&id);
            }
        }
        self.departed.insert(entity, Departure { timestamp_ms, left_at: now });
    }

    /// `companion`: `None` for no companion, `Some(None)` for one at the
    /// default offset, `Some(Some(o))` for an explicit offset.
    #[allow(clippy::too_many_arguments)]
    fn join(
        &self,
        table: &mut EntityTable,
        entity: EntityId,
        room: RoomId,
        position: Vec3,
        rotation: f32,
        timestamp_ms: u64,
        companion: Option<Option<Vec3>>,
    ) {
        let snapshot = NetworkSnapshot {
            position,
            rotation,
            timestamp_ms,
            ephemeral: EphemeralUpdate::default(),
            ephemeral_at: 0.0,
            companion_offset: companion.flatten(),
        };
        let companion = companion.map(|_| position + companion_offset(&self.cfg, &snapshot));
        let mut e = Entity::new(
            entity,
            room.clone(),
            position,
            EntityKind::Remote(RemoteAvatar { snapshot, seated: false, companion, render_speed: 0.0 }),
        );
        e.rotation = rotation;
        match table.insert(e) {
            Ok(()) => log::info!("remote {entity} joined in {room}"),
            Err(err) => log::warn!("could not add remote {entity}: {err}"),
        }
    }

    /// Move every remote's render copy toward its snapshot. The fraction
    /// `1 - exp(-rate * dt)` is always in (0, 1), so this never overshoots.
    pub fn smooth(&self, table: &mut EntityTable, dt: f32) {
        let alpha = 1.0 - (-self.cfg.smoothing_rate * dt).exp();
        let eps = self.cfg.snap_epsilon;
        for e in table.iter_mut() {
            let EntityKind::Remote(r) = &mut e.kind else {
                continue;
            };
            let before = planar(e.position);
            e.position = approach(e.position, r.snapshot.position, alpha, eps);
            let dr = wrap_angle(r.snapshot.rotation - e.rotation);
            e.rotation = if dr.abs() <= eps {
                r.snapshot.rotation
            } else {
                wrap_angle(e.rotation + dr * alpha)
            };
            r.render_speed = if dt > 0.0 { planar(e.position).distance(before) / dt } else { 0.0 };

            if let Some(c) = r.companion.as_mut() {
                let target = r.snapshot.position + companion_offset(&self.cfg, &r.snapshot);
                *c = approach(*c, target, alpha, eps);
            }
        }
    }

    /// Client-side fallback expiry of remote emotes and spoken bubbles.
    /// Seated state and away bubbles wait for an explicit clear.
    pub fn expire(&self, table: &mut EntityTable, now: f64) {
        for e in table.iter_mut() {
            if let EntityKind::Remote(_) = e.kind {
                e.ephemeral.expire(now, self.cfg.emote_ttl, self.cfg.chat_ttl);
            }
        }
    }
}

fn companion_offset(cfg: &NetConfig, snapshot: &NetworkSnapshot) -> Vec3 {
    snapshot
        .companion_offset
        .unwrap_or_else(|| rotate_local(cfg.companion_offset, snapshot.rotation))
}

/// Exponential step from `current` toward `target`, snapping inside `eps`.
pub fn approach(current: Vec3, target: Vec3, alpha: f32, eps: f32) -> Vec3 {
    let delta = target - current;
    if delta.length() <= eps {
        target
    } else {
        current + delta * alpha
    }
}
