//! NPC Behavior Engine.
//!
//! Each agent is a small state machine (`Idle`, `Walk`, `Chatting`) driven by
//! timers and a seeded RNG. Conversations are [`ConversationSession`]s owned
//! by the engine; agents only hold the session id, so ending a session is a
//! single removal plus a release of both members.

use std::collections::{BTreeMap, HashSet};

use glam::{Vec2, Vec3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::catalog::RoomGeometry;
use crate::config::NpcConfig;
use crate::entity::{Entity, EntityKind, EntityTable};
use crate::resolver::resolve;
use crate::room::RoomManager;
use crate::types::{
    ActiveEmote, ChatBubble, EmoteKind, EntityId, RoomId, SessionId, facing, planar, with_planar, wrap_angle,
    yaw_of,
};

/// Short dialogues. The last entry of each is the closing beat both agents
/// laugh along to; every script has at least two spoken lines before it.
pub const SCRIPTS: &[&[&str]] = &[
    &[
        "Nice weather today.",
        "Perfect for a lap around the fountain.",
        "Did you see someone kicked the ball into the pond again?",
        "Ha! Every single day.",
    ],
    &[
        "Have you tried the cafe yet?",
        "The cocoa is unreal.",
        "Save me a seat next time.",
        "Haha, deal!",
    ],
    &[
        "Where are you headed?",
        "Nowhere in particular.",
        "Same as always, then.",
        "Ha, you know me too well.",
    ],
    &[
        "Is it just me or is the town busier today?",
        "Everyone's out for the festival.",
        "I thought that was next week!",
        "Nope, it's today.",
        "Hahaha, typical.",
    ],
];

/// Straight-line progress below this fraction of the attempted step counts as blocked.
const MIN_PROGRESS: f32 = 0.1;

/// Half-width of the wander square used in rooms without a finite boundary.
const OPEN_ROOM_WANDER: f32 = 8.0;

/// Extra clearance past a portal's capture zone for agents arriving next to it.
const PORTAL_CLEARANCE: f32 = 0.25;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum NpcState {
    Idle,
    Walk { target: Vec2, started_at: f64 },
    Chatting { session: SessionId },
}

#[derive(Clone, Debug, PartialEq)]
pub struct NpcAgent {
    pub state: NpcState,
    /// Seconds until the next idle decision.
    pub action_timer: f32,
    /// Seconds until this agent may start a conversation.
    pub chat_cooldown: f32,
    /// Blocked steps during the current walk.
    pub stuck_count: u32,
    pub radius: f32,
}

impl NpcAgent {
    pub fn new(radius: f32, action_timer: f32) -> Self {
        Self {
            state: NpcState::Idle,
            action_timer,
            chat_cooldown: 0.0,
            stuck_count: 0,
            radius,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == NpcState::Idle
    }

    pub fn is_walking(&self) -> bool {
        matches!(self.state, NpcState::Walk { .. })
    }

    pub fn session(&self) -> Option<SessionId> {
        match self.state {
            NpcState::Chatting { session } => Some(session),
            _ => None,
        }
    }
}

/// A live conversation between exactly two agents in the same room.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationSession {
    pub members: [EntityId; 2],
    pub room: RoomId,
    /// Index into [`SCRIPTS`].
    pub script: usize,
    /// Index into `members` of the agent currently speaking.
    pub speaker: usize,
    /// Line currently on screen.
    pub cursor: usize,
    pub line_started_at: f64,
}

impl ConversationSession {
    pub fn lines(&self) -> &'static [&'static str] {
        SCRIPTS[self.script % SCRIPTS.len()]
    }

    pub fn speaker_id(&self) -> EntityId {
        self.members[self.speaker]
    }

    pub fn partner_of(&self, id: EntityId) -> Option<EntityId> {
        match self.members {
            [a, b] if a == id => Some(b),
            [a, b] if b == id => Some(a),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WalkEnd {
    Arrived,
    Stuck,
    TimedOut,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConversationEnd {
    Completed,
    PartnerLeft,
}

/// Things that happened during one NPC tick.
#[derive(Clone, Debug, PartialEq)]
pub enum NpcEvent {
    WalkStarted {
        npc: EntityId,
        target: Vec2,
    },
    WalkEnded {
        npc: EntityId,
        reason: WalkEnd,
    },
    Paired {
        session: SessionId,
        members: [EntityId; 2],
    },
    Line {
        session: SessionId,
        speaker: EntityId,
        text: &'static str,
    },
    ConversationEnded {
        session: SessionId,
        members: [EntityId; 2],
        reason: ConversationEnd,
    },
    CrossedRoom {
        npc: EntityId,
        from: RoomId,
        to: RoomId,
    },
}

/// Start-of-tick view of an agent, used for partner scans.
struct Presence {
    id: EntityId,
    room: RoomId,
    position: Vec2,
    ready: bool,
}

pub struct NpcEngine {
    cfg: NpcConfig,
    walk_speed: f32,
    sessions: BTreeMap<SessionId, ConversationSession>,
    next_session: u64,
    rng: StdRng,
}

impl NpcEngine {
    /// `base_walk_speed` is the player's; agents walk at `cfg.walk_speed_fraction` of it.
    pub fn new(cfg: NpcConfig, base_walk_speed: f32, seed: u64) -> Self {
        let walk_speed = base_walk_speed * cfg.walk_speed_fraction;
        Self {
            cfg,
            walk_speed,
            sessions: BTreeMap::new(),
            next_session: 1,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A fresh idle agent with a randomised first decision time.
    pub fn new_agent(&mut self, radius: f32) -> NpcAgent {
        let timer = self.draw_interval();
        NpcAgent::new(radius, timer)
    }

    pub fn walk_speed(&self) -> f32 {
        self.walk_speed
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&SessionId, &ConversationSession)> {
        self.sessions.iter()
    }

    pub fn session(&self, id: SessionId) -> Option<&ConversationSession> {
        self.sessions.get(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The agent `id` is talking to, if any.
    pub fn partner_of(&self, id: EntityId) -> Option<EntityId> {
        self.sessions.values().find_map(|s| s.partner_of(id))
    }

    /// Advance every agent in `table` by `dt` seconds. `now` is the simulation clock.
    pub fn tick(&mut self, table: &mut EntityTable, rooms: &RoomManager, now: f64, dt: f32) -> Vec<NpcEvent> {
        let mut events = Vec::new();
        self.validate_sessions(table, &mut events);

        let snapshot: Vec<Presence> = table
            .iter()
            .filter_map(|e| {
                let a = e.as_npc()?;
                Some(Presence {
                    id: e.id,
                    room: e.room.clone(),
                    position: planar(e.position),
                    ready: a.is_idle() && a.chat_cooldown <= 0.0,
                })
            })
            .collect();
        let mut taken = HashSet::new();

        for id in table.ids() {
            if taken.contains(&id) {
                continue;
            }
            let Some(entity) = table.get_mut(id) else {
                continue;
            };
            let Some(agent) = entity.as_npc_mut() else {
                continue;
            };
            agent.chat_cooldown = (agent.chat_cooldown - dt).max(0.0);
            let state = agent.state;
            if !matches!(state, NpcState::Chatting { .. }) {
                entity
                    .ephemeral
                    .expire(now, self.cfg.laugh_seconds, self.cfg.laugh_seconds);
            }
            match state {
                NpcState::Chatting { .. } => {}
                NpcState::Walk { target, started_at } => {
                    let geom = rooms.geometry(&entity.room);
                    if self.tick_walk(entity, geom, target, started_at, now, dt, &mut events) {
                        self.maybe_cross(entity, rooms, &mut events);
                    }
                }
                NpcState::Idle => {
                    self.tick_idle(table, rooms, &snapshot, &mut taken, id, now, dt, &mut events);
                }
            }
        }

        self.advance_sessions(table, now, &mut events);
        events
    }

    // --- Idle ----------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn tick_idle(
        &mut self,
        table: &mut EntityTable,
        rooms: &RoomManager,
        snapshot: &[Presence],
        taken: &mut HashSet<EntityId>,
        id: EntityId,
        now: f64,
        dt: f32,
        events: &mut Vec<NpcEvent>,
    ) {
        let Some(entity) = table.get_mut(id) else {
            return;
        };
        if self.maybe_cross(entity, rooms, events) {
            return;
        }
        let room = entity.room.clone();
        let pos = planar(entity.position);
        let Some(agent) = entity.as_npc_mut() else {
            return;
        };
        agent.action_timer -= dt;
        if agent.action_timer > 0.0 {
            return;
        }
        agent.action_timer = self.draw_interval();
        let radius = agent.radius;

        if agent.chat_cooldown <= 0.0 {
            match self.find_partner(table, snapshot, taken, id, &room, pos) {
                Some(partner) => {
                    self.start_session(table, id, partner, room, now, events);
                    taken.insert(id);
                    taken.insert(partner);
                    return;
                }
                None => {
                    if let Some(a) = table.get_mut(id).and_then(Entity::as_npc_mut) {
                        a.chat_cooldown = self.cfg.chat_cooldown;
                    }
                }
            }
        }

        if !self.rng.random_bool(self.cfg.walk_probability as f64) {
            return;
        }
        let Some(target) = self.pick_target(rooms, &room, pos, radius) else {
            log::trace!("npc {id} found no walk target in {room}");
            return;
        };
        if let Some(a) = table.get_mut(id).and_then(Entity::as_npc_mut) {
            a.state = NpcState::Walk { target, started_at: now };
            a.stuck_count = 0;
            events.push(NpcEvent::WalkStarted { npc: id, target });
        }
    }

    fn find_partner(
        &self,
        table: &EntityTable,
        snapshot: &[Presence],
        taken: &HashSet<EntityId>,
        id: EntityId,
        room: &RoomId,
        pos: Vec2,
    ) -> Option<EntityId> {
        snapshot
            .iter()
            .filter(|c| {
                c.id != id
                    && c.ready
                    && !taken.contains(&c.id)
                    && c.room == *room
                    && c.position.distance(pos) <= self.cfg.chat_radius
            })
            // the snapshot may be stale for agents already processed this tick
            .find(|c| {
                table.get(c.id).is_some_and(|e| {
                    e.room == *room && e.as_npc().is_some_and(|a| a.is_idle() && a.chat_cooldown <= 0.0)
                })
            })
            .map(|c| c.id)
    }

    fn pick_target(&mut self, rooms: &RoomManager, room: &RoomId, pos: Vec2, radius: f32) -> Option<Vec2> {
        if let Some(desc) = rooms.descriptor(room) {
            let portals: Vec<Vec2> = desc
                .portals
                .iter()
                .filter(|p| p.npc_crossable)
                .map(|p| p.position)
                .collect();
            if !portals.is_empty() && self.rng.random_bool(self.cfg.portal_target_probability as f64) {
                return Some(portals[self.rng.random_range(0..portals.len())]);
            }
        }

        let geom = rooms.geometry(room);
        let (min, max) = geom
            .and_then(RoomGeometry::sample_extent)
            .unwrap_or((pos - Vec2::splat(OPEN_ROOM_WANDER), pos + Vec2::splat(OPEN_ROOM_WANDER)));
        let margin = radius + self.cfg.obstacle_margin;
        for _ in 0..self.cfg.target_retries {
            let p = Vec2::new(
                self.rng.random_range(min.x..=max.x),
                self.rng.random_range(min.y..=max.y),
            );
            if geom.is_none_or(|g| g.allows_point(p, margin)) {
                return Some(p);
            }
        }
        None
    }

    // --- Walk ----------------------------------------------------------------

    /// One walking step. Returns true while the agent is still walking.
    #[allow(clippy::too_many_arguments)]
    fn tick_walk(
        &mut self,
        entity: &mut Entity,
        geom: Option<&RoomGeometry>,
        target: Vec2,
        started_at: f64,
        now: f64,
        dt: f32,
        events: &mut Vec<NpcEvent>,
    ) -> bool {
        let id = entity.id;
        let EntityKind::Npc(agent) = &mut entity.kind else {
            return false;
        };

        let end = |agent: &mut NpcAgent, timer: f32, reason: WalkEnd, events: &mut Vec<NpcEvent>| {
            agent.state = NpcState::Idle;
            agent.stuck_count = 0;
            agent.action_timer = timer;
            events.push(NpcEvent::WalkEnded { npc: id, reason });
        };

        if now - started_at > self.cfg.max_walk_seconds as f64 {
            end(agent, self.draw_interval(), WalkEnd::TimedOut, events);
            return false;
        }

        let pos = planar(entity.position);
        let to_target = target - pos;
        if to_target.length() <= self.cfg.arrive_radius {
            end(agent, self.draw_interval(), WalkEnd::Arrived, events);
            return false;
        }

        let max_turn = self.cfg.turn_rate * dt;
        let turn = wrap_angle(yaw_of(to_target) - entity.rotation).clamp(-max_turn, max_turn);
        entity.rotation = wrap_angle(entity.rotation + turn);

        let step = facing(entity.rotation) * self.walk_speed * dt;
        let candidate = with_planar(entity.position, pos + step);
        let res = resolve(geom, entity.position, candidate, agent.radius);
        let progress = planar(res.position).distance(pos);
        entity.position = res.position;
        if !res.blocked && progress >= step.length() * MIN_PROGRESS {
            return true;
        }

        agent.stuck_count += 1;
        if agent.stuck_count > self.cfg.stuck_threshold {
            log::debug!("npc {id} abandoned its walk after {} blocked steps", agent.stuck_count);
            end(agent, self.draw_interval(), WalkEnd::Stuck, events);
            return false;
        }

        // Slide off the obstacle: wide random turn, new target along it.
        let (lo, hi) = self.cfg.wide_turn;
        let mut swing = self.rng.random_range(lo..=hi);
        if self.rng.random_bool(0.5) {
            swing = -swing;
        }
        entity.rotation = wrap_angle(entity.rotation + swing);
        agent.state = NpcState::Walk {
            target: planar(entity.position) + facing(entity.rotation) * self.cfg.retarget_distance,
            started_at,
        };
        true
    }

    // --- Portals -------------------------------------------------------------

    /// Roll for crossing when standing in a portal's capture zone.
    fn maybe_cross(&mut self, entity: &mut Entity, rooms: &RoomManager, events: &mut Vec<NpcEvent>) -> bool {
        let Some(desc) = rooms.descriptor(&entity.room) else {
            return false;
        };
        let pos = planar(entity.position);
        let Some(portal) = desc
            .portals
            .iter()
            .find(|p| p.npc_crossable && p.position.distance(pos) <= p.capture_radius)
        else {
            return false;
        };
        let Some(dest) = rooms.descriptor(&portal.destination) else {
            return false;
        };
        if !self.rng.random_bool(self.cfg.cross_probability as f64) {
            return false;
        }
        let Some(entry) = rooms.entry_point(&entity.room, portal) else {
            return false;
        };

        let mut spot = planar(entry) + self.disk_sample(self.cfg.arrival_jitter);
        // Do not land inside a capture zone on the far side.
        for p in dest.portals.iter().filter(|p| p.npc_crossable) {
            let away = spot - p.position;
            if away.length() <= p.capture_radius {
                let dir = away.try_normalize().unwrap_or(Vec2::Y);
                spot = p.position + dir * (p.capture_radius + PORTAL_CLEARANCE);
            }
        }

        let to = portal.destination.clone();
        let from = std::mem::replace(&mut entity.room, to.clone());
        entity.position = Vec3::new(spot.x, entry.y, spot.y);
        let timer = self.draw_interval();
        if let Some(agent) = entity.as_npc_mut() {
            agent.state = NpcState::Idle;
            agent.stuck_count = 0;
            agent.action_timer = timer;
        }
        log::debug!("npc {} crossed from {from} to {to}", entity.id);
        events.push(NpcEvent::CrossedRoom { npc: entity.id, from, to });
        true
    }

    // --- Conversations -------------------------------------------------------

    fn start_session(
        &mut self,
        table: &mut EntityTable,
        first: EntityId,
        second: EntityId,
        room: RoomId,
        now: f64,
        events: &mut Vec<NpcEvent>,
    ) {
        let Some((a, b)) = table.pair_mut(first, second) else {
            return;
        };
        let session = SessionId(self.next_session);
        self.next_session += 1;
        let script = self.rng.random_range(0..SCRIPTS.len());

        let (pa, pb) = (planar(a.position), planar(b.position));
        lock_into_session(a, pb, session);
        lock_into_session(b, pa, session);
        let opening = SCRIPTS[script][0];
        a.ephemeral.chat = Some(bubble(opening, now));

        log::debug!("npcs {first} and {second} started conversation {} in {room}", session.0);
        self.sessions.insert(
            session,
            ConversationSession {
                members: [first, second],
                room,
                script,
                speaker: 0,
                cursor: 0,
                line_started_at: now,
            },
        );
        events.push(NpcEvent::Paired { session, members: [first, second] });
        events.push(NpcEvent::Line { session, speaker: first, text: opening });
    }

    /// End every session whose members are gone, no longer chatting in it, or
    /// no longer share its room. Both sides are released together.
    fn validate_sessions(&mut self, table: &mut EntityTable, events: &mut Vec<NpcEvent>) {
        let broken: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(sid, s)| !session_intact(table, **sid, s))
            .map(|(sid, _)| *sid)
            .collect();
        for sid in broken {
            let Some(s) = self.sessions.remove(&sid) else {
                continue;
            };
            for m in s.members {
                let timer = self.draw_interval();
                if let Some(e) = table.get_mut(m) {
                    release(e, sid, self.cfg.chat_cooldown, timer);
                }
            }
            log::debug!("conversation {} ended early: a member left", sid.0);
            events.push(NpcEvent::ConversationEnded {
                session: sid,
                members: s.members,
                reason: ConversationEnd::PartnerLeft,
            });
        }
    }

    fn advance_sessions(&mut self, table: &mut EntityTable, now: f64, events: &mut Vec<NpcEvent>) {
        let line_seconds = self.cfg.line_seconds as f64;
        let due: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| now - s.line_started_at >= line_seconds)
            .map(|(sid, _)| *sid)
            .collect();

        for sid in due {
            let Some(s) = self.sessions.get_mut(&sid) else {
                continue;
            };
            let previous = s.speaker_id();
            s.cursor += 1;
            s.speaker ^= 1;
            s.line_started_at = now;
            let lines = s.lines();
            let (cursor, speaker, members) = (s.cursor, s.speaker_id(), s.members);

            if let Some(e) = table.get_mut(previous) {
                e.ephemeral.chat = None;
            }

            if cursor + 1 < lines.len() {
                if let Some(e) = table.get_mut(speaker) {
                    e.ephemeral.chat = Some(bubble(lines[cursor], now));
                }
                events.push(NpcEvent::Line { session: sid, speaker, text: lines[cursor] });
                continue;
            }

            // Closing beat: both laugh and go idle together.
            self.sessions.remove(&sid);
            let closing = lines[lines.len() - 1];
            for m in members {
                let timer = self.cfg.laugh_seconds + self.draw_interval();
                if let Some(e) = table.get_mut(m) {
                    release(e, sid, self.cfg.post_chat_cooldown, timer);
                    e.ephemeral.emote = Some(ActiveEmote { kind: EmoteKind::Laugh, started_at: now });
                    e.ephemeral.chat = Some(bubble(closing, now));
                }
            }
            log::debug!("conversation {} completed", sid.0);
            events.push(NpcEvent::ConversationEnded {
                session: sid,
                members,
                reason: ConversationEnd::Completed,
            });
        }
    }

    // --- Randomness ------------------------------------------------------------

    fn draw_interval(&mut self) -> f32 {
        let (lo, hi) = self.cfg.action_interval;
        self.rng.random_range(lo..=hi)
    }

    fn disk_sample(&mut self, radius: f32) -> Vec2 {
        if radius <= 0.0 {
            return Vec2::ZERO;
        }
        let angle = self.rng.random_range(0.0..std::f32::consts::TAU);
        let r = radius * self.rng.random::<f32>().sqrt();
        facing(angle) * r
    }
}

fn session_intact(table: &EntityTable, sid: SessionId, s: &ConversationSession) -> bool {
    s.members.iter().all(|m| {
        table.get(*m).is_some_and(|e| {
            e.room == s.room && e.as_npc().and_then(NpcAgent::session) == Some(sid)
        })
    })
}

fn lock_into_session(e: &mut Entity, partner: Vec2, session: SessionId) {
    let to_partner = partner - planar(e.position);
    if to_partner.length_squared() > 0.0 {
        e.rotation = yaw_of(to_partner);
    }
    if let Some(agent) = e.as_npc_mut() {
        agent.state = NpcState::Chatting { session };
        agent.stuck_count = 0;
    }
}

/// Return a member of `sid` to idle. Agents that already left the session are untouched.
fn release(e: &mut Entity, sid: SessionId, cooldown: f32, timer: f32) {
    let Some(agent) = e.as_npc_mut() else {
        return;
    };
    if agent.session() != Some(sid) {
        return;
    }
    agent.state = NpcState::Idle;
    agent.chat_cooldown = cooldown;
    agent.action_timer = timer;
    e.ephemeral.chat = None;
}

fn bubble(text: &str, now: f64) -> ChatBubble {
    ChatBubble { text: text.to_owned(), posted_at: now, away: false }
}
