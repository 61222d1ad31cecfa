//! Simulation Tick Driver.
//!
//! [`Simulation::tick`] is the only per-frame entry point. Each phase owns its
//! slice of entity state for the duration of the phase; phases run in a fixed
//! order and nothing inside a tick blocks or fails.

use std::time::Instant;

use glam::{Vec2, Vec3};

use crate::api::{GeometryProvider, StatePublisher};
use crate::config::SimConfig;
use crate::entity::{Companion, Entity, EntityKind, EntityTable, LocalAvatar};
use crate::error::{SimError, SimResult};
use crate::movement::{Integrator, Vertical, advance};
use crate::net::{ChatLine, EphemeralUpdate, OutboundThrottle, Reconciler, RosterFeed, approach};
use crate::npc::{NpcEngine, NpcEvent, NpcState};
use crate::prop::{Kicker, PropEvent, PropPhysics};
use crate::resolver::resolve;
use crate::room::{RoomManager, seat_snap};
use crate::types::*;

/// Planar speed below which an entity animates as standing still.
const WALK_ANIM_SPEED: f32 = 0.1;

/// Everything one tick produced.
#[derive(Clone, Debug)]
pub struct TickReport {
    pub tick: u64,
    /// Nearest interactable (portal or seat), if any.
    pub prompt: Option<InteractionPrompt>,
    pub npc_events: Vec<NpcEvent>,
    pub prop_events: Vec<PropEvent>,
    pub joined: Vec<EntityId>,
    pub left: Vec<EntityId>,
    pub stats: TickStats,
    pub timing: Option<TickTiming>,
}

#[derive(Copy, Clone, Debug)]
struct Radii {
    avatar: f32,
    npc: f32,
    companion: f32,
}

pub struct Simulation {
    cfg: SimConfig,
    integrator: Integrator,
    rooms: RoomManager,
    entities: EntityTable,
    npcs: NpcEngine,
    props: PropPhysics,
    throttle: OutboundThrottle,
    reconciler: Reconciler,
    publisher: Box<dyn StatePublisher>,
    feed: RosterFeed,
    local: EntityId,
    companion: Option<EntityId>,
    radii: Radii,
    match_active: bool,
    clock: f64,
    tick: u64,
    last_timing: Option<TickTiming>,
}

fn elapsed_ms(t: Option<Instant>) -> f64 {
    t.map_or(0.0, |t| t.elapsed().as_secs_f64() * 1000.0)
}

impl Simulation {
    /// Build the world, spawn the local avatar at `start_room`'s default spawn
    /// and activate that room's props.
    pub fn new(
        cfg: SimConfig,
        geometry: &dyn GeometryProvider,
        start_room: &RoomId,
        local: EntityId,
        publisher: Box<dyn StatePublisher>,
        feed: RosterFeed,
    ) -> SimResult<Self> {
        cfg.validate()?;
        let rooms = RoomManager::new(geometry.room_descriptors(), start_room, cfg.room.poll_interval)?;
        let radii = Radii {
            avatar: geometry.hit_radius(BodyKind::Avatar),
            npc: geometry.hit_radius(BodyKind::Npc),
            companion: geometry.hit_radius(BodyKind::Companion),
        };

        let mut props = PropPhysics::new(cfg.prop.clone());
        let mut spawn = Vec3::ZERO;
        if let Some(desc) = rooms.active_descriptor() {
            props.activate(desc);
            spawn = desc.default_spawn();
        }

        let mut entities = EntityTable::new();
        entities.insert(Entity::new(
            local,
            start_room.clone(),
            spawn,
            EntityKind::LocalAvatar(LocalAvatar::new(radii.avatar)),
        ))?;

        let mut throttle = OutboundThrottle::new(&cfg.net);
        throttle.force_send();

        log::info!("simulation ready: local avatar {local} in {start_room} at {spawn}");
        Ok(Self {
            integrator: Integrator::new(cfg.movement.clone()),
            npcs: NpcEngine::new(cfg.npc.clone(), cfg.movement.walk_speed, cfg.seed),
            reconciler: Reconciler::new(cfg.net.clone()),
            cfg,
            rooms,
            entities,
            props,
            throttle,
            publisher,
            feed,
            local,
            companion: None,
            radii,
            match_active: false,
            clock: 0.0,
            tick: 0,
            last_timing: None,
        })
    }

    /// Advance the world by `dt` seconds.
    pub fn tick(&mut self, input: &InputSample, dt: f32) -> TickReport {
        let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
        let timed = self.cfg.enable_timing;
        let stamp = || if timed { Some(Instant::now()) } else { None };
        let t_all = stamp();
        let mut timing = TickTiming::default();

        self.clock += dt as f64;
        self.tick += 1;
        let mut published = 0;

        // 1-2. Input sampling, local integration and collision.
        let t0 = stamp();
        let input = if self.match_active { InputSample::default() } else { *input };
        self.step_local(&input, dt);
        self.follow_companion(dt);
        let (pos, seated) = (planar(self.local_position()), self.local_seat().is_some());
        self.rooms.poll_interactables(pos, dt, !seated);
        timing.local_ms = elapsed_ms(t0);

        // 3. NPCs.
        let t0 = stamp();
        let npc_events = self.npcs.tick(&mut self.entities, &self.rooms, self.clock, dt);
        timing.npc_ms = elapsed_ms(t0);

        // 4. Props.
        let t0 = stamp();
        let kicker = self.kicker();
        let prop_events = self.props.tick(Some(self.rooms.active().geometry.as_ref()), kicker, dt);
        for e in &prop_events {
            self.publisher.publish_prop(e);
            published += 1;
        }
        timing.prop_ms = elapsed_ms(t0);

        // 5. Outbound.
        let t0 = stamp();
        if self.publish_local(dt) {
            published += 1;
        }
        timing.outbound_ms = elapsed_ms(t0);

        // 6. Inbound.
        let t0 = stamp();
        let updates = self.feed.drain();
        let outcome = self.reconciler.apply(&mut self.entities, updates, self.clock);
        for (room, prop, position, velocity) in &outcome.prop_syncs {
            self.props.apply_sync(room, *prop, *position, *velocity);
        }
        self.reconciler.smooth(&mut self.entities, dt);
        self.reconciler.expire(&mut self.entities, self.clock);
        timing.inbound_ms = elapsed_ms(t0);

        // 7. Derived animation.
        let t0 = stamp();
        for e in self.entities.iter_mut() {
            e.anim = derive_anim(e);
        }
        timing.anim_ms = elapsed_ms(t0);

        let stats = self.stats(outcome.applied, published);
        timing.total_ms = elapsed_ms(t_all);
        self.last_timing = timed.then_some(timing);

        TickReport {
            tick: self.tick,
            prompt: self.rooms.prompt().cloned(),
            npc_events,
            prop_events,
            joined: outcome.joined,
            left: outcome.left,
            stats,
            timing: self.last_timing,
        }
    }

    fn step_local(&mut self, input: &InputSample, dt: f32) {
        let deadzone = self.cfg.movement.analog_deadzone;
        let geom = self.rooms.active().geometry.clone();
        let Some(e) = self.entities.get_mut(self.local) else {
            return;
        };
        let EntityKind::LocalAvatar(avatar) = &mut e.kind else {
            return;
        };
        avatar.input = *input;

        let moving = input.has_movement(deadzone);
        let mut ephemeral_changed = false;
        if moving && e.seat.take().is_some() {
            ephemeral_changed = true;
        }
        if moving && e.ephemeral.emote.take().is_some() {
            ephemeral_changed = true;
        }
        if e.seat.is_some() {
            avatar.planar_velocity = Vec2::ZERO;
            return;
        }
        let suppressed = e.ephemeral.emote.is_some() || self.match_active;

        let intent = self.integrator.planar_intent(input, e.rotation, dt);
        let mut v = Vertical { vy: e.vy, grounded: avatar.grounded };
        self.integrator.step_vertical(&mut v, input.jump, suppressed, dt);

        let candidate = advance(e.position, intent.velocity, v.vy, dt);
        let res = resolve(Some(geom.as_ref()), e.position, candidate, avatar.radius);
        if res.landed && v.vy <= 0.0 {
            v.vy = 0.0;
            v.grounded = true;
        } else {
            v.grounded = false;
        }

        avatar.planar_velocity = if dt > 0.0 {
            (planar(res.position) - planar(e.position)) / dt
        } else {
            Vec2::ZERO
        };
        avatar.grounded = v.grounded;
        e.vy = v.vy;
        e.position = res.position;
        e.rotation = intent.yaw;

        if ephemeral_changed {
            let update = ephemeral_update(e);
            self.throttle.queue_ephemeral(update);
        }
    }

    fn follow_companion(&mut self, dt: f32) {
        let Some(cid) = self.companion else {
            return;
        };
        let Some(owner) = self.entities.get(self.local) else {
            return;
        };
        let (room, pos, yaw) = (owner.room.clone(), owner.position, owner.rotation);
        let alpha = 1.0 - (-self.cfg.net.smoothing_rate * dt).exp();
        let eps = self.cfg.net.snap_epsilon;
        let Some(c) = self.entities.get_mut(cid) else {
            return;
        };
        let EntityKind::Companion(comp) = &mut c.kind else {
            return;
        };
        let target = pos + rotate_local(comp.offset, yaw);
        let before = planar(c.position);
        if c.room != room {
            c.room = room;
            c.position = target;
        } else {
            c.position = approach(c.position, target, alpha, eps);
        }
        comp.speed = if dt > 0.0 { planar(c.position).distance(before) / dt } else { 0.0 };
        c.rotation = yaw;
    }

    fn kicker(&self) -> Option<Kicker> {
        let e = self.entities.get(self.local)?;
        let EntityKind::LocalAvatar(a) = &e.kind else {
            return None;
        };
        if e.seat.is_some() || !self.rooms.is_visible(&e.room) {
            return None;
        }
        Some(Kicker { position: planar(e.position), velocity: a.planar_velocity, radius: a.radius })
    }

    /// Expire local ephemerals, then offer a sample to the throttle.
    fn publish_local(&mut self, dt: f32) -> bool {
        let companion_offset = self.companion_offset();
        let Some(e) = self.entities.get_mut(self.local) else {
            return false;
        };
        if e.ephemeral.expire(self.clock, self.cfg.net.emote_ttl, self.cfg.net.chat_ttl) {
            self.throttle.queue_ephemeral(ephemeral_update(e));
        }
        let timestamp_ms = (self.clock * 1000.0) as u64;
        let Some(state) =
            self.throttle
                .sample(dt, e.id, &e.room, e.position, e.rotation, companion_offset, timestamp_ms)
        else {
            return false;
        };
        self.publisher.publish_local(&state);
        true
    }

    fn companion_offset(&self) -> Option<Vec3> {
        let c = self.entities.get(self.companion?)?;
        let owner = self.entities.get(self.local)?;
        Some(c.position - owner.position)
    }

    fn stats(&self, updates_applied: usize, messages_published: usize) -> TickStats {
        let mut s = TickStats {
            entities: self.entities.len(),
            sessions: self.npcs.session_count(),
            props: self.props.len(),
            updates_applied,
            messages_published,
            ..TickStats::default()
        };
        for e in self.entities.iter() {
            if self.rooms.is_visible(&e.room) {
                s.visible += 1;
            }
            match e.as_npc().map(|a| a.state) {
                Some(NpcState::Walk { .. }) => s.npcs_walking += 1,
                Some(NpcState::Chatting { .. }) => s.npcs_chatting += 1,
                _ => {}
            }
        }
        s
    }

    // --- Room and interaction ---------------------------------------------------

    /// Move the local avatar (and its companion) into `room`. Unknown rooms are
    /// refused and leave everything as it was.
    pub fn enter_room(&mut self, room: &RoomId, spawn_override: Option<Vec3>) -> SimResult<()> {
        let spawn = self.rooms.enter_room(room, spawn_override)?;
        if let Some(desc) = self.rooms.active_descriptor() {
            self.props.activate(desc);
        }
        let e = self
            .entities
            .get_mut(self.local)
            .ok_or(SimError::UnknownEntity(self.local))?;
        e.room = room.clone();
        e.position = spawn;
        e.vy = 0.0;
        e.seat = None;
        if let EntityKind::LocalAvatar(a) = &mut e.kind {
            a.grounded = true;
            a.planar_velocity = Vec2::ZERO;
        }
        let (yaw, update) = (e.rotation, ephemeral_update(e));
        if let Some(c) = self.companion.and_then(|id| self.entities.get_mut(id)) {
            c.room = room.clone();
            if let EntityKind::Companion(comp) = &c.kind {
                c.position = spawn + rotate_local(comp.offset, yaw);
            }
        }
        self.throttle.queue_ephemeral(update);
        self.throttle.force_send();
        Ok(())
    }

    /// Act on the current prompt: go through the portal or sit on the seat.
    pub fn confirm_interaction(&mut self) -> SimResult<()> {
        let prompt = self.rooms.prompt().cloned().ok_or(SimError::NothingToConfirm)?;
        match prompt {
            InteractionPrompt::Portal { index, destination, .. } => {
                let from = self.rooms.active_id().clone();
                let arrival = self
                    .rooms
                    .active_descriptor()
                    .and_then(|d| d.portals.get(index))
                    .and_then(|p| self.rooms.entry_point(&from, p));
                self.enter_room(&destination, arrival)
            }
            InteractionPrompt::Seat { index, .. } => {
                let seat = self
                    .rooms
                    .active_descriptor()
                    .and_then(|d| d.seats.get(index))
                    .cloned()
                    .ok_or(SimError::NothingToConfirm)?;
                let e = self
                    .entities
                    .get_mut(self.local)
                    .ok_or(SimError::UnknownEntity(self.local))?;
                let placement = seat_snap(seat.anchor, seat.yaw, &seat.offsets, planar(e.position))
                    .ok_or(SimError::NothingToConfirm)?;
                e.position = placement.position;
                e.rotation = placement.yaw;
                e.vy = 0.0;
                e.seat = Some(SeatRef { seat: index, point: placement.point });
                e.ephemeral.emote = None;
                if let EntityKind::LocalAvatar(a) = &mut e.kind {
                    a.planar_velocity = Vec2::ZERO;
                    a.grounded = true;
                }
                let update = ephemeral_update(e);
                self.throttle.queue_ephemeral(update);
                self.rooms.clear_prompt();
                log::debug!("local avatar sat on seat {index} point {}", placement.point);
                Ok(())
            }
        }
    }

    /// Leave the seat. Returns false when not seated.
    pub fn stand_up(&mut self) -> bool {
        let Some(e) = self.entities.get_mut(self.local) else {
            return false;
        };
        if e.seat.take().is_none() {
            return false;
        }
        let update = ephemeral_update(e);
        self.throttle.queue_ephemeral(update);
        true
    }

    // --- Local ephemeral actions ------------------------------------------------

    pub fn play_emote(&mut self, kind: EmoteKind) {
        let now = self.clock;
        self.with_local_ephemeral(|e| e.emote = Some(ActiveEmote { kind, started_at: now }));
    }

    pub fn say(&mut self, text: impl Into<String>) {
        let (now, text) = (self.clock, text.into());
        self.with_local_ephemeral(|e| e.chat = Some(ChatBubble { text, posted_at: now, away: false }));
    }

    /// Post a bubble that stays up until [`Simulation::clear_chat`].
    pub fn set_away(&mut self, text: impl Into<String>) {
        let (now, text) = (self.clock, text.into());
        self.with_local_ephemeral(|e| e.chat = Some(ChatBubble { text, posted_at: now, away: true }));
    }

    pub fn clear_chat(&mut self) {
        self.with_local_ephemeral(|e| e.chat = None);
    }

    fn with_local_ephemeral(&mut self, f: impl FnOnce(&mut Ephemeral)) {
        let Some(e) = self.entities.get_mut(self.local) else {
            return;
        };
        f(&mut e.ephemeral);
        let update = ephemeral_update(e);
        self.throttle.queue_ephemeral(update);
    }

    // --- Population ---------------------------------------------------------------

    pub fn spawn_npc(&mut self, id: EntityId, room: &RoomId, position: Vec3) -> SimResult<()> {
        if self.rooms.descriptor(room).is_none() {
            return Err(SimError::UnknownRoom(room.clone()));
        }
        let agent = self.npcs.new_agent(self.radii.npc);
        self.entities
            .insert(Entity::new(id, room.clone(), position, EntityKind::Npc(agent)))?;
        log::debug!("spawned npc {id} in {room}");
        Ok(())
    }

    pub fn despawn_npc(&mut self, id: EntityId) -> SimResult<()> {
        if self.entities.get(id).and_then(Entity::as_npc).is_none() {
            return Err(SimError::UnknownEntity(id));
        }
        self.entities.remove(id);
        Ok(())
    }

    /// Give the local avatar a companion trailing at the configured offset.
    pub fn spawn_companion(&mut self, id: EntityId) -> SimResult<()> {
        let owner = self
            .entities
            .get(self.local)
            .ok_or(SimError::UnknownEntity(self.local))?;
        let offset = self.cfg.net.companion_offset;
        let position = owner.position + rotate_local(offset, owner.rotation);
        let mut e = Entity::new(
            id,
            owner.room.clone(),
            position,
            EntityKind::Companion(Companion { owner: self.local, offset, speed: 0.0 }),
        );
        e.rotation = owner.rotation;
        self.entities.insert(e)?;
        if let Some(old) = self.companion.replace(id) {
            self.entities.remove(old);
        }
        self.throttle.force_send();
        Ok(())
    }

    /// Puts the companion away. Peers drop their copy on the next send.
    pub fn dismiss_companion(&mut self) -> bool {
        let Some(id) = self.companion.take() else {
            return false;
        };
        self.entities.remove(id);
        self.throttle.dismiss_companion();
        true
    }

    // --- Accessors ------------------------------------------------------------------

    /// Entities in the active room, the only ones a renderer should draw.
    pub fn visible_entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter().filter(|e| self.rooms.is_visible(&e.room))
    }

    /// Minigame lock-out: freezes local movement and jumping only.
    pub fn set_match_active(&mut self, active: bool) {
        if self.match_active != active {
            log::debug!("match lock-out {}", if active { "on" } else { "off" });
        }
        self.match_active = active;
    }

    pub fn match_active(&self) -> bool {
        self.match_active
    }

    pub fn local(&self) -> Option<&Entity> {
        self.entities.get(self.local)
    }

    pub fn local_id(&self) -> EntityId {
        self.local
    }

    pub fn companion(&self) -> Option<&Entity> {
        self.entities.get(self.companion?)
    }

    fn local_position(&self) -> Vec3 {
        self.local().map_or(Vec3::ZERO, |e| e.position)
    }

    fn local_seat(&self) -> Option<SeatRef> {
        self.local().and_then(|e| e.seat)
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> &EntityTable {
        &self.entities
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn active_room(&self) -> &RoomId {
        self.rooms.active_id()
    }

    pub fn props(&self) -> &PropPhysics {
        &self.props
    }

    pub fn npcs(&self) -> &NpcEngine {
        &self.npcs
    }

    pub fn prompt(&self) -> Option<&InteractionPrompt> {
        self.rooms.prompt()
    }

    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    /// Per-phase timing of the last tick, when enabled in the config.
    pub fn timing(&self) -> Option<TickTiming> {
        self.last_timing
    }
}

fn ephemeral_update(e: &Entity) -> EphemeralUpdate {
    EphemeralUpdate {
        emote: e.ephemeral.emote.map(|em| em.kind),
        chat: e
            .ephemeral
            .chat
            .as_ref()
            .map(|c| ChatLine { text: c.text.clone(), away: c.away }),
        seated: e.seat.is_some(),
    }
}

fn derive_anim(e: &Entity) -> AnimState {
    let emote = e.ephemeral.emote.map(|em| AnimState::Emote(em.kind));
    match &e.kind {
        EntityKind::LocalAvatar(a) => {
            if e.seat.is_some() {
                AnimState::Sit
            } else if let Some(anim) = emote {
                anim
            } else if !a.grounded {
                AnimState::Airborne
            } else if a.planar_velocity.length() > WALK_ANIM_SPEED {
                AnimState::Walk
            } else {
                AnimState::Idle
            }
        }
        EntityKind::Npc(a) => match (emote, a.state) {
            (Some(anim), _) => anim,
            (None, NpcState::Chatting { .. }) => AnimState::Talk,
            (None, NpcState::Walk { .. }) => AnimState::Walk,
            (None, NpcState::Idle) => AnimState::Idle,
        },
        EntityKind::Remote(r) => {
            if r.seated {
                AnimState::Sit
            } else if let Some(anim) = emote {
                anim
            } else if r.render_speed > WALK_ANIM_SPEED {
                AnimState::Walk
            } else {
                AnimState::Idle
            }
        }
        EntityKind::Companion(c) => {
            if c.speed > WALK_ANIM_SPEED {
                AnimState::Walk
            } else {
                AnimState::Idle
            }
        }
    }
}
