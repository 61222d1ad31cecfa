//! Contiguous entity table.
//!
//! Every animate thing is an [`Entity`]: the shared fields live on the struct,
//! per-kind state lives in the [`EntityKind`] variant and each subsystem
//! matches on the variants it owns.

use std::collections::HashMap;

use glam::{Vec2, Vec3};

use crate::error::{SimError, SimResult};
use crate::net::RemoteAvatar;
use crate::npc::NpcAgent;
use crate::types::{AnimState, Ephemeral, EntityId, InputSample, RoomId, SeatRef};

/// The player-controlled avatar on this machine.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalAvatar {
    pub grounded: bool,
    pub input: InputSample,
    /// Planar velocity applied this tick (units/s), kept for kicks.
    pub planar_velocity: Vec2,
    pub radius: f32,
}

impl LocalAvatar {
    pub fn new(radius: f32) -> Self {
        Self {
            grounded: true,
            input: InputSample::default(),
            planar_velocity: Vec2::ZERO,
            radius,
        }
    }
}

/// A small pet that trails its owner. Not collidable.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Companion {
    pub owner: EntityId,
    /// Offset in the owner's local frame.
    pub offset: Vec3,
    /// Planar speed over the last follow step, units/s.
    pub speed: f32,
}

#[derive(Clone, Debug)]
pub enum EntityKind {
    LocalAvatar(LocalAvatar),
    Npc(NpcAgent),
    Remote(RemoteAvatar),
    Companion(Companion),
}

#[derive(Clone, Debug)]
pub struct Entity {
    pub id: EntityId,
    pub room: RoomId,
    /// Feet position, y-up.
    pub position: Vec3,
    /// Yaw, see [`crate::types::facing`].
    pub rotation: f32,
    pub vy: f32,
    pub anim: AnimState,
    pub ephemeral: Ephemeral,
    pub seat: Option<SeatRef>,
    pub kind: EntityKind,
}

impl Entity {
    pub fn new(id: EntityId, room: RoomId, position: Vec3, kind: EntityKind) -> Self {
        Self {
            id,
            room,
            position,
            rotation: 0.0,
            vy: 0.0,
            anim: AnimState::Idle,
            ephemeral: Ephemeral::default(),
            seat: None,
            kind,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EntityKind::LocalAvatar(_) => "local",
            EntityKind::Npc(_) => "npc",
            EntityKind::Remote(_) => "remote",
            EntityKind::Companion(_) => "companion",
        }
    }

    pub fn as_npc(&self) -> Option<&NpcAgent> {
        match &self.kind {
            EntityKind::Npc(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_npc_mut(&mut self) -> Option<&mut NpcAgent> {
        match &mut self.kind {
            EntityKind::Npc(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteAvatar> {
        match &self.kind {
            EntityKind::Remote(r) => Some(r),
            _ => None,
        }
    }
}

/// Dense storage with an id index. Iteration order is insertion order until
/// a removal swaps the last entity into the hole.
#[derive(Clone, Debug, Default)]
pub struct EntityTable {
    entities: Vec<Entity>,
    index: HashMap<EntityId, usize>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: Entity) -> SimResult<()> {
        if self.index.contains_key(&entity.id) {
            return Err(SimError::DuplicateEntity(entity.id));
        }
        self.index.insert(entity.id, self.entities.len());
        self.entities.push(entity);
        Ok(())
    }

    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let slot = self.index.remove(&id)?;
        let removed = self.entities.swap_remove(slot);
        if let Some(moved) = self.entities.get(slot) {
            self.index.insert(moved.id, slot);
        }
        Some(removed)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.index.get(&id).map(|&i| &self.entities[i])
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        let i = *self.index.get(&id)?;
        self.entities.get_mut(i)
    }

    /// Two distinct entities mutably at once.
    pub fn pair_mut(&mut self, a: EntityId, b: EntityId) -> Option<(&mut Entity, &mut Entity)> {
        let ia = *self.index.get(&a)?;
        let ib = *self.index.get(&b)?;
        if ia == ib {
            return None;
        }
        if ia < ib {
            let (lo, hi) = self.entities.split_at_mut(ib);
            Some((&mut lo[ia], &mut hi[0]))
        } else {
            let (lo, hi) = self.entities.split_at_mut(ia);
            Some((&mut hi[0], &mut lo[ib]))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.iter_mut()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id).collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
