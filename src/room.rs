//! Room Manager: room descriptors, the single active room, portal/seat
//! proximity polling and seat snapping.

use std::collections::HashMap;
use std::sync::Arc;

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::api::GeometryProvider;
use crate::catalog::{Collider, ColliderCatalog, RoomGeometry};
use crate::error::{SimError, SimResult};
use crate::types::{BodyKind, InteractionPrompt, RoomId, planar, rotate_local};

fn default_capture_radius() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_interact_radius() -> f32 {
    1.5
}

/// A doorway into another room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Portal {
    pub position: Vec2,
    /// Planar distance at which the avatar is offered the transition.
    pub trigger_radius: f32,
    pub destination: RoomId,
    /// Where to appear in the destination; its default spawn otherwise.
    #[serde(default)]
    pub arrival: Option<Vec3>,
    /// Zone in which NPCs may randomly step through.
    #[serde(default = "default_capture_radius")]
    pub capture_radius: f32,
    #[serde(default = "default_true")]
    pub npc_crossable: bool,
}

/// A bench, chair or ledge with one or more sitting points.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Seat {
    pub anchor: Vec3,
    pub yaw: f32,
    /// Sitting points in the seat's local frame (x right, z forward).
    pub offsets: Vec<Vec3>,
    #[serde(default = "default_interact_radius")]
    pub interact_radius: f32,
}

/// Spawn point of a kickable prop.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct PropSpawn {
    pub position: Vec2,
    pub radius: f32,
}

/// Static definition of one room.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomDescriptor {
    pub id: RoomId,
    #[serde(default)]
    pub colliders: Vec<Collider>,
    #[serde(default)]
    pub spawn_points: Vec<Vec3>,
    #[serde(default)]
    pub portals: Vec<Portal>,
    #[serde(default)]
    pub seats: Vec<Seat>,
    #[serde(default)]
    pub props: Vec<PropSpawn>,
}

impl RoomDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: RoomId::new(id),
            colliders: Vec::new(),
            spawn_points: Vec::new(),
            portals: Vec::new(),
            seats: Vec::new(),
            props: Vec::new(),
        }
    }

    pub fn default_spawn(&self) -> Vec3 {
        self.spawn_points.first().copied().unwrap_or(Vec3::ZERO)
    }

    pub fn geometry(&self) -> RoomGeometry {
        RoomGeometry::from_colliders(self.colliders.iter().cloned())
    }
}

/// Hit radii handed out by [`StaticGeometry`].
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HitRadii {
    pub avatar: f32,
    pub npc: f32,
    pub companion: f32,
    pub prop: f32,
}

impl Default for HitRadii {
    fn default() -> Self {
        Self {
            avatar: 0.4,
            npc: 0.4,
            companion: 0.25,
            prop: 0.35,
        }
    }
}

/// Geometry provider backed by plain data, typically loaded from JSON.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StaticGeometry {
    #[serde(default)]
    pub radii: HitRadii,
    pub rooms: Vec<RoomDescriptor>,
}

impl StaticGeometry {
    pub fn new(rooms: Vec<RoomDescriptor>) -> Self {
        Self { radii: HitRadii::default(), rooms }
    }

    pub fn from_json_str(s: &str) -> SimResult<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

impl GeometryProvider for StaticGeometry {
    fn hit_radius(&self, body: BodyKind) -> f32 {
        match body {
            BodyKind::Avatar => self.radii.avatar,
            BodyKind::Npc => self.radii.npc,
            BodyKind::Companion => self.radii.companion,
            BodyKind::Prop => self.radii.prop,
        }
    }

    fn room_descriptors(&self) -> Vec<RoomDescriptor> {
        self.rooms.clone()
    }
}

/// Result of snapping onto a seat.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SeatPlacement {
    pub position: Vec3,
    pub yaw: f32,
    /// Index of the chosen offset point.
    pub point: usize,
}

/// Pick the seat offset nearest to `from` and return its world placement.
/// `None` when the seat has no sitting points.
pub fn seat_snap(anchor: Vec3, yaw: f32, offsets: &[Vec3], from: Vec2) -> Option<SeatPlacement> {
    offsets
        .iter()
        .enumerate()
        .map(|(i, off)| (i, anchor + rotate_local(*off, yaw)))
        .min_by(|a, b| {
            let da = planar(a.1).distance_squared(from);
            let db = planar(b.1).distance_squared(from);
            da.total_cmp(&db)
        })
        .map(|(point, position)| SeatPlacement { position, yaw, point })
}

/// The room currently simulated for the local player.
#[derive(Clone, Debug)]
pub struct ActiveRoom {
    pub id: RoomId,
    pub geometry: Arc<RoomGeometry>,
}

pub struct RoomManager {
    descriptors: HashMap<RoomId, RoomDescriptor>,
    catalog: ColliderCatalog,
    active: ActiveRoom,
    poll_interval: f32,
    poll_timer: f32,
    prompt: Option<InteractionPrompt>,
}

impl RoomManager {
    /// Build the catalog for every descriptor and activate `start`.
    pub fn new(descriptors: Vec<RoomDescriptor>, start: &RoomId, poll_interval: f32) -> SimResult<Self> {
        let mut catalog = ColliderCatalog::new();
        let mut by_id = HashMap::new();
        for d in descriptors {
            if by_id.contains_key(&d.id) {
                log::warn!("duplicate room descriptor {}; keeping the first", d.id);
                continue;
            }
            catalog.insert(d.id.clone(), d.geometry());
            by_id.insert(d.id.clone(), d);
        }
        let geometry = catalog
            .shared(start)
            .ok_or_else(|| SimError::UnknownRoom(start.clone()))?;
        log::info!("room manager ready: {} rooms, starting in {start}", catalog.len());
        Ok(Self {
            descriptors: by_id,
            catalog,
            active: ActiveRoom { id: start.clone(), geometry },
            poll_interval,
            poll_timer: 0.0,
            prompt: None,
        })
    }

    /// Swap the active room. Returns where the local avatar should stand:
    /// `spawn_override` if given, the room's default spawn otherwise.
    /// Unknown rooms are refused and nothing changes.
    pub fn enter_room(&mut self, id: &RoomId, spawn_override: Option<Vec3>) -> SimResult<Vec3> {
        let (Some(desc), Some(geometry)) = (self.descriptors.get(id), self.catalog.shared(id)) else {
            log::warn!("refusing transition from {} to unknown room {id}", self.active.id);
            return Err(SimError::UnknownRoom(id.clone()));
        };
        let spawn = spawn_override.unwrap_or_else(|| desc.default_spawn());
        log::info!("entering room {id} from {} at {spawn}", self.active.id);
        self.active = ActiveRoom { id: id.clone(), geometry };
        self.prompt = None;
        self.poll_timer = 0.0;
        Ok(spawn)
    }

    /// Proximity poll on the low-frequency cadence. Between polls the previous
    /// prompt is kept. Seats are skipped when `allow_seats` is false (already seated).
    pub fn poll_interactables(&mut self, pos: Vec2, dt: f32, allow_seats: bool) -> Option<&InteractionPrompt> {
        self.poll_timer -= dt;
        if self.poll_timer > 0.0 {
            return self.prompt.as_ref();
        }
        self.poll_timer = self.poll_interval;
        self.prompt = self.nearest_interactable(pos, allow_seats);
        self.prompt.as_ref()
    }

    fn nearest_interactable(&self, pos: Vec2, allow_seats: bool) -> Option<InteractionPrompt> {
        let desc = self.active_descriptor()?;
        let portals = desc.portals.iter().enumerate().filter_map(|(index, p)| {
            let distance = p.position.distance(pos);
            (distance <= p.trigger_radius).then(|| InteractionPrompt::Portal {
                index,
                destination: p.destination.clone(),
                distance,
            })
        });
        let seats = desc
            .seats
            .iter()
            .enumerate()
            .filter(|_| allow_seats)
            .filter_map(|(index, s)| {
                let distance = planar(s.anchor).distance(pos);
                (distance <= s.interact_radius).then_some(InteractionPrompt::Seat { index, distance })
            });
        portals
            .chain(seats)
            .min_by(|a, b| a.distance().total_cmp(&b.distance()))
    }

    pub fn prompt(&self) -> Option<&InteractionPrompt> {
        self.prompt.as_ref()
    }

    pub fn clear_prompt(&mut self) {
        self.prompt = None;
    }

    pub fn active(&self) -> &ActiveRoom {
        &self.active
    }

    pub fn active_id(&self) -> &RoomId {
        &self.active.id
    }

    pub fn active_descriptor(&self) -> Option<&RoomDescriptor> {
        self.descriptors.get(&self.active.id)
    }

    pub fn descriptor(&self, id: &RoomId) -> Option<&RoomDescriptor> {
        self.descriptors.get(id)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &RoomDescriptor> {
        self.descriptors.values()
    }

    pub fn catalog(&self) -> &ColliderCatalog {
        &self.catalog
    }

    /// Geometry for any known room (NPCs walk in rooms other than the active one).
    pub fn geometry(&self, id: &RoomId) -> Option<&RoomGeometry> {
        self.catalog.geometry(id)
    }

    /// Visibility is room membership, nothing else.
    pub fn is_visible(&self, room: &RoomId) -> bool {
        *room == self.active.id
    }

    /// Where an entity coming through `portal` from `from` should appear:
    /// the portal's explicit arrival, else the matching return portal in the
    /// destination, else the destination's default spawn.
    pub fn entry_point(&self, from: &RoomId, portal: &Portal) -> Option<Vec3> {
        if let Some(arrival) = portal.arrival {
            return Some(arrival);
        }
        let dest = self.descriptors.get(&portal.destination)?;
        Some(
            dest.portals
                .iter()
                .find(|p| p.destination == *from)
                .map(|p| Vec3::new(p.position.x, 0.0, p.position.y))
                .unwrap_or_else(|| dest.default_spawn()),
        )
    }
}
