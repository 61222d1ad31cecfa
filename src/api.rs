use glam::Vec2;

use crate::net::OutboundState;
use crate::prop::PropEvent;
use crate::room::RoomDescriptor;
use crate::types::*;

/// Primitive intersection tests on the walkable plane.
pub trait NarrowphaseApi {
    // Overlaps --------------------------------------------------------------

    /// Normal pushes `body` away from `other`; zero when the centres coincide.
    fn overlap_circle_circle(body: Vec2, body_r: f32, other: Vec2, other_r: f32) -> Option<Overlap>;

    /// Circle against a centered box; the normal is the smallest-axis push-out.
    fn overlap_circle_aabb(c: Vec2, r: f32, box_c: Vec2, box_h: Vec2) -> Option<Overlap>;

    fn overlap_point_aabb(p: Vec2, c: Vec2, h: Vec2) -> bool;
    fn overlap_point_circle(p: Vec2, c: Vec2, r: f32) -> bool;

    // Containment -----------------------------------------------------------

    /// Keep a circle of radius `r` inside a bounding circle. Returns the
    /// projection back onto the boundary when it pokes out.
    fn contain_in_circle(p: Vec2, r: f32, center: Vec2, bound_r: f32) -> Option<Overlap>;

    // Response --------------------------------------------------------------

    /// Mirror `v` about the surface with normal `n` and scale by `restitution`.
    /// Velocities already leaving the surface are returned unchanged.
    fn reflect(v: Vec2, n: Vec2, restitution: f32) -> Vec2;
}

/// Static geometry collaborator: hit radii and room definitions.
///
/// The simulation only consumes these values; it never derives them.
pub trait GeometryProvider {
    fn hit_radius(&self, body: BodyKind) -> f32;
    fn room_descriptors(&self) -> Vec<RoomDescriptor>;
}

/// Outbound half of the network transport. Framing is the implementor's business.
pub trait StatePublisher {
    /// Publish the local avatar's throttled state.
    fn publish_local(&mut self, state: &OutboundState);

    /// Publish a velocity-changing prop event (kick or bounce).
    fn publish_prop(&mut self, event: &PropEvent);
}
