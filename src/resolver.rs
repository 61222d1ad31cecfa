//! Collision Resolver.
//!
//! Turns a candidate position into a legal one for the room it is in. Stages
//! run in a fixed order: room boundary (tiles, buildings, dome), furniture
//! boxes, then the ground plane. Each stage may only raise the landing height.

use glam::{Vec2, Vec3};

use crate::api::NarrowphaseApi;
use crate::catalog::{Boundary, BoxCollider, RoomGeometry};
use crate::narrowphase::Narrowphase;
use crate::types::{planar, with_planar};

/// How far below a box top a foot may be and still count as "on top".
pub const TOP_TOLERANCE: f32 = 0.05;

/// Vertical extent of a walking body; boxes entirely above it do not block.
pub const BODY_HEIGHT: f32 = 1.7;

/// Height of the fallback floor under every room.
pub const GROUND_Y: f32 = 0.0;

/// Box overlaps shallower than this count as touching.
const CONTACT_SLOP: f32 = 1e-4;

/// Outcome of one [`resolve`] call.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Resolution {
    pub position: Vec3,
    /// Horizontal movement was stopped or pushed back by an obstacle.
    pub blocked: bool,
    /// The body ends the tick supported by a surface.
    pub landed: bool,
    /// Height of the supporting surface (meaningful when `landed`).
    pub landing_y: f32,
}

/// Resolve a move from `current` to `candidate` for a body of `radius`.
///
/// `current.y` is the foot height at the start of the tick; a candidate at or
/// below it counts as descending. A missing `geometry` only applies the ground plane.
pub fn resolve(geometry: Option<&RoomGeometry>, current: Vec3, candidate: Vec3, radius: f32) -> Resolution {
    let mut xz = planar(candidate);
    let mut blocked = false;
    let mut landed = false;
    let mut landing_y = f32::NEG_INFINITY;
    let descending = candidate.y <= current.y;

    if let Some(geom) = geometry {
        // 1. Boundary: hard stops for tiles/buildings, projection for domes.
        match contain(geom, xz, radius) {
            Some(p) => xz = p,
            None => {
                xz = planar(current);
                blocked = true;
            }
        }

        // 2. Furniture.
        let mut pushed = false;
        for b in geom.boxes_near(xz, radius) {
            let Some(o) = Narrowphase::overlap_circle_aabb(xz, radius, b.center, b.half_extents) else {
                continue;
            };
            let top = b.top();
            if current.y >= top - TOP_TOLERANCE {
                // Above the box: free to walk; land when coming down through the top.
                if descending && candidate.y <= top {
                    landed = true;
                    landing_y = landing_y.max(top);
                }
            } else if blocks_body(b, current.y, candidate.y) {
                xz = o.contact;
                blocked = true;
                pushed = true;
            }
        }

        // A push-out may not leave the room or end inside other furniture.
        if pushed {
            xz = match contain(geom, xz, radius) {
                Some(p) if !inside_furniture(geom, p, radius, current.y, candidate.y) => p,
                _ => planar(current),
            };
        }
    }

    // 3. Ground plane.
    if candidate.y <= GROUND_Y {
        landed = true;
        landing_y = landing_y.max(GROUND_Y);
    }

    let y = if landed { landing_y } else { candidate.y };
    Resolution {
        position: with_planar(Vec3::new(0.0, y, 0.0), xz),
        blocked,
        landed,
        landing_y: if landed { landing_y } else { GROUND_Y },
    }
}

/// Boundary stage for a planar position: `None` when tiles or buildings refuse
/// it outright, otherwise the position projected inside a dome.
fn contain(geom: &RoomGeometry, xz: Vec2, radius: f32) -> Option<Vec2> {
    if geom.hard_blocks(xz, radius) {
        return None;
    }
    if let Boundary::Circle(dome) = &geom.boundary {
        if let Some(o) = Narrowphase::contain_in_circle(xz, radius, dome.center, dome.radius) {
            return Some(o.contact);
        }
    }
    Some(xz)
}

/// A box the body is beside (not on top of) and vertically overlapping.
fn blocks_body(b: &BoxCollider, current_y: f32, candidate_y: f32) -> bool {
    let top = b.top();
    current_y < top - TOP_TOLERANCE && candidate_y < top && candidate_y + BODY_HEIGHT > b.base_y
}

fn inside_furniture(geom: &RoomGeometry, xz: Vec2, radius: f32, current_y: f32, candidate_y: f32) -> bool {
    geom.boxes_near(xz, radius).any(|b| {
        blocks_body(b, current_y, candidate_y)
            && Narrowphase::overlap_circle_aabb(xz, radius, b.center, b.half_extents)
                .is_some_and(|o| o.depth > CONTACT_SLOP)
    })
}

/// Planar contact for a ground-bound rolling body.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bounce {
    pub position: Vec2,
    /// Combined contact normal, pointing back into free space.
    pub normal: Option<Vec2>,
}

/// Move a ground-bound circle from `current` to `candidate` and report the
/// surface it hit, for reflection. Boxes whose base is above `height` are ignored.
pub fn bounce(geometry: Option<&RoomGeometry>, current: Vec2, candidate: Vec2, radius: f32, height: f32) -> Bounce {
    let Some(geom) = geometry else {
        return Bounce { position: candidate, normal: None };
    };
    let mut pos = candidate;
    let mut normal = Vec2::ZERO;

    if geom.hard_blocks(pos, radius) {
        // Work out which axis carried us into the obstacle.
        let delta = candidate - current;
        let x_only = Vec2::new(candidate.x, current.y);
        let z_only = Vec2::new(current.x, candidate.y);
        let x_blocked = geom.hard_blocks(x_only, radius);
        let z_blocked = geom.hard_blocks(z_only, radius);
        if x_blocked {
            normal.x = -delta.x.signum();
        }
        if z_blocked {
            normal.y = -delta.y.signum();
        }
        if !x_blocked && !z_blocked {
            // Corner hit: only the diagonal is blocked.
            normal = -delta.normalize_or_zero();
        }
        pos = match (x_blocked, z_blocked) {
            (false, true) => x_only,
            (true, false) => z_only,
            _ => current,
        };
    } else if let Boundary::Circle(dome) = &geom.boundary {
        if let Some(o) = Narrowphase::contain_in_circle(pos, radius, dome.center, dome.radius) {
            pos = o.contact;
            normal += o.normal;
        }
    }

    for b in geom.boxes_near(pos, radius) {
        if b.base_y > height {
            continue;
        }
        if let Some(o) = Narrowphase::overlap_circle_aabb(pos, radius, b.center, b.half_extents) {
            pos = o.contact;
            normal += o.normal;
        }
    }

    Bounce {
        position: pos,
        normal: (normal.length_squared() > 0.0).then(|| normal.normalize()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BoxCollider, BuildingFootprint, CircularBound, Collider, DoorWindow, TileGrid};
    use approx::assert_relative_eq;
    use rstest::rstest;

    fn dome(radius: f32) -> RoomGeometry {
        RoomGeometry::from_colliders([Collider::CircularBound(CircularBound {
            center: Vec2::ZERO,
            radius,
        })])
    }

    fn table_room() -> RoomGeometry {
        RoomGeometry::from_colliders([
            Collider::CircularBound(CircularBound { center: Vec2::ZERO, radius: 20.0 }),
            Collider::BoxCollider(BoxCollider {
                center: Vec2::new(5.0, 0.0),
                half_extents: Vec2::new(1.0, 1.0),
                height: 1.0,
                base_y: 0.0,
            }),
        ])
    }

    fn town() -> RoomGeometry {
        RoomGeometry::from_colliders([
            Collider::TileGrid(TileGrid::from_rows(
                Vec2::ZERO,
                2.0,
                &[
                    "..........",
                    "..........",
                    "....~~....",
                    "..........",
                    "..........",
                ],
            )),
            Collider::BuildingFootprint(BuildingFootprint {
                center: Vec2::new(16.0, 3.0),
                half_extents: Vec2::new(2.0, 2.0),
                door: Some(DoorWindow { half_width: 0.8, depth: 0.6 }),
            }),
        ])
    }

    #[test]
    fn test_open_move_inside_dome_is_exact() {
        let g = dome(10.0);
        let r = resolve(Some(&g), Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0), 1.0);
        assert_eq!(r.position, Vec3::new(2.0, 0.0, 0.0));
        assert!(!r.blocked);
        assert!(r.landed);
    }

    #[rstest]
    #[case(Vec3::new(15.0, 0.0, 0.0))]
    #[case(Vec3::new(-7.0, 0.0, 7.0))]
    #[case(Vec3::new(0.0, 0.0, -9.5))]
    #[case(Vec3::new(300.0, 0.0, -120.0))]
    fn test_dome_contains_all_candidates(#[case] candidate: Vec3) {
        let g = dome(10.0);
        let r = resolve(Some(&g), Vec3::ZERO, candidate, 1.0);
        assert!(planar(r.position).length() <= 9.0 + 1e-4);
        // sliding, not a hard stop: the point moved toward the candidate
        assert!(planar(r.position).length() > 0.0);
    }

    #[test]
    fn test_water_blocks_without_sliding() {
        let g = town();
        let from = Vec3::new(7.0, 0.0, 5.0);
        let r = resolve(Some(&g), from, Vec3::new(8.5, 0.0, 5.0), 0.4);
        assert!(r.blocked);
        assert_eq!(planar(r.position), planar(from));
    }

    #[test]
    fn test_outside_grid_blocks() {
        let g = town();
        let from = Vec3::new(0.5, 0.0, 0.5);
        let r = resolve(Some(&g), from, Vec3::new(-0.5, 0.0, 0.5), 0.4);
        assert!(r.blocked);
        assert_eq!(planar(r.position), planar(from));
    }

    /// Walled grid with a pond, a house and two crates placed so that a naive
    /// push-out would shove a body into water or into the wall.
    fn walled_town() -> RoomGeometry {
        RoomGeometry::from_colliders([
            Collider::TileGrid(TileGrid::from_rows(
                Vec2::ZERO,
                2.0,
                &[
                    "##########",
                    "#........#",
                    "#...~~...#",
                    "#........#",
                    "##########",
                ],
            )),
            Collider::BuildingFootprint(BuildingFootprint {
                center: Vec2::new(14.0, 4.5),
                half_extents: Vec2::new(1.5, 1.5),
                door: Some(DoorWindow { half_width: 0.8, depth: 0.6 }),
            }),
            Collider::BoxCollider(BoxCollider {
                center: Vec2::new(7.3, 5.0),
                half_extents: Vec2::splat(0.5),
                height: 1.0,
                base_y: 0.0,
            }),
            Collider::BoxCollider(BoxCollider {
                center: Vec2::new(3.0, 7.7),
                half_extents: Vec2::splat(0.5),
                height: 1.0,
                base_y: 0.0,
            }),
        ])
    }

    #[rstest]
    #[case::into_water(Vec2::new(7.0, 3.5), Vec2::new(8.5, 4.5))]
    #[case::diagonal_into_water(Vec2::new(9.0, 7.0), Vec2::new(10.0, 5.5))]
    #[case::into_west_wall(Vec2::new(3.0, 3.0), Vec2::new(1.5, 3.0))]
    #[case::into_north_wall(Vec2::new(10.0, 7.5), Vec2::new(10.0, 8.4))]
    #[case::off_the_grid(Vec2::new(3.0, 3.0), Vec2::new(-1.0, 3.0))]
    #[case::far_off_the_grid(Vec2::new(17.0, 7.0), Vec2::new(40.0, 40.0))]
    #[case::house_side(Vec2::new(11.8, 3.5), Vec2::new(12.3, 3.5))]
    #[case::house_front_beside_door(Vec2::new(15.0, 7.0), Vec2::new(15.0, 6.2))]
    #[case::past_the_door_depth(Vec2::new(14.0, 7.0), Vec2::new(14.0, 5.0))]
    #[case::crate_pushes_toward_water(Vec2::new(7.95, 6.5), Vec2::new(7.95, 5.5))]
    #[case::crate_pushes_toward_wall(Vec2::new(4.5, 7.9), Vec2::new(3.0, 7.9))]
    #[case::open_floor(Vec2::new(4.0, 3.0), Vec2::new(5.0, 3.0))]
    fn test_tiles_never_end_in_blocked_cell(#[case] from: Vec2, #[case] to: Vec2) {
        let g = walled_town();
        let radius = 0.4;
        assert!(!g.hard_blocks(from, radius), "start {from} must be legal");
        let r = resolve(
            Some(&g),
            Vec3::new(from.x, 0.0, from.y),
            Vec3::new(to.x, 0.0, to.y),
            radius,
        );
        let end = planar(r.position);
        assert!(!g.hard_blocks(end, radius), "{from} -> {to} ended at {end}");
        for b in &g.boxes {
            if let Some(o) = Narrowphase::overlap_circle_aabb(end, radius, b.center, b.half_extents) {
                assert!(o.depth <= 1e-3, "{from} -> {to} ended inside a crate at {end}");
            }
        }
    }

    #[test]
    fn test_crate_push_into_water_reverts() {
        let g = walled_town();
        let from = Vec3::new(7.95, 0.0, 6.5);
        let r = resolve(Some(&g), from, Vec3::new(7.95, 0.0, 5.5), 0.4);
        assert!(r.blocked);
        assert_eq!(planar(r.position), planar(from));
    }

    #[test]
    fn test_box_by_dome_wall_stays_contained() {
        let g = RoomGeometry::from_colliders([
            Collider::CircularBound(CircularBound { center: Vec2::ZERO, radius: 10.0 }),
            Collider::BoxCollider(BoxCollider {
                center: Vec2::new(8.8, 0.0),
                half_extents: Vec2::new(0.8, 1.5),
                height: 1.0,
                base_y: 0.0,
            }),
        ]);
        let r = resolve(Some(&g), Vec3::new(9.0, 0.0, 2.5), Vec3::new(9.45, 0.0, 1.5), 0.4);
        assert!(r.blocked);
        assert!(planar(r.position).length() <= 9.6 + 1e-4);
        let o = Narrowphase::overlap_circle_aabb(planar(r.position), 0.4, Vec2::new(8.8, 0.0), Vec2::new(0.8, 1.5));
        assert!(o.is_none_or(|o| o.depth <= 1e-3));
    }

    #[test]
    fn test_building_blocks_except_door() {
        let g = town();
        // side wall
        let r = resolve(Some(&g), Vec3::new(13.0, 0.0, 3.0), Vec3::new(13.8, 0.0, 3.0), 0.4);
        assert!(r.blocked);
        // step into the door gap on the front (+z) face
        let r = resolve(Some(&g), Vec3::new(16.0, 0.0, 6.0), Vec3::new(16.0, 0.0, 4.8), 0.4);
        assert!(!r.blocked);
        assert_relative_eq!(r.position.z, 4.8);
    }

    #[test]
    fn test_box_side_push_out_smallest_axis() {
        let g = table_room();
        // walking into the -x face at ground level
        let r = resolve(Some(&g), Vec3::new(3.2, 0.0, 0.2), Vec3::new(3.7, 0.0, 0.2), 0.5);
        assert!(r.blocked);
        assert_relative_eq!(r.position.x, 3.5, epsilon = 1e-5);
        assert_relative_eq!(r.position.z, 0.2, epsilon = 1e-5);
    }

    #[test]
    fn test_standing_on_top_lands_exactly() {
        let g = table_room();
        // feet at the top, gravity pulled the candidate slightly below it
        let r = resolve(Some(&g), Vec3::new(5.0, 1.0, 0.0), Vec3::new(5.1, 0.96, 0.0), 0.5);
        assert!(r.landed);
        assert!(!r.blocked);
        assert_eq!(r.landing_y, 1.0);
        assert_eq!(r.position.y, 1.0);
    }

    #[test]
    fn test_rising_above_box_is_free() {
        let g = table_room();
        let r = resolve(Some(&g), Vec3::new(5.0, 1.2, 0.0), Vec3::new(5.0, 1.5, 0.0), 0.5);
        assert!(!r.landed);
        assert!(!r.blocked);
        assert_relative_eq!(r.position.y, 1.5);
    }

    #[test]
    fn test_walking_off_the_edge_falls() {
        let g = table_room();
        let r = resolve(Some(&g), Vec3::new(6.4, 1.0, 0.0), Vec3::new(6.8, 0.96, 0.0), 0.3);
        assert!(!r.landed);
        assert_relative_eq!(r.position.y, 0.96);
    }

    #[test]
    fn test_highest_surface_wins() {
        // A candidate below the ground while above a box top: the box top is higher.
        let g = table_room();
        let r = resolve(Some(&g), Vec3::new(5.0, 1.0, 0.0), Vec3::new(5.0, -0.2, 0.0), 0.5);
        assert!(r.landed);
        assert_eq!(r.position.y, 1.0);
    }

    #[test]
    fn test_geometry_miss_only_has_ground() {
        let r = resolve(None, Vec3::new(0.0, 0.5, 0.0), Vec3::new(100.0, -0.3, 0.0), 0.5);
        assert!(!r.blocked);
        assert!(r.landed);
        assert_eq!(r.position, Vec3::new(100.0, 0.0, 0.0));
    }

    #[test]
    fn test_bounce_off_dome_reports_inward_normal() {
        let g = dome(10.0);
        let b = bounce(Some(&g), Vec2::new(9.0, 0.0), Vec2::new(9.8, 0.0), 0.5, 1.0);
        assert_relative_eq!(b.position.x, 9.5, epsilon = 1e-5);
        let n = b.normal.unwrap();
        assert_relative_eq!(n.x, -1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_bounce_off_tile_wall_axis_normal() {
        let g = town();
        let b = bounce(Some(&g), Vec2::new(7.0, 5.0), Vec2::new(8.5, 5.0), 0.4, 1.0);
        assert_eq!(b.position, Vec2::new(7.0, 5.0));
        assert_eq!(b.normal, Some(Vec2::new(-1.0, 0.0)));
    }

    #[test]
    fn test_bounce_ignores_high_boxes() {
        let g = RoomGeometry::from_colliders([Collider::BoxCollider(BoxCollider {
            center: Vec2::ZERO,
            half_extents: Vec2::ONE,
            height: 0.2,
            base_y: 2.0,
        })]);
        let b = bounce(Some(&g), Vec2::new(-2.0, 0.0), Vec2::new(-0.5, 0.0), 0.3, 0.6);
        assert!(b.normal.is_none());
        assert_eq!(b.position, Vec2::new(-0.5, 0.0));
    }
}
