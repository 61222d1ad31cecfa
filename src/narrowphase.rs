use glam::Vec2;

use crate::api::NarrowphaseApi;
use crate::types::*;

/// Planar primitive tests used by the resolver, the prop and the NPC engine.
pub struct Narrowphase;

impl NarrowphaseApi for Narrowphase {
    fn overlap_circle_circle(body: Vec2, body_r: f32, other: Vec2, other_r: f32) -> Option<Overlap> {
        let reach = body_r + other_r;
        let away = body - other;
        let gap2 = away.length_squared();
        if gap2 > reach * reach {
            return None;
        }
        // Stacked centres give no push direction; callers pick one.
        let Some(normal) = away.try_normalize() else {
            return Some(Overlap { normal: Vec2::ZERO, depth: reach, contact: body });
        };
        Some(Overlap {
            normal,
            depth: (reach - gap2.sqrt()).max(0.0),
            contact: body - normal * body_r,
        })
    }

    fn overlap_circle_aabb(c: Vec2, r: f32, box_c: Vec2, box_h: Vec2) -> Option<Overlap> {
        // Inflate the box by the radius and treat the circle as its center point.
        let min = box_c - box_h - Vec2::splat(r);
        let max = box_c + box_h + Vec2::splat(r);
        if c.x <= min.x || c.x >= max.x || c.y <= min.y || c.y >= max.y {
            return None;
        }

        // Distance to each inflated edge; the smallest one wins.
        let edges = [
            (c.x - min.x, Vec2::new(-1.0, 0.0)),
            (max.x - c.x, Vec2::new(1.0, 0.0)),
            (c.y - min.y, Vec2::new(0.0, -1.0)),
            (max.y - c.y, Vec2::new(0.0, 1.0)),
        ];
        let (depth, normal) = edges
            .into_iter()
            .fold((f32::INFINITY, Vec2::ZERO), |best, e| if e.0 < best.0 { e } else { best });

        Some(Overlap {
            normal,
            depth,
            contact: c + normal * depth,
        })
    }

    fn overlap_point_aabb(p: Vec2, c: Vec2, h: Vec2) -> bool {
        let min = c - h;
        let max = c + h;
        p.x >= min.x && p.x <= max.x && p.y >= min.y && p.y <= max.y
    }

    fn overlap_point_circle(p: Vec2, c: Vec2, r: f32) -> bool {
        let d = p - c;
        d.length_squared() <= r * r
    }

    fn contain_in_circle(p: Vec2, r: f32, center: Vec2, bound_r: f32) -> Option<Overlap> {
        let allowed = (bound_r - r).max(0.0);
        let d = p - center;
        let dist = d.length();
        if dist <= allowed {
            return None;
        }
        let outward = d / dist;
        Some(Overlap {
            normal: -outward,
            depth: dist - allowed,
            contact: center + outward * allowed,
        })
    }

    fn reflect(v: Vec2, n: Vec2, restitution: f32) -> Vec2 {
        let vn = v.dot(n);
        if vn >= 0.0 {
            return v;
        }
        (v - 2.0 * vn * n) * restitution
    }
}
