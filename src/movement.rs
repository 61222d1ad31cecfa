//! Movement Integrator: gravity, jumping and input-driven planar velocity.

use glam::{Vec2, Vec3};

use crate::config::MovementConfig;
use crate::types::{InputSample, facing, with_planar, wrap_angle};

/// Planar motion requested by one input sample.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PlanarIntent {
    /// Velocity on the (x, z) plane, units/s.
    pub velocity: Vec2,
    /// Facing after this tick's turn.
    pub yaw: f32,
}

/// Vertical body state the integrator mutates.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Vertical {
    pub vy: f32,
    pub grounded: bool,
}

#[derive(Clone, Debug)]
pub struct Integrator {
    cfg: MovementConfig,
}

impl Integrator {
    pub fn new(cfg: MovementConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &MovementConfig {
        &self.cfg
    }

    /// One gravity step. Applied every tick, grounded or not, so a body that
    /// loses its support starts falling immediately.
    pub fn apply_gravity(&self, vy: f32, dt: f32) -> f32 {
        (vy - self.cfg.gravity * dt).max(-self.cfg.terminal_velocity)
    }

    /// Honour a jump request, then apply gravity. Returns true when the jump fired.
    ///
    /// `suppressed` covers every state that locks the avatar in place
    /// (seated, emoting, match lock-out).
    pub fn step_vertical(&self, v: &mut Vertical, jump: bool, suppressed: bool, dt: f32) -> bool {
        let jumped = jump && v.grounded && !suppressed;
        if jumped {
            v.vy = self.cfg.jump_impulse;
            v.grounded = false;
        }
        v.vy = self.apply_gravity(v.vy, dt);
        jumped
    }

    /// Tank-style controls: turn keys (or stick x) rotate, forward/back (or stick y) drive
    /// along the facing. A stick outside the deadzone wins over the keys and is
    /// scaled by its deflection.
    pub fn planar_intent(&self, input: &InputSample, yaw: f32, dt: f32) -> PlanarIntent {
        let stick = input
            .joystick
            .filter(|j| j.length_squared() > self.cfg.analog_deadzone * self.cfg.analog_deadzone)
            .map(|j| j.clamp_length_max(1.0));

        let (turn, drive) = match stick {
            Some(j) => (j.x, j.y),
            None => {
                let turn = input.turn_right as i32 - input.turn_left as i32;
                let drive = input.forward as i32 - input.back as i32;
                (turn as f32, drive as f32)
            }
        };

        let yaw = wrap_angle(yaw + turn * self.cfg.turn_rate * dt);
        PlanarIntent {
            velocity: facing(yaw) * drive * self.cfg.walk_speed,
            yaw,
        }
    }
}

/// Candidate position after moving with `planar` velocity and vertical speed `vy` for `dt`.
pub fn advance(pos: Vec3, planar: Vec2, vy: f32, dt: f32) -> Vec3 {
    let xz = Vec2::new(pos.x, pos.z) + planar * dt;
    with_planar(Vec3::new(0.0, pos.y + vy * dt, 0.0), xz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;
    use std::f32::consts::FRAC_PI_2;

    fn integrator() -> Integrator {
        Integrator::new(MovementConfig::default())
    }

    #[test]
    fn test_gravity_monotonic_until_terminal() {
        let m = integrator();
        let terminal = -m.config().terminal_velocity;
        let mut vy = 0.0;
        let mut prev = vy;
        let mut clamped_at = None;
        for i in 0..200 {
            vy = m.apply_gravity(vy, 1.0 / 60.0);
            if vy > terminal {
                assert!(vy < prev, "tick {i}: {vy} !< {prev}");
            } else {
                assert_eq!(vy, terminal);
                clamped_at.get_or_insert(i);
            }
            prev = vy;
        }
        assert!(clamped_at.is_some());
        assert_eq!(vy, terminal);
    }

    #[test]
    fn test_gravity_applies_when_grounded() {
        let m = integrator();
        let mut v = Vertical { vy: 0.0, grounded: true };
        assert!(!m.step_vertical(&mut v, false, false, 0.1));
        assert!(v.vy < 0.0);
        assert!(v.grounded);
    }

    #[rstest]
    #[case(true, false, true)]
    #[case(false, false, false)]
    #[case(true, true, false)]
    fn test_jump_gating(#[case] grounded: bool, #[case] suppressed: bool, #[case] fires: bool) {
        let m = integrator();
        let mut v = Vertical { vy: 0.0, grounded };
        assert_eq!(m.step_vertical(&mut v, true, suppressed, 0.01), fires);
        if fires {
            assert!(!v.grounded);
            assert_relative_eq!(v.vy, m.config().jump_impulse - m.config().gravity * 0.01, epsilon = 1e-5);
        } else {
            assert!(v.vy <= 0.0);
        }
    }

    #[test]
    fn test_digital_forward_follows_facing() {
        let m = integrator();
        let input = InputSample { forward: true, ..Default::default() };
        let intent = m.planar_intent(&input, FRAC_PI_2, 0.0);
        assert_relative_eq!(intent.velocity.x, m.config().walk_speed, epsilon = 1e-4);
        assert_relative_eq!(intent.velocity.y, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_digital_turn_rate() {
        let m = integrator();
        let input = InputSample { turn_left: true, ..Default::default() };
        let intent = m.planar_intent(&input, 0.0, 0.1);
        assert_relative_eq!(intent.yaw, -m.config().turn_rate * 0.1, epsilon = 1e-6);
        assert_eq!(intent.velocity, Vec2::ZERO);
    }

    #[test]
    fn test_analog_is_magnitude_scaled_and_wins() {
        let m = integrator();
        let input = InputSample {
            back: true,
            joystick: Some(Vec2::new(0.0, 0.5)),
            ..Default::default()
        };
        let intent = m.planar_intent(&input, 0.0, 0.016);
        assert_relative_eq!(intent.velocity.y, 0.5 * m.config().walk_speed, epsilon = 1e-5);
    }

    #[test]
    fn test_analog_deadzone_falls_back_to_keys() {
        let m = integrator();
        let input = InputSample {
            forward: true,
            joystick: Some(Vec2::new(0.05, -0.05)),
            ..Default::default()
        };
        let intent = m.planar_intent(&input, 0.0, 0.016);
        assert_relative_eq!(intent.velocity.y, m.config().walk_speed, epsilon = 1e-5);
    }

    #[test]
    fn test_advance_combines_planar_and_vertical() {
        let p = advance(Vec3::new(1.0, 2.0, 3.0), Vec2::new(2.0, -1.0), -4.0, 0.5);
        assert_eq!(p, Vec3::new(2.0, 0.0, 2.5));
    }
}
