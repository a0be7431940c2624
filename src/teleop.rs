// Teleop source: normalized operator axes -> clamped body velocity

use tracing::warn;

use crate::messages::{BodyVelocity, TeleopCommand};

/// Speed limits and turbo factor for teleop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeleopSource {
    pub max_vx: f32,
    pub max_vy: f32,
    pub max_omega: f32,
    pub turbo_scale: f32,
}

impl Default for TeleopSource {
    fn default() -> Self {
        Self {
            max_vx: 0.8,
            max_vy: 0.8,
            max_omega: 2.8,
            turbo_scale: 2.0,
        }
    }
}

impl TeleopSource {
    /// Map axes to a body velocity
    ///
    /// `ay` follows gamepad convention (negative is forward) and is inverted.
    /// The speed multiplier scales translation only. Every component is
    /// clamped to its limit. Returns `None` for non-finite input.
    pub fn velocity_from_axes(&self, ax: f32, ay: f32, rot: f32, turbo: bool, speed: f32) -> Option<BodyVelocity> {
        if !(ax.is_finite() && ay.is_finite() && rot.is_finite() && speed.is_finite()) {
            warn!("Rejecting non-finite teleop axes ({}, {}, {}) speed {}", ax, ay, rot, speed);
            return None;
        }

        let scale = if turbo { self.turbo_scale } else { 1.0 };
        let speed = speed.max(0.0);
        let axis = |value: f32| value.clamp(-1.0, 1.0) * scale;

        Some(BodyVelocity {
            vx: (axis(ax) * self.max_vx * speed).clamp(-self.max_vx, self.max_vx),
            vy: (-axis(ay) * self.max_vy * speed).clamp(-self.max_vy, self.max_vy),
            omega: (axis(rot) * self.max_omega).clamp(-self.max_omega, self.max_omega),
        })
    }

    pub fn velocity_from_command(&self, cmd: &TeleopCommand) -> Option<BodyVelocity> {
        self.velocity_from_axes(cmd.ax, cmd.ay, cmd.rot, cmd.turbo, cmd.speed.unwrap_or(1.0))
    }
}
