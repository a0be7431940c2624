// Holonomic inverse kinematics for a four-wheel mecanum/omni base
// Converts body-frame velocities (vx, vy, omega) to individual wheel rates.

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use crate::messages::BodyVelocity;

/// Smallest wheel radius accepted before clamping (meters)
pub const MIN_WHEEL_RADIUS: f32 = 1e-6;

/// Number of driven wheels
pub const NUM_WHEELS: usize = 4;

/// Wheel names in command order
pub const WHEEL_NAMES: [&str; NUM_WHEELS] = ["FL", "FR", "RL", "RR"];

/// Static geometry of the base
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleGeometry {
    pub wheel_radius: f32,  // meters
    pub half_length_x: f32, // meters, center to wheel along x
    pub half_length_y: f32, // meters, center to wheel along y
    pub max_wheel_rps: f32, // revolutions per second
}

impl VehicleGeometry {
    /// Wheel radius with the zero guard applied
    pub fn effective_radius(&self) -> f32 {
        self.wheel_radius.max(MIN_WHEEL_RADIUS)
    }

    /// Lever arm shared by every wheel's rotation term
    pub fn lever_arm(&self) -> f32 {
        self.half_length_x + self.half_length_y
    }
}

/// Per-wheel rates in revolutions per second, ordered [FL, FR, RL, RR]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WheelRates(pub [f32; NUM_WHEELS]);

impl WheelRates {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn front_left(&self) -> f32 {
        self.0[0]
    }

    pub fn front_right(&self) -> f32 {
        self.0[1]
    }

    pub fn rear_left(&self) -> f32 {
        self.0[2]
    }

    pub fn rear_right(&self) -> f32 {
        self.0[3]
    }

    pub fn as_array(&self) -> [f32; NUM_WHEELS] {
        self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|r| r.is_finite())
    }
}

/// Sign pattern of each wheel row, applied to (vy, vx, L*omega)
const WHEEL_SIGNS: [[f32; 3]; NUM_WHEELS] = [
    [1.0, -1.0, -1.0], // front-left
    [1.0, 1.0, 1.0],   // front-right
    [1.0, 1.0, -1.0],  // rear-left
    [1.0, -1.0, 1.0],  // rear-right
];

/// Unclamped wheel angular rates in rad/s
fn wheel_rad_per_sec(velocity: &BodyVelocity, geometry: &VehicleGeometry) -> [f32; NUM_WHEELS] {
    let r = geometry.effective_radius();
    let spin = geometry.lever_arm() * velocity.omega;

    WHEEL_SIGNS.map(|[s_fwd, s_lat, s_rot]| {
        (s_fwd * velocity.vy + s_lat * velocity.vx + s_rot * spin) / r
    })
}

/// Convert a body-frame velocity to clamped wheel rates (rev/s)
///
/// # Arguments
/// * `velocity` - vx (m/s, +right), vy (m/s, +forward), omega (rad/s, +ccw)
/// * `geometry` - wheel radius, half lengths and the wheel rate limit
pub fn solve(velocity: &BodyVelocity, geometry: &VehicleGeometry) -> WheelRates {
    let limit = geometry.max_wheel_rps.abs();
    let rates = wheel_rad_per_sec(velocity, geometry).map(|rad_s| {
        let rps = rad_s / (2.0 * PI);
        if rps.is_finite() { rps.clamp(-limit, limit) } else { 0.0 }
    });
    WheelRates(rates)
}

/// Forward kinematics: reconstruct body velocity from wheel rates (rev/s)
///
/// Exact inverse of [`solve`] while no wheel is clamped.
pub fn wheels_to_body(wheels: &WheelRates, geometry: &VehicleGeometry) -> BodyVelocity {
    let r = geometry.effective_radius();
    let [fl, fr, rl, rr] = wheels.0.map(|rps| rps * 2.0 * PI * r);

    let vy = (fl + fr + rl + rr) / 4.0;
    let vx = (-fl + fr + rl - rr) / 4.0;
    let spin = (-fl + fr - rl + rr) / 4.0;
    let lever = geometry.lever_arm();
    let omega = if lever.abs() > f32::EPSILON { spin / lever } else { 0.0 };

    BodyVelocity { vx, vy, omega }
}
