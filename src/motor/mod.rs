// Motor side of the base
//
// Provides:
// - Holonomic inverse kinematics (body velocity -> wheel rates)
// - Per-wheel PID speed control
// - Actuator interface with simulated and serial-bridge implementations
// - Serial motor bridge protocol

pub mod bridge;
mod driver;
pub mod kinematics;
pub mod pid;

pub use bridge::{BridgeError, MotorBridge};
pub use driver::{Actuator, BridgeActuator, SimActuator};
pub use kinematics::{NUM_WHEELS, VehicleGeometry, WheelRates, solve};
pub use pid::{Pid, PidBank, PidGains};
