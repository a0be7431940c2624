// Message types exchanged with dashboards, teleop clients and the tick loop

use serde::{Deserialize, Serialize};

use crate::motor::kinematics::{NUM_WHEELS, WheelRates};
use crate::nav::{Cell, NavState, Pose};

/// Body-frame velocity: +vx right (m/s), +vy forward (m/s), +omega ccw (rad/s)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BodyVelocity {
    pub vx: f32,
    pub vy: f32,
    pub omega: f32,
}

impl BodyVelocity {
    pub fn new(vx: f32, vy: f32, omega: f32) -> Self {
        Self { vx, vy, omega }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        self.vx == 0.0 && self.vy == 0.0 && self.omega == 0.0
    }

    pub fn is_finite(&self) -> bool {
        self.vx.is_finite() && self.vy.is_finite() && self.omega.is_finite()
    }
}

// Commands from teleop/dashboards -> runtime

/// Normalized operator axes, each in [-1, 1]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeleopCommand {
    pub ax: f32,
    pub ay: f32,
    pub rot: f32,
    #[serde(default)]
    pub turbo: bool,
    #[serde(default)]
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModeCommand {
    pub autonomous: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GoalCommand {
    Set { x: i32, y: i32 },
    Clear,
}

impl GoalCommand {
    pub fn target(&self) -> Option<Cell> {
        match *self {
            GoalCommand::Set { x, y } => Some(Cell::new(x, y)),
            GoalCommand::Clear => None,
        }
    }
}

/// Gain update request from a dashboard
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidGainsCommand {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    #[serde(default)]
    pub wheel: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PidAck {
    pub ok: bool,
    pub applied: bool,
}

/// Pose estimate from an external localization source
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoseCommand {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub theta: f32,
}

impl From<&PoseCommand> for Pose {
    fn from(cmd: &PoseCommand) -> Self {
        Pose::new(cmd.x, cmd.y, cmd.theta)
    }
}

// Outputs from runtime -> motor side and dashboards

/// Duties in [-1, 1] with direction flags, wheel order [FL, FR, RL, RR]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WheelActuation {
    pub duty: [f32; NUM_WHEELS],
    pub forward: [bool; NUM_WHEELS],
}

impl WheelActuation {
    /// Clamp into range; non-finite duties become 0
    pub fn from_duties(duties: [f32; NUM_WHEELS]) -> Self {
        let duty = duties.map(|d| if d.is_finite() { d.clamp(-1.0, 1.0) } else { 0.0 });
        Self {
            duty,
            forward: duty.map(|d| d >= 0.0),
        }
    }

    pub fn stop() -> Self {
        Self::from_duties([0.0; NUM_WHEELS])
    }

    pub fn is_stopped(&self) -> bool {
        self.duty.iter().all(|&d| d == 0.0)
    }
}

/// Which source owns the velocity command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    Teleop,
    Autonomous,
}

/// Per-tick record for logging sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    pub timestamp_ms: u64,
    pub mode: Mode,
    pub velocity: BodyVelocity,
    pub wheel_targets: WheelRates,
    pub measured: Option<WheelRates>,
    pub duty: [f32; NUM_WHEELS],
    pub closed_loop: bool,
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    OpenLoop,
    ActuatorFault,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub status: RuntimeHealth,
    pub mode: Mode,
    pub nav: NavState,
}

/// Navigation status notifications
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NavEvent {
    PathPlanned { goal: Cell, waypoints: usize },
    GoalUnreachable { goal: Cell },
    WaypointReached { cell: Cell, remaining: usize },
    Arrived { goal: Cell },
    GoalCleared,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actuation_clamps_and_sets_direction() {
        let act = WheelActuation::from_duties([1.5, -0.25, f32::NAN, -3.0]);
        assert_eq!(act.duty, [1.0, -0.25, 0.0, -1.0]);
        assert_eq!(act.forward, [true, false, true, false]);
        assert!(!act.is_stopped());
        assert!(WheelActuation::stop().is_stopped());
    }

    #[test]
    fn test_parse_teleop_defaults() {
        let cmd: TeleopCommand = serde_json::from_str(r#"{"ax":0.5,"ay":-1.0,"rot":0.0}"#).unwrap();
        assert!(!cmd.turbo);
        assert_eq!(cmd.speed, None);
    }

    #[test]
    fn test_parse_goal_commands() {
        let set: GoalCommand = serde_json::from_str(r#"{"action":"set","x":4,"y":2}"#).unwrap();
        assert_eq!(set.target(), Some(Cell::new(4, 2)));

        let clear: GoalCommand = serde_json::from_str(r#"{"action":"clear"}"#).unwrap();
        assert_eq!(clear.target(), None);
    }

    #[test]
    fn test_nav_event_is_tagged() {
        let json = serde_json::to_string(&NavEvent::GoalCleared).unwrap();
        assert_eq!(json, r#"{"event":"goal_cleared"}"#);
    }
}
