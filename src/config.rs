// Timeouts, topics, vehicle geometry and tuning
//
// The constants are compiled-in defaults. Any of them can be overridden by a
// TOML file passed with --config; missing keys keep their default.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::motor::bridge::{DEFAULT_BAUDRATE, DEFAULT_BRIDGE_ID};
use crate::motor::{NUM_WHEELS, PidGains, VehicleGeometry};
use crate::nav::{Cell, NavParams, OccupancyGrid, Pose};
use crate::teleop::TeleopSource;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for the teleop watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Zenoh key prefix; topics hang off it
pub const TOPIC_PREFIX: &str = "omnibase";
pub const TOPIC_CMD_TELEOP: &str = "cmd/teleop";
pub const TOPIC_CMD_MODE: &str = "cmd/mode";
pub const TOPIC_CMD_GOAL: &str = "cmd/goal";
pub const TOPIC_CMD_BRAKE: &str = "cmd/brake";
pub const TOPIC_CMD_DISCONNECT: &str = "cmd/disconnect";
pub const TOPIC_CMD_PID: &str = "cmd/pid";
pub const TOPIC_CMD_POSE: &str = "cmd/pose";
pub const TOPIC_RT_ACTUATION: &str = "rt/actuation";
pub const TOPIC_RT_TELEMETRY: &str = "rt/telemetry";
pub const TOPIC_HEALTH: &str = "state/health";
pub const TOPIC_NAV: &str = "state/nav";
pub const TOPIC_PID_ACK: &str = "state/pid_ack";

// Vehicle geometry (76 mm omni/mecanum wheels)
pub const WHEEL_RADIUS_M: f32 = 0.038;
pub const HALF_LENGTH_X_M: f32 = 0.15;
pub const HALF_LENGTH_Y_M: f32 = 0.12;
pub const MAX_WHEEL_RPS: f32 = 8.0;

// Default wheel PID gains (kp, ki, kd), same for every wheel
pub const PID_GAINS: (f32, f32, f32) = (0.35, 0.0, 0.015);

// Teleop limits
pub const MAX_VX: f32 = 0.8; // m/s
pub const MAX_VY: f32 = 0.8; // m/s
pub const MAX_OMEGA: f32 = 2.8; // rad/s
pub const TURBO_SCALE: f32 = 2.0;

// Navigation grid and follower
pub const GRID_WIDTH: usize = 40;
pub const GRID_HEIGHT: usize = 30;
pub const START_POSE: (f32, f32, f32) = (20.0, 15.0, 0.0);
pub const ARRIVAL_TOLERANCE: f32 = 0.2;
pub const FOLLOW_GAIN: f32 = 0.2;

/// Largest grid accepted from a config file
pub const MAX_GRID_CELLS: usize = 1_000_000;

/// Error loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub control: ControlConfig,
    pub geometry: GeometryConfig,
    pub pid: PidConfig,
    pub teleop: TeleopConfig,
    pub nav: NavConfig,
    pub transport: TransportConfig,
    pub motor: MotorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub loop_hz: u64,
    /// Zero the teleop command after this long without a new one (0 disables)
    pub cmd_timeout_ms: u64,
    /// Use PID correction when the actuator reports wheel rates
    pub closed_loop: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            loop_hz: LOOP_HZ,
            cmd_timeout_ms: CMD_TIMEOUT.as_millis() as u64,
            closed_loop: true,
        }
    }
}

impl ControlConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(1000 / self.loop_hz.max(1))
    }

    pub fn cmd_timeout(&self) -> Option<Duration> {
        (self.cmd_timeout_ms > 0).then(|| Duration::from_millis(self.cmd_timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    pub wheel_radius: f32,
    pub half_length_x: f32,
    pub half_length_y: f32,
    pub max_wheel_rps: f32,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self {
            wheel_radius: WHEEL_RADIUS_M,
            half_length_x: HALF_LENGTH_X_M,
            half_length_y: HALF_LENGTH_Y_M,
            max_wheel_rps: MAX_WHEEL_RPS,
        }
    }
}

impl From<&GeometryConfig> for VehicleGeometry {
    fn from(cfg: &GeometryConfig) -> Self {
        Self {
            wheel_radius: cfg.wheel_radius,
            half_length_x: cfg.half_length_x,
            half_length_y: cfg.half_length_y,
            max_wheel_rps: cfg.max_wheel_rps,
        }
    }
}

/// Gains per wheel in order FL, FR, RL, RR
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub fl: PidGains,
    pub fr: PidGains,
    pub rl: PidGains,
    pub rr: PidGains,
}

impl Default for PidConfig {
    fn default() -> Self {
        let (kp, ki, kd) = PID_GAINS;
        let gains = PidGains::new(kp, ki, kd);
        Self {
            fl: gains,
            fr: gains,
            rl: gains,
            rr: gains,
        }
    }
}

impl PidConfig {
    pub fn gains(&self) -> [PidGains; NUM_WHEELS] {
        [self.fl, self.fr, self.rl, self.rr]
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TeleopConfig {
    pub max_vx: f32,
    pub max_vy: f32,
    pub max_omega: f32,
    pub turbo_scale: f32,
}

impl Default for TeleopConfig {
    fn default() -> Self {
        Self {
            max_vx: MAX_VX,
            max_vy: MAX_VY,
            max_omega: MAX_OMEGA,
            turbo_scale: TURBO_SCALE,
        }
    }
}

impl From<&TeleopConfig> for TeleopSource {
    fn from(cfg: &TeleopConfig) -> Self {
        Self {
            max_vx: cfg.max_vx,
            max_vy: cfg.max_vy,
            max_omega: cfg.max_omega,
            turbo_scale: cfg.turbo_scale,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NavConfig {
    pub grid_width: usize,
    pub grid_height: usize,
    /// Obstacle cells as [x, y]
    pub obstacles: Vec<[i32; 2]>,
    /// Initial pose [x, y, theta] in grid units
    pub start_pose: [f32; 3],
    pub arrival_tolerance: f32,
    pub gain: f32,
    pub dead_reckoning: bool,
}

impl Default for NavConfig {
    fn default() -> Self {
        let (x, y, theta) = START_POSE;
        Self {
            grid_width: GRID_WIDTH,
            grid_height: GRID_HEIGHT,
            obstacles: Vec::new(),
            start_pose: [x, y, theta],
            arrival_tolerance: ARRIVAL_TOLERANCE,
            gain: FOLLOW_GAIN,
            dead_reckoning: true,
        }
    }
}

impl NavConfig {
    pub fn grid(&self) -> Result<OccupancyGrid, ConfigError> {
        let mut grid = OccupancyGrid::new(self.grid_width, self.grid_height);
        for &[x, y] in &self.obstacles {
            if !grid.set_obstacle(Cell::new(x, y)) {
                return Err(ConfigError::Invalid(format!(
                    "obstacle ({}, {}) outside {}x{} grid",
                    x, y, self.grid_width, self.grid_height
                )));
            }
        }
        Ok(grid)
    }

    pub fn start_pose(&self) -> Pose {
        let [x, y, theta] = self.start_pose;
        Pose::new(x, y, theta)
    }

    pub fn params(&self, teleop: &TeleopConfig) -> NavParams {
        NavParams {
            arrival_tolerance: self.arrival_tolerance,
            gain: self.gain,
            max_vx: teleop.max_vx,
            max_vy: teleop.max_vy,
            dead_reckoning: self.dead_reckoning,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub prefix: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            prefix: TOPIC_PREFIX.to_string(),
        }
    }
}

impl TransportConfig {
    /// Full key expression for a topic suffix
    pub fn key(&self, topic: &str) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), topic)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotorConfig {
    /// Serial port of the motor bridge; unset runs the simulated actuator
    pub port: Option<String>,
    pub baudrate: u32,
    pub bridge_id: u8,
    pub read_encoders: bool,
    /// Model encoders in the simulated actuator
    pub sim_encoders: bool,
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            port: None,
            baudrate: DEFAULT_BAUDRATE,
            bridge_id: DEFAULT_BRIDGE_ID,
            read_encoders: true,
            sim_encoders: false,
        }
    }
}

impl RuntimeConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.control.loop_hz == 0 || self.control.loop_hz > 1000 {
            return Err(ConfigError::Invalid(format!(
                "loop_hz {} outside 1..=1000",
                self.control.loop_hz
            )));
        }
        if self.nav.grid_width == 0 || self.nav.grid_height == 0 {
            return Err(ConfigError::Invalid("grid must be at least 1x1".to_string()));
        }
        let cells = self.nav.grid_width.checked_mul(self.nav.grid_height);
        if cells.is_none_or(|cells| cells > MAX_GRID_CELLS) {
            return Err(ConfigError::Invalid(format!(
                "grid {}x{} exceeds {} cells",
                self.nav.grid_width, self.nav.grid_height, MAX_GRID_CELLS
            )));
        }
        if self.geometry.max_wheel_rps <= 0.0 {
            return Err(ConfigError::Invalid("max_wheel_rps must be positive".to_string()));
        }
        // Non-positive wheel radius is clamped by the kinematics, not rejected
        self.nav.grid().map(|_| ())
    }
}
