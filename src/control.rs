// Mode arbiter and fixed-rate control loop
//
// The arbiter holds mode and the active velocity command behind one mutex.
// Request handlers mutate intent through it; the tick reads and applies it.
// Lock order is arbiter -> navigator.
//
// One tick: select command -> kinematics -> (PID) -> actuate -> telemetry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::messages::{
    BodyVelocity, HealthReport, Mode, NavEvent, RuntimeHealth, TeleopCommand, Telemetry,
    WheelActuation,
};
use crate::motor::{Actuator, NUM_WHEELS, PidBank, PidGains, VehicleGeometry, WheelRates, solve};
use crate::nav::Navigator;
use crate::teleop::TeleopSource;

#[derive(Debug)]
struct ArbiterState {
    mode: Mode,
    command: BodyVelocity,
    last_teleop: Option<Instant>,
    stale: bool,
    brake_pending: bool,
}

/// What the tick should apply this period
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    pub mode: Mode,
    pub velocity: BodyVelocity,
    pub stale: bool,
    pub brake: bool,
    pub nav_event: Option<NavEvent>,
}

/// Owns the active mode and velocity command
pub struct ModeArbiter {
    teleop: TeleopSource,
    cmd_timeout: Option<Duration>,
    state: Mutex<ArbiterState>,
}

impl ModeArbiter {
    pub fn new(teleop: TeleopSource, cmd_timeout: Option<Duration>) -> Self {
        Self {
            teleop,
            cmd_timeout,
            state: Mutex::new(ArbiterState {
                mode: Mode::Teleop,
                command: BodyVelocity::zero(),
                last_teleop: None,
                stale: true, // stale until the first command
                brake_pending: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    /// Mode and command read together
    pub fn snapshot(&self) -> (Mode, BodyVelocity) {
        let state = self.lock();
        (state.mode, state.command)
    }

    /// Apply a teleop command; returns whether it was accepted
    ///
    /// Ignored in autonomous mode. A non-finite command is rejected and the
    /// previous command is held.
    pub fn on_teleop(&self, cmd: &TeleopCommand, now: Instant) -> bool {
        let mut state = self.lock();
        if state.mode != Mode::Teleop {
            debug!("Teleop command ignored in autonomous mode");
            return false;
        }
        let Some(velocity) = self.teleop.velocity_from_command(cmd) else {
            return false;
        };
        if state.stale {
            info!("Teleop commands resumed");
        }
        state.command = velocity;
        state.last_teleop = Some(now);
        state.stale = false;
        true
    }

    /// Switch between teleop and autonomous; the held command is zeroed either way
    pub fn set_autonomous(&self, enabled: bool) {
        let mut state = self.lock();
        let mode = if enabled { Mode::Autonomous } else { Mode::Teleop };
        if state.mode != mode {
            info!("Autonomous mode: {}", if enabled { "ON" } else { "OFF" });
        }
        state.mode = mode;
        state.command = BodyVelocity::zero();
        state.last_teleop = None;
    }

    /// Zero the command, leave autonomous mode and request an immediate stop
    pub fn brake(&self) {
        let mut state = self.lock();
        info!("Brake requested");
        state.mode = Mode::Teleop;
        state.command = BodyVelocity::zero();
        state.last_teleop = None;
        state.brake_pending = true;
    }

    /// Operator link lost: zero the command and leave autonomous mode
    pub fn disconnect(&self) {
        let mut state = self.lock();
        warn!("Operator disconnected, stopping");
        state.mode = Mode::Teleop;
        state.command = BodyVelocity::zero();
        state.last_teleop = None;
    }

    /// Decide this tick's velocity in one critical section
    pub fn select(&self, navigator: &Navigator, dt: f32, now: Instant) -> Selection {
        let mut state = self.lock();

        if state.brake_pending {
            state.brake_pending = false;
            return Selection {
                mode: state.mode,
                velocity: BodyVelocity::zero(),
                stale: state.stale,
                brake: true,
                nav_event: None,
            };
        }

        let mut nav_event = None;
        match state.mode {
            Mode::Autonomous => {
                let step = navigator.step(dt);
                state.command = step.velocity;
                state.stale = false;
                nav_event = step.event;
            }
            Mode::Teleop => {
                let expired = match (state.last_teleop, self.cmd_timeout) {
                    (Some(at), Some(timeout)) => now.saturating_duration_since(at) > timeout,
                    (None, _) => true,
                    (Some(_), None) => false,
                };
                if expired {
                    if !state.stale && !state.command.is_zero() {
                        warn!("Teleop command stale, stopping robot");
                    }
                    state.stale = true;
                    state.command = BodyVelocity::zero();
                }
            }
        }

        Selection {
            mode: state.mode,
            velocity: state.command,
            stale: state.stale,
            brake: false,
            nav_event,
        }
    }
}

/// Everything one tick produced
#[derive(Debug, Clone)]
pub struct TickOutput {
    pub actuation: WheelActuation,
    pub telemetry: Telemetry,
    pub health: HealthReport,
    pub nav_event: Option<NavEvent>,
    pub braked: bool,
}

/// Fixed-rate loop; sole writer of the actuator
pub struct ControlLoop<A: Actuator> {
    arbiter: Arc<ModeArbiter>,
    navigator: Arc<Navigator>,
    geometry: VehicleGeometry,
    pids: PidBank,
    closed_loop: bool,
    feed_present: bool,
    actuator: A,
    period: Duration,
}

impl<A: Actuator> ControlLoop<A> {
    pub fn new(
        arbiter: Arc<ModeArbiter>,
        navigator: Arc<Navigator>,
        geometry: VehicleGeometry,
        gains: [PidGains; NUM_WHEELS],
        closed_loop: bool,
        actuator: A,
        period: Duration,
    ) -> Self {
        Self {
            arbiter,
            navigator,
            geometry,
            pids: PidBank::new(gains),
            closed_loop,
            feed_present: false,
            actuator,
            period,
        }
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn pids(&self) -> &PidBank {
        &self.pids
    }

    pub fn tick(&mut self) -> TickOutput {
        self.tick_at(Instant::now())
    }

    /// Run one tick at an explicit time
    pub fn tick_at(&mut self, now: Instant) -> TickOutput {
        // 1. Select command
        let selection = self
            .arbiter
            .select(&self.navigator, self.period.as_secs_f32(), now);
        let velocity = selection.velocity;

        // 2. Kinematics
        let targets = solve(&velocity, &self.geometry);

        // 3. Closed or open loop duties
        let measured = self.actuator.read_wheel_rates().filter(WheelRates::is_finite);
        self.track_feed(measured.is_some());
        let closed = self.closed_loop && measured.is_some();

        let actuation = if selection.brake || targets.as_array() == [0.0; NUM_WHEELS] {
            // A zero command is a stop, not a setpoint for the PID
            self.pids.reset();
            WheelActuation::stop()
        } else {
            let feedforward = self.open_loop_duties(&targets);
            match measured {
                Some(measured) if closed => {
                    let correction = self.pids.update_at(&targets, &measured, now);
                    let mut duties = feedforward;
                    for (duty, c) in duties.iter_mut().zip(correction) {
                        *duty += c;
                    }
                    WheelActuation::from_duties(duties)
                }
                _ => WheelActuation::from_duties(feedforward),
            }
        };

        // 4. Actuate
        let result = if selection.brake {
            self.actuator.brake()
        } else {
            self.actuator.set_duties(&actuation)
        };
        let fault = match result {
            Ok(()) => false,
            Err(e) => {
                warn!("Actuator {} write failed: {}", self.actuator.name(), e);
                true
            }
        };

        // 5. Telemetry
        let status = if fault {
            RuntimeHealth::ActuatorFault
        } else if selection.stale && selection.mode == Mode::Teleop {
            RuntimeHealth::CmdStale
        } else if self.closed_loop && !closed {
            RuntimeHealth::OpenLoop
        } else {
            RuntimeHealth::Ok
        };

        let telemetry = Telemetry {
            timestamp_ms: unix_millis(),
            mode: selection.mode,
            velocity,
            wheel_targets: targets,
            measured,
            duty: actuation.duty,
            closed_loop: closed,
        };
        debug!(
            "tick mode={:?} v=({:.2}, {:.2}, {:.2}) duty={:?}",
            selection.mode, velocity.vx, velocity.vy, velocity.omega, actuation.duty
        );

        TickOutput {
            actuation,
            telemetry,
            health: HealthReport {
                status,
                mode: selection.mode,
                nav: self.navigator.state(),
            },
            nav_event: selection.nav_event,
            braked: selection.brake,
        }
    }

    /// Brake and drop any pending navigation before the loop exits
    pub fn shutdown(&mut self) {
        self.pids.reset();
        self.navigator.set_goal(None);
        if let Err(e) = self.actuator.brake() {
            warn!("Failed to brake on shutdown: {}", e);
        }
    }

    /// Duty = target rate / max rate
    fn open_loop_duties(&self, targets: &WheelRates) -> [f32; NUM_WHEELS] {
        let max = self.geometry.max_wheel_rps.abs();
        if max <= f32::EPSILON {
            return [0.0; NUM_WHEELS];
        }
        targets.as_array().map(|rps| rps / max)
    }

    fn track_feed(&mut self, present: bool) {
        if present == self.feed_present {
            return;
        }
        if present {
            info!("Wheel rate feed available, closing the loop");
        } else {
            warn!("Wheel rate feed lost, falling back to open loop");
        }
        self.pids.reset();
        self.feed_present = present;
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
