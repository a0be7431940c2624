// Actuator interface for the four-wheel base
//
// The control tick is the only caller. Two implementations: a simulated
// actuator that logs and optionally models encoders, and the serial motor
// bridge. The choice is made once at startup.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::bridge::{BridgeError, MotorBridge};
use super::kinematics::{NUM_WHEELS, WheelRates};
use crate::messages::WheelActuation;

/// Narrow contract the control loop drives
pub trait Actuator: Send {
    /// Apply duties in wheel order [FL, FR, RL, RR]
    fn set_duties(&mut self, actuation: &WheelActuation) -> Result<(), BridgeError>;

    /// Stop all wheels now
    fn brake(&mut self) -> Result<(), BridgeError>;

    /// Measured wheel rates (rev/s), `None` when no encoder feed is available
    fn read_wheel_rates(&mut self) -> Option<WheelRates>;

    fn name(&self) -> &'static str;
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn set_duties(&mut self, actuation: &WheelActuation) -> Result<(), BridgeError> {
        (**self).set_duties(actuation)
    }

    fn brake(&mut self) -> Result<(), BridgeError> {
        (**self).brake()
    }

    fn read_wheel_rates(&mut self) -> Option<WheelRates> {
        (**self).read_wheel_rates()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Simulated actuator for bench runs and tests
#[derive(Debug, Clone)]
pub struct SimActuator {
    duty: [f32; NUM_WHEELS],
    // Wheel rate reached at full duty, Some = report simulated encoders
    encoder_full_scale: Option<f32>,
    brakes: usize,
    writes: usize,
}

impl SimActuator {
    /// Open-loop simulation without encoder feedback
    pub fn new() -> Self {
        Self {
            duty: [0.0; NUM_WHEELS],
            encoder_full_scale: None,
            brakes: 0,
            writes: 0,
        }
    }

    /// Report wheel rates proportional to the applied duty
    pub fn with_encoders(full_scale_rps: f32) -> Self {
        Self {
            encoder_full_scale: Some(full_scale_rps),
            ..Self::new()
        }
    }

    pub fn duty(&self) -> [f32; NUM_WHEELS] {
        self.duty
    }

    pub fn brake_count(&self) -> usize {
        self.brakes
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }
}

impl Default for SimActuator {
    fn default() -> Self {
        Self::new()
    }
}

impl Actuator for SimActuator {
    fn set_duties(&mut self, actuation: &WheelActuation) -> Result<(), BridgeError> {
        self.duty = actuation.duty;
        self.writes += 1;
        debug!(
            "[SimActuator] duties FL={:.2} FR={:.2} RL={:.2} RR={:.2}",
            self.duty[0], self.duty[1], self.duty[2], self.duty[3]
        );
        Ok(())
    }

    fn brake(&mut self) -> Result<(), BridgeError> {
        self.duty = [0.0; NUM_WHEELS];
        self.brakes += 1;
        info!("[SimActuator] brake");
        Ok(())
    }

    fn read_wheel_rates(&mut self) -> Option<WheelRates> {
        self.encoder_full_scale
            .map(|full_scale| WheelRates(self.duty.map(|d| d * full_scale)))
    }

    fn name(&self) -> &'static str {
        "sim"
    }
}

/// Pause before polling encoders again after a failed read
pub const ENCODER_RETRY: Duration = Duration::from_secs(1);

/// Tracks encoder read failures so a dead feed is not polled every tick
#[derive(Debug, Clone, Default)]
struct EncoderBackoff {
    retry_at: Option<Instant>,
}

impl EncoderBackoff {
    fn ready(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| now >= at)
    }

    /// Returns true on the first failure of a run
    fn failed(&mut self, now: Instant) -> bool {
        let first = self.retry_at.is_none();
        self.retry_at = Some(now + ENCODER_RETRY);
        first
    }

    /// Returns true if the feed was faulted before
    fn restored(&mut self) -> bool {
        self.retry_at.take().is_some()
    }
}

/// Actuator backed by the serial motor bridge
pub struct BridgeActuator {
    bridge: MotorBridge,
    read_encoders: bool,
    backoff: EncoderBackoff,
}

impl BridgeActuator {
    /// Wrap an opened bridge, checking it answers
    pub fn new(mut bridge: MotorBridge, read_encoders: bool) -> Result<Self, BridgeError> {
        if !bridge.ping()? {
            warn!("Motor bridge {} not responding to ping", bridge.id());
            return Err(BridgeError::Timeout { id: bridge.id() });
        }
        match bridge.firmware_version() {
            Ok(version) => info!("Motor bridge {} firmware v{}", bridge.id(), version),
            Err(e) => warn!("Could not read bridge firmware version: {}", e),
        }
        bridge.brake()?;
        Ok(Self {
            bridge,
            read_encoders,
            backoff: EncoderBackoff::default(),
        })
    }

    pub fn open(port: &str, baudrate: u32, id: u8, read_encoders: bool) -> Result<Self, BridgeError> {
        info!("Opening motor bridge on {} at {} baud", port, baudrate);
        let bridge = MotorBridge::open_with(port, baudrate, id)?;
        Self::new(bridge, read_encoders)
    }
}

impl Actuator for BridgeActuator {
    fn set_duties(&mut self, actuation: &WheelActuation) -> Result<(), BridgeError> {
        self.bridge.write_duties(&actuation.duty)
    }

    fn brake(&mut self) -> Result<(), BridgeError> {
        info!("Braking all wheels");
        self.bridge.brake()
    }

    fn read_wheel_rates(&mut self) -> Option<WheelRates> {
        let now = Instant::now();
        if !self.read_encoders || !self.backoff.ready(now) {
            return None;
        }
        match self.bridge.read_wheel_rates() {
            Ok(rates) => {
                if self.backoff.restored() {
                    info!("Encoder feed restored");
                }
                Some(rates)
            }
            Err(e) => {
                if self.backoff.failed(now) {
                    warn!("Encoder read failed ({}), running open loop", e);
                }
                None
            }
        }
    }

    fn name(&self) -> &'static str {
        "bridge"
    }
}

impl Drop for BridgeActuator {
    fn drop(&mut self) {
        // Leave the wheels stopped
        if let Err(e) = self.bridge.brake() {
            warn!("Failed to brake on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_records_duties() {
        let mut sim = SimActuator::new();
        sim.set_duties(&WheelActuation::from_duties([0.5, -0.5, 0.25, 0.0]))
            .unwrap();
        assert_eq!(sim.duty(), [0.5, -0.5, 0.25, 0.0]);
        assert_eq!(sim.read_wheel_rates(), None);

        sim.brake().unwrap();
        assert_eq!(sim.duty(), [0.0; 4]);
        assert_eq!(sim.brake_count(), 1);
    }

    #[test]
    fn test_encoder_backoff_skips_reads_after_failure() {
        let t0 = Instant::now();
        let mut backoff = EncoderBackoff::default();
        assert!(backoff.ready(t0));

        assert!(backoff.failed(t0));
        assert!(!backoff.ready(t0 + Duration::from_millis(20)));
        assert!(!backoff.ready(t0 + ENCODER_RETRY - Duration::from_millis(1)));
        assert!(backoff.ready(t0 + ENCODER_RETRY));

        // Another failure pushes the retry out without logging again
        let t1 = t0 + ENCODER_RETRY;
        assert!(!backoff.failed(t1));
        assert!(!backoff.ready(t1 + Duration::from_millis(500)));

        assert!(backoff.restored());
        assert!(backoff.ready(t1));
        assert!(!backoff.restored());
    }

    #[test]
    fn test_sim_encoders_follow_duty() {
        let mut sim = SimActuator::with_encoders(8.0);
        sim.set_duties(&WheelActuation::from_duties([0.5, -1.0, 0.0, 0.25]))
            .unwrap();
        let rates = sim.read_wheel_rates().unwrap();
        assert_eq!(rates.as_array(), [4.0, -8.0, 0.0, 2.0]);
    }
}
