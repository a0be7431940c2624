// Per-wheel PID speed controller
//
// Error is target - measured. Integral anti-windup is by clamping.
// Time step comes from the wall clock and is floored at MIN_DT.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::kinematics::{NUM_WHEELS, WheelRates};

/// Smallest time step used for integration and differentiation
pub const MIN_DT: Duration = Duration::from_millis(1);

/// Gains and limits for one controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    #[serde(default = "default_limit")]
    pub i_limit: f32,
    #[serde(default = "default_limit")]
    pub out_limit: f32,
}

fn default_limit() -> f32 {
    1.0
}

impl PidGains {
    pub fn new(kp: f32, ki: f32, kd: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            i_limit: default_limit(),
            out_limit: default_limit(),
        }
    }
}

/// PID controller for a single wheel
#[derive(Debug, Clone)]
pub struct Pid {
    gains: PidGains,
    integral: f32,
    prev_error: f32,
    prev_time: Option<Instant>,
}

impl Pid {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            prev_error: 0.0,
            prev_time: None,
        }
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn prev_error(&self) -> f32 {
        self.prev_error
    }

    /// Clear integral, previous error and previous timestamp
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.prev_time = None;
    }

    /// Run one control step against the wall clock
    pub fn update(&mut self, target: f32, measured: f32) -> f32 {
        self.update_at(target, measured, Instant::now())
    }

    /// Run one control step at an explicit timestamp
    ///
    /// Returns a value in `[-out_limit, out_limit]`. Non-finite input yields 0
    /// and leaves the controller state untouched.
    pub fn update_at(&mut self, target: f32, measured: f32, now: Instant) -> f32 {
        let error = target - measured;
        if !error.is_finite() {
            return 0.0;
        }

        let elapsed = match self.prev_time {
            Some(prev) => now.saturating_duration_since(prev),
            None => MIN_DT,
        };
        let dt = elapsed.max(MIN_DT).as_secs_f32();

        let i_limit = self.gains.i_limit.abs();
        let integral = (self.integral + error * dt).clamp(-i_limit, i_limit);
        let derivative = (error - self.prev_error) / dt;

        let raw = self.gains.kp * error + self.gains.ki * integral + self.gains.kd * derivative;
        if !raw.is_finite() {
            return 0.0;
        }

        self.integral = integral;
        self.prev_error = error;
        self.prev_time = Some(now);

        let out_limit = self.gains.out_limit.abs();
        raw.clamp(-out_limit, out_limit)
    }
}

/// Four controllers in wheel order [FL, FR, RL, RR]
#[derive(Debug, Clone)]
pub struct PidBank {
    wheels: [Pid; NUM_WHEELS],
}

impl PidBank {
    pub fn new(gains: [PidGains; NUM_WHEELS]) -> Self {
        Self {
            wheels: gains.map(Pid::new),
        }
    }

    pub fn reset(&mut self) {
        for pid in &mut self.wheels {
            pid.reset();
        }
    }

    /// Update every wheel controller, preserving wheel order
    pub fn update_at(&mut self, targets: &WheelRates, measured: &WheelRates, now: Instant) -> [f32; NUM_WHEELS] {
        let mut out = [0.0; NUM_WHEELS];
        for (i, pid) in self.wheels.iter_mut().enumerate() {
            out[i] = pid.update_at(targets.0[i], measured.0[i], now);
        }
        out
    }

    pub fn wheel(&self, index: usize) -> Option<&Pid> {
        self.wheels.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gains() -> PidGains {
        PidGains {
            kp: 0.35,
            ki: 0.5,
            kd: 0.015,
            i_limit: 1.0,
            out_limit: 1.0,
        }
    }

    #[test]
    fn test_zero_error_gives_zero_output() {
        let mut pid = Pid::new(gains());
        let t0 = Instant::now();
        for i in 0..20 {
            let out = pid.update_at(2.0, 2.0, t0 + Duration::from_millis(20 * i));
            assert_eq!(out, 0.0);
        }
        assert_eq!(pid.integral(), 0.0);
    }

    #[test]
    fn test_sustained_error_saturates_output() {
        let mut pid = Pid::new(PidGains {
            kp: 0.1,
            ki: 2.0,
            kd: 0.0,
            i_limit: 1.0,
            out_limit: 0.8,
        });
        let t0 = Instant::now();
        let mut out = 0.0;
        for i in 0..200 {
            out = pid.update_at(1.0, 0.0, t0 + Duration::from_millis(20 * i));
        }
        assert_eq!(out, 0.8);
        assert_eq!(pid.integral(), 1.0);

        // Holds at the limit
        let held = pid.update_at(1.0, 0.0, t0 + Duration::from_millis(20 * 201));
        assert_eq!(held, 0.8);
    }

    #[test]
    fn test_first_call_uses_min_dt() {
        let mut pid = Pid::new(PidGains {
            kp: 0.0,
            ki: 1.0,
            kd: 0.0,
            i_limit: 10.0,
            out_limit: 10.0,
        });
        let out = pid.update_at(1.0, 0.0, Instant::now());
        assert!((out - 0.001).abs() < 1e-6);
    }

    #[test]
    fn test_repeated_timestamp_is_floored() {
        let mut pid = Pid::new(gains());
        let t = Instant::now();
        pid.update_at(0.0, 0.0, t);
        let out = pid.update_at(0.5, 0.0, t);
        assert!(out.is_finite());
        assert!(out.abs() <= 1.0);
    }

    #[test]
    fn test_reset_matches_fresh_instance() {
        let t0 = Instant::now();
        let mut used = Pid::new(gains());
        for i in 0..10 {
            used.update_at(1.5, 0.2, t0 + Duration::from_millis(20 * i));
        }
        used.reset();
        assert_eq!(used.integral(), 0.0);
        assert_eq!(used.prev_error(), 0.0);

        let mut fresh = Pid::new(gains());
        let t1 = t0 + Duration::from_secs(5);
        assert_eq!(used.update_at(0.7, 0.1, t1), fresh.update_at(0.7, 0.1, t1));
    }

    #[test]
    fn test_non_finite_input_outputs_zero() {
        let mut pid = Pid::new(gains());
        let t0 = Instant::now();
        pid.update_at(1.0, 0.0, t0);
        let integral = pid.integral();

        assert_eq!(pid.update_at(f32::NAN, 0.0, t0 + MIN_DT), 0.0);
        assert_eq!(pid.update_at(1.0, f32::INFINITY, t0 + MIN_DT), 0.0);
        assert_eq!(pid.integral(), integral);
    }

    #[test]
    fn test_bank_keeps_wheels_independent() {
        let mut bank = PidBank::new([gains(); 4]);
        let targets = WheelRates([1.0, 0.0, -1.0, 0.0]);
        let measured = WheelRates::zero();
        let out = bank.update_at(&targets, &measured, Instant::now());
        assert!(out[0] > 0.0);
        assert_eq!(out[1], 0.0);
        assert!(out[2] < 0.0);
        assert_eq!(out[3], 0.0);
        assert_eq!(bank.wheel(1).map(|p| p.integral()), Some(0.0));
    }
}
