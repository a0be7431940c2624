// Waypoint follower for autonomous mode.
//
// Owns the goal, the remaining waypoint queue and the pose estimate behind a
// single mutex. Goal requests and per-tick steps are the only writers. The
// mutex is never held while the planner runs, so a tick never waits on a
// search.
//
// Policy is stop-and-advance: when the pose is within the arrival tolerance of
// the head waypoint the waypoint is popped and that tick emits zero velocity.
// Otherwise the follower emits a velocity proportional to the remaining
// vector. Heading is not controlled.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::astar::{self, Path};
use super::grid::{Cell, OccupancyGrid, Pose};
use crate::messages::{BodyVelocity, NavEvent};

/// Follower state machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavState {
    #[default]
    Idle,
    Planning,
    Following,
    Arrived,
}

/// Tuning for the follower
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NavParams {
    /// Manhattan distance under which a waypoint counts as reached
    pub arrival_tolerance: f32,
    /// Proportional gain from position error to velocity
    pub gain: f32,
    pub max_vx: f32,
    pub max_vy: f32,
    /// Integrate emitted velocity into the pose when no estimate arrives
    pub dead_reckoning: bool,
}

impl Default for NavParams {
    fn default() -> Self {
        Self {
            arrival_tolerance: 0.2,
            gain: 0.2,
            max_vx: 0.8,
            max_vy: 0.8,
            dead_reckoning: true,
        }
    }
}

/// Pending search for a goal, valid until the next goal request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanTicket {
    request: u64,
    goal: Cell,
    start: Cell,
}

impl PlanTicket {
    pub fn goal(&self) -> Cell {
        self.goal
    }
}

/// Outcome of recording a goal change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalRequest {
    Cleared,
    Plan(PlanTicket),
}

/// Output of one follower tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NavStep {
    pub velocity: BodyVelocity,
    pub event: Option<NavEvent>,
}

#[derive(Debug, Default)]
struct NavInner {
    state: NavState,
    goal: Option<Cell>,
    path: Path,
    pose: Pose,
    // Bumped on every goal request so a stale plan is never installed
    request: u64,
}

pub struct Navigator {
    grid: OccupancyGrid,
    params: NavParams,
    inner: Mutex<NavInner>,
}

impl Navigator {
    pub fn new(grid: OccupancyGrid, params: NavParams, pose: Pose) -> Self {
        Self {
            grid,
            params,
            inner: Mutex::new(NavInner {
                pose,
                ..NavInner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NavInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn grid(&self) -> &OccupancyGrid {
        &self.grid
    }

    pub fn params(&self) -> NavParams {
        self.params
    }

    pub fn state(&self) -> NavState {
        self.lock().state
    }

    pub fn goal(&self) -> Option<Cell> {
        self.lock().goal
    }

    pub fn pose(&self) -> Pose {
        self.lock().pose
    }

    /// Snapshot of the remaining waypoints
    pub fn remaining(&self) -> Vec<Cell> {
        self.lock().path.iter().copied().collect()
    }

    /// Replace the pose estimate; non-finite estimates are dropped
    pub fn set_pose(&self, pose: Pose) -> bool {
        if !pose.is_finite() {
            warn!("Ignoring non-finite pose estimate {:?}", pose);
            return false;
        }
        self.lock().pose = pose;
        true
    }

    /// Set or clear the goal, planning on the caller's thread
    ///
    /// Do not call it from the control tick. Returns `None` if a newer
    /// request superseded this one while it was planning.
    pub fn set_goal(&self, goal: Option<Cell>) -> Option<NavEvent> {
        match self.request_goal(goal) {
            GoalRequest::Cleared => Some(NavEvent::GoalCleared),
            GoalRequest::Plan(ticket) => self.complete_plan(ticket),
        }
    }

    /// Record a goal change in arrival order without planning
    ///
    /// Every call supersedes any plan still in flight. A cleared goal takes
    /// effect immediately; a new goal moves to `Planning` and returns the
    /// ticket to hand to [`Navigator::complete_plan`].
    pub fn request_goal(&self, goal: Option<Cell>) -> GoalRequest {
        let mut inner = self.lock();
        inner.request += 1;
        inner.path.clear();
        inner.goal = goal;

        match goal {
            None => {
                inner.state = NavState::Idle;
                info!("Goal cleared");
                GoalRequest::Cleared
            }
            Some(goal) => {
                inner.state = NavState::Planning;
                GoalRequest::Plan(PlanTicket {
                    request: inner.request,
                    goal,
                    start: inner.pose.cell(),
                })
            }
        }
    }

    /// Run the search for a ticket and install the result if still current
    ///
    /// The lock is not held during the search.
    pub fn complete_plan(&self, ticket: PlanTicket) -> Option<NavEvent> {
        let PlanTicket { request, goal, start } = ticket;
        let path = astar::plan(&self.grid, start, goal);

        let mut inner = self.lock();
        if inner.request != request {
            debug!("Discarding plan to {:?}, superseded", goal);
            return None;
        }

        if path.is_empty() {
            warn!("Goal {:?} unreachable from {:?}", goal, start);
            inner.goal = None;
            inner.state = NavState::Idle;
            return Some(NavEvent::GoalUnreachable { goal });
        }

        let waypoints = path.len();
        info!("Planned {} waypoints from {:?} to {:?}", waypoints, start, goal);
        inner.path = path;
        inner.state = NavState::Following;
        Some(NavEvent::PathPlanned { goal, waypoints })
    }

    /// Advance the follower by one tick of length `dt` seconds
    pub fn step(&self, dt: f32) -> NavStep {
        let mut inner = self.lock();
        if inner.state != NavState::Following {
            return NavStep::default();
        }
        let Some(&head) = inner.path.front() else {
            return NavStep::default();
        };

        let pose = inner.pose;
        let dx = head.x as f32 - pose.x;
        let dy = head.y as f32 - pose.y;

        if dx.abs() + dy.abs() < self.params.arrival_tolerance {
            inner.path.pop_front();
            let remaining = inner.path.len();
            let event = if remaining == 0 {
                inner.state = NavState::Arrived;
                let goal = inner.goal.unwrap_or(head);
                info!("Arrived at {:?}", goal);
                NavEvent::Arrived { goal }
            } else {
                debug!("Waypoint {:?} reached, {} remaining", head, remaining);
                NavEvent::WaypointReached { cell: head, remaining }
            };
            return NavStep {
                velocity: BodyVelocity::zero(),
                event: Some(event),
            };
        }

        let velocity = self.track(dx, dy, pose.theta);
        if self.params.dead_reckoning && dt.is_finite() && dt > 0.0 {
            inner.pose = integrate(pose, &velocity, dt);
        }

        NavStep {
            velocity,
            event: None,
        }
    }

    /// Proportional velocity toward a world-frame error, expressed in the body frame
    fn track(&self, dx: f32, dy: f32, theta: f32) -> BodyVelocity {
        let (sin, cos) = theta.sin_cos();
        let vx = self.params.gain * (cos * dx + sin * dy);
        let vy = self.params.gain * (-sin * dx + cos * dy);

        // Uniform scaling keeps the direction when a limit is hit
        let mut scale: f32 = 1.0;
        if vx.abs() > self.params.max_vx {
            scale = scale.min(self.params.max_vx / vx.abs());
        }
        if vy.abs() > self.params.max_vy {
            scale = scale.min(self.params.max_vy / vy.abs());
        }

        BodyVelocity::new(vx * scale, vy * scale, 0.0)
    }
}

/// Move a pose by a body-frame velocity over `dt`
fn integrate(pose: Pose, velocity: &BodyVelocity, dt: f32) -> Pose {
    let (sin, cos) = pose.theta.sin_cos();
    let wx = cos * velocity.vx - sin * velocity.vy;
    let wy = sin * velocity.vx + cos * velocity.vy;
    Pose::new(
        pose.x + wx * dt,
        pose.y + wy * dt,
        pose.theta + velocity.omega * dt,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 0.02;

    fn navigator(width: usize, height: usize) -> Navigator {
        Navigator::new(
            OccupancyGrid::new(width, height),
            NavParams::default(),
            Pose::default(),
        )
    }

    #[test]
    fn test_idle_emits_zero() {
        let nav = navigator(5, 5);
        nav.set_pose(Pose::new(3.0, 1.0, 0.0));
        let step = nav.step(DT);
        assert!(step.velocity.is_zero());
        assert_eq!(step.event, None);
        assert_eq!(nav.state(), NavState::Idle);
    }

    #[test]
    fn test_set_goal_plans_path() {
        let nav = navigator(5, 5);
        let event = nav.set_goal(Some(Cell::new(4, 4)));
        assert_eq!(
            event,
            Some(NavEvent::PathPlanned {
                goal: Cell::new(4, 4),
                waypoints: 9
            })
        );
        assert_eq!(nav.state(), NavState::Following);
        assert_eq!(nav.remaining().len(), 9);
    }

    #[test]
    fn test_unreachable_goal_returns_to_idle() {
        let grid = OccupancyGrid::from_rows(&["..#..", ".#.#.", "..#.."]);
        let nav = Navigator::new(grid, NavParams::default(), Pose::default());
        let event = nav.set_goal(Some(Cell::new(2, 1)));
        assert_eq!(event, Some(NavEvent::GoalUnreachable { goal: Cell::new(2, 1) }));
        assert_eq!(nav.state(), NavState::Idle);
        assert_eq!(nav.goal(), None);
        assert!(nav.step(DT).velocity.is_zero());
    }

    #[test]
    fn test_sole_waypoint_within_tolerance_is_popped() {
        let nav = navigator(5, 5);
        nav.set_pose(Pose::new(2.0, 3.0, 0.0));
        nav.set_goal(Some(Cell::new(2, 3)));
        assert_eq!(nav.remaining(), vec![Cell::new(2, 3)]);

        nav.set_pose(Pose::new(2.05, 2.9, 0.0));
        let step = nav.step(DT);
        assert!(step.velocity.is_zero());
        assert_eq!(step.event, Some(NavEvent::Arrived { goal: Cell::new(2, 3) }));
        assert!(nav.remaining().is_empty());
        assert_eq!(nav.state(), NavState::Arrived);

        // Empty queue stays still wherever the pose goes
        nav.set_pose(Pose::new(0.0, 0.0, 0.0));
        assert!(nav.step(DT).velocity.is_zero());
    }

    #[test]
    fn test_velocity_proportional_to_error() {
        let nav = navigator(5, 5);
        nav.set_goal(Some(Cell::new(0, 1)));
        // Head is the start cell, popped first
        assert!(nav.step(DT).velocity.is_zero());

        let step = nav.step(DT);
        assert!((step.velocity.vx - 0.0).abs() < 1e-6);
        assert!((step.velocity.vy - 0.2).abs() < 1e-6);
        assert_eq!(step.velocity.omega, 0.0);
        // Dead reckoning moved the pose toward the waypoint
        assert!((nav.pose().y - 0.2 * DT).abs() < 1e-6);
    }

    #[test]
    fn test_velocity_is_rotated_into_body_frame() {
        let nav = navigator(5, 5);
        nav.set_goal(Some(Cell::new(1, 0)));
        nav.step(DT);
        // A quarter turn ccw puts a +x waypoint straight behind
        nav.set_pose(Pose::new(0.0, 0.0, std::f32::consts::FRAC_PI_2));
        let step = nav.step(DT);
        assert!(step.velocity.vx.abs() < 1e-6);
        assert!((step.velocity.vy + 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_velocity_limit_keeps_direction() {
        let params = NavParams {
            gain: 1.0,
            max_vx: 0.5,
            max_vy: 0.5,
            ..NavParams::default()
        };
        let nav = Navigator::new(OccupancyGrid::new(10, 10), params, Pose::default());
        nav.set_goal(Some(Cell::new(2, 1)));
        nav.set_pose(Pose::new(0.0, -1.0, 0.0)); // far from the head (0,0) along y only
        let step = nav.step(DT);
        assert!((step.velocity.vy - 0.5).abs() < 1e-6);
        assert_eq!(step.velocity.vx, 0.0);
    }

    #[test]
    fn test_clear_goal_discards_path() {
        let nav = navigator(5, 5);
        nav.set_goal(Some(Cell::new(3, 3)));
        assert_eq!(nav.set_goal(None), Some(NavEvent::GoalCleared));
        assert_eq!(nav.state(), NavState::Idle);
        assert!(nav.remaining().is_empty());
        assert!(nav.step(DT).velocity.is_zero());
    }

    #[test]
    fn test_follows_to_arrival() {
        let nav = navigator(5, 5);
        nav.set_goal(Some(Cell::new(4, 4)));

        let mut arrived = false;
        for _ in 0..20_000 {
            let step = nav.step(DT);
            if let Some(NavEvent::Arrived { goal }) = step.event {
                assert_eq!(goal, Cell::new(4, 4));
                arrived = true;
                break;
            }
        }
        assert!(arrived);
        let pose = nav.pose();
        assert!((pose.x - 4.0).abs() + (pose.y - 4.0).abs() < 0.2);
        for _ in 0..10 {
            assert!(nav.step(DT).velocity.is_zero());
        }
    }

    #[test]
    fn test_superseded_plan_is_not_installed() {
        let nav = navigator(5, 5);
        let GoalRequest::Plan(first) = nav.request_goal(Some(Cell::new(4, 4))) else {
            panic!("expected a plan ticket");
        };
        let GoalRequest::Plan(second) = nav.request_goal(Some(Cell::new(0, 3))) else {
            panic!("expected a plan ticket");
        };
        assert_eq!(nav.state(), NavState::Planning);

        assert_eq!(nav.complete_plan(first), None);
        assert_eq!(nav.state(), NavState::Planning);
        assert!(nav.remaining().is_empty());

        assert_eq!(
            nav.complete_plan(second),
            Some(NavEvent::PathPlanned {
                goal: Cell::new(0, 3),
                waypoints: 4
            })
        );
        assert_eq!(nav.remaining().last(), Some(&Cell::new(0, 3)));
    }

    #[test]
    fn test_clear_before_plan_finishes_stays_idle() {
        let nav = navigator(40, 30);
        let GoalRequest::Plan(ticket) = nav.request_goal(Some(Cell::new(39, 29))) else {
            panic!("expected a plan ticket");
        };
        assert_eq!(nav.request_goal(None), GoalRequest::Cleared);

        assert_eq!(nav.complete_plan(ticket), None);
        assert_eq!(nav.state(), NavState::Idle);
        assert_eq!(nav.goal(), None);
        assert!(nav.remaining().is_empty());
        assert!(nav.step(DT).velocity.is_zero());
    }

    #[test]
    fn test_plan_on_another_thread_while_clearing() {
        let nav = std::sync::Arc::new(navigator(40, 30));
        for _ in 0..50 {
            let GoalRequest::Plan(ticket) = nav.request_goal(Some(Cell::new(39, 29))) else {
                panic!("expected a plan ticket");
            };
            let planner = {
                let nav = nav.clone();
                std::thread::spawn(move || nav.complete_plan(ticket))
            };
            nav.request_goal(None);
            // Whether the plan landed before or after the clear, the clear wins
            planner.join().unwrap();
            assert_eq!(nav.state(), NavState::Idle);
            assert!(nav.remaining().is_empty());
        }
    }

    #[test]
    fn test_non_finite_pose_rejected() {
        let nav = navigator(3, 3);
        assert!(!nav.set_pose(Pose::new(f32::NAN, 0.0, 0.0)));
        assert_eq!(nav.pose(), Pose::default());
    }
}
