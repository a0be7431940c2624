// Autonomous navigation: occupancy grid, A* planner, waypoint follower

pub mod astar;
pub mod follower;
pub mod grid;

pub use astar::{Path, plan};
pub use follower::{GoalRequest, NavParams, NavState, NavStep, Navigator, PlanTicket};
pub use grid::{Cell, OccupancyGrid, Pose};
