// A* path planner over a 4-connected occupancy grid.
//
// Manhattan heuristic, unit step cost. Open-set ordering is lowest f first,
// then lowest g, then insertion order, so repeated runs return the same path.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use tracing::{debug, trace};

use super::grid::{Cell, OccupancyGrid};

/// Waypoints from start to goal inclusive; empty when unreachable
pub type Path = VecDeque<Cell>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenNode {
    cell: Cell,
    g: u32,
    f: u32,
    seq: u64,
}

impl Ord for OpenNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior
        other
            .f
            .cmp(&self.f)
            .then_with(|| other.g.cmp(&self.g))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for OpenNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Plan a path from `start` to `goal`
pub fn plan(grid: &OccupancyGrid, start: Cell, goal: Cell) -> Path {
    if !grid.is_free(start) || !grid.is_free(goal) {
        debug!("[AStar] start {:?} or goal {:?} blocked or out of bounds", start, goal);
        return Path::new();
    }

    let mut open = BinaryHeap::new();
    let mut came_from: HashMap<Cell, Cell> = HashMap::new();
    let mut g_costs: HashMap<Cell, u32> = HashMap::new();
    let mut seq = 0u64;

    g_costs.insert(start, 0);
    open.push(OpenNode {
        cell: start,
        g: 0,
        f: start.manhattan(&goal),
        seq,
    });

    let mut expanded = 0usize;
    while let Some(node) = open.pop() {
        if node.cell == goal {
            let path = reconstruct(&came_from, goal);
            debug!(
                "[AStar] {:?} -> {:?}: {} waypoints, {} nodes expanded",
                start,
                goal,
                path.len(),
                expanded
            );
            return path;
        }

        // Stale entry superseded by a cheaper one
        if g_costs.get(&node.cell).is_some_and(|&g| node.g > g) {
            continue;
        }
        expanded += 1;

        for next in node.cell.neighbors_4() {
            if !grid.is_free(next) {
                continue;
            }
            let g = node.g + 1;
            if g_costs.get(&next).is_some_and(|&known| known <= g) {
                continue;
            }
            g_costs.insert(next, g);
            came_from.insert(next, node.cell);
            seq += 1;
            open.push(OpenNode {
                cell: next,
                g,
                f: g + next.manhattan(&goal),
                seq,
            });
        }
    }

    trace!("[AStar] frontier exhausted after {} nodes", expanded);
    Path::new()
}

fn reconstruct(came_from: &HashMap<Cell, Cell>, goal: Cell) -> Path {
    let mut path = Path::new();
    let mut current = goal;
    path.push_front(current);
    while let Some(&prev) = came_from.get(&current) {
        path.push_front(prev);
        current = prev;
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_connected(path: &Path) {
        for pair in path.iter().collect::<Vec<_>>().windows(2) {
            assert_eq!(pair[0].manhattan(pair[1]), 1, "gap between {:?}", pair);
        }
    }

    #[test]
    fn test_open_grid_is_manhattan_optimal() {
        for (w, h) in [(5, 5), (8, 3), (1, 6), (12, 9)] {
            let grid = OccupancyGrid::new(w, h);
            let goal = Cell::new(w as i32 - 1, h as i32 - 1);
            let path = plan(&grid, Cell::new(0, 0), goal);
            assert_eq!(path.len(), (w - 1) + (h - 1) + 1);
            assert_eq!(path.front(), Some(&Cell::new(0, 0)));
            assert_eq!(path.back(), Some(&goal));
            assert_connected(&path);
        }
    }

    #[test]
    fn test_start_equals_goal() {
        let grid = OccupancyGrid::new(3, 3);
        let path = plan(&grid, Cell::new(1, 1), Cell::new(1, 1));
        assert_eq!(path, Path::from(vec![Cell::new(1, 1)]));
    }

    #[test]
    fn test_goal_on_obstacle_is_empty() {
        let grid = OccupancyGrid::from_rows(&["...", "..#", "..."]);
        assert!(plan(&grid, Cell::new(0, 0), Cell::new(2, 1)).is_empty());
    }

    #[test]
    fn test_enclosed_goal_is_empty() {
        let grid = OccupancyGrid::from_rows(&[
            ".....", //
            "..#..", //
            ".#.#.", //
            "..#..", //
            ".....",
        ]);
        assert!(plan(&grid, Cell::new(0, 0), Cell::new(2, 2)).is_empty());
    }

    #[test]
    fn test_out_of_bounds_is_empty() {
        let grid = OccupancyGrid::new(4, 4);
        assert!(plan(&grid, Cell::new(0, 0), Cell::new(4, 0)).is_empty());
        assert!(plan(&grid, Cell::new(-1, 0), Cell::new(3, 3)).is_empty());
    }

    #[test]
    fn test_routes_around_wall() {
        let grid = OccupancyGrid::from_rows(&[
            ".#...", //
            ".#.#.", //
            ".#.#.", //
            "...#.",
        ]);
        let path = plan(&grid, Cell::new(0, 0), Cell::new(4, 0));
        assert_connected(&path);
        assert!(path.iter().all(|&c| grid.is_free(c)));
        // down column 0, along row 3, up column 2, along row 0
        assert_eq!(path.len(), 11);
        assert!(path.contains(&Cell::new(2, 3)));
    }

    #[test]
    fn test_deterministic() {
        let grid = OccupancyGrid::from_rows(&["......", "..##..", "......", ".#..#."]);
        let a = plan(&grid, Cell::new(0, 0), Cell::new(5, 3));
        let b = plan(&grid, Cell::new(0, 0), Cell::new(5, 3));
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }
}
