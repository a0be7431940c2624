// Static occupancy grid and cell/pose types.

use serde::{Deserialize, Serialize};

/// Integer grid cell index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

impl Cell {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// 4-connected neighbors in a fixed order: +x, -x, +y, -y
    pub fn neighbors_4(&self) -> [Cell; 4] {
        [
            Cell::new(self.x + 1, self.y),
            Cell::new(self.x - 1, self.y),
            Cell::new(self.x, self.y + 1),
            Cell::new(self.x, self.y - 1),
        ]
    }

    pub fn manhattan(&self, other: &Cell) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }
}

/// Vehicle pose in grid units, heading in radians
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub theta: f32,
}

impl Pose {
    pub fn new(x: f32, y: f32, theta: f32) -> Self {
        Self { x, y, theta }
    }

    /// Nearest grid cell
    pub fn cell(&self) -> Cell {
        Cell::new(self.x.round() as i32, self.y.round() as i32)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.theta.is_finite()
    }
}

/// Free/obstacle grid, row-major, read-only while planning
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyGrid {
    width: usize,
    height: usize,
    blocked: Vec<bool>,
}

impl OccupancyGrid {
    /// All-free grid
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            blocked: vec![false; width * height],
        }
    }

    /// Build from text rows, `#` marks an obstacle; row 0 is y = 0
    pub fn from_rows(rows: &[&str]) -> Self {
        let height = rows.len();
        let width = rows.iter().map(|r| r.chars().count()).max().unwrap_or(0);
        let mut grid = Self::new(width, height);
        for (y, row) in rows.iter().enumerate() {
            for (x, c) in row.chars().enumerate() {
                if c == '#' {
                    grid.blocked[y * width + x] = true;
                }
            }
        }
        grid
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    fn index(&self, cell: Cell) -> Option<usize> {
        if cell.x < 0 || cell.y < 0 {
            return None;
        }
        let (x, y) = (cell.x as usize, cell.y as usize);
        (x < self.width && y < self.height).then(|| y * self.width + x)
    }

    pub fn in_bounds(&self, cell: Cell) -> bool {
        self.index(cell).is_some()
    }

    /// In bounds and not an obstacle
    pub fn is_free(&self, cell: Cell) -> bool {
        self.index(cell).is_some_and(|i| !self.blocked[i])
    }

    /// Mark a cell as an obstacle; returns false if out of bounds
    pub fn set_obstacle(&mut self, cell: Cell) -> bool {
        match self.index(cell) {
            Some(i) => {
                self.blocked[i] = true;
                true
            }
            None => false,
        }
    }

    pub fn obstacle_count(&self) -> usize {
        self.blocked.iter().filter(|&&b| b).count()
    }
}
