//! Integer world coordinates: blocks, 16³ sections and vertical columns.

use serde::{Deserialize, Serialize};

/// Edge length of a section, in blocks.
pub const SECTION_SIZE: i32 = 16;

const SECTION_SHIFT: i32 = 4;
const SECTION_MASK: i32 = SECTION_SIZE - 1;

/// A single block coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub const fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    /// The neighbour across face `dir`.
    pub const fn step(self, dir: Direction) -> Self {
        let (dx, dy, dz) = dir.delta();
        self.offset(dx, dy, dz)
    }

    /// The six face-adjacent positions, in -x, +x, -y, +y, -z, +z order.
    pub const fn adjacent(self) -> [BlockPos; 6] {
        [
            self.offset(-1, 0, 0),
            self.offset(1, 0, 0),
            self.offset(0, -1, 0),
            self.offset(0, 1, 0),
            self.offset(0, 0, -1),
            self.offset(0, 0, 1),
        ]
    }

    pub const fn section(self) -> SectionPos {
        SectionPos::new(
            self.x >> SECTION_SHIFT,
            self.y >> SECTION_SHIFT,
            self.z >> SECTION_SHIFT,
        )
    }

    pub const fn column(self) -> ColumnPos {
        ColumnPos::new(self.x >> SECTION_SHIFT, self.z >> SECTION_SHIFT)
    }

    /// Position inside the owning section, packed as `y << 8 | z << 4 | x`.
    pub const fn local_index(self) -> u16 {
        (((self.y & SECTION_MASK) << 8) | ((self.z & SECTION_MASK) << 4) | (self.x & SECTION_MASK))
            as u16
    }
}

impl std::fmt::Display for BlockPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// A 16×16×16 section of blocks, addressed in section units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectionPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl SectionPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub const fn column(self) -> ColumnPos {
        ColumnPos::new(self.x, self.z)
    }

    /// Lowest-coordinate block of this section.
    pub const fn origin(self) -> BlockPos {
        BlockPos::new(
            self.x << SECTION_SHIFT,
            self.y << SECTION_SHIFT,
            self.z << SECTION_SHIFT,
        )
    }

    /// Rebuild a block position from a packed [`BlockPos::local_index`].
    pub const fn block_at(self, local: u16) -> BlockPos {
        let local = local as i32;
        self.origin().offset(
            local & SECTION_MASK,
            (local >> 8) & SECTION_MASK,
            (local >> 4) & SECTION_MASK,
        )
    }

    pub const fn contains(self, pos: BlockPos) -> bool {
        let s = pos.section();
        s.x == self.x && s.y == self.y && s.z == self.z
    }
}

impl std::fmt::Display for SectionPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}, {}]", self.x, self.y, self.z)
    }
}

/// One of the six block faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    West,
    East,
    Down,
    Up,
    North,
    South,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Direction {
    /// Same order as [`BlockPos::adjacent`].
    pub const ALL: [Direction; 6] = [
        Direction::West,
        Direction::East,
        Direction::Down,
        Direction::Up,
        Direction::North,
        Direction::South,
    ];

    pub const fn axis(self) -> Axis {
        match self {
            Direction::West | Direction::East => Axis::X,
            Direction::Down | Direction::Up => Axis::Y,
            Direction::North | Direction::South => Axis::Z,
        }
    }

    pub const fn opposite(self) -> Direction {
        match self {
            Direction::West => Direction::East,
            Direction::East => Direction::West,
            Direction::Down => Direction::Up,
            Direction::Up => Direction::Down,
            Direction::North => Direction::South,
            Direction::South => Direction::North,
        }
    }

    pub const fn delta(self) -> (i32, i32, i32) {
        match self {
            Direction::West => (-1, 0, 0),
            Direction::East => (1, 0, 0),
            Direction::Down => (0, -1, 0),
            Direction::Up => (0, 1, 0),
            Direction::North => (0, 0, -1),
            Direction::South => (0, 0, 1),
        }
    }

    /// The direction from `from` to `to` when they share a face.
    pub fn between(from: BlockPos, to: BlockPos) -> Option<Direction> {
        let delta = (to.x - from.x, to.y - from.y, to.z - from.z);
        Self::ALL.into_iter().find(|dir| dir.delta() == delta)
    }

    /// The four directions not on this direction's axis.
    pub fn perpendiculars(self) -> [Direction; 4] {
        let mut out = [self; 4];
        let others = Self::ALL.into_iter().filter(|dir| dir.axis() != self.axis());
        for (slot, dir) in out.iter_mut().zip(others) {
            *slot = dir;
        }
        out
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Direction::West => "west",
            Direction::East => "east",
            Direction::Down => "down",
            Direction::Up => "up",
            Direction::North => "north",
            Direction::South => "south",
        };
        f.write_str(name)
    }
}

/// A vertical column of sections, the unit of residency and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnPos {
    pub x: i32,
    pub z: i32,
}

impl ColumnPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub const fn section(self, y: i32) -> SectionPos {
        SectionPos::new(self.x, y, self.z)
    }
}

impl std::fmt::Display for ColumnPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}
