use std::collections::HashSet;
use std::hash::Hash;

use static_assertions::const_assert;

pub const CHUNK_SIZE: u32 = 64;
pub const CHUNK_PIXELS: usize = (CHUNK_SIZE * CHUNK_SIZE) as usize;

// Floor-aligned chunk math relies on a power-of-two size.
const_assert!(CHUNK_SIZE.is_power_of_two());
const_assert!(CHUNK_SIZE <= 1 << 15);

/// Palette index 0 is the transparent sentinel; 0xFF is reserved as the
/// wire-level "absent" marker and is never a valid reference.
pub const PALETTE_RESERVED_RAW: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PaletteRef(u8);

impl PaletteRef {
    pub const TRANSPARENT: Self = Self(0);

    pub fn new(index: u8) -> Option<Self> {
        if index == PALETTE_RESERVED_RAW {
            None
        } else {
            Some(Self(index))
        }
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn is_transparent(self) -> bool {
        self == Self::TRANSPARENT
    }
}

/// Absolute canvas coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn chunk_key(self) -> ChunkKey {
        ChunkKey::containing(self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pixel {
    pub x: i32,
    pub y: i32,
    pub color: PaletteRef,
}

impl Pixel {
    pub fn new(x: i32, y: i32, color: PaletteRef) -> Self {
        Self { x, y, color }
    }

    pub fn transparent(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            color: PaletteRef::TRANSPARENT,
        }
    }

    pub fn point(self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn chunk_key(self) -> ChunkKey {
        ChunkKey::containing(self.x, self.y)
    }
}

const CHUNK_SHIFT: u32 = CHUNK_SIZE.trailing_zeros();
const AXIS_BIAS: i64 = 1 << 31;
const AXIS_MASK: u64 = (1 << 32) - 1;

/// Floor-aligned origin of a `CHUNK_SIZE x CHUNK_SIZE` region.
///
/// ChunkKey:
/// | biased chunk_x (32) | biased chunk_y (32) |
/// 63                  32 31                  0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey(u64);

impl ChunkKey {
    /// Key of the chunk containing an absolute pixel coordinate.
    pub fn containing(x: i32, y: i32) -> Self {
        Self::from_chunk_coords(x >> CHUNK_SHIFT, y >> CHUNK_SHIFT)
    }

    pub fn from_origin(origin_x: i32, origin_y: i32) -> Self {
        Self::from_chunk_coords(origin_x >> CHUNK_SHIFT, origin_y >> CHUNK_SHIFT)
    }

    fn from_chunk_coords(chunk_x: i32, chunk_y: i32) -> Self {
        let biased_x = (chunk_x as i64 + AXIS_BIAS) as u64 & AXIS_MASK;
        let biased_y = (chunk_y as i64 + AXIS_BIAS) as u64 & AXIS_MASK;
        Self(biased_x << 32 | biased_y)
    }

    pub fn origin_x(self) -> i32 {
        let chunk_x = ((self.0 >> 32) as i64 - AXIS_BIAS) as i32;
        chunk_x << CHUNK_SHIFT
    }

    pub fn origin_y(self) -> i32 {
        let chunk_y = ((self.0 & AXIS_MASK) as i64 - AXIS_BIAS) as i32;
        chunk_y << CHUNK_SHIFT
    }

    /// Offset of an absolute coordinate inside this chunk, or `None` when
    /// the coordinate belongs to a different chunk.
    pub fn local_offset(self, x: i32, y: i32) -> Option<(u32, u32)> {
        if Self::containing(x, y) != self {
            return None;
        }
        let local_x = (x - self.origin_x()) as u32;
        let local_y = (y - self.origin_y()) as u32;
        Some((local_x, local_y))
    }

    pub fn local_index(self, x: i32, y: i32) -> Option<usize> {
        let (local_x, local_y) = self.local_offset(x, y)?;
        Some((local_y * CHUNK_SIZE + local_x) as usize)
    }
}

pub trait DedupKey {
    type Key: Eq + Hash;

    fn dedup_key(&self) -> Self::Key;
}

impl DedupKey for Pixel {
    type Key = (i32, i32);

    fn dedup_key(&self) -> Self::Key {
        (self.x, self.y)
    }
}

impl DedupKey for Point {
    type Key = (i32, i32);

    fn dedup_key(&self) -> Self::Key {
        (self.x, self.y)
    }
}

/// Deduplicate keeping the last occurrence per key, preserving the relative
/// order of the survivors.
pub fn dedup_last_wins<T: DedupKey>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    let mut kept: Vec<T> = items
        .into_iter()
        .rev()
        .filter(|item| seen.insert(item.dedup_key()))
        .collect();
    kept.reverse();
    kept
}

/// Distinct chunk keys touched by a point list, in first-touch order.
pub fn touched_chunk_keys(points: &[Point]) -> Vec<ChunkKey> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for point in points {
        let key = point.chunk_key();
        if seen.insert(key) {
            keys.push(key);
        }
    }
    keys
}
