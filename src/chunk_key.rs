//! Chunk addressing types shared by the lock primitives and the region cache.

use std::fmt;
use std::sync::Arc;

/// Number of bits to shift a chunk coordinate by to get its region coordinate
/// (regions are 32x32 chunks).
pub const REGION_SHIFT: u32 = 5;

/// Identifies one chunk in one world. Equality and hashing are structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    world: Arc<str>,
    x: i32,
    z: i32,
}

impl ChunkKey {
    pub fn new(world: impl AsRef<str>, x: i32, z: i32) -> Self {
        Self {
            world: Arc::from(world.as_ref()),
            x,
            z,
        }
    }

    pub fn world(&self) -> &str {
        &self.world
    }

    pub fn x(&self) -> i32 {
        self.x
    }

    pub fn z(&self) -> i32 {
        self.z
    }

    /// Region coordinates containing this chunk.
    pub fn region(&self) -> (i32, i32) {
        region_coords(self.x, self.z)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{},{}", self.world, self.x, self.z)
    }
}

/// Region coordinates for a chunk. Arithmetic shift, so negative chunks land in
/// negative regions (-1 -> -1, -32 -> -1, -33 -> -2).
pub fn region_coords(chunk_x: i32, chunk_z: i32) -> (i32, i32) {
    (chunk_x >> REGION_SHIFT, chunk_z >> REGION_SHIFT)
}

/// File name of the region file holding a chunk: `r.<rx>.<rz>.mca`.
pub fn region_file_name(chunk_x: i32, chunk_z: i32) -> String {
    let (rx, rz) = region_coords(chunk_x, chunk_z);
    format!("r.{}.{}.mca", rx, rz)
}
