//! Partition and shard addressing
//!
//! A partition is one chunk of one world. Chunks are grouped 32x32 into
//! regions; a region is a storage shard with one file on disk:
//!
//! ```text
//! <data_dir>/<world>/region/r.<rx>.<rz>.rgn
//! ```

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// log2 of the region edge length in chunks
pub const REGION_SHIFT: i32 = 5;
pub const REGION_EDGE: i32 = 1 << REGION_SHIFT;
pub const CHUNKS_PER_REGION: usize = (REGION_EDGE * REGION_EDGE) as usize;

const REGION_DIR: &str = "region";
const REGION_EXT: &str = "rgn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn region(&self) -> RegionPos {
        RegionPos {
            x: self.x >> REGION_SHIFT,
            z: self.z >> REGION_SHIFT,
        }
    }

    /// Slot of this chunk inside its region file, `0..CHUNKS_PER_REGION`.
    pub fn local_index(&self) -> u16 {
        let lx = self.x & (REGION_EDGE - 1);
        let lz = self.z & (REGION_EDGE - 1);
        (lx + lz * REGION_EDGE) as u16
    }

    /// Inverse of `local_index` for a given region.
    pub fn from_local(region: RegionPos, index: u16) -> Self {
        let index = index as i32;
        Self {
            x: (region.x << REGION_SHIFT) + (index % REGION_EDGE),
            z: (region.z << REGION_SHIFT) + (index / REGION_EDGE),
        }
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.z)
    }
}

impl FromStr for ChunkPos {
    type Err = String;

    /// Parses `x,z`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (x, z) = s
            .split_once(',')
            .ok_or_else(|| format!("expected 'x,z', got '{}'", s))?;
        let x = x.trim().parse::<i32>().map_err(|e| format!("bad x in '{}': {}", s, e))?;
        let z = z.trim().parse::<i32>().map_err(|e| format!("bad z in '{}': {}", s, e))?;
        Ok(Self { x, z })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    pub fn file_name(&self) -> String {
        format!("r.{}.{}.{}", self.x, self.z, REGION_EXT)
    }

    /// Parses `r.<x>.<z>.rgn`; anything else is not a region file.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix("r.")?.strip_suffix(".rgn")?;
        let (x, z) = rest.split_once('.')?;
        Some(Self {
            x: x.parse().ok()?,
            z: z.parse().ok()?,
        })
    }

    pub fn contains(&self, chunk: ChunkPos) -> bool {
        chunk.region() == *self
    }
}

impl fmt::Display for RegionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r.{}.{}", self.x, self.z)
    }
}

/// A partition identifier: world name plus chunk position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub world: String,
    pub pos: ChunkPos,
}

impl PartitionKey {
    pub fn new(world: impl Into<String>, pos: ChunkPos) -> Self {
        Self {
            world: world.into(),
            pos,
        }
    }

    pub fn shard(&self) -> ShardKey {
        ShardKey {
            world: self.world.clone(),
            region: self.pos.region(),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.world, self.pos)
    }
}

/// A storage shard: one region file of one world.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardKey {
    pub world: String,
    pub region: RegionPos,
}

impl ShardKey {
    pub fn new(world: impl Into<String>, region: RegionPos) -> Self {
        Self {
            world: world.into(),
            region,
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.world, self.region)
    }
}

/// Which part of the dataset a restore touches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RestoreScope {
    #[default]
    Full,
    /// Inclusive chunk box inside one world.
    Area {
        world: String,
        from: ChunkPos,
        to: ChunkPos,
    },
}

impl RestoreScope {
    pub fn area(world: impl Into<String>, a: ChunkPos, b: ChunkPos) -> Self {
        RestoreScope::Area {
            world: world.into(),
            from: ChunkPos::new(a.x.min(b.x), a.z.min(b.z)),
            to: ChunkPos::new(a.x.max(b.x), a.z.max(b.z)),
        }
    }

    pub fn includes_partition(&self, key: &PartitionKey) -> bool {
        match self {
            RestoreScope::Full => true,
            RestoreScope::Area { world, from, to } => {
                key.world == *world
                    && (from.x..=to.x).contains(&key.pos.x)
                    && (from.z..=to.z).contains(&key.pos.z)
            }
        }
    }

    /// True when any chunk of the shard falls inside the scope.
    pub fn touches_shard(&self, shard: &ShardKey) -> bool {
        match self {
            RestoreScope::Full => true,
            RestoreScope::Area { world, from, to } => {
                let (lo, hi) = (from.region(), to.region());
                shard.world == *world
                    && (lo.x..=hi.x).contains(&shard.region.x)
                    && (lo.z..=hi.z).contains(&shard.region.z)
            }
        }
    }

    /// True when every chunk of the shard falls inside the scope.
    pub fn covers_shard(&self, shard: &ShardKey) -> bool {
        match self {
            RestoreScope::Full => true,
            RestoreScope::Area { .. } => {
                let first = ChunkPos::from_local(shard.region, 0);
                let last = ChunkPos::from_local(shard.region, (CHUNKS_PER_REGION - 1) as u16);
                self.includes_partition(&PartitionKey::new(shard.world.clone(), first))
                    && self.includes_partition(&PartitionKey::new(shard.world.clone(), last))
            }
        }
    }
}

/// On-disk layout of the live dataset.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn region_dir(&self, world: &str) -> PathBuf {
        self.root.join(world).join(REGION_DIR)
    }

    pub fn shard_path(&self, shard: &ShardKey) -> PathBuf {
        self.region_dir(&shard.world).join(shard.region.file_name())
    }

    /// Worlds are directories under the root that hold a `region` directory.
    pub fn list_worlds(&self) -> io::Result<Vec<String>> {
        let mut worlds = Vec::new();
        if !self.root.exists() {
            return Ok(worlds);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if entry.path().join(REGION_DIR).is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    worlds.push(name.to_string());
                }
            }
        }
        worlds.sort();
        Ok(worlds)
    }

    /// Region files currently on disk for one world, sorted.
    pub fn list_shards(&self, world: &str) -> io::Result<Vec<ShardKey>> {
        let dir = self.region_dir(world);
        let mut shards = Vec::new();
        if !dir.exists() {
            return Ok(shards);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(region) = name.to_str().and_then(RegionPos::parse_file_name) {
                shards.push(ShardKey::new(world, region));
            }
        }
        shards.sort();
        Ok(shards)
    }

    pub fn list_all_shards(&self) -> io::Result<Vec<ShardKey>> {
        let mut all = Vec::new();
        for world in self.list_worlds()? {
            all.extend(self.list_shards(&world)?);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_region_of_negative_chunks() {
        assert_eq!(ChunkPos::new(0, 0).region(), RegionPos::new(0, 0));
        assert_eq!(ChunkPos::new(31, 31).region(), RegionPos::new(0, 0));
        assert_eq!(ChunkPos::new(32, 0).region(), RegionPos::new(1, 0));
        assert_eq!(ChunkPos::new(-1, -33).region(), RegionPos::new(-1, -2));
    }

    #[test]
    fn test_local_index_inverse() {
        for pos in [ChunkPos::new(5, 7), ChunkPos::new(-1, -1), ChunkPos::new(-40, 65)] {
            let back = ChunkPos::from_local(pos.region(), pos.local_index());
            assert_eq!(back, pos);
        }
    }

    #[test]
    fn test_region_file_name() {
        let region = RegionPos::new(-2, 3);
        assert_eq!(region.file_name(), "r.-2.3.rgn");
        assert_eq!(RegionPos::parse_file_name("r.-2.3.rgn"), Some(region));
        assert_eq!(RegionPos::parse_file_name("r.1.2.mca"), None);
        assert_eq!(RegionPos::parse_file_name("r.x.2.rgn"), None);
    }

    #[test]
    fn test_chunk_pos_parse() {
        assert_eq!("3,-4".parse::<ChunkPos>().unwrap(), ChunkPos::new(3, -4));
        assert!("3".parse::<ChunkPos>().is_err());
    }

    #[test]
    fn test_scope_area() {
        let scope = RestoreScope::area("overworld", ChunkPos::new(10, 10), ChunkPos::new(0, 0));
        assert!(scope.includes_partition(&PartitionKey::new("overworld", ChunkPos::new(5, 0))));
        assert!(!scope.includes_partition(&PartitionKey::new("overworld", ChunkPos::new(11, 0))));
        assert!(!scope.includes_partition(&PartitionKey::new("nether", ChunkPos::new(5, 5))));
        assert!(scope.touches_shard(&ShardKey::new("overworld", RegionPos::new(0, 0))));
        assert!(!scope.covers_shard(&ShardKey::new("overworld", RegionPos::new(0, 0))));
        assert!(!scope.touches_shard(&ShardKey::new("overworld", RegionPos::new(1, 0))));

        let wide = RestoreScope::area("overworld", ChunkPos::new(0, 0), ChunkPos::new(31, 31));
        assert!(wide.covers_shard(&ShardKey::new("overworld", RegionPos::new(0, 0))));
    }

    #[test]
    fn test_layout_lists_worlds_and_shards() {
        let dir = TempDir::new().unwrap();
        let layout = DatasetLayout::new(dir.path());
        fs::create_dir_all(layout.region_dir("overworld")).unwrap();
        fs::create_dir_all(dir.path().join(".regionvault")).unwrap();
        fs::write(layout.region_dir("overworld").join("r.1.0.rgn"), b"").unwrap();
        fs::write(layout.region_dir("overworld").join("r.0.0.rgn"), b"").unwrap();
        fs::write(layout.region_dir("overworld").join("notes.txt"), b"").unwrap();

        assert_eq!(layout.list_worlds().unwrap(), vec!["overworld".to_string()]);
        let shards = layout.list_shards("overworld").unwrap();
        assert_eq!(
            shards,
            vec![
                ShardKey::new("overworld", RegionPos::new(0, 0)),
                ShardKey::new("overworld", RegionPos::new(1, 0)),
            ]
        );
    }
}
