//! COPC info VLR, octree keys and hierarchy pages.

use crate::bounds::Bounds;
use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Write};

/// Size in bytes of the COPC info VLR payload.
pub const COPC_INFO_SIZE: usize = 160;

/// Size in bytes of one hierarchy entry on disk.
pub const ENTRY_SIZE: usize = 32;

/// COPC Info VLR data.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CopcInfo {
    /// Actual (unscaled) x coordinate of the center of the octree cube
    pub center_x: f64,
    /// Actual (unscaled) y coordinate of the center of the octree cube
    pub center_y: f64,
    /// Actual (unscaled) z coordinate of the center of the octree cube
    pub center_z: f64,
    /// Perpendicular distance from the center to any side of the root node.
    pub halfsize: f64,
    /// Space between points at the root node.
    /// This value is halved at each octree level
    pub spacing: f64,
    /// File offset to the first hierarchy page
    pub root_hier_offset: u64,
    /// Size of the first hierarchy page in bytes
    pub root_hier_size: u64,
    /// Minimum of GPSTime
    pub gpstime_minimum: f64,
    /// Maximum of GPSTime
    pub gpstime_maximum: f64,
    // 11 reserved u64, zero on write and ignored on read
}

impl CopcInfo {
    /// Reads COPC VLR data from a `Read`.
    ///
    /// `payload_len` is the record length announced by the VLR header; the
    /// payload is rejected when it is not exactly 160 bytes.
    pub fn read_from<R: Read>(mut read: R, payload_len: usize) -> Result<Self> {
        if payload_len != COPC_INFO_SIZE {
            return Err(Error::Corrupt(format!(
                "COPC info VLR payload is {payload_len} bytes, expected {COPC_INFO_SIZE}"
            )));
        }
        let info = CopcInfo {
            center_x: read.read_f64::<LittleEndian>()?,
            center_y: read.read_f64::<LittleEndian>()?,
            center_z: read.read_f64::<LittleEndian>()?,
            halfsize: read.read_f64::<LittleEndian>()?,
            spacing: read.read_f64::<LittleEndian>()?,
            root_hier_offset: read.read_u64::<LittleEndian>()?,
            root_hier_size: read.read_u64::<LittleEndian>()?,
            gpstime_minimum: read.read_f64::<LittleEndian>()?,
            gpstime_maximum: read.read_f64::<LittleEndian>()?,
        };
        let mut reserved = [0u8; 88];
        read.read_exact(&mut reserved)?;
        Ok(info)
    }

    /// Writes the 160 byte payload to a `Write`. Used by tests and kept
    /// symmetric with [CopcInfo::read_from].
    pub fn write_to<W: Write>(&self, write: &mut W) -> Result<()> {
        write.write_f64::<LittleEndian>(self.center_x)?;
        write.write_f64::<LittleEndian>(self.center_y)?;
        write.write_f64::<LittleEndian>(self.center_z)?;
        write.write_f64::<LittleEndian>(self.halfsize)?;
        write.write_f64::<LittleEndian>(self.spacing)?;
        write.write_u64::<LittleEndian>(self.root_hier_offset)?;
        write.write_u64::<LittleEndian>(self.root_hier_size)?;
        write.write_f64::<LittleEndian>(self.gpstime_minimum)?;
        write.write_f64::<LittleEndian>(self.gpstime_maximum)?;
        write.write_all(&[0u8; 88])?;
        Ok(())
    }

    /// The cube spanned by the root node, in file coordinates.
    pub fn cube(&self) -> Bounds {
        Bounds::new(
            self.center_x - self.halfsize,
            self.center_y - self.halfsize,
            self.center_z - self.halfsize,
            self.center_x + self.halfsize,
            self.center_y + self.halfsize,
            self.center_z + self.halfsize,
        )
    }

    /// Point spacing of nodes at octree depth `level`.
    pub fn resolution_at_depth(&self, level: i32) -> f64 {
        self.spacing / 2f64.powi(level)
    }

    /// Smallest depth whose node resolution is at least as fine as `resolution`.
    pub fn depth_at_resolution(&self, resolution: f64) -> Result<i32> {
        if !(resolution.is_normal() && resolution > 0.0) {
            return Err(Error::InvalidResolution(resolution));
        }
        let mut level = 0;
        while self.resolution_at_depth(level) > resolution {
            level += 1;
        }
        Ok(level)
    }
}

/// EPT hierarchy key
///
/// A node of the octree, addressed by depth and grid position.
#[derive(Hash, PartialEq, Eq, Clone, Copy, Debug)]
pub struct VoxelKey {
    /// Level
    ///
    /// A value < 0 indicates an invalid VoxelKey
    pub level: i32,
    /// x
    pub x: i32,
    /// y
    pub y: i32,
    /// z
    pub z: i32,
}

impl Default for VoxelKey {
    fn default() -> Self {
        VoxelKey::INVALID
    }
}

impl fmt::Display for VoxelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.level, self.x, self.y, self.z)
    }
}

impl VoxelKey {
    /// Key of the octree root node.
    pub const ROOT: VoxelKey = VoxelKey {
        level: 0,
        x: 0,
        y: 0,
        z: 0,
    };

    /// Sentinel for "no such node", e.g. the parent of the root.
    pub const INVALID: VoxelKey = VoxelKey {
        level: -1,
        x: -1,
        y: -1,
        z: -1,
    };

    pub fn new(level: i32, x: i32, y: i32, z: i32) -> VoxelKey {
        VoxelKey { level, x, y, z }
    }

    pub fn is_valid(&self) -> bool {
        self.level >= 0
    }

    /// Reads VoxelKey from a `Read`.
    pub(crate) fn read_from<R: Read>(read: &mut R) -> Result<Self> {
        Ok(VoxelKey {
            level: read.read_i32::<LittleEndian>()?,
            x: read.read_i32::<LittleEndian>()?,
            y: read.read_i32::<LittleEndian>()?,
            z: read.read_i32::<LittleEndian>()?,
        })
    }

    /// Writes VoxelKey to a `Write`.
    pub(crate) fn write_to<W: Write>(&self, write: &mut W) -> Result<()> {
        write.write_i32::<LittleEndian>(self.level)?;
        write.write_i32::<LittleEndian>(self.x)?;
        write.write_i32::<LittleEndian>(self.y)?;
        write.write_i32::<LittleEndian>(self.z)?;

        Ok(())
    }

    /// Child `i` of the 8-way subdivision, `i` in `0..8`.
    pub fn bisect(&self, i: i32) -> VoxelKey {
        VoxelKey {
            level: self.level + 1,
            x: (self.x << 1) | ((i >> 2) & 1),
            y: (self.y << 1) | ((i >> 1) & 1),
            z: (self.z << 1) | (i & 1),
        }
    }

    /// All eight children of this key.
    pub fn children(&self) -> Vec<VoxelKey> {
        (0..8).map(|i| self.bisect(i)).collect()
    }

    /// The containing key one level up, or [VoxelKey::INVALID] for the root.
    pub fn parent(&self) -> VoxelKey {
        if self.level > 0 {
            VoxelKey {
                level: self.level - 1,
                x: self.x / 2,
                y: self.y / 2,
                z: self.z / 2,
            }
        } else {
            VoxelKey::INVALID
        }
    }

    /// The ancestor of this key at `level`, or the key itself at its own level.
    pub fn parent_at_depth(&self, level: i32) -> VoxelKey {
        if level < 0 || level > self.level {
            return VoxelKey::INVALID;
        }
        let shift = self.level - level;
        VoxelKey {
            level,
            x: self.x >> shift,
            y: self.y >> shift,
            z: self.z >> shift,
        }
    }

    /// `true` if `other` is a strict ancestor of this key.
    pub fn child_of(&self, other: &VoxelKey) -> bool {
        self.level > other.level && self.parent_at_depth(other.level) == *other
    }

    /// The axis aligned box this key covers inside the `cube` of the dataset.
    pub fn bounds(&self, cube: &Bounds) -> Bounds {
        // In an octree every cell is a cube
        let side_size = (cube.max_x - cube.min_x) / 2f64.powi(self.level);

        Bounds {
            min_x: cube.min_x + self.x as f64 * side_size,
            min_y: cube.min_y + self.y as f64 * side_size,
            min_z: cube.min_z + self.z as f64 * side_size,
            max_x: cube.min_x + (self.x + 1) as f64 * side_size,
            max_y: cube.min_y + (self.y + 1) as f64 * side_size,
            max_z: cube.min_z + (self.z + 1) as f64 * side_size,
        }
    }
}

/// Hierarchy entry
///
/// An entry corresponds to a single key/value pair in an EPT hierarchy, but
/// contains additional information to allow direct access and decoding of the
/// corresponding point data.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct Entry {
    /// EPT key of the data to which this entry corresponds
    pub key: VoxelKey,

    /// Absolute offset to the data chunk if the point_count >= 0.
    /// Absolute offset to a child hierarchy page if the point_count is -1.
    pub offset: u64,

    /// Size of the data chunk in bytes (compressed size) if the point_count >= 0.
    /// Size of the hierarchy page if the point_count is -1.
    pub byte_size: i32,

    /// If >= 0, represents the number of points in the data chunk.
    /// If -1, indicates the information for this octree node is found in
    /// another hierarchy page. Any other value makes the entry invalid.
    pub point_count: i32,
}

impl Entry {
    /// Reads hierarchy entry from a `Read`.
    pub(crate) fn read_from<R: Read>(read: &mut R) -> Result<Self> {
        let entry = Entry {
            key: VoxelKey::read_from(read)?,
            offset: read.read_u64::<LittleEndian>()?,
            byte_size: read.read_i32::<LittleEndian>()?,
            point_count: read.read_i32::<LittleEndian>()?,
        };
        if entry.point_count < -1 {
            return Err(Error::Corrupt(format!(
                "hierarchy entry {} has point count {}",
                entry.key, entry.point_count
            )));
        }
        Ok(entry)
    }

    /// Writes a hierarchy entry to a `Write`
    pub(crate) fn write_to<W: Write>(&self, write: &mut W) -> Result<()> {
        self.key.write_to(write)?;
        write.write_u64::<LittleEndian>(self.offset)?;
        write.write_i32::<LittleEndian>(self.byte_size)?;
        write.write_i32::<LittleEndian>(self.point_count)?;

        Ok(())
    }

    /// `true` when the entry references a child hierarchy page.
    pub fn is_page(&self) -> bool {
        self.point_count == -1
    }
}

/// Hierarchy page
///
/// COPC stores hierarchy information to allow a reader to locate points that
/// are in a particular octree node. The hierarchy may be arranged in a tree of
/// pages, but shall always consist of at least one hierarchy page.
#[derive(Clone, Debug)]
pub struct HierarchyPage {
    /// Hierarchy page entries
    pub entries: Vec<Entry>,
}

impl HierarchyPage {
    /// Reads hierarchy page from a `Read`.
    pub(crate) fn read_from<R: Read>(mut read: R, page_size: u64) -> Result<Self> {
        if page_size % ENTRY_SIZE as u64 != 0 {
            return Err(Error::Corrupt(format!(
                "hierarchy page size {page_size} is not a multiple of {ENTRY_SIZE}"
            )));
        }
        let num_entries = page_size as usize / ENTRY_SIZE;
        let mut entries = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            let entry = Entry::read_from(&mut read)?;
            entries.push(entry);
        }
        Ok(HierarchyPage { entries })
    }

    /// Writes a hierarchy page to a `Write`
    pub(crate) fn write_to<W: Write>(&self, write: &mut W) -> Result<()> {
        for e in &self.entries {
            e.write_to(write)?;
        }
        Ok(())
    }

    /// The number of bytes the page occupies on disk.
    pub fn byte_size(&self) -> u64 {
        (self.entries.len() * ENTRY_SIZE) as u64
    }
}

/// An octree node with point data, resolved from the hierarchy.
///
/// Nodes handed out by the reader are immutable value copies.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// EPT key of this node
    pub key: VoxelKey,
    /// Absolute file offset of the compressed chunk
    pub offset: u64,
    /// Compressed size of the chunk in bytes
    pub byte_size: i32,
    /// Number of points stored in the chunk
    pub point_count: i32,
    /// Key of the hierarchy page this node was read from
    pub page_key: VoxelKey,
}

impl Node {
    /// The box this node covers inside the dataset `cube`.
    pub fn bounds(&self, cube: &Bounds) -> Bounds {
        self.key.bounds(cube)
    }

    /// Point spacing of this node.
    pub fn resolution(&self, info: &CopcInfo) -> f64 {
        info.resolution_at_depth(self.key.level)
    }
}

/// A hierarchy page as tracked by the reader.
///
/// `loaded` flips to `true` exactly once, when the 32 byte entries have been
/// read from `offset..offset + byte_size`.
#[derive(Clone, Debug)]
pub(crate) struct Page {
    pub key: VoxelKey,
    pub offset: u64,
    pub byte_size: u64,
    pub loaded: bool,
    /// The page's entries, filled in when it is loaded.
    pub entries: Vec<Entry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn key_bisect_parent_roundtrip() {
        for level in 0..=10 {
            let key = VoxelKey::new(level, level, (level + 1) / 2, 0);
            for i in 0..8 {
                let child = key.bisect(i);
                assert_eq!(child.parent(), key);
                assert!(child.child_of(&key));
            }
            assert_eq!(key.parent_at_depth(level), key);
        }
        assert_eq!(VoxelKey::ROOT.parent(), VoxelKey::INVALID);
    }

    #[test]
    fn key_bisect_examples() {
        // z is carried in the low bit of the child index
        assert_eq!(VoxelKey::new(3, 1, 2, 0).bisect(1), VoxelKey::new(4, 2, 4, 1));
        assert_eq!(VoxelKey::new(3, 1, 2, 0).bisect(4), VoxelKey::new(4, 3, 4, 0));
        assert_eq!(VoxelKey::new(3, 4, 0, 3).parent(), VoxelKey::new(2, 2, 0, 1));
    }

    #[test]
    fn key_display() {
        assert_eq!(VoxelKey::new(2, 1, 0, 3).to_string(), "2-1-0-3");
    }

    #[test]
    fn page_roundtrip_with_random_entries() {
        let n = 100;
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            let is_page = fastrand::bool();
            entries.push(Entry {
                key: VoxelKey::new(
                    fastrand::i32(0..10),
                    fastrand::i32(0..512),
                    fastrand::i32(0..512),
                    fastrand::i32(0..512),
                ),
                offset: fastrand::u64(400..u32::MAX as u64),
                byte_size: fastrand::i32(32..1_000_000),
                point_count: if is_page { -1 } else { fastrand::i32(0..100_000) },
            });
        }
        let page = HierarchyPage {
            entries: entries.clone(),
        };

        let mut buf = Vec::new();
        page.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), n * ENTRY_SIZE);

        let reread = HierarchyPage::read_from(Cursor::new(&buf), buf.len() as u64).unwrap();
        assert_eq!(reread.entries, entries);
    }

    #[test]
    fn page_size_must_be_32_aligned() {
        let buf = vec![0u8; 48];
        assert!(matches!(
            HierarchyPage::read_from(Cursor::new(&buf), 48),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn entry_rejects_bad_point_count() {
        let mut buf = Vec::new();
        Entry {
            key: VoxelKey::ROOT,
            offset: 0,
            byte_size: 0,
            point_count: -1,
        }
        .write_to(&mut buf)
        .unwrap();
        buf[28..32].copy_from_slice(&(-2i32).to_le_bytes());
        assert!(matches!(
            Entry::read_from(&mut Cursor::new(&buf)),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn info_roundtrip() {
        let info = CopcInfo {
            center_x: fastrand::f64() * 1000.0,
            center_y: fastrand::f64() * 1000.0,
            center_z: fastrand::f64() * 100.0,
            halfsize: fastrand::f64() * 500.0,
            spacing: fastrand::f64() * 10.0,
            root_hier_offset: fastrand::u64(375..u32::MAX as u64),
            root_hier_size: fastrand::u64(32..10_000) * 32,
            gpstime_minimum: fastrand::f64() * 1e6,
            gpstime_maximum: fastrand::f64() * 1e6 + 1e6,
        };
        let mut buf = Vec::new();
        info.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), COPC_INFO_SIZE);

        let reread = CopcInfo::read_from(Cursor::new(&buf), buf.len()).unwrap();
        assert_eq!(reread, info);
    }

    #[test]
    fn info_rejects_wrong_payload_size() {
        let buf = vec![0u8; 54];
        assert!(matches!(
            CopcInfo::read_from(Cursor::new(&buf), 54),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn resolution_halves_per_depth() {
        let info = CopcInfo {
            spacing: 4.0,
            ..Default::default()
        };
        for level in 0..10 {
            assert_eq!(
                info.resolution_at_depth(level + 1),
                info.resolution_at_depth(level) / 2.0
            );
        }
        assert_eq!(info.depth_at_resolution(4.0).unwrap(), 0);
        assert_eq!(info.depth_at_resolution(2.0).unwrap(), 1);
        assert_eq!(info.depth_at_resolution(1.9).unwrap(), 2);
        assert_eq!(info.depth_at_resolution(0.126).unwrap(), 5);
        assert!(info.depth_at_resolution(0.0).is_err());
        assert!(info.depth_at_resolution(-1.0).is_err());
    }

    #[test]
    fn bounds_nest_in_cube() {
        let info = CopcInfo {
            center_x: 100.0,
            center_y: 200.0,
            center_z: 50.0,
            halfsize: 64.0,
            ..Default::default()
        };
        let cube = info.cube();
        let mut key = VoxelKey::ROOT;
        for i in 0..8 {
            let child = key.bisect(i);
            assert!(cube.contains(&child.bounds(&cube)));
        }
        // walk a branch downwards, child bounds stay inside parent bounds
        for i in 0..6 {
            let child = key.bisect((i * 3) % 8);
            assert!(key.bounds(&cube).contains(&child.bounds(&cube)));
            assert!(cube.contains(&child.bounds(&cube)));
            key = child;
        }
    }
}
