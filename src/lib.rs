//! Library for reading Cloud Optimized Point Cloud ([COPC](https://copc.io/)) data.
//!
//! A COPC file is a LAS 1.4 file whose points are sorted into an octree and
//! compressed chunk by chunk, so a reader can fetch exactly the nodes a view
//! needs. This crate parses the container and ships its own decompressor for
//! the LAZ chunks, covering point formats 0, 6, 7 and 8.
//!
//! Usage example:
//! ```no_run
//! use copc_core::{CopcReader, VoxelKey};
//! use std::fs::File;
//! use std::io::BufReader;
//!
//! fn main() -> copc_core::Result<()> {
//!     let laz_file = BufReader::new(File::open("autzen-classified.copc.laz")?);
//!     let mut reader = CopcReader::open(laz_file)?;
//!     let root = reader.get_node(VoxelKey::ROOT)?;
//!     let points = reader.get_point_data(&root)?;
//!     println!(
//!         "root node holds {} points ({} bytes)",
//!         root.point_count,
//!         points.len()
//!     );
//!     Ok(())
//! }
//! ```

mod bounds;
mod copc;
mod decompressor;
mod error;
pub mod laz;
mod reader;

pub use bounds::Bounds;
pub use copc::{CopcInfo, Entry, HierarchyPage, Node, VoxelKey, COPC_INFO_SIZE, ENTRY_SIZE};
pub use decompressor::{
    base_record_size, decompress_chunk, decompress_chunk_flat, ChunkDecompressor,
};
pub use error::{Error, Result};
pub use reader::CopcReader;
