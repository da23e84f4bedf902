//! COPC file reader.

use crate::bounds::Bounds;
use crate::copc::{CopcInfo, Entry, HierarchyPage, Node, Page, VoxelKey};
use crate::decompressor;
use crate::error::{Error, Result};
use log::debug;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

/// Mask for the compression bit of the point data record format.
const COMPRESSION_BIT: u8 = 0x80;

/// COPC file reader
///
/// Opens a LAS 1.4 resource with a COPC octree, resolves nodes from the
/// hierarchy on demand and decompresses their chunks. The reader owns the
/// hierarchy; every page is fetched at most once.
pub struct CopcReader<R> {
    src: R,
    las_header: las::raw::Header,
    copc_info: CopcInfo,
    wkt: Option<String>,
    pages: HashMap<VoxelKey, Page>,
    nodes: HashMap<VoxelKey, Node>,
}

impl<R: Read + Seek> CopcReader<R> {
    /// Setup by reading the LAS header and the VLRs.
    ///
    /// The COPC info VLR must be the first VLR, placed right after the
    /// 375 byte header; anything else is not a COPC file.
    pub fn open(mut src: R) -> Result<Self> {
        let las_header = las::raw::Header::read_from(&mut src)?;
        if las_header.version.major != 1 || las_header.version.minor != 4 {
            return Err(Error::NotACopc(format!(
                "LAS version {}.{} instead of 1.4",
                las_header.version.major, las_header.version.minor
            )));
        }

        src.seek(SeekFrom::Start(las_header.header_size as u64))?;
        let copc_vlr = las::raw::Vlr::read_from(&mut src, false)?;
        if trimmed_string(&copc_vlr.user_id) != "copc" || copc_vlr.record_id != 1 {
            return Err(Error::NotACopc(
                "first VLR after the header is not the COPC info VLR".to_string(),
            ));
        }
        let copc_info = CopcInfo::read_from(Cursor::new(&copc_vlr.data), copc_vlr.data.len())?;

        let mut reader = CopcReader {
            src,
            las_header,
            copc_info,
            wkt: None,
            pages: HashMap::new(),
            nodes: HashMap::new(),
        };

        for _i in 1..reader.las_header.number_of_variable_length_records {
            let vlr = las::raw::Vlr::read_from(&mut reader.src, false)?;
            match (trimmed_string(&vlr.user_id).as_str(), vlr.record_id) {
                ("LASF_Projection", 2112) => {
                    reader.wkt = Some(
                        String::from_utf8_lossy(&vlr.data)
                            .trim_end_matches('\0')
                            .to_string(),
                    );
                }
                (user_id, record_id) => {
                    debug!("ignoring VLR {user_id}/{record_id}");
                }
            }
        }

        reader.pages.insert(
            VoxelKey::ROOT,
            Page {
                key: VoxelKey::ROOT,
                offset: reader.copc_info.root_hier_offset,
                byte_size: reader.copc_info.root_hier_size,
                loaded: false,
                entries: Vec::new(),
            },
        );

        Ok(reader)
    }

    /// LAS header
    pub fn header(&self) -> &las::raw::Header {
        &self.las_header
    }

    /// COPC info VLR content
    pub fn copc_info(&self) -> &CopcInfo {
        &self.copc_info
    }

    /// WKT coordinate reference system, when the file carries one
    pub fn wkt(&self) -> Option<&str> {
        self.wkt.as_deref()
    }

    /// Point data record format with the compression bit stripped.
    pub fn point_format(&self) -> u8 {
        self.las_header.point_data_record_format & !COMPRESSION_BIT
    }

    fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.src.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        self.src.read_exact(&mut buf).map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Corrupt(format!("file ends inside the {len} bytes at offset {offset}"))
            } else {
                Error::Io(err)
            }
        })?;
        Ok(buf)
    }

    /// Reads the page at `key` and files its entries as nodes and sub pages.
    fn load_page(&mut self, key: VoxelKey) -> Result<HierarchyPage> {
        let (offset, byte_size) = {
            let page = self
                .pages
                .get(&key)
                .ok_or_else(|| Error::Corrupt(format!("no hierarchy page with key {key}")))?;
            if page.loaded {
                return Ok(HierarchyPage {
                    entries: page.entries.clone(),
                });
            }
            (page.offset, page.byte_size)
        };

        debug!("loading hierarchy page {key} at {offset} ({byte_size} bytes)");
        let buf = self.read_exact_at(offset, byte_size as usize)?;
        let parsed = HierarchyPage::read_from(Cursor::new(&buf), byte_size)?;

        for entry in &parsed.entries {
            if entry.byte_size < 0 {
                return Err(Error::Corrupt(format!(
                    "hierarchy entry {} has negative size",
                    entry.key
                )));
            }
            if entry.is_page() {
                self.pages.entry(entry.key).or_insert(Page {
                    key: entry.key,
                    offset: entry.offset,
                    byte_size: entry.byte_size as u64,
                    loaded: false,
                    entries: Vec::new(),
                });
            } else {
                self.nodes.insert(
                    entry.key,
                    Node {
                        key: entry.key,
                        offset: entry.offset,
                        byte_size: entry.byte_size,
                        point_count: entry.point_count,
                        page_key: key,
                    },
                );
            }
        }

        let page = self.pages.get_mut(&key).expect("page was just looked up");
        page.entries = parsed.entries.clone();
        page.loaded = true;
        Ok(parsed)
    }

    /// Loads the root hierarchy page if needed and returns its entries.
    pub fn load_root_hierarchy_page(&mut self) -> Result<HierarchyPage> {
        self.load_page(VoxelKey::ROOT)
    }

    /// Resolves `key` to its node, loading hierarchy pages along the way.
    ///
    /// Only pages whose key is the target or one of its ancestors are
    /// touched, so a deep lookup stays cheap on a large hierarchy.
    pub fn get_node(&mut self, key: VoxelKey) -> Result<Node> {
        if !key.is_valid() {
            return Err(Error::NodeNotFound(key));
        }
        self.load_root_hierarchy_page()?;
        loop {
            if let Some(node) = self.nodes.get(&key) {
                return Ok(node.clone());
            }
            let next_page = self
                .pages
                .values()
                .filter(|page| !page.loaded)
                .map(|page| page.key)
                .find(|page_key| *page_key == key || key.child_of(page_key));
            match next_page {
                Some(page_key) => {
                    self.load_page(page_key)?;
                }
                None => return Err(Error::NodeNotFound(key)),
            }
        }
    }

    /// Loads the whole hierarchy and returns every node.
    pub fn get_all_nodes(&mut self) -> Result<Vec<Node>> {
        self.load_root_hierarchy_page()?;
        loop {
            let pending: Vec<VoxelKey> = self
                .pages
                .values()
                .filter(|page| !page.loaded)
                .map(|page| page.key)
                .collect();
            if pending.is_empty() {
                break;
            }
            for key in pending {
                self.load_page(key)?;
            }
        }
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        // ascending offsets, callers usually fetch chunks sequentially
        nodes.sort_by_key(|node| node.offset);
        Ok(nodes)
    }

    /// Nodes whose bounds intersect `bounds`.
    ///
    /// A `resolution` greater than zero limits the octree depth to the
    /// shallowest level whose point spacing satisfies it.
    pub fn get_nodes_intersect_box(
        &mut self,
        bounds: &Bounds,
        resolution: f64,
    ) -> Result<Vec<Node>> {
        let cube = self.copc_info.cube();
        let max_depth = self.depth_limit(resolution)?;
        Ok(self
            .get_all_nodes()?
            .into_iter()
            .filter(|node| node.bounds(&cube).intersects(bounds))
            .filter(|node| max_depth.map_or(true, |depth| node.key.level <= depth))
            .collect())
    }

    /// Nodes whose bounds lie entirely within `bounds`.
    pub fn get_nodes_within_box(&mut self, bounds: &Bounds, resolution: f64) -> Result<Vec<Node>> {
        let cube = self.copc_info.cube();
        let max_depth = self.depth_limit(resolution)?;
        Ok(self
            .get_all_nodes()?
            .into_iter()
            .filter(|node| bounds.contains(&node.bounds(&cube)))
            .filter(|node| max_depth.map_or(true, |depth| node.key.level <= depth))
            .collect())
    }

    fn depth_limit(&self, resolution: f64) -> Result<Option<i32>> {
        if resolution > 0.0 {
            Ok(Some(self.copc_info.depth_at_resolution(resolution)?))
        } else {
            Ok(None)
        }
    }

    /// Smallest octree depth with a point spacing of at most `resolution`.
    pub fn get_depth_at_resolution(&self, resolution: f64) -> Result<i32> {
        self.copc_info.depth_at_resolution(resolution)
    }

    /// Fetches a node's chunk as stored in the file.
    pub fn get_point_data_compressed(&mut self, node: &Node) -> Result<Vec<u8>> {
        self.read_exact_at(node.offset, node.byte_size as usize)
    }

    /// Fetches and decompresses a node's chunk.
    ///
    /// Returns `point_count` records of `point_data_record_length` bytes
    /// each, laid out exactly as in an uncompressed LAS file.
    pub fn get_point_data(&mut self, node: &Node) -> Result<Vec<u8>> {
        let compressed = self.get_point_data_compressed(node)?;
        decompressor::decompress_chunk_flat(
            self.point_format(),
            self.las_header.point_data_record_length,
            compressed,
            node.point_count as usize,
        )
    }

    /// The entries recorded for `key`, if that page has been loaded.
    pub fn page_entries(&self, key: &VoxelKey) -> Option<&[Entry]> {
        self.pages
            .get(key)
            .filter(|page| page.loaded)
            .map(|page| page.entries.as_slice())
    }
}

fn trimmed_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}
