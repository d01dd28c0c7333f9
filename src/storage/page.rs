//! On-disk page model.
//!
//! The database file is an array of fixed 4096-byte pages. Page 0 carries
//! the 100-byte database header followed by the catalog tree's root node;
//! every other page is a single tagged variant: B+ tree leaf, B+ tree
//! internal node, text-overflow segment, or free-list link.
//!
//! Stable wire layout (all integers little-endian):
//!
//! ```text
//! node header (16 bytes):
//!   u8  kind          1=leaf 2=internal 3=overflow 4=free
//!   u8  flags         bit 0: is_root
//!   u16 num_cells
//!   u32 parent        free: next free page; overflow: next segment
//!   u32 right_sibling leaf: sibling; internal: rightmost child
//!   u32 page_version
//! leaf cell:     u16 key_len, u16 payload_len, key, payload
//! internal cell: u16 key_len, key, u32 child
//! overflow:      u16 len at offset 16, payload at 18
//! ```

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::types::{PageId, PAGE_SIZE};

use super::btree::encoding::{read_u16, read_u32, write_u16, write_u32};

// ============================================================================
// Constants
// ============================================================================

/// Database header magic, "MSQL" in little-endian byte order.
pub const DB_MAGIC: u32 = 0x4C51_534D;

/// On-disk format version.
pub const DB_VERSION: u32 = 1;

/// Reserved header bytes at the start of page 0.
pub const DB_HEADER_SIZE: usize = 100;

/// Size of the common node header.
pub const NODE_HEADER_SIZE: usize = 16;

/// Per-cell framing bytes in a leaf node (two u16 lengths).
pub const LEAF_CELL_OVERHEAD: usize = 4;

/// Per-cell framing bytes in an internal node (u16 length + u32 child).
pub const INTERNAL_CELL_OVERHEAD: usize = 6;

/// Payload bytes one overflow page can carry.
pub const OVERFLOW_CAPACITY: usize = PAGE_SIZE - NODE_HEADER_SIZE - 2;

/// Maximum serialized row size: a row must fit in one leaf cell of a
/// non-zero page alongside its 8-byte clustered key.
pub const MAX_ROW_PAYLOAD: usize = PAGE_SIZE - NODE_HEADER_SIZE - LEAF_CELL_OVERHEAD - 8;

// ============================================================================
// Kinds and Flags
// ============================================================================

/// Page variant tag stored in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeKind {
    Leaf = 1,
    Internal = 2,
    Overflow = 3,
    Free = 4,
}

impl NodeKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(NodeKind::Leaf),
            2 => Ok(NodeKind::Internal),
            3 => Ok(NodeKind::Overflow),
            4 => Ok(NodeKind::Free),
            other => Err(Error::corrupt(format!("unknown page kind {}", other))),
        }
    }
}

bitflags! {
    /// Node header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u8 {
        const ROOT = 0x01;
    }
}

// ============================================================================
// Database Header
// ============================================================================

/// The 100-byte database header at the start of page 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbHeader {
    pub version: u32,
    pub page_size: u16,
    pub total_pages: u32,
    pub first_free_page: PageId,
    pub free_page_count: u32,
    pub catalog_root: PageId,
    pub journal_enabled: bool,
    pub cache_pages_hint: u32,
}

impl DbHeader {
    /// Header for a freshly initialised database of `total_pages` pages.
    pub fn new(total_pages: u32, journal_enabled: bool, cache_pages_hint: u32) -> Self {
        DbHeader {
            version: DB_VERSION,
            page_size: PAGE_SIZE as u16,
            total_pages,
            first_free_page: 0,
            free_page_count: 0,
            catalog_root: 0,
            journal_enabled,
            cache_pages_hint,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < DB_HEADER_SIZE {
            return Err(Error::corrupt("short database header"));
        }
        let magic = read_u32(data, 0)?;
        if magic != DB_MAGIC {
            return Err(Error::corrupt(format!("bad magic {:#010x}", magic)));
        }
        let version = read_u32(data, 4)?;
        if version != DB_VERSION {
            return Err(Error::corrupt(format!("unsupported format version {}", version)));
        }
        let page_size = read_u16(data, 8)?;
        if page_size as usize != PAGE_SIZE {
            return Err(Error::corrupt(format!("unsupported page size {}", page_size)));
        }
        Ok(DbHeader {
            version,
            page_size,
            total_pages: read_u32(data, 10)?,
            first_free_page: read_u32(data, 14)?,
            free_page_count: read_u32(data, 18)?,
            catalog_root: read_u32(data, 22)?,
            journal_enabled: data[26] != 0,
            cache_pages_hint: read_u32(data, 27)?,
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        write_u32(out, 0, DB_MAGIC);
        write_u32(out, 4, self.version);
        write_u16(out, 8, self.page_size);
        write_u32(out, 10, self.total_pages);
        write_u32(out, 14, self.first_free_page);
        write_u32(out, 18, self.free_page_count);
        write_u32(out, 22, self.catalog_root);
        out[26] = self.journal_enabled as u8;
        write_u32(out, 27, self.cache_pages_hint);
        out[31..DB_HEADER_SIZE].fill(0);
    }
}

// ============================================================================
// B+ Tree Nodes
// ============================================================================

/// A key/payload pair in a leaf node.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafCell {
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
}

impl LeafCell {
    /// On-disk bytes including framing.
    pub fn size(&self) -> usize {
        LEAF_CELL_OVERHEAD + self.key.len() + self.payload.len()
    }
}

/// A separator/child pair in an internal node. The separator is the maximum
/// key present in the child's subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalCell {
    pub key: Vec<u8>,
    pub child: PageId,
}

/// B+ tree leaf node. Cells are sorted by key; leaves of one tree form a
/// singly linked list in key order via `right_sibling`.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafNode {
    pub is_root: bool,
    pub parent: PageId,
    pub right_sibling: PageId,
    pub version: u32,
    pub cells: Vec<LeafCell>,
}

impl LeafNode {
    pub fn new_root() -> Self {
        LeafNode {
            is_root: true,
            parent: 0,
            right_sibling: 0,
            version: 1,
            cells: Vec::new(),
        }
    }

    /// Bytes consumed by the cell array.
    pub fn used_bytes(&self) -> usize {
        self.cells.iter().map(LeafCell::size).sum()
    }
}

/// B+ tree internal node. `right_child` covers keys greater than every
/// separator.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalNode {
    pub is_root: bool,
    pub parent: PageId,
    pub right_child: PageId,
    pub version: u32,
    pub cells: Vec<InternalCell>,
}

/// Either kind of B+ tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    pub fn version(&self) -> u32 {
        match self {
            Node::Leaf(n) => n.version,
            Node::Internal(n) => n.version,
        }
    }

    pub fn set_version(&mut self, v: u32) {
        match self {
            Node::Leaf(n) => n.version = v,
            Node::Internal(n) => n.version = v,
        }
    }

    pub fn is_root(&self) -> bool {
        match self {
            Node::Leaf(n) => n.is_root,
            Node::Internal(n) => n.is_root,
        }
    }

    pub fn set_root(&mut self, root: bool) {
        match self {
            Node::Leaf(n) => n.is_root = root,
            Node::Internal(n) => n.is_root = root,
        }
    }

    pub fn parent(&self) -> PageId {
        match self {
            Node::Leaf(n) => n.parent,
            Node::Internal(n) => n.parent,
        }
    }

    pub fn set_parent(&mut self, parent: PageId) {
        match self {
            Node::Leaf(n) => n.parent = parent,
            Node::Internal(n) => n.parent = parent,
        }
    }

    pub fn num_cells(&self) -> usize {
        match self {
            Node::Leaf(n) => n.cells.len(),
            Node::Internal(n) => n.cells.len(),
        }
    }

    pub fn as_leaf(&self) -> Result<&LeafNode> {
        match self {
            Node::Leaf(n) => Ok(n),
            Node::Internal(_) => Err(Error::corrupt("expected leaf node")),
        }
    }

    pub fn as_leaf_mut(&mut self) -> Result<&mut LeafNode> {
        match self {
            Node::Leaf(n) => Ok(n),
            Node::Internal(_) => Err(Error::corrupt("expected leaf node")),
        }
    }

    pub fn as_internal(&self) -> Result<&InternalNode> {
        match self {
            Node::Internal(n) => Ok(n),
            Node::Leaf(_) => Err(Error::corrupt("expected internal node")),
        }
    }

    pub fn as_internal_mut(&mut self) -> Result<&mut InternalNode> {
        match self {
            Node::Internal(n) => Ok(n),
            Node::Leaf(_) => Err(Error::corrupt("expected internal node")),
        }
    }

    fn decode(data: &[u8], offset: usize) -> Result<Node> {
        let kind = NodeKind::from_u8(data[offset])?;
        let flags = NodeFlags::from_bits_truncate(data[offset + 1]);
        let num_cells = read_u16(data, offset + 2)? as usize;
        let parent = read_u32(data, offset + 4)?;
        let sibling_or_child = read_u32(data, offset + 8)?;
        let version = read_u32(data, offset + 12)?;
        let mut pos = offset + NODE_HEADER_SIZE;

        match kind {
            NodeKind::Leaf => {
                let mut cells = Vec::with_capacity(num_cells);
                for _ in 0..num_cells {
                    let key_len = read_u16(data, pos)? as usize;
                    let payload_len = read_u16(data, pos + 2)? as usize;
                    pos += LEAF_CELL_OVERHEAD;
                    if pos + key_len + payload_len > data.len() {
                        return Err(Error::corrupt("leaf cell past end of page"));
                    }
                    let key = data[pos..pos + key_len].to_vec();
                    pos += key_len;
                    let payload = data[pos..pos + payload_len].to_vec();
                    pos += payload_len;
                    cells.push(LeafCell { key, payload });
                }
                Ok(Node::Leaf(LeafNode {
                    is_root: flags.contains(NodeFlags::ROOT),
                    parent,
                    right_sibling: sibling_or_child,
                    version,
                    cells,
                }))
            }
            NodeKind::Internal => {
                let mut cells = Vec::with_capacity(num_cells);
                for _ in 0..num_cells {
                    let key_len = read_u16(data, pos)? as usize;
                    pos += 2;
                    if pos + key_len + 4 > data.len() {
                        return Err(Error::corrupt("internal cell past end of page"));
                    }
                    let key = data[pos..pos + key_len].to_vec();
                    pos += key_len;
                    let child = read_u32(data, pos)?;
                    pos += 4;
                    cells.push(InternalCell { key, child });
                }
                Ok(Node::Internal(InternalNode {
                    is_root: flags.contains(NodeFlags::ROOT),
                    parent,
                    right_child: sibling_or_child,
                    version,
                    cells,
                }))
            }
            other => Err(Error::corrupt(format!(
                "expected tree node, found kind {:?}",
                other
            ))),
        }
    }

    fn encode(&self, out: &mut [u8], offset: usize) -> Result<()> {
        let mut flags = NodeFlags::empty();
        if self.is_root() {
            flags |= NodeFlags::ROOT;
        }
        out[offset + 1] = flags.bits();
        write_u32(out, offset + 4, self.parent());
        write_u32(out, offset + 12, self.version());
        let mut pos = offset + NODE_HEADER_SIZE;

        match self {
            Node::Leaf(leaf) => {
                out[offset] = NodeKind::Leaf as u8;
                write_u16(out, offset + 2, leaf.cells.len() as u16);
                write_u32(out, offset + 8, leaf.right_sibling);
                for cell in &leaf.cells {
                    if pos + cell.size() > out.len() {
                        return Err(Error::corrupt("leaf node overflows page"));
                    }
                    write_u16(out, pos, cell.key.len() as u16);
                    write_u16(out, pos + 2, cell.payload.len() as u16);
                    pos += LEAF_CELL_OVERHEAD;
                    out[pos..pos + cell.key.len()].copy_from_slice(&cell.key);
                    pos += cell.key.len();
                    out[pos..pos + cell.payload.len()].copy_from_slice(&cell.payload);
                    pos += cell.payload.len();
                }
            }
            Node::Internal(node) => {
                out[offset] = NodeKind::Internal as u8;
                write_u16(out, offset + 2, node.cells.len() as u16);
                write_u32(out, offset + 8, node.right_child);
                for cell in &node.cells {
                    if pos + INTERNAL_CELL_OVERHEAD + cell.key.len() > out.len() {
                        return Err(Error::corrupt("internal node overflows page"));
                    }
                    write_u16(out, pos, cell.key.len() as u16);
                    pos += 2;
                    out[pos..pos + cell.key.len()].copy_from_slice(&cell.key);
                    pos += cell.key.len();
                    write_u32(out, pos, cell.child);
                    pos += 4;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Overflow and Free Pages
// ============================================================================

/// One segment of a text overflow chain.
#[derive(Debug, Clone, PartialEq)]
pub struct OverflowPage {
    pub next: PageId,
    pub version: u32,
    pub data: Vec<u8>,
}

/// A page on the free list.
#[derive(Debug, Clone, PartialEq)]
pub struct FreePage {
    pub next: PageId,
    pub version: u32,
}

/// Page 0: database header plus the catalog tree root node.
#[derive(Debug, Clone, PartialEq)]
pub struct ZeroPage {
    pub header: DbHeader,
    pub node: Node,
}

// ============================================================================
// Page
// ============================================================================

/// Decoded content of one database page.
#[derive(Debug, Clone, PartialEq)]
pub enum Page {
    Zero(ZeroPage),
    Node(Node),
    Overflow(OverflowPage),
    Free(FreePage),
}

impl Page {
    /// Current page version, the anchor for OCC validation.
    pub fn version(&self) -> u32 {
        match self {
            Page::Zero(z) => z.node.version(),
            Page::Node(n) => n.version(),
            Page::Overflow(o) => o.version,
            Page::Free(f) => f.version,
        }
    }

    /// Overwrite the version counter. Used when fresh content is installed
    /// on a recycled page and must continue the old page's version line.
    pub fn set_version(&mut self, version: u32) {
        match self {
            Page::Zero(z) => z.node.set_version(version),
            Page::Node(n) => n.set_version(version),
            Page::Overflow(o) => o.version = version,
            Page::Free(f) => f.version = version,
        }
    }

    /// Advance the version counter on mutation.
    pub fn bump_version(&mut self) {
        match self {
            Page::Zero(z) => {
                let v = z.node.version().wrapping_add(1);
                z.node.set_version(v);
            }
            Page::Node(n) => {
                let v = n.version().wrapping_add(1);
                n.set_version(v);
            }
            Page::Overflow(o) => o.version = o.version.wrapping_add(1),
            Page::Free(f) => f.version = f.version.wrapping_add(1),
        }
    }

    /// The B+ tree node on this page (page 0's embedded catalog root, or a
    /// plain node page).
    pub fn node(&self) -> Result<&Node> {
        match self {
            Page::Zero(z) => Ok(&z.node),
            Page::Node(n) => Ok(n),
            Page::Overflow(_) => Err(Error::corrupt("expected tree node, found overflow page")),
            Page::Free(_) => Err(Error::corrupt("expected tree node, found free page")),
        }
    }

    pub fn node_mut(&mut self) -> Result<&mut Node> {
        match self {
            Page::Zero(z) => Ok(&mut z.node),
            Page::Node(n) => Ok(n),
            Page::Overflow(_) => Err(Error::corrupt("expected tree node, found overflow page")),
            Page::Free(_) => Err(Error::corrupt("expected tree node, found free page")),
        }
    }

    pub fn overflow(&self) -> Result<&OverflowPage> {
        match self {
            Page::Overflow(o) => Ok(o),
            _ => Err(Error::corrupt("expected overflow page")),
        }
    }

    /// Usable byte budget for a node's cell array on the page `id`.
    pub fn node_space(id: PageId) -> usize {
        if id == 0 {
            PAGE_SIZE - DB_HEADER_SIZE - NODE_HEADER_SIZE
        } else {
            PAGE_SIZE - NODE_HEADER_SIZE
        }
    }

    /// Decode the raw bytes of page `id`.
    pub fn decode(id: PageId, data: &[u8]) -> Result<Page> {
        if data.len() != PAGE_SIZE {
            return Err(Error::corrupt("page buffer has wrong size"));
        }
        if id == 0 {
            let header = DbHeader::decode(data)?;
            let node = Node::decode(data, DB_HEADER_SIZE)?;
            return Ok(Page::Zero(ZeroPage { header, node }));
        }
        match NodeKind::from_u8(data[0])? {
            NodeKind::Leaf | NodeKind::Internal => Ok(Page::Node(Node::decode(data, 0)?)),
            NodeKind::Overflow => {
                let next = read_u32(data, 4)?;
                let version = read_u32(data, 12)?;
                let len = read_u16(data, NODE_HEADER_SIZE)? as usize;
                if len > OVERFLOW_CAPACITY {
                    return Err(Error::corrupt("overflow segment length out of range"));
                }
                let start = NODE_HEADER_SIZE + 2;
                Ok(Page::Overflow(OverflowPage {
                    next,
                    version,
                    data: data[start..start + len].to_vec(),
                }))
            }
            NodeKind::Free => Ok(Page::Free(FreePage {
                next: read_u32(data, 4)?,
                version: read_u32(data, 12)?,
            })),
        }
    }

    /// Encode this page into a full PAGE_SIZE buffer.
    pub fn encode(&self, id: PageId) -> Result<Vec<u8>> {
        let mut out = vec![0u8; PAGE_SIZE];
        match self {
            Page::Zero(z) => {
                if id != 0 {
                    return Err(Error::corrupt("header page encoded at non-zero index"));
                }
                z.header.encode(&mut out);
                z.node.encode(&mut out, DB_HEADER_SIZE)?;
            }
            Page::Node(n) => n.encode(&mut out, 0)?,
            Page::Overflow(o) => {
                if o.data.len() > OVERFLOW_CAPACITY {
                    return Err(Error::corrupt("overflow segment too large"));
                }
                out[0] = NodeKind::Overflow as u8;
                write_u32(&mut out, 4, o.next);
                write_u32(&mut out, 12, o.version);
                write_u16(&mut out, NODE_HEADER_SIZE, o.data.len() as u16);
                out[NODE_HEADER_SIZE + 2..NODE_HEADER_SIZE + 2 + o.data.len()]
                    .copy_from_slice(&o.data);
            }
            Page::Free(f) => {
                out[0] = NodeKind::Free as u8;
                write_u32(&mut out, 4, f.next);
                write_u32(&mut out, 12, f.version);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_with_cells(cells: Vec<(&[u8], &[u8])>) -> LeafNode {
        LeafNode {
            is_root: false,
            parent: 9,
            right_sibling: 11,
            version: 3,
            cells: cells
                .into_iter()
                .map(|(k, p)| LeafCell {
                    key: k.to_vec(),
                    payload: p.to_vec(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_header_round_trip() {
        let mut header = DbHeader::new(12, true, 500);
        header.first_free_page = 7;
        header.free_page_count = 2;
        let mut buf = vec![0u8; PAGE_SIZE];
        header.encode(&mut buf);
        let decoded = DbHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf = vec![0u8; PAGE_SIZE];
        DbHeader::new(1, true, 100).encode(&mut buf);
        buf[0] ^= 0xff;
        assert!(DbHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_leaf_round_trip() {
        let leaf = leaf_with_cells(vec![(b"alpha", b"payload-1"), (b"beta", b"payload-2")]);
        let page = Page::Node(Node::Leaf(leaf));
        let bytes = page.encode(5).unwrap();
        assert_eq!(bytes.len(), PAGE_SIZE);
        let decoded = Page::decode(5, &bytes).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn test_internal_round_trip() {
        let node = InternalNode {
            is_root: true,
            parent: 0,
            right_child: 14,
            version: 8,
            cells: vec![
                InternalCell {
                    key: b"k1".to_vec(),
                    child: 4,
                },
                InternalCell {
                    key: b"k2".to_vec(),
                    child: 6,
                },
            ],
        };
        let page = Page::Node(Node::Internal(node));
        let bytes = page.encode(3).unwrap();
        let decoded = Page::decode(3, &bytes).unwrap();
        assert_eq!(decoded, page);
        assert!(decoded.node().unwrap().is_root());
    }

    #[test]
    fn test_overflow_and_free_round_trip() {
        let page = Page::Overflow(OverflowPage {
            next: 42,
            version: 2,
            data: vec![0xAB; OVERFLOW_CAPACITY],
        });
        let bytes = page.encode(9).unwrap();
        assert_eq!(Page::decode(9, &bytes).unwrap(), page);

        let page = Page::Free(FreePage { next: 3, version: 5 });
        let bytes = page.encode(10).unwrap();
        assert_eq!(Page::decode(10, &bytes).unwrap(), page);
    }

    #[test]
    fn test_zero_page_round_trip() {
        let zero = ZeroPage {
            header: DbHeader::new(4, true, 1000),
            node: Node::Leaf(LeafNode::new_root()),
        };
        let page = Page::Zero(zero);
        let bytes = page.encode(0).unwrap();
        let decoded = Page::decode(0, &bytes).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn test_version_bump() {
        let mut page = Page::Free(FreePage { next: 0, version: 7 });
        page.bump_version();
        assert_eq!(page.version(), 8);
    }

    #[test]
    fn test_node_space_budgets() {
        assert_eq!(Page::node_space(0), PAGE_SIZE - 116);
        assert_eq!(Page::node_space(1), PAGE_SIZE - 16);
    }
}
