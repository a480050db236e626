//! Byte-image builder for tests.
//!
//! Lays out small HDF5 files with 8-byte offsets and lengths: a superblock
//! at address 0, then whatever structures a test appends. Addresses handed
//! back are logical addresses usable in later structures.

use crate::btree_v1::{node_size, NODE_TYPE_CHUNK, NODE_TYPE_GROUP};
use crate::checksum::lookup3;
use crate::decode::{Sizes, UNDEF_ADDR};
use crate::file_state::{DEFAULT_GROUP_INTERNAL_K, DEFAULT_ISTORE_K, DEFAULT_SYM_LEAF_K};
use crate::message_type::MessageType;
use crate::signature::HDF5_SIGNATURE;

/// Room reserved at address 0 for the superblock.
pub const SUPERBLOCK_SPACE: usize = 96;

/// Encoded fractal heap header with 8-byte offsets and no filters.
const FRACTAL_HEAP_HEADER_LEN: usize = 146;
/// Starting (and only) direct block size of built fractal heaps.
const FRACTAL_HEAP_BLOCK: u64 = 512;
/// Node size of built B-tree v2s.
const BTREE_V2_NODE: u32 = 512;

/// Append `lookup3` of `data` to it.
pub fn sealed(mut data: Vec<u8>) -> Vec<u8> {
    let sum = lookup3(&data);
    data.extend_from_slice(&sum.to_le_bytes());
    data
}

/// Writer for v1 object headers.
#[derive(Debug, Default, Clone)]
pub struct HeaderV1Writer {
    messages: Vec<(MessageType, Vec<u8>, u8)>,
}

impl HeaderV1Writer {
    /// Empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message with flags 0.
    pub fn message(mut self, mt: MessageType, payload: Vec<u8>) -> Self {
        self.messages.push((mt, payload, 0));
        self
    }

    /// Add a message with explicit flags.
    pub fn message_with_flags(mut self, mt: MessageType, payload: Vec<u8>, flags: u8) -> Self {
        self.messages.push((mt, payload, flags));
        self
    }

    /// Prefix and chunk 0, messages padded to 8 bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let body = self.chunk();
        let mut buf = vec![1, 0];
        buf.extend_from_slice(&(self.messages.len() as u16).to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&[0; 4]);
        buf.extend_from_slice(&body);
        buf
    }

    /// The messages alone, as stored in a continuation chunk.
    pub fn chunk(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for (mt, payload, flags) in &self.messages {
            let padded = payload.len().div_ceil(8) * 8;
            body.extend_from_slice(&mt.to_u16().to_le_bytes());
            body.extend_from_slice(&(padded as u16).to_le_bytes());
            body.push(*flags);
            body.extend_from_slice(&[0; 3]);
            body.extend_from_slice(payload);
            body.resize(body.len() + padded - payload.len(), 0);
        }
        body
    }
}

/// Writer for v2 object headers with a four-byte chunk 0 size.
#[derive(Debug, Default, Clone)]
pub struct HeaderV2Writer {
    messages: Vec<(MessageType, Vec<u8>, u8)>,
}

impl HeaderV2Writer {
    /// Empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message with flags 0.
    pub fn message(mut self, mt: MessageType, payload: Vec<u8>) -> Self {
        self.messages.push((mt, payload, 0));
        self
    }

    /// Add a message with explicit flags.
    pub fn message_with_flags(mut self, mt: MessageType, payload: Vec<u8>, flags: u8) -> Self {
        self.messages.push((mt, payload, flags));
        self
    }

    /// `OHDR`, chunk 0 and checksum.
    pub fn serialize(&self) -> Vec<u8> {
        let total: usize = self.messages.iter().map(|(_, p, _)| 4 + p.len()).sum();
        let mut buf = b"OHDR".to_vec();
        buf.push(2);
        buf.push(0x02);
        buf.extend_from_slice(&(total as u32).to_le_bytes());
        for (mt, payload, flags) in &self.messages {
            buf.push(mt.to_u16() as u8);
            buf.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            buf.push(*flags);
            buf.extend_from_slice(payload);
        }
        sealed(buf)
    }
}

/// A file image under construction.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    buf: Vec<u8>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// Image with space for the superblock and nothing else.
    pub fn new() -> Self {
        Self {
            buf: vec![0; SUPERBLOCK_SPACE],
        }
    }

    /// Current image length.
    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    /// True when only the superblock space exists.
    pub fn is_empty(&self) -> bool {
        self.buf.len() <= SUPERBLOCK_SPACE
    }

    /// Append `len` zero bytes at an 8-byte boundary.
    pub fn alloc(&mut self, len: usize) -> u64 {
        let start = self.buf.len().div_ceil(8) * 8;
        self.buf.resize(start + len, 0);
        start as u64
    }

    /// Append `bytes` at an 8-byte boundary.
    pub fn put(&mut self, bytes: &[u8]) -> u64 {
        let addr = self.alloc(bytes.len());
        self.write(addr, bytes);
        addr
    }

    /// Overwrite bytes at `addr`.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        let start = addr as usize;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Mutable view of the image.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// The finished image.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Local heap holding the empty name at offset 0 followed by `names`.
    /// Returns the heap address and the offset of each name.
    pub fn local_heap(&mut self, names: &[&str]) -> (u64, Vec<u64>) {
        let mut data = vec![0u8; 8];
        let mut offsets = Vec::with_capacity(names.len());
        for name in names {
            offsets.push(data.len() as u64);
            data.extend_from_slice(name.as_bytes());
            data.push(0);
            data.resize(data.len().div_ceil(8) * 8, 0);
        }
        let header = self.alloc(32);
        let data_addr = self.put(&data);
        let mut h = b"HEAP".to_vec();
        h.extend_from_slice(&[0, 0, 0, 0]);
        h.extend_from_slice(&(data.len() as u64).to_le_bytes());
        h.extend_from_slice(&1u64.to_le_bytes());
        h.extend_from_slice(&data_addr.to_le_bytes());
        self.write(header, &h);
        (header, offsets)
    }

    /// Level-0 group B-tree node. `keys` holds one more heap offset than
    /// `children`.
    pub fn group_btree(&mut self, children: &[u64], keys: &[u64]) -> u64 {
        let size = node_size(Sizes::default(), NODE_TYPE_GROUP, DEFAULT_GROUP_INTERNAL_K, 0);
        let mut n = b"TREE".to_vec();
        n.push(NODE_TYPE_GROUP);
        n.push(0);
        n.extend_from_slice(&(children.len() as u16).to_le_bytes());
        n.extend_from_slice(&UNDEF_ADDR.to_le_bytes());
        n.extend_from_slice(&UNDEF_ADDR.to_le_bytes());
        for (i, child) in children.iter().enumerate() {
            n.extend_from_slice(&keys[i].to_le_bytes());
            n.extend_from_slice(&child.to_le_bytes());
        }
        n.extend_from_slice(&keys.get(children.len()).copied().unwrap_or(0).to_le_bytes());
        n.resize(size, 0);
        self.put(&n)
    }

    /// Symbol table node of `(name offset, header address)` entries.
    pub fn symbol_node(&mut self, entries: &[(u64, u64)]) -> u64 {
        let size = 8 + 2 * usize::from(DEFAULT_SYM_LEAF_K) * 40;
        let mut n = b"SNOD".to_vec();
        n.extend_from_slice(&[1, 0]);
        n.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        for &(name, header) in entries {
            n.extend_from_slice(&name.to_le_bytes());
            n.extend_from_slice(&header.to_le_bytes());
            n.extend_from_slice(&[0; 24]);
        }
        n.resize(size, 0);
        self.put(&n)
    }

    /// Group with symbol table storage holding `members`; returns the
    /// B-tree and local heap addresses for a Symbol Table message.
    pub fn symbol_table_group(&mut self, members: &[(&str, u64)]) -> (u64, u64) {
        let mut sorted: Vec<(&str, u64)> = members.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        let names: Vec<&str> = sorted.iter().map(|m| m.0).collect();
        let (heap, offsets) = self.local_heap(&names);
        if sorted.is_empty() {
            return (self.group_btree(&[], &[0]), heap);
        }
        let entries: Vec<(u64, u64)> = offsets.iter().zip(&sorted).map(|(&o, m)| (o, m.1)).collect();
        let snod = self.symbol_node(&entries);
        let last = offsets.last().copied().unwrap_or(0);
        (self.group_btree(&[snod], &[0, last]), heap)
    }

    /// Fractal heap whose root is one 512-byte direct block holding
    /// `objects` back to back. Returns the heap address and a managed heap
    /// ID of `id_len` bytes for each object.
    pub fn fractal_heap(&mut self, id_len: u16, objects: &[Vec<u8>]) -> (u64, Vec<Vec<u8>>) {
        let header = self.alloc(FRACTAL_HEAP_HEADER_LEN);
        let mut block = b"FHDB".to_vec();
        block.push(0);
        block.extend_from_slice(&header.to_le_bytes());
        block.extend_from_slice(&0u32.to_le_bytes());
        let mut ids = Vec::with_capacity(objects.len());
        for obj in objects {
            let mut id = vec![0];
            id.extend_from_slice(&(block.len() as u32).to_le_bytes());
            id.extend_from_slice(&(obj.len() as u16).to_le_bytes());
            id.resize(usize::from(id_len), 0);
            ids.push(id);
            block.extend_from_slice(obj);
        }
        block.resize(FRACTAL_HEAP_BLOCK as usize, 0);
        let root = self.put(&block);

        let mut h = b"FRHP".to_vec();
        h.push(0);
        h.extend_from_slice(&id_len.to_le_bytes());
        h.extend_from_slice(&0u16.to_le_bytes());
        h.push(0);
        h.extend_from_slice(&256u32.to_le_bytes());
        let space = FRACTAL_HEAP_BLOCK;
        let count = objects.len() as u64;
        for x in [0, UNDEF_ADDR, 0, UNDEF_ADDR, space, space, 0, count, 0, 0, 0, 0] {
            h.extend_from_slice(&x.to_le_bytes());
        }
        h.extend_from_slice(&4u16.to_le_bytes());
        h.extend_from_slice(&FRACTAL_HEAP_BLOCK.to_le_bytes());
        h.extend_from_slice(&(64 * 1024u64).to_le_bytes());
        h.extend_from_slice(&32u16.to_le_bytes());
        h.extend_from_slice(&1u16.to_le_bytes());
        h.extend_from_slice(&root.to_le_bytes());
        h.extend_from_slice(&0u16.to_le_bytes());
        self.write(header, &sealed(h));
        (header, ids)
    }

    /// B-tree v2 of record type `kind` whose root is a single leaf holding
    /// `records`, already encoded and in key order.
    pub fn btree_v2_leaf(&mut self, kind: u8, record_size: u16, records: &[Vec<u8>]) -> u64 {
        let root = if records.is_empty() {
            UNDEF_ADDR
        } else {
            let mut leaf = b"BTLF".to_vec();
            leaf.extend_from_slice(&[0, kind]);
            for r in records {
                leaf.extend_from_slice(r);
            }
            let mut leaf = sealed(leaf);
            leaf.resize(BTREE_V2_NODE as usize, 0);
            self.put(&leaf)
        };
        let mut h = b"BTHD".to_vec();
        h.extend_from_slice(&[0, kind]);
        h.extend_from_slice(&BTREE_V2_NODE.to_le_bytes());
        h.extend_from_slice(&record_size.to_le_bytes());
        h.extend_from_slice(&0u16.to_le_bytes());
        h.extend_from_slice(&[100, 40]);
        h.extend_from_slice(&root.to_le_bytes());
        h.extend_from_slice(&(records.len() as u16).to_le_bytes());
        h.extend_from_slice(&(records.len() as u64).to_le_bytes());
        self.put(&sealed(h))
    }

    /// Level-0 chunk B-tree node for chunks of `chunk_size` bytes. `keys`
    /// holds one more offset list than `children`; each list ends with the
    /// element dimension.
    pub fn chunk_btree(&mut self, chunk_size: u32, keys: &[&[u64]], children: &[u64]) -> u64 {
        let ndims = keys.first().map_or(0, |k| k.len());
        let size = node_size(Sizes::default(), NODE_TYPE_CHUNK, DEFAULT_ISTORE_K, ndims);
        let mut n = b"TREE".to_vec();
        n.push(NODE_TYPE_CHUNK);
        n.push(0);
        n.extend_from_slice(&(children.len() as u16).to_le_bytes());
        n.extend_from_slice(&UNDEF_ADDR.to_le_bytes());
        n.extend_from_slice(&UNDEF_ADDR.to_le_bytes());
        for (i, offsets) in keys.iter().enumerate() {
            let stored = if i < children.len() { chunk_size } else { 0 };
            n.extend_from_slice(&stored.to_le_bytes());
            n.extend_from_slice(&0u32.to_le_bytes());
            for o in offsets.iter() {
                n.extend_from_slice(&o.to_le_bytes());
            }
            if let Some(child) = children.get(i) {
                n.extend_from_slice(&child.to_le_bytes());
            }
        }
        n.resize(size, 0);
        self.put(&n)
    }

    /// Shared message table with one list index for the kinds in `types`,
    /// holding the messages stored under `ids` in the fractal heap `heap`.
    /// Returns the table address.
    pub fn shared_message_table(&mut self, types: u16, heap: u64, ids: &[Vec<u8>]) -> u64 {
        let mut list = b"SMLI".to_vec();
        for (i, id) in ids.iter().enumerate() {
            list.push(0);
            list.extend_from_slice(&(i as u32).to_le_bytes());
            list.extend_from_slice(&1u32.to_le_bytes());
            list.extend_from_slice(&id[..8]);
        }
        let list = self.put(&sealed(list));
        let mut t = b"SMTB".to_vec();
        t.extend_from_slice(&[0, 0]);
        t.extend_from_slice(&types.to_le_bytes());
        t.extend_from_slice(&50u32.to_le_bytes());
        t.extend_from_slice(&50u16.to_le_bytes());
        t.extend_from_slice(&40u16.to_le_bytes());
        t.extend_from_slice(&(ids.len() as u16).to_le_bytes());
        t.extend_from_slice(&list.to_le_bytes());
        t.extend_from_slice(&heap.to_le_bytes());
        self.put(&sealed(t))
    }

    /// Write a v0 superblock at address 0 whose end of allocated space is
    /// the current image length.
    pub fn superblock_v0(&mut self, root_header: u64, cache: Option<(u64, u64)>) {
        let eoa = self.len();
        let mut b = HDF5_SIGNATURE.to_vec();
        b.extend_from_slice(&[0, 0, 0, 0, 0, 8, 8, 0]);
        b.extend_from_slice(&DEFAULT_SYM_LEAF_K.to_le_bytes());
        b.extend_from_slice(&DEFAULT_GROUP_INTERNAL_K.to_le_bytes());
        b.extend_from_slice(&0u32.to_le_bytes());
        b.extend_from_slice(&0u64.to_le_bytes());
        b.extend_from_slice(&UNDEF_ADDR.to_le_bytes());
        b.extend_from_slice(&eoa.to_le_bytes());
        b.extend_from_slice(&UNDEF_ADDR.to_le_bytes());
        b.extend_from_slice(&0u64.to_le_bytes());
        b.extend_from_slice(&root_header.to_le_bytes());
        match cache {
            Some((btree, heap)) => {
                b.extend_from_slice(&1u32.to_le_bytes());
                b.extend_from_slice(&0u32.to_le_bytes());
                b.extend_from_slice(&btree.to_le_bytes());
                b.extend_from_slice(&heap.to_le_bytes());
            }
            None => b.extend_from_slice(&[0; 24]),
        }
        self.write(0, &b);
    }

    /// Write a v2 superblock at address 0.
    pub fn superblock_v2(&mut self, root_header: u64, ext: u64) {
        let eoa = self.len();
        let mut b = HDF5_SIGNATURE.to_vec();
        b.extend_from_slice(&[2, 8, 8, 0]);
        b.extend_from_slice(&0u64.to_le_bytes());
        b.extend_from_slice(&ext.to_le_bytes());
        b.extend_from_slice(&eoa.to_le_bytes());
        b.extend_from_slice(&root_header.to_le_bytes());
        self.write(0, &sealed(b));
    }
}

/// Message payload encoders.
pub mod msg {
    use crate::decode::UNDEF_ADDR;

    /// Symbol Table message.
    pub fn symbol_table(btree: u64, heap: u64) -> Vec<u8> {
        let mut v = btree.to_le_bytes().to_vec();
        v.extend_from_slice(&heap.to_le_bytes());
        v
    }

    /// Hard link named `name` to `addr`.
    pub fn link_hard(name: &str, addr: u64) -> Vec<u8> {
        let mut v = vec![1, 0, name.len() as u8];
        v.extend_from_slice(name.as_bytes());
        v.extend_from_slice(&addr.to_le_bytes());
        v
    }

    /// Soft link named `name` to `path`.
    pub fn link_soft(name: &str, path: &str) -> Vec<u8> {
        let mut v = vec![1, 0x08, 1, name.len() as u8];
        v.extend_from_slice(name.as_bytes());
        v.extend_from_slice(&(path.len() as u16).to_le_bytes());
        v.extend_from_slice(path.as_bytes());
        v
    }

    /// External link named `name` to `path` inside `file`.
    pub fn link_external(name: &str, file: &str, path: &str) -> Vec<u8> {
        let mut data = vec![0];
        data.extend_from_slice(file.as_bytes());
        data.push(0);
        data.extend_from_slice(path.as_bytes());
        data.push(0);
        let mut v = vec![1, 0x08, 64, name.len() as u8];
        v.extend_from_slice(name.as_bytes());
        v.extend_from_slice(&(data.len() as u16).to_le_bytes());
        v.extend_from_slice(&data);
        v
    }

    /// Link Info message without creation order.
    pub fn link_info(heap: u64, name_index: u64) -> Vec<u8> {
        let mut v = vec![0, 0];
        v.extend_from_slice(&heap.to_le_bytes());
        v.extend_from_slice(&name_index.to_le_bytes());
        v
    }

    /// Link Info message tracking and indexing creation order.
    pub fn link_info_ordered(heap: u64, name_index: u64, order_index: u64, max_order: u64) -> Vec<u8> {
        let mut v = vec![0, 0x03];
        v.extend_from_slice(&max_order.to_le_bytes());
        for a in [heap, name_index, order_index] {
            v.extend_from_slice(&a.to_le_bytes());
        }
        v
    }

    /// Link Info message of a group whose links are all compact.
    pub fn link_info_compact() -> Vec<u8> {
        link_info(UNDEF_ADDR, UNDEF_ADDR)
    }

    /// Group Info message with default thresholds.
    pub fn group_info() -> Vec<u8> {
        vec![0, 0]
    }

    /// Attribute Info message without creation order.
    pub fn attribute_info(heap: u64, name_index: u64) -> Vec<u8> {
        let mut v = vec![0, 0];
        v.extend_from_slice(&heap.to_le_bytes());
        v.extend_from_slice(&name_index.to_le_bytes());
        v
    }

    /// Version 3 scalar attribute. With `shared_type` the datatype bytes are
    /// a shared message reference.
    pub fn attribute(name: &str, datatype: Vec<u8>, shared_type: bool, value: &[u8]) -> Vec<u8> {
        let space = dataspace(&[]);
        let mut v = vec![3, u8::from(shared_type)];
        v.extend_from_slice(&(name.len() as u16 + 1).to_le_bytes());
        v.extend_from_slice(&(datatype.len() as u16).to_le_bytes());
        v.extend_from_slice(&(space.len() as u16).to_le_bytes());
        v.push(0);
        v.extend_from_slice(name.as_bytes());
        v.push(0);
        v.extend_from_slice(&datatype);
        v.extend_from_slice(&space);
        v.extend_from_slice(value);
        v
    }

    /// B-tree 'K' values message.
    pub fn btree_k(istore: u16, group_internal: u16, group_leaf: u16) -> Vec<u8> {
        let mut v = vec![0];
        for k in [istore, group_internal, group_leaf] {
            v.extend_from_slice(&k.to_le_bytes());
        }
        v
    }

    /// Shared message table message.
    pub fn shared_message_table(table: u64, indexes: u8) -> Vec<u8> {
        let mut v = vec![0];
        v.extend_from_slice(&table.to_le_bytes());
        v.push(indexes);
        v
    }

    /// Version 1 simple dataspace.
    pub fn dataspace(dims: &[u64]) -> Vec<u8> {
        let mut v = vec![1, dims.len() as u8, 0, 0, 0, 0, 0, 0];
        for d in dims {
            v.extend_from_slice(&d.to_le_bytes());
        }
        v
    }

    /// Version 1 little-endian 32-bit unsigned integer.
    pub fn datatype_u32() -> Vec<u8> {
        let mut v = vec![0x10, 0, 0, 0];
        v.extend_from_slice(&4u32.to_le_bytes());
        v.extend_from_slice(&0u16.to_le_bytes());
        v.extend_from_slice(&32u16.to_le_bytes());
        v
    }

    /// Version 3 contiguous layout.
    pub fn layout_contiguous(addr: u64, size: u64) -> Vec<u8> {
        let mut v = vec![3, 1];
        v.extend_from_slice(&addr.to_le_bytes());
        v.extend_from_slice(&size.to_le_bytes());
        v
    }

    /// Version 3 chunked layout indexed by a B-tree v1; `dims` ends with the
    /// element size.
    pub fn layout_chunked_v3(btree: u64, dims: &[u32]) -> Vec<u8> {
        let mut v = vec![3, 2, dims.len() as u8];
        v.extend_from_slice(&btree.to_le_bytes());
        for d in dims {
            v.extend_from_slice(&d.to_le_bytes());
        }
        v
    }

    /// Continuation message.
    pub fn continuation(addr: u64, len: u64) -> Vec<u8> {
        let mut v = addr.to_le_bytes().to_vec();
        v.extend_from_slice(&len.to_le_bytes());
        v
    }

    /// Version 3 shared reference into the shared message heap.
    pub fn shared_sohm(heap_id: &[u8]) -> Vec<u8> {
        let mut v = vec![3, 1];
        v.extend_from_slice(&heap_id[..8]);
        v
    }

    /// Version 3 shared reference to a committed object.
    pub fn shared_committed(addr: u64) -> Vec<u8> {
        let mut v = vec![3, 2];
        v.extend_from_slice(&addr.to_le_bytes());
        v
    }
}
