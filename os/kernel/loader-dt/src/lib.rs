//! # Device Tree Builder
//!
//! An arena-backed tree of nodes and properties, built up by the JSON/XML
//! front-ends (`loader-dt-front`) or directly by the handoff assembler (for
//! the synthetic `/chosen/memory-map` node), then flattened into the
//! compact, pointer-free buffer the kernel itself walks.
//!
//! The arena owns every node and property; nodes are addressed by
//! [`NodeId`], not by reference, so the tree can be built with ordinary
//! `&mut DeviceTree` calls without fighting the borrow checker over parent/
//! child aliasing.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

use alloc::vec::Vec;
use loader_info::boot::DEVICE_TREE_MAGIC;

/// Fixed width of a property's name field in the flattened format, matching
/// the classic EFI/iBoot device tree's `kDTPropNameSizeMax`.
pub const PROP_NAME_LEN: usize = 32;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DtError {
    #[error("property name exceeds the 32-byte flattened name field")]
    NameTooLong,
    #[error("node already has a property with this name")]
    DuplicateProperty,
    #[error("destination buffer is smaller than the flattened size")]
    BufferTooSmall,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NodeId(u32);

struct Property {
    name: [u8; PROP_NAME_LEN],
    name_len: u8,
    data: Vec<u8>,
}

struct NodeData {
    properties: Vec<Property>,
    children: Vec<NodeId>,
}

/// An arena of device tree nodes, rooted at [`DeviceTree::root`].
pub struct DeviceTree {
    nodes: Vec<NodeData>,
}

impl Default for DeviceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTree {
    /// A fresh tree containing only the root node.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: alloc::vec![NodeData {
                properties: Vec::new(),
                children: Vec::new(),
            }],
        }
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Append a new, childless node under `parent`, in order after any
    /// siblings already added — child order is preserved through flatten,
    /// matching the original's `@children` array semantics.
    pub fn add_child(&mut self, parent: NodeId) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeData {
            properties: Vec::new(),
            children: Vec::new(),
        });
        self.nodes[parent.0 as usize].children.push(id);
        id
    }

    /// Attach a property to `node`. Names must be unique within a node and
    /// fit in [`PROP_NAME_LEN`] bytes, matching the flattened format's fixed
    /// name field.
    pub fn add_property(&mut self, node: NodeId, name: &str, data: &[u8]) -> Result<(), DtError> {
        let name_bytes = name.as_bytes();
        if name_bytes.len() >= PROP_NAME_LEN {
            return Err(DtError::NameTooLong);
        }

        let entry = &mut self.nodes[node.0 as usize];
        if entry.properties.iter().any(|p| p.name_str() == name) {
            return Err(DtError::DuplicateProperty);
        }

        let mut fixed = [0u8; PROP_NAME_LEN];
        fixed[..name_bytes.len()].copy_from_slice(name_bytes);
        entry.properties.push(Property {
            name: fixed,
            name_len: name_bytes.len() as u8,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Total bytes [`Self::flatten`] will write, including the leading
    /// magic. Call this first to size the destination buffer (the
    /// length-probe half of the original's two-pass flatten).
    #[must_use]
    pub fn flattened_size(&self) -> usize {
        4 + self.node_size(self.root())
    }

    fn node_size(&self, id: NodeId) -> usize {
        let node = &self.nodes[id.0 as usize];
        let mut size = 8; // nProperties, nChildren
        for prop in &node.properties {
            size += PROP_NAME_LEN + 4 + align4(prop.data.len());
        }
        for &child in &node.children {
            size += self.node_size(child);
        }
        size
    }

    /// Write the flattened tree into `dest`, which must be at least
    /// [`Self::flattened_size`] bytes. Returns the number of bytes written.
    pub fn flatten(&self, dest: &mut [u8]) -> Result<usize, DtError> {
        let total = self.flattened_size();
        if dest.len() < total {
            return Err(DtError::BufferTooSmall);
        }
        dest[0..4].copy_from_slice(&DEVICE_TREE_MAGIC.to_le_bytes());
        let mut cursor = 4usize;
        self.flatten_node(self.root(), dest, &mut cursor);
        Ok(total)
    }

    fn flatten_node(&self, id: NodeId, dest: &mut [u8], cursor: &mut usize) {
        let node = &self.nodes[id.0 as usize];

        write_u32(dest, cursor, node.properties.len() as u32);
        write_u32(dest, cursor, node.children.len() as u32);

        for prop in &node.properties {
            dest[*cursor..*cursor + PROP_NAME_LEN].copy_from_slice(&prop.name);
            *cursor += PROP_NAME_LEN;
            write_u32(dest, cursor, prop.data.len() as u32);
            let padded = align4(prop.data.len());
            dest[*cursor..*cursor + prop.data.len()].copy_from_slice(&prop.data);
            for b in &mut dest[*cursor + prop.data.len()..*cursor + padded] {
                *b = 0;
            }
            *cursor += padded;
        }

        for &child in &node.children {
            self.flatten_node(child, dest, cursor);
        }
    }
}

impl Property {
    fn name_str(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len as usize]).unwrap_or("")
    }
}

#[inline]
const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn write_u32(dest: &mut [u8], cursor: &mut usize, value: u32) {
    dest[*cursor..*cursor + 4].copy_from_slice(&value.to_le_bytes());
    *cursor += 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_only_tree_flattens_to_magic_plus_empty_node() {
        let tree = DeviceTree::new();
        assert_eq!(tree.flattened_size(), 4 + 8);

        let mut buf = alloc::vec![0u8; tree.flattened_size()];
        let written = tree.flatten(&mut buf).unwrap();
        assert_eq!(written, buf.len());
        assert_eq!(&buf[0..4], &DEVICE_TREE_MAGIC.to_le_bytes());
        assert_eq!(&buf[4..8], &0u32.to_le_bytes()); // nProperties
        assert_eq!(&buf[8..12], &0u32.to_le_bytes()); // nChildren
    }

    #[test]
    fn property_round_trips_through_flatten() {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        tree.add_property(root, "model", b"xnu-arm-virt\0").unwrap();

        let mut buf = alloc::vec![0u8; tree.flattened_size()];
        tree.flatten(&mut buf).unwrap();

        let name = &buf[12..12 + PROP_NAME_LEN];
        assert_eq!(&name[..5], b"model");
        let len = u32::from_le_bytes(buf[12 + PROP_NAME_LEN..12 + PROP_NAME_LEN + 4].try_into().unwrap());
        assert_eq!(len as usize, 13);
    }

    #[test]
    fn duplicate_property_name_rejected() {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        tree.add_property(root, "model", b"a").unwrap();
        assert_eq!(
            tree.add_property(root, "model", b"b").unwrap_err(),
            DtError::DuplicateProperty
        );
    }

    #[test]
    fn children_preserve_insertion_order() {
        let mut tree = DeviceTree::new();
        let root = tree.root();
        let a = tree.add_child(root);
        let b = tree.add_child(root);
        tree.add_property(a, "name", b"a\0").unwrap();
        tree.add_property(b, "name", b"b\0").unwrap();

        let mut buf = alloc::vec![0u8; tree.flattened_size()];
        tree.flatten(&mut buf).unwrap();

        // root header (8) + magic (4) = offset 12, no root properties
        let first_child_name_off = 12 + 8;
        assert_eq!(&buf[first_child_name_off..first_child_name_off + 1], b"n");
    }

    #[test]
    fn buffer_too_small_is_rejected() {
        let tree = DeviceTree::new();
        let mut buf = [0u8; 4];
        assert_eq!(tree.flatten(&mut buf).unwrap_err(), DtError::BufferTooSmall);
    }
}
