//! # Device Tree Front-Ends
//!
//! Builds a [`loader_dt::DeviceTree`] from either of two on-disk
//! descriptions: an extended-JSON document ([`json`]) or an XML property
//! list ([`xml`]). Both front-ends funnel into the same
//! [`build_from_object`]/[`build_from_tag`] walk: an `@`-prefixed key names
//! an array of child nodes, anything else is a property.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod json;
pub mod xml;

use alloc::vec::Vec;
use loader_dt::{DeviceTree, DtError, NodeId};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrontError {
    #[error("input ended before a value was complete")]
    UnexpectedEof,
    #[error("expected a ':' between an object key and its value")]
    ExpectedColon,
    #[error("expected a quoted string")]
    ExpectedString,
    #[error("expected a primitive value (number, true, false, null)")]
    ExpectedPrimitive,
    #[error("expected an XML tag")]
    ExpectedTag,
    #[error("top-level document has no dictionary")]
    NoRootDict,
    #[error(transparent)]
    Tree(#[from] DtError),
}

/// Build a device tree from a parsed JSON document. The document's
/// top-level value must be an object, which becomes the root node's
/// properties and children.
pub fn build_device_tree(value: &json::JsonValue, tree: &mut DeviceTree) -> Result<(), FrontError> {
    let root = tree.root();
    populate_node(value, tree, root)
}

fn populate_node(value: &json::JsonValue, tree: &mut DeviceTree, node: NodeId) -> Result<(), FrontError> {
    let entries = match value {
        json::JsonValue::Object(entries) => entries,
        _ => return Err(FrontError::ExpectedString),
    };

    for (key, val) in entries {
        if key.starts_with('@') {
            let json::JsonValue::Array(items) = val else {
                return Err(FrontError::ExpectedString);
            };
            for item in items {
                let child = tree.add_child(node);
                populate_node(item, tree, child)?;
            }
            continue;
        }

        let data = value_to_property_bytes(val)?;
        tree.add_property(node, key, &data)?;
    }
    Ok(())
}

fn value_to_property_bytes(value: &json::JsonValue) -> Result<Vec<u8>, FrontError> {
    match value {
        json::JsonValue::Integer(v) => Ok((*v as u32).to_le_bytes().to_vec()),
        json::JsonValue::String(s) => {
            let mut bytes = s.as_bytes().to_vec();
            bytes.push(0);
            Ok(bytes)
        }
        json::JsonValue::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                match item {
                    json::JsonValue::Integer(v) => out.extend_from_slice(&(*v as u32).to_le_bytes()),
                    json::JsonValue::String(s) => {
                        out.extend_from_slice(s.as_bytes());
                        out.push(0);
                    }
                    _ => return Err(FrontError::ExpectedPrimitive),
                }
            }
            Ok(out)
        }
        json::JsonValue::Object(_) => Err(FrontError::ExpectedPrimitive),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_tree_with_property_and_child() {
        let doc = json::parse("{'model': 'xnu-arm-virt', '@children': [{'name': 'cpu0', 'reg': [0, 1]}]}").unwrap();
        let mut tree = DeviceTree::new();
        build_device_tree(&doc, &mut tree).unwrap();

        let size = tree.flattened_size();
        let mut buf = alloc::vec![0u8; size];
        tree.flatten(&mut buf).unwrap();
        // root: magic(4) + nProperties/nChildren(8) = 12, then one property
        assert_eq!(&buf[12..12 + 5], b"model");
    }
}
