//! Logical tree node model.
//!
//! The tree owns a parent reference per node and a child list per node,
//! which is a reference cycle if nodes own each other directly. This breaks
//! the cycle with an arena (`crate::arena`) indexed by `NodeId`; `TreeNode`
//! here holds only ids, never owning references, to its neighbours.

use crate::address::SegmentAddress;
use crate::arena::NodeId;
use crate::codec::{Reader, Writer};
use crate::error::{PmtError, Result};

/// A tagged variant beats a subclass hierarchy here: every caller can
/// exhaustively `match` on the four kinds, and only `Measurement` carries
/// leaf-specific payload (the optional alias).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Database,
    Internal,
    Device,
    Measurement { alias: Option<String> },
}

const TAG_DATABASE: u8 = 0;
const TAG_INTERNAL: u8 = 1;
const TAG_DEVICE: u8 = 2;
const TAG_MEASUREMENT: u8 = 3;

impl NodeKind {
    /// Only `Measurement` nodes are leaves; every other kind owns a subtree
    /// of children, so `subtree_address` is always `None` for a leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Measurement { .. })
    }

    fn tag(&self) -> u8 {
        match self {
            NodeKind::Database => TAG_DATABASE,
            NodeKind::Internal => TAG_INTERNAL,
            NodeKind::Device => TAG_DEVICE,
            NodeKind::Measurement { .. } => TAG_MEASUREMENT,
        }
    }
}

/// The on-disk payload half of a child record; the payload schema is
/// kind-tagged by its first byte. `Segment` owns the
/// `(key_length, key_bytes, payload)` envelope; this is what callers pass as
/// the payload slice to `Segment::insert`/`lookup`/`update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRecord {
    pub kind: NodeKind,
    pub subtree_address: Option<SegmentAddress>,
    pub attributes: Vec<u8>,
}

impl ChildRecord {
    pub fn has_alias(&self) -> bool {
        matches!(&self.kind, NodeKind::Measurement { alias: Some(_) })
    }

    /// Number of leading bytes of `bytes` that form one complete encoded
    /// record, without materializing a `ChildRecord`. `Segment` (spec.md 3,
    /// 4.B) stores no record-length field of its own — "payload length is
    /// derived from the record kind" — so this is how it recovers a
    /// record's extent from the kind tag and the length-prefixed fields
    /// that follow it.
    pub fn peek_len(bytes: &[u8]) -> Result<usize> {
        let mut r = Reader::new(bytes);
        let tag = r.read_u8()?;
        let mut kind = match tag {
            TAG_DATABASE => NodeKind::Database,
            TAG_INTERNAL => NodeKind::Internal,
            TAG_DEVICE => NodeKind::Device,
            TAG_MEASUREMENT => NodeKind::Measurement { alias: None },
            other => return Err(PmtError::corrupt(format!("unknown node kind tag {other}"))),
        };
        if !kind.is_leaf() {
            r.read_i64()?;
        }
        if let NodeKind::Measurement { alias } = &mut kind {
            *alias = r.read_string()?;
        }
        let attr_len = r.read_u32()? as usize;
        r.read_bytes(attr_len)?;
        Ok(r.pos())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.resize(self.encoded_len(), 0);
        {
            let mut w = Writer::new(&mut buf);
            w.write_u8(self.kind.tag()).unwrap();
            if !self.kind.is_leaf() {
                let addr = self
                    .subtree_address
                    .unwrap_or(SegmentAddress::UNALLOCATED);
                w.write_i64(addr.raw()).unwrap();
            }
            if let NodeKind::Measurement { alias } = &self.kind {
                w.write_string(alias.as_deref()).unwrap();
            }
            w.write_u32(self.attributes.len() as u32).unwrap();
            w.write_bytes(&self.attributes).unwrap();
        }
        buf
    }

    fn encoded_len(&self) -> usize {
        let mut n = 1;
        if !self.kind.is_leaf() {
            n += 8;
        }
        if let NodeKind::Measurement { alias } = &self.kind {
            n += 4 + alias.as_deref().map(str::len).unwrap_or(0);
        }
        n += 4 + self.attributes.len();
        n
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let tag = r.read_u8()?;
        let mut kind = match tag {
            TAG_DATABASE => NodeKind::Database,
            TAG_INTERNAL => NodeKind::Internal,
            TAG_DEVICE => NodeKind::Device,
            TAG_MEASUREMENT => NodeKind::Measurement { alias: None },
            other => return Err(PmtError::corrupt(format!("unknown node kind tag {other}"))),
        };

        let subtree_address = if !kind.is_leaf() {
            let addr = SegmentAddress::from_raw(r.read_i64()?);
            if addr.is_allocated() {
                Some(addr)
            } else {
                None
            }
        } else {
            None
        };

        if let NodeKind::Measurement { alias } = &mut kind {
            *alias = r.read_string()?;
        }

        let attr_len = r.read_u32()? as usize;
        let attributes = r.read_bytes(attr_len)?.to_vec();

        Ok(ChildRecord {
            kind,
            subtree_address,
            attributes,
        })
    }
}

/// The arena-resident, in-memory form of a tree node. Owned by `Engine`'s
/// `Arena<TreeNode>`; neighbours are referenced by `NodeId`, never owned.
pub struct TreeNode {
    pub name: String,
    pub kind: NodeKind,
    pub subtree_address: Option<SegmentAddress>,
    pub attributes: Vec<u8>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Whether `children` reflects the full on-disk set. Measurement nodes
    /// (no subtree) and brand-new nodes are trivially "loaded".
    pub children_loaded: bool,
    /// Whether this node has ever survived a `SchemaFile::write_node` call.
    /// Distinct from `subtree_address.is_some()`: a leaf is persisted once
    /// its own record lands in its parent's segment even though it never
    /// has a subtree address.
    pub persisted: bool,
}

impl TreeNode {
    pub fn new_root(kind: NodeKind) -> Self {
        TreeNode {
            name: String::new(),
            kind,
            subtree_address: Some(SegmentAddress::new(0, 0)),
            attributes: Vec::new(),
            parent: None,
            children: Vec::new(),
            children_loaded: false,
            persisted: true,
        }
    }

    pub fn new_child(name: impl Into<String>, kind: NodeKind, parent: NodeId) -> Self {
        TreeNode {
            name: name.into(),
            kind,
            subtree_address: None,
            attributes: Vec::new(),
            parent: Some(parent),
            children: Vec::new(),
            children_loaded: true,
            persisted: false,
        }
    }

    pub fn to_record(&self) -> ChildRecord {
        ChildRecord {
            kind: self.kind.clone(),
            subtree_address: self.subtree_address,
            attributes: self.attributes.clone(),
        }
    }
}

/// A minimal, valid self-describing record payload carrying `attrs` as its
/// attribute blob. Shared by the lower-layer test suites (segment, page,
/// schema file) that need a payload shaped like a real on-disk record —
/// since `Segment` now recovers payload length via `ChildRecord::peek_len`,
/// those suites can no longer pass arbitrary opaque bytes as a stand-in.
#[cfg(test)]
pub(crate) fn test_record_payload(attrs: &[u8]) -> Vec<u8> {
    ChildRecord {
        kind: NodeKind::Device,
        subtree_address: None,
        attributes: attrs.to_vec(),
    }
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_record_round_trip() {
        let rec = ChildRecord {
            kind: NodeKind::Internal,
            subtree_address: Some(SegmentAddress::new(3, 1)),
            attributes: vec![1, 2, 3],
        };
        let bytes = rec.encode();
        let decoded = ChildRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn internal_record_with_unallocated_subtree() {
        let rec = ChildRecord {
            kind: NodeKind::Device,
            subtree_address: None,
            attributes: vec![],
        };
        let bytes = rec.encode();
        let decoded = ChildRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.subtree_address, None);
    }

    #[test]
    fn measurement_record_round_trip_with_and_without_alias() {
        let with_alias = ChildRecord {
            kind: NodeKind::Measurement {
                alias: Some("temp_f".to_string()),
            },
            subtree_address: None,
            attributes: b"float64".to_vec(),
        };
        let bytes = with_alias.encode();
        assert_eq!(ChildRecord::decode(&bytes).unwrap(), with_alias);
        assert!(with_alias.has_alias());

        let without_alias = ChildRecord {
            kind: NodeKind::Measurement { alias: None },
            subtree_address: None,
            attributes: b"int64".to_vec(),
        };
        let bytes = without_alias.encode();
        assert_eq!(ChildRecord::decode(&bytes).unwrap(), without_alias);
        assert!(!without_alias.has_alias());
    }

    #[test]
    fn rejects_unknown_kind_tag() {
        let bytes = [0xffu8, 0, 0, 0, 0];
        assert!(matches!(
            ChildRecord::decode(&bytes),
            Err(PmtError::Corrupt { .. })
        ));
    }

    #[test]
    fn peek_len_matches_encoded_len_for_every_kind() {
        let records = [
            ChildRecord {
                kind: NodeKind::Database,
                subtree_address: Some(SegmentAddress::new(1, 2)),
                attributes: vec![9, 9],
            },
            ChildRecord {
                kind: NodeKind::Internal,
                subtree_address: None,
                attributes: vec![],
            },
            ChildRecord {
                kind: NodeKind::Measurement {
                    alias: Some("temp_f".to_string()),
                },
                subtree_address: None,
                attributes: b"float64".to_vec(),
            },
            ChildRecord {
                kind: NodeKind::Measurement { alias: None },
                subtree_address: None,
                attributes: b"int64".to_vec(),
            },
        ];
        for rec in records {
            let bytes = rec.encode();
            assert_eq!(ChildRecord::peek_len(&bytes).unwrap(), bytes.len());
        }
    }

    #[test]
    fn peek_len_ignores_trailing_garbage() {
        let rec = ChildRecord {
            kind: NodeKind::Device,
            subtree_address: None,
            attributes: vec![1, 2, 3],
        };
        let mut bytes = rec.encode();
        let exact_len = bytes.len();
        bytes.extend_from_slice(&[0xaa; 16]);
        assert_eq!(ChildRecord::peek_len(&bytes).unwrap(), exact_len);
    }
}
