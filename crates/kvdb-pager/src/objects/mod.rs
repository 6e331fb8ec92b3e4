//! Concrete page object formats and the tagged-variant dispatch that lets
//! the cache (§4.5) store and mutate any of them uniformly (spec Design
//! Note 9).

pub mod btree_node;
pub mod config;
pub mod record;

use kvdb_error::{KvError, Result};
use kvdb_types::UpdateType;

pub use btree_node::{BranchEvent, BranchNode, LeafEvent, LeafNode};
pub use config::{ConfigEvent, ConfigPage};
pub use record::{RecordEvent, RecordPage};

/// A page kind, fixed by which namespace/btree role a page belongs to.
/// Persisted as the first byte after the LSN prefix isn't needed since the
/// page's kind is always known from context (namespace + tree metadata)
/// when it is read, matching the spec's page object model, which carries
/// no self-describing type tag of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageKind {
    Record,
    Leaf,
    Branch,
    Config,
}

/// A deserialized page object, tagged by which concrete format it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageObj {
    Record(RecordPage),
    Leaf(LeafNode),
    Branch(BranchNode),
    Config(ConfigPage),
}

impl PageObj {
    /// This object's kind.
    #[must_use]
    pub fn kind(&self) -> PageKind {
        match self {
            PageObj::Record(_) => PageKind::Record,
            PageObj::Leaf(_) => PageKind::Leaf,
            PageObj::Branch(_) => PageKind::Branch,
            PageObj::Config(_) => PageKind::Config,
        }
    }

    /// True if this object holds no live content (the `UpdateType`
    /// classification in §4.5 is defined in terms of this).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            PageObj::Record(p) => p.is_empty(),
            PageObj::Leaf(l) => l.is_empty(),
            PageObj::Branch(b) => b.is_empty(),
            PageObj::Config(c) => c.is_empty(),
        }
    }

    /// A freshly created default object of the same kind as `self`.
    #[must_use]
    pub fn default_of_kind(kind: PageKind) -> Self {
        match kind {
            PageKind::Record => PageObj::Record(RecordPage::default()),
            PageKind::Leaf => PageObj::Leaf(LeafNode::default()),
            PageKind::Branch => PageObj::Branch(BranchNode::default()),
            PageKind::Config => PageObj::Config(ConfigPage::default()),
        }
    }

    /// Serialize this object's body (without the LSN prefix the pager
    /// adds on persist).
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            PageObj::Record(p) => p.serialize(),
            PageObj::Leaf(l) => l.serialize(),
            PageObj::Branch(b) => b.serialize(),
            PageObj::Config(c) => c.serialize(),
        }
    }

    /// Deserialize an object body of the given `kind`.
    pub fn deserialize(kind: PageKind, bytes: &[u8]) -> Result<Self> {
        Ok(match kind {
            PageKind::Record => PageObj::Record(RecordPage::deserialize(bytes)?),
            PageKind::Leaf => PageObj::Leaf(LeafNode::deserialize(bytes)?),
            PageKind::Branch => PageObj::Branch(BranchNode::deserialize(bytes)?),
            PageKind::Config => PageObj::Config(ConfigPage::deserialize(bytes)?),
        })
    }

    /// Apply a matching [`PageEvent`] to this object. Errors if the event
    /// kind does not match the object's kind (a programming error in the
    /// caller, not a data corruption).
    pub fn apply(&mut self, event: &PageEvent) -> Result<()> {
        match (self, event) {
            (PageObj::Record(p), PageEvent::Record(e)) => e.apply(p),
            (PageObj::Leaf(l), PageEvent::Leaf(e)) => e.apply(l),
            (PageObj::Branch(b), PageEvent::Branch(e)) => e.apply(b),
            (PageObj::Config(c), PageEvent::Config(e)) => e.apply(c),
            _ => Err(KvError::corrupt("page event kind does not match object kind")),
        }
    }

    /// The `UpdateType` this object currently presents, paired with a
    /// caller-supplied `was_empty` flag, per §4.5's classification.
    #[must_use]
    pub fn classify(&self, was_empty: bool) -> UpdateType {
        UpdateType::classify(was_empty, self.is_empty())
    }
}

/// A mutating event against one of the concrete page object kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    Record(RecordEvent),
    Leaf(LeafEvent),
    Branch(BranchEvent),
    Config(ConfigEvent),
}

impl PageEvent {
    /// This event's kind (matches the object kind it must be applied to).
    #[must_use]
    pub fn kind(&self) -> PageKind {
        match self {
            PageEvent::Record(_) => PageKind::Record,
            PageEvent::Leaf(_) => PageKind::Leaf,
            PageEvent::Branch(_) => PageKind::Branch,
            PageEvent::Config(_) => PageKind::Config,
        }
    }

    /// Serialize this event's tagged body: one leading kind byte followed
    /// by the concrete event's own serialization.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 16);
        match self {
            PageEvent::Record(e) => {
                out.push(0);
                out.extend_from_slice(&e.serialize());
            }
            PageEvent::Leaf(e) => {
                out.push(1);
                out.extend_from_slice(&e.serialize());
            }
            PageEvent::Branch(e) => {
                out.push(2);
                out.extend_from_slice(&e.serialize());
            }
            PageEvent::Config(e) => {
                out.push(3);
                out.extend_from_slice(&e.serialize());
            }
        }
        out
    }

    /// Deserialize a tagged event body produced by [`serialize`](Self::serialize).
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(KvError::corrupt("empty page event"));
        }
        match bytes[0] {
            0 => Ok(PageEvent::Record(RecordEvent::deserialize(&bytes[1..])?)),
            1 => Ok(PageEvent::Leaf(LeafEvent::deserialize(&bytes[1..])?)),
            2 => Ok(PageEvent::Branch(BranchEvent::deserialize(&bytes[1..])?)),
            3 => Ok(PageEvent::Config(ConfigEvent::deserialize(&bytes[1..])?)),
            other => Err(KvError::corrupt(format!("bad page event kind tag {other}"))),
        }
    }
}
