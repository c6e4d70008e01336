//! Persisted-object lookup.
//!
//! A block may name its parent by [`ObjectId`] instead of holding it. The
//! machine resolves such parents through the [`Store`] the first time a name
//! lookup climbs past them, charges the decoded blob, and caches the loaded
//! block as a direct link.

use crate::virtual_machine::values::Block;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Identifier of a persisted object.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}

/// A block read back from storage.
#[derive(Clone)]
pub struct StoredBlock {
    pub block: Rc<Block>,
    /// Size of the wire encoding the block was decoded from.
    pub encoded_len: usize,
}

/// Read access to persisted blocks.
pub trait Store {
    /// Loads a block, returning `None` if `id` is unknown.
    fn get_block(&self, id: ObjectId) -> Option<StoredBlock>;
}

/// In-memory store, for tests and offline evaluation.
#[derive(Default)]
pub struct MemStore {
    blocks: BTreeMap<ObjectId, StoredBlock>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ObjectId, block: Rc<Block>, encoded_len: usize) {
        self.blocks.insert(id, StoredBlock { block, encoded_len });
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl Store for MemStore {
    fn get_block(&self, id: ObjectId) -> Option<StoredBlock> {
        self.blocks.get(&id).cloned()
    }
}
