//! Chain linkage: classify each replayed block as linked into the
//! reversible segment or not, and follow the irreversible boundary.
//!
//! One [`LinkageTracker`] belongs to exactly one scan job; trackers are
//! never shared between workers.

use crate::block::{Block, BlockRef};

mod forkdb;

pub use forkdb::ForkDb;

/// Every this many consecutive unlinkable blocks, a large-gap report is raised.
pub const LARGE_GAP_INTERVAL: u64 = 100;

/// Capabilities the scanner needs from a fork-choice implementation.
pub trait ForkTracker: Send {
    fn has_lib(&self) -> bool;
    fn init_lib(&mut self, block: BlockRef);
    fn add_link(&mut self, block: &BlockRef, parent_id: &str);
    /// Blocks between the LIB (exclusive) and `block` (inclusive), or `None`
    /// when `block` does not chain back to the LIB.
    fn reversible_segment(&self, block: &BlockRef) -> Option<Vec<BlockRef>>;
    fn set_lib(&mut self, block: BlockRef);
    /// Forget links older than the LIB; returns how many were dropped.
    fn purge_before_lib(&mut self) -> usize;
}

/// Outcome of feeding one block through a [`LinkageTracker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Linkage {
    Linked,
    Unlinkable {
        consecutive: u64,
        /// Set every [`LARGE_GAP_INTERVAL`] consecutive unlinkable blocks.
        large_gap:   Option<LargeGap>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LargeGap {
    pub count:             u64,
    pub last_linked:       Option<BlockRef>,
    pub first_unlinkable:  BlockRef,
}

pub struct LinkageTracker<F: ForkTracker = ForkDb> {
    fdb:                F,
    last_linked:        Option<BlockRef>,
    first_unlinkable:   Option<BlockRef>,
    unlinkable_count:   u64,
}

impl Default for LinkageTracker<ForkDb> {
    fn default() -> Self {
        Self::new(ForkDb::new())
    }
}

impl<F: ForkTracker> LinkageTracker<F> {
    pub fn new(fdb: F) -> Self {
        Self {
            fdb,
            last_linked:      None,
            first_unlinkable: None,
            unlinkable_count: 0,
        }
    }

    pub fn last_linked(&self) -> Option<&BlockRef> {
        self.last_linked.as_ref()
    }

    pub fn first_unlinkable(&self) -> Option<&BlockRef> {
        self.first_unlinkable.as_ref()
    }

    pub fn unlinkable_count(&self) -> u64 {
        self.unlinkable_count
    }

    /// Register `block` and report whether it extends the reversible segment.
    /// Blocks must be fed in ascending order.
    pub fn observe(&mut self, block: &Block) -> Linkage {
        let block_ref = block.to_ref();
        if !self.fdb.has_lib() {
            self.fdb.init_lib(block_ref.clone());
        }
        self.fdb.add_link(&block_ref, &block.parent_id);

        if self.fdb.reversible_segment(&block_ref).is_none() {
            self.unlinkable_count += 1;
            let first = self.first_unlinkable.get_or_insert_with(|| block_ref.clone());

            let large_gap = (self.unlinkable_count % LARGE_GAP_INTERVAL == 0).then(|| LargeGap {
                count:            self.unlinkable_count,
                last_linked:      self.last_linked.clone(),
                first_unlinkable: first.clone(),
            });
            return Linkage::Unlinkable { consecutive: self.unlinkable_count, large_gap };
        }

        self.last_linked = Some(block_ref.clone());
        self.unlinkable_count = 0;
        self.first_unlinkable = None;
        self.fdb.set_lib(block_ref);
        self.fdb.purge_before_lib();
        Linkage::Linked
    }
}
