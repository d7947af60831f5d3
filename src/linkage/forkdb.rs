//! Minimal in-memory fork database.

use std::collections::HashMap;

use crate::block::BlockRef;

use super::ForkTracker;

#[derive(Debug, Clone)]
struct Link {
    number:    u64,
    parent_id: String,
}

/// Tracks parent links above the last irreversible block (LIB).
///
/// A block is part of the reversible segment when following parent links
/// from it reaches the LIB without a missing link.
#[derive(Debug, Default)]
pub struct ForkDb {
    links: HashMap<String, Link>,
    lib:   Option<BlockRef>,
}

impl ForkDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lib(&self) -> Option<&BlockRef> {
        self.lib.as_ref()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

impl ForkTracker for ForkDb {
    fn has_lib(&self) -> bool {
        self.lib.is_some()
    }

    fn init_lib(&mut self, block: BlockRef) {
        self.lib = Some(block);
    }

    fn add_link(&mut self, block: &BlockRef, parent_id: &str) {
        self.links.insert(
            block.id.clone(),
            Link { number: block.number, parent_id: parent_id.to_string() },
        );
    }

    fn reversible_segment(&self, block: &BlockRef) -> Option<Vec<BlockRef>> {
        let lib = self.lib.as_ref()?;
        let mut segment = Vec::new();
        let mut cur_id = block.id.as_str();
        loop {
            if cur_id == lib.id {
                segment.reverse();
                return Some(segment);
            }
            let link = self.links.get(cur_id)?;
            // Walked below the LIB without meeting it: this is a fork.
            if link.number <= lib.number {
                return None;
            }
            segment.push(BlockRef { id: cur_id.to_string(), number: link.number });
            cur_id = link.parent_id.as_str();
        }
    }

    fn set_lib(&mut self, block: BlockRef) {
        self.lib = Some(block);
    }

    fn purge_before_lib(&mut self) -> usize {
        let Some(lib_num) = self.lib.as_ref().map(|l| l.number) else {
            return 0;
        };
        let before = self.links.len();
        self.links.retain(|_, link| link.number >= lib_num);
        before - self.links.len()
    }
}
