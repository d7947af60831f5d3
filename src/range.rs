//! Block ranges and bundle-boundary arithmetic.
//!
//! A [`BlockRange`] with `stop == 0` is unbounded.  Requested ranges treat
//! `stop` as exclusive; ranges printed in scan reports are closed (`[a, b]`)
//! and [`BlockRange::reproc_range`] turns them back into the `start:stop`
//! form a repair run expects.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width of a bundle key: block numbers are zero padded to 10 digits.
pub const BUNDLE_KEY_WIDTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub stop:  u64,
}

impl BlockRange {
    pub fn new(start: u64, stop: u64) -> Self {
        Self { start, stop }
    }

    pub fn unbounded(start: u64) -> Self {
        Self { start, stop: 0 }
    }

    #[inline]
    pub fn is_bounded(&self) -> bool {
        self.stop != 0
    }

    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.stop == 0
    }

    /// The `start:stop` argument a follow-up run needs to reprocess this
    /// closed range.
    pub fn reproc_range(&self) -> String {
        if self.is_unbounded() {
            return "<Invalid Unbounded Range>".to_string();
        }
        format!("{}:{}", self.start, self.stop + 1)
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unbounded() {
            write!(f, "[{}, +∞]", pretty_block_num(self.start))
        } else {
            write!(f, "[{}, {}]", pretty_block_num(self.start), pretty_block_num(self.stop))
        }
    }
}

/// `1234567` → `#1 234 567`.
pub fn pretty_block_num(num: u64) -> String {
    let digits = num.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    out.push('#');
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(ch);
    }
    out
}

// ── Boundary helpers ──────────────────────────────────────────────────────────

#[inline]
pub fn round_to_bundle_start(num: u64, bundle_size: u64) -> u64 {
    num - num % bundle_size
}

#[inline]
pub fn round_to_bundle_end(num: u64, bundle_size: u64) -> u64 {
    round_to_bundle_start(num, bundle_size) + bundle_size - 1
}

/// Store key of the bundle starting at `base`.
pub fn bundle_key(base: u64) -> String {
    format!("{:0width$}", base, width = BUNDLE_KEY_WIDTH)
}

/// Extract the base number from a store key: the leading
/// [`BUNDLE_KEY_WIDTH`] digits of the first digit run at least that long.
/// Keys may carry a directory or a suffix.
pub fn parse_bundle_base(key: &str) -> Option<u64> {
    let bytes = key.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let run_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i - run_start >= BUNDLE_KEY_WIDTH {
            return key[run_start..run_start + BUNDLE_KEY_WIDTH].parse().ok();
        }
    }
    None
}

/// Listing prefix shared by every bundle key a bounded range can touch.
///
/// An unbounded range (or boundaries with no digits in common) yields the
/// empty prefix, which lists the whole store.
pub fn walk_prefix(range: &BlockRange, bundle_size: u64) -> String {
    if range.is_unbounded() {
        return String::new();
    }
    let start = bundle_key(round_to_bundle_start(range.start, bundle_size));
    let end   = bundle_key(round_to_bundle_end(range.stop.saturating_sub(1), bundle_size) + 1);

    let common = start
        .bytes()
        .zip(end.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    start[..common].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_numbers_group_by_thousands() {
        assert_eq!(pretty_block_num(0), "#0");
        assert_eq!(pretty_block_num(999), "#999");
        assert_eq!(pretty_block_num(1_000), "#1 000");
        assert_eq!(pretty_block_num(12_345_678), "#12 345 678");
    }

    #[test]
    fn display_and_reproc() {
        let r = BlockRange::new(100, 199);
        assert_eq!(r.to_string(), "[#100, #199]");
        assert_eq!(r.reproc_range(), "100:200");
        assert_eq!(BlockRange::unbounded(5).to_string(), "[#5, +∞]");
        assert!(BlockRange::unbounded(5).reproc_range().contains("Unbounded"));
    }

    #[test]
    fn rounding() {
        assert_eq!(round_to_bundle_start(250, 100), 200);
        assert_eq!(round_to_bundle_end(250, 100), 299);
        assert_eq!(round_to_bundle_end(200, 100), 299);
        assert_eq!(round_to_bundle_start(0, 100), 0);
    }

    #[test]
    fn parse_keys() {
        assert_eq!(parse_bundle_base("0000000100"), Some(100));
        assert_eq!(parse_bundle_base("blocks/0000012300.dbin.zst"), Some(12_300));
        assert_eq!(parse_bundle_base("0000000042-abcdef"), Some(42));
        assert_eq!(parse_bundle_base("v2/123"), None);
        assert_eq!(parse_bundle_base("readme"), None);
        assert_eq!(bundle_key(200), "0000000200");
    }

    #[test]
    fn prefix_from_shared_digits() {
        assert_eq!(walk_prefix(&BlockRange::new(100, 200), 100), "0000000");
        assert_eq!(walk_prefix(&BlockRange::new(1_000_000, 1_100_000), 100), "0001");
        assert_eq!(walk_prefix(&BlockRange::new(0, 9_000_000_000), 100), "");
        assert_eq!(walk_prefix(&BlockRange::unbounded(100), 100), "");
    }
}
