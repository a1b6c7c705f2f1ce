//! String interning backed by a chunked, append-only byte arena.
//!
//! Every distinct string in a translation unit is stored exactly once; all
//! occurrences are referred to by a packed 4-byte [`StringHandle`]. Two
//! handles compare equal iff they refer to identical bytes, so handle
//! equality replaces string comparison everywhere downstream.
//!
//! # Storage
//!
//! The arena is a list of chunks. The first chunk is 64 KiB and each new
//! chunk doubles in size up to a 1 MiB ceiling. An entry is a little-endian
//! `u32` byte length followed by the string bytes. A handle packs the chunk
//! index into the upper 12 bits and the byte offset within the chunk into the
//! lower 20 bits, which is exactly enough to address a 1 MiB chunk. Chunks
//! are never freed or reused, so a handle stays valid for the lifetime of the
//! table.
//!
//! # Lookup
//!
//! Interning probes an open-addressed map keyed by a 64-bit content key mixed
//! from the string hash and its length. Hash collisions are resolved by
//! linear probing with a golden-ratio offset. The content hash uses fixed
//! seeds so handle assignment is deterministic across runs, which keeps
//! emitted symbol order stable.

use std::hash::BuildHasher;

use rustc_hash::FxHashMap;

/// Bits of a handle reserved for the offset within a chunk.
const OFFSET_BITS: u32 = 20;
/// Mask extracting the offset portion of a handle.
const OFFSET_MASK: u32 = (1 << OFFSET_BITS) - 1;
/// Size of the first arena chunk.
const FIRST_CHUNK: usize = 64 * 1024;
/// Ceiling for chunk growth.
const MAX_CHUNK: usize = 1024 * 1024;
/// Probe offset for collision resolution (golden ratio constant).
const PROBE_PRIME: u64 = 0x9e3779b97f4a7c15;
/// Maximum probes before the table is considered corrupted.
const MAX_PROBES: u64 = 64;

/// A 4-byte handle to an interned string.
///
/// Handles are only meaningful together with the [`StringTable`] that issued
/// them. Equality of handles from the same table is equality of strings.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StringHandle {
    raw: u32,
}

static_assertions::assert_eq_size!(StringHandle, u32);

impl StringHandle {
    /// Placeholder handle for default-constructed metadata records. Resolves
    /// to whatever string was interned first; only meaningful as a value to
    /// be overwritten.
    pub const DUMMY: StringHandle = StringHandle { raw: 0 };

    #[inline]
    fn new(chunk: usize, offset: usize) -> Self {
        debug_assert!(chunk < (1 << (32 - OFFSET_BITS)));
        debug_assert!(offset <= OFFSET_MASK as usize);
        Self {
            raw: ((chunk as u32) << OFFSET_BITS) | offset as u32,
        }
    }

    #[inline]
    fn chunk(self) -> usize {
        (self.raw >> OFFSET_BITS) as usize
    }

    #[inline]
    fn offset(self) -> usize {
        (self.raw & OFFSET_MASK) as usize
    }

    /// Raw packed value, for debug output and hashing.
    #[inline]
    pub fn as_u32(self) -> u32 {
        self.raw
    }
}

impl std::fmt::Debug for StringHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StringHandle({}:{})", self.chunk(), self.offset())
    }
}

/// Counters describing interner activity, reported under `-v`.
#[derive(Clone, Copy, Debug, Default)]
pub struct InternerStats {
    /// Number of distinct interned strings.
    pub count: usize,
    /// Total bytes of string payload stored (excluding length prefixes).
    pub bytes: usize,
    /// Lookups that found an existing entry.
    pub hits: u64,
    /// Lookups that allocated a new entry.
    pub misses: u64,
    /// Hash collisions resolved by probing.
    pub collisions: u64,
}

impl InternerStats {
    /// Fraction of lookups served without allocation.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// The per-translation-unit string table.
///
/// Owned by the driver and handed to the lexer, parser and code generator by
/// reference. `intern` requires `&mut self`; the pipeline is single-threaded
/// so no synchronization is involved.
pub struct StringTable {
    chunks: Vec<Vec<u8>>,
    map: FxHashMap<u64, StringHandle>,
    hasher: ahash::RandomState,
    count: usize,
    payload_bytes: usize,
    hits: u64,
    misses: u64,
    collisions: u64,
}

impl StringTable {
    /// Create an empty table with the first chunk pre-allocated.
    pub fn new() -> Self {
        Self {
            chunks: vec![Vec::with_capacity(FIRST_CHUNK)],
            map: FxHashMap::default(),
            // Fixed seeds: handle assignment must be deterministic so that
            // symbol emission order does not vary between runs.
            hasher: ahash::RandomState::with_seeds(
                0x2435_87a1_9add_4f2c,
                0x8d3f_00c1_55aa_91e7,
                0x5bd1_e995_7b42_d1c3,
                0x1656_67b1_9e37_79f9,
            ),
            count: 0,
            payload_bytes: 0,
            hits: 0,
            misses: 0,
            collisions: 0,
        }
    }

    /// Intern a string, returning its handle.
    ///
    /// Equal inputs always return equal handles; a returned handle never
    /// becomes invalid.
    pub fn intern(&mut self, s: &str) -> StringHandle {
        let key = self.content_key(s);
        for i in 0..MAX_PROBES {
            let probe = key.wrapping_add(i.wrapping_mul(PROBE_PRIME));
            match self.map.get(&probe) {
                Some(&handle) => {
                    if self.view(handle) == s {
                        self.hits += 1;
                        return handle;
                    }
                    // Different string with the same probe key.
                    self.collisions += 1;
                }
                None => {
                    let handle = self.push_bytes(s);
                    self.map.insert(probe, handle);
                    self.misses += 1;
                    return handle;
                }
            }
        }
        // 64 consecutive occupied probes over a 64-bit keyspace means the
        // content hash is broken; treat as an internal invariant violation.
        panic!("string interner probe sequence exhausted");
    }

    /// Resolve a handle to its string. O(1).
    #[inline]
    pub fn view(&self, handle: StringHandle) -> &str {
        let chunk = &self.chunks[handle.chunk()];
        let off = handle.offset();
        let len =
            u32::from_le_bytes([chunk[off], chunk[off + 1], chunk[off + 2], chunk[off + 3]])
                as usize;
        std::str::from_utf8(&chunk[off + 4..off + 4 + len]).unwrap_or("")
    }

    /// Activity counters for `-v` reporting.
    pub fn stats(&self) -> InternerStats {
        InternerStats {
            count: self.count,
            bytes: self.payload_bytes,
            hits: self.hits,
            misses: self.misses,
            collisions: self.collisions,
        }
    }

    fn content_key(&self, s: &str) -> u64 {
        // Keyed on (hash, length): folding the length in cheaply separates
        // most strings that happen to share a hash prefix.
        self.hasher.hash_one(s) ^ (s.len() as u64).rotate_left(32)
    }

    fn push_bytes(&mut self, s: &str) -> StringHandle {
        let needed = 4 + s.len();
        let fits = {
            let cur = self.chunks.last().expect("arena always has a chunk");
            cur.len() + needed <= cur.capacity() && cur.len() <= OFFSET_MASK as usize
        };
        if !fits {
            let prev_cap = self.chunks.last().map(|c| c.capacity()).unwrap_or(0);
            let next = (prev_cap * 2).clamp(FIRST_CHUNK, MAX_CHUNK).max(needed);
            self.chunks.push(Vec::with_capacity(next));
        }
        let chunk_idx = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_idx];
        let offset = chunk.len();
        chunk.extend_from_slice(&(s.len() as u32).to_le_bytes());
        chunk.extend_from_slice(s.as_bytes());
        self.count += 1;
        self.payload_bytes += s.len();
        StringHandle::new(chunk_idx, offset)
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_same_string() {
        let mut t = StringTable::new();
        let a = t.intern("hello");
        let b = t.intern("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn test_intern_different_strings() {
        let mut t = StringTable::new();
        let a = t.intern("hello");
        let b = t.intern("world");
        assert_ne!(a, b);
    }

    #[test]
    fn test_view_roundtrip() {
        let mut t = StringTable::new();
        let h = t.intern("operator<=>");
        assert_eq!(t.view(h), "operator<=>");
    }

    #[test]
    fn test_empty_string() {
        let mut t = StringTable::new();
        let h = t.intern("");
        assert_eq!(t.view(h), "");
        assert_eq!(t.intern(""), h);
    }

    #[test]
    fn test_handles_survive_chunk_growth() {
        let mut t = StringTable::new();
        let first = t.intern("stable");
        // Force several chunk rollovers.
        let mut handles = Vec::new();
        for i in 0..5000 {
            handles.push((i, t.intern(&format!("identifier_number_{i}_padding_padding"))));
        }
        assert_eq!(t.view(first), "stable");
        for (i, h) in handles {
            assert_eq!(t.view(h), format!("identifier_number_{i}_padding_padding"));
        }
    }

    #[test]
    fn test_oversized_string_gets_own_chunk() {
        let mut t = StringTable::new();
        let big = "x".repeat(2 * 1024 * 1024);
        let h = t.intern(&big);
        assert_eq!(t.view(h), big);
        // Interning afterwards still works and dedups.
        let small = t.intern("after");
        assert_eq!(t.view(small), "after");
        assert_eq!(t.intern(&big), h);
    }

    #[test]
    fn test_identity_invariant() {
        // intern(s) == intern(t) <=> s == t
        let mut t = StringTable::new();
        let words = ["a", "b", "ab", "ba", "aa", "", "a "];
        let handles: Vec<_> = words.iter().map(|w| t.intern(w)).collect();
        for (i, wi) in words.iter().enumerate() {
            for (j, wj) in words.iter().enumerate() {
                assert_eq!(handles[i] == handles[j], wi == wj, "{wi:?} vs {wj:?}");
            }
        }
    }

    #[test]
    fn test_stats_tracking() {
        let mut t = StringTable::new();
        t.intern("once");
        t.intern("once");
        t.intern("twice");
        let stats = t.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert!(stats.hit_rate() > 0.0);
    }

    #[test]
    fn test_determinism_across_tables() {
        // Fixed hash seeds: the same intern sequence yields the same handles.
        let mut a = StringTable::new();
        let mut b = StringTable::new();
        for w in ["int", "main", "return", "x", "y", "int"] {
            assert_eq!(a.intern(w), b.intern(w));
        }
    }
}
