use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::backend::{BackendError, DeviceBackend, HostKey};
use crate::config::{AssociativityConfig, CacheConfig, CacheOptions, ReplacementPolicyConfig};
use crate::replacement_policies::{
    Fifo, LeastFrequentlyUsed, LeastRecentlyUsed, MostFrequentlyUsed, MostRecentlyUsed, Random,
    ReplacementPolicy,
};

/// Derived cache geometry: how the requested line count is split into sets
/// and ways, and how many address bits select a set.
///
/// Exact results need a power-of-two line count; other values floor-divide
/// into an approximate geometry, which is accepted behaviour rather than an
/// error. Degenerate inputs are clamped to at least one set of one way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sets: usize,
    pub lines_per_set: usize,
    pub index_bits: u32,
    pub index_bit_mask: usize,
}

impl Geometry {
    pub fn new(lines: usize, kind: AssociativityConfig) -> Self {
        let lines = lines.max(1);
        let (sets, lines_per_set, index_bits) = match kind {
            AssociativityConfig::Direct => (lines, 1, ceil_log2(lines)),
            AssociativityConfig::TwoWay => (lines / 2, 2, ceil_log2(lines).saturating_sub(1)),
            AssociativityConfig::FourWay => (lines / 4, 4, ceil_log2(lines).saturating_sub(2)),
            AssociativityConfig::Full => (1, lines, 0),
        };
        let sets = sets.max(1);
        // Fully associative caches ignore the index field entirely
        let index_bit_mask = match kind {
            AssociativityConfig::Full => 0,
            _ => (1usize << index_bits) - 1,
        };
        Self {
            sets,
            lines_per_set,
            index_bits,
            index_bit_mask,
        }
    }

    /// Total line slots actually allocated (sets * ways); differs from the
    /// requested count when that count is not a power of two
    pub fn total_lines(&self) -> usize {
        self.sets * self.lines_per_set
    }
}

fn ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

/// Running transfer counters. Monotonic; reset only by destroying the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Every backend transfer: allocations (with or without a copy-in) and
    /// copy-outs
    pub transfers: u64,
    /// Device-to-host copies performed by `read_back`
    pub reads: u64,
    /// Host-to-device copies performed at allocation time
    pub writes: u64,
    /// Acquires satisfied from cache with no backend call
    pub hits: u64,
}

/// A single slot of the cache store
#[derive(Debug, Clone)]
struct CacheLine<H> {
    valid: bool,
    tag: Option<HostKey>,
    handle: Option<H>,
}

impl<H> Default for CacheLine<H> {
    fn default() -> Self {
        Self {
            valid: false,
            tag: None,
            handle: None,
        }
    }
}

/// A device-buffer cache, parameterised by a backend and a replacement policy
///
/// The general approach is one solid implementation which is easy to maintain
/// and expand with more replacement policies: the policy is a type parameter,
/// so each policy's bookkeeping is monomorphised into the lookup and eviction
/// paths with no dispatch cost per call.
///
/// Lines live in a single flat, set-major arena rather than per-set
/// allocations; a slot is addressed as set * lines_per_set + way.
///
/// The cache owns the backend and every device-buffer handle it stores.
/// Dropping the cache releases each remaining handle exactly once. Lend the
/// backend by mutable reference (`&mut B` implements the backend trait) to
/// keep it alive past the cache for inspection.
pub struct Cache<B: DeviceBackend, R: ReplacementPolicy> {
    geometry: Geometry,
    data_size: usize,
    tag_size: usize,
    address_bit_shift: u32,
    lines: Vec<CacheLine<B::Handle>>,
    stats: TransferStats,
    backend: B,
    policy: R,
}

impl<B: DeviceBackend, R: ReplacementPolicy> Cache<B, R> {
    pub fn new(config: &CacheConfig, options: &CacheOptions, backend: B, policy: R) -> Self {
        let geometry = Geometry::new(config.lines, config.kind);
        let mut lines = Vec::with_capacity(geometry.total_lines());
        lines.resize_with(geometry.total_lines(), CacheLine::default);
        // The data block size defines an implicit offset-field width: shift
        // away as many low bits as divide it evenly
        let address_bit_shift = if config.data_size == 0 {
            0
        } else {
            config.data_size.trailing_zeros()
        };
        if options.report_memory_usage {
            let usable = geometry.total_lines() * config.data_size;
            let bookkeeping = geometry.total_lines() * std::mem::size_of::<CacheLine<B::Handle>>();
            info!(
                kind = ?config.kind,
                sets = geometry.sets,
                ways = geometry.lines_per_set,
                usable_bytes = usable,
                bookkeeping_bytes = bookkeeping,
                "allocated device-buffer cache"
            );
        }
        Self {
            geometry,
            data_size: config.data_size,
            tag_size: config.tag_size,
            address_bit_shift,
            lines,
            stats: TransferStats::default(),
            backend,
            policy,
        }
    }

    /// Maps a host key to its set index
    ///
    /// This is an identity hash of the key, not content-addressed: two keys
    /// that collide here are only told apart by tag comparison within the
    /// set. The final modulo keeps approximate (non-power-of-two) geometries
    /// in bounds and is a no-op for exact ones.
    pub fn set_index(&self, key: HostKey) -> usize {
        ((key.raw() >> self.address_bit_shift) & self.geometry.index_bit_mask) % self.geometry.sets
    }

    /// Finds the way holding `key` within `set`, updating the policy's hit
    /// metadata on a match. No side effects when nothing matches.
    fn find_way(&mut self, set: usize, key: HostKey) -> Option<usize> {
        let base = set * self.geometry.lines_per_set;
        for way in 0..self.geometry.lines_per_set {
            let line = &self.lines[base + way];
            if line.valid && line.tag == Some(key) {
                self.policy.update_on_hit(set, base + way);
                return Some(way);
            }
        }
        None
    }

    /// Returns a device buffer holding the data behind `key`
    ///
    /// With `copy_in` set, a hit returns the stored handle with no backend
    /// call; this is the cache's entire benefit. A miss, or a hit without
    /// copy semantics (a forced refresh), allocates a fresh buffer in the
    /// victim way, copying the host bytes in only when `copy_in` is set.
    ///
    /// # Errors
    ///
    /// Backend allocation failures propagate verbatim. The victim way has
    /// already had its old handle released by then, so after an error it
    /// must be treated as evicted, not merely failed.
    pub fn acquire(&mut self, key: HostKey, copy_in: bool) -> Result<B::Handle, BackendError> {
        let set = self.set_index(key);
        let hit_way = self.find_way(set, key);

        if let Some(way) = hit_way {
            if copy_in {
                let index = set * self.geometry.lines_per_set + way;
                if let Some(handle) = &self.lines[index].handle {
                    trace!(set, way, "acquire hit");
                    self.stats.hits += 1;
                    return Ok(handle.clone());
                }
            }
        }

        let base = set * self.geometry.lines_per_set;
        let index = match hit_way {
            // A hit without copy semantics refreshes in place
            Some(way) => base + way,
            None => {
                let first_empty = self.lines[base..base + self.geometry.lines_per_set]
                    .iter()
                    .position(|line| !line.valid)
                    .map(|way| base + way);
                self.policy
                    .select_victim(base, set, self.geometry.lines_per_set, first_empty)
            }
        };

        // Evict before allocating: a failed allocation leaves the way empty
        let line = &mut self.lines[index];
        line.valid = false;
        line.tag = None;
        if let Some(old) = line.handle.take() {
            debug!(set, way = index - base, "evicting line");
            self.backend.release(old);
        }

        let handle = self
            .backend
            .allocate(self.data_size, copy_in.then_some(key))?;
        let line = &mut self.lines[index];
        line.handle = Some(handle.clone());
        line.tag = Some(key);
        line.valid = true;
        self.stats.transfers += 1;
        if copy_in {
            self.stats.writes += 1;
        }
        debug!(set, way = index - base, copy_in, "acquire miss, line filled");
        Ok(handle)
    }

    /// Copies the cached data for `key` back out to the host
    ///
    /// Never allocates or evicts: the key must have been acquired earlier
    /// and still be resident. Returns `Ok(true)` when the copy happened and
    /// `Ok(false)` on a miss, which leaves all state untouched.
    ///
    /// # Errors
    ///
    /// Backend copy failures propagate verbatim; the counters are only
    /// bumped after a successful copy.
    pub fn read_back(&mut self, key: HostKey) -> Result<bool, BackendError> {
        let set = self.set_index(key);
        let Some(way) = self.find_way(set, key) else {
            trace!(set, "read miss");
            return Ok(false);
        };
        let index = set * self.geometry.lines_per_set + way;
        let Some(handle) = self.lines[index].handle.clone() else {
            return Ok(false);
        };
        self.backend.copy_out(&handle, key, self.data_size)?;
        self.stats.transfers += 1;
        self.stats.reads += 1;
        trace!(set, way, "read hit");
        Ok(true)
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Bytes held by each line
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Nominal tag width in bytes. Informational, not used by any algorithm
    pub fn tag_size(&self) -> usize {
        self.tag_size
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Number of lines currently holding valid data. Useful for analysing
    /// cache behaviour or debugging
    pub fn resident_line_count(&self) -> usize {
        self.lines.iter().filter(|line| line.valid).count()
    }
}

impl<B: DeviceBackend, R: ReplacementPolicy> Drop for Cache<B, R> {
    // Destruction is the only path, besides replace-in-place, that releases
    // handles; each one is released at most once
    fn drop(&mut self) {
        for line in self.lines.iter_mut() {
            if let Some(handle) = line.handle.take() {
                self.backend.release(handle);
            }
        }
    }
}

/// Enum for the six policy instantiations provided by the library
///
/// Trait objects would reduce boilerplate, but branching on concrete types
/// keeps the policy bookkeeping inlined into the lookup and eviction paths,
/// and gives callers a single type to hold whichever policy a configuration
/// selected.
pub enum DeviceCache<B: DeviceBackend> {
    Random(Cache<B, Random>),
    Fifo(Cache<B, Fifo>),
    LeastRecentlyUsed(Cache<B, LeastRecentlyUsed>),
    MostRecentlyUsed(Cache<B, MostRecentlyUsed>),
    LeastFrequentlyUsed(Cache<B, LeastFrequentlyUsed>),
    MostFrequentlyUsed(Cache<B, MostFrequentlyUsed>),
}

impl<B: DeviceBackend> From<Cache<B, Random>> for DeviceCache<B> {
    fn from(value: Cache<B, Random>) -> Self {
        Self::Random(value)
    }
}

impl<B: DeviceBackend> From<Cache<B, Fifo>> for DeviceCache<B> {
    fn from(value: Cache<B, Fifo>) -> Self {
        Self::Fifo(value)
    }
}

impl<B: DeviceBackend> From<Cache<B, LeastRecentlyUsed>> for DeviceCache<B> {
    fn from(value: Cache<B, LeastRecentlyUsed>) -> Self {
        Self::LeastRecentlyUsed(value)
    }
}

impl<B: DeviceBackend> From<Cache<B, MostRecentlyUsed>> for DeviceCache<B> {
    fn from(value: Cache<B, MostRecentlyUsed>) -> Self {
        Self::MostRecentlyUsed(value)
    }
}

impl<B: DeviceBackend> From<Cache<B, LeastFrequentlyUsed>> for DeviceCache<B> {
    fn from(value: Cache<B, LeastFrequentlyUsed>) -> Self {
        Self::LeastFrequentlyUsed(value)
    }
}

impl<B: DeviceBackend> From<Cache<B, MostFrequentlyUsed>> for DeviceCache<B> {
    fn from(value: Cache<B, MostFrequentlyUsed>) -> Self {
        Self::MostFrequentlyUsed(value)
    }
}

impl<B: DeviceBackend> DeviceCache<B> {
    /// Builds a cache from a configuration, instantiating the policy it names
    pub fn from_config(config: &CacheConfig, options: &CacheOptions, backend: B) -> Self {
        let geometry = Geometry::new(config.lines, config.kind);
        let num_lines = geometry.total_lines();
        let num_sets = geometry.sets;
        match config.replacement_policy {
            ReplacementPolicyConfig::Random => {
                let seed = options.rng_seed.unwrap_or_else(wall_clock_seed);
                Cache::new(config, options, backend, Random::new(seed)).into()
            }
            ReplacementPolicyConfig::Fifo => {
                Cache::new(config, options, backend, Fifo::new(num_sets)).into()
            }
            ReplacementPolicyConfig::LeastRecentlyUsed => Cache::new(
                config,
                options,
                backend,
                LeastRecentlyUsed::new(num_lines, num_sets),
            )
            .into(),
            ReplacementPolicyConfig::MostRecentlyUsed => Cache::new(
                config,
                options,
                backend,
                MostRecentlyUsed::new(num_lines, num_sets),
            )
            .into(),
            ReplacementPolicyConfig::LeastFrequentlyUsed => Cache::new(
                config,
                options,
                backend,
                LeastFrequentlyUsed::new(num_lines),
            )
            .into(),
            ReplacementPolicyConfig::MostFrequentlyUsed => Cache::new(
                config,
                options,
                backend,
                MostFrequentlyUsed::new(num_lines),
            )
            .into(),
        }
    }

    pub fn acquire(&mut self, key: HostKey, copy_in: bool) -> Result<B::Handle, BackendError> {
        match self {
            DeviceCache::Random(c) => c.acquire(key, copy_in),
            DeviceCache::Fifo(c) => c.acquire(key, copy_in),
            DeviceCache::LeastRecentlyUsed(c) => c.acquire(key, copy_in),
            DeviceCache::MostRecentlyUsed(c) => c.acquire(key, copy_in),
            DeviceCache::LeastFrequentlyUsed(c) => c.acquire(key, copy_in),
            DeviceCache::MostFrequentlyUsed(c) => c.acquire(key, copy_in),
        }
    }

    pub fn read_back(&mut self, key: HostKey) -> Result<bool, BackendError> {
        match self {
            DeviceCache::Random(c) => c.read_back(key),
            DeviceCache::Fifo(c) => c.read_back(key),
            DeviceCache::LeastRecentlyUsed(c) => c.read_back(key),
            DeviceCache::MostRecentlyUsed(c) => c.read_back(key),
            DeviceCache::LeastFrequentlyUsed(c) => c.read_back(key),
            DeviceCache::MostFrequentlyUsed(c) => c.read_back(key),
        }
    }

    pub fn stats(&self) -> TransferStats {
        match self {
            DeviceCache::Random(c) => c.stats(),
            DeviceCache::Fifo(c) => c.stats(),
            DeviceCache::LeastRecentlyUsed(c) => c.stats(),
            DeviceCache::MostRecentlyUsed(c) => c.stats(),
            DeviceCache::LeastFrequentlyUsed(c) => c.stats(),
            DeviceCache::MostFrequentlyUsed(c) => c.stats(),
        }
    }

    pub fn geometry(&self) -> &Geometry {
        match self {
            DeviceCache::Random(c) => c.geometry(),
            DeviceCache::Fifo(c) => c.geometry(),
            DeviceCache::LeastRecentlyUsed(c) => c.geometry(),
            DeviceCache::MostRecentlyUsed(c) => c.geometry(),
            DeviceCache::LeastFrequentlyUsed(c) => c.geometry(),
            DeviceCache::MostFrequentlyUsed(c) => c.geometry(),
        }
    }

    pub fn backend(&self) -> &B {
        match self {
            DeviceCache::Random(c) => c.backend(),
            DeviceCache::Fifo(c) => c.backend(),
            DeviceCache::LeastRecentlyUsed(c) => c.backend(),
            DeviceCache::MostRecentlyUsed(c) => c.backend(),
            DeviceCache::LeastFrequentlyUsed(c) => c.backend(),
            DeviceCache::MostFrequentlyUsed(c) => c.backend(),
        }
    }

    pub fn backend_mut(&mut self) -> &mut B {
        match self {
            DeviceCache::Random(c) => c.backend_mut(),
            DeviceCache::Fifo(c) => c.backend_mut(),
            DeviceCache::LeastRecentlyUsed(c) => c.backend_mut(),
            DeviceCache::MostRecentlyUsed(c) => c.backend_mut(),
            DeviceCache::LeastFrequentlyUsed(c) => c.backend_mut(),
            DeviceCache::MostFrequentlyUsed(c) => c.backend_mut(),
        }
    }

    pub fn resident_line_count(&self) -> usize {
        match self {
            DeviceCache::Random(c) => c.resident_line_count(),
            DeviceCache::Fifo(c) => c.resident_line_count(),
            DeviceCache::LeastRecentlyUsed(c) => c.resident_line_count(),
            DeviceCache::MostRecentlyUsed(c) => c.resident_line_count(),
            DeviceCache::LeastFrequentlyUsed(c) => c.resident_line_count(),
            DeviceCache::MostFrequentlyUsed(c) => c.resident_line_count(),
        }
    }
}

fn wall_clock_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
