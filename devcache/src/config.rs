use serde::Deserialize;

/// A configuration for a single device-buffer cache
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Requested number of cache lines. Exact geometries need a power of
    /// two; other values degrade to approximate set counts
    pub lines: usize,
    /// Bytes held by each line; also the size of every device buffer the
    /// cache allocates
    pub data_size: usize,
    /// Bytes nominally needed to store a tag. Informational only
    #[serde(default = "default_tag_size")]
    pub tag_size: usize,
    pub kind: AssociativityConfig,
    #[serde(default)]
    pub replacement_policy: ReplacementPolicyConfig,
}

fn default_tag_size() -> usize {
    std::mem::size_of::<usize>()
}

/// The associativity mode - direct, 2way, 4way, or full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AssociativityConfig {
    #[serde(alias = "direct")]
    Direct,
    #[serde(alias = "2way")]
    TwoWay,
    #[serde(alias = "4way")]
    FourWay,
    #[serde(alias = "full")]
    Full,
}

/// The replacement policy - random, fifo, lru, mru, lfu, or mfu.
/// Defaults to fifo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum ReplacementPolicyConfig {
    #[serde(alias = "random")]
    Random,
    #[default]
    #[serde(alias = "fifo")]
    Fifo,
    #[serde(alias = "lru")]
    LeastRecentlyUsed,
    #[serde(alias = "mru")]
    MostRecentlyUsed,
    #[serde(alias = "lfu")]
    LeastFrequentlyUsed,
    #[serde(alias = "mfu")]
    MostFrequentlyUsed,
}

/// Per-instance switches that were process-wide globals in earlier
/// revisions of this design
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheOptions {
    /// Log a summary of usable versus bookkeeping memory at construction
    #[serde(default)]
    pub report_memory_usage: bool,
    /// Seed for the random replacement policy. When unset the policy is
    /// seeded from wall-clock time, so victim sequences are only
    /// statistically random
    #[serde(default)]
    pub rng_seed: Option<u64>,
}
