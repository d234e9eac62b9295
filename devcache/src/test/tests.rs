use crate::backend::{BackendError, HostBackend, HostKey};
use crate::cache::{Cache, DeviceCache, Geometry};
use crate::config::{AssociativityConfig, CacheConfig, CacheOptions, ReplacementPolicyConfig};
use crate::replacement_policies::Fifo;

// Power of two so the address bit shift is exactly 6 and set mapping is easy
// to reason about in the tests below
const DATA_SIZE: usize = 64;

fn config(
    lines: usize,
    kind: AssociativityConfig,
    policy: ReplacementPolicyConfig,
) -> CacheConfig {
    CacheConfig {
        lines,
        data_size: DATA_SIZE,
        tag_size: 8,
        kind,
        replacement_policy: policy,
    }
}

fn options() -> CacheOptions {
    CacheOptions {
        report_memory_usage: false,
        rng_seed: Some(7),
    }
}

/// Key whose shifted value is exactly `n`, so with a full index mask it maps
/// to set n % sets
fn key(n: usize) -> HostKey {
    HostKey::new(n * DATA_SIZE)
}

fn register(backend: &mut HostBackend, k: HostKey, fill: u8) {
    backend.register(k, vec![fill; DATA_SIZE]);
}

#[test]
fn distinct_addresses_within_capacity_all_transfer() {
    let mut backend = HostBackend::new();
    for n in 0..8 {
        register(&mut backend, key(n), n as u8);
    }
    let cfg = config(
        8,
        AssociativityConfig::Full,
        ReplacementPolicyConfig::LeastRecentlyUsed,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    for n in 0..8 {
        cache.acquire(key(n), true).unwrap();
    }
    let stats = cache.stats();
    assert_eq!(stats.transfers, 8);
    assert_eq!(stats.writes, 8);
    assert_eq!(stats.hits, 0);
    assert_eq!(cache.resident_line_count(), 8);
}

#[test]
fn repeated_acquire_with_copy_semantics_hits() {
    let mut backend = HostBackend::new();
    register(&mut backend, key(1), 0x11);
    let cfg = config(
        8,
        AssociativityConfig::Direct,
        ReplacementPolicyConfig::Fifo,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    let first = cache.acquire(key(1), true).unwrap();
    let second = cache.acquire(key(1), true).unwrap();
    assert_eq!(first, second, "hit must return the stored handle");
    let stats = cache.stats();
    assert_eq!(stats.transfers, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn direct_mapped_collision_evicts_previous_occupant() {
    let mut backend = HostBackend::new();
    // 4 lines direct mapped: index mask is 3, so shifted values 0 and 4
    // land in the same set
    register(&mut backend, key(0), 0xA0);
    register(&mut backend, key(4), 0xA4);
    let cfg = config(
        4,
        AssociativityConfig::Direct,
        ReplacementPolicyConfig::Fifo,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    cache.acquire(key(0), true).unwrap();
    cache.acquire(key(4), true).unwrap();
    assert_eq!(cache.read_back(key(0)), Ok(false), "evicted address must miss");
    assert_eq!(cache.read_back(key(4)), Ok(true));
    assert_eq!(cache.resident_line_count(), 1);
}

#[test]
fn lru_two_way_evicts_least_recently_touched() {
    let mut backend = HostBackend::new();
    // 4 lines, 2 ways: 2 sets, index mask 1. Even shifted values share set 0.
    let (a, b, c) = (key(0), key(2), key(4));
    register(&mut backend, a, 1);
    register(&mut backend, b, 2);
    register(&mut backend, c, 3);
    let cfg = config(
        4,
        AssociativityConfig::TwoWay,
        ReplacementPolicyConfig::LeastRecentlyUsed,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    cache.acquire(a, true).unwrap();
    cache.acquire(b, true).unwrap();
    // Touch A so B becomes the least recently used of the pair
    cache.acquire(a, true).unwrap();
    cache.acquire(c, true).unwrap();
    assert_eq!(cache.read_back(b), Ok(false), "B must have been evicted");
    assert_eq!(cache.read_back(a), Ok(true));
    assert_eq!(cache.read_back(c), Ok(true));
}

#[test]
fn fifo_evicts_first_inserted_regardless_of_hits() {
    let mut backend = HostBackend::new();
    for n in 0..5 {
        register(&mut backend, key(n), n as u8);
    }
    let cfg = config(4, AssociativityConfig::Full, ReplacementPolicyConfig::Fifo);
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    for n in 0..4 {
        cache.acquire(key(n), true).unwrap();
    }
    // A hit does not advance the rotation
    cache.acquire(key(0), true).unwrap();
    cache.acquire(key(4), true).unwrap();
    assert_eq!(cache.read_back(key(0)), Ok(false), "first insert evicted");
    for n in 1..5 {
        assert_eq!(cache.read_back(key(n)), Ok(true));
    }
}

#[test]
fn mru_evicts_most_recently_touched_when_full() {
    let mut backend = HostBackend::new();
    let (a, b, c) = (key(0), key(1), key(2));
    register(&mut backend, a, 1);
    register(&mut backend, b, 2);
    register(&mut backend, c, 3);
    let cfg = config(
        2,
        AssociativityConfig::Full,
        ReplacementPolicyConfig::MostRecentlyUsed,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    cache.acquire(a, true).unwrap();
    cache.acquire(b, true).unwrap();
    cache.acquire(a, true).unwrap();
    cache.acquire(c, true).unwrap();
    assert_eq!(cache.read_back(a), Ok(false), "most recent A evicted");
    assert_eq!(cache.read_back(b), Ok(true));
    assert_eq!(cache.read_back(c), Ok(true));
}

#[test]
fn lfu_evicts_least_frequently_touched() {
    let mut backend = HostBackend::new();
    let (a, b, c) = (key(0), key(1), key(2));
    register(&mut backend, a, 1);
    register(&mut backend, b, 2);
    register(&mut backend, c, 3);
    let cfg = config(
        2,
        AssociativityConfig::Full,
        ReplacementPolicyConfig::LeastFrequentlyUsed,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    cache.acquire(a, true).unwrap();
    cache.acquire(b, true).unwrap();
    cache.acquire(a, true).unwrap();
    cache.acquire(a, true).unwrap();
    cache.acquire(c, true).unwrap();
    assert_eq!(cache.read_back(b), Ok(false), "least frequent B evicted");
    assert_eq!(cache.read_back(a), Ok(true));
    assert_eq!(cache.read_back(c), Ok(true));
}

#[test]
fn mfu_evicts_most_frequently_touched() {
    let mut backend = HostBackend::new();
    let (a, b, c) = (key(0), key(1), key(2));
    register(&mut backend, a, 1);
    register(&mut backend, b, 2);
    register(&mut backend, c, 3);
    let cfg = config(
        2,
        AssociativityConfig::Full,
        ReplacementPolicyConfig::MostFrequentlyUsed,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    cache.acquire(a, true).unwrap();
    cache.acquire(b, true).unwrap();
    cache.acquire(a, true).unwrap();
    cache.acquire(c, true).unwrap();
    assert_eq!(cache.read_back(a), Ok(false), "most frequent A evicted");
    assert_eq!(cache.read_back(b), Ok(true));
    assert_eq!(cache.read_back(c), Ok(true));
}

#[test]
fn random_policy_fills_empty_ways_before_evicting() {
    let mut backend = HostBackend::new();
    for n in 0..5 {
        register(&mut backend, key(n), n as u8);
    }
    let cfg = config(
        4,
        AssociativityConfig::Full,
        ReplacementPolicyConfig::Random,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    for n in 0..4 {
        cache.acquire(key(n), true).unwrap();
    }
    assert_eq!(cache.resident_line_count(), 4, "no eviction while slots are free");
    cache.acquire(key(4), true).unwrap();
    assert_eq!(cache.resident_line_count(), 4);
    assert_eq!(cache.stats().transfers, 5);
}

#[test]
fn read_back_of_unknown_address_changes_nothing() {
    let backend = HostBackend::new();
    let cfg = config(
        8,
        AssociativityConfig::Direct,
        ReplacementPolicyConfig::Random,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    assert_eq!(cache.read_back(key(3)), Ok(false));
    assert_eq!(cache.stats(), Default::default());
    assert_eq!(cache.backend().allocations(), 0);
}

#[test]
fn dropping_the_cache_releases_one_handle_per_valid_line() {
    let mut backend = HostBackend::new();
    for n in 0..3 {
        register(&mut backend, key(n), n as u8);
    }
    let cfg = config(
        8,
        AssociativityConfig::Full,
        ReplacementPolicyConfig::LeastRecentlyUsed,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), &mut backend);
    for n in 0..3 {
        cache.acquire(key(n), true).unwrap();
    }
    drop(cache);
    assert_eq!(backend.releases(), 3);
    assert_eq!(backend.live_buffers(), 0);
}

#[test]
fn forced_refresh_replaces_the_buffer_in_place() {
    let mut backend = HostBackend::new();
    register(&mut backend, key(1), 0xEE);
    let cfg = config(
        8,
        AssociativityConfig::Direct,
        ReplacementPolicyConfig::Fifo,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    let first = cache.acquire(key(1), true).unwrap();
    // A hit without copy semantics must not be satisfied from cache
    let second = cache.acquire(key(1), false).unwrap();
    assert_ne!(first, second);
    assert_eq!(cache.backend().releases(), 1, "old handle released");
    let fresh = cache.backend().device_bytes(second).unwrap();
    assert!(fresh.iter().all(|&b| b == 0), "refresh without copy-in is zeroed");
    let stats = cache.stats();
    assert_eq!(stats.transfers, 2);
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.hits, 0);
}

#[test]
fn failed_allocation_leaves_the_victim_way_evicted() {
    let mut backend = HostBackend::new();
    let (a, b) = (key(0), key(1));
    register(&mut backend, a, 0xAA);
    register(&mut backend, b, 0xBB);
    let unregistered = key(2);
    let cfg = config(
        2,
        AssociativityConfig::Full,
        ReplacementPolicyConfig::LeastRecentlyUsed,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    cache.acquire(a, true).unwrap();
    cache.acquire(b, true).unwrap();
    // Copy-in from a region the backend does not know fails after the LRU
    // victim (A) has already been released
    let err = cache.acquire(unregistered, true).unwrap_err();
    assert_eq!(err, BackendError::UnknownHostRegion(unregistered));
    assert_eq!(cache.read_back(a), Ok(false), "victim way is evicted, not restored");
    assert_eq!(cache.resident_line_count(), 1);
    assert_eq!(cache.stats().transfers, 2, "failed allocation is not counted");
}

#[test]
fn end_to_end_direct_mapped_random_counts_transfers() {
    let mut backend = HostBackend::new();
    for n in 1..4 {
        register(&mut backend, key(n), 0xA0 + n as u8);
    }
    let cfg = config(
        8,
        AssociativityConfig::Direct,
        ReplacementPolicyConfig::Random,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    for n in 1..4 {
        cache.acquire(key(n), true).unwrap();
    }
    // Clobber the host copies; read-back must restore them from the device
    for n in 1..4 {
        cache.backend_mut().register(key(n), vec![0; DATA_SIZE]);
    }
    for n in 1..4 {
        assert_eq!(cache.read_back(key(n)), Ok(true));
    }
    for n in 1..4u8 {
        let restored = cache.backend().host_bytes(key(n as usize)).unwrap();
        assert!(restored.iter().all(|&byte| byte == 0xA0 + n));
    }
    let stats = cache.stats();
    assert_eq!(stats.transfers, 6);
    assert_eq!(stats.writes, 3);
    assert_eq!(stats.reads, 3);
}

#[test]
fn geometry_splits_lines_per_mode() {
    let direct = Geometry::new(8, AssociativityConfig::Direct);
    assert_eq!((direct.sets, direct.lines_per_set), (8, 1));
    assert_eq!((direct.index_bits, direct.index_bit_mask), (3, 7));

    let two_way = Geometry::new(8, AssociativityConfig::TwoWay);
    assert_eq!((two_way.sets, two_way.lines_per_set), (4, 2));
    assert_eq!((two_way.index_bits, two_way.index_bit_mask), (2, 3));

    let four_way = Geometry::new(8, AssociativityConfig::FourWay);
    assert_eq!((four_way.sets, four_way.lines_per_set), (2, 4));
    assert_eq!((four_way.index_bits, four_way.index_bit_mask), (1, 1));

    let full = Geometry::new(8, AssociativityConfig::Full);
    assert_eq!((full.sets, full.lines_per_set), (1, 8));
    assert_eq!(full.index_bit_mask, 0);
}

#[test]
fn non_power_of_two_line_count_degrades_but_stays_in_bounds() {
    let geometry = Geometry::new(6, AssociativityConfig::TwoWay);
    assert_eq!((geometry.sets, geometry.lines_per_set), (3, 2));
    // The mask covers more sets than exist; mapping must still be in bounds
    assert_eq!(geometry.index_bit_mask, 3);

    let mut backend = HostBackend::new();
    for n in 0..6 {
        register(&mut backend, key(n), n as u8);
    }
    let cfg = config(
        6,
        AssociativityConfig::TwoWay,
        ReplacementPolicyConfig::LeastRecentlyUsed,
    );
    let mut cache = DeviceCache::from_config(&cfg, &options(), backend);
    for n in 0..6 {
        cache.acquire(key(n), true).unwrap();
    }
    assert!(cache.resident_line_count() <= 6);
}

#[test]
fn address_bit_shift_follows_data_size() {
    // 40-byte lines shift away 3 bits, as 8 is the largest power of two
    // dividing 40
    let cfg = CacheConfig {
        lines: 8,
        data_size: 40,
        tag_size: 8,
        kind: AssociativityConfig::Direct,
        replacement_policy: ReplacementPolicyConfig::Fifo,
    };
    let cache = Cache::new(&cfg, &options(), HostBackend::new(), Fifo::new(8));
    assert_eq!(cache.set_index(HostKey::new(40)), 5);
    assert_eq!(cache.set_index(HostKey::new(5 * 8)), 5);
    assert_eq!(cache.set_index(HostKey::new(8 * 8)), 0, "mask wraps at 8 sets");
}

#[test]
fn config_parses_lowercase_aliases() {
    let json = r#"{"lines": 8, "data_size": 64, "kind": "2way", "replacement_policy": "lru"}"#;
    let cfg: CacheConfig = serde_json::from_str(json).unwrap();
    assert_eq!(cfg.kind, AssociativityConfig::TwoWay);
    assert_eq!(
        cfg.replacement_policy,
        ReplacementPolicyConfig::LeastRecentlyUsed
    );
    assert_eq!(cfg.tag_size, std::mem::size_of::<usize>());

    let defaulted = r#"{"lines": 4, "data_size": 32, "kind": "full"}"#;
    let cfg: CacheConfig = serde_json::from_str(defaulted).unwrap();
    assert_eq!(cfg.replacement_policy, ReplacementPolicyConfig::Fifo);
}
