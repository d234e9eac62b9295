//! Chains three vector additions (C = A + B; D = C + E; F = D + G) through
//! a device-buffer cache backed by the in-process reference backend.
//!
//! The interesting part is the chain: C and D are consumed by the stage
//! after the one that produced them, so acquiring them again with copy
//! semantics is a cache hit and no host-to-device transfer happens.

use std::fs::File;
use std::io::BufReader;

use clap::Parser;
use devcache::backend::{BufferId, HostBackend, HostKey};
use devcache::cache::DeviceCache;
use devcache::config::{AssociativityConfig, CacheConfig, CacheOptions, ReplacementPolicyConfig};
use tracing_subscriber::EnvFilter;

/// Elements per vector, matching the original testbench
const LENGTH: usize = 10;
/// Bytes per vector
const DATA_SIZE: usize = LENGTH * std::mem::size_of::<i32>();

#[derive(Parser, Debug)]
#[command(about = String::from("Chained vector addition through a device-buffer cache"))]
struct Args {
    /// Optional JSON cache configuration; defaults to 8 direct-mapped lines
    /// with random replacement
    #[arg(short, long)]
    config: Option<String>,

    /// Seed for the random replacement policy, for reproducible runs
    #[arg(short, long)]
    seed: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), String> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if args.verbose { "debug" } else { "warn" })
        }))
        .init();

    let config = match &args.config {
        Some(path) => {
            let file = File::open(path)
                .map_err(|e| format!("Couldn't open the config file at path {path}: {e}"))?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| format!("Couldn't parse the config file: {e}"))?
        }
        None => CacheConfig {
            lines: 8,
            data_size: DATA_SIZE,
            tag_size: std::mem::size_of::<usize>(),
            kind: AssociativityConfig::Direct,
            replacement_policy: ReplacementPolicyConfig::Random,
        },
    };
    let options = CacheOptions {
        report_memory_usage: args.verbose,
        rng_seed: args.seed,
    };

    // Seven host vectors: inputs a, b, e, g and results c, d, f. The keys
    // are synthetic addresses spaced so each vector lands in its own set of
    // the default geometry; with real pointers the allocator spreads them
    // the same way.
    let names = ["a", "b", "c", "d", "e", "f", "g"];
    let keys: Vec<HostKey> = (0..names.len())
        .map(|i| HostKey::new(0x1000 + i * 8))
        .collect();
    let (k_a, k_b, k_c, k_d) = (keys[0], keys[1], keys[2], keys[3]);
    let (k_e, k_f, k_g) = (keys[4], keys[5], keys[6]);

    let mut backend = HostBackend::new();
    for (i, key) in keys.iter().enumerate() {
        let values: Vec<i32> = match names[i] {
            // Inputs get a deterministic stand-in for the testbench's rand()%100
            "a" | "b" | "e" | "g" => (0..LENGTH).map(|j| ((i * 31 + j * 7 + 3) % 100) as i32).collect(),
            _ => vec![0; LENGTH],
        };
        backend.register(*key, to_bytes(&values));
    }

    let expected: Vec<i32> = {
        let read = |k: HostKey| from_bytes(backend.host_bytes(k).unwrap());
        let (a, b, e, g) = (read(k_a), read(k_b), read(k_e), read(k_g));
        (0..LENGTH).map(|j| a[j] + b[j] + e[j] + g[j]).collect()
    };

    let mut cache = DeviceCache::from_config(&config, &options, &mut backend);

    // C = A + B
    let h_a = acquire(&mut cache, k_a, true)?;
    let h_b = acquire(&mut cache, k_b, true)?;
    let h_c = acquire(&mut cache, k_c, false)?;
    vadd(cache.backend_mut(), h_a, h_b, h_c)?;

    // D = C + E; C is still on the device, so this acquire is a hit
    let h_c = acquire(&mut cache, k_c, true)?;
    let h_e = acquire(&mut cache, k_e, true)?;
    let h_d = acquire(&mut cache, k_d, false)?;
    vadd(cache.backend_mut(), h_c, h_e, h_d)?;

    // F = D + G; same again for D
    let h_d = acquire(&mut cache, k_d, true)?;
    let h_g = acquire(&mut cache, k_g, true)?;
    let h_f = acquire(&mut cache, k_f, false)?;
    vadd(cache.backend_mut(), h_d, h_g, h_f)?;

    if !cache
        .read_back(k_f)
        .map_err(|e| format!("Couldn't read the result back: {e}"))?
    {
        return Err("Result vector F was not resident at read-back".to_string());
    }

    let stats = cache.stats();
    drop(cache);

    let result = from_bytes(backend.host_bytes(k_f).unwrap());
    let correct = result
        .iter()
        .zip(&expected)
        .filter(|(got, want)| got == want)
        .count();
    println!("F = A+B+E+G: {correct} out of {LENGTH} results were correct");
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).map_err(|e| format!("Couldn't serialise the output {e}"))?
    );
    println!("Device buffers released at teardown: {}", backend.releases());
    Ok(())
}

fn acquire(
    cache: &mut DeviceCache<&mut HostBackend>,
    key: HostKey,
    copy_in: bool,
) -> Result<BufferId, String> {
    cache
        .acquire(key, copy_in)
        .map_err(|e| format!("Couldn't acquire a device buffer: {e}"))
}

/// Plays the role of the vadd kernel: sums two device vectors into a third
fn vadd(backend: &mut HostBackend, a: BufferId, b: BufferId, out: BufferId) -> Result<(), String> {
    let lhs = from_bytes(
        backend
            .device_bytes(a)
            .ok_or("Input buffer missing on the device")?,
    );
    let rhs = from_bytes(
        backend
            .device_bytes(b)
            .ok_or("Input buffer missing on the device")?,
    );
    let sum: Vec<i32> = lhs.iter().zip(&rhs).map(|(x, y)| x + y).collect();
    backend
        .write_device(out, &to_bytes(&sum))
        .map_err(|e| format!("Couldn't write the kernel result: {e}"))
}

fn to_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn from_bytes(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}
