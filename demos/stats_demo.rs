use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;

use chunk_dict::Config;
use chunk_dict::HashTable;
use chunk_dict::hash_table::Entry;
use clap::Parser;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short = 'n', long = "entries", default_value_t = 100_000)]
    entries: usize,

    /// Keep one entry out of every `keep_every` when fragmenting.
    #[arg(short = 'k', long = "keep_every", default_value_t = 4)]
    keep_every: usize,

    #[arg(short = 'b', long = "max_chunk_bytes", default_value_t = 256 << 10)]
    max_chunk_bytes: usize,
}

fn hash_u64(value: u64) -> u32 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    let hash = hasher.finish();
    (hash ^ (hash >> 32)) as u32
}

fn main() {
    let args = Args::parse();
    let keep_every = args.keep_every.max(1);

    let config = Config::new()
        .max_chunk_bytes(args.max_chunk_bytes)
        .auto_shrink(false);
    let mut table: HashTable<u64> = HashTable::with_config(config);

    println!("Filling table with {} u64 values...", args.entries);
    for i in 0..args.entries {
        let value = i as u64;
        match table.entry(hash_u64(value), |&v| v == value) {
            Entry::Vacant(entry) => {
                entry.insert(value);
            }
            Entry::Occupied(_) => {
                panic!("Value already exists in table: {}", value);
            }
        }
    }
    println!("\n== after fill ==");
    table.debug_stats().print();

    for i in 0..args.entries {
        if i % keep_every != 0 {
            let value = i as u64;
            table.erase(hash_u64(value), |&v| v == value);
        }
    }
    println!("\n== after erasing all but 1 in {} ==", keep_every);
    table.debug_stats().print();

    table.rearrange();
    println!("\n== after rearrange ==");
    table.debug_stats().print();

    table.shrink_to_fit();
    println!("\n== after shrink_to_fit ==");
    table.debug_stats().print();

    let missing = (0..args.entries)
        .step_by(keep_every)
        .filter(|&i| {
            let value = i as u64;
            table.find(hash_u64(value), |&v| v == value).is_none()
        })
        .count();
    println!("\nSurvivors missing after compaction: {}", missing);
}
