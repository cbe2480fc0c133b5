//! Interactive debug shell over the allocator descriptor. Reads
//! newline-delimited commands from stdin, keeps a table of named blocks,
//! and bundles a small throughput/latency micro-benchmark.

use std::{
    collections::HashMap,
    io::{self, BufRead, Write},
    time::Instant,
};

use segalloc::{get_bench_allocator, AllocatorDescriptor, AllocatorStats};

const BENCH_MAX_SAMPLES: usize = 1_000_000;

struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Power-law distributed size in `[min, max]`: most draws are small,
    /// the tail reaches the top like real allocation traces do.
    fn powerlaw(&mut self, min: usize, max: usize, alpha: f64) -> usize {
        let u = self.next() as f64 / u64::MAX as f64;
        let min_a = (min as f64).powf(1.0 - alpha);
        let max_a = (max as f64).powf(1.0 - alpha);
        (min_a + u * (max_a - min_a)).powf(1.0 / (1.0 - alpha)) as usize
    }
}

fn rss_bytes() -> usize {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    statm
        .split_whitespace()
        .nth(1)
        .and_then(|resident| resident.parse::<usize>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

fn bench(descriptor: &AllocatorDescriptor, iterations: usize, batch_size: usize) {
    let Some(malloc) = descriptor.malloc else {
        eprintln!("ERROR: allocator has no malloc");
        return;
    };
    let Some(free) = descriptor.free else {
        eprintln!("ERROR: allocator has no free");
        return;
    };
    if batch_size == 0 {
        eprintln!("ERROR: batch_size must be > 0");
        return;
    }

    let mut rng = Rng::new(0xFEED_FACE);
    let mut batch = vec![std::ptr::null_mut(); batch_size];
    let mut samples: Vec<u64> = Vec::with_capacity(BENCH_MAX_SAMPLES.min(iterations / 100 + 1));

    let start = Instant::now();
    let mut total_ops = 0usize;

    while total_ops < iterations {
        let mut filled = 0;
        for slot in batch.iter_mut() {
            if total_ops >= iterations {
                break;
            }
            let size = rng.powerlaw(16, 65536, 2.0);
            let op_start = Instant::now();
            *slot = unsafe { malloc(size) };
            if total_ops % 100 == 0 && samples.len() < BENCH_MAX_SAMPLES {
                samples.push(op_start.elapsed().as_nanos() as u64);
            }
            total_ops += 1;
            filled += 1;
        }

        for slot in batch.iter_mut().take(filled) {
            if !slot.is_null() {
                unsafe { free(*slot) };
                *slot = std::ptr::null_mut();
            }
        }
    }

    let elapsed = start.elapsed();
    samples.sort_unstable();
    let percentile = |q: f64| -> u64 {
        if samples.is_empty() {
            0
        } else {
            samples[((samples.len() as f64 * q) as usize).min(samples.len() - 1)]
        }
    };

    println!("bench results:");
    println!("  iterations:      {iterations}");
    println!("  batch size:      {batch_size}");
    println!(
        "  throughput:      {:.2} ops/sec",
        iterations as f64 / elapsed.as_secs_f64()
    );
    println!("  latency p50:     {} ns", percentile(0.5));
    println!("  latency p99:     {} ns", percentile(0.99));
    println!("  latency p99.9:   {} ns", percentile(0.999));
    println!("  latency max:     {} ns", samples.last().copied().unwrap_or(0));
    println!("  rss:             {} bytes", rss_bytes());
}

fn print_help() {
    println!("commands:");
    println!("  help");
    println!("  alloc <id> <size>");
    println!("  calloc <id> <nmemb> <size>");
    println!("  realloc <id> <size>");
    println!("  free <id>");
    println!("  usable <id>");
    println!("  fill <id> <byte> <count>");
    println!("  dump <id> <count>");
    println!("  list");
    println!("  stats");
    println!("  validate");
    println!("  bench [iterations] [batch_size]");
    println!("  quit");
}

fn main() {
    let descriptor = unsafe { &*get_bench_allocator() };

    if let Some(init) = descriptor.init {
        let code = unsafe { init() };
        if code != 0 {
            eprintln!("ERROR: allocator init() failed with code {code}");
            std::process::exit(1);
        }
    }

    let usable_of = |ptr: *mut u8| -> usize {
        descriptor
            .usable_size
            .map(|f| unsafe { f(ptr.cast()) })
            .unwrap_or(0)
    };

    let mut blocks: HashMap<String, *mut u8> = HashMap::new();
    let stdin = io::stdin();

    println!("segalloc debug shell. Type 'help' for commands.");

    loop {
        print!("segalloc> ");
        io::stdout().flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let mut words = line.split_whitespace();
        let Some(cmd) = words.next() else { continue };

        match cmd {
            "help" => print_help(),
            "quit" | "exit" => break,

            "alloc" => {
                let (Some(id), Some(size)) = (words.next(), words.next().and_then(parse)) else {
                    println!("usage: alloc <id> <size>");
                    continue;
                };
                if blocks.contains_key(id) {
                    println!("id '{id}' already exists");
                    continue;
                }
                let ptr = descriptor
                    .malloc
                    .map(|f| unsafe { f(size) })
                    .unwrap_or(std::ptr::null_mut())
                    .cast::<u8>();
                blocks.insert(id.to_string(), ptr);
                println!("{id} = {ptr:p}");
            }

            "calloc" => {
                let (Some(id), Some(nmemb), Some(size)) = (
                    words.next(),
                    words.next().and_then(parse),
                    words.next().and_then(parse),
                ) else {
                    println!("usage: calloc <id> <nmemb> <size>");
                    continue;
                };
                if blocks.contains_key(id) {
                    println!("id '{id}' already exists");
                    continue;
                }
                let ptr = descriptor
                    .calloc
                    .map(|f| unsafe { f(nmemb, size) })
                    .unwrap_or(std::ptr::null_mut())
                    .cast::<u8>();
                blocks.insert(id.to_string(), ptr);
                println!("{id} = {ptr:p}");
            }

            "realloc" => {
                let (Some(id), Some(size)) = (words.next(), words.next().and_then(parse)) else {
                    println!("usage: realloc <id> <size>");
                    continue;
                };
                let Some(old) = blocks.get_mut(id) else {
                    println!("unknown id '{id}'");
                    continue;
                };
                let old_ptr = *old;
                let new_ptr = descriptor
                    .realloc
                    .map(|f| unsafe { f(old_ptr.cast(), size) })
                    .unwrap_or(std::ptr::null_mut())
                    .cast::<u8>();
                *old = new_ptr;
                println!("{id}: {old_ptr:p} -> {new_ptr:p}");
            }

            "free" => {
                let Some(id) = words.next() else {
                    println!("usage: free <id>");
                    continue;
                };
                let Some(ptr) = blocks.remove(id) else {
                    println!("unknown id '{id}'");
                    continue;
                };
                if let Some(free) = descriptor.free {
                    unsafe { free(ptr.cast()) };
                }
                println!("freed {id} ({ptr:p})");
            }

            "usable" => {
                let Some(id) = words.next() else {
                    println!("usage: usable <id>");
                    continue;
                };
                let Some(&ptr) = blocks.get(id) else {
                    println!("unknown id '{id}'");
                    continue;
                };
                if descriptor.usable_size.is_none() {
                    println!("usable_size not implemented");
                    continue;
                }
                println!("usable({id}) = {}", usable_of(ptr));
            }

            "fill" => {
                let (Some(id), Some(value), Some(count)) = (
                    words.next(),
                    words.next().and_then(parse),
                    words.next().and_then(parse),
                ) else {
                    println!("usage: fill <id> <byte> <count>");
                    continue;
                };
                let Some(&ptr) = blocks.get(id) else {
                    println!("unknown id '{id}'");
                    continue;
                };
                if ptr.is_null() {
                    println!("id '{id}' is null");
                    continue;
                }
                let limit = if descriptor.usable_size.is_some() {
                    count.min(usable_of(ptr))
                } else {
                    count
                };
                let byte = (value & 0xFF) as u8;
                unsafe { ptr.write_bytes(byte, limit) };
                println!("filled {limit} bytes at {id} ({ptr:p}) with 0x{byte:02X}");
            }

            "dump" => {
                let (Some(id), Some(count)) = (words.next(), words.next().and_then(parse)) else {
                    println!("usage: dump <id> <count>");
                    continue;
                };
                let Some(&ptr) = blocks.get(id) else {
                    println!("unknown id '{id}'");
                    continue;
                };
                if ptr.is_null() {
                    println!("id '{id}' is null");
                    continue;
                }
                let limit = if descriptor.usable_size.is_some() {
                    count.min(usable_of(ptr))
                } else {
                    count
                };
                println!("dump {id} ({ptr:p}), {limit} bytes:");
                for i in 0..limit {
                    let byte = unsafe { *ptr.add(i) };
                    print!("{byte:02X}{}", if (i + 1) % 16 == 0 { "\n" } else { " " });
                }
                if limit % 16 != 0 {
                    println!();
                }
            }

            "list" => {
                println!("live blocks: {}", blocks.len());
                for (id, ptr) in &blocks {
                    println!("  {id} => {ptr:p}");
                }
            }

            "stats" => {
                if let Some(print_stats) = descriptor.print_stats {
                    unsafe { print_stats() };
                } else if let Some(get_stats) = descriptor.get_stats {
                    let mut snapshot = AllocatorStats::default();
                    if unsafe { get_stats(&mut snapshot) } {
                        println!("{snapshot:#?}");
                    }
                } else {
                    println!("stats not implemented");
                }
            }

            "validate" => {
                let Some(validate) = descriptor.validate_heap else {
                    println!("validate_heap not implemented");
                    continue;
                };
                let ok = unsafe { validate() };
                println!("heap validate: {}", if ok { "ok" } else { "FAILED" });
            }

            "bench" => {
                let iterations = words.next().and_then(parse).unwrap_or(10_000_000);
                let batch_size = words.next().and_then(parse).unwrap_or(1000);
                bench(descriptor, iterations, batch_size);
            }

            other => {
                println!("unknown command: {other}");
                print_help();
            }
        }
    }

    for (_, ptr) in blocks.drain() {
        if let (Some(free), false) = (descriptor.free, ptr.is_null()) {
            unsafe { free(ptr.cast()) };
        }
    }

    if let Some(teardown) = descriptor.teardown {
        unsafe { teardown() };
    }
}

fn parse(word: &str) -> Option<usize> {
    word.parse().ok()
}
