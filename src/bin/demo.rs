use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stackprefetch::{DemoSource, PrefetchCoordinator};
use tracing::Level;

fn main() {
    // Use std::env for argument parsing
    let mut args = std::env::args().skip(1);
    let mut path: Option<String> = None;
    let mut radius = 5usize;
    let mut verbose = false;

    while let Some(arg) = args.next() {
        if arg == "--radius" {
            match args.next().map(|v| v.parse::<usize>()) {
                Some(Ok(val)) => radius = val,
                _ => {
                    eprintln!("Expected a non-negative integer after --radius");
                    print_usage_and_exit();
                }
            }
        } else if arg == "--verbose" {
            verbose = true;
        } else if arg.starts_with("--") {
            eprintln!("Unknown argument: {}", arg);
            print_usage_and_exit();
        } else if path.is_none() {
            path = Some(arg);
        } else {
            eprintln!("Unexpected argument: {}", arg);
            print_usage_and_exit();
        }
    }

    // Logs to stderr so the progress output stays readable
    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || interrupted.store(true, Ordering::SeqCst)) {
            eprintln!("Could not install Ctrl-C handler: {}", e);
        }
    }

    let mut coordinator = match PrefetchCoordinator::new() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Could not create coordinator: {}", e);
            process::exit(1);
        }
    };
    coordinator.on_source_changed(|| println!("Source changed"));

    let loaded = match &path {
        Some(p) => coordinator.load_path(p, radius),
        None => coordinator.load(
            Arc::new(DemoSource::new(64, 100).with_latency(Duration::from_millis(15))),
            radius,
        ),
    };
    if let Err(e) = loaded {
        eprintln!("Could not load source: {}", e);
        process::exit(1);
    }

    let total = coordinator.frame_count().unwrap_or(0);
    println!(
        "Source: {} ({} frames, shape {:?}, window radius {})",
        coordinator.source_name().unwrap_or(""),
        total,
        coordinator.stack_shape().unwrap_or_default(),
        radius
    );

    // Scrub forward at a steady pace, like playback in a viewer
    println!("Scrubbing through all frames...");
    let start = Instant::now();
    let mut hits = 0usize;
    let mut read = 0usize;
    let mut slowest = Duration::ZERO;
    for pos in 0..total {
        if interrupted.load(Ordering::SeqCst) {
            println!("\nInterrupted at frame {}", pos);
            break;
        }
        let was_cached = coordinator.cache_keys().contains(&pos);
        let frame_start = Instant::now();
        if let Err(e) = coordinator.set_position(pos).and_then(|_| coordinator.read(pos)) {
            eprintln!("\nError reading frame {}: {}", pos, e);
            process::exit(1);
        }
        let elapsed = frame_start.elapsed();
        slowest = slowest.max(elapsed);
        read += 1;
        if was_cached {
            hits += 1;
        }

        let percent = (pos + 1) * 100 / total;
        print!("\rProgress: {:3}% ({}/{} frames, {} prefetched)", percent, pos + 1, total, hits);
        use std::io::Write;
        let _ = std::io::stdout().flush();

        std::thread::sleep(Duration::from_millis(20));
    }

    let elapsed = start.elapsed();
    coordinator.stop();
    println!();
    println!(
        "Read {} frames in {:.3} seconds, {} served from prefetch, slowest read {:.3} ms",
        read,
        elapsed.as_secs_f64(),
        hits,
        slowest.as_secs_f64() * 1000.0
    );
    if let Some(stats) = coordinator.worker_stats() {
        println!(
            "Worker: {} passes, {} loaded, {} evicted, {} failed, {} discarded",
            stats.passes, stats.loaded, stats.evicted, stats.failed, stats.discarded
        );
    }
}

fn print_usage_and_exit() -> ! {
    eprintln!("Usage: demo [stack.stk] [--radius N] [--verbose]");
    process::exit(1);
}
