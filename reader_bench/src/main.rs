use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::iterator::Signals;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blockq::{Queue, StoreConfig};

const EMPTY_BACKOFF: Duration = Duration::from_micros(200);

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "blockq-reader.toml")]
    config: String,
    /// Stop after this many messages.
    #[clap(short = 'n', long = "count")]
    count: Option<usize>,
    /// Stop once the queue stayed empty this long.
    #[clap(long = "idle-exit-ms")]
    idle_exit_ms: Option<u64>,
    #[clap(long = "end-marker", default_value = " 🐓 🏰 🥕 ")]
    end_marker: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ReaderConfig {
    store: StoreConfig,
    queue_name: String,
    item_size: usize,
    queue_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            store: StoreConfig::default(),
            queue_name: "bench".to_string(),
            item_size: 256,
            queue_size: 1024,
        }
    }
}

fn watch_signals() -> Result<Arc<AtomicBool>, Box<dyn Error>> {
    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[libc::SIGHUP, libc::SIGINT, libc::SIGQUIT, libc::SIGTERM])?;
    let flag = Arc::clone(&closing);
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            flag.store(true, Ordering::SeqCst);
        }
    });
    Ok(closing)
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;
    info!(?cfg, "loaded config");
    let queue = Queue::<String>::open(&cfg.store, &cfg.queue_name, cfg.item_size, cfg.queue_size)?;
    let closing = watch_signals()?;
    run(&queue, &opts, &closing)?;
    Ok(())
}

fn run(queue: &Queue<String>, opts: &Opts, closing: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let idle_limit = opts.idle_exit_ms.map(Duration::from_millis);
    let mut called = 0usize;
    let mut idle_since: Option<Instant> = None;

    loop {
        if closing.load(Ordering::Relaxed) {
            warn!(called, "interrupted");
            break;
        }
        if opts.count.map_or(false, |count| called >= count) {
            break;
        }
        match queue.try_dequeue()? {
            Some(message) => {
                idle_since = None;
                if message == opts.end_marker {
                    println!("\nFinished after {} messages", called);
                    break;
                }
                called += 1;
                if called % 10_000 == 0 {
                    eprint!("\rTotal {} ops (current value: {})", called, message);
                }
            }
            None => {
                let since = *idle_since.get_or_insert_with(Instant::now);
                if idle_limit.map_or(false, |limit| since.elapsed() >= limit) {
                    info!(called, "queue stayed empty, stopping");
                    break;
                }
                thread::sleep(EMPTY_BACKOFF);
            }
        }
    }

    let duration = start.elapsed();
    let iops = (called as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?}K messages read/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
