//! Several OS processes enqueue into one named queue at the same time; the
//! parent then drains it and checks that nothing collided or reordered.

use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::path::Path;
use std::process::{Child, Command};

use blockq::{Queue, StoreConfig};
use tempfile::tempdir;

const QUEUE_NAME: &str = "cross_process";
const PRODUCERS: usize = 4;
const PER_PRODUCER: usize = 200;
const ITEM_SIZE: usize = 32;

fn config(data_dir: &Path) -> Result<StoreConfig, Box<dyn Error>> {
    Ok(StoreConfig::builder().data_dir(data_dir).build()?)
}

fn produce(data_dir: &str, producer: usize) -> Result<(), Box<dyn Error>> {
    let cfg = config(Path::new(data_dir))?;
    let queue = Queue::<String>::open(&cfg, QUEUE_NAME, ITEM_SIZE, PRODUCERS * PER_PRODUCER)?;
    for seq in 0..PER_PRODUCER {
        queue.enqueue(&format!("{}:{}", producer, seq))?;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() == 4 && args[1] == "produce" {
        return produce(&args[2], args[3].parse()?);
    }

    println!("Starting cross-process queue simulation...");
    let temp_dir = tempdir()?;
    let cfg = config(temp_dir.path())?;
    let data_dir = temp_dir
        .path()
        .to_str()
        .ok_or("temp dir is not valid UTF-8")?
        .to_string();

    // created up front so producers only ever reopen it
    let queue = Queue::<String>::open(&cfg, QUEUE_NAME, ITEM_SIZE, PRODUCERS * PER_PRODUCER)?;

    let exe = env::current_exe()?;
    let children: Vec<Child> = (0..PRODUCERS)
        .map(|producer| {
            Command::new(&exe)
                .arg("produce")
                .arg(&data_dir)
                .arg(producer.to_string())
                .spawn()
        })
        .collect::<Result<_, _>>()?;
    for (producer, mut child) in children.into_iter().enumerate() {
        let status = child.wait()?;
        if !status.success() {
            return Err(format!("producer {} exited with {}", producer, status).into());
        }
    }

    let meta = queue.snapshot()?;
    println!("[Main] {} entries after all producers finished", meta.len());
    if meta.len() != PRODUCERS * PER_PRODUCER {
        return Err(format!(
            "expected {} entries, found {}",
            PRODUCERS * PER_PRODUCER,
            meta.len()
        )
        .into());
    }

    let mut next_expected: HashMap<usize, usize> = HashMap::new();
    while let Some(item) = queue.try_dequeue()? {
        let (producer, seq) = item.split_once(':').ok_or("malformed item")?;
        let producer: usize = producer.parse()?;
        let seq: usize = seq.parse()?;
        let expected = next_expected.entry(producer).or_insert(0);
        if seq != *expected {
            return Err(format!("producer {}: got {} expected {}", producer, seq, expected).into());
        }
        *expected += 1;
    }
    if next_expected.len() != PRODUCERS || next_expected.values().any(|&n| n != PER_PRODUCER) {
        return Err(format!("incomplete drain: {:?}", next_expected).into());
    }

    println!(
        "[Main] All {} items dequeued once, per-producer order kept.",
        PRODUCERS * PER_PRODUCER
    );
    Ok(())
}
