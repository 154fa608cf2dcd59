use std::error::Error;
use std::time::Instant;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};

use ringcast::{QueueConfig, RingQueue};

/// Terminal value the reader bench stops on.
const END_MARKER: u64 = u64::MAX;

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "ringcast-bench.toml")]
    config: String,
    #[clap(short = 'n', long = "messages", default_value = "10000000")]
    messages: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct BenchConfig {
    capacity: u32,
    queue: QueueConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            capacity: 65536,
            queue: QueueConfig::default(),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    let queue = RingQueue::<u64>::new_shared(cfg.capacity, &cfg.queue)?;
    run(&queue, &opts)
}

fn run(queue: &RingQueue<u64>, opts: &Opts) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();

    for value in 0..opts.messages {
        let index = queue.reserve();
        unsafe { *queue.slot_ptr(index) = value };
        queue.publish(index);
        if value % 1_000_000 == 0 {
            eprint!("\rTotal {} ops (index: {})", value, index);
        }
    }

    let index = queue.reserve();
    unsafe { *queue.slot_ptr(index) = END_MARKER };
    queue.publish(index);

    let duration = start.elapsed();
    let iops = ((opts.messages as f64) / (duration.as_millis() as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages write/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
