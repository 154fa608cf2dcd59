use std::error::Error;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};

use ringcast::{QueueConfig, RingQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "ringcast-writer.toml")]
    config: String,
    #[clap(short = 'n', long = "count", default_value = "20")]
    count: u64,
    #[clap(long = "interval-ms", default_value = "500")]
    interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct WriterConfig {
    capacity: u32,
    queue: QueueConfig,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            capacity: 1024,
            queue: QueueConfig::default(),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: WriterConfig = confy::load_path(&opts.config)?;
    let queue = RingQueue::<u64>::new_shared(cfg.capacity, &cfg.queue)?;
    run(&queue, &opts)
}

fn run(queue: &RingQueue<u64>, opts: &Opts) -> Result<(), Box<dyn Error>> {
    for value in 0..opts.count {
        let index = queue.reserve();
        unsafe { *queue.slot_ptr(index) = value };
        queue.publish(index);
        println!("published {} at index {}", value, index);
        thread::sleep(Duration::from_millis(opts.interval_ms));
    }
    Ok(())
}
