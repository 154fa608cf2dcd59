use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use ringcast::{QueueConfig, RingQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "ringcast-reader.toml")]
    config: String,
    /// Start at sequence 0 instead of tailing from the current write index.
    #[clap(long = "from-start")]
    from_start: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ReaderConfig {
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    let opts: Opts = Opts::parse();
    let cfg: ReaderConfig = confy::load_path(&opts.config)?;
    let queue = RingQueue::<u64>::attach(&cfg.queue)?;

    let closing = Arc::new(AtomicBool::new(false));
    let mut signals = Signals::new(&[SIGINT, SIGTERM])?;
    {
        let closing = Arc::clone(&closing);
        thread::spawn(move || {
            for _ in signals.forever() {
                closing.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut cursor = if opts.from_start {
        0
    } else {
        queue.initial_reading_index()
    };
    let mut received = 0u64;
    while !closing.load(Ordering::Relaxed) {
        match queue.read(&mut cursor) {
            Some((cell, _)) => {
                received += 1;
                println!("{}", *cell);
            }
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
    println!("received {} messages, {} lost", received, queue.loss_count());
    Ok(())
}
