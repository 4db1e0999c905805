//! Spindle CLI
//!
//! Demonstration programs for the Spindle coroutine runtime.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use spindle::{
    cancel, join, mbx_format, mbx_get, mbx_new, mbx_post, sem_new, sem_p, sem_v, spawn, wait,
    yield_now, Attr, CoroutineId, CoroutineType, MbxId, RuntimeConfig, SemId, WaitOutcome,
    MESSAGE_HEADER_SIZE, VERSION,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spindle")]
#[command(author, version, about = "A single-threaded cooperative coroutine runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Runtime configuration file (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print scheduler statistics as JSON when done
    #[arg(short, long)]
    stats: bool,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a Fibonacci generator one step at a time
    Fib {
        /// Number of values to print
        #[arg(short = 'n', long, default_value_t = 20)]
        count: u64,
        /// Run the generator on the shared stack
        #[arg(long)]
        stackless: bool,
    },

    /// Pass messages from producers to consumers through a mailbox
    Mailbox {
        #[arg(short, long, default_value_t = 2)]
        producers: usize,
        #[arg(short = 'C', long, default_value_t = 3)]
        consumers: usize,
        /// Messages posted by each producer
        #[arg(short, long, default_value_t = 10)]
        messages: u64,
    },

    /// Show the FIFO execution order of yielding coroutines
    Ring {
        #[arg(short = 'n', long, default_value_t = 4)]
        coroutines: usize,
        #[arg(short, long, default_value_t = 3)]
        rounds: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    tracing::info!(version = VERSION, "spindle starting");

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RuntimeConfig::from_env(),
    };
    spindle::init(&config).context("initializing the scheduler")?;

    match cli.command {
        Commands::Fib { count, stackless } => run_fib(count, stackless)?,
        Commands::Mailbox {
            producers,
            consumers,
            messages,
        } => run_mailbox(producers, consumers, messages)?,
        Commands::Ring { coroutines, rounds } => run_ring(coroutines, rounds)?,
    }

    if cli.stats {
        println!("{}", serde_json::to_string_pretty(&spindle::stats())?);
    }
    Ok(())
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn", // Default: warnings and errors only
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading configuration file {}", path.display()))?;
    let config: RuntimeConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing configuration file {}", path.display()))?;
    Ok(config.normalized())
}

/// Exit status of a demo coroutine body.
fn status(result: spindle::Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(coroutine = %spindle::self_id(), error = %e, "demo coroutine failed");
            1
        }
    }
}

// ---------------------------------------------------------------------------
// fib
// ---------------------------------------------------------------------------

fn run_fib(count: u64, stackless: bool) -> Result<()> {
    let mut attr = Attr::stepper();
    if stackless {
        attr.set_type(CoroutineType::STACKLESS);
    }

    let generator = spawn("fibonacci", attr, || loop {
        let (mut a, mut b) = (0u64, 1u64);
        loop {
            yield_now(Some(Box::new(a)));
            // Start over once the next term no longer fits.
            match a.checked_add(b) {
                Some(next) => (a, b) = (b, next),
                None => break,
            }
        }
    })?;

    for i in 0..count {
        match wait(generator)? {
            WaitOutcome::Yielded(Some(value)) => match value.downcast::<u64>() {
                Ok(value) => println!("fib({}) = {}", i, value),
                Err(_) => bail!("generator yielded something other than a u64"),
            },
            WaitOutcome::Yielded(None) => bail!("generator yielded no value"),
            WaitOutcome::Dead => bail!("generator terminated after {} values", i),
        }
    }

    cancel(generator)?;
    let status = join(generator)?;
    println!("generator {} stopped with status {}", generator, status);
    Ok(())
}

// ---------------------------------------------------------------------------
// mailbox
// ---------------------------------------------------------------------------

const STOP: u64 = u64::MAX;
const SLOT_SIZE: usize = MESSAGE_HEADER_SIZE + 8;

/// Per-consumer message count and checksum.
type Totals = Rc<RefCell<Vec<(CoroutineId, u64, u64)>>>;

/// Word-aligned backing store of one pooled message.
#[repr(align(16))]
struct Slot([u8; SLOT_SIZE]);

fn read_value(payload: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&payload[..8]);
    u64::from_ne_bytes(bytes)
}

fn send(free: MbxId, work: MbxId, value: u64) -> spindle::Result<()> {
    let mut msg = mbx_get(free)?;
    msg.payload_mut()[..8].copy_from_slice(&value.to_ne_bytes());
    mbx_post(work, msg)
}

/// Drain `work` until a stop message arrives, then report the totals.
fn consume(free: MbxId, work: MbxId, done: SemId, totals: &Totals) -> spindle::Result<()> {
    let (mut received, mut sum) = (0u64, 0u64);
    loop {
        let msg = mbx_get(work)?;
        let value = read_value(msg.payload());
        mbx_post(free, msg)?;
        if value == STOP {
            break;
        }
        received += 1;
        sum = sum.wrapping_add(value);
    }
    totals.borrow_mut().push((spindle::self_id(), received, sum));
    sem_v(done)
}

fn run_mailbox(producers: usize, consumers: usize, messages: u64) -> Result<()> {
    ensure!(consumers > 0, "at least one consumer is needed");

    // Buffers circulate between the free list and the work queue.
    let free = mbx_new()?;
    let work = mbx_new()?;
    for _ in 0..consumers.max(4) {
        let slot: &'static mut Slot = Box::leak(Box::new(Slot([0; SLOT_SIZE])));
        let (msg, size) = mbx_format(&mut slot.0[..])?;
        ensure!(size >= 8, "pooled message too small");
        mbx_post(free, msg)?;
    }

    let done = sem_new(0)?;
    let totals: Totals = Rc::default();

    let mut producer_ids = Vec::with_capacity(producers);
    for p in 0..producers {
        let id = spawn(&format!("producer-{}", p), Attr::default(), move || {
            status((0..messages).try_for_each(|n| {
                send(free, work, p as u64 * messages + n)?;
                yield_now(None);
                Ok(())
            }))
        })?;
        producer_ids.push(id);
    }

    let mut consumer_ids = Vec::with_capacity(consumers);
    for c in 0..consumers {
        let totals = Rc::clone(&totals);
        let id = spawn(&format!("consumer-{}", c), Attr::default(), move || {
            status(consume(free, work, done, &totals))
        })?;
        consumer_ids.push(id);
    }

    for id in producer_ids {
        ensure!(join(id)? == 0, "producer {} failed", id);
    }
    for _ in 0..consumers {
        send(free, work, STOP)?;
    }
    for _ in 0..consumers {
        sem_p(done)?;
    }
    for id in consumer_ids {
        ensure!(join(id)? == 0, "consumer {} failed", id);
    }

    let totals = totals.borrow();
    let mut received = 0;
    for (id, count, sum) in totals.iter() {
        println!("{}: {} messages, checksum {}", id, count, sum);
        received += count;
    }
    let expected = producers as u64 * messages;
    ensure!(
        received == expected,
        "received {} messages, expected {}",
        received,
        expected
    );
    println!("{} messages delivered", received);
    Ok(())
}

// ---------------------------------------------------------------------------
// ring
// ---------------------------------------------------------------------------

fn run_ring(coroutines: usize, rounds: usize) -> Result<()> {
    let order: Rc<RefCell<Vec<usize>>> = Rc::default();

    let ids = (0..coroutines)
        .map(|i| {
            let order = Rc::clone(&order);
            spawn(&format!("ring-{}", i), Attr::default(), move || {
                for _ in 0..rounds {
                    order.borrow_mut().push(i);
                    yield_now(None);
                }
                0
            })
        })
        .collect::<spindle::Result<Vec<_>>>()?;

    for id in ids {
        join(id)?;
    }

    let order = order.borrow();
    for (round, chunk) in order.chunks(coroutines.max(1)).enumerate() {
        let line: Vec<String> = chunk.iter().map(|i| i.to_string()).collect();
        println!("round {}: {}", round, line.join(" "));
    }
    Ok(())
}
