//! Host loop for the shoal background scheduler.
//!
//! Scans the given paths with a plain background task and hashes every file
//! found with a SHA-256 daemon, printing `digest  path` lines as results come
//! in. Both run in bounded slices driven once per configured tick period.

use clap::Parser;
use sha2::{Digest, Sha256};
use shoal::ShoalConfig;
use shoal::scheduler::{
    self, BgSignal, DaemonEvent, DaemonSpec, Scheduler, StepResult, TaskCx, TaskExit, TaskId,
    TaskSpec, TaskStatus,
};
use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::rc::Rc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Hash files in the background without blocking the host loop.
#[derive(Parser)]
#[command(name = "shoal-bg", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Amount of data hashed per tick of work, in KiB.
    #[arg(long, default_value_t = 64)]
    chunk_kib: usize,

    /// Print a JSON scheduler snapshot after every pass.
    #[arg(long)]
    stats: bool,

    /// Files or directories to scan.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
}

/// Library scan: walks directories, one entry per tick.
struct Scan {
    pending: Vec<PathBuf>,
    visited: usize,
    found: Rc<RefCell<Vec<PathBuf>>>,
}

fn scan_step(cx: &mut TaskCx<'_>, scan: &mut Scan, ticks: u32) -> StepResult {
    let mut used = 0;
    while used < ticks {
        let Some(path) = scan.pending.pop() else {
            break;
        };
        used += 1;
        scan.visited += 1;

        if path.is_dir() {
            match std::fs::read_dir(&path) {
                Ok(entries) => scan
                    .pending
                    .extend(entries.filter_map(|entry| entry.ok()).map(|entry| entry.path())),
                Err(e) => warn!("cannot read directory {}: {e}", path.display()),
            }
        } else if path.is_file() {
            scan.found.borrow_mut().push(path);
        }
    }

    if scan.pending.is_empty() {
        cx.ticks_used(used);
        StepResult::Done
    } else {
        StepResult::More
    }
}

/// File being hashed by the daemon.
struct Hashing {
    path: PathBuf,
    file: File,
    digest: Sha256,
    bytes: u64,
}

/// Hashing daemon context.
struct Hasher {
    chunk: Vec<u8>,
    current: Option<Hashing>,
    results: Rc<RefCell<Vec<(PathBuf, String)>>>,
}

fn hash_start(_cx: &mut TaskCx<'_>, hasher: &mut Hasher, path: &mut PathBuf) {
    hasher.current = match File::open(&*path) {
        Ok(file) => Some(Hashing {
            path: path.clone(),
            file,
            digest: Sha256::new(),
            bytes: 0,
        }),
        Err(e) => {
            warn!("cannot open {}: {e}", path.display());
            None
        }
    };
}

fn hash_step(cx: &mut TaskCx<'_>, hasher: &mut Hasher, ticks: u32) -> StepResult {
    let Hasher { chunk, current, .. } = hasher;
    let Some(hashing) = current.as_mut() else {
        return StepResult::Done;
    };

    for used in 0..ticks {
        match hashing.file.read(chunk) {
            Ok(0) => {
                cx.ticks_used(used);
                return StepResult::Done;
            }
            Ok(n) => {
                hashing.digest.update(&chunk[..n]);
                hashing.bytes += n as u64;
            }
            Err(e) => {
                warn!("cannot read {}: {e}", hashing.path.display());
                *current = None;
                return StepResult::Done;
            }
        }
    }
    StepResult::More
}

fn hash_end(_id: TaskId, hasher: &mut Hasher, _path: &mut PathBuf) {
    if let Some(hashing) = hasher.current.take() {
        debug!(bytes = hashing.bytes, "hashed {}", hashing.path.display());
        let digest = format!("{:x}", hashing.digest.finalize());
        hasher.results.borrow_mut().push((hashing.path, digest));
    }
}

fn print_results(results: &RefCell<Vec<(PathBuf, String)>>) {
    for (path, digest) in results.borrow_mut().drain(..) {
        println!("{digest}  {}", path.display());
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ShoalConfig> {
    if let Some(path) = path {
        return Ok(ShoalConfig::from_file(path)?);
    }
    let default_path = ShoalConfig::default_config_path();
    if default_path.exists() {
        Ok(ShoalConfig::from_file(&default_path)?)
    } else {
        Ok(ShoalConfig::default())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shoal=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let mut sched = Scheduler::new(config.scheduler.clone());

    let found = Rc::new(RefCell::new(Vec::new()));
    let scan_done = Rc::new(Cell::new(false));
    let done_flag = Rc::clone(&scan_done);
    let scan = sched.create_task(
        TaskSpec::new(
            "library scan",
            Scan {
                pending: cli.paths.iter().rev().cloned().collect(),
                visited: 0,
                found: Rc::clone(&found),
            },
        )
        .step(scan_step)
        .on_signal(BgSignal::Usr, |_cx: &mut TaskCx<'_>, scan: &mut Scan, _sig| {
            info!(
                visited = scan.visited,
                pending = scan.pending.len(),
                "library scan progress"
            );
        })
        .on_done(move |id: TaskId, scan: &mut Scan, exit: &TaskExit| {
            if exit.status != TaskStatus::Success {
                warn!(task = %id, ?exit, "library scan did not complete");
            }
            info!(visited = scan.visited, "library scan finished");
            done_flag.set(true);
        }),
    )?;

    let results = Rc::new(RefCell::new(Vec::new()));
    let hasher = sched.create_daemon(
        DaemonSpec::<Hasher, PathBuf>::new(
            "file hasher",
            Hasher {
                chunk: vec![0; cli.chunk_kib.max(1) * 1024],
                current: None,
                results: Rc::clone(&results),
            },
        )
        .step(hash_step)
        .on_item_start(hash_start)
        .on_item_end(hash_end)
        .on_signal(BgSignal::Term, |_cx: &mut TaskCx<'_>, hasher: &mut Hasher, _sig| {
            if let Some(hashing) = hasher.current.take() {
                warn!("hashing of {} interrupted", hashing.path.display());
            }
        })
        .on_notify(|id: TaskId, event: DaemonEvent| {
            debug!(daemon = %id, ?event, "file hasher activity");
        }),
    )?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let period = config.scheduler.tick_interval();
    let report = scheduler::drive(&mut sched, period, cancel.clone(), |sched| {
        for path in found.borrow_mut().drain(..) {
            if let Err(e) = sched.enqueue(hasher, path) {
                warn!("cannot queue file for hashing: {e}");
            }
        }
        print_results(&results);

        if cli.stats {
            if !scan_done.get() {
                if let Err(e) = sched.signal(scan, BgSignal::Usr) {
                    debug!("cannot signal library scan: {e}");
                }
            }
            match serde_json::to_string(&sched.snapshot()) {
                Ok(json) => println!("{json}"),
                Err(e) => warn!("cannot encode scheduler snapshot: {e}"),
            }
        }

        if scan_done.get() && found.borrow().is_empty() && sched.is_idle() {
            cancel.cancel();
        }
    })
    .await;

    print_results(&results);
    if report.tasks > 0 {
        warn!(tasks = report.tasks, "background work interrupted");
    }
    Ok(())
}
