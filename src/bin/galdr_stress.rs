//! Seedable multi-threaded stress harness.
//!
//! Hammers a database with a chosen workload mix, embedding the document id
//! and a revision counter in every payload so reads can validate that the
//! bytes they get back belong to the id they asked for. Exits 0 on success,
//! 1 on validation failure, 2 on a fatal error.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{error, info, warn};

use galdrdb::{CollectionSchema, Config, Database, DocId, GaldrError};

const COLLECTION: &str = "items";
const PAYLOAD_HEADER: usize = 16;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Workload {
    /// Even split of reads, inserts, updates, deletes.
    Balanced,
    /// Mostly inserts and updates.
    WriteHeavy,
    /// Mostly point reads and scans.
    ReadHeavy,
    /// Insert-delete churn to exercise GC and space reuse.
    HighChurn,
}

#[derive(Parser, Debug)]
#[command(name = "galdr-stress", about = "GaldrDb stress harness")]
struct Args {
    /// Workload mix to run.
    #[arg(value_enum)]
    workload: Workload,

    /// Concurrent worker threads.
    #[arg(short = 'w', long, default_value_t = 4)]
    workers: usize,

    /// Wall-clock budget in seconds.
    #[arg(short = 't', long, default_value_t = 30)]
    timeout: u64,

    /// Total operation budget across all workers (0 = unlimited).
    #[arg(short = 'l', long, default_value_t = 100_000)]
    limit: u64,

    /// Retries per operation on write conflicts.
    #[arg(short = 'r', long, default_value_t = 5)]
    retries: u32,

    /// RNG seed; runs with equal seeds and settings are reproducible.
    #[arg(short = 's', long, default_value_t = 0xBADC0FFE)]
    seed: u64,

    /// Documents inserted before the workload starts.
    #[arg(short = 'i', long, default_value_t = 1000)]
    initial: u64,

    /// Keep the database file after the run.
    #[arg(short = 'k', long, default_value_t = false)]
    keep: bool,

    /// Verbose logging.
    #[arg(short = 'v', long, default_value_t = false)]
    verbose: bool,

    /// Database path; a temp file is used when omitted.
    #[arg(short = 'p', long)]
    path: Option<std::path::PathBuf>,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    conflicts: AtomicU64,
    ops: AtomicU64,
    validation_failures: AtomicU64,
}

fn main() -> ExitCode {
    let args = Args::parse();
    galdrdb::logging::init(if args.verbose { "debug" } else { "info" });

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            error!(error = %err, "fatal error");
            ExitCode::from(2)
        }
    }
}

fn run(args: &Args) -> galdrdb::Result<bool> {
    let tmp_dir;
    let path = match &args.path {
        Some(path) => path.clone(),
        None => {
            tmp_dir = tempfile::tempdir()?;
            let path = tmp_dir.path().join("stress.gdb");
            if args.keep {
                warn!("--keep with a temp path; the directory is deleted on exit");
            }
            path
        }
    };

    let db = Database::open_or_create(&path, Config::default())?;
    db.create_collection(&CollectionSchema::plain(COLLECTION))?;

    // Seed population. Insert-then-update inside one transaction embeds the
    // assigned id in the payload.
    {
        let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
        let mut tx = db.begin_transaction()?;
        for _ in 0..args.initial {
            let id = tx.insert(COLLECTION, Vec::new(), Vec::new())?;
            tx.update(COLLECTION, id, payload(id, 0, &mut rng), Vec::new(), Vec::new())?;
        }
        tx.commit()?;
    }

    let counters = Counters::default();
    let stop = AtomicBool::new(false);
    let deadline = Instant::now() + Duration::from_secs(args.timeout);

    std::thread::scope(|scope| {
        for worker in 0..args.workers.max(1) {
            let db = &db;
            let counters = &counters;
            let stop = &stop;
            let seed = args.seed.wrapping_add(worker as u64 + 1);
            let workload = args.workload;
            let retries = args.retries;
            let limit = args.limit;
            scope.spawn(move || {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                while !stop.load(Ordering::Relaxed) {
                    if Instant::now() >= deadline {
                        stop.store(true, Ordering::Relaxed);
                        break;
                    }
                    let ops = counters.ops.fetch_add(1, Ordering::Relaxed);
                    if limit != 0 && ops >= limit {
                        stop.store(true, Ordering::Relaxed);
                        break;
                    }
                    if let Err(err) = one_op(db, workload, retries, &mut rng, counters) {
                        if matches!(err, GaldrError::WriteConflict { .. }) {
                            counters.conflicts.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        error!(worker, error = %err, "worker stopped on error");
                        counters.validation_failures.fetch_add(1, Ordering::Relaxed);
                        stop.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            });
        }
    });

    db.checkpoint()?;
    let findings = db.verify()?;
    for finding in &findings {
        warn!(finding = %finding, "integrity finding");
    }
    let stats = db.stats()?;
    info!(
        reads = counters.reads.load(Ordering::Relaxed),
        inserts = counters.inserts.load(Ordering::Relaxed),
        updates = counters.updates.load(Ordering::Relaxed),
        deletes = counters.deletes.load(Ordering::Relaxed),
        conflicts = counters.conflicts.load(Ordering::Relaxed),
        documents = stats.collections.first().map(|c| c.doc_count).unwrap_or(0),
        total_pages = stats.total_pages,
        "run complete"
    );

    if args.keep {
        info!(path = %path.display(), "database kept");
    }
    let ok = findings.is_empty() && counters.validation_failures.load(Ordering::Relaxed) == 0;
    Ok(ok)
}

fn one_op(
    db: &Database,
    workload: Workload,
    retries: u32,
    rng: &mut ChaCha8Rng,
    counters: &Counters,
) -> galdrdb::Result<()> {
    // Per-workload op mix, as percentages of read/insert/update/delete.
    let (read_pct, insert_pct, update_pct) = match workload {
        Workload::Balanced => (50, 20, 20),
        Workload::WriteHeavy => (10, 45, 35),
        Workload::ReadHeavy => (85, 8, 5),
        Workload::HighChurn => (10, 40, 10),
    };
    let roll: u32 = rng.gen_range(0..100);

    let mut attempt = 0;
    loop {
        let result = if roll < read_pct {
            do_read(db, rng, counters)
        } else if roll < read_pct + insert_pct {
            do_insert(db, rng, counters)
        } else if roll < read_pct + insert_pct + update_pct {
            do_update(db, rng, counters)
        } else {
            do_delete(db, rng, counters)
        };
        match result {
            Err(GaldrError::WriteConflict { .. }) if attempt < retries => {
                attempt += 1;
                counters.conflicts.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            other => return other,
        }
    }
}

fn do_read(db: &Database, rng: &mut ChaCha8Rng, counters: &Counters) -> galdrdb::Result<()> {
    let mut tx = db.begin_read_only_transaction()?;
    let probe = probe_id(rng);
    if let Some(bytes) = tx.get(COLLECTION, probe)? {
        validate_payload(probe, &bytes)?;
    }
    counters.reads.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn do_insert(db: &Database, rng: &mut ChaCha8Rng, counters: &Counters) -> galdrdb::Result<()> {
    let mut tx = db.begin_transaction()?;
    let id = tx.insert(COLLECTION, Vec::new(), Vec::new())?;
    // Re-write with the assigned id embedded so reads can validate.
    tx.update(COLLECTION, id, payload(id, 0, rng), Vec::new(), Vec::new())?;
    tx.commit()?;
    counters.inserts.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn do_update(db: &Database, rng: &mut ChaCha8Rng, counters: &Counters) -> galdrdb::Result<()> {
    let mut tx = db.begin_transaction()?;
    let probe = probe_id(rng);
    let Some(existing) = tx.get(COLLECTION, probe)? else {
        return Ok(());
    };
    validate_payload(probe, &existing)?;
    let revision = read_revision(&existing) + 1;
    tx.update(COLLECTION, probe, payload(probe, revision, rng), Vec::new(), Vec::new())?;
    tx.commit()?;
    counters.updates.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn do_delete(db: &Database, rng: &mut ChaCha8Rng, counters: &Counters) -> galdrdb::Result<()> {
    let mut tx = db.begin_transaction()?;
    let probe = probe_id(rng);
    if tx.get(COLLECTION, probe)?.is_none() {
        return Ok(());
    }
    tx.delete(COLLECTION, probe, Vec::new())?;
    tx.commit()?;
    counters.deletes.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Probe ids concentrate in a small range so workers actually collide.
fn probe_id(rng: &mut ChaCha8Rng) -> DocId {
    rng.gen_range(1..=4096)
}

fn payload(id: DocId, revision: u64, rng: &mut ChaCha8Rng) -> Vec<u8> {
    let body_len = rng.gen_range(16..512usize);
    let mut out = Vec::with_capacity(PAYLOAD_HEADER + body_len);
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&revision.to_le_bytes());
    out.extend((0..body_len).map(|_| rng.gen::<u8>()));
    out
}

fn read_revision(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[8..16].try_into().expect("payload header"))
}

fn validate_payload(expected_id: DocId, bytes: &[u8]) -> galdrdb::Result<()> {
    if bytes.is_empty() {
        return Ok(()); // freshly inserted placeholder
    }
    if bytes.len() < PAYLOAD_HEADER {
        return Err(GaldrError::InvalidArgument(format!(
            "document {expected_id}: payload shorter than its header"
        )));
    }
    let stored = DocId::from_le_bytes(bytes[0..4].try_into().expect("payload header"));
    if stored != expected_id {
        return Err(GaldrError::InvalidArgument(format!(
            "document {expected_id} returned bytes tagged for {stored}"
        )));
    }
    Ok(())
}
