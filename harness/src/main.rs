//! Driver binary: an interactive demo loop, a non-interactive scenario
//! runner, and a multi-threaded stress harness, all built on top of
//! [`vm_core::System`].

mod scenarios;
mod stress;

use std::io::{self, BufRead, Write};
use std::process;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use vm_core::{Config, Error, SimulatedHostMapper, System, VadMode};

#[derive(Parser)]
#[command(name = "vm-harness", about = "Demand-paged virtual memory manager driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a system and drop into an interactive command loop.
    Run(RunArgs),
    /// Run one of the named end-to-end scenarios non-interactively.
    Scenario(ScenarioArgs),
    /// Run the adversarial multi-threaded invariant-checking harness.
    Stress(StressArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliVadMode {
    Commit,
    Reserve,
    Mixed,
}

impl From<CliVadMode> for VadMode {
    fn from(mode: CliVadMode) -> Self {
        match mode {
            CliVadMode::Commit => VadMode::Commit,
            CliVadMode::Reserve => VadMode::Reserve,
            CliVadMode::Mixed => VadMode::Mixed,
        }
    }
}

#[derive(Parser)]
struct RunArgs {
    #[arg(long, default_value_t = 1024)]
    physical_frames: usize,
    #[arg(long, default_value_t = 4096)]
    pagefile_slots: usize,
    #[arg(long, default_value_t = 4)]
    vm_multiplier: usize,
    #[arg(long, default_value_t = 2)]
    num_threads: usize,
    #[arg(long, default_value_t = 64)]
    pages_per_lock: usize,
    #[arg(long, default_value_t = 64)]
    min_available: usize,
    #[arg(long, value_enum, default_value_t = CliVadMode::Mixed)]
    vad_mode: CliVadMode,
    #[arg(long)]
    verbose: bool,
}

impl RunArgs {
    fn to_config(&self) -> Config {
        Config {
            physical_frames: self.physical_frames,
            pagefile_slots: self.pagefile_slots,
            vm_multiplier: self.vm_multiplier,
            num_threads: self.num_threads,
            pages_per_lock: self.pages_per_lock,
            min_available: self.min_available,
            vad_mode: self.vad_mode.into(),
            verbose: self.verbose,
        }
    }
}

#[derive(Parser)]
struct ScenarioArgs {
    /// Which end-to-end scenario to run.
    #[arg(value_enum)]
    name: scenarios::ScenarioName,
}

#[derive(Parser)]
struct StressArgs {
    #[arg(long, default_value_t = 10)]
    seconds: u64,
    #[arg(long, default_value_t = 256)]
    physical_frames: usize,
    #[arg(long, default_value_t = 1024)]
    pagefile_slots: usize,
    #[arg(long, default_value_t = 8)]
    worker_threads: usize,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run(args) => run(args),
        Command::Scenario(args) => scenarios::run(args.name).map(|outcome| {
            println!("scenario {:?}: {}", args.name, if outcome { "PASS" } else { "FAIL" });
            if !outcome {
                process::exit(1);
            }
        }),
        Command::Stress(args) => stress::run(&args).map(|report| {
            println!("{report}");
            if !report.all_invariants_held {
                process::exit(1);
            }
        }),
    };

    if let Err(err) = result {
        handle_fatal(&err);
        eprintln!("error: {err}");
        process::exit(1);
    }
}

/// Per the error taxonomy, a `Fatal` invariant violation is unrecoverable:
/// log it and abort the process rather than unwind through callers that
/// assume the core's invariants still hold.
fn handle_fatal(err: &Error) {
    if let Error::Fatal(msg) = err {
        log::error!("fatal invariant violation: {msg}");
        process::abort();
    }
}

fn run(args: RunArgs) -> Result<(), Error> {
    let config = args.to_config();
    let host = Box::new(SimulatedHostMapper::new(config.physical_frames + 64));
    let system = System::new(config, host)?;

    println!("vm-harness: type 'q' or 'f' to terminate, 'b' to toggle debug dumps, '?' for help");

    thread::scope(|scope| {
        let _workers = system.spawn_workers(scope);
        interactive_loop(&system);
        system.request_shutdown();
    });

    Ok(())
}

#[cfg(feature = "debug-scans")]
fn toggle_dump(system: &System, enabled: &mut bool) {
    *enabled = !*enabled;
    if *enabled {
        system.debug_dump();
    }
}

fn interactive_loop(system: &System) {
    let stdin = io::stdin();
    #[allow(unused_mut)]
    let mut dumps_enabled = false;

    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();

        match line {
            "q" | "f" => break,
            "b" => {
                #[cfg(feature = "debug-scans")]
                toggle_dump(system, &mut dumps_enabled);
                #[cfg(not(feature = "debug-scans"))]
                println!("debug dumps require the `debug-scans` feature");
            }
            "?" | "" => {
                println!("commands: q|f quit, b toggle debug dumps, ? this help");
                println!("stats: zeroed={} written={} trimmed={}",
                    system.stats().zeroed.load(std::sync::atomic::Ordering::Relaxed),
                    system.stats().written.load(std::sync::atomic::Ordering::Relaxed),
                    system.stats().trimmed.load(std::sync::atomic::Ordering::Relaxed));
                println!("available={} committed={}", system.available_pages(), system.committed_pages());
            }
            other => println!("unrecognized command: {other:?} (type ? for help)"),
        }

        if system.is_shutting_down() {
            break;
        }
    }

    // Give background workers a moment to settle before the scope joins them.
    thread::sleep(Duration::from_millis(10));
}
