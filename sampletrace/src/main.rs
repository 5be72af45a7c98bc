//! # sampletrace - Main Entry Point
//!
//! Records a toy interpreter workload: an interpreter thread evaluates a
//! recursive function while maintaining a shadow stack, and a tokio ticker
//! samples that stack every interval until `--duration` elapses or Ctrl+C.

#![allow(clippy::cast_precision_loss)]

use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info};
use sampletrace::cli::Args;
use sampletrace::domain::{ErrorKind, Interval, SessionError};
use sampletrace::preflight::run_preflight_checks;
use sampletrace::profiling::{CaptureOutcome, Sampler, ShadowStack};
use sampletrace::session::{Capabilities, Session};
use sampletrace::trace_data::TraceData;
use tokio::time::MissedTickBehavior;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

// Code identifiers of the toy interpreter's functions
const CODE_MAIN: usize = 0x10;
const CODE_FIB: usize = 0x20;
const CODE_ALLOC: usize = 0x30;

const SHADOW_STACK_DEPTH: usize = 256;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SessionError>() {
        Some(e) if e.kind() == ErrorKind::Configuration => EXIT_USAGE,
        _ => EXIT_ERROR,
    }
}

/// Body of the interpreter thread
fn interpret(stack: &ShadowStack, sampler: &Sampler, memory: bool, running: &AtomicBool) {
    stack.bind_current_thread();
    let mut rounds = 0u64;
    while running.load(Ordering::Relaxed) {
        let _main = stack.enter(CODE_MAIN);
        std::hint::black_box(fib(stack, 20));
        if memory {
            let _alloc = stack.enter(CODE_ALLOC);
            let bytes = 64 * 1024;
            stack.record_allocation(bytes);
            sampler.capture_allocation(stack);
            stack.record_allocation(-bytes);
        }
        rounds += 1;
    }
    debug!("Interpreter ran {rounds} rounds");
}

fn fib(stack: &ShadowStack, n: u32) -> u64 {
    let _frame = stack.enter(CODE_FIB);
    if n < 2 {
        u64::from(n)
    } else {
        fib(stack, n - 1) + fib(stack, n - 2)
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;
    let config = args.session_config();

    run_preflight_checks(&args.output, &config.compression)?;
    let interval = Interval::from_secs_f64(args.interval)?;

    let file = File::create(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    let mut session = Session::new(Capabilities::host());
    session.configure(&config, OwnedFd::from(file))?;
    let sampler = session.sampler().context("session has no sampler after configure")?;
    session.start().context("Failed to start session")?;

    if !quiet {
        println!("sampletrace v{}", env!("CARGO_PKG_VERSION"));
        println!("output: {}", args.output.display());
        println!("interval: {interval}");
    }

    // Symbol table for the toy interpreter's code ids
    let symbols = [
        (CODE_MAIN, "toy:main:1:demo"),
        (CODE_FIB, "toy:fib:5:demo"),
        (CODE_ALLOC, "toy:alloc:9:demo"),
    ];
    for (id, name) in symbols {
        if sampler.emit_virtual_ip(id, name.as_bytes()) == CaptureOutcome::Dropped {
            info!("Virtual-ip record for {name} dropped");
        }
    }

    let stack = Arc::new(ShadowStack::new(SHADOW_STACK_DEPTH));
    let running = Arc::new(AtomicBool::new(true));
    let interpreter = {
        let (stack, sampler, running) = (Arc::clone(&stack), sampler.clone(), Arc::clone(&running));
        let memory = args.memory;
        thread::Builder::new()
            .name("toy-interpreter".to_string())
            .spawn(move || interpret(&stack, &sampler, memory, &running))
            .context("Failed to spawn interpreter thread")?
    };

    let mut ticker = tokio::time::interval(interval.as_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let profiling_start = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };
    let mut exit_reason = "interrupted";
    let mut ticks = 0u64;

    let loop_result: Result<()> = loop {
        if let Some(limit) = duration_limit {
            if profiling_start.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break Ok(());
            }
        }

        tokio::select! {
            _ = ticker.tick() => {
                ticks += 1;
                sampler.capture(&*stack);
                if let Err(e) = session.check() {
                    break Err(anyhow::Error::new(e).context("Trace stream failed"));
                }
            }
            _ = &mut ctrl_c => {
                break Ok(());
            }
        }
    };

    running.store(false, Ordering::Relaxed);
    if interpreter.join().is_err() {
        bail!("interpreter thread panicked");
    }
    loop_result?;
    session.stop().context("Failed to finish trace")?;

    let stats = session.stats();
    if !quiet {
        eprintln!(
            "\n{}: {:.1}s, {} ticks, {} records ({} dropped), {} bytes before compression",
            exit_reason,
            profiling_start.elapsed().as_secs_f64(),
            ticks,
            stats.committed,
            stats.dropped,
            stats.bytes_written.unwrap_or(0),
        );
    }
    if args.stats_json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }

    if args.verify {
        let trace = TraceData::from_file(&args.output)?;
        if !quiet {
            println!(
                "verified: format v{}, feature byte {}, label {:?}, \
                 {} samples from {} threads, {} records",
                trace.header.major_version,
                trace.header.version.as_byte(),
                String::from_utf8_lossy(&trace.header.label),
                trace.sample_count(),
                trace.threads().len(),
                trace.records.len(),
            );
        }
        if trace.truncated {
            bail!("trace {} has no trailer", args.output.display());
        }
        let expected = usize::try_from(stats.committed).unwrap_or(usize::MAX);
        if trace.records.len() != expected {
            bail!("trace holds {} records, session committed {expected}", trace.records.len());
        }
    }

    Ok(())
}
