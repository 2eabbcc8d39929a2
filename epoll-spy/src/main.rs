//! # epoll-spy - Main Entry Point
//!
//! - `attach <EVENT>`: load, attach and stream events until interrupted,
//!   the duration elapses, or every traced process exits
//! - `detach`: nothing to release outside a running `attach`
//! - `list`: show the attachable events and their resolved symbols

#![allow(clippy::too_many_lines, clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::io::{self, BufWriter};
use std::path::Path;
use std::time::{Duration, Instant};

use epoll_spy::channel::{EventChannel, KernelRing};
use epoll_spy::cli::{AttachArgs, Cli, Command};
use epoll_spy::collector::{Collector, EventSink, JsonSink, TextSink};
use epoll_spy::config::{OutputFormat, SpyConfig};
use epoll_spy::domain::errors::{EXIT_ERROR, EXIT_SUCCESS};
use epoll_spy::domain::ProbeError;
use epoll_spy::loader::{
    bump_memlock_rlimit, configure_probes, init_ebpf_logger, load_ebpf_object, EbpfBackend,
    KernelSymbols, Loader, ProbeSettings,
};
use epoll_spy::preflight::run_preflight_checks;
use epoll_spy::registry::{self, ArchPrefix, REGISTRY};
use epoll_spy::targets::expand_targets;

fn main() {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap's usage exit code would collide with SymbolNotFound
            let _ = e.print();
            std::process::exit(if e.use_stderr() { EXIT_ERROR } else { EXIT_SUCCESS });
        }
    };

    std::process::exit(match run(cli) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|e| e.downcast_ref::<ProbeError>())
        .map_or(EXIT_ERROR, ProbeError::exit_code)
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Attach(args) => attach(&args).await,
        Command::Detach => {
            // Probes live only as long as the `attach` process that created them
            println!("no probes attached outside a running `epoll-spy attach`; nothing to do");
            Ok(())
        }
        Command::List => {
            list();
            Ok(())
        }
    }
}

fn list() {
    let arch = ArchPrefix::current();
    println!("{:<20} {:<14} SYMBOL ({arch})", "EVENT", "KIND");
    for descriptor in REGISTRY {
        println!(
            "{:<20} {:<14} {}",
            descriptor.logical_name,
            descriptor.kind.to_string(),
            descriptor.symbol_for(arch)
        );
    }
}

/// Resolves once every target process is gone; never if there are none
async fn targets_exited(pids: &[u32]) {
    if pids.is_empty() {
        return std::future::pending().await;
    }
    let proc_paths: Vec<String> = pids.iter().map(|pid| format!("/proc/{pid}")).collect();
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if proc_paths.iter().all(|p| !Path::new(p).exists()) {
            return;
        }
    }
}

async fn run_until(duration: Option<Duration>) {
    match duration {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

async fn attach(args: &AttachArgs) -> Result<()> {
    let descriptor = registry::lookup(&args.event)?;
    let config = SpyConfig::try_from(args)?;
    config.check_probe(descriptor)?;

    // Run pre-flight checks before anything else
    run_preflight_checks(&config.pids)?;
    let pids = expand_targets(&config.pids, config.follow)?;

    let arch = ArchPrefix::current();
    info!("epoll-spy v{} on {arch}", env!("CARGO_PKG_VERSION"));

    // ── Load object and configure kernel side ──────────────────────────
    bump_memlock_rlimit();
    let mut ebpf = load_ebpf_object(&config.object_path, config.ring_bytes)?;
    init_ebpf_logger(&mut ebpf);
    configure_probes(
        &mut ebpf,
        arch,
        &ProbeSettings { pids, override_return: config.override_return },
    )?;

    // Take the ring before the object moves into the backend
    let mut channel = KernelRing::from_ebpf(&mut ebpf)?;

    let symbols = KernelSymbols::from_kallsyms().context("Failed to read /proc/kallsyms")?;
    info!("Kernel symbol table: {} functions", symbols.len());

    // ── Attach ──────────────────────────────────────────────────────────
    let backend =
        EbpfBackend::new(ebpf, symbols).with_override(config.override_return.is_some());
    let mut loader = Loader::with_arch(backend, arch);
    let handle = loader.attach(descriptor)?;
    let symbol = loader.symbol(handle).unwrap_or_default().to_string();

    eprintln!("epoll-spy: {} attached to {symbol}", descriptor.logical_name);
    if !config.pids.is_empty() {
        eprintln!("pids: {:?}{}", config.pids, if config.follow { " (following)" } else { "" });
    }

    let sink: Box<dyn EventSink> = match config.format {
        OutputFormat::Text => Box::new(TextSink::new(BufWriter::new(io::stdout().lock()))),
        OutputFormat::Json => Box::new(JsonSink::new(BufWriter::new(io::stdout().lock()))),
    };
    let mut collector = Collector::new(sink, config.collector());

    // ── Main polling loop ───────────────────────────────────────────────
    let started = Instant::now();
    let exit_reason = tokio::select! {
        () = collector.run(&mut channel, loader.subscribe()) => "probes detached",
        _ = tokio::signal::ctrl_c() => "interrupted",
        () = run_until(config.duration) => "duration limit reached",
        () = targets_exited(&config.pids) => "process exited",
    };

    // ── Detach, then pick up events written before the link went away ──
    let detached = loader.detach(handle);
    if let Err(ref e) = detached {
        warn!("Detach failed: {e}");
    }
    collector.finish(&mut channel, detached.is_ok());

    let stats = collector.stats();
    eprintln!(
        "\n{}: {:.1}s, {} events (emitted: {}, sink failures: {}, decode failures: {}, gaps: {}, reordered: {}, dropped: {})",
        exit_reason,
        started.elapsed().as_secs_f64(),
        stats.received,
        stats.emitted,
        stats.sink_failures,
        stats.decode_failures,
        stats.sequence_gaps,
        stats.reordered,
        channel.dropped_count(),
    );

    detached.context("Failed to detach probe")?;
    Ok(())
}
