use anyhow::{Context, Result};
use clap::Parser;
use std::process::Command;

const EBPF_PACKAGE: &str = "epoll-spy-ebpf";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the epoll-spy probe object
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        #[arg(long)]
        release: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, release } => build_ebpf(&target, release)?,
    }

    Ok(())
}

fn build_ebpf(target: &str, _release: bool) -> Result<()> {
    // Always build in release mode: debug builds pull in formatting code
    // the BPF linker cannot handle.
    let mut cmd = Command::new("cargo");
    cmd.arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg(EBPF_PACKAGE)
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release"); // Always release

    let status = cmd.status().context("Failed to build eBPF program")?;

    if !status.success() {
        anyhow::bail!("Failed to build {EBPF_PACKAGE}");
    }

    println!("✓ eBPF program built successfully");
    println!("  Object: target/{target}/release/epoll-spy");
    println!("  Run with: sudo epoll-spy attach <EVENT> (or set EPOLL_SPY_OBJECT)");

    Ok(())
}
