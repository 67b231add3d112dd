// Copyright (c) 2026 clove project
// SPDX-License-Identifier: AGPL-3.0

//! # Clove kernel host binary
//!
//! Boots the agent kernel and blocks until SIGINT/SIGTERM. One positional
//! argument optionally overrides the socket path. Exit code 0 on clean
//! shutdown, 1 on init failure.

use anyhow::{Context, Result};
use clap::Parser;
use clove_kernel::{Kernel, KernelConfig};
use colored::Colorize;
use std::path::PathBuf;

/// Clove, a user-space agent kernel
#[derive(Parser)]
#[command(name = "clove")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Unix socket path the kernel listens on
    #[arg(value_name = "SOCKET", default_value = clove_kernel::config::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Disable namespace/cgroup isolation for spawned agents
    #[arg(long)]
    no_sandbox: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CLOVE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Skip the startup banner
    #[arg(long, short)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if !cli.quiet {
        print_banner();
    }

    init_logging(&cli.log_level)?;

    let mut config = KernelConfig::load().with_socket_path(&cli.socket);
    if cli.no_sandbox {
        config.enable_sandboxing = false;
    }

    let mut kernel = Kernel::new(config).context("failed to create kernel")?;
    if let Err(e) = kernel.init() {
        eprintln!("{} failed to initialize kernel: {e}", "✗".red().bold());
        std::process::exit(1);
    }

    if !cli.quiet {
        print_status(&kernel, &cli.socket);
    }

    // Blocks until a shutdown signal lands on the self-pipe.
    kernel.run();

    println!("{} shut down cleanly", "⟳".yellow());
    Ok(())
}

fn print_banner() {
    let banner = r#"
     ██████╗██╗      ██████╗ ██╗   ██╗███████╗
    ██╔════╝██║     ██╔═══██╗██║   ██║██╔════╝
    ██║     ██║     ██║   ██║██║   ██║█████╗
    ██║     ██║     ██║   ██║╚██╗ ██╔╝██╔══╝
    ╚██████╗███████╗╚██████╔╝ ╚████╔╝ ███████╗
     ╚═════╝╚══════╝ ╚═════╝   ╚═══╝  ╚══════╝
"#;
    println!("{}", banner.cyan().bold());
    println!("    {}", "user-space agent kernel".dimmed());
}

fn print_status(kernel: &Kernel, socket: &std::path::Path) {
    let config = kernel.config();
    println!();
    println!("    {}", "KERNEL STATUS".cyan().bold());
    println!("    {:<12}{}", "version", env!("CARGO_PKG_VERSION").green());
    println!("    {:<12}{}", "socket", socket.display().to_string().yellow());
    println!(
        "    {:<12}{}",
        "sandbox",
        if config.enable_sandboxing {
            "enabled".green()
        } else {
            "disabled".yellow()
        }
    );
    println!(
        "    {:<12}{}",
        "llm",
        if kernel.llm_configured() {
            kernel.llm_model().magenta()
        } else {
            "not configured".dimmed()
        }
    );
    println!();
    println!(
        "    {}  {}",
        "KERNEL READY".green().bold(),
        "press Ctrl+C to shut down".dimmed()
    );
    println!();
}

/// Mirror of the kernel's tracing setup: env filter, compact single-line
/// output without targets.
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    Ok(())
}
