//! redirfsctl - Inspect and dry-run redirfs filter configurations
//!
//! Usage:
//!   redirfsctl check <config>                  - Validate a configuration
//!   redirfsctl plan <root> --config <file>     - Apply it to a mirrored tree

use anyhow::Context;
use clap::{Parser, Subcommand};
use redirfs::config::{Config, FilterConfig};
use redirfs::filter::Filter;
use redirfs::host::MemoryHost;
use redirfs::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "redirfsctl")]
#[command(version)]
#[command(about = "Inspect and dry-run redirfs filter configurations")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a configuration file
    Check {
        /// Configuration file (defaults to the per-user location)
        config: Option<PathBuf>,
    },

    /// Mirror a directory, apply the configured rules and show the result
    Plan {
        /// Directory to mirror
        root: PathBuf,

        /// Configuration file (defaults to the per-user location)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print registered paths as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over the flag
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {}", e);
    }

    if let Err(e) = run_command(cli.command) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Check { config } => cmd_check(&config_path(config)),
        Commands::Plan { root, config, json } => cmd_plan(&root, &config_path(config), json),
    }
}

fn config_path(arg: Option<PathBuf>) -> PathBuf {
    arg.unwrap_or_else(Config::default_path)
}

fn cmd_check(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    println!("Configuration OK: {}", config_path.display());
    println!("  Filters:    {}", config.filters.len());
    for filter in &config.filters {
        println!(
            "    {:<16} priority {:>6}  {} ops{}",
            filter.name,
            filter.priority,
            filter.ops.len(),
            if filter.active { "" } else { "  (inactive)" }
        );
    }
    println!("  Path rules: {}", config.paths.len());
    println!("  Log level:  {}", config.log.level);

    Ok(())
}

fn cmd_plan(root: &Path, config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let host = Arc::new(
        MemoryHost::scan(root).with_context(|| format!("scanning {}", root.display()))?,
    );
    info!("Mirrored {} entries from {}", host.len(), root.display());

    let engine = Redirfs::init(host.clone());

    for filter_config in &config.filters {
        let info = FilterInfo::new(filter_config.name.clone(), filter_config.priority)
            .with_active(filter_config.active);
        let filter = engine.register_filter(info)?;
        engine.set_operations(&filter, &trace_operations(filter_config))?;
    }

    for rule in &config.paths {
        let filter = engine
            .registry()
            .find_by_name(&rule.filter)
            .with_context(|| format!("filter {} not registered", rule.filter))?;
        engine
            .set_path(&filter, &PathInfo::new(rule.path.clone(), rule.flags()))
            .with_context(|| format!("applying {} to {}", rule.filter, rule.path.display()))?;
    }

    let status = engine.path_status()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Registered paths: {}", status.len());
        for entry in &status {
            let scope = match (entry.single, entry.subtree) {
                (true, true) => "single+subtree",
                (true, false) => "single",
                (false, true) => "subtree",
                (false, false) => "-",
            };
            println!(
                "  {:<40} {:<15} [{}]",
                entry.path.display(),
                scope,
                entry.effective.join(", ")
            );
        }
        println!("Entries with filter tables: {}/{}", host.filtered_count(), host.len());
    }

    for filter in engine.registry().filters() {
        debug!("Filter {} holds {} references", filter.name(), Filter::ref_count(&filter));
    }

    engine.teardown()?;
    Ok(())
}

/// Callbacks that log every hooked call; operations listed under `deny`
/// stop the call with `-EACCES`
fn trace_operations(filter_config: &FilterConfig) -> Vec<OpInfo> {
    let mut ops = Vec::with_capacity(filter_config.ops.len() + 1);

    for &op in &filter_config.ops {
        let name = filter_config.name.clone();
        let deny = filter_config.deny.contains(&op);
        let post_name = name.clone();

        ops.push(
            OpInfo::new(op)
                .pre(move |ctx: &mut OpContext, args: &mut OpArgs| {
                    debug!("{} pre {:?} {:?}", name, ctx.op, ctx.path);
                    if deny {
                        args.retv = -libc::EACCES;
                        OpRetv::Stop
                    } else {
                        OpRetv::Continue
                    }
                })
                .post(move |ctx: &mut OpContext, args: &mut OpArgs| {
                    debug!("{} post {:?} {:?} retv={}", post_name, ctx.op, ctx.path, args.retv);
                    OpRetv::Continue
                }),
        );
    }
    ops.push(OpInfo::end());

    ops
}
