//! Vigil CLI - hook runner and autofix pipeline
//!
//! Usage:
//!   vigil run                     Run fast and comprehensive hooks
//!   vigil run --autofix           Let agents fix what the hooks find
//!   vigil hooks                   List configured hooks
//!   vigil parse <tool> <file>     Parse captured tool output
//!   vigil config                  Show the effective configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vigil_core::{BudgetMode, HookSpec, Stage, VigilConfig};
use vigil_hooks::{ParserRegistry, ProcessRunner};
use vigil_orchestrator::{
    PhaseSelection, Pipeline, PipelineOptions, PipelineReport, ProgressSink,
};

/// Lines of unresolved issues printed before truncating
const MAX_LISTED_ISSUES: usize = 25;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about = "Quality hooks with bounded autofix")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the quality pipeline
    Run {
        /// Project root (defaults to current directory)
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Configuration file (defaults to <project>/.vigil/config.toml)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Run only the fast hooks
        #[arg(long, conflicts_with = "comprehensive_only")]
        fast_only: bool,

        /// Run only the comprehensive hooks
        #[arg(long)]
        comprehensive_only: bool,

        /// Dispatch remaining issues to fix agents
        #[arg(long)]
        autofix: bool,

        /// Iteration budget
        #[arg(long, value_enum, default_value = "standard")]
        mode: CliMode,

        /// Stop after the hooks pass
        #[arg(long)]
        skip_downstream: bool,

        /// Stream progress events to stderr as JSON lines
        #[arg(long)]
        progress: bool,

        /// Print the full run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List configured hooks
    Hooks {
        #[arg(long, default_value = ".")]
        project: PathBuf,

        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Parse captured tool output and print the issues
    Parse {
        /// Hook name or parser key
        tool: String,

        /// File holding the tool's output
        file: PathBuf,

        /// Expected issue count (read from the output when omitted)
        #[arg(long)]
        count: Option<usize>,

        /// Project whose configuration names the hook
        #[arg(long, default_value = ".")]
        project: PathBuf,

        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config {
        #[arg(long, default_value = ".")]
        project: PathBuf,

        /// Write the default configuration if none exists
        #[arg(long)]
        write_default: bool,
    },
}

/// CLI-friendly budget enum
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliMode {
    Quick,
    Standard,
    Thorough,
}

impl From<CliMode> for BudgetMode {
    fn from(m: CliMode) -> Self {
        match m {
            CliMode::Quick => BudgetMode::Quick,
            CliMode::Standard => BudgetMode::Standard,
            CliMode::Thorough => BudgetMode::Thorough,
        }
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            project,
            config,
            fast_only,
            comprehensive_only,
            autofix,
            mode,
            skip_downstream,
            progress,
            json,
        } => {
            let config = load_config(&project, config.as_deref())?;
            let phases = if fast_only {
                PhaseSelection::FastOnly
            } else if comprehensive_only {
                PhaseSelection::ComprehensiveOnly
            } else {
                PhaseSelection::All
            };
            let options = PipelineOptions {
                phases,
                autofix: autofix || config.autofix.enabled,
                mode: mode.into(),
                skip_downstream,
            };
            cmd_run(project, config, options, progress, json)
        }
        Commands::Hooks { project, config } => {
            cmd_hooks(&load_config(&project, config.as_deref())?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Parse {
            tool,
            file,
            count,
            project,
            config,
        } => cmd_parse(&load_config(&project, config.as_deref())?, &tool, &file, count),
        Commands::Config {
            project,
            write_default,
        } => cmd_config(&project, write_default),
    }
}

fn load_config(project: &Path, explicit: Option<&Path>) -> Result<VigilConfig> {
    let config = match explicit {
        Some(path) => VigilConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => VigilConfig::load_or_default(project)
            .with_context(|| format!("Failed to load config for {}", project.display()))?,
    };
    Ok(config)
}

fn cmd_run(
    project: PathBuf,
    config: VigilConfig,
    options: PipelineOptions,
    progress: bool,
    json: bool,
) -> Result<ExitCode> {
    let project = project
        .canonicalize()
        .with_context(|| format!("Project directory {} not found", project.display()))?;
    info!("Vigil run in {}", project.display());

    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone())?;

    let sink = ProgressSink::new(config.progress.buffer);
    if progress {
        stream_progress(&sink)?;
    }

    let report = Pipeline::new(config, &project, Arc::new(ProcessRunner::new()))
        .with_options(options)
        .with_progress(sink)
        .with_cancel(cancel)
        .run();

    if json {
        println!("{}", report.to_json()?);
    } else {
        print_summary(&report);
    }

    let code = u8::try_from(report.exit_code).unwrap_or(1);
    Ok(ExitCode::from(code))
}

/// Cancel `cancel` on Ctrl-C
fn watch_interrupt(cancel: CancellationToken) -> Result<()> {
    std::thread::Builder::new()
        .name("vigil-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!("Interrupt handling unavailable: {}", e);
                    return;
                }
            };
            runtime.block_on(async {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if result.is_ok() {
                            warn!("Interrupted, stopping after in-flight work is killed");
                            cancel.cancel();
                        }
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        })
        .context("Failed to start signal thread")?;
    Ok(())
}

/// Print progress events to stderr until the sink goes away
fn stream_progress(sink: &ProgressSink) -> Result<()> {
    let mut rx = sink.subscribe();
    std::thread::Builder::new()
        .name("vigil-progress".to_string())
        .spawn(move || loop {
            match rx.blocking_recv() {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => eprintln!("{}", line),
                    Err(e) => debug!("Unprintable progress event: {}", e),
                },
                Err(RecvError::Lagged(missed)) => {
                    debug!("Progress printer skipped {} events", missed)
                }
                Err(RecvError::Closed) => break,
            }
        })
        .context("Failed to start progress thread")?;
    Ok(())
}

fn print_summary(report: &PipelineReport) {
    println!("Vigil run {}", report.run_id);
    println!("==========");

    for phase in &report.phases {
        let blocking = phase
            .hooks
            .iter()
            .filter(|h| h.status.is_blocking())
            .count();
        println!(
            "  {:<20} attempt {}  {} hooks, {} blocking  ({} ms)",
            phase.phase.as_str(),
            phase.attempt,
            phase.hooks.len(),
            blocking,
            phase.duration_ms
        );
        for hook in phase.hooks.iter().filter(|h| h.status.is_blocking()) {
            println!(
                "      {} {} ({} issues)",
                hook.name, hook.status, hook.parsed_issues
            );
        }
    }

    if let Some(autofix) = &report.autofix {
        println!(
            "\nAutofix: {:?} after {} of {} iterations",
            autofix.outcome, autofix.iterations_run, autofix.max_iterations
        );
        for iteration in &autofix.iterations {
            println!(
                "  #{}: {} -> {} issues, {} fixes{}",
                iteration.index,
                iteration.issues_at_start,
                iteration.issues_at_end,
                iteration.fixes_applied.len(),
                if iteration.partially_applied {
                    " (partial)"
                } else {
                    ""
                }
            );
        }
        if !autofix.unassigned.is_empty() {
            println!("  {} issues had no confident agent", autofix.unassigned.len());
        }
    }

    for step in &report.downstream {
        println!(
            "  downstream {}: {}",
            step.name,
            if step.success { "passed" } else { "failed" }
        );
    }

    match &report.halt {
        None => println!("\nResult: success"),
        Some(halt) => {
            println!("\nResult: halted in {}: {}", halt.phase, halt.reason);
            if let Some(class) = halt.error_class {
                println!("  error class: {}", class);
            }
            if let Some(iteration) = halt.iteration {
                println!("  iteration: {}", iteration);
            }
            println!("  unresolved issues: {}", halt.unresolved_issues);
            for issue in report.unresolved.iter().take(MAX_LISTED_ISSUES) {
                println!(
                    "    {} [{}] {}: {}",
                    issue.location(),
                    issue.source_tool,
                    issue.severity,
                    issue.message
                );
            }
            if report.unresolved.len() > MAX_LISTED_ISSUES {
                println!(
                    "    ... and {} more",
                    report.unresolved.len() - MAX_LISTED_ISSUES
                );
            }
        }
    }
}

fn cmd_hooks(config: &VigilConfig) {
    let stages = [
        (Stage::FastHooks, &config.hooks.fast),
        (Stage::ComprehensiveHooks, &config.hooks.comprehensive),
    ];
    for (stage, hooks) in stages {
        println!("{} ({})", stage, hooks.len());
        for hook in hooks.iter() {
            print_hook(hook);
        }
    }
    if !config.downstream.steps.is_empty() {
        println!("downstream ({})", config.downstream.steps.len());
        for step in &config.downstream.steps {
            print_hook(step);
        }
    }
}

fn print_hook(hook: &HookSpec) {
    let mut flags = Vec::new();
    if hook.parallel_safe {
        flags.push("parallel".to_string());
    }
    if !hook.enabled {
        flags.push("disabled".to_string());
    }
    if hook.parser_key() != hook.name {
        flags.push(format!("parser={}", hook.parser_key()));
    }
    println!(
        "  {:<22} {:>4}s  {}{}",
        hook.name,
        hook.timeout_seconds,
        hook.command_line(),
        if flags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", flags.join(", "))
        }
    );
}

/// Parser key and stage for a tool, taken from its configured hook when there is one
fn parse_target<'a>(config: &'a VigilConfig, tool: &'a str) -> (&'a str, Stage) {
    match config.find_hook(tool) {
        Some((hook, stage)) => (hook.parser_key(), stage),
        None => (tool, Stage::ComprehensiveHooks),
    }
}

fn cmd_parse(
    config: &VigilConfig,
    tool: &str,
    file: &Path,
    count: Option<usize>,
) -> Result<ExitCode> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let registry = ParserRegistry::with_builtin();
    let (key, stage) = parse_target(config, tool);

    let declared = match count {
        Some(n) => Some(n),
        None => registry.declared_count(key, &raw)?,
    };
    let issues = registry.parse(key, &raw, declared, stage)?;

    println!("{}", serde_json::to_string_pretty(&issues)?);
    eprintln!(
        "{} issues{}",
        issues.len(),
        declared
            .map(|n| format!(" (declared {})", n))
            .unwrap_or_default()
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_config(project: &Path, write_default: bool) -> Result<ExitCode> {
    if write_default {
        let path = project.join(".vigil/config.toml");
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        VigilConfig::write_default(project)?;
        println!("Wrote {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let config = VigilConfig::load_or_default(project)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::HookSpec;

    #[test]
    fn test_parse_target_uses_configured_stage() {
        let mut config = VigilConfig::default();
        config
            .hooks
            .comprehensive
            .push(HookSpec::new("types", &["zuban", "check"]).with_parser("zuban"));

        assert_eq!(
            parse_target(&config, "trailing-whitespace"),
            ("trailing-whitespace", Stage::FastHooks)
        );
        assert_eq!(parse_target(&config, "types"), ("zuban", Stage::ComprehensiveHooks));
        assert_eq!(parse_target(&config, "pyright"), ("pyright", Stage::ComprehensiveHooks));
    }
}
