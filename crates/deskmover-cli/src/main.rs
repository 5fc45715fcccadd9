//! deskmover CLI - loads the worker into explorer.exe and moves desktop icons through it

#[cfg(windows)]
mod inject;
#[cfg(windows)]
mod process;

use clap::{Parser, Subcommand, ValueEnum};
use deskmover_shared::{IconPosition, SessionConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[cfg_attr(not(windows), allow(dead_code))]
#[command(name = "deskmover")]
#[command(about = "Move desktop icons through a worker running inside explorer.exe")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// When to load the worker into explorer.exe
    #[arg(long, value_enum, default_value_t = InjectPolicy::Auto, global = true)]
    inject: InjectPolicy,

    /// Path to the worker DLL (defaults to deskmover_payload.dll next to this exe)
    #[arg(long, global = true)]
    payload: Option<PathBuf>,

    /// How long to wait for another client to finish, in milliseconds
    #[arg(long, default_value_t = 10_000, global = true)]
    mutex_timeout_ms: u64,

    /// How long a probe waits for the worker, in milliseconds
    #[arg(long, default_value_t = 300, global = true)]
    probe_timeout_ms: u64,

    /// How long any other command waits for the worker, in milliseconds
    #[arg(long, default_value_t = 25_000, global = true)]
    timeout_ms: u64,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
#[cfg_attr(not(windows), allow(dead_code))]
enum Commands {
    /// Load the worker unless it already answers
    Inject,
    /// Check whether a worker answers
    Probe,
    /// Print the number of desktop icons
    Count,
    /// List every desktop icon with its position
    List {
        /// Refuse to list more icons than this
        #[arg(long, default_value_t = 4096)]
        capacity: usize,
    },
    /// Move icons, given as NAME=X,Y
    Move {
        #[arg(required = true, value_parser = parse_placement)]
        placements: Vec<IconPosition>,

        /// Treat X,Y as per-mille of the screen size (0-1000)
        #[arg(long)]
        ratio: bool,
    },
    /// Ask the shell to refresh the desktop
    Refresh,
    /// Minimize everything (Win+D)
    ShowDesktop,
    /// Turn off auto-arrange
    DisableAutoArrange,
    /// Turn off snap-to-grid
    DisableSnap,
    /// Truncate the worker log
    ClearLog,
    /// Stop the worker
    Unload {
        /// Unload from a separate thread, for when a normal unload hangs
        #[arg(long, conflicts_with = "kill")]
        force: bool,

        /// Terminate explorer.exe together with the worker
        #[arg(long)]
        kill: bool,
    },
    /// Kill explorer.exe and start it again
    RestartHost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum InjectPolicy {
    /// Inject only when no worker answers
    Auto,
    /// Reload: unload a worker that answers, then inject a fresh one
    Always,
    /// Never inject; fail if no worker answers
    Never,
}

/// What to do about the worker once we know whether one answers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(not(windows), allow(dead_code))]
enum WorkerPlan {
    Ready,
    Inject,
    /// Unload first; a second LoadLibraryW on a loaded module only bumps its
    /// refcount and starts no server
    Reload,
    Missing,
}

impl InjectPolicy {
    #[cfg_attr(not(windows), allow(dead_code))]
    fn plan(self, answering: bool) -> WorkerPlan {
        match (self, answering) {
            (InjectPolicy::Always, true) => WorkerPlan::Reload,
            (_, true) => WorkerPlan::Ready,
            (InjectPolicy::Never, false) => WorkerPlan::Missing,
            (_, false) => WorkerPlan::Inject,
        }
    }
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            mutex_timeout: Duration::from_millis(self.mutex_timeout_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            operation_timeout: Duration::from_millis(self.timeout_ms),
            ..SessionConfig::default()
        }
    }
}

/// Parse `NAME=X,Y`; the name may itself contain `=`
fn parse_placement(s: &str) -> Result<IconPosition, String> {
    let (name, coords) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected NAME=X,Y, got '{s}'"))?;
    if name.is_empty() {
        return Err(format!("missing icon name in '{s}'"));
    }

    let (x, y) = coords
        .split_once(',')
        .ok_or_else(|| format!("expected X,Y after '=', got '{coords}'"))?;
    let x = x
        .trim()
        .parse::<i32>()
        .map_err(|e| format!("invalid X '{x}': {e}"))?;
    let y = y
        .trim()
        .parse::<i32>()
        .map_err(|e| format!("invalid Y '{y}': {e}"))?;

    Ok(IconPosition::new(name, x, y))
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,deskmover=info"))
    };

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry().with(filter).with(layer).init();
}

#[cfg(not(windows))]
fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    tracing::error!("deskmover only runs on Windows");
    ExitCode::FAILURE
}

#[cfg(windows)]
fn main() -> ExitCode {
    use colored::Colorize;

    let args = Args::parse();
    init_logging(args.verbose);

    match app::run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "[ERROR]".red(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(windows)]
mod app {
    use super::{Args, Commands, WorkerPlan};
    use crate::inject;
    use crate::process::{self, ExplorerHost};
    use colored::Colorize;
    use deskmover_shared::{
        Error, IconPosition, MoveMode, Result, ServerExit, Session, SharedChannel,
    };
    use std::path::PathBuf;
    use std::time::Duration;

    /// Name of the worker module, expected next to this executable
    const PAYLOAD_NAME: &str = "deskmover_payload.dll";

    /// Time the worker gets to open the channel after LoadLibraryW returns
    const WORKER_STARTUP: Duration = Duration::from_millis(300);

    type ShellSession = Session<SharedChannel, ExplorerHost>;

    pub fn run(args: &Args) -> Result<()> {
        let session = Session::new(SharedChannel::open_default()?, args.session_config())
            .with_monitor(ExplorerHost::new());

        match &args.command {
            Commands::Probe => probe(&session),
            Commands::Inject => ensure_worker(&session, args),
            Commands::Unload { force, kill } => unload(&session, *force, *kill),
            Commands::Count => {
                ensure_worker(&session, args)?;
                println!("{}", session.count()?);
                Ok(())
            }
            Commands::List { capacity } => {
                ensure_worker(&session, args)?;
                list(&session, *capacity)
            }
            Commands::Move { placements, ratio } => {
                ensure_worker(&session, args)?;
                let mode = if *ratio {
                    MoveMode::Ratio
                } else {
                    MoveMode::Pixels
                };
                move_icons(&session, placements, mode)
            }
            Commands::Refresh => {
                ensure_worker(&session, args)?;
                session.refresh()?;
                println!("{} Desktop refreshed", "[OK]".green());
                Ok(())
            }
            Commands::ShowDesktop => {
                ensure_worker(&session, args)?;
                session.show_desktop()?;
                println!("{} Show desktop sent", "[OK]".green());
                Ok(())
            }
            Commands::DisableAutoArrange => {
                ensure_worker(&session, args)?;
                session.disable_auto_arrange()?;
                println!("{} Auto-arrange disabled", "[OK]".green());
                Ok(())
            }
            Commands::DisableSnap => {
                ensure_worker(&session, args)?;
                session.disable_snap_to_grid()?;
                println!("{} Snap-to-grid disabled", "[OK]".green());
                Ok(())
            }
            Commands::ClearLog => {
                ensure_worker(&session, args)?;
                session.clear_log()?;
                println!("{} Worker log cleared", "[OK]".green());
                Ok(())
            }
            Commands::RestartHost => {
                println!("{} Restarting explorer.exe...", "[INFO]".blue());
                let pid = process::restart_shell()?;
                println!("{} explorer.exe started (PID: {})", "[OK]".green(), pid);
                Ok(())
            }
        }
    }

    fn probe(session: &ShellSession) -> Result<()> {
        if session.probe() {
            println!("{} Worker is responding", "[OK]".green());
            Ok(())
        } else {
            println!("{} No worker answered", "[WARN]".yellow());
            Err(Error::NotReady(session.config().probe_timeout))
        }
    }

    /// Probe, inject if needed, then probe again
    fn ensure_worker(session: &ShellSession, args: &Args) -> Result<()> {
        match args.inject.plan(session.probe()) {
            WorkerPlan::Ready => {
                tracing::debug!("worker already running");
                return Ok(());
            }
            WorkerPlan::Missing => return Err(Error::NotReady(session.config().probe_timeout)),
            WorkerPlan::Reload => {
                println!("{} Unloading running worker...", "[INFO]".blue());
                session.shutdown(ServerExit::Normal)?;
                std::thread::sleep(WORKER_STARTUP);
            }
            WorkerPlan::Inject => {}
        }

        let dll_path = payload_path(args)?;
        let pid = process::find_shell_pid()
            .ok_or_else(|| Error::Injection("explorer.exe is not running".to_string()))?;

        if let Err(e) = inject::enable_debug_privilege() {
            tracing::debug!(error = %e, "SeDebugPrivilege not enabled");
        }

        println!(
            "{} Injecting {} into explorer.exe (PID: {})",
            "[INFO]".blue(),
            dll_path.display(),
            pid
        );
        inject::inject_dll(pid, &dll_path).map_err(|e| Error::Injection(e.to_string()))?;

        std::thread::sleep(WORKER_STARTUP);

        if !session.probe() {
            return Err(Error::Injection(
                "worker loaded but did not answer".to_string(),
            ));
        }
        println!("{} Worker is responding", "[OK]".green());
        Ok(())
    }

    /// Absolute path of the worker DLL
    fn payload_path(args: &Args) -> Result<PathBuf> {
        let path = match &args.payload {
            Some(p) => p.clone(),
            None => {
                let exe_path = std::env::current_exe()?;
                exe_path
                    .parent()
                    .unwrap_or(&exe_path)
                    .join(PAYLOAD_NAME)
            }
        };

        if !path.exists() {
            return Err(Error::Injection(format!(
                "DLL not found at: {}",
                path.display()
            )));
        }
        Ok(std::path::absolute(path)?)
    }

    fn unload(session: &ShellSession, force: bool, kill: bool) -> Result<()> {
        let exit = if kill {
            ServerExit::HardKill
        } else if force {
            ServerExit::Forced
        } else {
            ServerExit::Normal
        };

        session.shutdown(exit)?;

        match exit {
            ServerExit::HardKill => println!(
                "{} explorer.exe terminated; run `deskmover restart-host` to bring it back",
                "[WARN]".yellow()
            ),
            _ => println!("{} Worker unloaded", "[OK]".green()),
        }
        Ok(())
    }

    fn list(session: &ShellSession, capacity: usize) -> Result<()> {
        let icons = session.enumerate_all(capacity)?;
        println!(
            "{:<48} {:>6} {:>6}",
            "Name".cyan().bold(),
            "X".cyan().bold(),
            "Y".cyan().bold()
        );
        println!("{}", "-".repeat(62));
        for icon in &icons {
            println!("{:<48} {:>6} {:>6}", icon.name, icon.x, icon.y);
        }
        Ok(())
    }

    fn move_icons(session: &ShellSession, placements: &[IconPosition], mode: MoveMode) -> Result<()> {
        let report = session.move_many(placements, mode)?;
        tracing::debug!(transactions = report.transactions, "move finished");

        println!("{} Moved {} icon(s)", "[OK]".green(), report.moved);
        if report.is_success() {
            return Ok(());
        }

        let message = report.last_error.unwrap_or_default();
        println!(
            "{} {} icon(s) failed: {}",
            "[WARN]".yellow(),
            report.error_count,
            message
        );
        Err(Error::CommandFailed {
            error_count: u32::try_from(report.error_count).unwrap_or(u32::MAX),
            message,
        })
    }
}
