use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

mod diagnostics;
mod doctor;
mod init;
mod status_cmd;

/// Multi-agent hook coordination
///
/// warden sits between an AI coding environment and its tools: the host
/// invokes `warden hook` on every tool use, prompt, notification, and
/// stop. warden decides whether the call may proceed, isolates each
/// sub-agent in its own working tree, and arbitrates concurrent writes
/// with filesystem locks.
///
/// HOW IT WORKS:
///   - Sub-agent spawns are observed and registered as pending agents
///   - An agent's first write lazily materializes an isolated workspace
///     (a git worktree on a dedicated branch, or a plain directory)
///   - Writes are redirected into the agent's workspace; escapes are
///     blocked; cross-workspace writes take advisory locks
///   - Dangerous commands (rm -rf /, .env access, force-pushes to
///     protected branches) are denied outright
///
/// QUICK START:
///
///   warden init
///
///   # then register the hook with your host environment:
///   #   command: warden hook
///
///   # inspect what the coordinator knows:
///   warden status
///
/// Exit codes for `warden hook`: 0 allows the tool call (possibly with a
/// rewrite patch on stdout), 2 blocks it with a reason on stderr.
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about)]
#[command(propagate_version = true)]
#[command(after_help = "See 'warden <command> --help' for more information on a specific command.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one hook event from standard input
    ///
    /// Reads a single JSON event, decides allow/deny/rewrite, writes the
    /// decision JSON to stdout, and exits 0 (allow) or 2 (deny). Internal
    /// failures allow the call (fail-open) and are logged.
    Hook,

    /// Sweep expired locks, workspaces, and sessions
    ///
    /// Runs the same cleanup that happens automatically at session stop
    /// and once per N hook invocations.
    Reap,

    /// Brief coordination status
    Status(status_cmd::StatusArgs),

    /// Check system requirements and configuration
    ///
    /// Verifies the project root, the configuration file, git availability
    /// for the configured workspace strategy, and state-tree permissions.
    Doctor,

    /// Initialize warden in the current project
    ///
    /// Creates the state tree and gitignores the coordination directories.
    /// Safe to run multiple times.
    Init,

    /// Generate shell completions
    Completions {
        /// Target shell.
        shell: clap_complete::Shell,
    },
}

fn main() -> Result<()> {
    diagnostics::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Hook => {
            let code = warden::dispatch::run_hook();
            std::process::exit(code);
        }
        Commands::Reap => reap(),
        Commands::Status(args) => status_cmd::run(&args),
        Commands::Doctor => doctor::run(),
        Commands::Init => init::run(),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "warden", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn reap() -> Result<()> {
    let (ctx, _guard, warnings) = warden::context::Context::for_command()?;
    for warning in warnings {
        println!("[WARN] config: {warning}");
    }

    let report = warden::reaper::Reaper::new(&ctx).sweep();
    println!("Reaper sweep:");
    println!("  stale locks reclaimed: {}", report.stale_locks);
    println!("  workspaces removed:    {}", report.workspaces_removed);
    println!("  sessions archived:     {}", report.sessions_archived);
    println!("  sessions deleted:      {}", report.sessions_deleted);
    Ok(())
}
