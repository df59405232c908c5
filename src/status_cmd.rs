use anyhow::Result;
use clap::Args;
use serde_json::json;

use warden::context::Context;
use warden::state::Phase;

/// Brief coordination status
///
/// Shows known sessions with their agent counts per phase, currently held
/// locks, and materialized workspaces.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

pub fn run(args: &StatusArgs) -> Result<()> {
    let (ctx, _guard, warnings) = Context::for_command()?;
    let store = ctx.store();
    let locks = ctx.locks();

    let sessions = store.sessions();
    let held = locks.held();

    if args.json {
        let sessions_json: Vec<_> = sessions
            .iter()
            .map(|(id, meta)| {
                let agents = store.list_agents(id, None);
                json!({
                    "session": id,
                    "status": format!("{:?}", meta.status).to_lowercase(),
                    "pending": agents.iter().filter(|a| a.phase == Phase::Pending).count(),
                    "active": agents.iter().filter(|a| a.phase == Phase::Active).count(),
                    "completed": agents.iter().filter(|a| a.phase == Phase::Completed).count(),
                })
            })
            .collect();
        let locks_json: Vec<_> = held
            .iter()
            .map(|info| {
                json!({
                    "holder": info.holder,
                    "path": info.path,
                    "purpose": info.purpose,
                    "acquired_ns": info.acquired_ns,
                })
            })
            .collect();
        let out = json!({
            "root": ctx.paths.root().display().to_string(),
            "sessions": sessions_json,
            "locks": locks_json,
            "config_warnings": warnings,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("warden status — {}", ctx.paths.root().display());
    for warning in &warnings {
        println!("[WARN] config: {warning}");
    }
    println!();

    if sessions.is_empty() {
        println!("No sessions.");
    } else {
        println!("Sessions:");
        for (id, meta) in &sessions {
            let agents = store.list_agents(id, None);
            let pending = agents.iter().filter(|a| a.phase == Phase::Pending).count();
            let active = agents.iter().filter(|a| a.phase == Phase::Active).count();
            let completed = agents
                .iter()
                .filter(|a| a.phase == Phase::Completed)
                .count();
            println!(
                "  {id}  [{:?}]  pending:{pending} active:{active} completed:{completed}",
                meta.status
            );
            for agent in &agents {
                let workspace = agent
                    .meta
                    .workspace_path
                    .as_ref()
                    .map_or_else(String::new, |p| format!("  ws:{}", p.display()));
                println!("    {} ({}){workspace}", agent.agent_id, agent.phase);
            }
        }
    }

    println!();
    if held.is_empty() {
        println!("No locks held.");
    } else {
        println!("Locks:");
        for info in &held {
            println!("  {}  held by {} ({})", info.path, info.holder, info.purpose);
        }
    }
    Ok(())
}
