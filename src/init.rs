use std::path::Path;

use anyhow::{Context as _, Result};

use warden::context::Context;

/// Gitignore entries the state tree needs.
const GITIGNORE_ENTRIES: [&str; 3] = [".state/", "worktrees/", "logs/"];

/// Initialize warden in the current project
///
/// Creates the state tree (`.state/`, `worktrees/`, `logs/`) and makes
/// sure the coordination directories are gitignored. Safe to run multiple
/// times.
pub fn run() -> Result<()> {
    let (ctx, _guard, warnings) = Context::for_command()?;
    for warning in &warnings {
        println!("[WARN] config: {warning}");
    }

    ctx.paths
        .ensure_layout()
        .context("Could not create the state tree")?;
    println!("[OK] state tree: {}", ctx.paths.state_dir().display());

    ensure_gitignored(ctx.paths.root())?;

    println!();
    println!("warden is ready.");
    println!("  Hook command: warden hook");
    println!("  Health check: warden doctor");
    Ok(())
}

/// Append any missing coordination entries to `.gitignore`.
fn ensure_gitignored(root: &Path) -> Result<()> {
    let gitignore = root.join(".gitignore");
    let existing = std::fs::read_to_string(&gitignore).unwrap_or_default();
    let present: Vec<&str> = existing
        .lines()
        .map(|line| line.trim().trim_start_matches('/'))
        .collect();

    let missing: Vec<&str> = GITIGNORE_ENTRIES
        .iter()
        .copied()
        .filter(|entry| {
            let bare = entry.trim_end_matches('/');
            !present.contains(entry) && !present.contains(&bare)
        })
        .collect();

    if missing.is_empty() {
        println!("[OK] .gitignore: coordination directories already ignored");
        return Ok(());
    }

    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    for entry in &missing {
        updated.push_str(entry);
        updated.push('\n');
    }
    std::fs::write(&gitignore, updated).context("Could not update .gitignore")?;
    println!("[OK] .gitignore: added {}", missing.join(", "));
    Ok(())
}
