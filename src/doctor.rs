use std::process::Command;

use anyhow::Result;

use warden::config::{WardenConfig, WorkspaceStrategy};
use warden::paths::ProjectPaths;

/// Check system requirements and configuration
#[allow(clippy::unnecessary_wraps)]
pub fn run() -> Result<()> {
    println!("warden doctor");
    println!("=============");
    println!();

    let mut all_ok = true;

    let paths = match ProjectPaths::resolve() {
        Ok(paths) => {
            println!("[OK] project root: {}", paths.root().display());
            if !paths.is_vcs_root() {
                println!("[WARN] no .git marker found; using the working directory as root");
            }
            paths
        }
        Err(e) => {
            println!("[FAIL] project root: {e}");
            return Ok(());
        }
    };

    let config = check_config(&paths, &mut all_ok);
    check_git(config.workspace_strategy, &mut all_ok);
    check_writable(&paths, &mut all_ok);

    println!();
    if all_ok {
        println!("All required checks passed!");
    } else {
        println!("Some required checks failed. See above for details.");
    }
    Ok(())
}

fn check_config(paths: &ProjectPaths, all_ok: &mut bool) -> WardenConfig {
    match WardenConfig::load(&paths.config_path()) {
        Ok(mut config) => {
            let warnings = config.normalize();
            if warnings.is_empty() {
                println!("[OK] config: {}", paths.config_path().display());
            } else {
                for warning in warnings {
                    println!("[WARN] config: {warning}");
                }
            }
            config
        }
        Err(e) => {
            println!("[FAIL] config: {e}");
            *all_ok = false;
            WardenConfig::default()
        }
    }
}

fn check_git(strategy: WorkspaceStrategy, all_ok: &mut bool) {
    let required = strategy == WorkspaceStrategy::VcsOnly;
    let label = if required { "required" } else { "optional" };

    match Command::new("git").arg("--version").output() {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            let version = version.lines().next().unwrap_or("unknown").trim();
            println!("[OK] git ({label}): {version}");
        }
        _ => {
            if required {
                println!("[FAIL] git ({label}): not found");
                println!("       workspace_strategy = \"vcs-only\" needs git on PATH");
                *all_ok = false;
            } else {
                println!("[SKIP] git ({label}): not found; workspaces fall back to plain dirs");
            }
        }
    }
}

fn check_writable(paths: &ProjectPaths, all_ok: &mut bool) {
    match paths.ensure_layout() {
        Ok(()) => {
            println!("[OK] state tree: writable");
        }
        Err(e) => {
            println!("[FAIL] state tree: {e}");
            println!("       Check permissions on {}", paths.state_dir().display());
            *all_ok = false;
        }
    }
}
