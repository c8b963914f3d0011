// src/commands/status.rs

//! Status command: summarize per-package state

use super::App;
use anyhow::Result;
use smelt::{StateKind, Status};

pub fn cmd_status(app: &App) -> Result<bool> {
    let mut any_failed = false;

    for kind in StateKind::ALL {
        let records = app.state.read_all(kind)?;
        if records.is_empty() {
            continue;
        }

        println!("{}:", kind.as_str());
        for (name, state) in &records {
            let reason = state
                .reason
                .as_deref()
                .map(|r| format!(" ({r})"))
                .unwrap_or_default();
            println!(
                "  {:<24} {:<12} {}{}",
                name,
                state.status.as_str(),
                state.phase,
                reason
            );
            if state.status == Status::Failed {
                any_failed = true;
            }
        }
    }

    Ok(!any_failed)
}
