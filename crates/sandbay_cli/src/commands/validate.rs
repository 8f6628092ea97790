//! Validate command - Report a session's liveness.

use anyhow::Result;
use clap::Args;

use super::Context;

#[derive(Args)]
pub struct ValidateArgs {
    /// Session identifier
    session: String,
}

pub async fn execute(args: ValidateArgs, context: &Context) -> Result<()> {
    let manager = context.manager().await?;
    let status = manager.validate(&args.session).await?;

    context.emit(&status, |s| {
        if !s.found {
            println!("Session {} not found", s.session_id);
            return;
        }
        let state = |running: bool| if running { "running" } else { "stopped" };
        println!("Session {}", s.session_id);
        println!(
            "  container: {} ({})",
            s.container.as_deref().unwrap_or("-"),
            state(s.running)
        );
        if let Some(web) = &s.web_container {
            println!("  web:       {} ({})", web, state(s.web_running));
        }
        if let Some(cwd) = &s.cwd {
            println!("  cwd:       {}", cwd);
        }
    })?;

    if !(status.found && status.running) {
        std::process::exit(1);
    }
    Ok(())
}
