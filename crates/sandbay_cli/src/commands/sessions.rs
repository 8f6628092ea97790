//! Sessions command - List sessions.

use anyhow::Result;
use clap::Args;

use super::Context;

#[derive(Args)]
pub struct SessionsArgs {
    /// Only sessions of this owner
    #[arg(short, long)]
    owner: Option<String>,
}

pub async fn execute(args: SessionsArgs, context: &Context) -> Result<()> {
    let manager = context.manager().await?;
    let sessions = manager.list_sessions(args.owner.as_deref());

    context.emit(&sessions, |sessions| {
        if sessions.is_empty() {
            println!("No sessions");
            return;
        }
        println!(
            "{:<16} {:<12} {:<16} {:<40} {:<6} CWD",
            "SESSION", "OWNER", "PROJECT", "CONTAINER", "PORT"
        );
        for s in sessions {
            println!(
                "{:<16} {:<12} {:<16} {:<40} {:<6} {}",
                s.session_id,
                s.owner_id,
                s.project_name,
                s.container.as_deref().unwrap_or("-"),
                s.port,
                s.cwd
            );
        }
    })
}
