//! Logs command - Show a session container's logs.

use anyhow::Result;
use clap::Args;

use super::Context;

#[derive(Args)]
pub struct LogsArgs {
    /// Session identifier
    session: String,

    /// Show the web server's logs
    #[arg(long)]
    web: bool,

    /// Number of trailing lines
    #[arg(short, long)]
    tail: Option<usize>,
}

pub async fn execute(args: LogsArgs, context: &Context) -> Result<()> {
    let manager = context.manager().await?;
    let logs = manager.logs(&args.session, args.web, args.tail).await?;
    context.emit(&logs, |logs| print!("{}", logs))
}
