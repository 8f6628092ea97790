//! Close command - Release sessions.

use anyhow::{bail, Result};
use clap::Args;

use super::Context;

#[derive(Args)]
pub struct CloseArgs {
    /// Session identifier
    session: Option<String>,

    /// Close every session of this owner
    #[arg(long, conflicts_with = "session")]
    owner: Option<String>,

    /// With --owner, only sessions of this project
    #[arg(long, requires = "owner")]
    project: Option<String>,
}

pub async fn execute(args: CloseArgs, context: &Context) -> Result<()> {
    let manager = context.manager().await?;

    let closed = match (&args.session, &args.owner, &args.project) {
        (Some(session), _, _) => usize::from(manager.close(session).await?),
        (None, Some(owner), Some(project)) => manager.close_project(owner, project).await?,
        (None, Some(owner), None) => manager.close_owner(owner).await?,
        (None, None, _) => bail!("invalid arguments: give a session or --owner"),
    };

    context.emit(&closed, |n| println!("Closed {} session(s)", n))
}
