//! Open command - Open or reuse a session.

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::info;

use super::Context;

#[derive(Args)]
pub struct OpenArgs {
    /// Session identifier
    session: String,

    /// Project to open
    #[arg(short, long)]
    project: String,

    /// Owner of the project
    #[arg(short, long, env = "SANDBAY_OWNER")]
    owner: String,

    /// Also start the session's web server
    #[arg(long)]
    web: bool,
}

pub async fn execute(args: OpenArgs, context: &Context) -> Result<()> {
    info!("Opening session {} for {}/{}", args.session, args.owner, args.project);
    let manager = context.manager().await?;

    let session = manager
        .open(&args.session, &args.project, &args.owner)
        .await
        .with_context(|| format!("opening session {}", args.session))?;

    context.emit(&session, |s| {
        println!("Session {} ready", s.session_id);
        println!("  container: {}", s.container.as_deref().unwrap_or("-"));
        println!("  image:     {}", s.image);
        println!("  port:      {}", s.port);
        println!("  cwd:       {}", s.cwd);
    })?;

    if args.web {
        let web = manager.start_web_server(&args.session).await?;
        context.emit(&web, |w| println!("Web server at {}", w.url))?;
    }
    Ok(())
}
