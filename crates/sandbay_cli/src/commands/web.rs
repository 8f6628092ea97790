//! Web command - Start or stop a session's web server.

use anyhow::Result;
use clap::Args;

use super::Context;

#[derive(Args)]
pub struct WebArgs {
    /// Session identifier
    session: String,

    /// Remove the web server instead of (re)starting it
    #[arg(long)]
    stop: bool,
}

pub async fn execute(args: WebArgs, context: &Context) -> Result<()> {
    let manager = context.manager().await?;

    if args.stop {
        let removed = manager.stop_web_server(&args.session).await?;
        return context.emit(&removed, |removed| {
            if *removed {
                println!("Web server of {} stopped", args.session);
            } else {
                println!("Session {} had no web server", args.session);
            }
        });
    }

    let info = manager.start_web_server(&args.session).await?;
    context.emit(&info, |info| {
        println!("Web server {} serving {:?}", info.container, info.site);
        println!("  {}", info.url);
    })
}
