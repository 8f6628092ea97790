//! Notify command - Push a changed project file into live sessions.

use anyhow::Result;
use clap::Args;

use super::Context;

#[derive(Args)]
pub struct NotifyArgs {
    /// Project whose file changed
    #[arg(short, long)]
    project: String,

    /// Project-relative path of the file
    path: String,
}

pub async fn execute(args: NotifyArgs, context: &Context) -> Result<()> {
    let manager = context.manager().await?;
    let report = manager.notify_file_changed(&args.project, &args.path).await?;

    context.emit(&report, |r| {
        println!(
            "{} updated in {} session(s)",
            r.path,
            r.sessions_updated.len()
        );
        for id in &r.mismatches {
            println!("  size mismatch in {}", id);
        }
        if !r.web_recreated.is_empty() {
            println!("  web servers recreated: {}", r.web_recreated.join(", "));
        }
    })
}
