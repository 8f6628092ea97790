//! Run command - Run commands in a warm pooled container.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Args;
use tracing::info;

use sandbay_core::WarmPool;
use sandbay_runner::{ResourceLimits, StackRegistry};

use super::Context;

#[derive(Args)]
pub struct RunArgs {
    /// Directory mounted as the workspace
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Image to run in; detected from the directory when omitted
    #[arg(short, long)]
    image: Option<String>,

    /// Commands, run in order in the same container
    #[arg(required = true)]
    commands: Vec<String>,

    /// Leave the pooled container running afterwards
    #[arg(long)]
    keep: bool,

    /// Run without resource limits
    #[arg(long)]
    unlimited: bool,
}

pub async fn execute(args: RunArgs, context: &Context) -> Result<()> {
    let dir = args
        .dir
        .canonicalize()
        .with_context(|| format!("resolving {}", args.dir.display()))?;

    let image = match args.image {
        Some(image) => image,
        None => {
            let paths = sandbay_core::materialize::list_paths(&dir);
            let (stack, image) = StackRegistry::new().select(&paths);
            info!("Detected {} stack, using {}", stack, image);
            image
        }
    };
    let limits = if args.unlimited {
        ResourceLimits::unlimited()
    } else {
        context.config.limits.clone()
    };

    let pool = WarmPool::new(
        context.runtime().await?,
        Duration::from_secs(context.config.pool_idle_ttl_secs),
    );

    let mut failed = None;
    for command in &args.commands {
        let result = pool.run(&image, &dir, &limits, command).await?;
        context.emit(&result, |r| {
            print!("{}", r.stdout);
            eprint!("{}", r.stderr);
        })?;
        if !result.success() {
            failed = Some((command.clone(), result.exit_code));
            break;
        }
    }

    if !args.keep {
        pool.drain().await;
    }

    if let Some((command, code)) = failed {
        anyhow::bail!("`{}` exited with code {}", command, code);
    }
    Ok(())
}
