//! Exec command - Run a command line in a session.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::{debug, warn};

use sandbay_core::CommandRequest;
use sandbay_runner::{stop_pair, LogHandler, LogLine, LogStream};

use super::Context;

#[derive(Args)]
pub struct ExecArgs {
    /// Session identifier
    session: String,

    /// Command line, e.g. "cd src && npm test"
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Start from this directory instead of the session's current one
    #[arg(long)]
    cwd: Option<String>,

    /// Buffer output instead of streaming it
    #[arg(long)]
    capture: bool,
}

pub async fn execute(args: ExecArgs, context: &Context) -> Result<()> {
    let manager = context.manager().await?;

    let mut request = CommandRequest::new(&args.session, args.command.join(" "));
    if let Some(cwd) = &args.cwd {
        request = request.cwd(cwd);
    }

    let outcome = if args.capture || context.json {
        manager.execute(&request).await?
    } else {
        let (stop, signal) = stop_pair();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; stopping command");
                stop.stop();
            }
        });

        let handler: LogHandler = Arc::new(|line: LogLine| match line.stream {
            LogStream::Stdout => println!("{}", line.message),
            LogStream::Stderr => eprintln!("{}", line.message),
        });
        let result = manager
            .execute_streaming(&request, handler, Some(signal))
            .await;
        ctrl_c.abort();
        result?
    };

    if outcome.recovered {
        eprintln!("(session container was restarted)");
    }

    context.emit(&outcome, |o| {
        if args.capture {
            print!("{}", o.stdout);
            eprint!("{}", o.stderr);
            let _ = std::io::stdout().flush();
        }
        debug!("exit {} in {} ({} ms)", o.exit_code, o.cwd, o.duration_ms);
        eprintln!("[{}] exit {}", o.cwd, o.exit_code);
    })?;

    if !outcome.success() {
        std::process::exit(exit_status(outcome.exit_code));
    }
    Ok(())
}

/// Clamp a container exit code into the range a process can report.
fn exit_status(code: i64) -> i32 {
    if (1..=255).contains(&code) {
        code as i32
    } else {
        1
    }
}
