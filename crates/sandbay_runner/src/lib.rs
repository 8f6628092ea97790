//! # sandbay_runner
//!
//! Process, port and container runtime plumbing for sandbay.
//!
//! This crate is the leaf of the engine: everything that touches the OS or
//! the container daemon lives here.
//!
//! # Features
//!
//! - **Process Runner**: async command execution with captured or streamed output
//! - **Port Allocator**: OS-assigned ports and fixed-port probing
//! - **Multiple Runtimes**: CLI wrapper (docker/podman) and Docker API (bollard)
//! - **Naming Policy**: deterministic, sanitized container and volume names
//! - **Stack Detection**: image selection from project file names
//! - **Mock Runtime**: for testing without actual containers
//!
//! # Example
//!
//! ```rust,no_run
//! use sandbay_runner::{CliRuntime, ContainerRuntime, ContainerSpec, ExecRequest, MountConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = CliRuntime::detect(None).await?;
//!
//!     let spec = ContainerSpec::new("sandbay-demo", "node:20-alpine")
//!         .workdir("/workspace")
//!         .mount(MountConfig::bind("/tmp/demo", "/workspace"))
//!         .command(vec!["tail".into(), "-f".into(), "/dev/null".into()]);
//!     runtime.create_container(&spec).await?;
//!
//!     let result = runtime.exec(&ExecRequest::shell("sandbay-demo", "ls")).await?;
//!     println!("Exit code: {}", result.exit_code);
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod docker;
pub mod error;
pub mod mock;
pub mod naming;
pub mod ports;
pub mod process;
pub mod runner;
pub mod stacks;

pub use cli::{CliRuntime, RuntimeKind};
pub use config::{
    CommonImages, ContainerSpec, ExecRequest, MountConfig, MountSource, PortMapping,
    ResourceLimits,
};
pub use docker::DockerApiRuntime;
pub use error::{RunnerError, RunnerResult};
pub use mock::{CapturedCall, ExecHandler, MockContainer, MockRuntime};
pub use ports::{allocate_port, ensure_port_free, is_port_free};
pub use process::{
    stop_pair, LogHandler, LogLine, LogStream, ProcessOutput, ProcessRunner, ProcessSpec,
    StopHandle, StopSignal, SPAWN_FAILED, TERMINATED,
};
pub use runner::{shell_quote, ContainerRuntime, ExecutionResult};
pub use stacks::{Stack, StackRegistry};
