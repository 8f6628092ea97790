//! Host port allocation.

use std::io::ErrorKind;

use tokio::net::TcpListener;
use tracing::debug;

use crate::error::{RunnerError, RunnerResult};

const BIND_ADDR: &str = "0.0.0.0";

/// Ask the OS for a currently free port.
///
/// The throwaway listener is released before returning, so the port is
/// free but not reserved.
pub async fn allocate_port() -> RunnerResult<u16> {
    let listener = TcpListener::bind((BIND_ADDR, 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    debug!("Allocated port {}", port);
    Ok(port)
}

/// Check whether a specific port can currently be bound.
pub async fn is_port_free(port: u16) -> RunnerResult<bool> {
    match TcpListener::bind((BIND_ADDR, port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Fail with [`RunnerError::PortConflict`] unless `port` is bindable.
pub async fn ensure_port_free(port: u16) -> RunnerResult<()> {
    if is_port_free(port).await? {
        Ok(())
    } else {
        Err(RunnerError::PortConflict(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_port_returns_bindable_port() {
        let port = allocate_port().await.unwrap();
        assert_ne!(port, 0);
        assert!(is_port_free(port).await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_detects_bound_port() {
        let listener = TcpListener::bind((BIND_ADDR, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(!is_port_free(port).await.unwrap());
        let err = ensure_port_free(port).await.unwrap_err();
        assert!(matches!(err, RunnerError::PortConflict(p) if p == port));

        drop(listener);
        assert!(ensure_port_free(port).await.is_ok());
    }
}
