//! Common oracle plumbing shared across all protocol handlers
//!
//! External tools are opaque: every invocation is time-bounded so a hung
//! daemon degrades one connection's status instead of stalling a cycle.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::allocator;
use crate::error::{VpnError, VpnResult};

/// Bound on any single external tool invocation.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// 256-bit pre-shared key as hex.
pub fn generate_psk() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Check if a binary is available in the system PATH
pub async fn check_binary_available(binary: &str) -> bool {
    match Command::new("which").arg(binary).output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> VpnError {
    if e.kind() == std::io::ErrorKind::NotFound {
        VpnError::ServiceError(format!("{} not available", program))
    } else {
        VpnError::ServiceError(format!("Failed to run {}: {}", program, e))
    }
}

/// Run an external tool under the standard timeout.
pub async fn run_command(program: &str, args: &[&str]) -> VpnResult<std::process::Output> {
    let result = timeout(
        COMMAND_TIMEOUT,
        Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(spawn_error(program, e)),
        Err(_) => Err(VpnError::ProbeTimeout(format!(
            "{} {}",
            program,
            args.join(" ")
        ))),
    }
}

/// Run an external tool with data on stdin, under the standard timeout.
pub async fn run_command_with_stdin(
    program: &str,
    args: &[&str],
    input: &str,
) -> VpnResult<std::process::Output> {
    use tokio::io::AsyncWriteExt;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| spawn_error(program, e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| VpnError::ServiceError(format!("Failed to feed {}: {}", program, e)))?;
        // Dropping stdin closes the pipe so the tool sees EOF.
    }

    match timeout(COMMAND_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(VpnError::ServiceError(format!(
            "{} failed: {}",
            program, e
        ))),
        Err(_) => Err(VpnError::ProbeTimeout(program.to_string())),
    }
}

/// Single bounded ping. False on any failure, including a missing ping
/// binary.
pub async fn ping_host(addr: Ipv4Addr) -> bool {
    let target = addr.to_string();
    match run_command("ping", &["-c", "1", "-W", "2", &target]).await {
        Ok(output) => output.status.success(),
        Err(e) => {
            debug!("Ping {} failed: {}", target, e);
            false
        }
    }
}

/// Reachability probe toward the remote subnet's gateway (its first host).
pub async fn probe_gateway(remote_subnet: Ipv4Net) -> bool {
    ping_host(allocator::first_host(remote_subnet)).await
}
