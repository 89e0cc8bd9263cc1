//! Reachability probes run before the SSH handshake.
//!
//! Each probe appends a [`DiagnosticStep`] so a failed `connect()` can be
//! explained in the logs, and classifies the failure into the matching
//! [`ConnectionError`] kind.

use crate::error::ConnectionError;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

// ─── Shared types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Pass,
    Fail,
    Info,
}

/// Result of a single probe step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticStep {
    pub name: String,
    pub status: StepStatus,
    pub message: String,
    pub duration_ms: u64,
}

impl DiagnosticStep {
    fn new(name: &str, status: StepStatus, message: String, started: Instant) -> Self {
        Self {
            name: name.into(),
            status,
            message,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// One-line summary of the steps, for log output.
pub fn summarize(steps: &[DiagnosticStep]) -> String {
    steps
        .iter()
        .map(|s| format!("{} [{:?}] {} ({}ms)", s.name, s.status, s.message, s.duration_ms))
        .collect::<Vec<_>>()
        .join("; ")
}

// ─── Probes ─────────────────────────────────────────────────────────────────

/// Resolve `host:port` to every address it maps to.
pub fn probe_dns(
    host: &str,
    port: u16,
    steps: &mut Vec<DiagnosticStep>,
) -> Result<Vec<SocketAddr>, ConnectionError> {
    let t = Instant::now();
    match (host, port).to_socket_addrs() {
        Ok(addrs) => {
            let all: Vec<SocketAddr> = addrs.collect();
            if all.is_empty() {
                let msg = format!("DNS returned no addresses for {host}");
                steps.push(DiagnosticStep::new("DNS Resolution", StepStatus::Fail, msg.clone(), t));
                return Err(ConnectionError::NetworkUnreachable(msg));
            }
            let ips: Vec<String> = all.iter().map(|a| a.ip().to_string()).collect();
            steps.push(DiagnosticStep::new(
                "DNS Resolution",
                StepStatus::Pass,
                format!("{host} → {}", ips.join(", ")),
                t,
            ));
            Ok(all)
        }
        Err(e) => {
            let msg = format!("DNS lookup for {host} failed: {e}");
            steps.push(DiagnosticStep::new("DNS Resolution", StepStatus::Fail, msg.clone(), t));
            Err(ConnectionError::NetworkUnreachable(msg))
        }
    }
}

/// Try each address in turn until one accepts, sharing a single deadline.
pub fn probe_tcp(
    addrs: &[SocketAddr],
    timeout: Duration,
    steps: &mut Vec<DiagnosticStep>,
) -> Result<TcpStream, ConnectionError> {
    let t = Instant::now();
    let deadline = t + timeout;
    let mut last_err: Option<std::io::Error> = None;

    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match TcpStream::connect_timeout(addr, remaining) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                steps.push(DiagnosticStep::new(
                    "TCP Connect",
                    StepStatus::Pass,
                    format!("connected to {addr}"),
                    t,
                ));
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    let timed_out = Instant::now() >= deadline
        || last_err
            .as_ref()
            .map(|e| matches!(e.kind(), std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock))
            .unwrap_or(false);

    let msg = match last_err {
        Some(e) => format!("TCP connect failed: {e}"),
        None => "TCP connect failed: no address attempted".to_string(),
    };
    steps.push(DiagnosticStep::new("TCP Connect", StepStatus::Fail, msg.clone(), t));

    if timed_out {
        Err(ConnectionError::Timeout(msg))
    } else {
        Err(ConnectionError::NetworkUnreachable(msg))
    }
}

/// DNS + TCP in one call, the usual prelude to an SSH handshake.
pub fn open_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
    steps: &mut Vec<DiagnosticStep>,
) -> Result<TcpStream, ConnectionError> {
    let addrs = probe_dns(host, port, steps)?;
    probe_tcp(&addrs, timeout, steps)
}
