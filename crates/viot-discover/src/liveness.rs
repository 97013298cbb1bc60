//! fping process wrapper.
//!
//! Runs one `fping` sweep per room CIDR as a child process via
//! `tokio::process::Command` and keeps the addresses that answered.

use std::net::Ipv4Addr;
use std::time::Instant;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::process::Command;

use crate::error::{DiscoverError, Result};

/// Finds responsive hosts in a CIDR block.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn sweep(&self, cidr: Ipv4Net) -> Result<Vec<Ipv4Addr>>;
}

/// Wrapper around the fping binary.
pub struct FpingProber {
    fping_path: String,
    retries: u32,
    timeout_ms: u64,
}

impl FpingProber {
    pub fn new(fping_path: &str, retries: u32, timeout_ms: u64) -> Self {
        Self {
            fping_path: fping_path.to_string(),
            retries,
            timeout_ms,
        }
    }

    /// Verify fping is installed and accessible.
    pub async fn verify_installation(&self) -> Result<String> {
        let output = Command::new(&self.fping_path)
            .arg("--version")
            .output()
            .await
            .map_err(|_| DiscoverError::FpingNotFound {
                path: self.fping_path.clone(),
            })?;

        // fping prints its version on stdout, some builds on stderr.
        let mut version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if version.is_empty() {
            version = String::from_utf8_lossy(&output.stderr).trim().to_string();
        }
        Ok(version)
    }

    /// Sweep `cidr` with explicit retry and timeout settings.
    ///
    /// fping exits non-zero whenever any host is unreachable, so the exit
    /// status is not an error; only failing to start the process is.
    pub async fn sweep_with(
        &self,
        cidr: Ipv4Net,
        retries: u32,
        timeout_ms: u64,
    ) -> Result<Vec<Ipv4Addr>> {
        let start = Instant::now();

        let output = Command::new(&self.fping_path)
            .args(fping_args(cidr, retries, timeout_ms))
            .output()
            .await
            .map_err(|e| DiscoverError::FpingNotFound {
                path: format!("{}: {e}", self.fping_path),
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push('\n');
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let alive = parse_fping_output(&combined);

        tracing::debug!(
            cidr = %cidr,
            alive = alive.len(),
            exit_code = output.status.code().unwrap_or(-1),
            duration_ms = start.elapsed().as_millis(),
            "fping sweep complete"
        );

        Ok(alive)
    }
}

#[async_trait]
impl LivenessProbe for FpingProber {
    async fn sweep(&self, cidr: Ipv4Net) -> Result<Vec<Ipv4Addr>> {
        self.sweep_with(cidr, self.retries, self.timeout_ms).await
    }
}

pub fn fping_args(cidr: Ipv4Net, retries: u32, timeout_ms: u64) -> Vec<String> {
    vec![
        "-C".to_string(),
        retries.to_string(),
        "-t".to_string(),
        timeout_ms.to_string(),
        "-r".to_string(),
        "0".to_string(),
        "-A".to_string(),
        "-q".to_string(),
        "-g".to_string(),
        cidr.to_string(),
    ]
}

/// Addresses from `host : r1 r2 ...` lines where every probe got a reply.
///
/// Lines that do not split into exactly two `:` fields are ignored.
pub fn parse_fping_output(output: &str) -> Vec<Ipv4Addr> {
    let mut alive = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        let [host, result] = fields.as_slice() else {
            continue;
        };
        if result.contains('-') || result.trim().is_empty() {
            continue;
        }
        if let Ok(ip) = host.trim().parse::<Ipv4Addr>() {
            if !alive.contains(&ip) {
                alive.push(ip);
            }
        }
    }
    alive
}
