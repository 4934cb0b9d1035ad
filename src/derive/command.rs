use super::{DerivationReport, DerivationRequest, DeriveError, Deriver};
use crate::config::types::DerivationConfig;
use crate::time::format_instant;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runs an external program once per job.
///
/// Arguments may contain placeholders that are substituted per request:
/// `{start}`, `{stop}`, `{warmup_start}` (ISO-8601), `{start_ms}`,
/// `{stop_ms}`, `{warmup_start_ms}`, `{job_id}` and `{max_segment_size}`.
/// Partition directories are written to the child's stdin, one per line.
/// `PARCHIVE_PARTITION_FIRST`, `PARCHIVE_PARTITION_LAST` and
/// `PARCHIVE_PARTITION_COUNT` summarise them in the environment, which
/// stays small however long the range is.
///
/// The last non-empty line on stdout, when it is an unsigned integer, is
/// taken as the processed sample count. Aborting kills the child.
#[derive(Debug, Clone)]
pub struct CommandDeriver {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandDeriver {
    pub fn new(command: Vec<String>, timeout: Option<Duration>) -> Result<Self, DeriveError> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| DeriveError::Failed("derivation command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    pub fn from_config(config: &DerivationConfig) -> Result<Self, DeriveError> {
        Self::new(config.command.clone(), config.timeout)
    }

    fn build_command(&self, request: &DerivationRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        let first = request.partitions.first().map(String::as_str).unwrap_or("");
        let last = request.partitions.last().map(String::as_str).unwrap_or("");
        cmd.args(self.args.iter().map(|arg| expand_placeholders(arg, request)))
            .env("PARCHIVE_PARTITION_FIRST", first)
            .env("PARCHIVE_PARTITION_LAST", last)
            .env("PARCHIVE_PARTITION_COUNT", request.partitions.len().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

fn expand_placeholders(arg: &str, request: &DerivationRequest) -> String {
    arg.replace("{start}", &format_instant(request.range.start))
        .replace("{stop}", &format_instant(request.range.stop))
        .replace("{warmup_start}", &format_instant(request.warmup_start))
        .replace("{start_ms}", &request.range.start.to_string())
        .replace("{stop_ms}", &request.range.stop.to_string())
        .replace("{warmup_start_ms}", &request.warmup_start.to_string())
        .replace("{job_id}", &request.job_id.to_string())
        .replace("{max_segment_size}", &request.max_segment_size.to_string())
}

fn partition_listing(partitions: &[String]) -> String {
    let mut listing = String::with_capacity(partitions.iter().map(|p| p.len() + 1).sum());
    for dir in partitions {
        listing.push_str(dir);
        listing.push('\n');
    }
    listing
}

fn parse_processed(stdout: &str) -> u64 {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl Deriver for CommandDeriver {
    async fn run(
        &self,
        request: &DerivationRequest,
        abort: CancellationToken,
    ) -> Result<DerivationReport, DeriveError> {
        let mut child = self.build_command(request).spawn()?;
        debug!(
            job_id = request.job_id,
            program = %self.program,
            partitions = request.partitions.len(),
            "Derivation process started"
        );

        // Written from its own task so a child that never reads cannot
        // stall on a full pipe.
        if let Some(mut stdin) = child.stdin.take() {
            let listing = partition_listing(&request.partitions);
            let job_id = request.job_id;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(listing.as_bytes()).await {
                    debug!(job_id, error = %e, "Derivation process did not read its partition list");
                }
            });
        }

        let output = child.wait_with_output();
        let timeout = self.timeout;
        let finished = async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, output).await {
                    Ok(result) => result,
                    Err(_) => return Err(DeriveError::Timeout(limit)),
                },
                None => output.await,
            };
            result.map_err(DeriveError::from)
        };

        // Dropping the pending output future kills the child.
        let output = tokio::select! {
            result = finished => result?,
            _ = abort.cancelled() => {
                warn!(job_id = request.job_id, "Derivation process killed on abort");
                return Ok(DerivationReport { processed: 0, aborted: true });
            }
        };

        if !output.status.success() {
            return Err(DeriveError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(DerivationReport {
            processed: parse_processed(&stdout),
            aborted: false,
        })
    }
}
