//! The command-runner collaborator boundary.
//!
//! The marketplace vendor ships a CLI that performs the actual HTTP calls
//! and renders tabular output. This module only needs it as: an invocation
//! taking a flat argv and returning the printed lines plus any tables it
//! rendered. Everything above this seam is testable with a scripted runner.

use crate::errors::HttpError;
use async_trait::async_trait;
use log::{debug, trace};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// One rendered table: the record rows, as parsed JSON objects.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub records: Vec<Value>,
}

/// Uniform result of one command invocation.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    /// Non-tabular printed lines, in output order.
    pub lines: Vec<String>,
    /// Tables in output order; most commands render zero or one.
    pub tables: Vec<Table>,
}

/// Executes one marketplace command. Implementations are NOT required to be
/// reentrant-safe; callers must serialize invocations.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String]) -> Result<CmdOutput, HttpError>;
}

/// Default binary name of the vendor CLI.
pub const DEFAULT_PROGRAM: &str = "gpurent-cli";

/// Runner that shells out to the vendor CLI in machine-readable mode and
/// splits its stdout into print lines and JSON tables.
#[derive(Debug, Clone)]
pub struct CliRunner {
    program: PathBuf,
}

impl CliRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Locate the vendor CLI on PATH.
    pub fn discover() -> Result<Self, HttpError> {
        let program = which::which(DEFAULT_PROGRAM).map_err(|e| {
            HttpError::Config(format!("{} not found on PATH: {}", DEFAULT_PROGRAM, e))
        })?;
        Ok(Self::new(program))
    }

    fn parse_stdout(stdout: &str) -> CmdOutput {
        let mut out = CmdOutput::default();
        for line in stdout.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // Raw mode renders each table as one JSON document per line;
            // everything else is a status line.
            if trimmed.starts_with('[') || trimmed.starts_with('{') {
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(Value::Array(records)) => {
                        out.tables.push(Table { records });
                        continue;
                    }
                    Ok(record @ Value::Object(_)) => {
                        out.tables.push(Table {
                            records: vec![record],
                        });
                        continue;
                    }
                    _ => {}
                }
            }
            out.lines.push(line.to_string());
        }
        out
    }

    fn classify_exit(code: i32, stderr: String) -> HttpError {
        if stderr.contains("429") || stderr.contains("Too Many Requests") {
            HttpError::RateLimited
        } else if stderr.contains("401") || stderr.contains("Unauthorized") {
            HttpError::AuthenticationFailed
        } else if stderr.contains("403") || stderr.contains("Forbidden") {
            HttpError::InvalidApiKey
        } else {
            HttpError::CommandExit { code, stderr }
        }
    }
}

#[async_trait]
impl CommandRunner for CliRunner {
    async fn run(&self, argv: &[String]) -> Result<CmdOutput, HttpError> {
        debug!("{} {}", self.program.display(), argv.join(" "));

        let output = Command::new(&self.program)
            .args(argv)
            .arg("--raw")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(HttpError::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        trace!("stdout: {}", stdout);

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(Self::classify_exit(code, stderr));
        }

        Ok(Self::parse_stdout(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stdout_splits_lines_and_tables() {
        let stdout = "starting instance 1234\n[{\"id\": 1}, {\"id\": 2}]\n\n";
        let out = CliRunner::parse_stdout(stdout);
        assert_eq!(out.lines, vec!["starting instance 1234"]);
        assert_eq!(out.tables.len(), 1);
        assert_eq!(out.tables[0].records.len(), 2);
    }

    #[test]
    fn test_parse_stdout_single_object_is_a_table() {
        let out = CliRunner::parse_stdout("{\"id\": 7}\n");
        assert_eq!(out.tables.len(), 1);
        assert!(out.lines.is_empty());
    }

    #[test]
    fn test_parse_stdout_malformed_json_is_a_line() {
        let out = CliRunner::parse_stdout("{not json\n");
        assert_eq!(out.lines, vec!["{not json"]);
        assert!(out.tables.is_empty());
    }

    #[test]
    fn test_classify_exit() {
        assert!(matches!(
            CliRunner::classify_exit(1, "HTTP 429 Too Many Requests".into()),
            HttpError::RateLimited
        ));
        assert!(matches!(
            CliRunner::classify_exit(1, "401 Unauthorized".into()),
            HttpError::AuthenticationFailed
        ));
        assert!(matches!(
            CliRunner::classify_exit(2, "boom".into()),
            HttpError::CommandExit { code: 2, .. }
        ));
    }
}
