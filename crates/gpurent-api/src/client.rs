//! Command/response normalizer.
//!
//! Wraps the vendor command runner so every call returns a uniform
//! `(lines, tables)` result: centralizes API-key resolution, URL injection,
//! flag hyphenation, rate-limit retry and success-prefix checking.

use crate::args::Flags;
use crate::errors::{ApiError, HttpError, Result};
use crate::runner::{CmdOutput, CommandRunner};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Default REST endpoint of the marketplace.
pub const DEFAULT_SERVER_URL: &str = "https://console.gpurent.io/api/v0";

/// Environment variable consulted when no key is passed explicitly.
pub const API_KEY_ENV: &str = "GPURENT_API_KEY";

/// Well-known key file under the home directory.
pub const API_KEY_FILE: &str = ".gpurent_api_key";

/// Fixed backoff before retrying a rate-limited call.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(1);

/// Resolve the API key: explicit value, then environment, then the
/// well-known file. `None` means requests go out unauthenticated and any
/// call requiring identity will fail with an authentication error.
pub fn resolve_api_key(explicit: Option<String>) -> Option<String> {
    if explicit.is_some() {
        return explicit;
    }
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.trim().is_empty() {
            return Some(key.trim().to_string());
        }
    }
    let path = home::home_dir()?.join(API_KEY_FILE);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let key = contents.trim();
            if key.is_empty() {
                None
            } else {
                Some(key.to_string())
            }
        }
        Err(_) => {
            debug!("no API key file at {}", path.display());
            None
        }
    }
}

/// Per-call options for [`CmdClient::cmd`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CmdOptions {
    /// Replace underscores with hyphens in flag names.
    pub hyphenate: bool,
    /// Require the last printed line to start with this prefix; commands
    /// that report outcome only via free text signal success this way.
    pub expect: Option<&'static str>,
}

impl CmdOptions {
    pub fn expect(prefix: &'static str) -> Self {
        Self {
            hyphenate: false,
            expect: Some(prefix),
        }
    }

    pub fn hyphenated(mut self) -> Self {
        self.hyphenate = true;
        self
    }
}

/// Normalizing wrapper around a [`CommandRunner`].
pub struct CmdClient {
    runner: Arc<dyn CommandRunner>,
    // The runner captures output through shared buffers and is not safe to
    // invoke concurrently; the guard spans the full request/retry cycle.
    lock: Mutex<()>,
    url: String,
    api_key: Option<String>,
}

impl CmdClient {
    pub fn new(runner: Arc<dyn CommandRunner>, api_key: Option<String>, url: Option<String>) -> Self {
        Self {
            runner,
            lock: Mutex::new(()),
            url: url.unwrap_or_else(|| DEFAULT_SERVER_URL.to_string()),
            api_key: resolve_api_key(api_key),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_authenticated(&self) -> bool {
        self.api_key.is_some()
    }

    /// Execute one marketplace command, returning the printed lines and
    /// rendered tables.
    pub async fn cmd(&self, name_parts: &[&str], flags: &Flags, opts: CmdOptions) -> Result<CmdOutput> {
        let mut argv: Vec<String> = vec!["--url".to_string(), self.url.clone()];
        if let Some(key) = &self.api_key {
            argv.push("--api-key".to_string());
            argv.push(key.clone());
        }
        argv.extend(name_parts.iter().map(|p| p.to_string()));
        argv.extend(flags.render(opts.hyphenate));

        let _guard = self.lock.lock().await;
        let output = loop {
            match self.runner.run(&argv).await {
                Ok(output) => break output,
                Err(HttpError::RateLimited) => {
                    warn!("rate limited, retrying in {:?}", RATE_LIMIT_BACKOFF);
                    tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
                }
                Err(err) => return Err(err.into()),
            }
        };

        if let Some(prefix) = opts.expect {
            let confirmed = output
                .lines
                .last()
                .map(|line| line.starts_with(prefix))
                .unwrap_or(false);
            if !confirmed {
                return Err(ApiError::CommandFailed {
                    lines: output.lines,
                });
            }
        }

        Ok(output)
    }
}
