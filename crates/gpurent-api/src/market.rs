//! Typed facade over the normalized marketplace commands.
//!
//! Every method is a single round trip: one normalized call with a fixed
//! success prefix (or none, for reads) and a deterministic shape transform
//! of the returned table. No polling or state lives here.

use crate::args::Flags;
use crate::client::{CmdClient, CmdOptions};
use crate::errors::{ApiError, HttpError, Result};
use crate::runner::CommandRunner;
use gpurent_core::{split_query, DockerTag, InstanceSnapshot, InstanceType, Offer};
use log::{debug, warn};
use reqwest::StatusCode;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(1);

/// One end of a copy operation: a local path, or a path on an instance.
#[derive(Debug, Clone)]
pub enum CopyPath {
    Local(String),
    Remote { instance_id: i64, path: String },
}

impl CopyPath {
    pub fn local(path: impl Into<String>) -> Self {
        CopyPath::Local(path.into())
    }

    pub fn remote(instance_id: i64, path: impl Into<String>) -> Self {
        CopyPath::Remote {
            instance_id,
            path: path.into(),
        }
    }
}

impl fmt::Display for CopyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyPath::Local(path) => f.write_str(path),
            CopyPath::Remote { instance_id, path } => write!(f, "{}:{}", instance_id, path),
        }
    }
}

/// Optional knobs for [`Marketplace::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub label: Option<String>,
    pub onstart: Option<String>,
    pub onstart_cmd: Option<String>,
    pub jupyter: bool,
    pub jupyter_dir: Option<String>,
    pub jupyter_lab: bool,
    pub lang_utf8: bool,
    pub python_utf8: bool,
    pub extra: Option<String>,
    pub create_from: Option<String>,
    pub force: bool,
}

/// Pricing knobs when listing a machine for rent (host side).
#[derive(Debug, Clone, Default)]
pub struct ListMachineOptions {
    pub price_gpu: Option<f64>,
    pub price_disk: Option<f64>,
    pub price_inetu: Option<f64>,
    pub price_inetd: Option<f64>,
    pub min_chunk: Option<i64>,
    pub end_date: Option<String>,
}

/// Client facade for the GPU marketplace.
#[derive(Clone)]
pub struct Marketplace {
    cmd: Arc<CmdClient>,
    http: reqwest::Client,
}

impl Marketplace {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        api_key: Option<String>,
        url: Option<String>,
    ) -> Self {
        Self {
            cmd: Arc::new(CmdClient::new(runner, api_key, url)),
            http: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        self.cmd.url()
    }

    /// Search rentable offers matching `query`, ordered by `sort` with the
    /// best candidate at index 0. A successful search prints nothing but
    /// the table, so any printed line signals failure.
    pub async fn offers(
        &self,
        instance_type: InstanceType,
        storage_gib: f64,
        sort: &str,
        query: &str,
    ) -> Result<Vec<Offer>> {
        let mut parts = vec!["search", "offers", "--no-default"];
        let tokens = split_query(query);
        parts.extend(tokens.iter().map(String::as_str));

        let flags = Flags::new()
            .value("type", instance_type.as_str())
            .value("storage", storage_gib)
            .value("order", sort);

        let output = self
            .cmd
            .cmd(&parts, &flags, CmdOptions::default().hyphenated())
            .await?;

        if !output.lines.is_empty() {
            return Err(ApiError::CommandFailed {
                lines: output.lines,
            });
        }

        let records = output
            .tables
            .into_iter()
            .next()
            .map(|t| t.records)
            .unwrap_or_default();
        let offers = serde_json::from_value(Value::Array(records))?;
        Ok(offers)
    }

    /// All instances owned by the caller, as full listing snapshots.
    pub async fn instances(&self) -> Result<Vec<InstanceSnapshot>> {
        let output = self
            .cmd
            .cmd(&["show", "instances"], &Flags::new(), CmdOptions::default())
            .await?;

        let records = output
            .tables
            .into_iter()
            .next()
            .map(|t| t.records)
            .unwrap_or_default();
        let snapshots = serde_json::from_value(Value::Array(records))?;
        Ok(snapshots)
    }

    /// Rent `offer_id`. On success the provider prints a confirmation line
    /// with an embedded payload carrying the new instance id.
    pub async fn create(
        &self,
        offer_id: i64,
        image: &str,
        disk_gb: f64,
        price: Option<f64>,
        opts: &CreateOptions,
    ) -> Result<i64> {
        let id = offer_id.to_string();
        let parts = ["create", "instance", id.as_str()];

        // Prices are quoted in $/h to four decimal places.
        let flags = Flags::new()
            .opt("price", price.map(|p| format!("{:.4}", p)))
            .value("disk", disk_gb)
            .value("image", image)
            .opt("label", opts.label.clone())
            .opt("onstart", opts.onstart.clone())
            .opt("onstart_cmd", opts.onstart_cmd.clone())
            .switch("jupyter", opts.jupyter)
            .opt("jupyter_dir", opts.jupyter_dir.clone())
            .switch("jupyter_lab", opts.jupyter_lab)
            .switch("lang_utf8", opts.lang_utf8)
            .switch("python_utf8", opts.python_utf8)
            .opt("extra", opts.extra.clone())
            .opt("create_from", opts.create_from.clone())
            .switch("force", opts.force);

        let output = self
            .cmd
            .cmd(&parts, &flags, CmdOptions::expect("Started. ").hyphenated())
            .await?;

        let line = output
            .lines
            .last()
            .ok_or_else(|| ApiError::MalformedOutput("empty create confirmation".to_string()))?;
        let contract = parse_creation_payload(line)?;
        debug!("created instance {}", contract);
        Ok(contract)
    }

    pub async fn start(&self, instance_id: i64) -> Result<()> {
        self.confirm(&["start", "instance"], instance_id, "starting instance")
            .await
    }

    pub async fn stop(&self, instance_id: i64) -> Result<()> {
        self.confirm(&["stop", "instance"], instance_id, "stopping instance ")
            .await
    }

    /// Destroy an instance. Irreversible; deletes its data.
    pub async fn destroy(&self, instance_id: i64) -> Result<()> {
        self.confirm(&["destroy", "instance"], instance_id, "destroying instance ")
            .await
    }

    /// Destroy every instance the caller owns.
    pub async fn destroy_all(&self) -> Result<()> {
        for snapshot in self.instances().await? {
            self.destroy(snapshot.id).await?;
        }
        Ok(())
    }

    /// Assign a string label to an instance.
    pub async fn label(&self, instance_id: i64, label: &str) -> Result<()> {
        let id = instance_id.to_string();
        self.cmd
            .cmd(
                &["label", "instance", &id, label],
                &Flags::new(),
                CmdOptions::expect("label for "),
            )
            .await?;
        Ok(())
    }

    /// Change the bid price of a spot instance. Without an explicit price
    /// the provider picks a winning bid.
    pub async fn change_bid(&self, instance_id: i64, price: Option<f64>) -> Result<()> {
        let id = instance_id.to_string();
        let flags = Flags::new().opt("price", price.map(|p| format!("{:.4}", p)));
        self.cmd
            .cmd(
                &["change", "bid", &id],
                &flags,
                CmdOptions::expect("Per gpu bid price changed"),
            )
            .await?;
        Ok(())
    }

    /// [Host] Set the minimum bid/rental price of a machine.
    pub async fn set_min_bid(&self, machine_id: i64, price: Option<f64>) -> Result<()> {
        let id = machine_id.to_string();
        let flags = Flags::new().opt("price", price.map(|p| format!("{:.4}", p)));
        self.cmd
            .cmd(
                &["set", "min_bid", &id],
                &flags,
                CmdOptions::expect("Per gpu min bid price changed"),
            )
            .await?;
        Ok(())
    }

    /// Copy a directory between any mix of local paths and instances.
    pub async fn copy(&self, src: CopyPath, dst: CopyPath) -> Result<()> {
        let src = src.to_string();
        let dst = dst.to_string();
        self.cmd
            .cmd(
                &["copy", &src, &dst],
                &Flags::new(),
                CmdOptions::expect("Remote to Remote copy initiated"),
            )
            .await?;
        Ok(())
    }

    /// [Host] List a machine for rent.
    pub async fn list_machine(&self, machine_id: i64, opts: &ListMachineOptions) -> Result<()> {
        let id = machine_id.to_string();
        let flags = Flags::new()
            .opt("price_gpu", opts.price_gpu)
            .opt("price_disk", opts.price_disk)
            .opt("price_inetu", opts.price_inetu)
            .opt("price_inetd", opts.price_inetd)
            .opt("min_chunk", opts.min_chunk)
            .opt("end_date", opts.end_date.clone());
        self.cmd
            .cmd(
                &["list", "machine", &id],
                &flags,
                CmdOptions::expect("offers created"),
            )
            .await?;
        Ok(())
    }

    /// [Host] Remove a machine from the rental listing.
    pub async fn unlist_machine(&self, machine_id: i64) -> Result<()> {
        self.confirm(&["unlist", "machine"], machine_id, "all offers for machine")
            .await
    }

    /// [Host] Create default jobs for a machine.
    pub async fn set_defjob(
        &self,
        machine_id: i64,
        price_gpu: Option<f64>,
        price_inetu: Option<f64>,
        price_inetd: Option<f64>,
        image: Option<&str>,
        args: Option<&str>,
    ) -> Result<()> {
        let id = machine_id.to_string();
        let flags = Flags::new()
            .opt("price_gpu", price_gpu)
            .opt("price_inetu", price_inetu)
            .opt("price_inetd", price_inetd)
            .opt("image", image)
            .opt("args", args);
        self.cmd
            .cmd(
                &["set", "defjob", &id],
                &flags,
                CmdOptions::expect("bids created for machine "),
            )
            .await?;
        Ok(())
    }

    /// [Host] Delete a machine's default jobs.
    pub async fn remove_defjob(&self, machine_id: i64) -> Result<()> {
        self.confirm(
            &["remove", "defjob"],
            machine_id,
            "default instances for machine",
        )
        .await
    }

    /// Stats for the logged-in user.
    pub async fn user(&self) -> Result<Value> {
        let output = self
            .cmd
            .cmd(&["show", "user"], &Flags::new(), CmdOptions::default())
            .await?;
        output
            .tables
            .into_iter()
            .next()
            .and_then(|t| t.records.into_iter().next())
            .ok_or_else(|| ApiError::MalformedOutput("no user record returned".to_string()))
    }

    /// [Host] Machines the caller offers for rent. With `ids_only` the
    /// command prints one machine id per line instead of a table.
    pub async fn machines(&self, ids_only: bool) -> Result<Vec<Value>> {
        let flags = Flags::new().switch("quiet", ids_only);
        let output = self
            .cmd
            .cmd(&["show", "machines"], &flags, CmdOptions::default())
            .await?;

        if ids_only {
            let mut ids = Vec::new();
            for line in &output.lines {
                let id: i64 = line.trim().parse().map_err(|_| {
                    ApiError::MalformedOutput(format!("expected machine id, got {:?}", line))
                })?;
                ids.push(Value::from(id));
            }
            return Ok(ids);
        }

        Ok(output
            .tables
            .into_iter()
            .next()
            .map(|t| t.records)
            .unwrap_or_default())
    }

    /// Payment and charge history. Returns the history rows plus the
    /// current (not yet invoiced) charges.
    pub async fn invoices(
        &self,
        start_date: Option<&str>,
        end_date: Option<&str>,
        only_charges: bool,
        only_credits: bool,
    ) -> Result<(Vec<Value>, f64)> {
        let flags = Flags::new()
            .opt("start_date", start_date)
            .opt("end_date", end_date)
            .switch("only_charges", only_charges)
            .switch("only_credits", only_credits);
        let output = self
            .cmd
            .cmd(&["show", "invoices"], &flags, CmdOptions::default())
            .await?;

        // The summary line trails the table: "Current: $12.34".
        let current_charges = output
            .lines
            .last()
            .and_then(|line| line.split_whitespace().last())
            .and_then(|token| token.trim_start_matches('$').parse::<f64>().ok())
            .ok_or_else(|| {
                ApiError::MalformedOutput("missing current-charges summary".to_string())
            })?;

        let rows = output
            .tables
            .into_iter()
            .next()
            .map(|t| t.records)
            .unwrap_or_default();
        Ok((rows, current_charges))
    }

    /// SSH connection URL of the caller's instance.
    pub async fn ssh_url(&self) -> Result<String> {
        self.connection_url("ssh://").await
    }

    /// SCP connection URL of the caller's instance.
    pub async fn scp_url(&self) -> Result<String> {
        self.connection_url("scp://").await
    }

    /// Persist an API key through the vendor CLI.
    pub async fn set_api_key(&self, new_api_key: &str) -> Result<()> {
        self.cmd
            .cmd(
                &["set", "api_key", new_api_key],
                &Flags::new(),
                CmdOptions::expect("Your api key has been saved in "),
            )
            .await?;
        Ok(())
    }

    /// Version/compatibility metadata for a container image reference.
    /// Fetched from the metadata endpoint directly, not through the
    /// command runner. `image:tag` selects that tag, bare `image` the
    /// first one.
    pub async fn docker_tags(&self, image_ref: &str) -> Result<DockerTag> {
        let (image, version) = match image_ref.split_once(':') {
            Some((image, version)) => (image, Some(version)),
            None => (image_ref, None),
        };

        let url = format!("{}/docker/tags/?repo={}", self.cmd.url(), image);
        let response = self.get_with_retry(&url).await?;
        let tags: Vec<DockerTag> = response.json().await.map_err(HttpError::Request)?;

        match version {
            None => tags
                .into_iter()
                .next()
                .ok_or_else(|| ApiError::NotFound(format!("no tags for image {}", image))),
            Some(version) => tags
                .into_iter()
                .find(|tag| tag.name == version)
                .ok_or_else(|| ApiError::NotFound(format!("tag {}:{}", image, version))),
        }
    }

    /// Current clearing bid for an offer.
    pub async fn offer_bid_price(&self, offer_id: i64) -> Result<f64> {
        let url = format!("{}/bundles_bid_price/{}/", self.cmd.url(), offer_id);
        loop {
            let response = self
                .http
                .put(&url)
                .json(&serde_json::json!({}))
                .send()
                .await
                .map_err(HttpError::Request)?;
            match self.check_status(response).await? {
                Some(response) => {
                    let text = response.text().await.map_err(HttpError::Request)?;
                    return text.trim().parse::<f64>().map_err(|_| {
                        ApiError::MalformedOutput(format!("expected bid price, got {:?}", text))
                    });
                }
                None => continue,
            }
        }
    }

    async fn connection_url(&self, scheme: &str) -> Result<String> {
        let output = self
            .cmd
            .cmd(&["ssh-url"], &Flags::new(), CmdOptions::default())
            .await?;
        match output.lines.first() {
            Some(line) if line.contains(scheme) => Ok(line.clone()),
            _ => Err(ApiError::CommandFailed {
                lines: output.lines,
            }),
        }
    }

    async fn confirm(&self, parts: &[&str], id: i64, expect: &'static str) -> Result<()> {
        let id = id.to_string();
        let mut full: Vec<&str> = parts.to_vec();
        full.push(&id);
        self.cmd
            .cmd(&full, &Flags::new(), CmdOptions::expect(expect))
            .await?;
        Ok(())
    }

    /// GET with the same fixed-backoff retry the command path applies to
    /// rate limiting.
    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response> {
        loop {
            let response = self.http.get(url).send().await.map_err(HttpError::Request)?;
            if let Some(response) = self.check_status(response).await? {
                return Ok(response);
            }
        }
    }

    /// Ok(Some) on success, Ok(None) when the caller should retry after
    /// the rate-limit backoff, Err otherwise.
    async fn check_status(&self, response: reqwest::Response) -> Result<Option<reqwest::Response>> {
        let status = response.status();
        if status.is_success() {
            return Ok(Some(response));
        }
        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                warn!("rate limited, retrying in {:?}", RATE_LIMIT_BACKOFF);
                tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
                Ok(None)
            }
            StatusCode::UNAUTHORIZED => Err(HttpError::AuthenticationFailed.into()),
            _ => {
                // Best-effort detail extraction from the response body.
                let message = match response.json::<Value>().await {
                    Ok(body) => body
                        .get("msg")
                        .and_then(|m| m.as_str())
                        .unwrap_or("(no detail message supplied)")
                        .to_string(),
                    Err(_) => "(no detail message supplied)".to_string(),
                };
                Err(HttpError::Status {
                    status: status.as_u16(),
                    message,
                }
                .into())
            }
        }
    }
}

/// The creation confirmation line embeds a structured payload after the
/// prefix, e.g. `Started. {'success': true, 'new_contract': 4242}`. Some
/// provider variants quote it with single quotes, so fall back to a naive
/// requoting pass before giving up.
fn parse_creation_payload(line: &str) -> Result<i64> {
    let payload = line
        .split_once(' ')
        .map(|(_, rest)| rest.trim())
        .unwrap_or("");

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => {
            let requoted = payload.replace('\'', "\"").replace("True", "true");
            serde_json::from_str(&requoted)
                .map_err(|_| ApiError::MalformedOutput(format!("unparseable payload: {}", line)))?
        }
    };

    value
        .get("new_contract")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| ApiError::MalformedOutput(format!("no new_contract in: {}", line)))
}
