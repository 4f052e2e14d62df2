use crate::errors::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Increment added on top of the market minimum so a default bid clears.
pub const BID_EPSILON: f64 = 0.0001;

/// Pricing mode an instance is rented under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceType {
    /// Fixed price, not subject to outbidding.
    OnDemand,
    /// Auction priced; may be reclaimed when outbid.
    Interruptible,
    /// Explicit bid variant of interruptible pricing.
    Bid,
}

impl InstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::OnDemand => "on-demand",
            InstanceType::Interruptible => "interruptible",
            InstanceType::Bid => "bid",
        }
    }

    /// Whether instances of this type participate in the spot auction.
    pub fn is_bid_priced(&self) -> bool {
        !matches!(self, InstanceType::OnDemand)
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-demand" => Ok(InstanceType::OnDemand),
            "interruptible" => Ok(InstanceType::Interruptible),
            "bid" => Ok(InstanceType::Bid),
            other => Err(CoreError::InvalidInput(format!(
                "unknown instance type: {}",
                other
            ))),
        }
    }
}

/// A point-in-time snapshot of a rentable machine returned by offer search.
///
/// Immutable once returned; consumed exactly once to create an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: i64,
    pub machine_id: i64,
    #[serde(default)]
    pub dph_total: f64,
    #[serde(default)]
    pub min_bid: f64,
    #[serde(default)]
    pub num_gpus: i64,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub cuda_max_good: Option<f64>,
    #[serde(default)]
    pub disk_space: Option<f64>,
    #[serde(default)]
    pub inet_down: Option<f64>,
    #[serde(default)]
    pub reliability: Option<f64>,
    #[serde(default)]
    pub dlperf: Option<f64>,

    /// Fields the server sends that we do not model explicitly.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// One row of the owned-instance listing.
///
/// Refreshed wholesale on every poll; local derivations (outbid, accrued
/// cost) are recomputed from it by the caller after each replace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: i64,
    pub machine_id: i64,
    /// Coarse lifecycle state reported by the provider.
    #[serde(default)]
    pub actual_status: Option<String>,
    /// State the provider is driving the instance toward.
    #[serde(default)]
    pub intended_status: Option<String>,
    #[serde(default)]
    pub next_state: Option<String>,
    /// Free-text elaboration of the coarse status.
    #[serde(default)]
    pub status_msg: Option<String>,
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub dph_total: f64,
    #[serde(default)]
    pub min_bid: f64,
    #[serde(default)]
    pub is_bid: bool,
    /// Rental start, unix seconds.
    #[serde(default)]
    pub start_date: Option<f64>,
    #[serde(default)]
    pub image_uuid: Option<String>,
    #[serde(default)]
    pub label: Option<String>,

    /// Fields the server sends that we do not model explicitly.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl InstanceSnapshot {
    /// Fill in placeholder status text for rows the provider has not
    /// populated yet: no coarse status means the machine is still loading,
    /// and a missing detail message becomes "<Status>...".
    pub fn normalize(&mut self) {
        if self.actual_status.is_none() {
            self.actual_status = Some("initializing".to_string());
        }
        if self.status_msg.is_none() {
            let status = self.actual_status.as_deref().unwrap_or("initializing");
            self.status_msg = Some(format!("{}...", title_case(status)));
        }
        if let Some(msg) = &self.status_msg {
            self.status_msg = Some(msg.trim().to_string());
        }
    }

    pub fn ssh_url(&self) -> Option<String> {
        match (&self.ssh_host, self.ssh_port) {
            (Some(host), Some(port)) => Some(format!("ssh://root@{}:{}", host, port)),
            _ => None,
        }
    }

    pub fn scp_url(&self) -> Option<String> {
        match (&self.ssh_host, self.ssh_port) {
            (Some(host), Some(port)) => Some(format!("scp://root@{}:{}", host, port)),
            _ => None,
        }
    }
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Version/compatibility metadata for one tag of a container image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerTag {
    pub name: String,
    #[serde(default)]
    pub min_cuda: Option<f64>,
    #[serde(default)]
    pub max_cuda: Option<f64>,
    /// Provider-side filter clauses to append to a search query,
    /// property -> operator -> value.
    #[serde(default)]
    pub extra_filters: Option<HashMap<String, HashMap<String, Value>>>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Policy for sniffing error markers out of free-text status messages.
///
/// The case-sensitive form looks for "Error" and is the default: image names
/// legitimately containing the lowercase word "error" would otherwise
/// trigger a false fatal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMatch {
    #[default]
    CaseSensitive,
    CaseInsensitive,
}

impl ErrorMatch {
    pub fn matches(&self, status_msg: &str) -> bool {
        match self {
            ErrorMatch::CaseSensitive => status_msg.contains("Error"),
            ErrorMatch::CaseInsensitive => status_msg.to_lowercase().contains("error"),
        }
    }
}

/// True when a bid-priced instance is paying less than the market now clears
/// at, i.e. the rental is about to be reclaimed.
pub fn is_outbid(min_bid: f64, dph_total: f64, bid_priced: bool) -> bool {
    bid_priced && min_bid + BID_EPSILON > dph_total
}

/// Upper bound on spend so far: hourly price times elapsed hours.
pub fn accrued_cost(dph_total: f64, start_date: f64, now: f64) -> f64 {
    (dph_total / 3600.0 * (now - start_date)).max(0.0)
}
