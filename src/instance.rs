//! Instance lifecycle controller.
//!
//! Owns one remote instance's identity and cached listing snapshot, and
//! drives the create/attach/start/stop/destroy/wait state machine over the
//! marketplace facade. A remote instance moves through an externally-driven
//! sequence (queued, initializing, running or error-flagged, destroyed)
//! that is only observable by polling the listing endpoint; each refresh
//! replaces the snapshot wholesale, diffs status text against the previous
//! poll, and recomputes the locally-derived outbid and cost fields.

use crate::errors::{Error, Result};
use crate::probe;
use gpurent_api::{CopyPath, CreateOptions, Marketplace};
use gpurent_core::{
    accrued_cost, compatibility_query, is_outbid, ErrorMatch, InstanceSnapshot, InstanceType,
    Offer, BID_EPSILON,
};
use log::{error, info, warn};
use std::time::Duration;

const RUNNING_STATUS: &str = "running";

/// Desired configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Base search query; machine blacklisting goes here
    /// (`machine_id!=<id>`).
    pub query: String,
    /// Offer sort key(s), comma separated, best candidate first.
    pub sort: String,
    pub instance_type: InstanceType,
    /// Disk to allocate, GiB.
    pub disk_gib: f64,
    /// Container image reference, optionally `image:tag`.
    pub image: String,
    /// Policy for sniffing error markers out of status text.
    pub error_match: ErrorMatch,
    /// Delay between refreshes while waiting. Multi-second by design: well
    /// under the provider rate limit, responsive enough for boot times
    /// measured in tens of seconds.
    pub poll_interval: Duration,
    /// Per-attempt timeout of the service-port probe.
    pub connect_timeout: Duration,
    /// Optional cap on total wait time. The provider gives no convergence
    /// guarantee, so the default is unbounded.
    pub max_wait: Option<Duration>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            query: "inet_down>=200".to_string(),
            sort: "dph_total".to_string(),
            instance_type: InstanceType::Interruptible,
            disk_gib: 5.0,
            image: "pytorch/pytorch:latest".to_string(),
            error_match: ErrorMatch::default(),
            poll_interval: Duration::from_secs(4),
            connect_timeout: probe::CONNECT_TIMEOUT,
            max_wait: None,
        }
    }
}

/// Handle to at most one remote instance.
///
/// An `Instance` constructed with [`Instance::new`] owns whatever it later
/// creates and is expected to [`destroy`](Instance::destroy) it; one
/// attached to a pre-existing resource never destroys it implicitly.
pub struct Instance {
    market: Marketplace,
    config: InstanceConfig,
    id: Option<i64>,
    machine_id: Option<i64>,
    snapshot: Option<InstanceSnapshot>,
    offer: Option<Offer>,
    outbid: bool,
    max_cost: f64,
    detached: bool,
    end_time: Option<f64>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("config", &self.config)
            .field("id", &self.id)
            .field("machine_id", &self.machine_id)
            .field("snapshot", &self.snapshot)
            .field("offer", &self.offer)
            .field("outbid", &self.outbid)
            .field("max_cost", &self.max_cost)
            .field("detached", &self.detached)
            .field("end_time", &self.end_time)
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// New unbound handle. The object owns the instance it will create and
    /// must eventually destroy it.
    pub fn new(market: Marketplace, config: InstanceConfig) -> Self {
        Self {
            market,
            config,
            id: None,
            machine_id: None,
            snapshot: None,
            offer: None,
            outbid: false,
            max_cost: 0.0,
            detached: false,
            end_time: None,
        }
    }

    /// Attach to a pre-existing instance identified by instance id or
    /// machine id. Fails when no owned instance matches. Attached handles
    /// are externally owned and never destroyed implicitly.
    pub async fn attach(
        market: Marketplace,
        config: InstanceConfig,
        instance_id: Option<i64>,
        machine_id: Option<i64>,
    ) -> Result<Self> {
        let listing = market.instances().await?;
        let found = listing
            .into_iter()
            .find(|s| Some(s.id) == instance_id || Some(s.machine_id) == machine_id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no owned instance with id {:?} or machine id {:?}",
                    instance_id, machine_id
                ))
            })?;

        let mut instance = Self {
            market,
            config,
            id: Some(found.id),
            machine_id: Some(found.machine_id),
            snapshot: None,
            offer: None,
            outbid: false,
            max_cost: 0.0,
            detached: true,
            end_time: None,
        };
        instance.refresh().await?;
        Ok(instance)
    }

    /// True while bound to a live remote instance.
    pub fn created(&self) -> bool {
        self.id.is_some()
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn machine_id(&self) -> Option<i64> {
        self.machine_id
    }

    /// Last observed listing row, replaced wholesale on every refresh.
    pub fn snapshot(&self) -> Option<&InstanceSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn offer(&self) -> Option<&Offer> {
        self.offer.as_ref()
    }

    /// Whether the market minimum has risen above what this bid-priced
    /// instance pays; recomputed on every refresh.
    pub fn outbid(&self) -> bool {
        self.outbid
    }

    /// Non-decreasing upper bound on spend so far, dollars.
    pub fn max_cost(&self) -> f64 {
        self.max_cost
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn running(&self) -> bool {
        self.snapshot
            .as_ref()
            .and_then(|s| s.actual_status.as_deref())
            == Some(RUNNING_STATUS)
    }

    /// Provision a new instance. Requires an unbound handle; a live
    /// binding is never overwritten.
    ///
    /// Without an explicit offer, the search query is the base query plus
    /// the image's compatibility filter and the top-ranked match is taken.
    /// Without an explicit price, bid-priced instances bid the offer
    /// minimum plus a small increment so the bid clears; on-demand pricing
    /// is left to the provider.
    pub async fn create(&mut self, price: Option<f64>, offer: Option<Offer>) -> Result<()> {
        if self.created() {
            return Err(Error::AlreadyBound);
        }

        let offer = match offer {
            Some(offer) => offer,
            None => {
                let tag = self.market.docker_tags(&self.config.image).await?;
                let query = format!("{} {}", compatibility_query(&tag), self.config.query);
                let mut offers = self
                    .market
                    .offers(
                        self.config.instance_type,
                        self.config.disk_gib,
                        &self.config.sort,
                        &query,
                    )
                    .await?;
                if offers.is_empty() {
                    return Err(Error::NoMatchingOffer);
                }
                offers.remove(0)
            }
        };

        self.machine_id = Some(offer.machine_id);

        let price = if self.config.instance_type.is_bid_priced() {
            Some(price.unwrap_or(offer.min_bid + BID_EPSILON))
        } else {
            None
        };

        let id = self
            .market
            .create(
                offer.id,
                &self.config.image,
                self.config.disk_gib,
                price,
                &CreateOptions::default(),
            )
            .await?;

        info!("{}: created instance {}", offer.machine_id, id);
        self.id = Some(id);
        self.offer = Some(offer);
        self.refresh().await?;
        Ok(())
    }

    /// Re-fetch the listing and replace the cached snapshot with the row
    /// matching this instance. No-op while unbound. Logs every status
    /// transition; an error marker in the status text aborts with
    /// [`Error::ErrorStatus`] instead of updating.
    ///
    /// A row that disappears after having been observed means the instance
    /// was destroyed elsewhere and unbinds the handle; a row that has never
    /// appeared yet is [`Error::NotFound`] and keeps the binding, since the
    /// listing can lag a fresh create.
    pub async fn refresh(&mut self) -> Result<()> {
        if !self.created() {
            return Ok(());
        }

        let listing = self.market.instances().await?;
        let found = listing
            .into_iter()
            .find(|s| Some(s.id) == self.id || Some(s.machine_id) == self.machine_id);

        let mut snap = match found {
            Some(snap) => snap,
            None if self.snapshot.is_some() => {
                // Previously observed, now gone: destroyed through another
                // path, so drop the binding.
                warn!("instance {:?} no longer listed, unbinding", self.id);
                self.id = None;
                return Ok(());
            }
            None => {
                // The listing can lag a fresh create by a poll. Keep the
                // binding so destroy() and scope-exit cleanup still reach
                // the billed resource, and let the caller retry.
                return Err(Error::NotFound(format!(
                    "instance {:?} not listed yet",
                    self.id
                )));
            }
        };
        snap.normalize();

        let changed = match &self.snapshot {
            None => true,
            Some(prev) => {
                prev.actual_status != snap.actual_status || prev.status_msg != snap.status_msg
            }
        };
        if changed {
            let status = snap.actual_status.as_deref().unwrap_or("");
            let next = snap.next_state.as_deref().unwrap_or("");
            let msg = snap.status_msg.as_deref().unwrap_or("");
            let logline = format!("{}: {}->{}: {}", snap.machine_id, status, next, msg);
            if self.config.error_match.matches(msg) {
                error!("{}", logline);
                return Err(Error::ErrorStatus {
                    machine_id: snap.machine_id,
                    message: msg.to_string(),
                });
            }
            info!("{}", logline);
        }

        // Full replace first, derived fields second; a reader never sees a
        // fresh snapshot paired with stale derivations.
        self.id = Some(snap.id);
        self.machine_id = Some(snap.machine_id);
        self.outbid = is_outbid(snap.min_bid, snap.dph_total, snap.is_bid);
        if let Some(start) = snap.start_date {
            let cost = accrued_cost(snap.dph_total, start, unix_now());
            self.max_cost = self.max_cost.max(cost);
        }
        self.snapshot = Some(snap);
        Ok(())
    }

    /// Start the instance, creating it first when unbound.
    pub async fn start(&mut self) -> Result<()> {
        if !self.created() {
            self.create(None, None).await?;
        }
        let id = self.id.ok_or(Error::NotBound)?;
        self.market.start(id).await?;
        self.refresh().await
    }

    /// Stop without destroying. Refreshes afterwards so the cached state
    /// reflects the transition.
    pub async fn stop(&mut self) -> Result<()> {
        let id = self.id.ok_or(Error::NotBound)?;
        self.market.stop(id).await?;
        self.refresh().await
    }

    /// Destroy the remote instance and clear the binding. Terminal for
    /// this remote resource: a later `create()` provisions an unrelated
    /// instance. No-op while unbound.
    pub async fn destroy(&mut self) -> Result<()> {
        let id = match self.id {
            Some(id) => id,
            None => return Ok(()),
        };
        self.market.destroy(id).await?;

        let now = unix_now();
        self.end_time = Some(now);
        if let Some(snap) = &self.snapshot {
            if let Some(start) = snap.start_date {
                let hours = ((now - start) / 3600.0).max(0.0);
                self.max_cost = self.max_cost.max(snap.dph_total * hours);
                warn!("{}: max cost was ${:.2} for {:.2}h", id, self.max_cost, hours);
            }
        }
        self.id = None;
        Ok(())
    }

    /// Block until the coarse status reaches `for_status` (or, when none
    /// is given, the instance's own intended status). Reaching the running
    /// state additionally requires the service port to accept connections.
    /// Terminates early with [`Error::Outbid`] when outbid between polls,
    /// and returns when the instance becomes unbound mid-loop.
    pub async fn wait(&mut self, for_status: Option<&str>) -> Result<()> {
        if !self.created() {
            return Ok(());
        }
        let deadline = self
            .config
            .max_wait
            .map(|limit| tokio::time::Instant::now() + limit);

        loop {
            if !self.created() || self.converged(for_status).await {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Error::WaitTimeout);
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
            self.refresh().await?;
            if self.outbid {
                return Err(Error::Outbid);
            }
        }
    }

    /// Probe the instance's reported service endpoint. False for every
    /// kind of failure, including an endpoint not reported yet.
    pub async fn connectable(&self) -> bool {
        let Some(snap) = &self.snapshot else {
            return false;
        };
        match (snap.ssh_host.as_deref(), snap.ssh_port) {
            (Some(host), Some(port)) => {
                probe::tcp_probe(host, port, self.config.connect_timeout).await
            }
            _ => false,
        }
    }

    /// Create, then wait for convergence; a failed wait (error status,
    /// outbid) destroys the instance before propagating so a failed
    /// provisioning attempt never leaks a billed resource.
    pub async fn create_and_wait(&mut self, price: Option<f64>, offer: Option<Offer>) -> Result<()> {
        self.create(price, offer).await?;
        self.wait_or_destroy(None).await
    }

    /// Start (creating first when unbound), then wait; destroys on a
    /// failed wait.
    pub async fn start_and_wait(&mut self) -> Result<()> {
        self.start().await?;
        self.wait_or_destroy(None).await
    }

    /// Stop, then wait for the stop to converge; destroys on a failed wait.
    pub async fn stop_and_wait(&mut self) -> Result<()> {
        self.stop().await?;
        self.wait_or_destroy(None).await
    }

    /// Copy a local path onto this instance.
    pub async fn upload(&self, src_path: &str, dst_path: &str) -> Result<()> {
        let id = self.id.ok_or(Error::NotBound)?;
        self.market
            .copy(CopyPath::local(src_path), CopyPath::remote(id, dst_path))
            .await?;
        Ok(())
    }

    /// Copy a path on this instance to a local destination.
    pub async fn download(&self, src_path: &str, dst_path: &str) -> Result<()> {
        let id = self.id.ok_or(Error::NotBound)?;
        self.market
            .copy(CopyPath::remote(id, src_path), CopyPath::local(dst_path))
            .await?;
        Ok(())
    }

    /// Copy a path on this instance directly onto another instance.
    pub async fn transfer(&self, src_path: &str, other: &Instance, dst_path: &str) -> Result<()> {
        let src_id = self.id.ok_or(Error::NotBound)?;
        let dst_id = other.id.ok_or(Error::NotBound)?;
        self.market
            .copy(
                CopyPath::remote(src_id, src_path),
                CopyPath::remote(dst_id, dst_path),
            )
            .await?;
        Ok(())
    }

    async fn wait_or_destroy(&mut self, for_status: Option<&str>) -> Result<()> {
        match self.wait(for_status).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Err(cleanup) = self.destroy().await {
                    warn!("cleanup destroy failed: {}", cleanup);
                }
                Err(err)
            }
        }
    }

    async fn converged(&self, for_status: Option<&str>) -> bool {
        let Some(snap) = &self.snapshot else {
            return true;
        };
        let actual = snap.actual_status.as_deref().unwrap_or("");
        let target = match for_status {
            Some(target) => target,
            None => match snap.intended_status.as_deref() {
                Some(target) => target,
                // Nothing declared to converge toward.
                None => return true,
            },
        };
        if actual != target {
            return false;
        }
        // Running alone does not guarantee the service port is up yet.
        if actual == RUNNING_STATUS {
            return self.connectable().await;
        }
        true
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let Some(id) = self.id else {
            return;
        };
        // Deterministic cleanup is destroy()'s (or the blocking wrapper's)
        // job; from here the destroy can only be spawned best-effort.
        warn!("owned instance {} dropped without destroy", id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let market = self.market.clone();
            handle.spawn(async move {
                if let Err(err) = market.destroy(id).await {
                    error!("drop-time destroy of instance {} failed: {}", id, err);
                }
            });
        }
    }
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
