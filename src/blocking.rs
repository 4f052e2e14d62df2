//! Blocking variants of the instance lifecycle operations.
//!
//! Same convergence logic as the async API, driven to completion on a
//! private current-thread runtime, for callers outside an async context.
//! Dropping an owned, still-bound blocking instance performs a real
//! synchronous destroy, so scope exit cannot leak a billed resource.

use crate::errors::Result;
use crate::instance::{self, InstanceConfig};
use gpurent_api::Marketplace;
use gpurent_core::{InstanceSnapshot, Offer};
use log::error;
use tokio::runtime::{Builder, Runtime};

pub struct Instance {
    rt: Runtime,
    inner: instance::Instance,
}

impl Instance {
    pub fn new(market: Marketplace, config: InstanceConfig) -> Result<Self> {
        let rt = Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            rt,
            inner: instance::Instance::new(market, config),
        })
    }

    pub fn attach(
        market: Marketplace,
        config: InstanceConfig,
        instance_id: Option<i64>,
        machine_id: Option<i64>,
    ) -> Result<Self> {
        let rt = Builder::new_current_thread().enable_all().build()?;
        let inner = rt.block_on(instance::Instance::attach(
            market,
            config,
            instance_id,
            machine_id,
        ))?;
        Ok(Self { rt, inner })
    }

    pub fn created(&self) -> bool {
        self.inner.created()
    }

    pub fn id(&self) -> Option<i64> {
        self.inner.id()
    }

    pub fn machine_id(&self) -> Option<i64> {
        self.inner.machine_id()
    }

    pub fn snapshot(&self) -> Option<&InstanceSnapshot> {
        self.inner.snapshot()
    }

    pub fn outbid(&self) -> bool {
        self.inner.outbid()
    }

    pub fn max_cost(&self) -> f64 {
        self.inner.max_cost()
    }

    pub fn is_detached(&self) -> bool {
        self.inner.is_detached()
    }

    pub fn create(&mut self, price: Option<f64>, offer: Option<Offer>) -> Result<()> {
        self.rt.block_on(self.inner.create(price, offer))
    }

    pub fn refresh(&mut self) -> Result<()> {
        self.rt.block_on(self.inner.refresh())
    }

    pub fn start(&mut self) -> Result<()> {
        self.rt.block_on(self.inner.start())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.rt.block_on(self.inner.stop())
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.rt.block_on(self.inner.destroy())
    }

    pub fn wait(&mut self, for_status: Option<&str>) -> Result<()> {
        self.rt.block_on(self.inner.wait(for_status))
    }

    pub fn connectable(&self) -> bool {
        self.rt.block_on(self.inner.connectable())
    }

    pub fn create_and_wait(&mut self, price: Option<f64>, offer: Option<Offer>) -> Result<()> {
        self.rt.block_on(self.inner.create_and_wait(price, offer))
    }

    pub fn start_and_wait(&mut self) -> Result<()> {
        self.rt.block_on(self.inner.start_and_wait())
    }

    pub fn stop_and_wait(&mut self) -> Result<()> {
        self.rt.block_on(self.inner.stop_and_wait())
    }

    pub fn upload(&self, src_path: &str, dst_path: &str) -> Result<()> {
        self.rt.block_on(self.inner.upload(src_path, dst_path))
    }

    pub fn download(&self, src_path: &str, dst_path: &str) -> Result<()> {
        self.rt.block_on(self.inner.download(src_path, dst_path))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.inner.is_detached() || !self.inner.created() {
            return;
        }
        if let Err(err) = self.rt.block_on(self.inner.destroy()) {
            error!("scope-exit destroy failed: {}", err);
        }
    }
}
