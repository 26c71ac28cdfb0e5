use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{StoreResult, TargetStore};
use crate::error::StoreError;
use crate::model::{Frequency, MonitoredTarget, Region, Tick};

/// In-process store for tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    failing_inserts: AtomicU32,
    committed_batches: AtomicU64,
}

#[derive(Default)]
struct Inner {
    regions: Vec<Region>,
    targets: Vec<MonitoredTarget>,
    ticks: Vec<Tick>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a region (or return the existing one with that name).
    pub fn add_region(&self, name: &str) -> Region {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.regions.iter().find(|r| r.name == name) {
            return existing.clone();
        }
        let region = Region {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
        };
        inner.regions.push(region.clone());
        region
    }

    /// Register a target for `regions`, creating any region not seen yet.
    pub fn add_target(&self, url: &str, frequency: Frequency, regions: &[&str]) -> MonitoredTarget {
        let regions = regions.iter().map(|name| self.add_region(name)).collect();
        let target = MonitoredTarget {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            frequency,
            regions,
        };
        self.inner.write().targets.push(target.clone());
        target
    }

    /// Make the next `count` batch inserts fail without writing anything.
    pub fn fail_next_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Number of successfully committed insert transactions.
    pub fn committed_batches(&self) -> u64 {
        self.committed_batches.load(Ordering::SeqCst)
    }

    pub fn ticks(&self) -> Vec<Tick> {
        self.inner.read().ticks.clone()
    }

    fn region_id(&self, name: &str) -> Option<String> {
        self.inner
            .read()
            .regions
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.id.clone())
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    async fn targets_by_frequency(&self, tier: Frequency) -> StoreResult<Vec<MonitoredTarget>> {
        Ok(self
            .inner
            .read()
            .targets
            .iter()
            .filter(|t| t.frequency == tier)
            .cloned()
            .collect())
    }

    async fn region_by_name(&self, name: &str) -> StoreResult<Region> {
        self.inner
            .read()
            .regions
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("region `{name}`")))
    }

    async fn batch_insert_ticks(&self, ticks: &[Tick]) -> StoreResult<u64> {
        let injected = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("batch insert".into()));
        }

        self.inner.write().ticks.extend_from_slice(ticks);
        self.committed_batches.fetch_add(1, Ordering::SeqCst);
        Ok(ticks.len() as u64)
    }

    async fn latest_statuses(&self, website_id: &str, limit: usize) -> StoreResult<Vec<Tick>> {
        let mut ticks: Vec<Tick> = self
            .inner
            .read()
            .ticks
            .iter()
            .filter(|t| t.website_id == website_id)
            .cloned()
            .collect();
        ticks.sort_by_key(|t| t.time);

        let skip = ticks.len().saturating_sub(limit);
        Ok(ticks.split_off(skip))
    }

    async fn ticks_between(
        &self,
        website_id: &str,
        region: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Tick>> {
        let region_id = match region {
            Some(name) => match self.region_id(name) {
                Some(id) => Some(id),
                // Unknown region has no ticks
                None => return Ok(Vec::new()),
            },
            None => None,
        };

        let mut ticks: Vec<Tick> = self
            .inner
            .read()
            .ticks
            .iter()
            .filter(|t| t.website_id == website_id)
            .filter(|t| region_id.as_deref().map_or(true, |id| t.region_id == id))
            .filter(|t| t.time >= from && t.time <= to)
            .cloned()
            .collect();
        ticks.sort_by_key(|t| t.time);
        Ok(ticks)
    }
}
