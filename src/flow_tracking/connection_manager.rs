//! # Connection Manager
//!
//! The aggregation core. Observations are folded into a small pending map keyed by flow, and a
//! periodic merge moves those deltas into the persistent per-flow statistics and refreshes the
//! thresholded view.
//!
//! ```text
//! ┌──────────────┐ update_stats ┌──────────────┐ apply_pending_updates ┌──────────────┐
//! │ capture path │─────────────▶│ PendingDelta │──────────────────────▶│ FlowStats    │
//! └──────────────┘              └──────────────┘                       │ FlowView     │
//!                                                                      └──────────────┘
//! ```
//!
//! ## Locking
//!
//! Two short-held mutexes guard the maps: one for the pending deltas (the only lock the capture
//! path ever takes) and one for the statistics and views. Neither is held while geolocation or
//! formatting runs; a merge releases the table lock, prepares the new view data, and re-acquires
//! it to publish. Merges themselves are serialized by a third lock that producers never touch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, trace};

use super::byte_formatter::format_bytes;
use super::types::{ByteDelta, FlowKey, FlowStats, FlowView, GeoInfo, Snapshot};
use crate::configuration::types::EvictionPolicy;
use crate::geolocation::GeoResolver;

const ACTIVITY_FORMAT: &str = "%H:%M:%S";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Default)]
struct FlowTable {
    stats: HashMap<FlowKey, FlowStats>,
    views: HashMap<FlowKey, FlowView>,
}

/// View data computed outside the table lock during a merge.
struct PreparedView {
    key: FlowKey,
    total_bytes: u64,
    last_activity: DateTime<Local>,
    formatted_traffic: String,
    last_activity_display: String,
    geo: Option<GeoInfo>,
}

/// Outcome of one merge cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub flows_merged: usize,
    pub views_created: usize,
}

/// Owns per-flow statistics, the pending-update buffer and the thresholded view projection.
///
/// Every method takes `&self`; the manager is shared behind an `Arc` between the capture
/// handoff and the scheduler.
pub struct ConnectionManager {
    min_bytes_threshold: u64,
    eviction: EvictionPolicy,
    resolver: Arc<dyn GeoResolver>,
    pending: Mutex<HashMap<FlowKey, ByteDelta>>,
    table: Mutex<FlowTable>,
    merge_lock: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        min_bytes_threshold: u64,
        eviction: EvictionPolicy,
        resolver: Arc<dyn GeoResolver>,
    ) -> Self {
        Self {
            min_bytes_threshold,
            eviction,
            resolver,
            pending: Mutex::new(HashMap::new()),
            table: Mutex::new(FlowTable::default()),
            merge_lock: Mutex::new(()),
        }
    }

    pub fn min_bytes_threshold(&self) -> u64 {
        self.min_bytes_threshold
    }

    /// Buffers `delta` for `key` until the next merge.
    ///
    /// Only the pending-map lock is taken, for the duration of one hash map update.
    pub fn update_stats(&self, key: FlowKey, delta: ByteDelta) {
        lock(&self.pending).entry(key).or_default().accumulate(delta);
    }

    /// Folds every pending delta into the persistent statistics, stamped with the current time.
    pub fn apply_pending_updates(&self) -> MergeReport {
        self.apply_pending_updates_at(Local::now())
    }

    /// Merge cycle with an explicit clock reading.
    ///
    /// For each pending flow the totals grow by the buffered delta and `last_activity` becomes
    /// `now`. A flow whose total reaches the threshold gets a view entry (geolocation is resolved
    /// only at that moment); an existing view only has its traffic and activity display
    /// refreshed. The pending map is empty afterwards.
    pub fn apply_pending_updates_at(&self, now: DateTime<Local>) -> MergeReport {
        let _merge = lock(&self.merge_lock);

        let batch = std::mem::take(&mut *lock(&self.pending));
        if batch.is_empty() {
            return MergeReport::default();
        }
        let flows_merged = batch.len();

        // (key, total, last_activity, needs a new view)
        let mut qualifying = Vec::new();
        {
            let mut guard = lock(&self.table);
            let table = &mut *guard;
            for (key, delta) in batch {
                let stats = table
                    .stats
                    .entry(key)
                    .or_insert_with(|| FlowStats::new(key, now));
                stats.absorb(delta, now);

                if stats.total_bytes() >= self.min_bytes_threshold {
                    let needs_view = !table.views.contains_key(&key);
                    qualifying.push((key, stats.total_bytes(), stats.last_activity, needs_view));
                }
            }
        }

        let prepared: Vec<PreparedView> = qualifying
            .into_iter()
            .map(|(key, total_bytes, last_activity, needs_view)| PreparedView {
                key,
                total_bytes,
                last_activity,
                formatted_traffic: format_bytes(total_bytes),
                last_activity_display: last_activity.format(ACTIVITY_FORMAT).to_string(),
                geo: needs_view.then(|| self.resolver.resolve(key.remote_ip())),
            })
            .collect();

        let mut views_created = 0;
        {
            let mut guard = lock(&self.table);
            let table = &mut *guard;
            for view in prepared {
                // cleared or evicted while the lock was released
                if !table.stats.contains_key(&view.key) {
                    continue;
                }
                match table.views.get_mut(&view.key) {
                    Some(existing) => {
                        existing.formatted_traffic = view.formatted_traffic;
                        existing.last_activity_display = view.last_activity_display;
                        existing.total_bytes = view.total_bytes;
                        existing.last_activity = view.last_activity;
                        existing.hidden = false;
                    }
                    None => {
                        if let Some(geo) = view.geo {
                            trace!("New flow in view: {}", view.key);
                            table.views.insert(
                                view.key,
                                FlowView {
                                    key: view.key,
                                    remote_identifier: view.key.to_string(),
                                    formatted_traffic: view.formatted_traffic,
                                    last_activity_display: view.last_activity_display,
                                    geo,
                                    total_bytes: view.total_bytes,
                                    last_activity: view.last_activity,
                                    hidden: false,
                                },
                            );
                            views_created += 1;
                        }
                    }
                }
            }
        }

        debug!(
            "Merged {} pending flows, {} new view entries",
            flows_merged, views_created
        );
        MergeReport {
            flows_merged,
            views_created,
        }
    }

    /// Evicts flows idle for longer than `timeout`, measured from the current time.
    pub fn remove_inactive_connections(&self, timeout: Duration) -> usize {
        self.remove_inactive_connections_at(timeout, Local::now())
    }

    /// Evicts exactly the flows whose `last_activity` is older than `now - timeout`.
    ///
    /// With [`EvictionPolicy::Remove`] their statistics and view entries are deleted. With
    /// [`EvictionPolicy::Hide`] the view entries are only flagged hidden and the history is kept.
    /// Returns the number of flows removed or newly hidden.
    pub fn remove_inactive_connections_at(&self, timeout: Duration, now: DateTime<Local>) -> usize {
        let cutoff = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_sub_signed(t));
        let Some(cutoff) = cutoff else {
            return 0;
        };

        let mut guard = lock(&self.table);
        let table = &mut *guard;
        let stale: Vec<FlowKey> = table
            .stats
            .values()
            .filter(|s| s.last_activity < cutoff)
            .map(|s| s.key)
            .collect();

        let affected = match self.eviction {
            EvictionPolicy::Remove => {
                for key in &stale {
                    table.stats.remove(key);
                    table.views.remove(key);
                }
                stale.len()
            }
            EvictionPolicy::Hide => {
                let mut hidden = 0;
                for key in &stale {
                    match table.views.get_mut(key) {
                        Some(view) => {
                            if !view.hidden {
                                view.hidden = true;
                                hidden += 1;
                            }
                        }
                        // below the threshold: nothing to keep hidden
                        None => {
                            table.stats.remove(key);
                        }
                    }
                }
                hidden
            }
        };

        if affected > 0 {
            debug!("Evicted {} inactive flows ({:?})", affected, self.eviction);
        }
        affected
    }

    /// Empties statistics, views and pending deltas. Idempotent.
    pub fn clear(&self) {
        let mut pending = lock(&self.pending);
        let mut table = lock(&self.table);
        pending.clear();
        table.stats.clear();
        table.views.clear();
    }

    /// Visible view entries, most recent activity first.
    pub fn snapshot(&self) -> Snapshot {
        let mut flows: Vec<FlowView> = {
            let table = lock(&self.table);
            table.views.values().filter(|v| !v.hidden).cloned().collect()
        };
        flows.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.key.cmp(&b.key))
        });
        Snapshot {
            taken_at: Local::now(),
            flows,
        }
    }

    pub fn stats(&self, key: &FlowKey) -> Option<FlowStats> {
        lock(&self.table).stats.get(key).cloned()
    }

    pub fn view(&self, key: &FlowKey) -> Option<FlowView> {
        lock(&self.table).views.get(key).cloned()
    }

    pub fn flow_count(&self) -> usize {
        lock(&self.table).stats.len()
    }

    pub fn view_count(&self) -> usize {
        lock(&self.table).views.len()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}
