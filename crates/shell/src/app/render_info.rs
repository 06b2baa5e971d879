use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

const SCAN_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_INTERVAL: Duration = Duration::from_secs(15);
const REQUEST_DELAY_PER_AVATAR: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionStatus {
    pub id: RegionId,
    pub alive: bool,
    pub capabilities_received: bool,
}

/// Regions and avatar render-cost reporting, as seen by the idle phase.
pub trait RenderInfoRegions {
    fn regions(&self) -> Vec<RegionStatus>;
    fn avatar_count(&self) -> usize;
    fn send_render_info(&mut self, region: RegionId);
    fn request_render_info(&mut self, region: RegionId);
    /// Regions whose capabilities arrived since the last call.
    fn take_new_capabilities(&mut self) -> Vec<RegionId> {
        Vec::new()
    }
}

/// Decides when each region gets a render-info exchange.
#[derive(Debug, Clone, Default)]
pub struct RenderInfoScheduler {
    next_scan: Option<Instant>,
    next_request: HashMap<RegionId, Instant>,
}

impl RenderInfoScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces the next `idle` to scan and to request from `region` at once.
    pub fn expire_region(&mut self, region: RegionId) {
        debug!(region = region.0, "render_info_region_expired");
        self.next_scan = None;
        self.next_request.remove(&region);
    }

    /// Returns how many regions were asked for render info.
    pub fn idle(&mut self, regions: &mut dyn RenderInfoRegions, now: Instant) -> usize {
        for region in regions.take_new_capabilities() {
            self.expire_region(region);
        }

        if self.next_scan.is_some_and(|at| now < at) {
            return 0;
        }

        let statuses = regions.regions();
        self.next_request
            .retain(|id, _| statuses.iter().any(|status| status.id == *id));

        let interval = REQUEST_INTERVAL
            .saturating_add(REQUEST_DELAY_PER_AVATAR.saturating_mul(
                u32::try_from(regions.avatar_count()).unwrap_or(u32::MAX),
            ));
        let mut requested = 0;
        for status in statuses {
            if !status.alive || !status.capabilities_received {
                continue;
            }
            let due = self
                .next_request
                .get(&status.id)
                .map_or(true, |at| now >= *at);
            if !due {
                continue;
            }
            regions.send_render_info(status.id);
            regions.request_render_info(status.id);
            self.next_request.insert(status.id, now + interval);
            requested += 1;
        }

        self.next_scan = Some(now + SCAN_INTERVAL);
        requested
    }
}
