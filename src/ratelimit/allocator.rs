//! Session rate allocator
//!
//! Splits the session caps between downloads. Downloads with a fixed cap keep
//! it; the rest share what remains equally. When nothing is downloading, the
//! seeding-only upload cap replaces the overall upload cap.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// What the allocator needs to know about one download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationInput {
    /// User-set upload cap; 0 means none
    pub fixed_up: u64,
    /// User-set download cap; 0 means none
    pub fixed_down: u64,
    /// Download is complete and only uploading
    pub seeding: bool,
    /// Download is running (stopped downloads receive nothing)
    pub active: bool,
}

/// Bytes per second granted to one download; 0 means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Allocation {
    pub up: u64,
    pub down: u64,
}

/// Session-wide caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateAllocator {
    pub max_upload_rate: u64,
    pub max_download_rate: u64,
    /// Upload cap used while no download is in progress; 0 falls back to `max_upload_rate`
    pub max_seed_upload_rate: u64,
}

impl RateAllocator {
    pub fn new(max_upload_rate: u64, max_download_rate: u64, max_seed_upload_rate: u64) -> Self {
        Self {
            max_upload_rate,
            max_download_rate,
            max_seed_upload_rate,
        }
    }

    /// Allocation per input, in input order
    pub fn allocate(&self, inputs: &[AllocationInput]) -> Vec<Allocation> {
        let downloading = inputs.iter().any(|i| i.active && !i.seeding);
        let up_cap = if !downloading && self.max_seed_upload_rate > 0 {
            self.max_seed_upload_rate
        } else {
            self.max_upload_rate
        };

        let ups = split(up_cap, inputs, |i| i.fixed_up);
        let downs = split(self.max_download_rate, inputs, |i| i.fixed_down);
        let result: Vec<Allocation> = ups
            .into_iter()
            .zip(downs)
            .map(|(up, down)| Allocation { up, down })
            .collect();
        debug!("Rate allocation over {} downloads: {:?}", inputs.len(), result);
        result
    }
}

/// Share `cap` among active inputs; fixed caps come off the top
fn split(cap: u64, inputs: &[AllocationInput], fixed: impl Fn(&AllocationInput) -> u64) -> Vec<u64> {
    let active: Vec<&AllocationInput> = inputs.iter().filter(|i| i.active).collect();
    let fixed_total: u64 = active.iter().map(|i| fixed(i)).sum();
    let sharing = active.iter().filter(|i| fixed(i) == 0).count() as u64;

    let share = if cap == 0 || sharing == 0 {
        0
    } else {
        // Never hand out 0, which would mean unlimited
        (cap.saturating_sub(fixed_total) / sharing).max(1)
    };

    inputs
        .iter()
        .map(|i| {
            if !i.active {
                0
            } else if fixed(i) > 0 {
                if cap > 0 {
                    fixed(i).min(cap)
                } else {
                    fixed(i)
                }
            } else {
                share
            }
        })
        .collect()
}
