use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::gaps::gap_list::{Gap, GapList};
use crate::util::julian_date::{from_epoch_millis, to_epoch_millis};

/// Serializable snapshot of a [GapTracker], used to persist gap state across connections
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct GapState {
    pub min: u64,
    pub max: u64,
    pub gaps: Vec<GapRecord>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct GapRecord {
    pub start: u64,
    pub end: u64,
    pub modified_millis: i64,
}

/// What an ACKNACK reports about the received frames
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AcknackSnapshot {
    pub lowest_seq: u64,
    pub highest_seq: u64,
    pub gaps: Vec<(u64, u64)>,
}

/// The gap list of one connection's frame set, shared between the frame reader and the periodic
///  ACKNACK / persistence tasks. It starts out empty and is initialized by the first sequence number
///  that is received.
#[derive(Debug, Default)]
pub struct GapTracker {
    inner: Mutex<Option<GapList>>,
}

impl GapTracker {
    pub fn new() -> GapTracker {
        GapTracker::default()
    }

    pub fn from_state(state: &GapState) -> anyhow::Result<GapTracker> {
        let gaps = state.gaps.iter()
            .map(|g| Gap {
                start: g.start,
                end: g.end,
                modified: from_epoch_millis(g.modified_millis),
            })
            .collect();
        let list = GapList::from_parts(state.min, state.max, gaps)?;
        Ok(GapTracker {
            inner: Mutex::new(Some(list)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<GapList>> {
        // a panic while holding the lock cannot leave the gap list inconsistent beyond a single
        //  update, so poisoning is ignored
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn to_state(&self) -> Option<GapState> {
        self.lock().as_ref().map(|list| GapState {
            min: list.min(),
            max: list.max(),
            gaps: list.gap_entries().iter()
                .map(|g| GapRecord {
                    start: g.start,
                    end: g.end,
                    modified_millis: to_epoch_millis(g.modified),
                })
                .collect(),
        })
    }

    pub fn add_sequence_number(&self, seq: u64) {
        let mut inner = self.lock();
        match inner.as_mut() {
            Some(list) => list.add_value(seq),
            None => {
                debug!("initializing gap list with sequence number {}", seq);
                *inner = Some(GapList::single(seq));
            }
        }
    }

    /// records an inclusive range of received sequence numbers, expanding the tracked range as
    ///  necessary
    pub fn add_sequence_range(&self, start: u64, end: u64) -> anyhow::Result<()> {
        if start > end {
            bail!("range start {} is greater than its end {}", start, end);
        }

        let mut inner = self.lock();
        match inner.as_mut() {
            Some(list) => {
                list.add_value(start);
                list.add_value(end);
                list.add_value_range(start, end)
            }
            None => {
                *inner = Some(GapList::from_parts(start, end, Vec::new())?);
                Ok(())
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    pub fn lowest(&self) -> Option<u64> {
        self.lock().as_ref().map(|l| l.min())
    }

    pub fn highest(&self) -> Option<u64> {
        self.lock().as_ref().map(|l| l.max())
    }

    pub fn gaps(&self) -> Vec<(u64, u64)> {
        self.lock().as_ref()
            .map(|l| l.gaps())
            .unwrap_or_default()
    }

    /// Low / high / gaps for the next ACKNACK. Before anything was received, this reports the range
    ///  `[0, u64::MAX]` without gaps, which data providers understand as "start from scratch".
    pub fn acknack_snapshot(&self) -> AcknackSnapshot {
        match self.lock().as_ref() {
            Some(list) => AcknackSnapshot {
                lowest_seq: list.min(),
                highest_seq: list.max(),
                gaps: list.gaps_exclusive(),
            },
            None => AcknackSnapshot {
                lowest_seq: 0,
                highest_seq: u64::MAX,
                gaps: Vec::new(),
            },
        }
    }

    /// A peer whose highest sequence number is below everything tracked locally has restarted its
    ///  numbering, so local state is discarded. Returns `true` if the state was reset.
    pub fn check_for_reset(&self, peer_low: u64, peer_high: u64) -> bool {
        let mut inner = self.lock();
        match inner.as_ref() {
            Some(list) if peer_high < list.min() => {
                info!("peer reports sequence range [{}, {}] below the local range [{}, {}] - resetting gap state",
                    peer_low, peer_high, list.min(), list.max());
                *inner = None;
                true
            }
            _ => false,
        }
    }

    pub fn reset(&self) {
        *self.lock() = None;
    }

    pub fn remove_expired(&self, older_than: SystemTime) -> usize {
        match self.lock().as_mut() {
            Some(list) => list.remove_gaps_modified_before(older_than),
            None => 0,
        }
    }
}
