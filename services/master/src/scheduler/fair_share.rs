//! Weighted fair-share scheduling.
//!
//! Each requester with pending or running work gets a share
//! `weight / sum(weights)` of the pool's slots. On every step the requester
//! furthest below its share goes next:
//!
//! ```text
//! deficit = share * capacity - held + aging_per_sec * share * waited_secs
//! ```
//!
//! where `waited_secs` counts from the submission of the requester's oldest
//! pending request. The aging term keeps a requester with a large request
//! from waiting forever behind a stream of small ones. Fair-share never
//! preempts.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};

use super::placement::Capacity;
use super::{Decision, PassInput, Placement, SchedulingPolicy};
use crate::pool::TaskRequest;

#[derive(Debug, Clone, Copy)]
pub struct FairSharePolicy {
    aging_per_sec: f64,
}

impl FairSharePolicy {
    pub fn new(aging_per_sec: f64) -> Self {
        Self { aging_per_sec }
    }
}

#[derive(Default)]
struct Account<'a> {
    weight: f64,
    held: usize,
    queue: VecDeque<&'a TaskRequest>,
}

impl SchedulingPolicy for FairSharePolicy {
    fn name(&self) -> &'static str {
        "fair_share"
    }

    fn schedule(&self, input: &PassInput<'_>) -> Decision {
        let mut capacity = Capacity::from_snapshot(input.snapshot);
        let mut decision = Decision::default();

        let bound = input.snapshot.bound_by_allocation();
        let mut accounts: BTreeMap<&str, Account<'_>> = BTreeMap::new();

        for running in input.running {
            let account = accounts.entry(running.requester.as_str()).or_default();
            account.weight = account.weight.max(running.weight);
            account.held += bound.get(&running.allocation_id).map_or(0, Vec::len);
        }

        let mut pending: Vec<&TaskRequest> = input.pending.iter().collect();
        pending.sort_by_key(|r| (r.submitted_at, r.allocation_id));
        for request in pending {
            let account = accounts.entry(request.requester.as_str()).or_default();
            account.weight = account.weight.max(request.weight);
            account.queue.push_back(request);
        }

        let total_weight: f64 = accounts.values().map(|a| a.weight).sum();
        if total_weight <= 0.0 {
            return decision;
        }
        let total_slots = input.snapshot.total_slots() as f64;

        // Requesters whose next request did not fit. Their later requests
        // wait too, so each requester is served in submission order.
        let mut blocked: BTreeSet<&str> = BTreeSet::new();

        loop {
            let deficits: HashMap<&str, f64> = accounts
                .iter()
                .filter(|(name, account)| !blocked.contains(*name) && !account.queue.is_empty())
                .map(|(name, account)| {
                    (*name, self.deficit(account, total_weight, total_slots, input.now))
                })
                .collect();

            let next = deficits
                .iter()
                .filter_map(|(name, deficit)| {
                    let head = accounts.get(name)?.queue.front()?;
                    Some((*name, *deficit, head.submitted_at, head.allocation_id))
                })
                .max_by(|a, b| {
                    a.1.total_cmp(&b.1)
                        .then_with(|| b.2.cmp(&a.2))
                        .then_with(|| b.3.cmp(&a.3))
                });

            let Some((name, _, _, _)) = next else {
                break;
            };
            let Some(account) = accounts.get_mut(name) else {
                break;
            };
            let Some(request) = account.queue.front().copied() else {
                break;
            };

            match capacity.find(&request.resources) {
                Some(slots) => {
                    capacity.take(&slots);
                    account.held += slots.len();
                    account.queue.pop_front();
                    decision.placements.push(Placement {
                        allocation_id: request.allocation_id,
                        slots,
                    });
                }
                None => {
                    blocked.insert(name);
                }
            }
        }

        decision
    }
}

impl FairSharePolicy {
    fn deficit(
        &self,
        account: &Account<'_>,
        total_weight: f64,
        total_slots: f64,
        now: DateTime<Utc>,
    ) -> f64 {
        let share = account.weight / total_weight;
        let waited = account
            .queue
            .front()
            .map(|r| (now - r.submitted_at).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(0.0);
        share * total_slots - account.held as f64 + self.aging_per_sec * share * waited
    }
}
