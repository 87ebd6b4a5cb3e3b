//! Hard placement constraints applied to a registry snapshot.
//!
//! Counts are always taken over the whole snapshot, so a restriction to
//! a single preferred node still sees every instance already on its host.

use std::collections::{HashMap, HashSet};

use provmon_state::{MachineBoundary, ServiceElement};

use crate::handle::ResourceHandle;
use crate::request::CandidateFilter;

/// Enforce `max_per_machine`.
///
/// At physical granularity all handles sharing an address are one machine:
/// a host already at the cap is dropped, otherwise at most `cap - used`
/// of its handles are admitted. At virtual or OS-instance granularity each
/// handle is its own machine.
pub fn machine_boundary(
    snapshot: &[ResourceHandle],
    element: &ServiceElement,
    reasons: &mut Vec<String>,
) -> Vec<ResourceHandle> {
    let Some(cap) = element.machine_cap() else {
        return snapshot.to_vec();
    };
    let key = element.key();

    match element.machine_boundary {
        MachineBoundary::Physical => {
            let mut used: HashMap<&str, u32> = HashMap::new();
            for handle in snapshot {
                *used.entry(handle.address()).or_insert(0) += handle.element_count(&key);
            }

            let mut admitted: HashMap<&str, u32> = HashMap::new();
            let mut full: HashSet<&str> = HashSet::new();
            let mut out = Vec::new();
            for handle in snapshot {
                let host = handle.address();
                let room = cap.saturating_sub(used.get(host).copied().unwrap_or(0));
                if room == 0 {
                    if full.insert(host) {
                        reasons.push(format!("host {host}: per-machine limit of {cap} reached"));
                    }
                    continue;
                }
                let taken = admitted.entry(host).or_insert(0);
                if *taken < room {
                    *taken += 1;
                    out.push(handle.clone());
                }
            }
            out
        }
        MachineBoundary::Virtual | MachineBoundary::OsInstance => snapshot
            .iter()
            .filter(|handle| {
                let fits = handle.element_count(&key) < cap;
                if !fits {
                    reasons.push(format!("{}: per-machine limit of {cap} reached", handle.id()));
                }
                fits
            })
            .cloned()
            .collect(),
    }
}

/// Drop candidates whose host already carries an element isolated from
/// `element`, whichever side declared the isolation.
pub fn isolation(
    snapshot: &[ResourceHandle],
    candidates: Vec<ResourceHandle>,
    element: &ServiceElement,
    reasons: &mut Vec<String>,
) -> Vec<ResourceHandle> {
    let conflicted: HashSet<&str> = snapshot
        .iter()
        .filter(|handle| handle.conflicts_with(element))
        .map(|handle| handle.address())
        .collect();
    if conflicted.is_empty() {
        return candidates;
    }

    candidates
        .into_iter()
        .filter(|handle| {
            let clear = !conflicted.contains(handle.address());
            if !clear {
                reasons.push(format!("{}: host runs an isolated element", handle.id()));
            }
            clear
        })
        .collect()
}

pub fn restrict(candidates: Vec<ResourceHandle>, filter: &CandidateFilter) -> Vec<ResourceHandle> {
    match filter {
        CandidateFilter::Any => candidates,
        _ => candidates.into_iter().filter(|h| filter.admits(h.id())).collect(),
    }
}
