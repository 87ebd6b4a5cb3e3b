//! Deterministic resolution of competing primacy claims.
//!
//! Both peers run the same comparison on the same inputs, so whichever
//! side notices the conflict reaches the same verdict.

use provmon_state::PeerInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The remote peer is not managing the deployment.
    NoConflict,
    LocalWins,
    RemoteWins,
}

/// One side of a conflict: who claims the deployment and since when.
#[derive(Debug, Clone, Copy)]
pub struct Claim<'a> {
    pub peer: &'a PeerInfo,
    /// Deployment timestamps, any order.
    pub dates: &'a [u64],
    pub active: bool,
}

/// Decide which side stays ACTIVE.
///
/// The earlier first deployment wins. A side without timestamps (still
/// pending) or an exact tie falls back to peer ordering; the lower peer
/// wins.
pub fn resolve(local: Claim<'_>, remote: Claim<'_>) -> Resolution {
    if !remote.active {
        return Resolution::NoConflict;
    }
    let first = |dates: &[u64]| dates.iter().copied().min();

    match (first(local.dates), first(remote.dates)) {
        (Some(l), Some(r)) if l < r => Resolution::LocalWins,
        (Some(l), Some(r)) if r < l => Resolution::RemoteWins,
        _ if local.peer <= remote.peer => Resolution::LocalWins,
        _ => Resolution::RemoteWins,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, backup_count: u32, tiebreaker: u64) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            name: id.to_string(),
            host: format!("{id}-host"),
            endpoint: format!("{id}-host:9010"),
            tiebreaker,
            backup_count,
            protocol_version: "1.0".to_string(),
        }
    }

    fn claim<'a>(peer: &'a PeerInfo, dates: &'a [u64]) -> Claim<'a> {
        Claim { peer, dates, active: true }
    }

    #[test]
    fn inactive_remote_is_no_conflict() {
        let a = peer("a", 0, 1);
        let b = peer("b", 0, 2);
        let remote = Claim { peer: &b, dates: &[1], active: false };
        assert_eq!(resolve(claim(&a, &[5]), remote), Resolution::NoConflict);
    }

    #[test]
    fn earlier_deployment_wins_from_both_sides() {
        let a = peer("a", 5, 99);
        let b = peer("b", 0, 1);
        let (t1, t2) = ([100, 300], [200]);

        assert_eq!(resolve(claim(&a, &t1), claim(&b, &t2)), Resolution::LocalWins);
        assert_eq!(resolve(claim(&b, &t2), claim(&a, &t1)), Resolution::RemoteWins);
    }

    #[test]
    fn first_date_is_the_minimum() {
        let a = peer("a", 0, 1);
        let b = peer("b", 0, 2);
        // Unsorted history: a's first deployment is 50.
        assert_eq!(resolve(claim(&a, &[400, 50]), claim(&b, &[100])), Resolution::LocalWins);
    }

    #[test]
    fn missing_dates_fall_back_to_peer_order() {
        let low = peer("low", 0, 1);
        let high = peer("high", 2, 1);
        assert_eq!(resolve(claim(&low, &[]), claim(&high, &[10])), Resolution::LocalWins);
        assert_eq!(resolve(claim(&high, &[10]), claim(&low, &[])), Resolution::RemoteWins);
    }

    #[test]
    fn equal_dates_fall_back_to_tiebreaker() {
        let a = peer("a", 1, 7);
        let b = peer("b", 1, 3);
        assert_eq!(resolve(claim(&a, &[10]), claim(&b, &[10])), Resolution::RemoteWins);
        assert_eq!(resolve(claim(&b, &[10]), claim(&a, &[10])), Resolution::LocalWins);
    }
}
