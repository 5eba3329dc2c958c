//! Flat host registry: ban bookkeeping and outbound dial planning

use crate::error::Result;
use crate::persistence::{PeerRegistry, PeerStatus};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;

/// `host` part of a `host:port` string.
pub fn host_of(addr: &str) -> &str {
    match addr.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => addr,
    }
}

/// Bans are recorded per host so a banned peer cannot come back on another port.
pub fn record_ban(registry: &dyn PeerRegistry, addr: &str, now_ms: u64) -> Result<()> {
    registry.put_peer(host_of(addr), PeerStatus::BannedAt(now_ms))
}

pub fn is_banned(registry: &dyn PeerRegistry, addr: &str, now_ms: u64, ban_timeout_ms: u64) -> Result<bool> {
    for key in [addr, host_of(addr)] {
        if let Some(status) = registry.get_peer(key)? {
            if status.is_banned(now_ms, ban_timeout_ms) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Add `addr` as a clean entry unless the registry already knows it.
pub fn remember(registry: &dyn PeerRegistry, addr: &str) -> Result<bool> {
    if registry.get_peer(addr)?.is_some() {
        return Ok(false);
    }
    registry.put_peer(addr, PeerStatus::Clean)?;
    Ok(true)
}

/// Pick the hosts to dial this cycle: dialable, not banned, not ourselves,
/// not already connected, shuffled, and no more than the free outbound slots.
pub fn plan_dials(
    registry: &dyn PeerRegistry,
    connected: &HashSet<String>,
    self_addr: &str,
    free_slots: usize,
    now_ms: u64,
    ban_timeout_ms: u64,
    rng: &mut impl Rng,
) -> Result<Vec<String>> {
    if free_slots == 0 {
        return Ok(Vec::new());
    }
    let entries = registry.peers()?;
    let banned_hosts: HashSet<&str> = entries
        .iter()
        .filter(|(_, status)| status.is_banned(now_ms, ban_timeout_ms))
        .map(|(host, _)| host.as_str())
        .collect();

    let mut candidates: Vec<String> = entries
        .iter()
        .map(|(addr, _)| addr)
        .filter(|addr| host_of(addr) != addr.as_str())
        .filter(|addr| !banned_hosts.contains(addr.as_str()) && !banned_hosts.contains(host_of(addr)))
        .filter(|addr| addr.as_str() != self_addr && !connected.contains(addr.as_str()))
        .cloned()
        .collect();

    candidates.shuffle(rng);
    candidates.truncate(free_slots);
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;

    const HOUR: u64 = 3_600_000;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.1:7420"), "10.0.0.1");
        assert_eq!(host_of("seed.example"), "seed.example");
        assert_eq!(host_of("[::1]:7420"), "[::1]");
    }

    #[test]
    fn test_ban_window() {
        let registry = InMemoryPersistence::new();
        record_ban(&registry, "10.0.0.1:5555", 1_000).unwrap();

        assert!(is_banned(&registry, "10.0.0.1:7420", 1_000 + HOUR - 1, HOUR).unwrap());
        assert!(!is_banned(&registry, "10.0.0.1:7420", 1_000 + HOUR, HOUR).unwrap());
        assert!(!is_banned(&registry, "10.0.0.2:7420", 1_000, HOUR).unwrap());
    }

    #[test]
    fn test_plan_dials_filters() {
        let registry = InMemoryPersistence::new();
        for addr in ["10.0.0.1:7420", "10.0.0.2:7420", "10.0.0.3:7420", "127.0.0.1:7420", "10.0.0.4:7420"] {
            remember(&registry, addr).unwrap();
        }
        assert!(!remember(&registry, "10.0.0.1:7420").unwrap());
        record_ban(&registry, "10.0.0.2:7420", 5_000).unwrap();
        let connected: HashSet<String> = ["10.0.0.3:7420".to_string()].into_iter().collect();

        let mut rng = rand::thread_rng();
        let mut plan = plan_dials(&registry, &connected, "127.0.0.1:7420", 8, 6_000, HOUR, &mut rng).unwrap();
        plan.sort();
        assert_eq!(plan, vec!["10.0.0.1:7420".to_string(), "10.0.0.4:7420".to_string()]);

        let plan = plan_dials(&registry, &connected, "127.0.0.1:7420", 1, 6_000, HOUR, &mut rng).unwrap();
        assert_eq!(plan.len(), 1);

        // Once the window has passed the host is dialable again.
        let plan = plan_dials(&registry, &connected, "127.0.0.1:7420", 8, 5_000 + HOUR, HOUR, &mut rng).unwrap();
        assert_eq!(plan.len(), 3);
    }
}
