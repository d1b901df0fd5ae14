//! Known-host pool, connection tracking, and peer scoring/banning.

use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Reasons a peer can be penalized. Each carries a fixed penalty value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PenaltyReason {
    InvalidBlock,
    Stall,
    Timeout,
    ProtocolViolation,
}

impl PenaltyReason {
    /// Penalty points deducted for this reason (always negative).
    pub fn penalty(self) -> i32 {
        match self {
            Self::InvalidBlock => -100,
            Self::Stall => -50,
            Self::Timeout => -25,
            Self::ProtocolViolation => -200,
        }
    }
}

/// Per-host metadata tracked by the [`PeerManager`].
#[derive(Clone, Debug)]
pub struct PeerState {
    pub address: SocketAddr,
    pub connected: bool,
    /// Reputation score, clamped to `SCORE_MIN..=SCORE_MAX`.
    pub score: i32,
    pub banned_until: Option<Instant>,
    pub last_attempt: Option<Instant>,
}

/// Score at or below which a peer is banned.
const BAN_THRESHOLD: i32 = -200;
/// Duration of a ban.
const BAN_DURATION: Duration = Duration::from_secs(3600);
/// Cooldown between dial attempts to the same host.
const RETRY_COOLDOWN: Duration = Duration::from_secs(30);
const SCORE_MIN: i32 = -1000;
const SCORE_MAX: i32 = 100;

/// Central registry for host discovery, connection tracking, scoring, and
/// ban management. Bounded by the configured host pool capacity.
pub struct PeerManager {
    hosts: HashMap<SocketAddr, PeerState>,
    capacity: usize,
    num_connected: usize,
}

impl PeerManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            hosts: HashMap::new(),
            capacity,
            num_connected: 0,
        }
    }

    /// Add a discovered host. At capacity the lowest-scoring disconnected
    /// host is evicted to make room. Banned hosts are never re-added.
    pub fn add_host(&mut self, address: SocketAddr) {
        if self.hosts.contains_key(&address) {
            return;
        }
        if self.hosts.len() >= self.capacity {
            let worst = self
                .hosts
                .iter()
                .filter(|(_, p)| !p.connected)
                .min_by_key(|(_, p)| p.score)
                .map(|(addr, p)| (*addr, p.score));
            match worst {
                Some((addr, score)) if score < 0 => {
                    tracing::debug!(evicted = %addr, score, "evicted lowest-scoring host");
                    self.hosts.remove(&addr);
                }
                _ => return,
            }
        }
        self.hosts.insert(
            address,
            PeerState {
                address,
                connected: false,
                score: 0,
                banned_until: None,
                last_attempt: None,
            },
        );
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn connected_count(&self) -> usize {
        self.num_connected
    }

    pub fn mark_connected(&mut self, address: SocketAddr) {
        let entry = self.hosts.entry(address).or_insert(PeerState {
            address,
            connected: false,
            score: 0,
            banned_until: None,
            last_attempt: None,
        });
        if !entry.connected {
            entry.connected = true;
            self.num_connected += 1;
        }
    }

    pub fn mark_disconnected(&mut self, address: &SocketAddr) {
        if let Some(entry) = self.hosts.get_mut(address) {
            if entry.connected {
                entry.connected = false;
                self.num_connected -= 1;
            }
        }
    }

    /// Apply a penalty; at or below the ban threshold the host is banned.
    pub fn penalize(&mut self, address: &SocketAddr, reason: PenaltyReason) {
        if let Some(entry) = self.hosts.get_mut(address) {
            entry.score = (entry.score + reason.penalty()).clamp(SCORE_MIN, SCORE_MAX);
            if entry.score <= BAN_THRESHOLD && entry.banned_until.is_none() {
                entry.banned_until = Some(Instant::now() + BAN_DURATION);
                tracing::info!(peer = %address, reason = ?reason, "peer banned");
            }
        }
    }

    /// Reward a well-behaved host.
    pub fn reward(&mut self, address: &SocketAddr) {
        if let Some(entry) = self.hosts.get_mut(address) {
            entry.score = (entry.score + 1).clamp(SCORE_MIN, SCORE_MAX);
        }
    }

    pub fn is_banned(&self, address: &SocketAddr) -> bool {
        match self.hosts.get(address).and_then(|p| p.banned_until) {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Pick up to `count` dialable hosts: not connected, not banned, not in
    /// retry cooldown. Randomized to spread connection attempts.
    pub fn select_outbound(&mut self, count: usize) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut eligible: Vec<SocketAddr> = self
            .hosts
            .values()
            .filter(|p| !p.connected)
            .filter(|p| p.banned_until.map_or(true, |until| now >= until))
            .filter(|p| {
                p.last_attempt
                    .map_or(true, |at| now.duration_since(at) >= RETRY_COOLDOWN)
            })
            .map(|p| p.address)
            .collect();
        eligible.shuffle(&mut rand::thread_rng());
        eligible.truncate(count);
        for addr in &eligible {
            if let Some(entry) = self.hosts.get_mut(addr) {
                entry.last_attempt = Some(now);
            }
        }
        eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:8333").parse().unwrap()
    }

    #[test]
    fn connection_count_tracks_marks() {
        let mut pm = PeerManager::new(8);
        pm.add_host(addr(1));
        pm.mark_connected(addr(1));
        pm.mark_connected(addr(1));
        assert_eq!(pm.connected_count(), 1);
        pm.mark_disconnected(&addr(1));
        pm.mark_disconnected(&addr(1));
        assert_eq!(pm.connected_count(), 0);
    }

    #[test]
    fn capacity_evicts_only_negative_scores() {
        let mut pm = PeerManager::new(2);
        pm.add_host(addr(1));
        pm.add_host(addr(2));
        pm.add_host(addr(3));
        assert_eq!(pm.host_count(), 2);

        pm.penalize(&addr(1), PenaltyReason::Timeout);
        pm.add_host(addr(3));
        assert_eq!(pm.host_count(), 2);
        assert!(pm.hosts.contains_key(&addr(3)));
        assert!(!pm.hosts.contains_key(&addr(1)));
    }

    #[test]
    fn ban_threshold_bans_and_blocks_selection() {
        let mut pm = PeerManager::new(8);
        pm.add_host(addr(1));
        pm.penalize(&addr(1), PenaltyReason::ProtocolViolation);
        assert!(pm.is_banned(&addr(1)));
        assert!(pm.select_outbound(8).is_empty());
    }

    #[test]
    fn selection_skips_connected_and_cooling_hosts() {
        let mut pm = PeerManager::new(8);
        pm.add_host(addr(1));
        pm.add_host(addr(2));
        pm.mark_connected(addr(1));

        let picked = pm.select_outbound(8);
        assert_eq!(picked, vec![addr(2)]);
        // The second selection finds addr(2) in cooldown.
        assert!(pm.select_outbound(8).is_empty());
    }

    #[test]
    fn reward_and_penalty_clamp() {
        let mut pm = PeerManager::new(8);
        pm.add_host(addr(1));
        for _ in 0..200 {
            pm.reward(&addr(1));
        }
        assert_eq!(pm.hosts[&addr(1)].score, SCORE_MAX);
        for _ in 0..20 {
            pm.penalize(&addr(1), PenaltyReason::ProtocolViolation);
        }
        assert_eq!(pm.hosts[&addr(1)].score, SCORE_MIN);
    }
}
