//! Operational read-outs published by the event loop

use crate::core::consensus::calc_work;
use crate::core::params::DESIRED_BLOCK_TIMESPAN;
use crate::core::CoinState;
use crate::network::chain_manager::{ChainManager, SyncMode};
use crate::network::network_manager::NetworkManager;
use crate::network::peer::{Direction, Peers};
use chrono::{TimeZone, Utc};
use primitive_types::U256;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Blocks looked at for the timespan factor and hash rate
const RECENT_BLOCKS: u32 = 100;

/// Forks further behind the head than this are left out of the text rendering
const DISPLAY_FORK_DEPTH: u32 = 10;

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub network: NetworkStats,
    pub chain: ChainStats,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkStats {
    pub peers: Vec<PeerStats>,
    pub candidates: usize,
    /// Connection counts per remote host
    pub hosts: BTreeMap<String, HostStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerStats {
    pub host: String,
    pub port: u16,
    pub direction: Direction,
    /// Unix time the connection was set up
    pub connected_at: u64,
    pub hello_received: bool,
    pub head_height: Option<u32>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HostStats {
    pub incoming: usize,
    pub outgoing: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockStats {
    pub height: u32,
    pub timestamp: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForkStats {
    pub tip: BlockStats,
    /// Blocks on the fork since it left the canonical chain
    pub divergence: u32,
    /// How far the fork tip is below the canonical head
    pub behind: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainStats {
    pub mode: Option<SyncMode>,
    pub head: Option<BlockStats>,
    pub forks: Vec<ForkStats>,
    pub target: Option<String>,
    /// Cumulative work of the canonical chain, decimal
    pub work: String,
    /// Actual over desired time for the recent blocks
    pub timespan_factor: Option<f64>,
    /// Estimated hashes per second over the recent blocks
    pub hash_rate: Option<f64>,
    pub transaction_pool: usize,
}

impl NodeStats {
    pub fn collect(peers: &Peers, network: &NetworkManager, chain: &ChainManager) -> Self {
        Self {
            network: NetworkStats::collect(peers, network),
            chain: ChainStats::collect(chain),
        }
    }

    pub fn active_peers(&self) -> usize {
        self.network.peers.iter().filter(|peer| peer.hello_received).count()
    }

    pub fn head_height(&self) -> Option<u32> {
        self.chain.head.as_ref().map(|head| head.height)
    }
}

impl NetworkStats {
    fn collect(peers: &Peers, network: &NetworkManager) -> Self {
        let mut stats = NetworkStats {
            candidates: network.candidates_count(),
            ..Default::default()
        };

        for peer in peers.iter() {
            let host = stats.hosts.entry(peer.host.clone()).or_default();
            match peer.direction {
                Direction::Incoming => host.incoming += 1,
                _ => host.outgoing += 1,
            }

            stats.peers.push(PeerStats {
                host: peer.host.clone(),
                port: peer.port,
                direction: peer.direction,
                connected_at: peer.connected_at,
                hello_received: peer.hello_received(),
                head_height: peer.hello.as_ref().and_then(|hello| hello.head_height),
                user_agent: peer.hello.as_ref().map(|hello| hello.user_agent.clone()),
            });
        }
        stats
            .peers
            .sort_by(|a, b| (&a.host, a.port, a.direction).cmp(&(&b.host, b.port, b.direction)));

        stats
    }
}

impl ChainStats {
    fn collect(chain: &ChainManager) -> Self {
        let coinstate = chain.coinstate();
        let mut stats = ChainStats {
            mode: Some(chain.mode()),
            work: coinstate.head_work().to_string(),
            transaction_pool: chain.transaction_pool_len(),
            ..Default::default()
        };

        let Some(head) = coinstate.head() else {
            return stats;
        };

        stats.head = Some(BlockStats {
            height: head.height,
            timestamp: head.timestamp(),
            hash: hex::encode(head.hash()),
        });
        stats.target = Some(hex::encode(head.target()));

        stats.forks = coinstate
            .forks()
            .into_iter()
            .map(|(tip, ancestor)| ForkStats {
                tip: BlockStats {
                    height: tip.height,
                    timestamp: tip.timestamp(),
                    hash: hex::encode(tip.hash()),
                },
                divergence: tip.height.saturating_sub(ancestor.height),
                behind: head.height.saturating_sub(tip.height),
            })
            .collect();
        stats.forks.sort_by_key(|fork| fork.behind);

        if let Some((factor, hash_rate)) = recent_block_rates(coinstate) {
            stats.timespan_factor = Some(factor);
            stats.hash_rate = hash_rate;
        }

        stats
    }
}

/// Approximate a 256-bit integer as a float
fn u256_to_f64(value: U256) -> f64 {
    value
        .0
        .iter()
        .enumerate()
        .map(|(i, limb)| *limb as f64 * 2f64.powi(64 * i as i32))
        .sum()
}

/// Timespan factor and hash rate over the last [`RECENT_BLOCKS`] blocks
fn recent_block_rates(coinstate: &CoinState) -> Option<(f64, Option<f64>)> {
    let head = coinstate.head()?;
    let count = RECENT_BLOCKS.min(head.height);
    if count == 0 {
        return None;
    }

    let first = coinstate.block_at_height(head.height - count)?;
    let actual = head.timestamp().saturating_sub(first.timestamp());
    let desired = u64::from(count) * DESIRED_BLOCK_TIMESPAN;
    let factor = actual as f64 / desired as f64;

    let work: f64 = (head.height - count + 1..=head.height)
        .filter_map(|height| coinstate.block_at_height(height))
        .map(|block| u256_to_f64(calc_work(block.target())))
        .sum();
    let hash_rate = (actual > 0).then(|| work / actual as f64);

    Some((factor, hash_rate))
}

fn format_timestamp(timestamp: u64) -> String {
    match Utc.timestamp_opt(timestamp as i64, 0).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => timestamp.to_string(),
    }
}

fn format_hash_rate(rate: f64) -> String {
    const UNITS: [&str; 5] = ["H/s", "kH/s", "MH/s", "GH/s", "TH/s"];
    let mut rate = rate;
    let mut unit = 0;
    while rate >= 1000.0 && unit < UNITS.len() - 1 {
        rate /= 1000.0;
        unit += 1;
    }
    format!("{:.1} {}", rate, UNITS[unit])
}

impl fmt::Display for NodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outgoing: usize = self.network.hosts.values().map(|host| host.outgoing).sum();
        let incoming: usize = self.network.hosts.values().map(|host| host.incoming).sum();
        writeln!(
            f,
            "Peers: {} active, {} outgoing, {} incoming, {} candidates",
            self.active_peers(),
            outgoing,
            incoming,
            self.network.candidates
        )?;

        let mode = self
            .chain
            .mode
            .map_or_else(|| "-".to_string(), |mode| mode.to_string());

        match &self.chain.head {
            Some(head) => writeln!(
                f,
                "Head:  {} at height {} ({}), mode {}",
                &head.hash[..16],
                head.height,
                format_timestamp(head.timestamp),
                mode
            )?,
            None => writeln!(f, "Head:  none, mode {}", mode)?,
        }

        for fork in self
            .chain
            .forks
            .iter()
            .filter(|fork| fork.behind <= DISPLAY_FORK_DEPTH)
        {
            writeln!(
                f,
                "Fork:  {} at height {} ({}), {} blocks since divergence",
                &fork.tip.hash[..16],
                fork.tip.height,
                format_timestamp(fork.tip.timestamp),
                fork.divergence
            )?;
        }

        if let Some(target) = &self.chain.target {
            write!(f, "Target: {}", &target[..16])?;
            if let Some(factor) = self.chain.timespan_factor {
                write!(f, ", timespan factor {:.2}", factor)?;
            }
            if let Some(rate) = self.chain.hash_rate {
                write!(f, ", est. {}", format_hash_rate(rate))?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}
