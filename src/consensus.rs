//! Consensus parameters and network constants.
//!
//! Everything that two honest nodes must agree on lives here: money limits,
//! the two proof-of-work regimes, the fork window, the network upgrade table
//! used for signature-hash domain separation, and the checkpoints.

use crate::blockchain::Sha256Hash;
use primitive_types::U256;
use serde::Deserialize;
use std::collections::BTreeMap;

pub const COIN: i64 = 100_000_000;
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Coinbase outputs cannot be spent before this many confirmations.
pub const COINBASE_MATURITY: u32 = 100;

/// Maximum reorg length we accept before refusing to switch branches.
/// Not a true consensus parameter, just a network-wide default.
pub const MAX_REORG_LENGTH: u32 = COINBASE_MATURITY - 1;

pub const MAX_BLOCK_SIZE: usize = 2_000_000;
pub const MAX_TX_SIZE: usize = 100_000;

/// Upper bound on the snapshot records consumed for one fork-window block.
pub const FORK_CB_PER_BLOCK: usize = 10_000;

/// How far in the future a block timestamp may be, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

pub fn money_range(value: i64) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        }
    }
}

/// One difficulty-adjustment regime. The chain runs the normal regime except
/// inside the fork window, where the fork regime applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetargetRegime {
    pub averaging_window: u32,
    pub target_spacing: i64,
    /// Percentages bounding how far one retarget may move the target.
    pub max_adjust_down: i64,
    pub max_adjust_up: i64,
}

impl RetargetRegime {
    pub fn averaging_window_timespan(&self) -> i64 {
        self.averaging_window as i64 * self.target_spacing
    }

    pub fn min_actual_timespan(&self) -> i64 {
        (self.averaging_window_timespan() * (100 - self.max_adjust_up)) / 100
    }

    pub fn max_actual_timespan(&self) -> i64 {
        (self.averaging_window_timespan() * (100 + self.max_adjust_down)) / 100
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkUpgrade {
    pub name: &'static str,
    pub activation_height: u32,
    pub branch_id: u32,
}

pub const SPROUT_BRANCH_ID: u32 = 0;
pub const FORK_BRANCH_ID: u32 = 0x4254_4350;

#[derive(Debug, Clone)]
pub struct ConsensusParams {
    pub network: Network,
    /// Easiest target after the fork activates; also the absolute ceiling.
    pub pow_limit: U256,
    /// Easiest target before the fork activates.
    pub pre_fork_pow_limit: U256,
    pub normal_regime: RetargetRegime,
    pub fork_regime: RetargetRegime,
    pub pow_difficulty_bomb_height: u32,
    pub pow_allow_min_difficulty_blocks: bool,
    pub pow_no_retargeting: bool,
    pub fork_start_height: u32,
    pub fork_height_range: u32,
    pub equihash_n: u32,
    pub equihash_k: u32,
    pub initial_subsidy: i64,
    pub subsidy_halving_interval: u32,
    pub upgrades: Vec<NetworkUpgrade>,
    pub checkpoints: BTreeMap<u32, Sha256Hash>,
}

impl ConsensusParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Main => Self::mainnet(),
            Network::Test => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    pub fn mainnet() -> Self {
        let fork_start_height = 511_346;
        ConsensusParams {
            network: Network::Main,
            pow_limit: U256::MAX >> 13usize,
            pre_fork_pow_limit: U256::MAX >> 32usize,
            normal_regime: RetargetRegime {
                averaging_window: 17,
                target_spacing: 150,
                max_adjust_down: 32,
                max_adjust_up: 16,
            },
            fork_regime: RetargetRegime {
                averaging_window: 30,
                target_spacing: 60,
                max_adjust_down: 64,
                max_adjust_up: 32,
            },
            pow_difficulty_bomb_height: 1_800_000,
            pow_allow_min_difficulty_blocks: false,
            pow_no_retargeting: false,
            fork_start_height,
            fork_height_range: 65_450,
            equihash_n: 200,
            equihash_k: 9,
            initial_subsidy: 125 * COIN / 10,
            subsidy_halving_interval: 840_000,
            upgrades: vec![
                NetworkUpgrade { name: "sprout", activation_height: 0, branch_id: SPROUT_BRANCH_ID },
                NetworkUpgrade {
                    name: "fork",
                    activation_height: fork_start_height + 1,
                    branch_id: FORK_BRANCH_ID,
                },
            ],
            checkpoints: BTreeMap::new(),
        }
    }

    pub fn testnet() -> Self {
        let fork_start_height = 1_210;
        ConsensusParams {
            network: Network::Test,
            pow_limit: U256::MAX >> 5usize,
            pow_allow_min_difficulty_blocks: true,
            fork_start_height,
            fork_height_range: 20,
            upgrades: vec![
                NetworkUpgrade { name: "sprout", activation_height: 0, branch_id: SPROUT_BRANCH_ID },
                NetworkUpgrade {
                    name: "fork",
                    activation_height: fork_start_height + 1,
                    branch_id: FORK_BRANCH_ID,
                },
            ],
            ..Self::mainnet()
        }
    }

    /// Easy, fast parameters for local testing: ~1 in 16 hashes meets the
    /// floor and the puzzle uses small (n, k).
    pub fn regtest() -> Self {
        let fork_start_height = 10;
        ConsensusParams {
            network: Network::Regtest,
            pow_limit: U256::MAX >> 4usize,
            pre_fork_pow_limit: U256::MAX >> 4usize,
            pow_difficulty_bomb_height: u32::MAX,
            pow_allow_min_difficulty_blocks: false,
            pow_no_retargeting: true,
            fork_start_height,
            fork_height_range: 5,
            equihash_n: 48,
            equihash_k: 5,
            subsidy_halving_interval: 150,
            upgrades: vec![
                NetworkUpgrade { name: "sprout", activation_height: 0, branch_id: SPROUT_BRANCH_ID },
                NetworkUpgrade {
                    name: "fork",
                    activation_height: fork_start_height + 1,
                    branch_id: FORK_BRANCH_ID,
                },
            ],
            ..Self::mainnet()
        }
    }

    /// True for heights inside `(fork_start, fork_start + range]`.
    pub fn is_fork_block(&self, height: i64) -> bool {
        let start = self.fork_start_height as i64;
        height > start && height <= start + self.fork_height_range as i64
    }

    pub fn is_fork_enabled(&self, height: i64) -> bool {
        height > self.fork_start_height as i64
    }

    pub fn regime(&self, is_fork: bool) -> &RetargetRegime {
        if is_fork {
            &self.fork_regime
        } else {
            &self.normal_regime
        }
    }

    /// Floor (easiest allowed) target for a block at `height`.
    pub fn pow_floor(&self, height: i64) -> U256 {
        if self.is_fork_enabled(height) {
            self.pow_limit
        } else {
            self.pre_fork_pow_limit
        }
    }

    /// Branch id of the epoch containing `height`. Computed fresh for every
    /// height; callers must not cache it across heights.
    pub fn current_epoch_branch_id(&self, height: u32) -> u32 {
        self.upgrades
            .iter()
            .filter(|upgrade| upgrade.activation_height <= height)
            .max_by_key(|upgrade| upgrade.activation_height)
            .map(|upgrade| upgrade.branch_id)
            .unwrap_or(SPROUT_BRANCH_ID)
    }

    /// Whether signature hashes at `height` commit to the fork id.
    pub fn fork_id_active(&self, height: u32) -> bool {
        self.is_fork_enabled(height as i64)
    }

    pub fn block_subsidy(&self, height: u32) -> i64 {
        let halvings = height / self.subsidy_halving_interval.max(1);
        if halvings >= 64 {
            return 0;
        }
        self.initial_subsidy >> halvings
    }

    /// Highest checkpoint, if any are configured.
    pub fn last_checkpoint(&self) -> Option<(u32, Sha256Hash)> {
        self.checkpoints.iter().next_back().map(|(height, hash)| (*height, *hash))
    }
}
