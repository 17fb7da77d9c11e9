use serde::{Deserialize, Serialize};

/// Depth of the deposit contract's incremental Merkle tree.
pub const DEPOSIT_CONTRACT_TREE_DEPTH: usize = 32;

/// Holds the chain constants consumed by the execution chain service.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ChainSpec {
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
    pub epochs_per_eth1_voting_period: u64,
    pub seconds_per_execution_block: u64,
    pub execution_follow_distance: u64,
    pub min_genesis_active_validator_count: u64,
    pub min_genesis_time: u64,
    pub genesis_delay: u64,
    pub max_effective_balance: u64,
    pub effective_balance_increment: u64,
    pub deposit_contract_tree_depth: u64,
}

impl ChainSpec {
    pub fn mainnet() -> Self {
        Self {
            seconds_per_slot: 12,
            slots_per_epoch: 32,
            epochs_per_eth1_voting_period: 64,
            seconds_per_execution_block: 14,
            execution_follow_distance: 2048,
            min_genesis_active_validator_count: 16_384,
            min_genesis_time: 1_606_824_000,
            genesis_delay: 604_800,
            max_effective_balance: 32_000_000_000,
            effective_balance_increment: 1_000_000_000,
            deposit_contract_tree_depth: DEPOSIT_CONTRACT_TREE_DEPTH as u64,
        }
    }

    /// A spec suited to tests and local devnets.
    pub fn minimal() -> Self {
        Self {
            seconds_per_slot: 6,
            slots_per_epoch: 8,
            epochs_per_eth1_voting_period: 4,
            seconds_per_execution_block: 2,
            execution_follow_distance: 16,
            min_genesis_active_validator_count: 64,
            min_genesis_time: 1_578_009_600,
            genesis_delay: 300,
            ..Self::mainnet()
        }
    }

    pub fn slots_per_eth1_voting_period(&self) -> u64 {
        self.epochs_per_eth1_voting_period
            .saturating_mul(self.slots_per_epoch)
    }

    /// Number of execution blocks produced during one voting period.
    pub fn execution_blocks_per_voting_period(&self) -> u64 {
        let period_seconds = self
            .slots_per_eth1_voting_period()
            .saturating_mul(self.seconds_per_slot);
        period_seconds
            .checked_div(self.seconds_per_execution_block)
            .unwrap_or(0)
    }
}

impl Default for ChainSpec {
    fn default() -> Self {
        Self::mainnet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voting_period_blocks() {
        let spec = ChainSpec::mainnet();
        assert_eq!(spec.slots_per_eth1_voting_period(), 2048);
        assert_eq!(spec.execution_blocks_per_voting_period(), 2048 * 12 / 14);
    }
}
