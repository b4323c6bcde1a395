/// Ferrochain consensus parameters.
/// All consensus-critical constants are defined here.

/// Subsidy paid by the coinbase of the genesis epoch: 50 coins per block.
pub const INITIAL_SUBSIDY: u64 = 50;

/// Number of heights between successive subsidy halvings.
pub const HALVING_INTERVAL: i64 = 210_000;

/// Upper bound on total emission, implied by the halving schedule.
pub const MAX_SUPPLY: u64 = 21_000_000;

/// Difficulty of the genesis block: the block hash must be below 2^(256-16).
///
/// ~65K hashes on average, so initializing a chain store takes well under a
/// second even on a laptop.
pub const GENESIS_DIFFICULTY: u32 = 16;

/// Difficulty of every post-genesis block: hash below 2^(256-22).
///
/// ~4M hashes on average. The difficulty recorded in a block is what
/// validators check against, so genesis and its descendants validate
/// uniformly despite the different targets.
pub const DIFFICULTY: u32 = 22;

/// Wire protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Calculate the block subsidy at a given height.
pub fn subsidy(height: i64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        return 0;
    }
    INITIAL_SUBSIDY >> halvings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_subsidy() {
        assert_eq!(subsidy(0), 50);
        assert_eq!(subsidy(HALVING_INTERVAL - 1), 50);
    }

    #[test]
    fn test_halvings() {
        assert_eq!(subsidy(HALVING_INTERVAL), 25);
        assert_eq!(subsidy(HALVING_INTERVAL * 2), 12);
        assert_eq!(subsidy(HALVING_INTERVAL * 5), 1);
    }

    #[test]
    fn test_subsidy_reaches_zero() {
        // 50 >> 6 == 0, so emission stops at the sixth halving.
        assert_eq!(subsidy(HALVING_INTERVAL * 6), 0);
        assert_eq!(subsidy(HALVING_INTERVAL * 7), 0);
        assert_eq!(subsidy(HALVING_INTERVAL * 100), 0);
    }

    #[test]
    fn test_total_emission_below_cap() {
        let mut total: u64 = 0;
        let mut height: i64 = 0;
        loop {
            let reward = subsidy(height);
            if reward == 0 {
                break;
            }
            total += reward * HALVING_INTERVAL as u64;
            height += HALVING_INTERVAL;
        }
        // 210,000 * (50 + 25 + 12 + 6 + 3 + 1) = 20,370,000
        assert!(total <= MAX_SUPPLY);
        assert_eq!(total, 20_370_000);
    }
}
