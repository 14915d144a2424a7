//! Proof-of-work: difficulty retargeting, target checks and the puzzle
//! pre-image.

use crate::arith::{decode_compact, encode_compact};
use crate::blockchain::{BlockHeader, BlockId, ChainIndex, Sha256Hash};
use crate::consensus::ConsensusParams;
use crate::zk::PuzzleVerifier;
use blake2b_simd::Params;
use primitive_types::{U256, U512};
use tracing::trace;

/// Target returned once the difficulty bomb has gone off.
const BOMB_TARGET: u64 = 0xffff;

/// Compact bits the block following `prev` must declare.
///
/// The first matching rule wins: genesis, entering or leaving the fork window,
/// the difficulty bomb, the testnet minimum-difficulty relaxation, disabled
/// retargeting, and finally the averaged retarget.
pub fn next_work_required(
    index: &ChainIndex,
    prev: Option<BlockId>,
    header: &BlockHeader,
    params: &ConsensusParams,
) -> u32 {
    let prev = match prev {
        Some(prev) => prev,
        None => return encode_compact(params.pow_floor(0)),
    };

    let last = index.get(prev);
    let next_height = last.height as i64 + 1;
    let floor = params.pow_floor(next_height);
    let floor_bits = encode_compact(floor);

    let is_fork = params.is_fork_block(next_height);
    let regime = params.regime(is_fork);
    let was_fork = params.is_fork_block(next_height - regime.averaging_window as i64);

    if is_fork != was_fork {
        trace!(next_height, is_fork, "difficulty reset at fork window boundary");
        return floor_bits;
    }

    if last.height > params.pow_difficulty_bomb_height {
        return encode_compact(U256::from(BOMB_TARGET));
    }

    if params.pow_allow_min_difficulty_blocks
        && header.time as i64 > last.header.time as i64 + regime.target_spacing * 2
    {
        return floor_bits;
    }

    if params.pow_no_retargeting {
        return last.header.bits;
    }

    let window = regime.averaging_window as usize;
    let mut total = U512::zero();
    let mut cursor = Some(prev);
    for _ in 0..window {
        let id = match cursor {
            Some(id) => id,
            None => break,
        };
        let entry = index.get(id);
        total += U512::from(decode_compact(entry.header.bits).value);
        cursor = entry.parent;
    }

    // The block just before the window; missing means not enough history.
    let first = match cursor {
        Some(first) => first,
        None => return floor_bits,
    };

    let average = total / U512::from(window as u64);
    calculate_next_work_required(
        average,
        index.median_time_past(prev),
        index.median_time_past(first),
        params,
        floor,
        is_fork,
    )
}

/// Retarget from an average target and the time the window took.
///
/// The actual timespan is dampened to a quarter of its deviation, clamped to
/// the regime's bounds, and the result never exceeds `floor`.
pub fn calculate_next_work_required(
    average: U512,
    last_time: i64,
    first_time: i64,
    params: &ConsensusParams,
    floor: U256,
    is_fork: bool,
) -> u32 {
    let regime = params.regime(is_fork);
    let expected = regime.averaging_window_timespan();

    let mut actual = last_time - first_time;
    actual = expected + (actual - expected) / 4;
    actual = actual.clamp(regime.min_actual_timespan(), regime.max_actual_timespan());

    let mut target = average / U512::from(expected as u64);
    target *= U512::from(actual as u64);

    let floor_wide = U512::from(floor);
    let target = if target > floor_wide {
        floor
    } else {
        // Fits: it is no larger than a 256-bit value.
        let mut bytes = [0u8; 64];
        target.to_big_endian(&mut bytes);
        U256::from_big_endian(&bytes[32..])
    };
    encode_compact(target)
}

/// Whether `hash`, read as a big-endian integer, meets the target `bits`.
pub fn check_proof_of_work(hash: &Sha256Hash, bits: u32, params: &ConsensusParams) -> bool {
    let target = decode_compact(bits);
    if target.negative || target.overflow || target.value.is_zero() || target.value > params.pow_limit {
        return false;
    }
    U256::from_big_endian(hash) <= target.value
}

/// BLAKE2b state the puzzle solution is checked against: personalized with
/// `(n, k)`, fed with the header minus nonce and solution, then the nonce.
pub fn puzzle_state(header: &BlockHeader, n: u32, k: u32) -> Option<blake2b_simd::State> {
    if n == 0 || n > 512 {
        return None;
    }
    let hash_length = ((512 / n) * n / 8) as usize;
    if hash_length == 0 || hash_length > blake2b_simd::OUTBYTES {
        return None;
    }

    let mut personal = [0u8; 16];
    personal[..8].copy_from_slice(b"ZcashPoW");
    personal[8..12].copy_from_slice(&n.to_le_bytes());
    personal[12..].copy_from_slice(&k.to_le_bytes());

    let mut state = Params::new().hash_length(hash_length).personal(&personal).to_state();
    state.update(&header.puzzle_preimage());
    state.update(&header.nonce);
    Some(state)
}

pub fn check_puzzle_solution(header: &BlockHeader, params: &ConsensusParams, verifier: &dyn PuzzleVerifier) -> bool {
    let (n, k) = (params.equihash_n, params.equihash_k);
    match puzzle_state(header, n, k) {
        Some(state) => verifier.verify_solution(n, k, &state, &header.solution),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Network;
    use proptest::prelude::*;

    const EASY_BITS: u32 = 0x1f07ffff;

    fn mainnet_like() -> ConsensusParams {
        ConsensusParams::for_network(Network::Main)
    }

    /// Chain of `len` blocks `spacing` seconds apart, all declaring `bits`.
    fn chain(len: usize, spacing: u32, bits: u32) -> (ChainIndex, Vec<BlockId>) {
        let mut index = ChainIndex::new();
        let mut ids = Vec::new();
        let mut prev_hash = [0u8; 32];
        for i in 0..len {
            let id = index.insert(BlockHeader {
                prev_hash,
                time: 1_500_000_000 + i as u32 * spacing,
                bits,
                ..Default::default()
            });
            prev_hash = index.get(id).hash;
            ids.push(id);
        }
        (index, ids)
    }

    #[test]
    fn test_genesis_gets_pre_fork_floor() {
        let params = mainnet_like();
        let bits = next_work_required(&ChainIndex::new(), None, &BlockHeader::default(), &params);
        assert_eq!(bits, encode_compact(params.pre_fork_pow_limit));
    }

    #[test]
    fn test_short_history_gets_floor() {
        let params = mainnet_like();
        let (index, ids) = chain(5, 150, EASY_BITS);
        let bits = next_work_required(&index, ids.last().copied(), &BlockHeader::default(), &params);
        assert_eq!(bits, encode_compact(params.pre_fork_pow_limit));
    }

    #[test]
    fn test_on_schedule_keeps_difficulty() {
        let params = mainnet_like();
        let target = U256::MAX >> 40usize;
        let bits = encode_compact(target);
        let (index, ids) = chain(40, 150, bits);
        let next = next_work_required(&index, ids.last().copied(), &BlockHeader::default(), &params);
        // Average of identical targets divided and re-multiplied by the same
        // timespan loses at most rounding in the last mantissa digit.
        let got = decode_compact(next).value;
        let diff = if got > target { got - target } else { target - got };
        assert!(diff <= target / U256::from(1_000u64));
    }

    #[test]
    fn test_fast_blocks_raise_difficulty() {
        let params = mainnet_like();
        let bits = encode_compact(U256::MAX >> 40usize);
        let (index, ids) = chain(40, 30, bits);
        let next = next_work_required(&index, ids.last().copied(), &BlockHeader::default(), &params);
        assert!(decode_compact(next).value < decode_compact(bits).value);
    }

    #[test]
    fn test_fork_window_entry_and_exit_reset() {
        let mut params = ConsensusParams::regtest();
        params.pow_no_retargeting = false;
        params.fork_start_height = 50;
        params.fork_height_range = 100;
        let (index, ids) = chain(160, 60, EASY_BITS);
        let floor = encode_compact(params.pow_limit);
        // Next height 51 is the first fork block; 51 - 30 lies before the window.
        assert_eq!(next_work_required(&index, Some(ids[50]), &BlockHeader::default(), &params), floor);
        // Next height 151 is past the window; 151 - 17 lies inside it.
        assert_eq!(next_work_required(&index, Some(ids[150]), &BlockHeader::default(), &params), floor);
        // Deep inside the window the averaged retarget applies again.
        assert_ne!(next_work_required(&index, Some(ids[100]), &BlockHeader::default(), &params), floor);
    }

    #[test]
    fn test_bomb_target() {
        let mut params = ConsensusParams::regtest();
        params.pow_difficulty_bomb_height = 3;
        let (index, ids) = chain(6, 60, EASY_BITS);
        let bits = next_work_required(&index, Some(ids[4]), &BlockHeader::default(), &params);
        assert_eq!(bits, 0x0300ffff);
        // At the bomb height itself the rule has not fired yet.
        let bits = next_work_required(&index, Some(ids[3]), &BlockHeader::default(), &params);
        assert_eq!(bits, EASY_BITS);
    }

    #[test]
    fn test_testnet_min_difficulty_relaxation() {
        let params = ConsensusParams::testnet();
        let bits = encode_compact(U256::MAX >> 40usize);
        let (index, ids) = chain(40, 150, bits);
        let late = BlockHeader {
            time: index.get(ids[39]).header.time + 150 * 2 + 1,
            ..Default::default()
        };
        let next = next_work_required(&index, Some(ids[39]), &late, &params);
        assert_eq!(next, encode_compact(params.pre_fork_pow_limit));
    }

    #[test]
    fn test_no_retargeting_repeats_bits() {
        let params = ConsensusParams::regtest();
        let (index, ids) = chain(3, 60, 0x1f00ffff);
        let bits = next_work_required(&index, Some(ids[2]), &BlockHeader::default(), &params);
        assert_eq!(bits, 0x1f00ffff);
    }

    #[test]
    fn test_check_proof_of_work_rejects_bad_targets() {
        let params = mainnet_like();
        let zero_hash = [0u8; 32];
        assert!(!check_proof_of_work(&zero_hash, 0x04923456, &params), "negative");
        assert!(!check_proof_of_work(&zero_hash, 0xff123456, &params), "overflow");
        assert!(!check_proof_of_work(&zero_hash, 0x01003456, &params), "zero");
        assert!(!check_proof_of_work(&zero_hash, 0x2100ffff, &params), "above limit");
        assert!(check_proof_of_work(&zero_hash, encode_compact(params.pow_limit), &params));
    }

    #[test]
    fn test_hash_is_read_big_endian() {
        let params = ConsensusParams::regtest();
        let bits = encode_compact(U256::MAX >> 8usize);
        let mut hash = [0u8; 32];
        hash[31] = 0xff;
        assert!(check_proof_of_work(&hash, bits, &params));
        hash = [0u8; 32];
        hash[0] = 0xff;
        assert!(!check_proof_of_work(&hash, bits, &params));
    }

    struct ExpectState(blake2b_simd::Hash);

    impl PuzzleVerifier for ExpectState {
        fn verify_solution(&self, _n: u32, _k: u32, state: &blake2b_simd::State, solution: &[u8]) -> bool {
            state.finalize() == self.0 && solution == [1, 2, 3]
        }
    }

    #[test]
    fn test_puzzle_state_covers_nonce() {
        let params = ConsensusParams::regtest();
        let header = BlockHeader {
            nonce: [7u8; 32],
            solution: vec![1, 2, 3],
            ..Default::default()
        };
        let expected = puzzle_state(&header, params.equihash_n, params.equihash_k).unwrap().finalize();
        assert_eq!(expected.as_bytes().len(), (512 / 48) * 48 / 8);
        assert!(check_puzzle_solution(&header, &params, &ExpectState(expected)));

        let mut other_nonce = header.clone();
        other_nonce.nonce[0] = 8;
        assert!(!check_puzzle_solution(&other_nonce, &params, &ExpectState(expected)));

        // The solution is handed to the verifier, not hashed into the state.
        let mut other_solution = header.clone();
        other_solution.solution = vec![9, 9];
        let state = puzzle_state(&other_solution, params.equihash_n, params.equihash_k).unwrap();
        assert_eq!(state.finalize(), expected);
        assert!(!check_puzzle_solution(&other_solution, &params, &ExpectState(expected)));
    }

    proptest! {
        #[test]
        fn prop_retarget_monotonic_and_capped(
            shift in 20usize..60,
            a in 0i64..20_000,
            b in 0i64..20_000,
        ) {
            let params = mainnet_like();
            let floor = params.pow_limit;
            let average = U512::from(U256::MAX >> shift);
            let (short, long) = if a <= b { (a, b) } else { (b, a) };

            let fast = decode_compact(calculate_next_work_required(average, short, 0, &params, floor, false)).value;
            let slow = decode_compact(calculate_next_work_required(average, long, 0, &params, floor, false)).value;
            prop_assert!(fast <= slow);
            prop_assert!(slow <= floor);
        }
    }
}
