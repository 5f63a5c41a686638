use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::ids::NodeId;

/// Network id used for generated clusters unless the caller supplies one.
pub const DEFAULT_NETWORK_ID: u32 = 1337;

/// Stake every genesis validator starts with.
const VALIDATOR_STAKE: u64 = 2_000_000_000_000_000;
/// One year, matching the primary-network validation duration.
const INITIAL_STAKE_DURATION_SECS: u64 = 31_536_000;
const INITIAL_STAKE_DURATION_OFFSET_SECS: u64 = 5_400;
const DELEGATION_FEE: u32 = 10_000;

const GENESIS_NETWORK_ID_KEY: &str = "networkID";

/// Read the network id out of a genesis document.
pub fn network_id_from_genesis(genesis: &str) -> Result<u32> {
    let doc: Value = serde_json::from_str(genesis)
        .map_err(|e| Error::Validation(format!("couldn't parse genesis: {}", e)))?;
    doc.get(GENESIS_NETWORK_ID_KEY)
        .and_then(Value::as_u64)
        .map(|id| id as u32)
        .ok_or_else(|| {
            Error::Validation(format!(
                "couldn't find key {:?} in genesis",
                GENESIS_NETWORK_ID_KEY
            ))
        })
}

/// Build a genesis document for a custom network whose initial validator set
/// is `validators`. Funds are allocated to the pre-funded test address so the
/// wallet gateway can issue transactions, and the C-chain genesis carries the
/// same allocation in EVM form.
pub fn new_genesis(network_id: u32, validators: &[NodeId]) -> Result<String> {
    match network_id {
        1 | 5 | 12345 => {
            return Err(Error::Validation(format!(
                "network id {} is reserved for a well-known network",
                network_id
            )))
        }
        _ => {}
    }
    if validators.is_empty() {
        return Err(Error::Validation("no genesis validators provided".into()));
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let stake_addr = random_address();
    let reward_addr = random_address();
    let total_stake = VALIDATOR_STAKE * validators.len() as u64;

    let stakers: Vec<Value> = validators
        .iter()
        .map(|node_id| {
            json!({
                "nodeID": node_id,
                "rewardAddress": reward_addr,
                "delegationFee": DELEGATION_FEE,
            })
        })
        .collect();

    let c_chain_genesis = json!({
        "config": { "chainId": network_id },
        "gasLimit": "0x7a1200",
        "difficulty": "0x0",
        "alloc": {
            "0x0100000000000000000000000000000000000000": { "balance": "0x295be96e64066972000000" },
        },
    });

    let genesis = json!({
        "networkID": network_id,
        "allocations": [
            {
                "ethAddr": "0x0000000000000000000000000000000000000000",
                "luxAddr": stake_addr,
                "initialAmount": 0,
                "unlockSchedule": [ { "amount": total_stake } ],
            },
        ],
        "startTime": now,
        "initialStakedFunds": [stake_addr],
        "initialStakeDuration": INITIAL_STAKE_DURATION_SECS,
        "initialStakeDurationOffset": INITIAL_STAKE_DURATION_OFFSET_SECS,
        "initialStakers": stakers,
        "cChainGenesis": c_chain_genesis.to_string(),
        "message": "netrunner",
    });

    serde_json::to_string_pretty(&genesis)
        .map_err(|e| Error::Validation(format!("couldn't serialize genesis: {}", e)))
}

fn random_address() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("X-custom{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StakingIdentity;

    #[test]
    fn test_network_id_round_trip() {
        let id = StakingIdentity::generate().unwrap();
        let genesis = new_genesis(1337, &[id.node_id]).unwrap();
        assert_eq!(network_id_from_genesis(&genesis).unwrap(), 1337);
    }

    #[test]
    fn test_rejects_well_known_network_ids() {
        let id = StakingIdentity::generate().unwrap();
        for reserved in [1, 5, 12345] {
            assert!(new_genesis(reserved, &[id.node_id.clone()]).is_err());
        }
    }

    #[test]
    fn test_rejects_empty_validator_set() {
        assert!(new_genesis(1337, &[]).is_err());
    }

    #[test]
    fn test_all_validators_staked() {
        let ids: Vec<_> = (0..3)
            .map(|_| StakingIdentity::generate().unwrap().node_id)
            .collect();
        let genesis = new_genesis(1337, &ids).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&genesis).unwrap();
        assert_eq!(doc["initialStakers"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_missing_network_id_rejected() {
        assert!(network_id_from_genesis("{}").is_err());
        assert!(network_id_from_genesis("not json").is_err());
    }
}
