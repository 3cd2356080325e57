//! Projection of ledger addresses into membership-set commitments.
//!
//! The commitment must be usable as a leaf in the on-chain membership tree,
//! so it has to be a BN254 scalar-field element. Voters normally choose
//! their own commitment and keep the preimage; projecting `H(address)` is
//! the demo identity scheme the creator payload opts into via
//! `eligible_addresses`.

use crate::error::{AppError, AppResult};
use ethers::core::types::{H160, U256};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::str::FromStr;

const BN254_FR_MODULUS: &str =
    "21888242871839275222246405745257275088548364400416034343698204186575808495617";

static FR_MODULUS: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(BN254_FR_MODULUS.as_bytes(), 10).expect("valid modulus"));

/// Deterministic address → field element projection, always `< p`.
pub fn project_address(address: H160) -> U256 {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    let digest = hasher.finalize();
    let reduced = BigUint::from_bytes_be(&digest) % &*FR_MODULUS;
    biguint_to_u256(&reduced)
}

/// Parses a creator-supplied commitment, decimal or 0x-hex, and enforces
/// that it is a canonical field element.
pub fn parse_commitment(value: &str) -> AppResult<U256> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("empty commitment".into()));
    }
    let big = if let Some(hex_str) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        BigUint::parse_bytes(hex_str.as_bytes(), 16)
            .ok_or_else(|| AppError::Validation(format!("invalid hex commitment: {trimmed}")))?
    } else {
        BigUint::from_str(trimmed)
            .map_err(|e| AppError::Validation(format!("invalid decimal commitment: {e}")))?
    };
    if big >= *FR_MODULUS {
        return Err(AppError::Validation(
            "commitment exceeds the scalar field".into(),
        ));
    }
    Ok(biguint_to_u256(&big))
}

/// Parses a checksummed or lowercase ledger address.
pub fn parse_address(value: &str) -> AppResult<H160> {
    H160::from_str(value.trim())
        .map_err(|e| AppError::Validation(format!("invalid address {value}: {e}")))
}

/// Canonical off-chain form of an address: lowercased 0x-hex.
pub fn normalize_address(address: H160) -> String {
    format!("{address:#x}")
}

fn biguint_to_u256(value: &BigUint) -> U256 {
    let bytes = value.to_bytes_be();
    U256::from_big_endian(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_is_deterministic_and_in_field() {
        let addr = parse_address("0x00000000000000000000000000000000000000bb").unwrap();
        let a = project_address(addr);
        let b = project_address(addr);
        assert_eq!(a, b);
        let modulus = U256::from_dec_str(BN254_FR_MODULUS).unwrap();
        assert!(a < modulus);
    }

    #[test]
    fn distinct_addresses_project_to_distinct_commitments() {
        let a = project_address(parse_address("0x00000000000000000000000000000000000000aa").unwrap());
        let b = project_address(parse_address("0x00000000000000000000000000000000000000ab").unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn parse_commitment_accepts_decimal_and_hex() {
        let dec = parse_commitment("255").unwrap();
        let hex = parse_commitment("0xff").unwrap();
        assert_eq!(dec, hex);
        assert_eq!(dec, U256::from(255u64));
    }

    #[test]
    fn parse_commitment_rejects_out_of_field_values() {
        assert!(parse_commitment(BN254_FR_MODULUS).is_err());
        assert!(parse_commitment("").is_err());
        assert!(parse_commitment("not-a-number").is_err());
    }

    #[test]
    fn normalize_lowercases() {
        let addr = parse_address("0x00000000000000000000000000000000000000AA").unwrap();
        assert_eq!(
            normalize_address(addr),
            "0x00000000000000000000000000000000000000aa"
        );
    }
}
