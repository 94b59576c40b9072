// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Capacity and Quota Arithmetic
//!
//! Kubernetes capacities arrive either as raw byte counts or as quantity
//! strings (`"10Gi"`, `"500M"`). The backend enforces fileset quotas in
//! KiB, so every size is converted with a ceiling division and then raised
//! to the backend's minimum block limit.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KIB: u64 = 1024;
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Smallest block limit the backend accepts for a fileset quota, in KiB.
pub const MIN_BLOCK_LIMIT_KIB: u64 = 1_048_576;

/// Volumes at or below this size get the small default inode limit.
pub const INODE_LIMIT_THRESHOLD_BYTES: u64 = 10 * GIB;
pub const DEFAULT_INODE_LIMIT_SMALL: u64 = 100_000;
pub const DEFAULT_INODE_LIMIT_LARGE: u64 = 200_000;

/// Size requested when a CreateVolume carries no capacity range.
pub const DEFAULT_VOLUME_SIZE_BYTES: u64 = GIB;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("invalid size '{0}': expected an integer or decimal with an optional Ki/Mi/Gi/Ti/Pi or K/M/G/T/P suffix")]
    InvalidSize(String),

    #[error("size '{0}' overflows the supported range")]
    Overflow(String),
}

/// Limits applied to a fileset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Hard block limit in KiB.
    pub block_limit_kib: u64,
    /// Maximum number of inodes; `0` means no fileset-level cap.
    pub inode_limit: u64,
}

impl QuotaLimits {
    pub fn for_capacity(capacity_bytes: u64, inode_limit: u64) -> Self {
        Self {
            block_limit_kib: block_limit_kib(capacity_bytes),
            inode_limit,
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.block_limit_kib.saturating_mul(KIB)
    }
}

fn multiplier(suffix: &str) -> Option<u64> {
    let value = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        _ => return None,
    };
    Some(value)
}

/// Parse a Kubernetes-style quantity into bytes.
///
/// Binary suffixes (`Ki`, `Mi`, `Gi`, `Ti`, `Pi`) are powers of 1024, decimal
/// suffixes (`K`, `M`, `G`, `T`, `P`) powers of 1000. Fractional values are
/// rounded up to the next whole byte.
pub fn parse_size(input: &str) -> Result<u64, QuotaError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);

    if number.is_empty() || number.matches('.').count() > 1 {
        return Err(QuotaError::InvalidSize(input.to_string()));
    }
    let factor = multiplier(suffix).ok_or_else(|| QuotaError::InvalidSize(input.to_string()))?;

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(factor)
            .ok_or_else(|| QuotaError::Overflow(input.to_string()));
    }

    let value: f64 = number
        .parse()
        .map_err(|_| QuotaError::InvalidSize(input.to_string()))?;
    let bytes = (value * factor as f64).ceil();
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(QuotaError::Overflow(input.to_string()));
    }
    Ok(bytes as u64)
}

/// Bytes to KiB, rounding up.
pub fn bytes_to_kib_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(KIB)
}

/// Block limit for a requested capacity: KiB ceiling, never below the floor.
pub fn block_limit_kib(capacity_bytes: u64) -> u64 {
    bytes_to_kib_ceil(capacity_bytes).max(MIN_BLOCK_LIMIT_KIB)
}

/// Default inode limit for an independent fileset of the given size.
pub fn default_inode_limit(capacity_bytes: u64) -> u64 {
    if capacity_bytes <= INODE_LIMIT_THRESHOLD_BYTES {
        DEFAULT_INODE_LIMIT_SMALL
    } else {
        DEFAULT_INODE_LIMIT_LARGE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binary_and_decimal_suffixes() {
        assert_eq!(parse_size("1Gi").unwrap(), 1_073_741_824);
        assert_eq!(parse_size("500Mi").unwrap(), 524_288_000);
        assert_eq!(parse_size("2Ti").unwrap(), 2 * (1u64 << 40));
        assert_eq!(parse_size("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("10k").unwrap(), 10_000);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("1.5Gi").unwrap(), 1_610_612_736);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse_size("Gi"), Err(QuotaError::InvalidSize(_))));
        assert!(matches!(parse_size("10XB"), Err(QuotaError::InvalidSize(_))));
        assert!(matches!(parse_size("1.2.3Gi"), Err(QuotaError::InvalidSize(_))));
        assert!(matches!(parse_size("99999999999Pi"), Err(QuotaError::Overflow(_))));
    }

    #[test]
    fn test_block_limit_floor() {
        // 500Mi is below the backend floor
        assert_eq!(block_limit_kib(parse_size("500Mi").unwrap()), MIN_BLOCK_LIMIT_KIB);
        assert_eq!(block_limit_kib(parse_size("1Gi").unwrap()), 1_048_576);
        assert_eq!(block_limit_kib(parse_size("2Gi").unwrap()), 2_097_152);
        assert_eq!(block_limit_kib(0), MIN_BLOCK_LIMIT_KIB);
    }

    #[test]
    fn test_decimal_sizes_round_up_to_kib() {
        // 3G = 3_000_000_000 bytes = 2_929_687.5 KiB
        assert_eq!(block_limit_kib(parse_size("3G").unwrap()), 2_929_688);
        assert_eq!(bytes_to_kib_ceil(1), 1);
        assert_eq!(bytes_to_kib_ceil(1024), 1);
        assert_eq!(bytes_to_kib_ceil(1025), 2);
    }

    #[test]
    fn test_default_inode_limit_threshold() {
        assert_eq!(default_inode_limit(parse_size("10Gi").unwrap()), 100_000);
        assert_eq!(default_inode_limit(parse_size("10Gi").unwrap() + 1), 200_000);
        assert_eq!(default_inode_limit(parse_size("1Gi").unwrap()), 100_000);
    }
}
