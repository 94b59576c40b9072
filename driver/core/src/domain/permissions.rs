// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Octal permission strings and their NFSv4 ACL rendering.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::backend::{AceType, Acl, AclEntry, BackendVersion};
use crate::domain::error::CsiError;

/// Oldest backend release that applies owner and mode on fileset creation.
pub fn min_permissions_version() -> BackendVersion {
    BackendVersion::new(&[5, 1, 1, 2])
}

/// Canonical letter order used when rendering an ACE permission string.
const ACE_LETTER_ORDER: &str = "rwmxDaAnNcCos";
const READ_LETTERS: &str = "ranc";
const WRITE_LETTERS: &str = "wmDANs";
const EXECUTE_LETTERS: &str = "x";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions(u32);

impl Permissions {
    pub const SHARED: Permissions = Permissions(0o777);
    pub const DEFAULT_DIRECTORY: Permissions = Permissions(0o771);

    pub fn mode(&self) -> u32 {
        self.0
    }

    pub fn owner(&self) -> u32 {
        (self.0 >> 6) & 0o7
    }

    pub fn group(&self) -> u32 {
        (self.0 >> 3) & 0o7
    }

    pub fn other(&self) -> u32 {
        self.0 & 0o7
    }

    /// Three allow entries (owner@, group@, everyone@) equivalent to this mode.
    pub fn to_acl(&self) -> Acl {
        let entries = [
            ("special:owner@", self.owner()),
            ("special:group@", self.group()),
            ("special:everyone@", self.other()),
        ]
        .into_iter()
        .map(|(who, bits)| AclEntry {
            ace_type: AceType::Allow,
            who: who.to_string(),
            permissions: ace_letters(bits),
            flags: String::new(),
        })
        .collect();
        Acl { entries }
    }
}

fn ace_letters(bits: u32) -> String {
    let mut granted = String::new();
    if bits & 0o4 != 0 {
        granted.push_str(READ_LETTERS);
    }
    if bits & 0o2 != 0 {
        granted.push_str(WRITE_LETTERS);
    }
    if bits & 0o1 != 0 {
        granted.push_str(EXECUTE_LETTERS);
    }
    ACE_LETTER_ORDER
        .chars()
        .filter(|c| granted.contains(*c))
        .collect()
}

impl FromStr for Permissions {
    type Err = CsiError;

    /// Accepts `"777"` or `"0777"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim();
        let digits = if digits.len() == 4 { digits.strip_prefix('0').unwrap_or(digits) } else { digits };
        if digits.len() != 3 || !digits.chars().all(|c| ('0'..='7').contains(&c)) {
            return Err(CsiError::invalid(format!(
                "invalid permissions '{}': expected three octal digits such as 777",
                s
            )));
        }
        u32::from_str_radix(digits, 8)
            .map(Permissions)
            .map_err(|_| CsiError::invalid(format!("invalid permissions '{}'", s)))
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03o}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_octal() {
        assert_eq!("777".parse::<Permissions>().unwrap().mode(), 0o777);
        assert_eq!("0750".parse::<Permissions>().unwrap().mode(), 0o750);
        assert_eq!("750".parse::<Permissions>().unwrap().to_string(), "750");
        assert!("778".parse::<Permissions>().is_err());
        assert!("rwx".parse::<Permissions>().is_err());
        assert!("1777".parse::<Permissions>().is_err());
    }

    #[test]
    fn test_acl_rendering() {
        let acl = "750".parse::<Permissions>().unwrap().to_acl();
        assert_eq!(acl.entries.len(), 3);
        assert_eq!(acl.entries[0].who, "special:owner@");
        assert_eq!(acl.entries[0].permissions, "rwmxDaAnNcs");
        assert_eq!(acl.entries[1].permissions, "rxanc");
        assert_eq!(acl.entries[2].permissions, "");
    }
}
