use serde::{Deserialize, Serialize};
use std::fmt;

/// Flags controlling a single link operation.
///
/// The numeric values match the flag constants published by the boundary so
/// raw values passed through it can be converted with [`LinkFlags::from_bits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LinkFlags(u32);

impl LinkFlags {
    /// Fail instead of overwriting an existing destination.
    pub const FAIL_IF_EXISTS: Self = Self(0x0000_0001);
    /// Keep a statically linked directory in sync with its source.
    pub const MONITOR_CHANGES: Self = Self(0x0000_0002);
    /// Redirect file creation below the destination to the source.
    pub const CREATE_TARGET: Self = Self(0x0000_0004);
    /// Link directories recursively.
    pub const RECURSIVE: Self = Self(0x0000_0008);
    /// Fail the whole operation if any entry matches a skip rule.
    pub const FAIL_IF_SKIPPED: Self = Self(0x0000_0010);

    const NAMES: [(Self, &'static str); 5] = [
        (Self::FAIL_IF_EXISTS, "FAIL_IF_EXISTS"),
        (Self::MONITOR_CHANGES, "MONITOR_CHANGES"),
        (Self::CREATE_TARGET, "CREATE_TARGET"),
        (Self::RECURSIVE, "RECURSIVE"),
        (Self::FAIL_IF_SKIPPED, "FAIL_IF_SKIPPED"),
    ];

    /// Creates an empty set of flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates a set containing all flags.
    pub const fn all() -> Self {
        Self(
            Self::FAIL_IF_EXISTS.0
                | Self::MONITOR_CHANGES.0
                | Self::CREATE_TARGET.0
                | Self::RECURSIVE.0
                | Self::FAIL_IF_SKIPPED.0,
        )
    }

    /// Returns the raw value of the flags.
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Creates flags from raw bits, rejecting unknown bits.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::all().0 == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    /// Creates flags from raw bits, truncating unknown bits.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::all().0)
    }

    /// Returns true if no flags are set.
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if all flags in `other` are set.
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Inserts the specified flags.
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Removes the specified flags.
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Returns the union of the flags.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns the difference of the flags.
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for LinkFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl std::ops::BitOrAssign for LinkFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.insert(rhs);
    }
}

impl std::ops::Sub for LinkFlags {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self.difference(rhs)
    }
}

impl fmt::Display for LinkFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for LinkFlags {
    type Err = String;

    /// Parses names joined by `|` or `,`, ignoring case, e.g. `recursive|monitor_changes`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = Self::empty();
        for part in s.split(['|', ',']).map(str::trim).filter(|part| !part.is_empty()) {
            let upper = part.to_uppercase().replace('-', "_");
            if upper == "NONE" {
                continue;
            }
            let (flag, _) = Self::NAMES
                .iter()
                .find(|(_, name)| *name == upper)
                .ok_or_else(|| format!("Unknown link flag: {}", part))?;
            flags.insert(*flag);
        }
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_flags_values() {
        assert_eq!(LinkFlags::FAIL_IF_EXISTS.bits(), 0x01);
        assert_eq!(LinkFlags::MONITOR_CHANGES.bits(), 0x02);
        assert_eq!(LinkFlags::CREATE_TARGET.bits(), 0x04);
        assert_eq!(LinkFlags::RECURSIVE.bits(), 0x08);
        assert_eq!(LinkFlags::FAIL_IF_SKIPPED.bits(), 0x10);
    }

    #[test]
    fn test_link_flags_from_bits() {
        let flags = LinkFlags::from_bits(0x09).unwrap();
        assert!(flags.contains(LinkFlags::RECURSIVE));
        assert!(flags.contains(LinkFlags::FAIL_IF_EXISTS));
        assert!(LinkFlags::from_bits(0x40).is_none());
        assert_eq!(LinkFlags::from_bits_truncate(0x48), LinkFlags::RECURSIVE);
    }

    #[test]
    fn test_link_flags_display() {
        assert_eq!(LinkFlags::empty().to_string(), "NONE");
        let flags = LinkFlags::RECURSIVE | LinkFlags::MONITOR_CHANGES;
        assert_eq!(flags.to_string(), "MONITOR_CHANGES|RECURSIVE");
        assert_eq!((flags - LinkFlags::RECURSIVE).to_string(), "MONITOR_CHANGES");
    }

    #[test]
    fn test_parse_flags() {
        let flags: LinkFlags = "recursive|monitor-changes".parse().unwrap();
        assert_eq!(flags, LinkFlags::RECURSIVE | LinkFlags::MONITOR_CHANGES);
        assert_eq!("NONE".parse::<LinkFlags>().unwrap(), LinkFlags::empty());
        assert_eq!(
            "FAIL_IF_EXISTS, CREATE_TARGET".parse::<LinkFlags>().unwrap(),
            LinkFlags::FAIL_IF_EXISTS | LinkFlags::CREATE_TARGET
        );
        assert!("bogus".parse::<LinkFlags>().is_err());
    }
}
