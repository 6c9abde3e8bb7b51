// Core identifier types used across all busline components
use crate::error::GuidError;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Unix user ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub u32);

impl UserId {
    pub const ROOT: UserId = UserId(0);

    pub fn is_root(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Unix group ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server instance identifier: 16 bytes, written as 32 lowercase hex characters.
///
/// The first 12 bytes are random, the last 4 carry the creation time in
/// seconds, so two servers started on the same host practically never collide.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guid([u8; Guid::LEN]);

impl Guid {
    pub const LEN: usize = 16;
    pub const HEX_LEN: usize = Self::LEN * 2;

    pub fn generate() -> Self {
        let random: [u8; 12] = rand::random();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);

        let mut bytes = [0u8; Self::LEN];
        bytes[..12].copy_from_slice(&random);
        bytes[12..].copy_from_slice(&now.to_be_bytes());
        Guid(bytes)
    }

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Guid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Guid {
    type Err = GuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::HEX_LEN {
            return Err(GuidError::Length {
                expected: Self::HEX_LEN,
                actual: s.len(),
            });
        }
        let mut bytes = [0u8; Self::LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| GuidError::NotHex)?;
        Ok(Guid(bytes))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Guid({})", self.to_hex())
    }
}
