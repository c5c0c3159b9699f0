//! Grain identities.
//!
//! An [`ActorIdentity`] is a grain kind plus a key. Identities never change and
//! are the only handle a caller needs: where the grain lives is resolved on
//! every call.
//!
//! # Textual form
//!
//! ```text
//! shortener/s:ABC123
//! counter/i:42
//! session/g:67e55044-10b1-426f-9247-bb680e5fe0c8
//! order/c:67e55044-10b1-426f-9247-bb680e5fe0c8+line-7
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RuntimeError;

/// The kind of a grain, the name it was registered under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorKind(String);

impl ActorKind {
    /// Create a kind from its registered name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The registered name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorKind {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ActorKind {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// The key half of an identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActorKey {
    /// Free-form string key, e.g. a short code.
    Str(String),
    /// Integer key.
    Int(i64),
    /// GUID key.
    Guid(Uuid),
    /// GUID plus string extension.
    Compound(Uuid, String),
}

impl fmt::Display for ActorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorKey::Str(s) => write!(f, "s:{s}"),
            ActorKey::Int(i) => write!(f, "i:{i}"),
            ActorKey::Guid(g) => write!(f, "g:{g}"),
            ActorKey::Compound(g, ext) => write!(f, "c:{g}+{ext}"),
        }
    }
}

impl ActorKey {
    fn parse(text: &str) -> Result<Self, RuntimeError> {
        let invalid = || RuntimeError::InvalidRequest(format!("malformed actor key '{text}'"));
        let (tag, body) = text.split_once(':').ok_or_else(invalid)?;
        match tag {
            "s" => Ok(ActorKey::Str(body.to_string())),
            "i" => body.parse().map(ActorKey::Int).map_err(|_| invalid()),
            "g" => Uuid::parse_str(body).map(ActorKey::Guid).map_err(|_| invalid()),
            "c" => {
                let (guid, ext) = body.split_once('+').ok_or_else(invalid)?;
                let guid = Uuid::parse_str(guid).map_err(|_| invalid())?;
                Ok(ActorKey::Compound(guid, ext.to_string()))
            }
            _ => Err(invalid()),
        }
    }
}

impl From<&str> for ActorKey {
    fn from(key: &str) -> Self {
        ActorKey::Str(key.to_string())
    }
}

impl From<String> for ActorKey {
    fn from(key: String) -> Self {
        ActorKey::Str(key)
    }
}

impl From<i64> for ActorKey {
    fn from(key: i64) -> Self {
        ActorKey::Int(key)
    }
}

impl From<Uuid> for ActorKey {
    fn from(key: Uuid) -> Self {
        ActorKey::Guid(key)
    }
}

/// Full grain identity: kind plus key.
///
/// # Examples
///
/// ```rust
/// use grainline::identity::ActorIdentity;
///
/// let id = ActorIdentity::new("shortener", "ABC123");
/// assert_eq!(id.to_string(), "shortener/s:ABC123");
/// assert_eq!(ActorIdentity::parse("shortener/s:ABC123").unwrap(), id);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorIdentity {
    kind: ActorKind,
    key: ActorKey,
}

impl ActorIdentity {
    /// Build an identity from a kind and a key.
    pub fn new(kind: impl Into<ActorKind>, key: impl Into<ActorKey>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// The grain kind.
    pub fn kind(&self) -> &ActorKind {
        &self.kind
    }

    /// The grain key.
    pub fn key(&self) -> &ActorKey {
        &self.key
    }

    /// Parse the textual form produced by `Display`.
    pub fn parse(text: &str) -> Result<Self, RuntimeError> {
        let (kind, key) = text.split_once('/').ok_or_else(|| {
            RuntimeError::InvalidRequest(format!("malformed actor identity '{text}'"))
        })?;
        let id = Self::new(kind, ActorKey::parse(key)?);
        id.validate()?;
        Ok(id)
    }

    /// Reject identities that cannot be routed.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let kind = self.kind.as_str();
        if kind.is_empty() || kind.contains('/') {
            return Err(RuntimeError::InvalidRequest(format!(
                "invalid grain kind '{kind}'"
            )));
        }
        if let ActorKey::Str(s) = &self.key {
            if s.is_empty() {
                return Err(RuntimeError::InvalidRequest(
                    "string keys must not be empty".into(),
                ));
            }
        }
        Ok(())
    }

    /// Hash that is identical on every silo and every build.
    ///
    /// Used to place the identity on the directory ring, so it must not
    /// depend on `std`'s randomly seeded hasher.
    pub fn stable_hash(&self) -> u64 {
        fnv1a(self.to_string().as_bytes())
    }
}

impl fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a.
pub(crate) fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}
