//! OP-Code resolution
//!
//! An OP-Code is a 6-character hierarchical location code `SS AA PP`:
//! school (2), area (2), point (2). Canonical form is ASCII uppercase.
//! A prefix of length 2/4/6 identifies a school/area/point scope, and
//! prefix containment is the entire permission-scoping semantics.
//!
//! Pure and total: no I/O anywhere in this module.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Reserved recipient token for drift letters (no concrete recipient scope).
pub const PUBLIC_SENTINEL: &str = "PUBLIC";

/// Canonical OP-Code length.
pub const OP_CODE_LEN: usize = 6;

/// A validated, canonical (uppercase) 6-character OP-Code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OpCode(String);

impl OpCode {
    /// Parse and canonicalise an OP-Code.
    ///
    /// Rejects wrong length, non-alphanumeric characters, and the reserved
    /// `PUBLIC` token (use [`Recipient::parse`] where `PUBLIC` is legal).
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let canon = s.trim().to_ascii_uppercase();
        if canon.len() != OP_CODE_LEN {
            return Err(CoreError::bad_input(format!(
                "op-code must be exactly {OP_CODE_LEN} characters, got {:?}",
                s.trim()
            )));
        }
        if !canon.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(CoreError::bad_input(format!(
                "op-code must be ASCII alphanumeric, got {:?}",
                s.trim()
            )));
        }
        if canon == PUBLIC_SENTINEL {
            return Err(CoreError::bad_input(
                "PUBLIC is a reserved token, not a concrete op-code",
            ));
        }
        Ok(Self(canon))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// School scope: first 2 characters.
    pub fn school(&self) -> &str {
        &self.0[..2]
    }

    /// Area scope: first 4 characters.
    pub fn area(&self) -> &str {
        &self.0[..4]
    }

    /// First `len` characters; `len` must be 2, 4 or 6.
    pub fn prefix(&self, len: usize) -> Result<&str, CoreError> {
        if !matches!(len, 2 | 4 | 6) {
            return Err(CoreError::bad_input(format!(
                "prefix length must be 2, 4 or 6, got {len}"
            )));
        }
        Ok(&self.0[..len])
    }
}

impl TryFrom<String> for OpCode {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        OpCode::parse(&s)
    }
}

impl From<OpCode> for String {
    fn from(code: OpCode) -> String {
        code.0
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A managed scope prefix of length 2 (school/city), 4 (area) or 6 (point).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OpCodePrefix(String);

impl OpCodePrefix {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let canon = s.trim().to_ascii_uppercase();
        if !matches!(canon.len(), 2 | 4 | 6) {
            return Err(CoreError::bad_input(format!(
                "managed prefix must be 2, 4 or 6 characters, got {:?}",
                s.trim()
            )));
        }
        if !canon.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(CoreError::bad_input(format!(
                "managed prefix must be ASCII alphanumeric, got {:?}",
                s.trim()
            )));
        }
        Ok(Self(canon))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True iff `target` falls inside this scope (length-agnostic).
    pub fn covers(&self, target: &OpCode) -> bool {
        target.as_str().starts_with(self.as_str())
    }

    /// Whether this prefix may handle a `PUBLIC` drift letter posted by
    /// `sender`: only school-wide or broader scopes (length 2) qualify,
    /// and only within the sender's own school.
    pub fn covers_public(&self, sender: &OpCode) -> bool {
        self.len() <= 2 && sender.as_str().starts_with(self.as_str())
    }

    /// True iff `self` begins with `parent` (equal prefixes included).
    pub fn within(&self, parent: &OpCodePrefix) -> bool {
        self.0.starts_with(parent.as_str())
    }

    /// True iff `self` strictly extends `parent` (begins with it and is longer).
    pub fn strictly_extends(&self, parent: &OpCodePrefix) -> bool {
        self.within(parent) && self.len() > parent.len()
    }
}

impl TryFrom<String> for OpCodePrefix {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        OpCodePrefix::parse(&s)
    }
}

impl From<OpCodePrefix> for String {
    fn from(prefix: OpCodePrefix) -> String {
        prefix.0
    }
}

impl std::fmt::Display for OpCodePrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A letter recipient: either a concrete OP-Code or the `PUBLIC` drift sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Recipient {
    /// Drift letter; concrete recipient resolved at or before delivery.
    Public,
    Code(OpCode),
}

impl Recipient {
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        if s.trim().eq_ignore_ascii_case(PUBLIC_SENTINEL) {
            Ok(Recipient::Public)
        } else {
            OpCode::parse(s).map(Recipient::Code)
        }
    }

    pub fn is_public(&self) -> bool {
        matches!(self, Recipient::Public)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Recipient::Public => PUBLIC_SENTINEL,
            Recipient::Code(code) => code.as_str(),
        }
    }
}

impl TryFrom<String> for Recipient {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Recipient::parse(&s)
    }
}

impl From<Recipient> for String {
    fn from(r: Recipient) -> String {
        r.as_str().to_string()
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
