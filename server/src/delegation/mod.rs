//! Delegations, caveats and permission chains.
//!
//! A permission chain is an ordered list `[leaf, ..., root]`. Every link points at its
//! parent through `authority`, which is the typed structured hash of the parent link.
//! The root link carries [`ROOT_AUTHORITY`] instead.

pub mod builder;
pub mod caveat;
mod hash;

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

pub use builder::PermissionChainBuilder;
pub use caveat::{
    CallIntent, Caveat, CaveatConfig, CaveatTerms, EnforcerKind, PeriodLimit, PeriodSpend, Scope,
    TimeWindow, TokenPeriodLimit,
};
pub use hash::SigningDomain;

use crate::{Error, Result};

/// Authority value of a root delegation.
pub const ROOT_AUTHORITY: Hash32 = Hash32([0xff; 32]);

/// Length of a stored signature: ed25519 signature followed by the signer's verifying key.
pub const SIGNATURE_LENGTH: usize = 64 + 32;

/// A 20-byte account address.
///
/// Derived from an ed25519 verifying key as the last 20 bytes of its SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&digest[12..]);
        Self(bytes)
    }

    /// Parses a `0x`-prefixed (or bare) 40 character hex string.
    pub fn parse(value: &str) -> Result<Self> {
        let stripped = value.strip_prefix("0x").unwrap_or(value);
        let bytes = hex::decode(stripped)
            .map_err(|_| Error::InvalidParameter(format!("Invalid hex address: {value}")))?;
        let array: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::InvalidParameter(format!("Address must be 20 bytes: {value}")))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Left-pads the address to a 32 byte word for structured hashing.
    pub(crate) fn to_word(self) -> [u8; 32] {
        let mut word = [0u8; 32];
        word[12..].copy_from_slice(&self.0);
        word
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Address::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// A 32-byte digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({self})")
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        let stripped = value.strip_prefix("0x").unwrap_or(&value);
        let bytes = hex::decode(stripped).map_err(serde::de::Error::custom)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("hash must be 32 bytes"))?;
        Ok(Hash32(array))
    }
}

/// Serde helper for byte vectors stored as `0x` hex strings.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        hex::decode(value.strip_prefix("0x").unwrap_or(&value)).map_err(serde::de::Error::custom)
    }
}

/// A signed grant of authority from `delegator` to `delegate`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub delegate: Address,
    pub delegator: Address,
    pub authority: Hash32,
    pub caveats: Vec<Caveat>,
    pub salt: u64,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl Delegation {
    /// An unsigned root grant.
    pub fn root(delegator: Address, delegate: Address, caveats: Vec<Caveat>, salt: u64) -> Self {
        Self {
            delegate,
            delegator,
            authority: ROOT_AUTHORITY,
            caveats,
            salt,
            signature: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.authority == ROOT_AUTHORITY
    }

    /// Deterministic structured hash, used as the child's `authority`.
    pub fn hash(&self) -> Hash32 {
        hash::delegation_hash(self)
    }

    /// Signs the delegation in place. The key must belong to the delegator.
    pub fn sign(&mut self, signing_key: &SigningKey, domain: &SigningDomain) -> Result<()> {
        let signer = Address::from_verifying_key(&signing_key.verifying_key());
        if signer != self.delegator {
            return Err(Error::integrity(format!(
                "Signer {signer} is not the delegator {}",
                self.delegator
            )));
        }

        let digest = domain.digest(&self.hash());
        let signature = signing_key.sign(digest.as_bytes());

        let mut bytes = Vec::with_capacity(SIGNATURE_LENGTH);
        bytes.extend_from_slice(&signature.to_bytes());
        bytes.extend_from_slice(signing_key.verifying_key().as_bytes());
        self.signature = bytes;

        Ok(())
    }

    /// Checks that the signature is valid and was produced by the delegator.
    pub fn verify_signature(&self, domain: &SigningDomain) -> Result<()> {
        if self.signature.len() != SIGNATURE_LENGTH {
            return Err(Error::integrity("Delegation signature has the wrong length"));
        }

        let signature_bytes: [u8; 64] = self.signature[..64]
            .try_into()
            .map_err(|_| Error::integrity("Invalid signature length"))?;
        let key_bytes: [u8; 32] = self.signature[64..]
            .try_into()
            .map_err(|_| Error::integrity("Invalid verifying key length"))?;

        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| Error::integrity("Invalid ed25519 verifying key"))?;

        if Address::from_verifying_key(&verifying_key) != self.delegator {
            return Err(Error::integrity(format!(
                "Delegation signed by a key that does not belong to delegator {}",
                self.delegator
            )));
        }

        let digest = domain.digest(&self.hash());
        verifying_key
            .verify(digest.as_bytes(), &Signature::from_bytes(&signature_bytes))
            .map_err(|_| Error::integrity("Delegation signature verification failed"))
    }
}

/// An ordered `[leaf, ..., root]` list of delegations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionChain(Vec<Delegation>);

impl PermissionChain {
    /// Wraps a list without verifying it. Use [`PermissionChain::verify`] before trusting it.
    pub fn from_links(links: Vec<Delegation>) -> Self {
        Self(links)
    }

    /// Decodes the opaque chain representation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let links: Vec<Delegation> = serde_json::from_slice(bytes)?;
        Ok(Self(links))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    pub fn links(&self) -> &[Delegation] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn leaf(&self) -> Option<&Delegation> {
        self.0.first()
    }

    pub fn root(&self) -> Option<&Delegation> {
        self.0.last()
    }

    /// Returns a new chain with `delegation` as its leaf.
    pub fn prepend(&self, delegation: Delegation) -> Self {
        let mut links = Vec::with_capacity(self.0.len() + 1);
        links.push(delegation);
        links.extend(self.0.iter().cloned());
        Self(links)
    }

    /// Verifies signatures and parent links for every level of the chain.
    ///
    /// A chain that does not end in a root delegation is partial and rejected.
    pub fn verify(&self, domain: &SigningDomain) -> Result<()> {
        let root = self
            .root()
            .ok_or_else(|| Error::integrity("Permission chain is empty"))?;
        if !root.is_root() {
            return Err(Error::integrity(
                "Permission chain does not end in a root delegation",
            ));
        }

        for (index, link) in self.0.iter().enumerate() {
            link.verify_signature(domain)?;

            if let Some(parent) = self.0.get(index + 1) {
                if link.is_root() {
                    return Err(Error::integrity(format!(
                        "Link {index} claims root authority but has a parent"
                    )));
                }
                if link.authority != parent.hash() {
                    return Err(Error::integrity(format!(
                        "Link {index} authority does not match its parent hash"
                    )));
                }
                if link.delegator != parent.delegate {
                    return Err(Error::integrity(format!(
                        "Link {index} delegator {} is not the parent's delegate {}",
                        link.delegator, parent.delegate
                    )));
                }
            }
        }

        Ok(())
    }

    /// The intersection of every caveat at every level.
    pub fn effective_scope(&self) -> Result<Scope> {
        let mut scope = Scope::default();
        for caveat in self.0.iter().flat_map(|link| link.caveats.iter()) {
            scope.restrict(&caveat.decode_terms()?);
        }
        Ok(scope)
    }

    /// Evaluates the calls against every caveat of every level, the way the ledger does at
    /// redemption. Any single failing caveat rejects the whole set of calls.
    ///
    /// `spent` is what the chain has already moved in the current period.
    pub fn authorize(&self, calls: &[CallIntent], at: u64, spent: &PeriodSpend) -> Result<()> {
        if self.is_empty() {
            return Err(Error::integrity("Cannot redeem an empty permission chain"));
        }

        for link in &self.0 {
            for caveat in &link.caveats {
                caveat.check(calls, at, spent)?;
            }
        }

        Ok(())
    }
}
