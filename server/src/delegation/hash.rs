use sha2::{Digest, Sha256};

use super::{Address, Caveat, Delegation, Hash32};

const DOMAIN_TYPE: &str =
    "SigningDomain(string name,string version,uint256 chainId,address verifyingContract)";
const CAVEAT_TYPE: &str = "Caveat(string enforcer,bytes terms)";
const DELEGATION_TYPE: &str = concat!(
    "Delegation(address delegate,address delegator,bytes32 authority,Caveat[] caveats,",
    "uint256 salt)Caveat(string enforcer,bytes terms)"
);

/// Prefix for signing digests, keeps them apart from any other hashed structure.
const DIGEST_PREFIX: [u8; 2] = [0x19, 0x01];

fn sha256(parts: &[&[u8]]) -> Hash32 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Hash32(out)
}

fn u64_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Binds signatures to one chain and one verifying contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl SigningDomain {
    pub fn new(chain_id: u64, verifying_contract: Address) -> Self {
        Self {
            name: "DelegationManager".to_owned(),
            version: "1".to_owned(),
            chain_id,
            verifying_contract,
        }
    }

    pub fn separator(&self) -> Hash32 {
        sha256(&[
            sha256(&[DOMAIN_TYPE.as_bytes()]).as_bytes(),
            sha256(&[self.name.as_bytes()]).as_bytes(),
            sha256(&[self.version.as_bytes()]).as_bytes(),
            &u64_word(self.chain_id),
            &self.verifying_contract.to_word(),
        ])
    }

    /// The digest that is actually signed for a struct hash.
    pub fn digest(&self, struct_hash: &Hash32) -> Hash32 {
        sha256(&[
            &DIGEST_PREFIX,
            self.separator().as_bytes(),
            struct_hash.as_bytes(),
        ])
    }
}

pub(super) fn caveat_hash(caveat: &Caveat) -> Hash32 {
    sha256(&[
        sha256(&[CAVEAT_TYPE.as_bytes()]).as_bytes(),
        sha256(&[caveat.enforcer.name().as_bytes()]).as_bytes(),
        sha256(&[&caveat.terms]).as_bytes(),
    ])
}

/// Order-sensitive hash over the caveat list. `args` are supplied at redemption and are
/// deliberately not part of the hash.
pub(super) fn caveats_hash(caveats: &[Caveat]) -> Hash32 {
    let mut hasher = Sha256::new();
    for caveat in caveats {
        hasher.update(caveat_hash(caveat).as_bytes());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Hash32(out)
}

pub(super) fn delegation_hash(delegation: &Delegation) -> Hash32 {
    sha256(&[
        sha256(&[DELEGATION_TYPE.as_bytes()]).as_bytes(),
        &delegation.delegate.to_word(),
        &delegation.delegator.to_word(),
        delegation.authority.as_bytes(),
        caveats_hash(&delegation.caveats).as_bytes(),
        &u64_word(delegation.salt),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::ROOT_AUTHORITY;

    fn delegation(salt: u64) -> Delegation {
        Delegation::root(Address([1; 20]), Address([2; 20]), Vec::new(), salt)
    }

    #[test]
    fn hash_is_deterministic_and_ignores_signature() {
        let mut first = delegation(5);
        let second = delegation(5);
        first.signature = vec![1, 2, 3];
        assert_eq!(first.hash(), second.hash());
    }

    #[test]
    fn every_field_feeds_the_hash() {
        let base = delegation(5);
        assert_ne!(base.hash(), delegation(6).hash());

        let mut other_delegate = base.clone();
        other_delegate.delegate = Address([3; 20]);
        assert_ne!(base.hash(), other_delegate.hash());

        let mut other_authority = base.clone();
        other_authority.authority = Hash32([0; 32]);
        assert_ne!(base.hash(), other_authority.hash());

        let mut with_caveat = base.clone();
        with_caveat.caveats.push(Caveat::timestamp(crate::delegation::TimeWindow {
            after: 0,
            before: 10,
        }));
        assert_ne!(base.hash(), with_caveat.hash());
    }

    #[test]
    fn domain_separator_depends_on_chain_and_contract() {
        let domain = SigningDomain::new(1, Address([1; 20]));
        assert_ne!(
            domain.separator(),
            SigningDomain::new(2, Address([1; 20])).separator()
        );
        assert_ne!(
            domain.separator(),
            SigningDomain::new(1, Address([2; 20])).separator()
        );
    }

    #[test]
    fn digest_differs_from_struct_hash() {
        let domain = SigningDomain::new(1, Address([1; 20]));
        let hash = delegation(1).hash();
        assert_ne!(domain.digest(&hash), hash);
        assert_ne!(hash, ROOT_AUTHORITY);
    }
}
