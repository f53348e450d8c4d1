use ed25519_dalek::SigningKey;
use tracing::{debug, warn};

use super::{Address, CaveatConfig, CaveatTerms, Delegation, PermissionChain, SigningDomain};
use crate::{Error, Result};

/// Derives narrowed sub-delegations from a parent chain and signs them with the worker's
/// own key. The end user's key is never needed here.
pub struct PermissionChainBuilder {
    signing_key: SigningKey,
    address: Address,
    domain: SigningDomain,
}

impl PermissionChainBuilder {
    pub fn new(signing_key: SigningKey, domain: SigningDomain) -> Self {
        let address = Address::from_verifying_key(&signing_key.verifying_key());
        Self {
            signing_key,
            address,
            domain,
        }
    }

    /// Builds the signer from a base58-encoded 32 byte ed25519 secret, the format wallets
    /// export keys in.
    pub fn from_base58_secret(secret: &str, domain: SigningDomain) -> Result<Self> {
        let bytes = bs58::decode(secret.trim())
            .into_vec()
            .map_err(|_| Error::bad_config("Signer secret key is not valid base58."))?;

        // Wallet keypair exports carry the public half too.
        let secret_bytes: [u8; 32] = match bytes.len() {
            32 | 64 => bytes[..32]
                .try_into()
                .map_err(|_| Error::bad_config("Invalid signer secret key length."))?,
            _ => {
                return Err(Error::bad_config(
                    "Signer secret key must decode to 32 or 64 bytes.",
                ))
            }
        };

        Ok(Self::new(SigningKey::from_bytes(&secret_bytes), domain))
    }

    /// The address sub-delegations are signed from. Root grants must name it as delegate.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Narrows `parent_chain` to `delegate` with the caveats in `caveat_config`.
    ///
    /// Returns the new leaf and the full `[leaf, ..., root]` chain.
    pub fn build_sub_delegation(
        &self,
        parent_chain: Option<&[u8]>,
        delegate: Address,
        caveat_config: &CaveatConfig,
    ) -> Result<(Delegation, PermissionChain)> {
        let parent_bytes = parent_chain
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| Error::bad_config("Parent permission chain is missing."))?;

        let parent = PermissionChain::decode(parent_bytes).map_err(|error| {
            Error::bad_config(format!("Parent permission chain is undecodable: {error}"))
        })?;

        parent.verify(&self.domain)?;

        let parent_leaf = parent
            .leaf()
            .ok_or_else(|| Error::bad_config("Parent permission chain is empty."))?;

        if parent_leaf.delegate != self.address {
            return Err(Error::integrity(format!(
                "Signer {} does not match the declared delegate {} of the parent delegation",
                self.address, parent_leaf.delegate
            )));
        }

        let caveats = caveat_config.build()?;
        warn_on_widening(&parent, &caveats);

        let mut delegation = Delegation {
            delegate,
            delegator: self.address,
            authority: parent_leaf.hash(),
            caveats,
            salt: rand::random::<u64>(),
            signature: Vec::new(),
        };
        delegation.sign(&self.signing_key, &self.domain)?;

        let chain = parent.prepend(delegation.clone());

        debug!(
            "Derived sub-delegation {} -> {} at depth {}",
            self.address,
            delegate,
            chain.len()
        );

        Ok((delegation, chain))
    }
}

/// A looser limit further down the chain is harmless because every level is enforced, but
/// it usually means the caller expected more allowance than it will get.
fn warn_on_widening(parent: &PermissionChain, caveats: &[super::Caveat]) {
    let Ok(scope) = parent.effective_scope() else {
        return;
    };

    for caveat in caveats {
        match caveat.decode_terms() {
            Ok(CaveatTerms::NativePeriod(limit)) => {
                if let Some(inherited) = scope.native_period_amount {
                    if limit.period_amount > inherited {
                        warn!(
                            "Requested native allowance {} is capped by the inherited {}",
                            limit.period_amount, inherited
                        );
                    }
                }
            }
            Ok(CaveatTerms::TokenPeriod(token_limit)) => {
                if let Some(inherited) = scope.token_period_amounts.get(&token_limit.token) {
                    if token_limit.limit.period_amount > *inherited {
                        warn!(
                            "Requested allowance {} for {} is capped by the inherited {}",
                            token_limit.limit.period_amount, token_limit.token, inherited
                        );
                    }
                }
            }
            Ok(CaveatTerms::AllowedTargets(targets)) => {
                for target in targets.iter().filter(|target| !scope.permits_target(target)) {
                    warn!("Target {} is not reachable through the parent chain", target);
                }
            }
            _ => {}
        }
    }
}
