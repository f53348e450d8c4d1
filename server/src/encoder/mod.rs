//! Packs calls and the permission chain into a redemption the ledger can execute atomically.
//!
//! A packed call is `target (20 raw bytes) || value (32 bytes, big-endian) || payload`.
//! The target is never left-padded to a 32-byte word; the receiving contract slices it
//! at fixed offsets.

use serde::{Deserialize, Serialize};

use crate::{
    delegation::{hex_bytes, Address, CallIntent, PermissionChain},
    Error, Result,
};

const WORD: usize = 32;
const ADDRESS_LENGTH: usize = 20;

/// `transfer(address,uint256)`
pub const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
/// `approve(address,uint256)`
pub const APPROVE_SELECTOR: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];

/// One call to execute under the chain's authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub target: Address,
    pub value: u128,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl Call {
    /// Moves the native asset.
    pub fn native_transfer(recipient: Address, value: u128) -> Self {
        Self {
            target: recipient,
            value,
            payload: Vec::new(),
        }
    }

    pub fn token_transfer(token: Address, recipient: Address, amount: u128) -> Self {
        Self {
            target: token,
            value: 0,
            payload: token_calldata(TRANSFER_SELECTOR, &recipient, amount),
        }
    }

    pub fn token_approval(token: Address, spender: Address, amount: u128) -> Self {
        Self {
            target: token,
            value: 0,
            payload: token_calldata(APPROVE_SELECTOR, &spender, amount),
        }
    }

    /// What the enforcers will see when this call is redeemed.
    pub fn intent(&self) -> CallIntent {
        let token_outflow = match self.payload.get(..4) {
            Some(selector) if selector == TRANSFER_SELECTOR || selector == APPROVE_SELECTOR => {
                decode_amount_argument(&self.payload).map(|amount| (self.target, amount))
            }
            _ => None,
        };
        CallIntent {
            target: self.target,
            value: self.value,
            token_outflow,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut packed = Vec::with_capacity(ADDRESS_LENGTH + WORD + self.payload.len());
        packed.extend_from_slice(self.target.as_bytes());
        packed.extend_from_slice(&u128_word(self.value));
        packed.extend_from_slice(&self.payload);
        packed
    }

    pub fn decode(packed: &[u8]) -> Result<Self> {
        if packed.len() < ADDRESS_LENGTH + WORD {
            return Err(Error::InvalidParameter(format!(
                "Packed call is {} bytes, expected at least {}",
                packed.len(),
                ADDRESS_LENGTH + WORD
            )));
        }
        let mut target = [0u8; ADDRESS_LENGTH];
        target.copy_from_slice(&packed[..ADDRESS_LENGTH]);
        let value_word = &packed[ADDRESS_LENGTH..ADDRESS_LENGTH + WORD];
        Ok(Self {
            target: Address(target),
            value: read_u128(value_word)?,
            payload: packed[ADDRESS_LENGTH + WORD..].to_vec(),
        })
    }
}

fn u128_word(value: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

fn read_u128(word: &[u8]) -> Result<u128> {
    if word.len() != WORD || word[..16].iter().any(|byte| *byte != 0) {
        return Err(Error::InvalidParameter("Value does not fit in 128 bits".to_owned()));
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(bytes))
}

/// ABI calldata for `selector(address,uint256)`. Unlike the packed call, ABI arguments are
/// full words.
fn token_calldata(selector: [u8; 4], account: &Address, amount: u128) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 2 * WORD);
    data.extend_from_slice(&selector);
    let mut account_word = [0u8; WORD];
    account_word[WORD - ADDRESS_LENGTH..].copy_from_slice(account.as_bytes());
    data.extend_from_slice(&account_word);
    data.extend_from_slice(&u128_word(amount));
    data
}

fn decode_amount_argument(data: &[u8]) -> Option<u128> {
    data.get(4 + WORD..4 + 2 * WORD)
        .and_then(|word| read_u128(word).ok())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Single,
    Batch,
}

impl ExecutionMode {
    pub fn flag(self) -> u8 {
        match self {
            Self::Single => 0x00,
            Self::Batch => 0x01,
        }
    }
}

/// Everything the ledger needs for one atomic redemption: the full chain, one mode flag
/// per call group and the encoded group bytes in the same order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Redemption {
    pub chain: Vec<u8>,
    pub modes: Vec<ExecutionMode>,
    pub calls: Vec<Vec<u8>>,
    /// The calls as submitted, kept for pre-flight checks and logging.
    pub intents: Vec<CallIntent>,
}

impl Redemption {
    pub fn mode_flags(&self) -> Vec<u8> {
        self.modes.iter().map(|mode| mode.flag()).collect()
    }
}

pub struct ExecutionEncoder;

impl ExecutionEncoder {
    /// A batch group is `count (32 bytes) || (length (32 bytes) || packed call)*`.
    pub fn encode_batch(calls: &[Call]) -> Vec<u8> {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&u128_word(calls.len() as u128));
        for call in calls {
            let packed = call.encode();
            encoded.extend_from_slice(&u128_word(packed.len() as u128));
            encoded.extend_from_slice(&packed);
        }
        encoded
    }

    pub fn decode_batch(encoded: &[u8]) -> Result<Vec<Call>> {
        let truncated = || Error::InvalidParameter("Batch encoding is truncated".to_owned());
        let count = read_u128(encoded.get(..WORD).ok_or_else(truncated)?)?;
        let mut offset = WORD;
        let mut calls = Vec::new();
        for _ in 0..count {
            let length = read_u128(encoded.get(offset..offset + WORD).ok_or_else(truncated)?)?;
            offset += WORD;
            let length = usize::try_from(length).map_err(|_| truncated())?;
            let end = offset.checked_add(length).ok_or_else(truncated)?;
            calls.push(Call::decode(encoded.get(offset..end).ok_or_else(truncated)?)?);
            offset = end;
        }
        if offset != encoded.len() {
            return Err(Error::InvalidParameter(
                "Trailing bytes after batch".to_owned(),
            ));
        }
        Ok(calls)
    }

    /// Redeems one call. The chain must be complete, leaf first.
    pub fn single(chain: &PermissionChain, call: &Call) -> Result<Redemption> {
        Ok(Redemption {
            chain: Self::chain_bytes(chain)?,
            modes: vec![ExecutionMode::Single],
            calls: vec![call.encode()],
            intents: vec![call.intent()],
        })
    }

    /// Redeems an ordered batch (for example an approval followed by a swap). A batch of
    /// one is encoded as a single call.
    pub fn batch(chain: &PermissionChain, calls: &[Call]) -> Result<Redemption> {
        match calls {
            [] => Err(Error::InvalidParameter("Nothing to execute".to_owned())),
            [call] => Self::single(chain, call),
            calls => Ok(Redemption {
                chain: Self::chain_bytes(chain)?,
                modes: vec![ExecutionMode::Batch],
                calls: vec![Self::encode_batch(calls)],
                intents: calls.iter().map(Call::intent).collect(),
            }),
        }
    }

    fn chain_bytes(chain: &PermissionChain) -> Result<Vec<u8>> {
        match chain.root() {
            Some(root) if root.is_root() => chain.encode(),
            _ => Err(Error::integrity(
                "Refusing to redeem a partial permission chain",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::{
        tests::{address_of, signed_root, test_signing_key},
        Delegation,
    };

    #[test]
    fn packed_call_keeps_the_target_unpadded() {
        let call = Call {
            target: Address([0xab; 20]),
            value: 5,
            payload: vec![0xde, 0xad],
        };
        let packed = call.encode();
        assert_eq!(packed.len(), 20 + 32 + 2);
        assert_eq!(&packed[..20], &[0xab; 20]);
        assert_eq!(packed[20 + 31], 5);
        assert!(packed[20..20 + 31].iter().all(|byte| *byte == 0));
        assert_eq!(&packed[52..], &[0xde, 0xad]);
        assert_eq!(Call::decode(&packed).unwrap(), call);
    }

    #[test]
    fn token_calls_expose_their_outflow() {
        let token = Address([7; 20]);
        let transfer = Call::token_transfer(token, Address([8; 20]), 1_000);
        assert_eq!(&transfer.payload[..4], &TRANSFER_SELECTOR);
        assert_eq!(transfer.payload.len(), 68);
        assert_eq!(transfer.intent().token_outflow, Some((token, 1_000)));

        let native = Call::native_transfer(Address([8; 20]), 42);
        assert_eq!(native.intent().value, 42);
        assert_eq!(native.intent().token_outflow, None);
    }

    #[test]
    fn batches_carry_one_flag_per_group() {
        let worker = address_of(&test_signing_key(2));
        let chain = signed_root(&test_signing_key(1), worker, Vec::new());

        let token = Address([7; 20]);
        let router = Address([9; 20]);
        let calls = [
            Call::token_approval(token, router, 50),
            Call {
                target: router,
                value: 0,
                payload: vec![1, 2, 3],
            },
        ];

        let redemption = ExecutionEncoder::batch(&chain, &calls).unwrap();
        assert_eq!(redemption.mode_flags(), vec![0x01]);
        assert_eq!(redemption.calls.len(), 1);
        assert_eq!(redemption.intents.len(), 2);
        assert_eq!(
            ExecutionEncoder::decode_batch(&redemption.calls[0]).unwrap(),
            calls.to_vec()
        );
        assert_eq!(PermissionChain::decode(&redemption.chain).unwrap(), chain);

        let single = ExecutionEncoder::batch(&chain, &calls[..1]).unwrap();
        assert_eq!(single.mode_flags(), vec![0x00]);
    }

    #[test]
    fn partial_chains_are_rejected() {
        let worker = address_of(&test_signing_key(2));
        let mut links: Vec<Delegation> = signed_root(&test_signing_key(1), worker, Vec::new())
            .links()
            .to_vec();
        links[0].authority = crate::delegation::Hash32([1; 32]);
        let chain = PermissionChain::from_links(links);
        let call = Call::native_transfer(Address([3; 20]), 1);
        assert!(matches!(
            ExecutionEncoder::single(&chain, &call),
            Err(Error::Integrity(_))
        ));
        assert!(ExecutionEncoder::batch(&chain, &[]).is_err());
    }
}
