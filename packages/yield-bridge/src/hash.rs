//! Message id computation
//!
//! Ids are keccak256 over six 32-byte words, laid out like `abi.encode`:
//!
//! ```text
//! keccak256(abi.encode(sourceDomain, destDomain, kind, keccak256(user), amount, nonce))
//! ```
//!
//! Every field is right-aligned big-endian inside its word. Because the
//! emitting gateway's nonce is part of the preimage, two messages with the same
//! content still get distinct ids.

use tiny_keccak::{Hasher, Keccak};

use crate::message::MessageKind;
use crate::types::{Address, Amount, DomainId, MessageId};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Compute the id of an outbound message
pub fn compute_message_id(
    source: DomainId,
    dest: DomainId,
    kind: MessageKind,
    user: &Address,
    amount: Amount,
    nonce: u64,
) -> MessageId {
    // 6 words * 32 bytes = 192 bytes
    let mut data = [0u8; 192];

    // Word 0: source domain tag
    data[31] = source.as_u8();

    // Word 1: destination domain tag
    data[63] = dest.as_u8();

    // Word 2: message kind tag
    data[95] = kind.as_u8();

    // Word 3: keccak256(user)
    data[96..128].copy_from_slice(&keccak256(user.as_bytes()));

    // Word 4: amount (u128 in last 16 bytes)
    data[128 + 16..160].copy_from_slice(&amount.to_be_bytes());

    // Word 5: nonce (u64 in last 8 bytes)
    data[160 + 24..192].copy_from_slice(&nonce.to_be_bytes());

    MessageId(keccak256(&data))
}
