use crate::rpc::Log;
use ssz::Decode;
use ssz_derive::{Decode, Encode};
use types::{
    DepositData, Hash256, PublicKeyBytes, SignatureBytes, PUBLIC_KEY_BYTES_LEN,
    SIGNATURE_BYTES_LEN,
};

/// Length of a dynamic ABI field once padded to a whole number of 32-byte words.
const fn padded(len: usize) -> usize {
    (len + 31) / 32 * 32
}

/// The following constants define the layout of bytes in the deposit contract `DepositEvent`. The
/// event bytes are formatted according to the Ethereum ABI: five offset words, then each field as
/// a length word followed by its padded bytes.
const HEAD_LEN: usize = 5 * 32;
const PUBKEY_START: usize = HEAD_LEN + 32;
const PUBKEY_LEN: usize = PUBLIC_KEY_BYTES_LEN;
const CREDS_START: usize = PUBKEY_START + padded(PUBKEY_LEN) + 32;
const CREDS_LEN: usize = 32;
const AMOUNT_START: usize = CREDS_START + padded(CREDS_LEN) + 32;
const AMOUNT_LEN: usize = 8;
const SIG_START: usize = AMOUNT_START + padded(AMOUNT_LEN) + 32;
const SIG_LEN: usize = SIGNATURE_BYTES_LEN;
const INDEX_START: usize = SIG_START + padded(SIG_LEN) + 32;
const INDEX_LEN: usize = 8;
const LOG_DATA_LEN: usize = INDEX_START + padded(INDEX_LEN);

/// A fully parsed deposit contract log.
#[derive(Debug, PartialEq, Clone, Encode, Decode)]
pub struct DepositLog {
    pub deposit_data: DepositData,
    /// The block number of the log that included this `DepositData`.
    pub block_number: u64,
    /// The index included with the deposit log.
    pub index: u64,
}

impl DepositLog {
    /// Attempts to parse a raw `Log` from the deposit contract into a `DepositLog`.
    pub fn from_log(log: &Log) -> Result<Self, String> {
        let bytes = &log.data;

        let pubkey = bytes
            .get(PUBKEY_START..PUBKEY_START + PUBKEY_LEN)
            .ok_or_else(|| "Insufficient bytes for pubkey".to_string())?;
        let withdrawal_credentials = bytes
            .get(CREDS_START..CREDS_START + CREDS_LEN)
            .ok_or_else(|| "Insufficient bytes for withdrawal credential".to_string())?;
        let amount = bytes
            .get(AMOUNT_START..AMOUNT_START + AMOUNT_LEN)
            .ok_or_else(|| "Insufficient bytes for amount".to_string())?;
        let signature = bytes
            .get(SIG_START..SIG_START + SIG_LEN)
            .ok_or_else(|| "Insufficient bytes for signature".to_string())?;
        let index = bytes
            .get(INDEX_START..INDEX_START + INDEX_LEN)
            .ok_or_else(|| "Insufficient bytes for index".to_string())?;

        let deposit_data = DepositData {
            pubkey: PublicKeyBytes::from_ssz_bytes(pubkey)
                .map_err(|e| format!("Invalid pubkey ssz: {:?}", e))?,
            withdrawal_credentials: Hash256::from_ssz_bytes(withdrawal_credentials)
                .map_err(|e| format!("Invalid withdrawal_credentials ssz: {:?}", e))?,
            amount: u64::from_ssz_bytes(amount)
                .map_err(|e| format!("Invalid amount ssz: {:?}", e))?,
            signature: SignatureBytes::from_ssz_bytes(signature)
                .map_err(|e| format!("Invalid signature ssz: {:?}", e))?,
        };

        Ok(DepositLog {
            deposit_data,
            block_number: log.block_number,
            index: u64::from_ssz_bytes(index).map_err(|e| format!("Invalid index ssz: {:?}", e))?,
        })
    }
}

/// Produces the `data` of the `DepositEvent` the deposit contract emits for `deposit_data` at
/// `index`. Amount and index are little-endian, as the contract writes them.
pub fn encode_deposit_log_data(deposit_data: &DepositData, index: u64) -> Vec<u8> {
    let fields: [&[u8]; 5] = [
        deposit_data.pubkey.as_bytes(),
        deposit_data.withdrawal_credentials.as_bytes(),
        &deposit_data.amount.to_le_bytes(),
        deposit_data.signature.as_bytes(),
        &index.to_le_bytes(),
    ];

    let mut head = Vec::with_capacity(HEAD_LEN);
    let mut tail = Vec::with_capacity(LOG_DATA_LEN - HEAD_LEN);
    for field in fields {
        head.extend_from_slice(&abi_word(HEAD_LEN + tail.len()));
        tail.extend_from_slice(&abi_word(field.len()));
        tail.extend_from_slice(field);
        tail.resize(tail.len() + padded(field.len()) - field.len(), 0);
    }
    head.append(&mut tail);
    head
}

/// A big-endian 32-byte ABI word.
fn abi_word(value: usize) -> [u8; 32] {
    let mut word = [0; 32];
    word[24..].copy_from_slice(&(value as u64).to_be_bytes());
    word
}
