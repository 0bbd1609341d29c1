//! Transaction encoding, signing and fee computation for Cosmos SDK chains.

use std::{fmt, str::FromStr};

use anyhow::{Context, Result};
use ibc_proto::{
    cosmos::{
        auth::v1beta1::BaseAccount,
        base::v1beta1::Coin,
        tx::v1beta1::{
            mode_info::{Single, Sum},
            AuthInfo, Fee, ModeInfo, SignDoc, SignerInfo, TxBody, TxRaw,
        },
    },
    google::protobuf::Any,
};
use prost::Message;
use serde::{Deserialize, Deserializer};

use super::keyring::Secp256k1Key;

const SECP256K1_PUB_KEY_TYPE_URL: &str = "/cosmos.crypto.secp256k1.PubKey";
const SIGN_MODE_DIRECT: i32 = 1;

/// A gas price such as `0.002ubbn`.
#[derive(Clone, Debug, PartialEq)]
pub struct GasPrice {
    /// The price of one unit of gas.
    pub amount: f64,
    /// The fee denomination.
    pub denom: String,
}

impl GasPrice {
    /// The fee for `gas_limit` units of gas, rounded up.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn fee(&self, gas_limit: u64) -> Fee {
        let amount = (gas_limit as f64 * self.amount).ceil() as u128;
        Fee {
            amount: vec![Coin {
                denom: self.denom.clone(),
                amount: amount.to_string(),
            }],
            gas_limit,
            payer: String::new(),
            granter: String::new(),
        }
    }
}

impl FromStr for GasPrice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| anyhow::anyhow!("gas price {s:?} has no denomination"))?;
        let (amount, denom) = s.split_at(split);

        let amount: f64 = amount
            .parse()
            .with_context(|| format!("gas price {s:?} has an invalid amount"))?;
        if !amount.is_finite() || amount < 0.0 {
            anyhow::bail!("gas price {s:?} must be a non-negative amount");
        }
        if !denom.chars().all(|c| c.is_ascii_alphanumeric() || "/:._-".contains(c)) {
            anyhow::bail!("gas price {s:?} has an invalid denomination");
        }

        Ok(Self {
            amount,
            denom: denom.to_string(),
        })
    }
}

impl fmt::Display for GasPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

impl<'de> Deserialize<'de> for GasPrice {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Build, sign and encode a transaction carrying `messages`.
///
/// # Errors
/// Returns an error if a part of the transaction cannot be encoded.
pub fn sign_and_encode_tx(
    chain_id: &str,
    key: &Secp256k1Key,
    account: &BaseAccount,
    memo: &str,
    messages: Vec<Any>,
    fee: Fee,
) -> Result<Vec<u8>> {
    let body_bytes = TxBody {
        messages,
        memo: memo.to_string(),
        ..Default::default()
    }
    .encode_to_vec();

    let mut key_bytes = Vec::new();
    key.public_key()
        .encode(&mut key_bytes)
        .context("failed to encode public key")?;

    let signer_info = SignerInfo {
        public_key: Some(Any {
            type_url: SECP256K1_PUB_KEY_TYPE_URL.to_string(),
            value: key_bytes,
        }),
        mode_info: Some(ModeInfo {
            sum: Some(Sum::Single(Single {
                mode: SIGN_MODE_DIRECT,
            })),
        }),
        sequence: account.sequence,
    };

    let auth_info_bytes = AuthInfo {
        signer_infos: vec![signer_info],
        fee: Some(fee),
        ..Default::default()
    }
    .encode_to_vec();

    let sign_doc = SignDoc {
        body_bytes: body_bytes.clone(),
        auth_info_bytes: auth_info_bytes.clone(),
        chain_id: chain_id.to_string(),
        account_number: account.account_number,
    };
    let signature = key.sign(&sign_doc.encode_to_vec());

    Ok(TxRaw {
        body_bytes,
        auth_info_bytes,
        signatures: vec![signature],
    }
    .encode_to_vec())
}
