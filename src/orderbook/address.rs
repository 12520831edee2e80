use crate::error::OrderBookError;

const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Address shape expected for a custodial chain id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFormat {
    /// Bech32/bech32m or legacy base58 (BTC, XTN testnet)
    Bitcoin,
    /// 0x-prefixed 20-byte hex
    Evm,
    /// Unknown chain: non-empty, no whitespace, fits the column
    Generic,
}

impl AddressFormat {
    pub fn for_chain(chain_id: &str) -> Self {
        let chain = chain_id.to_ascii_uppercase();
        match chain.as_str() {
            "BTC" | "XTN" | "TBTC" | "TBTC4" | "SIGNET_BTC" => AddressFormat::Bitcoin,
            "ETH" | "SETH" | "TETH" | "HETH" | "BSC_BNB" | "MATIC" | "AVAXC" => AddressFormat::Evm,
            _ if chain.ends_with("_ETH") => AddressFormat::Evm,
            _ => AddressFormat::Generic,
        }
    }

    pub fn matches(&self, address: &str) -> bool {
        if address.is_empty() || address.len() > 100 || address.chars().any(char::is_whitespace) {
            return false;
        }

        match self {
            AddressFormat::Evm => {
                address.len() == 42
                    && address.starts_with("0x")
                    && address[2..].chars().all(|c| c.is_ascii_hexdigit())
            }
            AddressFormat::Bitcoin => is_bech32(address) || is_base58(address),
            AddressFormat::Generic => true,
        }
    }
}

fn is_bech32(address: &str) -> bool {
    let lower = address.to_ascii_lowercase();
    // Mixed case is invalid in bech32
    if lower != address && address.to_ascii_uppercase() != address {
        return false;
    }
    let Some((hrp, data)) = lower.rsplit_once('1') else {
        return false;
    };
    matches!(hrp, "bc" | "tb" | "bcrt")
        && (14..=90).contains(&lower.len())
        && data.len() >= 6
        && data.chars().all(|c| BECH32_CHARSET.contains(c))
}

fn is_base58(address: &str) -> bool {
    (25..=35).contains(&address.len())
        && address.starts_with(['1', '3', 'm', 'n', '2'])
        && address.chars().all(|c| BASE58_ALPHABET.contains(c))
}

/// Reject addresses that are not well-formed for their chain
pub fn validate_address(chain_id: &str, address: &str) -> Result<(), OrderBookError> {
    if AddressFormat::for_chain(chain_id).matches(address) {
        Ok(())
    } else {
        Err(OrderBookError::InvalidOrderSpec(format!(
            "malformed {} address: {}",
            chain_id, address
        )))
    }
}
