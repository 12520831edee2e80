use crate::error::OrderBookError;

const OP_RETURN: u8 = 0x6a;
const OP_PUSHDATA1: u8 = 0x4c;

/// Payout instruction carried in a taker deposit: `:<CHAIN>.<TOKEN>:<ADDRESS>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositMemo {
    pub chain: String,
    pub token: String,
    pub address: String,
}

impl DepositMemo {
    pub fn parse(memo: &str) -> Result<Self, OrderBookError> {
        let invalid = || OrderBookError::InvalidOrderSpec(format!("unrecognized deposit memo: {}", memo));

        let mut parts = memo.trim().split(':');
        match parts.next() {
            Some("") | Some("=") => {}
            _ => return Err(invalid()),
        }
        let asset = parts.next().ok_or_else(invalid)?;
        let address = parts.next().ok_or_else(invalid)?;
        if parts.next().is_some() || address.is_empty() {
            return Err(invalid());
        }

        let (chain, token) = asset.split_once('.').ok_or_else(invalid)?;
        if chain.is_empty() || token.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            chain: chain.to_ascii_uppercase(),
            token: token.to_ascii_uppercase(),
            address: address.to_string(),
        })
    }

    /// Decode the memo embedded in an OP_RETURN output script (hex)
    pub fn from_op_return(script_hex: &str) -> Result<Self, OrderBookError> {
        let script = hex::decode(script_hex)
            .map_err(|_| OrderBookError::InvalidOrderSpec("OP_RETURN script is not hex".to_string()))?;

        let data = match script.as_slice() {
            [OP_RETURN, OP_PUSHDATA1, len, rest @ ..] if rest.len() == *len as usize => rest,
            [OP_RETURN, len, rest @ ..] if *len < OP_PUSHDATA1 && rest.len() == *len as usize => rest,
            _ => {
                return Err(OrderBookError::InvalidOrderSpec(
                    "not an OP_RETURN data script".to_string(),
                ))
            }
        };

        let text = std::str::from_utf8(data)
            .map_err(|_| OrderBookError::InvalidOrderSpec("OP_RETURN memo is not UTF-8".to_string()))?;
        Self::parse(text)
    }

    /// Accept either the plain memo or a raw OP_RETURN script
    pub fn decode(raw: &str) -> Result<Self, OrderBookError> {
        let trimmed = raw.trim();
        if trimmed.len() > 4
            && trimmed.starts_with("6a")
            && trimmed.chars().all(|c| c.is_ascii_hexdigit())
        {
            Self::from_op_return(trimmed)
        } else {
            Self::parse(trimmed)
        }
    }
}
