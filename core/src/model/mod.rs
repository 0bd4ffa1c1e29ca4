// Data model shared by the pool manager, scheduler and orchestrator.
//
// Amounts are integer base units of their currency. Identifiers are v4
// UUID newtypes so that an entry id can never be passed where a mix id is
// expected.

pub mod operation;
pub mod pool;
pub mod request;

pub use operation::{
    CoinJoinParticipant, CoinJoinRequest, ConsolidationRequest, Destination, DistributionRequest,
    OperationKind, OperationStatus, ScheduledOperation, SourceAllocation,
};
pub use pool::{
    EntryStatus, MixingRecord, MixingTransaction, PoolEntry, RoutingPath, TransactionStatus,
};
pub use request::{AnonymityLevel, MixOrder, MixRequest, MixStatus, PayoutAddress};

use crate::error::{MixerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Amount in the smallest unit of a currency (satoshi, wei, ...).
pub type Amount = u64;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = MixerError;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    MixerError::Validation(format!("invalid {}: {}", stringify!($name), e))
                })
            }
        }
    };
}

id_type!(
    /// Identifier of a user's mix order
    MixId
);
id_type!(
    /// Identifier of a deposit inside a pool
    EntryId
);
id_type!(
    /// Identifier of a scheduled release
    OperationId
);
id_type!(
    /// Identifier of an executed mixing round
    TransactionId
);
id_type!(
    /// Groups all records produced by one mixing round
    SessionId
);

/// Ticker of a supported currency, always upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(ticker: &str) -> Self {
        Self(ticker.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Currency {
    fn from(ticker: &str) -> Self {
        Currency::new(ticker)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle to a key held by the custody subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub String);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parse a decimal string such as `"1.25"` into base units.
pub fn parse_amount(text: &str, decimals: u8) -> Result<Amount> {
    let text = text.trim();
    let invalid = || MixerError::Validation(format!("invalid amount '{}'", text));
    let (whole, fraction) = match text.split_once('.') {
        Some((w, f)) => (w, f),
        None => (text, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid());
    }
    if fraction.len() > decimals as usize {
        return Err(MixerError::Validation(format!(
            "amount '{}' has more than {} decimal places",
            text, decimals
        )));
    }
    let scale = 10u64.checked_pow(decimals as u32).ok_or_else(invalid)?;
    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let padded = format!("{:0<width$}", fraction, width = decimals as usize);
    let fraction: u64 = if padded.is_empty() {
        0
    } else {
        padded.parse().map_err(|_| invalid())?
    };
    whole
        .checked_mul(scale)
        .and_then(|w| w.checked_add(fraction))
        .ok_or_else(invalid)
}

/// Render base units as a decimal string with all places shown.
pub fn format_amount(amount: Amount, decimals: u8) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let scale = 10u64.pow(decimals as u32);
    format!(
        "{}.{:0width$}",
        amount / scale,
        amount % scale,
        width = decimals as usize
    )
}
