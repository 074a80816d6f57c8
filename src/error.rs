use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

use crate::metadata::{MetadataError, ValueType};

/// Outcome of an unlock attempt, as reported to calling code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum BitlockerStatus {
    Success,
    /// Not an error: the volume simply does not carry the BitLocker signature.
    NotBitlocker,
    WrongPassword,
    NeedPassword,
    UnsupportedKeyProtectionType,
    GeneralError,
}

impl BitlockerStatus {
    /// Rank used when several metadata copies (or several VMKs) fail
    /// differently: the most specific failure wins.
    pub fn priority(&self) -> u8 {
        match self {
            BitlockerStatus::WrongPassword => 4,
            BitlockerStatus::NeedPassword => 3,
            BitlockerStatus::UnsupportedKeyProtectionType => 2,
            BitlockerStatus::GeneralError => 1,
            BitlockerStatus::Success | BitlockerStatus::NotBitlocker => 0,
        }
    }
}

impl fmt::Display for BitlockerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BitlockerStatus::Success => "SUCCESS",
            BitlockerStatus::NotBitlocker => "NOT_BITLOCKER",
            BitlockerStatus::WrongPassword => "WRONG_PASSWORD",
            BitlockerStatus::NeedPassword => "NEED_PASSWORD",
            BitlockerStatus::UnsupportedKeyProtectionType => "UNSUPPORTED_KEY_PROTECTION_TYPE",
            BitlockerStatus::GeneralError => "GENERAL_ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum BitlockerError {
    #[error("the volume is not BitLocker protected")]
    NotBitlocker,

    #[error("a password or recovery password is required to unlock this volume")]
    NeedPassword,

    #[error("the supplied password does not unlock this volume")]
    WrongPassword,

    #[error("unsupported key protection type(s): {0}")]
    UnsupportedKeyProtectionType(String),

    #[error("malformed metadata: {0}")]
    Metadata(#[from] MetadataError),

    #[error("expected a value of type {expected} but found {found}")]
    UnexpectedValueType { expected: ValueType, found: ValueType },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    General(String),
}

impl BitlockerError {
    pub fn status(&self) -> BitlockerStatus {
        match self {
            BitlockerError::NotBitlocker => BitlockerStatus::NotBitlocker,
            BitlockerError::NeedPassword => BitlockerStatus::NeedPassword,
            BitlockerError::WrongPassword => BitlockerStatus::WrongPassword,
            BitlockerError::UnsupportedKeyProtectionType(_) => {
                BitlockerStatus::UnsupportedKeyProtectionType
            }
            BitlockerError::Metadata(_)
            | BitlockerError::UnexpectedValueType { .. }
            | BitlockerError::InvalidKey(_)
            | BitlockerError::Io(_)
            | BitlockerError::General(_) => BitlockerStatus::GeneralError,
        }
    }

    /// Keep whichever of `current` and `candidate` is the more specific failure.
    /// On equal rank the first one seen is kept.
    pub(crate) fn most_specific(current: Option<Self>, candidate: Self) -> Option<Self> {
        match current {
            Some(cur) if cur.status().priority() >= candidate.status().priority() => Some(cur),
            _ => Some(candidate),
        }
    }
}
