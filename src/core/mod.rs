//! Core constants, errors, and configuration (always included).

pub mod constants;
pub mod error;
pub mod options;

pub use constants::*;
pub use error::{CryptoError, SessionError, WireError};
pub use options::{
    AnswersMode, KeyExchangerOptions, NegotiatorEnable, NegotiatorOptions, SessionOptions,
};
