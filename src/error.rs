//! # Error Handling
//!
//! Each subsystem has its own thiserror enum close to the code that
//! produces it; this module rolls them up for callers that just want one
//! error type out of the library surface.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetersError {
    #[error(transparent)]
    Hex(#[from] crate::util::hex::HexError),

    #[error(transparent)]
    Crypto(#[from] crate::util::crypto::CryptoError),

    #[error(transparent)]
    Units(#[from] crate::units::UnitsError),

    #[error(transparent)]
    Address(#[from] crate::address::AddressError),

    #[error(transparent)]
    Telegram(#[from] crate::telegram::TelegramError),

    #[error(transparent)]
    Formula(#[from] crate::formula::FormulaError),

    #[error(transparent)]
    Driver(#[from] crate::meters::DriverError),

    #[error(transparent)]
    DynamicDriver(#[from] crate::meters::dynamic::DynamicError),

    #[error(transparent)]
    Device(#[from] crate::bus::DeviceError),

    #[error("Configuration error: {0}")]
    Config(String),
}
