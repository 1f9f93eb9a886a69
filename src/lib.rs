//! # wmeters - Decode Wired and Wireless M-Bus Telegrams
//!
//! wmeters receives telegrams from utility meters (water, heat,
//! electricity, gas) over wireless or wired M-Bus, unwraps the protocol
//! layers, decrypts the payload, decodes the self-describing data records
//! and binds them to per-meter driver schemas that produce canonical
//! (name, quantity, unit, value) readings.
//!
//! ## Features
//!
//! - Layered EN 13757 telegram parsing: DLL, ELL, AFL and TPL headers
//! - AES decryption for security modes 1 (ELL CTR), 5, 7 and 8, with
//!   session key derivation and CMAC verification
//! - DIF/VIF record walking with storage/tariff/subunit counters and
//!   compact frame reconstruction via format signatures
//! - A driver registry with built-in and text-file loaded drivers
//! - Radio dongle control for the IMST iM871A and Amber AMB8465,
//!   including link mode configuration and RSSI reporting
//! - An address expression language for selecting which telegrams a
//!   meter decodes: `12345678`, `12*.T=16`, `!12345678.V!=66`
//!
//! ## Usage
//!
//! ```no_run
//! use wmeters::address::AddressExpression;
//! use wmeters::meters::{create_meter, MeterInfo, TelegramOutcome};
//! use wmeters::telegram::{AboutTelegram, FrameType};
//! use wmeters::util::hex::decode_hex_flex;
//!
//! let mi = MeterInfo {
//!     name: "MyHeater".to_string(),
//!     driver_name: "kamheat".to_string(),
//!     address_expressions: vec![AddressExpression::parse("67676767", false).unwrap()],
//!     ..MeterInfo::default()
//! };
//! let mut meter = create_meter(&mi).unwrap();
//!
//! let frame = decode_hex_flex("2E442D2C67676767...").unwrap();
//! let about = AboutTelegram::new("im871a[12345678]", -77, FrameType::WMBus);
//! if let TelegramOutcome::Updated(t) = meter.handle_telegram(&about, &frame) {
//!     println!("{}", meter.to_json(Some(&t)));
//! }
//! ```

pub mod address;
pub mod bus;
pub mod constants;
pub mod device_manager;
pub mod error;
pub mod formula;
pub mod logging;
pub mod meters;
pub mod payload;
pub mod shell;
pub mod telegram;
pub mod translate;
pub mod units;
pub mod util;

pub use crate::error::MetersError;
pub use crate::logging::init_logger;

// The most used types, re-exported for a flat API.
pub use crate::address::{Address, AddressExpression};
pub use crate::bus::{BusDevice, LinkMode, LinkModeSet};
pub use crate::device_manager::DeviceManager;
pub use crate::meters::{create_meter, Meter, MeterInfo, TelegramOutcome};
pub use crate::telegram::{AboutTelegram, FrameType, MeterKeys, Telegram};
pub use crate::units::{convert, Quantity, Unit};
