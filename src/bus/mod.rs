//! # Bus Devices
//!
//! The receive path starts in a dongle: the iM871A and AMB8465 radio
//! modules speak their own serial framing, carry RSSI, and need their
//! radio link mode configured before telegrams flow. Both implement the
//! [`BusDevice`] contract; the device manager owns their serial streams
//! and drives the shared state machine
//! `Closed -> Opened -> LinkModesSet -> Running`.

pub mod amb8465;
pub mod im871a;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::telegram::AboutTelegram;

/// Radio modulation/direction classes, EN 13757-4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum LinkMode {
    Any,
    C1,
    S1,
    S1m,
    T1,
    N1a,
    N1b,
    N1c,
    N1d,
    N1e,
    N1f,
    MBus,
    Unknown,
}

impl LinkMode {
    fn bit(self) -> u32 {
        match self {
            LinkMode::Any => 0xffff,
            LinkMode::C1 => 0x1,
            LinkMode::S1 => 0x2,
            LinkMode::S1m => 0x4,
            LinkMode::T1 => 0x8,
            LinkMode::N1a => 0x10,
            LinkMode::N1b => 0x20,
            LinkMode::N1c => 0x40,
            LinkMode::N1d => 0x80,
            LinkMode::N1e => 0x100,
            LinkMode::N1f => 0x200,
            LinkMode::MBus => 0x400,
            LinkMode::Unknown => 0x0,
        }
    }

    pub fn from_name(s: &str) -> Option<LinkMode> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Some(LinkMode::Any),
            "c1" => Some(LinkMode::C1),
            "s1" => Some(LinkMode::S1),
            "s1m" => Some(LinkMode::S1m),
            "t1" => Some(LinkMode::T1),
            "n1a" => Some(LinkMode::N1a),
            "n1b" => Some(LinkMode::N1b),
            "n1c" => Some(LinkMode::N1c),
            "n1d" => Some(LinkMode::N1d),
            "n1e" => Some(LinkMode::N1e),
            "n1f" => Some(LinkMode::N1f),
            "mbus" => Some(LinkMode::MBus),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LinkMode::Any => "any",
            LinkMode::C1 => "c1",
            LinkMode::S1 => "s1",
            LinkMode::S1m => "s1m",
            LinkMode::T1 => "t1",
            LinkMode::N1a => "n1a",
            LinkMode::N1b => "n1b",
            LinkMode::N1c => "n1c",
            LinkMode::N1d => "n1d",
            LinkMode::N1e => "n1e",
            LinkMode::N1f => "n1f",
            LinkMode::MBus => "mbus",
            LinkMode::Unknown => "unknown",
        }
    }
}

/// A set of link modes, as a bitset.
///
/// `supports` is a bitwise intersection test: a dongle listening to C1+T1
/// supports a meter transmitting C1, while a dongle listening only to T1
/// does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LinkModeSet(u32);

impl LinkModeSet {
    pub fn of(modes: &[LinkMode]) -> LinkModeSet {
        let mut s = LinkModeSet::default();
        for m in modes {
            s.add(*m);
        }
        s
    }

    pub fn add(&mut self, lm: LinkMode) -> &mut Self {
        self.0 |= lm.bit();
        self
    }

    pub fn union(&mut self, other: LinkModeSet) {
        self.0 |= other.0;
    }

    pub fn has(&self, lm: LinkMode) -> bool {
        self.0 & lm.bit() != 0
    }

    pub fn has_all(&self, other: LinkModeSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn supports(&self, other: LinkModeSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn as_bits(&self) -> u32 {
        self.0
    }

    /// Parse "c1,t1" style lists.
    pub fn parse(s: &str) -> Option<LinkModeSet> {
        let mut set = LinkModeSet::default();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part == "none" {
                continue;
            }
            set.add(LinkMode::from_name(part)?);
        }
        Some(set)
    }

    /// Human readable form, eg "c1,t1".
    pub fn hr(&self) -> String {
        const ALL: &[LinkMode] = &[
            LinkMode::C1,
            LinkMode::S1,
            LinkMode::S1m,
            LinkMode::T1,
            LinkMode::N1a,
            LinkMode::N1b,
            LinkMode::N1c,
            LinkMode::N1d,
            LinkMode::N1e,
            LinkMode::N1f,
            LinkMode::MBus,
        ];
        let names: Vec<&str> = ALL.iter().filter(|m| self.has(**m)).map(|m| m.name()).collect();
        if names.is_empty() {
            "none".to_string()
        } else {
            names.join(",")
        }
    }
}

/// What a telegram buffer being sent starts with, so a device can frame it
/// properly for the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentStartsWith {
    CField,
    CiField,
    ShortFrame,
    LongFrame,
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("serial error: {0}")]
    Serial(String),

    #[error("device did not respond to {0}")]
    NoResponse(&'static str),

    #[error("device rejected {0}")]
    Rejected(&'static str),

    #[error("link modes {0} not supported by this device")]
    UnsupportedLinkModes(String),

    #[error("device closed")]
    Closed,
}

/// Inbound telegrams leave the device through this channel, already
/// unframed and tagged with receive metadata.
pub type TelegramSender = mpsc::UnboundedSender<(AboutTelegram, Vec<u8>)>;

/// Shared device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Closed,
    Opened,
    LinkModesSet,
    Running,
    /// Temporarily in a transmit link mode for a send.
    TransmittingTemp,
}

/// Supervision settings: reset when no telegram arrives within the
/// expected activity window.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    pub timeout: Duration,
    pub expected_activity: Duration,
}

impl Default for Watchdog {
    fn default() -> Self {
        Watchdog {
            timeout: Duration::from_secs(3600),
            expected_activity: Duration::from_secs(3600),
        }
    }
}

/// The contract every dongle (and the wired mbus path) fulfils.
#[async_trait]
pub trait BusDevice: Send {
    /// Alias used by meters to select a specific bus.
    fn bus_alias(&self) -> &str;
    /// Human readable device description, eg `/dev/ttyUSB0:im871a`.
    fn device(&self) -> String;

    async fn ping(&mut self) -> Result<(), DeviceError>;
    /// The changeable id of the dongle, its transmit address.
    async fn get_device_id(&mut self) -> Result<String, DeviceError>;
    /// The immutable serial number, where the hardware has one.
    async fn get_device_unique_id(&mut self) -> Result<String, DeviceError>;

    fn get_link_modes(&self) -> LinkModeSet;
    fn supported_link_modes(&self) -> LinkModeSet;
    fn can_set_link_modes(&self, lms: LinkModeSet) -> bool;
    async fn set_link_modes(&mut self, lms: LinkModeSet) -> Result<(), DeviceError>;

    async fn send_telegram(
        &mut self,
        starts_with: ContentStartsWith,
        content: &[u8],
    ) -> Result<(), DeviceError>;

    /// Feed raw serial bytes into the device's deframer. Complete
    /// telegrams are handed to the registered telegram channel.
    fn process_bytes(&mut self, bytes: &[u8]);

    /// Await some serial bytes and run them through the deframer. The
    /// device manager's reader task loops on this.
    async fn read_and_process(&mut self) -> Result<(), DeviceError>;

    /// Reinitialize after a watchdog reset.
    async fn reset(&mut self) -> Result<(), DeviceError>;

    fn state(&self) -> DeviceState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_mode_set_ops() {
        let set = LinkModeSet::of(&[LinkMode::C1, LinkMode::T1]);
        assert!(set.has(LinkMode::C1));
        assert!(!set.has(LinkMode::S1));
        assert_eq!(set.hr(), "c1,t1");

        let just_c1 = LinkModeSet::of(&[LinkMode::C1]);
        assert!(set.supports(just_c1));
        assert!(!just_c1.supports(LinkModeSet::of(&[LinkMode::T1])));
        assert!(set.has_all(just_c1));
        assert!(!just_c1.has_all(set));
    }

    #[test]
    fn test_parse_link_modes() {
        let set = LinkModeSet::parse("c1,t1").unwrap();
        assert_eq!(set, LinkModeSet::of(&[LinkMode::C1, LinkMode::T1]));
        assert!(LinkModeSet::parse("c1,bogus").is_none());
        assert_eq!(LinkModeSet::parse("none").unwrap(), LinkModeSet::default());
    }
}
