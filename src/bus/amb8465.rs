//! # Amber AMB8465 Radio Module
//!
//! Command frames start with `0xFF cmd len payload` and end with an XOR
//! checksum over everything before it. Responses repeat the command with
//! bit 0x80 set. Telegrams received off the air arrive as bare
//! length-prefixed wM-Bus frames, optionally followed by one RSSI byte
//! when auto-RSSI is on (we turn it on). The module is half duplex, so a
//! send temporarily switches into a transmit link mode and back.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Duration};

use crate::bus::{
    BusDevice, ContentStartsWith, DeviceError, DeviceState, LinkMode, LinkModeSet, TelegramSender,
};
use crate::constants::is_valid_wmbus_c_field;
use crate::telegram::{AboutTelegram, FrameType};
use crate::util::hex::encode_hex;

pub const AMB8465_SOF: u8 = 0xff;

pub const CMD_DATA_REQ: u8 = 0x00;
pub const CMD_DATARETRY_REQ: u8 = 0x02;
pub const CMD_DATA_IND: u8 = 0x03;
pub const CMD_SET_MODE_REQ: u8 = 0x04;
pub const CMD_RESET_REQ: u8 = 0x05;
pub const CMD_SET_CHANNEL_REQ: u8 = 0x06;
pub const CMD_SET_REQ: u8 = 0x09;
pub const CMD_GET_REQ: u8 = 0x0a;
pub const CMD_SERIALNO_REQ: u8 = 0x0b;

const RESPONSE_BIT: u8 = 0x80;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const SET_LINK_MODE_RETRIES: usize = 3;

/// The module's link mode selector values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkModeAmb8465 {
    S1 = 0x01,
    S1m = 0x02,
    S2 = 0x03,
    T1Meter = 0x05,
    T2Other = 0x06,
    C1a = 0x0e,
    C2a = 0x0f,
}

/// RSSI byte to dBm: two's complement halves offset by the module's
/// -74 dBm reference.
pub fn amb8465_rssi_dbm(rssi: u8) -> i32 {
    let r = rssi as i32;
    if r >= 128 {
        (r - 256) / 2 - 74
    } else {
        r / 2 - 74
    }
}

/// XOR checksum over the whole frame before the checksum byte.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Build a command frame.
pub fn build_request(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(AMB8465_SOF);
    out.push(cmd);
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    let cs = xor_checksum(&out);
    out.push(cs);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Amb8465Message {
    /// A command response: (cmd | 0x80, payload).
    Response { cmd: u8, payload: Vec<u8>, rssi_dbm: Option<i32> },
    /// A received wM-Bus telegram, length byte included.
    Telegram { frame: Vec<u8>, rssi_dbm: Option<i32> },
}

/// Streaming deframer for the mixed command/telegram byte stream.
#[derive(Debug)]
pub struct Amb8465Deframer {
    buf: BytesMut,
    rssi_expected: bool,
}

impl Amb8465Deframer {
    pub fn new(rssi_expected: bool) -> Amb8465Deframer {
        Amb8465Deframer {
            buf: BytesMut::new(),
            rssi_expected,
        }
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete message. Resynchronisation scans for either a
    /// command SOF or a plausible `length | C-field` pair.
    pub fn try_message(&mut self) -> Option<Amb8465Message> {
        loop {
            if self.buf.is_empty() {
                return None;
            }
            if self.buf[0] == AMB8465_SOF {
                return self.try_command();
            }
            // Telegram mode: length prefixed frame with a valid C field.
            if self.buf.len() < 2 {
                return None;
            }
            let len = self.buf[0] as usize;
            if len >= 10 && is_valid_wmbus_c_field(self.buf[1]) {
                let rssi_len = if self.rssi_expected { 1 } else { 0 };
                let total = 1 + len + rssi_len;
                if self.buf.len() < total {
                    return None;
                }
                let frame = self.buf[..1 + len].to_vec();
                let rssi_dbm = if self.rssi_expected {
                    Some(amb8465_rssi_dbm(self.buf[1 + len]))
                } else {
                    None
                };
                self.buf.advance(total);
                return Some(Amb8465Message::Telegram { frame, rssi_dbm });
            }
            // Nothing plausible at the front, drop one byte and rescan.
            trace!("(amb8465) resyncing, dropping byte {:02x}", self.buf[0]);
            self.buf.advance(1);
        }
    }

    fn try_command(&mut self) -> Option<Amb8465Message> {
        if self.buf.len() < 4 {
            return None;
        }
        let cmd = self.buf[1];
        let len = self.buf[2] as usize;
        // Only the radio data indication carries a trailing RSSI byte.
        let rssi_len = if self.rssi_expected && cmd == CMD_DATA_IND { 1 } else { 0 };
        let total = 3 + len + rssi_len + 1;
        if self.buf.len() < total {
            return None;
        }
        let frame: Vec<u8> = self.buf[..total].to_vec();
        let cs = xor_checksum(&frame[..total - 1]);
        if cs != frame[total - 1] {
            debug!(
                "(amb8465) checksum error {:02x} (should {cs:02x}), resyncing",
                frame[total - 1]
            );
            self.buf.advance(1);
            return self.try_message();
        }
        self.buf.advance(total);

        let rssi_dbm = if rssi_len == 1 {
            Some(amb8465_rssi_dbm(frame[3 + len]))
        } else {
            None
        };

        if cmd == CMD_DATA_IND {
            // Radio telegram wrapped in the command framing.
            return Some(Amb8465Message::Telegram {
                frame: frame[3..3 + len].to_vec(),
                rssi_dbm,
            });
        }
        Some(Amb8465Message::Response {
            cmd,
            payload: frame[3..3 + len].to_vec(),
            rssi_dbm,
        })
    }
}

/// An AMB8465 dongle bound to a serial stream.
pub struct Amb8465<S> {
    bus_alias: String,
    dev_name: String,
    stream: S,
    deframer: Amb8465Deframer,
    link_modes: LinkModeSet,
    state: DeviceState,
    telegrams: TelegramSender,
    cached_device_id: String,
}

impl<S> Amb8465<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(bus_alias: &str, dev_name: &str, stream: S, telegrams: TelegramSender) -> Amb8465<S> {
        Amb8465 {
            bus_alias: bus_alias.to_string(),
            dev_name: dev_name.to_string(),
            stream,
            deframer: Amb8465Deframer::new(true),
            link_modes: LinkModeSet::default(),
            state: DeviceState::Opened,
            telegrams,
            cached_device_id: String::new(),
        }
    }

    fn forward_telegram(&mut self, frame: Vec<u8>, rssi_dbm: Option<i32>) {
        let about = AboutTelegram::new(
            &format!("amb8465[{}]", self.cached_device_id),
            rssi_dbm.unwrap_or(0),
            FrameType::WMBus,
        );
        if self.telegrams.send((about, frame)).is_err() {
            warn!("(amb8465) telegram listener gone");
        }
    }

    async fn request(
        &mut self,
        cmd: u8,
        payload: &[u8],
        what: &'static str,
    ) -> Result<Vec<u8>, DeviceError> {
        let frame = build_request(cmd, payload);
        trace!("(amb8465) sending {}", encode_hex(&frame));
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| DeviceError::Serial(e.to_string()))?;

        let expect = cmd | RESPONSE_BIT;
        let deadline = tokio::time::Instant::now() + COMMAND_TIMEOUT;
        let mut chunk = [0u8; 256];
        loop {
            while let Some(msg) = self.deframer.try_message() {
                match msg {
                    Amb8465Message::Telegram { frame, rssi_dbm } => {
                        self.forward_telegram(frame, rssi_dbm)
                    }
                    Amb8465Message::Response { cmd, payload, .. } if cmd == expect => {
                        return Ok(payload)
                    }
                    Amb8465Message::Response { cmd, .. } => {
                        debug!("(amb8465) ignoring unexpected response {cmd:02x}");
                    }
                }
            }
            let n = timeout_at(deadline, self.stream.read(&mut chunk))
                .await
                .map_err(|_| DeviceError::NoResponse(what))?
                .map_err(|e| DeviceError::Serial(e.to_string()))?;
            if n == 0 {
                return Err(DeviceError::Closed);
            }
            self.deframer.add_bytes(&chunk[..n]);
        }
    }

    fn select_mode(lms: LinkModeSet) -> Option<LinkModeAmb8465> {
        if lms.has(LinkMode::C1) {
            return Some(LinkModeAmb8465::C1a);
        }
        if lms.has(LinkMode::T1) {
            return Some(LinkModeAmb8465::T1Meter);
        }
        if lms.has(LinkMode::S1) {
            return Some(LinkModeAmb8465::S1);
        }
        if lms.has(LinkMode::S1m) {
            return Some(LinkModeAmb8465::S1m);
        }
        None
    }

    async fn set_mode_raw(&mut self, mode: u8) -> Result<(), DeviceError> {
        // Volatile mode switch, not written to flash.
        let rsp = self.request(CMD_SET_MODE_REQ, &[mode], "set_mode").await?;
        if rsp.first() == Some(&0x00) {
            Ok(())
        } else {
            Err(DeviceError::Rejected("set_mode"))
        }
    }

    pub async fn read_some(&mut self) -> Result<(), DeviceError> {
        let mut chunk = [0u8; 256];
        let n = self
            .stream
            .read(&mut chunk)
            .await
            .map_err(|e| DeviceError::Serial(e.to_string()))?;
        if n == 0 {
            return Err(DeviceError::Closed);
        }
        self.process_bytes(&chunk[..n]);
        Ok(())
    }
}

#[async_trait]
impl<S> BusDevice for Amb8465<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn bus_alias(&self) -> &str {
        &self.bus_alias
    }

    fn device(&self) -> String {
        format!("{}:amb8465[{}]", self.dev_name, self.cached_device_id)
    }

    async fn ping(&mut self) -> Result<(), DeviceError> {
        // No dedicated ping; a parameter read serves the same purpose.
        self.request(CMD_GET_REQ, &[0x00, 0x01], "ping").await?;
        Ok(())
    }

    async fn get_device_id(&mut self) -> Result<String, DeviceError> {
        // Read the 4 byte id out of the parameter memory.
        let rsp = self.request(CMD_GET_REQ, &[0x19, 0x04], "get_id").await?;
        if rsp.len() < 6 {
            return Err(DeviceError::Rejected("get_id"));
        }
        self.cached_device_id = encode_hex(&rsp[2..6]);
        Ok(self.cached_device_id.clone())
    }

    async fn get_device_unique_id(&mut self) -> Result<String, DeviceError> {
        let rsp = self.request(CMD_SERIALNO_REQ, &[], "serialno").await?;
        if rsp.len() < 4 {
            return Err(DeviceError::Rejected("serialno"));
        }
        Ok(encode_hex(&rsp[0..4]))
    }

    fn get_link_modes(&self) -> LinkModeSet {
        self.link_modes
    }

    fn supported_link_modes(&self) -> LinkModeSet {
        LinkModeSet::of(&[LinkMode::C1, LinkMode::T1, LinkMode::S1, LinkMode::S1m])
    }

    fn can_set_link_modes(&self, lms: LinkModeSet) -> bool {
        if lms.is_empty() || !self.supported_link_modes().has_all(lms) {
            return false;
        }
        // One mode at a time on this hardware.
        Self::select_mode(lms).is_some() && !(lms.has(LinkMode::C1) && lms.has(LinkMode::T1))
    }

    async fn set_link_modes(&mut self, lms: LinkModeSet) -> Result<(), DeviceError> {
        let Some(mode) = Self::select_mode(lms) else {
            return Err(DeviceError::UnsupportedLinkModes(lms.hr()));
        };

        let mut last_err = DeviceError::NoResponse("set_mode");
        for attempt in 1..=SET_LINK_MODE_RETRIES {
            match self.set_mode_raw(mode as u8).await {
                Ok(()) => {
                    self.link_modes = lms;
                    self.state = DeviceState::Running;
                    debug!("(amb8465) link modes set to {} (mode {:02x})", lms.hr(), mode as u8);
                    return Ok(());
                }
                Err(e) => {
                    warn!("(amb8465) set link modes attempt {attempt} failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn send_telegram(
        &mut self,
        _starts_with: ContentStartsWith,
        content: &[u8],
    ) -> Result<(), DeviceError> {
        // Half duplex: hop into the transmit flavour of the current mode,
        // send, then restore the receive mode.
        let rx_mode = Self::select_mode(self.link_modes)
            .ok_or_else(|| DeviceError::UnsupportedLinkModes(self.link_modes.hr()))?;
        let tx_mode = match rx_mode {
            LinkModeAmb8465::C1a => LinkModeAmb8465::C2a,
            LinkModeAmb8465::T1Meter => LinkModeAmb8465::T2Other,
            other => other,
        };

        self.state = DeviceState::TransmittingTemp;
        let result = async {
            if tx_mode != rx_mode {
                self.set_mode_raw(tx_mode as u8).await?;
            }
            self.request(CMD_DATA_REQ, content, "send_telegram").await?;
            if tx_mode != rx_mode {
                self.set_mode_raw(rx_mode as u8).await?;
            }
            Ok(())
        }
        .await;
        self.state = DeviceState::Running;
        result
    }

    fn process_bytes(&mut self, bytes: &[u8]) {
        self.deframer.add_bytes(bytes);
        while let Some(msg) = self.deframer.try_message() {
            match msg {
                Amb8465Message::Telegram { frame, rssi_dbm } => self.forward_telegram(frame, rssi_dbm),
                Amb8465Message::Response { cmd, .. } => {
                    debug!("(amb8465) unsolicited response {cmd:02x}");
                }
            }
        }
    }

    async fn read_and_process(&mut self) -> Result<(), DeviceError> {
        self.read_some().await
    }

    async fn reset(&mut self) -> Result<(), DeviceError> {
        self.request(CMD_RESET_REQ, &[], "reset").await?;
        let modes = self.link_modes;
        if !modes.is_empty() {
            self.set_link_modes(modes).await?;
        }
        Ok(())
    }

    fn state(&self) -> DeviceState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_request_checksum() {
        let r = build_request(CMD_SET_MODE_REQ, &[0x0e]);
        assert_eq!(r[0], 0xff);
        assert_eq!(r[1], CMD_SET_MODE_REQ);
        assert_eq!(r[2], 1);
        assert_eq!(r[3], 0x0e);
        assert_eq!(r[4], xor_checksum(&r[..4]));
    }

    #[test]
    fn test_rssi_conversion() {
        // Formula from the module manual.
        assert_eq!(amb8465_rssi_dbm(100), 100 / 2 - 74);
        assert_eq!(amb8465_rssi_dbm(200), (200 - 256) / 2 - 74);
        assert_eq!(amb8465_rssi_dbm(0), -74);
    }

    #[test]
    fn test_deframe_bare_telegram_with_rssi() {
        // A length prefixed wmbus frame, SND_NR, followed by an rssi byte.
        let mut telegram = vec![0x0a, 0x44];
        telegram.extend_from_slice(&[0u8; 9]);
        let mut stream = telegram.clone();
        stream.push(120); // rssi

        let mut d = Amb8465Deframer::new(true);
        d.add_bytes(&stream);
        match d.try_message().expect("telegram") {
            Amb8465Message::Telegram { frame, rssi_dbm } => {
                assert_eq!(frame, telegram);
                assert_eq!(rssi_dbm, Some(120 / 2 - 74));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_deframe_command_response() {
        let mut frame = vec![0xff, CMD_SET_MODE_REQ | RESPONSE_BIT, 0x01, 0x00];
        frame.push(xor_checksum(&frame));
        let mut d = Amb8465Deframer::new(true);
        d.add_bytes(&frame);
        match d.try_message().expect("response") {
            Amb8465Message::Response { cmd, payload, .. } => {
                assert_eq!(cmd, CMD_SET_MODE_REQ | RESPONSE_BIT);
                assert_eq!(payload, vec![0x00]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_deframe_rejects_bad_checksum() {
        let mut frame = vec![0xff, CMD_SET_MODE_REQ | RESPONSE_BIT, 0x01, 0x00];
        frame.push(xor_checksum(&frame) ^ 0x55);
        let mut d = Amb8465Deframer::new(true);
        d.add_bytes(&frame);
        assert!(d.try_message().is_none());
    }

    #[test]
    fn test_deframe_resyncs_on_garbage() {
        let mut telegram = vec![0x0a, 0x44];
        telegram.extend_from_slice(&[1u8; 9]);
        let mut stream = vec![0x03, 0x99]; // implausible length/C pair
        stream.extend_from_slice(&telegram);
        stream.push(90);

        let mut d = Amb8465Deframer::new(true);
        d.add_bytes(&stream);
        match d.try_message().expect("telegram after resync") {
            Amb8465Message::Telegram { frame, .. } => assert_eq!(frame, telegram),
            other => panic!("unexpected {other:?}"),
        }
    }
}
