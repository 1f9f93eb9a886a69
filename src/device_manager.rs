//! # Device Manager
//!
//! Owns the bus devices and the telegram dispatch loop. Each device gets
//! its own reader task feeding a shared channel; the dispatch loop is the
//! single place telegrams meet meters, so meter state never needs locking.
//! Named timers run their callbacks on their own tasks, and a per device
//! watchdog resets a dongle that has gone quiet during a window where
//! activity was expected.
//!
//! `stop()` is idempotent: it flips a watch channel every task selects on,
//! and `run()` drains out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::bus::{BusDevice, ContentStartsWith, DeviceError, TelegramSender, Watchdog};
use crate::meters::{Meter, TelegramOutcome};
use crate::telegram::dedup::DuplicateFilter;
use crate::telegram::{AboutTelegram, FrameType, Telegram};

/// Alarm classes surfaced through the alarm hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
    DeviceFailure,
    RegularResetFailure,
    DeviceInactivity,
    SpecifiedDeviceNotFound,
}

impl Alarm {
    pub fn name(&self) -> &'static str {
        match self {
            Alarm::DeviceFailure => "DeviceFailure",
            Alarm::RegularResetFailure => "RegularResetFailure",
            Alarm::DeviceInactivity => "DeviceInactivity",
            Alarm::SpecifiedDeviceNotFound => "SpecifiedDeviceNotFound",
        }
    }
}

pub type AlarmHandler = Arc<dyn Fn(Alarm, &str) + Send + Sync>;
pub type UpdateHandler = Arc<dyn Fn(&Meter, &Telegram) + Send + Sync>;

/// Bounded wait for a polled meter's response telegram.
const POLL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(100);

struct PendingPoll {
    meter_id: String,
    notify: oneshot::Sender<()>,
}

/// The event loop owner.
pub struct DeviceManager {
    telegram_tx: TelegramSender,
    telegram_rx: Option<mpsc::UnboundedReceiver<(AboutTelegram, Vec<u8>)>>,
    stop_tx: watch::Sender<bool>,
    meters: Vec<Meter>,
    dedup: DuplicateFilter,
    device_tasks: Vec<JoinHandle<()>>,
    timer_tasks: Vec<JoinHandle<()>>,
    working_devices: Arc<AtomicUsize>,
    expect_devices_to_work: bool,
    alarm_handler: Option<AlarmHandler>,
    update_handlers: Vec<UpdateHandler>,
    pending_poll: Arc<Mutex<Option<PendingPoll>>>,
}

impl DeviceManager {
    pub fn new(expect_devices_to_work: bool) -> DeviceManager {
        let (telegram_tx, telegram_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = watch::channel(false);
        DeviceManager {
            telegram_tx,
            telegram_rx: Some(telegram_rx),
            stop_tx,
            meters: Vec::new(),
            dedup: DuplicateFilter::default(),
            device_tasks: Vec::new(),
            timer_tasks: Vec::new(),
            working_devices: Arc::new(AtomicUsize::new(0)),
            expect_devices_to_work,
            alarm_handler: None,
            update_handlers: Vec::new(),
            pending_poll: Arc::new(Mutex::new(None)),
        }
    }

    /// The channel devices push received telegrams into.
    pub fn telegram_sender(&self) -> TelegramSender {
        self.telegram_tx.clone()
    }

    pub fn add_meter(&mut self, mut meter: Meter) {
        meter.set_index(self.meters.len());
        info!(
            "(manager) meter {} [{}] using driver {}",
            meter.name(),
            meter.index(),
            meter.driver_name()
        );
        self.meters.push(meter);
    }

    pub fn meters(&self) -> &[Meter] {
        &self.meters
    }

    pub fn on_alarm(&mut self, handler: AlarmHandler) {
        self.alarm_handler = Some(handler);
    }

    /// Printers and shell hooks register here; invoked on the dispatch
    /// loop after a meter updates.
    pub fn on_meter_updated(&mut self, handler: UpdateHandler) {
        self.update_handlers.push(handler);
    }

    fn raise_alarm(&self, alarm: Alarm, info: &str) {
        warn!("[ALARM {}] {info}", alarm.name());
        if let Some(h) = &self.alarm_handler {
            h(alarm, info);
        }
    }

    /// Spawn the reader task for a device. The watchdog resets the device
    /// when nothing arrives within the expected activity window; repeated
    /// reset failures raise a DeviceFailure alarm and retire the device.
    pub fn add_device(&mut self, mut device: Box<dyn BusDevice>, watchdog: Watchdog) {
        let mut stop_rx = self.stop_tx.subscribe();
        let working = self.working_devices.clone();
        let alarm_handler = self.alarm_handler.clone();
        working.fetch_add(1, Ordering::SeqCst);

        let task = tokio::spawn(async move {
            let mut consecutive_reset_failures = 0;
            loop {
                let read = tokio::time::timeout(watchdog.expected_activity, device.read_and_process());
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    result = read => match result {
                        Ok(Ok(())) => {
                            consecutive_reset_failures = 0;
                        }
                        Ok(Err(DeviceError::Closed)) => {
                            warn!("(manager) device {} closed", device.device());
                            break;
                        }
                        Ok(Err(e)) => {
                            warn!("(manager) device {} error: {e}", device.device());
                            if device.reset().await.is_err() {
                                consecutive_reset_failures += 1;
                            }
                        }
                        Err(_) => {
                            debug!("(manager) device {} inactive, resetting", device.device());
                            if let Some(h) = &alarm_handler {
                                h(Alarm::DeviceInactivity, &device.device());
                            }
                            if device.reset().await.is_err() {
                                consecutive_reset_failures += 1;
                            }
                        }
                    }
                }
                if consecutive_reset_failures >= 3 {
                    if let Some(h) = &alarm_handler {
                        h(Alarm::DeviceFailure, &device.device());
                    }
                    break;
                }
            }
            working.fetch_sub(1, Ordering::SeqCst);
        });
        self.device_tasks.push(task);
    }

    /// Register a named periodic callback. Each timer runs on its own
    /// task, so one long callback cannot stall another, and an interval
    /// tick never overlaps its own callback.
    pub fn start_regular_callback(
        &mut self,
        name: &str,
        period: Duration,
        callback: Arc<dyn Fn() + Send + Sync>,
    ) {
        let name = name.to_string();
        let mut stop_rx = self.stop_tx.subscribe();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {
                        debug!("(timer) {name}");
                        callback();
                    }
                }
            }
        });
        self.timer_tasks.push(task);
    }

    /// Idempotent shutdown request.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// A handle that can request shutdown from another task, eg a signal
    /// handler.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop_tx.clone())
    }

    /// Send a poll request on a bus device and wait (bounded) for the
    /// response telegram to arrive through the dispatch loop.
    pub async fn poll_and_wait(
        &self,
        device: &mut dyn BusDevice,
        meter_id: &str,
        request: &[u8],
    ) -> Result<(), DeviceError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_poll.lock().await;
            *pending = Some(PendingPoll {
                meter_id: meter_id.to_string(),
                notify: tx,
            });
        }
        device
            .send_telegram(ContentStartsWith::ShortFrame, request)
            .await?;
        match tokio::time::timeout(POLL_RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                let mut pending = self.pending_poll.lock().await;
                *pending = None;
                Err(DeviceError::NoResponse("poll"))
            }
        }
    }

    /// Offer one telegram to every meter. Returns how many meters took it.
    fn dispatch_telegram(&mut self, about: &AboutTelegram, frame: &[u8]) -> usize {
        // Quick header parse for the dedup key and the poll matcher.
        let mut header = Telegram::new(about.clone());
        let id = if header.parse_header(frame) {
            header.addresses.last().map(|a| a.id.clone()).unwrap_or_default()
        } else {
            String::new()
        };

        if about.frame_type == FrameType::WMBus && self.dedup.is_duplicate(&id, frame) {
            return 0;
        }

        if let Ok(mut pending) = self.pending_poll.try_lock() {
            if pending.as_ref().is_some_and(|p| p.meter_id == id) {
                if let Some(p) = pending.take() {
                    let _ = p.notify.send(());
                }
            }
        }

        let mut handled = 0;
        for i in 0..self.meters.len() {
            match self.meters[i].handle_telegram(about, frame) {
                TelegramOutcome::NotForMe => {}
                TelegramOutcome::ParseFailed(t) => {
                    debug!(
                        "(manager) telegram from {} matched {} but could not be decoded: {:?}",
                        t.ids_comma_separated(),
                        self.meters[i].name(),
                        t.error
                    );
                    handled += 1;
                }
                TelegramOutcome::Updated(t) => {
                    for h in &self.update_handlers {
                        h(&self.meters[i], &t);
                    }
                    handled += 1;
                }
            }
        }
        if handled == 0 && !id.is_empty() {
            debug!("(manager) no meter configured for telegram from {id}");
        }
        handled
    }

    /// The dispatch loop. Runs until `stop()` or, when devices are
    /// expected to work, until the last one retires.
    pub async fn run(&mut self) {
        let mut rx = self.telegram_rx.take().expect("run called once");
        let mut stop_rx = self.stop_tx.subscribe();
        let mut check = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                maybe = rx.recv() => {
                    match maybe {
                        Some((about, frame)) => {
                            self.dispatch_telegram(&about, &frame);
                        }
                        None => break,
                    }
                }
                _ = check.tick() => {
                    if self.expect_devices_to_work
                        && !self.device_tasks.is_empty()
                        && self.working_devices.load(Ordering::SeqCst) == 0
                    {
                        self.raise_alarm(Alarm::DeviceFailure, "no working bus devices remain");
                        break;
                    }
                }
            }
        }

        // Wind down every task before returning so shared state is not
        // touched after the manager is dropped.
        let _ = self.stop_tx.send(true);
        for t in self.device_tasks.drain(..) {
            let _ = t.await;
        }
        for t in self.timer_tasks.drain(..) {
            let _ = t.await;
        }
    }
}

/// Clonable shutdown trigger, detached from the manager's lifetime.
#[derive(Clone)]
pub struct StopHandle(watch::Sender<bool>);

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

/// Build a wired M-Bus REQ_UD2 poll request for a primary address.
pub fn build_req_ud2(primary_address: u8, fcb: bool) -> Vec<u8> {
    let c = if fcb {
        crate::constants::C_REQ_UD2_FCB
    } else {
        crate::constants::C_REQ_UD2
    };
    let cs = c.wrapping_add(primary_address);
    vec![
        crate::constants::MBUS_FRAME_SHORT_START,
        c,
        primary_address,
        cs,
        crate::constants::MBUS_FRAME_STOP,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressExpression;
    use crate::meters::{create_meter, MeterInfo};
    use crate::util::hex::decode_hex_flex;

    fn kamheat_meter(name: &str, id_expr: &str) -> Meter {
        let mi = MeterInfo {
            name: name.to_string(),
            driver_name: "kamheat".to_string(),
            address_expressions: vec![AddressExpression::parse(id_expr, false).unwrap()],
            ..MeterInfo::default()
        };
        create_meter(&mi).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_updates_matching_meter() {
        let mut mgr = DeviceManager::new(false);
        mgr.add_meter(kamheat_meter("MyHeater", "67676767"));
        mgr.add_meter(kamheat_meter("Other", "11111111"));

        let frame = decode_hex_flex(
            "2E442D2C6767676730048D2039D1684020BCDB7803062C000043060000000314630000426C7F2A022D130001FF2100",
        )
        .unwrap();
        let about = AboutTelegram::new("test", -70, FrameType::WMBus);

        let handled = mgr.dispatch_telegram(&about, &frame);
        assert_eq!(handled, 1);
        assert_eq!(mgr.meters()[0].num_updates(), 1);
        assert_eq!(mgr.meters()[1].num_updates(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_suppression_across_dispatch() {
        let mut mgr = DeviceManager::new(false);
        mgr.add_meter(kamheat_meter("MyHeater", "67676767"));

        let frame = decode_hex_flex(
            "2E442D2C6767676730048D2039D1684020BCDB7803062C000043060000000314630000426C7F2A022D130001FF2100",
        )
        .unwrap();
        let about = AboutTelegram::new("test", -70, FrameType::WMBus);

        assert_eq!(mgr.dispatch_telegram(&about, &frame), 1);
        // Same frame within the ttl: dropped before the meters see it.
        assert_eq!(mgr.dispatch_telegram(&about, &frame), 0);
        assert_eq!(mgr.meters()[0].num_updates(), 1);
    }

    #[test]
    fn test_build_req_ud2() {
        let f = build_req_ud2(0x01, false);
        assert_eq!(f, vec![0x10, 0x5b, 0x01, 0x5c, 0x16]);
        let f2 = build_req_ud2(0x01, true);
        assert_eq!(f2, vec![0x10, 0x7b, 0x01, 0x7c, 0x16]);
    }
}
