//! Polls all configured registers of one meter on a fixed schedule.
//!
//! A cycle holds the serial channel for its whole duration, so two cycles
//! (scheduled or requested on demand) never talk to the meter at the same
//! time. Failing registers are logged and skipped; only a cycle without a
//! single reading counts as failed.

use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, MeterConfig};
use crate::kamstrup::registers::Register;
use crate::kamstrup::transport::{Connector, SerialConnector};
use crate::kamstrup::{Kamstrup, KamstrupError, Reading};

pub mod lifecycle;
pub mod snapshot;

pub use lifecycle::{Integration, SetupError};
pub use snapshot::{CycleOutcome, PollEvent, Snapshot};

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct PollOptions {
    pub name: String,
    pub timeout: Duration,
    pub register_delay: Duration,
    pub scan_interval: Duration,
}

impl From<&MeterConfig> for PollOptions {
    fn from(config: &MeterConfig) -> Self {
        return PollOptions {
            name: config.name.clone(),
            timeout: config.timeout(),
            register_delay: config.register_delay(),
            scan_interval: config.scan_interval(),
        };
    }
}

pub struct PollCoordinator<C: Connector> {
    name: String,
    connector: C,
    codec: Kamstrup,
    registers: Vec<Register>,
    register_delay: Duration,
    scan_interval: Duration,
    /// The open channel, `None` until first use and after a transport error.
    /// Locked for a whole cycle.
    channel: Mutex<Option<C::Stream>>,
    snapshot: watch::Sender<Option<Arc<Snapshot>>>,
    last_update_success: AtomicBool,
    events: broadcast::Sender<PollEvent>,
    cancel: CancellationToken,
}

impl PollCoordinator<SerialConnector> {
    pub fn from_config(config: &MeterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let connector = SerialConnector::new(&config.port, config.baud_rate);
        PollCoordinator::new(connector, config.enabled_registers()?, PollOptions::from(config))
    }
}

impl<C: Connector> PollCoordinator<C> {
    pub fn new(connector: C, registers: Vec<Register>, options: PollOptions) -> Result<Self, ConfigError> {
        if registers.is_empty() {
            return Err(ConfigError::NoRegisters);
        }

        let mut seen = HashSet::new();
        for register in registers.iter() {
            if !seen.insert(register.command) {
                return Err(ConfigError::DuplicateRegister(register.command));
            }
        }

        if options.scan_interval.is_zero() {
            return Err(ConfigError::InvalidScanInterval);
        }
        if options.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }

        let (snapshot, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        return Ok(PollCoordinator {
            name: options.name,
            connector,
            codec: Kamstrup::new(options.timeout),
            registers,
            register_delay: options.register_delay,
            scan_interval: options.scan_interval,
            channel: Mutex::new(None),
            snapshot,
            last_update_success: AtomicBool::new(false),
            events,
            cancel: CancellationToken::new(),
        });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    /// The snapshot of the last successful cycle.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshot.subscribe()
    }

    pub fn last_update_success(&self) -> bool {
        self.last_update_success.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
        self.events.subscribe()
    }

    /// Stops the scheduler and any running cycle at the next register boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs one poll cycle.
    ///
    /// Waits for a cycle that is still running, then reads every register in
    /// configuration order. A request that is already on the wire is always
    /// completed (or timed out) before cancellation is honoured.
    pub async fn refresh(&self) -> CycleOutcome {
        let mut channel = self.channel.lock().await;
        debug!("[{}] Poll cycle start", self.name);

        let mut readings = BTreeMap::new();
        for (index, register) in self.registers.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("[{}] Poll cycle cancelled before {}", self.name, register.name);
                return CycleOutcome::Cancelled;
            }

            match self.exchange(&mut channel, register).await {
                Ok(reading) => {
                    if reading.unit != register.unit {
                        warn!("[{}] {} is reported in {} instead of {}", self.name, register.name, reading.unit, register.unit);
                    }
                    debug!("[{}] New value for sensor {}, value: {} {}", self.name, register.name, reading.value, reading.unit);
                    readings.insert(register.command, reading);
                }
                Err(KamstrupError::Transport(e)) => {
                    /* reopen the port for the next register */
                    *channel = None;
                    error!("[{}] Device disconnected or multiple access on port? Reading {} failed: {}", self.name, register.name, e);
                }
                Err(KamstrupError::Protocol(e)) => {
                    error!("[{}] Error reading {}: {}", self.name, register.name, e);
                }
            }

            if index + 1 < self.registers.len() {
                tokio::time::sleep(self.register_delay).await;
            }
        }

        /* publish while still holding the channel, a waiting cycle must not overtake us */
        let outcome = self.publish(readings);
        drop(channel);
        outcome
    }

    async fn exchange(&self, channel: &mut Option<C::Stream>, register: &Register) -> Result<Reading, KamstrupError> {
        let stream = match channel.take() {
            Some(stream) => stream,
            None => self.connector.connect()?,
        };
        let stream = channel.insert(stream);

        self.codec.read_register(stream, register.command).await
    }

    fn publish(&self, readings: BTreeMap<u16, Reading>) -> CycleOutcome {
        if readings.is_empty() {
            self.last_update_success.store(false, Ordering::SeqCst);
            error!("[{}] None of the {} registers could be read, keeping the last snapshot", self.name, self.registers.len());
            let _ = self.events.send(PollEvent::UpdateFailed);
            return CycleOutcome::Failed;
        }

        let snapshot = Arc::new(Snapshot::new(readings));
        info!("[{}] Poll cycle done, {} of {} registers read", self.name, snapshot.len(), self.registers.len());

        self.snapshot.send_replace(Some(snapshot.clone()));
        self.last_update_success.store(true, Ordering::SeqCst);
        let _ = self.events.send(PollEvent::Updated(snapshot.clone()));

        CycleOutcome::Updated(snapshot)
    }

    /// Polls every `scan_interval` until cancelled. The first poll happens one
    /// interval from now, the initial refresh is the owner's job.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.scan_interval, self.scan_interval);
        /* a cycle longer than the interval delays the next one instead of stacking up ticks */
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("[{}] Polling every {:?}", self.name, self.scan_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("[{}] Scheduler stopped", self.name);
                    break;
                }
                _ = ticker.tick() => {
                    self.refresh().await;
                }
            }
        }
    }

    pub fn spawn_scheduler(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kamstrup::mock_meter::{MockMeter, Reply};

    const ENERGY: u16 = 0x3c;
    const POWER: u16 = 0x4a;
    const TEMP1: u16 = 0x56;

    fn registers() -> Vec<Register> {
        vec![
            Register::new("energy", ENERGY, "energy", "kWh"),
            Register::new("power", POWER, "power", "kW"),
            Register::new("temp1", TEMP1, "temp1", "°C"),
        ]
    }

    fn options() -> PollOptions {
        PollOptions {
            name: "test".to_string(),
            timeout: Duration::from_secs(1),
            register_delay: Duration::from_secs(1),
            scan_interval: Duration::from_secs(10),
        }
    }

    /* 1234.5 kWh, 2.5 kW, 70.00 °C */
    fn healthy_meter() -> MockMeter {
        let meter = MockMeter::new();
        meter.set_reply(ENERGY, Reply::value(2, 0x41, 12345));
        meter.set_reply(POWER, Reply::value(22, 0x41, 25));
        meter.set_reply(TEMP1, Reply::value(37, 0x42, 7000));
        meter
    }

    fn coordinator(meter: &MockMeter, regs: Vec<Register>) -> PollCoordinator<MockMeter> {
        PollCoordinator::new(meter.clone(), regs, options()).unwrap()
    }

    fn reading(command: u16, value: f64, unit: &str) -> Reading {
        Reading { command, value, unit: unit.to_string() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_registers_succeed() {
        let meter = healthy_meter();
        let c = coordinator(&meter, registers());
        let mut events = c.subscribe();

        let snapshot = match c.refresh().await {
            CycleOutcome::Updated(s) => s,
            other => panic!("Unexpected outcome {:?}", other),
        };

        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get(ENERGY), Some(&reading(ENERGY, 1234.5, "kWh")));
        assert_eq!(snapshot.get(POWER), Some(&reading(POWER, 2.5, "kW")));
        assert_eq!(snapshot.get(TEMP1), Some(&reading(TEMP1, 70.0, "°C")));
        assert!(c.last_update_success());
        assert_eq!(c.snapshot(), Some(snapshot.clone()));
        assert_eq!(meter.requests(), vec![ENERGY, POWER, TEMP1]);
        assert!(matches!(events.try_recv(), Ok(PollEvent::Updated(s)) if s == snapshot));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_refresh_is_idempotent() {
        let meter = healthy_meter();
        let c = coordinator(&meter, registers());

        let first = c.refresh().await;
        let second = c.refresh().await;
        match (first, second) {
            (CycleOutcome::Updated(a), CycleOutcome::Updated(b)) => assert_eq!(a.readings, b.readings),
            other => panic!("Unexpected outcomes {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_on_one_register() {
        let meter = MockMeter::new();
        meter.set_reply(ENERGY, Reply::value(2, 0x41, 12345));
        meter.set_reply(POWER, Reply::Silent);
        let c = coordinator(&meter, registers()[..2].to_vec());

        let outcome = c.refresh().await;
        assert!(outcome.is_success());

        let snapshot = c.snapshot().unwrap();
        assert_eq!(snapshot.readings.len(), 1);
        assert_eq!(snapshot.get(ENERGY), Some(&reading(ENERGY, 1234.5, "kWh")));
        assert!(c.last_update_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_frame_only_affects_its_register() {
        let meter = healthy_meter();
        /* valid POWER answer with a flipped mantissa bit */
        let mut corrupted = crate::kamstrup::frame::encode(0x40, &[0x3f, 0x10, 0x00, 0x4a, 0x16, 0x01, 0x41, 0x19]);
        corrupted[8] ^= 0x01;
        meter.set_reply(POWER, Reply::Raw(corrupted));
        let c = coordinator(&meter, registers());

        assert!(c.refresh().await.is_success());

        let snapshot = c.snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.get(POWER).is_none());
        assert!(snapshot.get(TEMP1).is_some());
        /* protocol errors keep the channel open */
        assert_eq!(meter.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_unit_is_kept() {
        /* meter configured for GJ while the register expects kWh */
        let meter = MockMeter::new();
        meter.set_reply(ENERGY, Reply::value(8, 0x42, 12345));
        let c = coordinator(&meter, registers()[..1].to_vec());

        assert!(c.refresh().await.is_success());
        assert_eq!(c.snapshot().unwrap().get(ENERGY), Some(&reading(ENERGY, 123.45, "GJ")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_keeps_last_snapshot() {
        let meter = healthy_meter();
        let c = coordinator(&meter, registers());
        let mut events = c.subscribe();

        assert!(c.refresh().await.is_success());
        let good = c.snapshot().unwrap();
        let _ = events.try_recv();

        for command in [ENERGY, POWER, TEMP1] {
            meter.set_reply(command, Reply::Silent);
        }

        assert!(matches!(c.refresh().await, CycleOutcome::Failed));
        assert!(!c.last_update_success());
        assert!(Arc::ptr_eq(&c.snapshot().unwrap(), &good));
        assert!(matches!(events.try_recv(), Ok(PollEvent::UpdateFailed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_without_previous_snapshot() {
        let meter = MockMeter::new();
        let c = coordinator(&meter, registers());

        assert!(matches!(c.refresh().await, CycleOutcome::Failed));
        assert!(c.snapshot().is_none());
        assert!(!c.last_update_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_stale_entries_after_partial_cycle() {
        let meter = healthy_meter();
        let c = coordinator(&meter, registers());
        assert_eq!(c.refresh().await.is_success(), true);

        meter.set_reply(POWER, Reply::Silent);
        meter.set_reply(ENERGY, Reply::value(2, 0x41, 12350));
        assert!(c.refresh().await.is_success());

        let snapshot = c.snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.get(POWER).is_none());
        assert_eq!(snapshot.get(ENERGY).map(|r| r.value), Some(1235.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_refreshes_do_not_interleave() {
        let meter = healthy_meter();
        let c = coordinator(&meter, registers());

        let (a, b) = tokio::join!(c.refresh(), c.refresh());
        assert!(a.is_success() && b.is_success());
        assert_eq!(meter.requests(), vec![ENERGY, POWER, TEMP1, ENERGY, POWER, TEMP1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_reopens_channel() {
        let meter = healthy_meter();
        meter.set_reply(POWER, Reply::Broken);
        let c = coordinator(&meter, registers());

        assert!(c.refresh().await.is_success());
        let snapshot = c.snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.get(TEMP1).is_some());
        assert_eq!(meter.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_port_cannot_be_opened() {
        let meter = healthy_meter();
        meter.set_fail_connect(true);
        let c = coordinator(&meter, registers());

        assert!(matches!(c.refresh().await, CycleOutcome::Failed));
        assert!(meter.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_at_register_boundary() {
        let meter = healthy_meter();
        let c = Arc::new(coordinator(&meter, registers()));

        let cycle = tokio::spawn({
            let c = c.clone();
            async move { c.refresh().await }
        });

        /* the first register is done, the cycle sleeps before the second one */
        tokio::time::sleep(Duration::from_millis(500)).await;
        c.cancel();

        assert!(matches!(cycle.await.unwrap(), CycleOutcome::Cancelled));
        assert_eq!(meter.requests(), vec![ENERGY]);
        assert!(c.snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_polls_every_interval() {
        let meter = healthy_meter();
        let c = Arc::new(coordinator(&meter, registers()[..1].to_vec()));
        let mut events = c.subscribe();
        let mut watched = c.watch_snapshot();

        let scheduler = c.spawn_scheduler();
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(meter.requests(), vec![ENERGY, ENERGY]);
        assert!(watched.has_changed().unwrap());
        assert_eq!(*watched.borrow_and_update(), c.snapshot());
        assert!(matches!(events.try_recv(), Ok(PollEvent::Updated(_))));
        assert!(matches!(events.try_recv(), Ok(PollEvent::Updated(_))));

        c.cancel();
        scheduler.await.unwrap();
        assert!(c.is_cancelled());
    }

    #[test]
    fn test_invalid_construction() {
        let meter = MockMeter::new();
        assert!(matches!(PollCoordinator::new(meter.clone(), Vec::new(), options()), Err(ConfigError::NoRegisters)));

        let mut twice = registers();
        twice.push(Register::new("again", ENERGY, "again", "kWh"));
        assert!(matches!(PollCoordinator::new(meter, twice, options()), Err(ConfigError::DuplicateRegister(ENERGY))));
    }
}
