use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use super::batching::{partition, required_addresses, RegisterBatch};
use super::health::SensorHealth;
use crate::drivers::jk_bms::{self, JkBmsSettings};
use crate::drivers::{build_driver, probe_tcp, BusGuard, DriverKind, DriverPool, SerialSettings, TransportEndpoint};
use crate::modbus::protocol::ExceptionCode;
use crate::registers::{decode_all, FieldDescriptor, RegisterMap, SensorValue};
use crate::utils::error::{ErrorKind, ModbusError};

const BATCH_PAUSE: Duration = Duration::from_millis(50);
/// Slack on top of the device timeout for the wall-clock bound of one read.
const READ_DEADLINE_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per batch, first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Consecutive timeout or transport failures before the link is rebuilt.
    pub reconnect_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_threshold: 3,
        }
    }
}

impl RetryPolicy {
    /// Pause after failed attempt number `attempt` (0-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.reconnect_max_delay)
    }
}

/// Everything the orchestrator needs to know about one device, resolved from config and template.
#[derive(Debug, Clone)]
pub struct EquipmentSettings {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub driver: DriverKind,
    pub endpoint: TransportEndpoint,
    pub unit_id: u8,
    pub timeout: Duration,
    pub batch_size: u16,
    /// Extra quiet time before polling a secondary device on a shared bus.
    pub secondary_delay: Option<Duration>,
    pub probe_connectivity: bool,
    pub serial: SerialSettings,
    pub jk_bms: JkBmsSettings,
    pub retry: RetryPolicy,
}

impl EquipmentSettings {
    pub fn new(name: impl Into<String>, driver: DriverKind, endpoint: TransportEndpoint) -> Self {
        Self {
            name: name.into(),
            manufacturer: "Unknown".to_string(),
            model: "Unknown".to_string(),
            driver,
            endpoint,
            unit_id: 1,
            timeout: Duration::from_secs(3),
            batch_size: 50,
            secondary_delay: None,
            probe_connectivity: false,
            serial: SerialSettings::default(),
            jk_bms: JkBmsSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of one poll cycle. Fields from failed batches are simply absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollOutcome {
    pub values: BTreeMap<String, SensorValue>,
    pub failed_batches: usize,
    pub total_batches: usize,
}

impl PollOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed_batches == 0
    }
}

/// One monitored device bound to a pooled driver.
pub struct Equipment {
    settings: EquipmentSettings,
    fields: BTreeMap<String, FieldDescriptor>,
    batches: Vec<RegisterBatch>,
    pool: Arc<DriverPool>,
    health: SensorHealth,
    consecutive_failures: u32,
    reconnect_pending: bool,
}

impl Equipment {
    pub fn new(
        settings: EquipmentSettings,
        fields: BTreeMap<String, FieldDescriptor>,
        pool: Arc<DriverPool>,
    ) -> Result<Self, ModbusError> {
        for (id, field) in &fields {
            field
                .validate()
                .map_err(|e| ModbusError::ConfigError(format!("{}: sensor '{}': {}", settings.name, id, e)))?;
        }

        let batches = partition(&required_addresses(&fields), settings.batch_size);
        info!(
            "📋 Initialized {} at {} (unit {}, driver {}, {} sensors in {} batches)",
            settings.name,
            settings.endpoint,
            settings.unit_id,
            settings.driver,
            fields.len(),
            batches.len()
        );

        Ok(Self {
            settings,
            fields,
            batches,
            pool,
            health: SensorHealth::new(),
            consecutive_failures: 0,
            reconnect_pending: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn manufacturer(&self) -> &str {
        &self.settings.manufacturer
    }

    pub fn settings(&self) -> &EquipmentSettings {
        &self.settings
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldDescriptor> {
        &self.fields
    }

    pub fn batches(&self) -> &[RegisterBatch] {
        &self.batches
    }

    pub fn health(&self) -> &SensorHealth {
        &self.health
    }

    /// Wall-clock bound for one read, strictly above what the driver itself may wait.
    fn read_deadline(&self) -> Duration {
        let driver_wait = match self.settings.driver {
            DriverKind::JkBms => self.settings.timeout.max(jk_bms::max_read_wait()),
            _ => self.settings.timeout,
        };
        driver_wait + READ_DEADLINE_SLACK
    }

    async fn acquire_bus(&self) -> Result<BusGuard, ModbusError> {
        let settings = &self.settings;
        self.pool
            .acquire(&settings.endpoint, settings.driver, || {
                build_driver(settings.driver, settings.endpoint.clone(), &settings.serial, &settings.jk_bms)
            })
            .await
    }

    async fn ensure_connected(&mut self, bus: &mut BusGuard) -> Result<(), ModbusError> {
        if self.reconnect_pending {
            warn!("🔄 {}: resetting connection to {}", self.settings.name, self.settings.endpoint);
            bus.disconnect().await;
            self.reconnect_pending = false;
        }
        if bus.is_connected() {
            return Ok(());
        }

        let retry = &self.settings.retry;
        let mut last_error = None;
        for attempt in 0..retry.max_reconnect_attempts.max(1) {
            if attempt > 0 {
                let delay = retry.reconnect_delay(attempt - 1);
                info!(
                    "🔌 Reconnecting to {} in {:?} (attempt {}/{})",
                    self.settings.name,
                    delay,
                    attempt + 1,
                    retry.max_reconnect_attempts
                );
                sleep(delay).await;
            }

            match bus.connect(self.settings.timeout).await {
                Ok(()) => {
                    info!(
                        "✅ Connected to {} using {} driver",
                        self.settings.name,
                        bus.kind()
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!("⚠️  Connection to {} failed: {}", self.settings.endpoint, e);
                    let fatal = e.kind() == ErrorKind::Config;
                    last_error = Some(e);
                    if fatal {
                        break;
                    }
                }
            }
        }

        error!("❌ Max reconnect attempts reached for {}", self.settings.name);
        Err(last_error.unwrap_or(ModbusError::NotConnected))
    }

    /// Reads one batch with retries. Connection-class errors are not retried here.
    async fn read_batch(&self, bus: &mut BusGuard, batch: RegisterBatch) -> Result<Vec<u16>, ModbusError> {
        let retry = &self.settings.retry;
        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if !bus.is_connected() {
                bus.connect(self.settings.timeout).await?;
            }

            debug!(
                "{}: reading {} registers {} with unit id {}",
                self.settings.name, batch.count, batch, self.settings.unit_id
            );
            let error = match bus
                .read_registers(batch.start, batch.count, self.settings.unit_id, self.read_deadline())
                .await
            {
                Ok(values) if values.len() == batch.count as usize => return Ok(values),
                Ok(values) => ModbusError::InvalidResponse(format!(
                    "expected {} registers, got {}",
                    batch.count,
                    values.len()
                )),
                Err(e) => e,
            };

            attempt += 1;
            warn!(
                "⚠️  {}: error reading registers {} (attempt {}/{}): {}",
                self.settings.name, batch, attempt, max_attempts, error
            );
            if error.requires_reconnect() || attempt >= max_attempts {
                if matches!(
                    error,
                    ModbusError::Exception {
                        code: ExceptionCode::GatewayTargetNoResponse | ExceptionCode::GatewayPathUnavailable,
                        ..
                    }
                ) {
                    error!(
                        "❌ {}: gateway got no answer for {} - check unit id {} and bridge configuration",
                        self.settings.name, batch, self.settings.unit_id
                    );
                }
                return Err(error);
            }
            sleep(retry.retry_delay(attempt - 1)).await;
        }
    }

    /// One full poll: probe, take the bus, read every batch, decode.
    ///
    /// Batches that fail leave their fields unavailable while the others still
    /// decode. A connection-class failure stops the cycle; if no batch succeeds
    /// the cycle is an error.
    pub async fn read_data(&mut self) -> Result<PollOutcome, ModbusError> {
        info!(
            "📡 Reading data from {} (ID:{}) at {}",
            self.settings.name, self.settings.unit_id, self.settings.endpoint
        );

        if self.batches.is_empty() {
            warn!("⚠️  {}: no register addresses defined", self.settings.name);
            return Ok(PollOutcome::default());
        }

        if self.settings.probe_connectivity && !self.settings.endpoint.is_serial() {
            if let Err(e) = probe_tcp(&self.settings.endpoint, self.settings.timeout).await {
                error!("❌ {}: connectivity lost before read: {}", self.settings.name, e);
                self.note_failure(&e);
                return Err(e);
            }
        }

        let mut bus = self.acquire_bus().await?;
        if let Some(delay) = self.settings.secondary_delay {
            sleep(delay).await;
        }
        if let Err(e) = self.ensure_connected(&mut bus).await {
            self.note_failure(&e);
            return Err(e);
        }

        let mut registers = RegisterMap::new();
        let mut succeeded = 0;
        let mut last_error = None;
        for (index, batch) in self.batches.iter().enumerate() {
            if index > 0 {
                sleep(BATCH_PAUSE).await;
            }
            match self.read_batch(&mut bus, *batch).await {
                Ok(values) => {
                    registers.extend(batch.addresses().zip(values));
                    succeeded += 1;
                }
                Err(e) => {
                    error!(
                        "❌ {}: failed reading registers {}: {}",
                        self.settings.name, batch, e
                    );
                    let stop = e.requires_reconnect();
                    last_error = Some(e);
                    if stop {
                        break;
                    }
                }
            }
        }

        let values = decode_all(self.fields.iter(), &registers);
        drop(bus);

        for id in self.fields.keys() {
            self.health.record(id, values.contains_key(id));
        }

        let total = self.batches.len();
        match last_error {
            Some(e) if succeeded == 0 => {
                self.note_failure(&e);
                Err(e)
            }
            Some(e) => {
                self.note_failure(&e);
                Ok(PollOutcome {
                    values,
                    failed_batches: total - succeeded,
                    total_batches: total,
                })
            }
            None => {
                self.consecutive_failures = 0;
                debug!(
                    "{}: decoded {}/{} sensors",
                    self.settings.name,
                    values.len(),
                    self.fields.len()
                );
                Ok(PollOutcome {
                    values,
                    failed_batches: 0,
                    total_batches: total,
                })
            }
        }
    }

    fn note_failure(&mut self, error: &ModbusError) {
        if !matches!(error.kind(), ErrorKind::Timeout | ErrorKind::Connection) {
            return;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.settings.retry.reconnect_threshold {
            warn!(
                "⚠️  {}: {} consecutive link failures, connection will be rebuilt",
                self.settings.name, self.consecutive_failures
            );
            self.reconnect_pending = true;
            self.consecutive_failures = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{LinkState, ModbusDriver};
    use crate::registers::FieldKind;
    use async_trait::async_trait;
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedDriver {
        endpoint: TransportEndpoint,
        state: LinkState,
        registers: BTreeMap<u16, u16>,
        /// Returned, in order, before any normal read.
        queued_errors: VecDeque<ModbusError>,
        /// Batch starts that always answer with an exception.
        broken: BTreeSet<u16>,
        calls: Arc<Mutex<Vec<(u16, u16)>>>,
        connects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ModbusDriver for ScriptedDriver {
        fn kind(&self) -> DriverKind {
            DriverKind::RawTcpRtu
        }

        fn endpoint(&self) -> &TransportEndpoint {
            &self.endpoint
        }

        fn state(&self) -> LinkState {
            self.state
        }

        async fn connect(&mut self, _timeout: Duration) -> Result<(), ModbusError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.state = LinkState::Connected;
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.state = LinkState::Disconnected;
        }

        async fn read_registers(&mut self, address: u16, count: u16, _unit_id: u8) -> Result<Vec<u16>, ModbusError> {
            self.calls.lock().unwrap().push((address, count));
            let result = if let Some(error) = self.queued_errors.pop_front() {
                Err(error)
            } else if self.broken.contains(&address) {
                Err(ModbusError::Exception {
                    function: 0x03,
                    code: ExceptionCode::IllegalDataAddress,
                })
            } else {
                Ok((address..address + count)
                    .map(|a| self.registers.get(&a).copied().unwrap_or(0))
                    .collect())
            };
            self.state = LinkState::after_request(&result);
            result
        }

        fn abort(&mut self) {
            self.state = LinkState::Disconnected;
        }
    }

    struct Harness {
        calls: Arc<Mutex<Vec<(u16, u16)>>>,
        connects: Arc<AtomicUsize>,
        equipment: Equipment,
    }

    async fn harness(state: LinkState, queued_errors: Vec<ModbusError>, broken: &[u16]) -> Harness {
        let endpoint = TransportEndpoint::tcp("10.0.0.9", 8899);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(AtomicUsize::new(0));
        let driver = ScriptedDriver {
            endpoint: endpoint.clone(),
            state,
            registers: [(10, 2505), (11, 65525), (20, 0x0001), (21, 0x0002)].into_iter().collect(),
            queued_errors: queued_errors.into(),
            broken: broken.iter().copied().collect(),
            calls: Arc::clone(&calls),
            connects: Arc::clone(&connects),
        };

        let pool = Arc::new(DriverPool::new());
        pool.get_or_create(&endpoint, DriverKind::RawTcpRtu, || Ok(Box::new(driver) as Box<dyn ModbusDriver>))
            .await
            .unwrap();

        let mut fields = BTreeMap::new();
        fields.insert(
            "cell_voltage".to_string(),
            FieldDescriptor::new("Cell voltage", 10u16, FieldKind::Uint16).with_factor(0.001),
        );
        fields.insert(
            "current".to_string(),
            FieldDescriptor::new("Current", 11u16, FieldKind::Int16).with_factor(0.01),
        );
        fields.insert(
            "energy".to_string(),
            FieldDescriptor::new("Energy", vec![20u16, 21], FieldKind::Uint32),
        );

        let mut settings = EquipmentSettings::new("Inverter", DriverKind::RawTcpRtu, endpoint);
        settings.batch_size = 10;
        let equipment = Equipment::new(settings, fields, pool).unwrap();
        Harness {
            calls,
            connects,
            equipment,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_batches_and_decodes() {
        let mut h = harness(LinkState::Connected, vec![], &[]).await;
        let outcome = h.equipment.read_data().await.unwrap();

        assert!(outcome.is_complete());
        assert_eq!(outcome.total_batches, 2);
        assert_eq!(outcome.values["cell_voltage"], SensorValue::Number(2.505));
        assert_eq!(outcome.values["current"], SensorValue::Number(-0.11));
        assert_eq!(outcome.values["energy"], SensorValue::Number(65538.0));
        assert_eq!(*h.calls.lock().unwrap(), vec![(10, 2), (20, 2)]);
        assert_eq!(h.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let mut h = harness(LinkState::Connected, vec![ModbusError::Timeout], &[]).await;
        let outcome = h.equipment.read_data().await.unwrap();

        assert!(outcome.is_complete());
        assert_eq!(*h.calls.lock().unwrap(), vec![(10, 2), (10, 2), (20, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_only_drops_its_fields() {
        let mut h = harness(LinkState::Connected, vec![], &[20]).await;
        let outcome = h.equipment.read_data().await.unwrap();

        assert_eq!(outcome.failed_batches, 1);
        assert!(!outcome.values.contains_key("energy"));
        assert_eq!(outcome.values["cell_voltage"], SensorValue::Number(2.505));
        // Three attempts on the broken batch.
        assert_eq!(h.calls.lock().unwrap().iter().filter(|c| c.0 == 20).count(), 3);

        let health = h.equipment.health();
        assert_eq!(health.sensor("energy").unwrap().failed, 1);
        assert_eq!(health.sensor("current").unwrap().successful, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_batches_failing_is_an_error() {
        let mut h = harness(LinkState::Connected, vec![], &[10, 20]).await;
        let err = h.equipment.read_data().await.unwrap_err();
        assert!(matches!(err, ModbusError::Exception { code: ExceptionCode::IllegalDataAddress, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_loss_stops_cycle() {
        let mut h = harness(LinkState::Connected, vec![ModbusError::ConnectionClosed], &[]).await;
        let err = h.equipment.read_data().await.unwrap_err();
        assert!(err.requires_reconnect());
        assert_eq!(h.calls.lock().unwrap().len(), 1);

        // Next cycle reconnects lazily.
        let outcome = h.equipment.read_data().await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_driver_connects_first() {
        let mut h = harness(LinkState::Disconnected, vec![], &[]).await;
        h.equipment.read_data().await.unwrap();
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_timeouts_rebuild_connection() {
        // Two batches, three attempts each, for three cycles.
        let timeouts = (0..18).map(|_| ModbusError::Timeout).collect();
        let mut h = harness(LinkState::Connected, timeouts, &[]).await;

        for _ in 0..3 {
            assert!(h.equipment.read_data().await.is_err());
        }
        assert_eq!(h.connects.load(Ordering::SeqCst), 0);

        h.equipment.read_data().await.unwrap();
        assert_eq!(h.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_delays() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.retry_delay(0), Duration::from_secs(1));
        assert_eq!(retry.retry_delay(2), Duration::from_secs(4));
        assert_eq!(retry.reconnect_delay(3), Duration::from_secs(8));
        assert_eq!(retry.reconnect_delay(10), Duration::from_secs(30));
    }
}
