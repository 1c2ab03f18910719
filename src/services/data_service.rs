use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};

use crate::config::{Config, TemplateStore};
use crate::devices::{Equipment, PollOutcome};
use crate::drivers::DriverPool;
use crate::output::MeasurementSink;
use crate::utils::error::ModbusError;

/// How each equipment task paces itself and reacts to repeated failures.
#[derive(Debug, Clone)]
pub struct SupervisionPolicy {
    pub poll_interval: Duration,
    pub max_consecutive_errors: u32,
    pub error_cooldown: Duration,
    pub health_report: Duration,
}

impl SupervisionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_consecutive_errors: config.max_consecutive_errors.max(1),
            error_cooldown: config.error_cooldown(),
            health_report: Duration::from_secs(config.health_report_seconds.max(1)),
        }
    }
}

pub struct DataService {
    config: Config,
    equipment: Vec<Equipment>,
    pool: Arc<DriverPool>,
    sink: Arc<dyn MeasurementSink>,
}

impl DataService {
    pub fn new(
        config: Config,
        store: &TemplateStore,
        sink: Arc<dyn MeasurementSink>,
    ) -> Result<Self, ModbusError> {
        info!("🚀 Initializing Data Service");
        info!("🏭 Collector: {} [{}]", config.collector_name, config.collector_id);
        info!(
            "📡 Target equipment: {} configured, {} enabled",
            config.equipment.len(),
            config.enabled_equipment().count()
        );

        let pool = Arc::new(DriverPool::new());
        let mut equipment = Vec::new();
        for (settings, sensors) in config.resolve_equipment(store)? {
            equipment.push(Equipment::new(settings, sensors, Arc::clone(&pool))?);
        }
        for disabled in config.equipment.iter().filter(|e| !e.enabled) {
            info!("⏸️  Equipment '{}' on {} is disabled", disabled.name, disabled.path);
        }

        info!("✅ Data Service initialized with {} equipment", equipment.len());
        Ok(Self::from_parts(config, equipment, pool, sink))
    }

    /// Assembles a service from already-built equipment sharing `pool`.
    pub fn from_parts(
        config: Config,
        equipment: Vec<Equipment>,
        pool: Arc<DriverPool>,
        sink: Arc<dyn MeasurementSink>,
    ) -> Self {
        Self {
            config,
            equipment,
            pool,
            sink,
        }
    }

    pub fn equipment(&self) -> &[Equipment] {
        &self.equipment
    }

    pub fn pool(&self) -> &Arc<DriverPool> {
        &self.pool
    }

    /// Polls every equipment once, in order, and publishes what was decoded.
    ///
    /// Returns how many equipment produced values.
    pub async fn read_all_once(&mut self) -> Result<usize, ModbusError> {
        info!("📖 Reading data from all equipment once...");

        let mut produced = 0;
        for equipment in &mut self.equipment {
            match equipment.read_data().await {
                Ok(outcome) if !outcome.values.is_empty() => {
                    publish(self.sink.as_ref(), equipment, &outcome).await;
                    produced += 1;
                }
                Ok(_) => warn!("⚠️  {}: no sensor values decoded", equipment.name()),
                Err(e) => error!("❌ Failed to read data from {}: {}", equipment.name(), e),
            }
        }

        info!("📊 {}/{} equipment returned data", produced, self.equipment.len());
        Ok(produced)
    }

    /// Runs one supervised task per equipment until `shutdown` flips, then closes every driver.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ModbusError> {
        let policy = SupervisionPolicy::from_config(&self.config);
        info!(
            "🔄 Starting continuous monitoring of {} equipment every {:?}",
            self.equipment.len(),
            policy.poll_interval
        );

        let handles: Vec<JoinHandle<()>> = self
            .equipment
            .into_iter()
            .map(|equipment| {
                tokio::spawn(supervise(
                    equipment,
                    Arc::clone(&self.sink),
                    policy.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        // A dropped sender also means stop.
        let _ = shutdown.wait_for(|stop| *stop).await;
        info!("🛑 Shutdown requested, stopping equipment tasks...");

        for handle in handles {
            if let Err(e) = handle.await {
                error!("❌ Equipment task ended abnormally: {}", e);
            }
        }

        self.pool.close_all().await;
        info!("👋 Data Service stopped");
        Ok(())
    }
}

async fn publish(sink: &dyn MeasurementSink, equipment: &Equipment, outcome: &PollOutcome) {
    if let Err(e) = sink
        .publish(equipment.name(), equipment.manufacturer(), &outcome.values)
        .await
    {
        error!("❌ Failed to publish {} readings: {}", equipment.name(), e);
    }
}

fn report_health(equipment: &Equipment) {
    let summary = equipment.health().summary();
    info!(
        "🩺 {}: {:.2}% success over {} reads ({} healthy, {} degraded, {} unhealthy)",
        equipment.name(),
        summary.success_rate,
        summary.total_reads,
        summary.healthy,
        summary.degraded,
        summary.unhealthy
    );
    for (sensor, stats) in equipment.health().problem_sensors().into_iter().take(5) {
        warn!(
            "⚠️  {}.{}: {:.1}% success ({} failed)",
            equipment.name(),
            sensor,
            stats.success_rate(),
            stats.failed
        );
    }
}

/// Poll loop for one equipment.
///
/// A cycle that returns an error or leaves batches unread counts toward
/// `max_consecutive_errors`; reaching it marks the equipment offline and
/// pauses polling for the cooldown.
async fn supervise(
    mut equipment: Equipment,
    sink: Arc<dyn MeasurementSink>,
    policy: SupervisionPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(policy.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_errors = 0u32;
    let mut last_report = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        // Dropping the read on shutdown aborts any half-finished request on the bus.
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = equipment.read_data() => result,
        };

        match result {
            Ok(outcome) => {
                if !outcome.values.is_empty() {
                    publish(sink.as_ref(), &equipment, &outcome).await;
                }
                if outcome.is_complete() {
                    if consecutive_errors > 0 {
                        info!("✅ {} recovered after {} failed cycles", equipment.name(), consecutive_errors);
                    }
                    consecutive_errors = 0;
                } else {
                    consecutive_errors += 1;
                    warn!(
                        "⚠️  {}: {}/{} batches failed ({} consecutive incomplete cycles)",
                        equipment.name(),
                        outcome.failed_batches,
                        outcome.total_batches,
                        consecutive_errors
                    );
                }
            }
            Err(e) => {
                consecutive_errors += 1;
                error!(
                    "❌ Failed to read data from {}: {} ({} consecutive errors)",
                    equipment.name(),
                    e,
                    consecutive_errors
                );
            }
        }

        if consecutive_errors >= policy.max_consecutive_errors {
            error!(
                "🚫 {} marked offline after {} consecutive errors, cooling down for {:?}",
                equipment.name(),
                consecutive_errors,
                policy.error_cooldown
            );
            if let Err(e) = sink.publish_offline(equipment.name(), equipment.manufacturer()).await {
                error!("❌ Failed to publish offline status for {}: {}", equipment.name(), e);
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(policy.error_cooldown) => {}
            }
            consecutive_errors = 0;
            ticker.reset();
        }

        if last_report.elapsed() >= policy.health_report {
            report_health(&equipment);
            last_report = Instant::now();
        }
    }

    debug!("{} task stopped", equipment.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::EquipmentSettings;
    use crate::drivers::{DriverKind, LinkState, ModbusDriver, TransportEndpoint};
    use crate::registers::{FieldDescriptor, FieldKind, SensorValue};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FixedDriver {
        endpoint: TransportEndpoint,
        state: LinkState,
        failing: bool,
        disconnected: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ModbusDriver for FixedDriver {
        fn kind(&self) -> DriverKind {
            DriverKind::ModbusTcp
        }

        fn endpoint(&self) -> &TransportEndpoint {
            &self.endpoint
        }

        fn state(&self) -> LinkState {
            self.state
        }

        async fn connect(&mut self, _timeout: Duration) -> Result<(), ModbusError> {
            self.state = LinkState::Connected;
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.disconnected.store(true, Ordering::SeqCst);
            self.state = LinkState::Disconnected;
        }

        async fn read_registers(&mut self, address: u16, count: u16, _unit_id: u8) -> Result<Vec<u16>, ModbusError> {
            if self.failing {
                return Err(ModbusError::InvalidData("garbled".into()));
            }
            Ok((address..address + count).map(|a| a * 10).collect())
        }

        fn abort(&mut self) {
            self.state = LinkState::Disconnected;
        }
    }

    #[derive(Default)]
    struct CaptureSink {
        readings: Mutex<Vec<BTreeMap<String, SensorValue>>>,
        offline: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MeasurementSink for CaptureSink {
        async fn publish(
            &self,
            _equipment: &str,
            _manufacturer: &str,
            values: &BTreeMap<String, SensorValue>,
        ) -> Result<(), ModbusError> {
            self.readings.lock().unwrap().push(values.clone());
            Ok(())
        }

        async fn publish_offline(&self, equipment: &str, _manufacturer: &str) -> Result<(), ModbusError> {
            self.offline.lock().unwrap().push(equipment.to_string());
            Ok(())
        }
    }

    async fn service(failing: bool) -> (DataService, Arc<CaptureSink>, Arc<AtomicBool>) {
        let endpoint = TransportEndpoint::tcp("10.0.0.20", 502);
        let disconnected = Arc::new(AtomicBool::new(false));
        let driver = FixedDriver {
            endpoint: endpoint.clone(),
            state: LinkState::Connected,
            failing,
            disconnected: Arc::clone(&disconnected),
        };
        let pool = Arc::new(DriverPool::new());
        pool.get_or_create(&endpoint, DriverKind::ModbusTcp, || Ok(Box::new(driver) as Box<dyn ModbusDriver>))
            .await
            .unwrap();

        let mut fields = BTreeMap::new();
        fields.insert(
            "grid_power".to_string(),
            FieldDescriptor::new("Grid power", 7u16, FieldKind::Uint16),
        );
        let settings = EquipmentSettings::new("Meter", DriverKind::ModbusTcp, endpoint);
        let equipment = Equipment::new(settings, fields, Arc::clone(&pool)).unwrap();

        let config = Config {
            poll_interval_seconds: 10,
            max_consecutive_errors: 2,
            error_cooldown_seconds: 60,
            ..Config::default()
        };
        let sink = Arc::new(CaptureSink::default());
        let service = DataService::from_parts(config, vec![equipment], pool, sink.clone());
        (service, sink, disconnected)
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_all_once_publishes() {
        let (mut service, sink, _) = service(false).await;
        assert_eq!(service.read_all_once().await.unwrap(), 1);

        let readings = sink.readings.lock().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0]["grid_power"], SensorValue::Number(70.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_errors_publish_offline_and_shutdown_closes_pool() {
        let (service, sink, disconnected) = service(true).await;
        let pool = Arc::clone(service.pool());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(service.run(rx));

        // Two failing cycles at t=0 and t=10 plus retry backoff, well inside the cooldown.
        sleep(Duration::from_secs(30)).await;
        assert_eq!(*sink.offline.lock().unwrap(), vec!["Meter".to_string()]);
        assert!(sink.readings.lock().unwrap().is_empty());

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(disconnected.load(Ordering::SeqCst));
        assert!(pool.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_every_interval() {
        let (service, sink, _) = service(false).await;
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(service.run(rx));

        sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        // Ticks at 0, 10 and 20 seconds.
        assert_eq!(sink.readings.lock().unwrap().len(), 3);
        assert!(sink.offline.lock().unwrap().is_empty());
    }
}
