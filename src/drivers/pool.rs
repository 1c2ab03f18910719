use log::{debug, info, warn};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

use super::traits::{DriverKind, ModbusDriver, TransportEndpoint};
use crate::utils::error::ModbusError;

pub type SharedDriver = Arc<Mutex<Box<dyn ModbusDriver>>>;

/// One driver per endpoint, shared by every equipment wired to it.
///
/// Created once at startup and handed to each equipment; `close_all` at
/// shutdown disconnects and evicts everything.
#[derive(Default)]
pub struct DriverPool {
    drivers: Mutex<HashMap<TransportEndpoint, (DriverKind, SharedDriver)>>,
}

impl DriverPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pooled driver for `endpoint`, building it with `factory` on first use.
    ///
    /// Creation happens under the pool lock, so concurrent first callers all get the same instance.
    /// An endpoint already served by a different kind of driver is refused.
    pub async fn get_or_create<F>(
        &self,
        endpoint: &TransportEndpoint,
        kind: DriverKind,
        factory: F,
    ) -> Result<SharedDriver, ModbusError>
    where
        F: FnOnce() -> Result<Box<dyn ModbusDriver>, ModbusError>,
    {
        let mut drivers = self.drivers.lock().await;
        if let Some((existing_kind, existing)) = drivers.get(endpoint) {
            if *existing_kind != kind {
                return Err(ModbusError::ConfigError(format!(
                    "{} already uses a {} driver, cannot share it as {}",
                    endpoint, existing_kind, kind
                )));
            }
            debug!("♻️  Reusing shared driver for {}", endpoint);
            return Ok(Arc::clone(existing));
        }

        let driver = factory()?;
        info!("🆕 Created {} driver for {}", driver.kind(), endpoint);
        let shared = Arc::new(Mutex::new(driver));
        drivers.insert(endpoint.clone(), (kind, Arc::clone(&shared)));
        Ok(shared)
    }

    /// Takes the bus for `endpoint`; the guard serializes every request on that link.
    pub async fn acquire<F>(
        &self,
        endpoint: &TransportEndpoint,
        kind: DriverKind,
        factory: F,
    ) -> Result<BusGuard, ModbusError>
    where
        F: FnOnce() -> Result<Box<dyn ModbusDriver>, ModbusError>,
    {
        let shared = self.get_or_create(endpoint, kind, factory).await?;
        Ok(BusGuard::new(shared.lock_owned().await))
    }

    pub async fn len(&self) -> usize {
        self.drivers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn close_all(&self) {
        let drained: Vec<(TransportEndpoint, (DriverKind, SharedDriver))> =
            self.drivers.lock().await.drain().collect();

        for (endpoint, (_, shared)) in drained {
            let mut driver = shared.lock().await;
            driver.disconnect().await;
            debug!("closed pooled driver for {}", endpoint);
        }
        info!("🔌 All pooled connections closed");
    }
}

/// Exclusive access to one pooled driver for a whole poll cycle.
///
/// If the guard is dropped while a read is in flight (task cancelled), the
/// driver's connection is aborted so a half-read frame never reaches the next cycle.
pub struct BusGuard {
    driver: OwnedMutexGuard<Box<dyn ModbusDriver>>,
    in_flight: bool,
}

impl BusGuard {
    fn new(driver: OwnedMutexGuard<Box<dyn ModbusDriver>>) -> Self {
        Self {
            driver,
            in_flight: false,
        }
    }

    /// Reads registers under a wall-clock `deadline`.
    ///
    /// Hitting the deadline aborts the connection: the driver's own timeout
    /// should have fired first, so the link state is unknown.
    pub async fn read_registers(
        &mut self,
        address: u16,
        count: u16,
        unit_id: u8,
        deadline: Duration,
    ) -> Result<Vec<u16>, ModbusError> {
        self.in_flight = true;
        let result = timeout(deadline, self.driver.read_registers(address, count, unit_id)).await;
        self.in_flight = false;

        match result {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "⏰ Read of {} registers at {} on {} exceeded {:?}; aborting connection",
                    count,
                    address,
                    self.driver.endpoint(),
                    deadline
                );
                self.driver.abort();
                Err(ModbusError::Timeout)
            }
        }
    }
}

impl Deref for BusGuard {
    type Target = dyn ModbusDriver;

    fn deref(&self) -> &Self::Target {
        self.driver.as_ref()
    }
}

impl DerefMut for BusGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.driver.as_mut()
    }
}

impl Drop for BusGuard {
    fn drop(&mut self) {
        if self.in_flight {
            warn!(
                "✂️  Poll cancelled mid-read on {}; closing connection",
                self.driver.endpoint()
            );
            self.driver.abort();
        }
    }
}
