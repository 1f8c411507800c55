//! GATT central backed by btleplug (BlueZ, CoreBluetooth, WinRT)
//!
//! btleplug does not expose the negotiated ATT MTU, so the per-write payload
//! is configured on the central and defaults to the 20 bytes every link
//! supports. Peer disconnects are picked up both from the end of the
//! notification stream and from a connection watchdog.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::gatt::DEFAULT_WRITE_PAYLOAD;
use super::link::{
    BleAddress, DeviceIdentifier, DisconnectHandler, DiscoveredDevice, GattCentral, GattLink,
    NotificationHandler,
};
use super::BleError;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn gatt_error(context: &str, err: btleplug::Error) -> BleError {
    match err {
        btleplug::Error::NotConnected => BleError::Disconnected,
        other => BleError::GattError(format!("{}: {}", context, other)),
    }
}

/// CoreBluetooth identifies peripherals by UUID; the other platforms by MAC.
fn address_of(peripheral: &Peripheral) -> BleAddress {
    match Uuid::parse_str(&peripheral.id().to_string()) {
        Ok(id) => BleAddress::Uuid(id),
        Err(_) => BleAddress::Mac(peripheral.address().into_inner()),
    }
}

async fn discovered(peripheral: &Peripheral) -> Option<DiscoveredDevice> {
    let props = peripheral.properties().await.ok().flatten()?;
    let mut services = props.services.clone();
    for uuid in props.service_data.keys() {
        if !services.contains(uuid) {
            services.push(*uuid);
        }
    }
    Some(DiscoveredDevice {
        address: address_of(peripheral),
        name: props.local_name,
        rssi: props.rssi,
        services,
    })
}

/// BLE central on the first adapter of the host.
pub struct BtleplugCentral {
    adapter: Adapter,
    mtu: usize,
}

impl BtleplugCentral {
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::ConnectionError(format!("BLE manager init failed: {}", e)))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::ConnectionError(format!("Failed to list BLE adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| BleError::ConnectionError("No BLE adapter found".into()))?;
        Ok(Self {
            adapter,
            mtu: DEFAULT_WRITE_PAYLOAD,
        })
    }

    /// Use a larger write payload on links known to negotiate one.
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    // Unfiltered: CoreBluetooth doesn't reliably match 128-bit UUIDs in
    // scan response data, so filtering happens on the properties instead.
    async fn start_scan(&self) -> Result<(), BleError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::ScanError(format!("Failed to start BLE scan: {}", e)))
    }

    async fn stop_scan(&self) {
        if let Err(e) = self.adapter.stop_scan().await {
            log::warn!("Failed to stop BLE scan: {}", e);
        }
    }

    async fn snapshot(&self) -> Result<Vec<(Peripheral, DiscoveredDevice)>, BleError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| BleError::ScanError(format!("Failed to list peripherals: {}", e)))?;
        let mut found = Vec::with_capacity(peripherals.len());
        for peripheral in peripherals {
            if let Some(device) = discovered(&peripheral).await {
                found.push((peripheral, device));
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl GattCentral for BtleplugCentral {
    async fn scan(
        &self,
        service: Uuid,
        timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, BleError> {
        self.start_scan().await?;
        tokio::time::sleep(timeout).await;
        self.stop_scan().await;

        Ok(self
            .snapshot()
            .await?
            .into_iter()
            .map(|(_, device)| device)
            .filter(|device| device.services.contains(&service))
            .collect())
    }

    async fn find_device(
        &self,
        identifier: &DeviceIdentifier,
        timeout: Duration,
    ) -> Result<Option<DiscoveredDevice>, BleError> {
        self.start_scan().await?;
        let deadline = tokio::time::Instant::now() + timeout;
        let result = loop {
            let found = match self.snapshot().await {
                Ok(found) => found,
                Err(e) => break Err(e),
            };
            if let Some((_, device)) = found.into_iter().find(|(_, d)| identifier.matches(d)) {
                log::debug!("Matched {} as {}", identifier, device.address);
                break Ok(Some(device));
            }
            if tokio::time::Instant::now() >= deadline {
                break Ok(None);
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        };
        self.stop_scan().await;
        result
    }

    async fn connect(&self, device: &DiscoveredDevice) -> Result<Arc<dyn GattLink>, BleError> {
        let peripheral = self
            .snapshot()
            .await?
            .into_iter()
            .map(|(peripheral, _)| peripheral)
            .find(|p| address_of(p) == device.address)
            .ok_or_else(|| {
                BleError::ConnectionError(format!("{} is no longer visible", device.address))
            })?;

        tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| BleError::Timeout)?
            .map_err(|e| BleError::ConnectionError(format!("BLE connect failed: {}", e)))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| gatt_error("Service discovery failed", e))?;

        let link = BtleplugLink::new(peripheral, self.mtu);
        link.spawn_watchdog();
        Ok(link)
    }
}

/// A live GATT connection through btleplug.
pub struct BtleplugLink {
    me: Weak<BtleplugLink>,
    peripheral: Peripheral,
    characteristics: Vec<Characteristic>,
    mtu: usize,
    connected: AtomicBool,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    fn new(peripheral: Peripheral, mtu: usize) -> Arc<Self> {
        let characteristics = peripheral.characteristics().into_iter().collect();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            peripheral,
            characteristics,
            mtu,
            connected: AtomicBool::new(true),
            disconnect_handlers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, BleError> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or(BleError::CharacteristicNotFound(uuid))
    }

    /// Fire the disconnect handlers, once.
    fn mark_disconnected(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let handlers = std::mem::take(&mut *lock(&self.disconnect_handlers));
        for handler in handlers {
            handler();
        }
    }

    fn spawn_watchdog(&self) {
        let link = self.me.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCHDOG_INTERVAL).await;
                let Some(link) = link.upgrade() else { break };
                if !link.connected.load(Ordering::SeqCst) {
                    break;
                }
                if !link.peripheral.is_connected().await.unwrap_or(false) {
                    log::info!("Watchdog: peripheral {} disconnected", address_of(&link.peripheral));
                    link.mark_disconnected();
                    break;
                }
            }
        });
        lock(&self.tasks).push(task);
    }

    fn ensure_connected(&self) -> Result<(), BleError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BleError::Disconnected)
        }
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.characteristics
            .iter()
            .any(|c| c.uuid == characteristic && c.service_uuid == service)
    }

    async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError> {
        self.ensure_connected()?;
        let target = self.characteristic(characteristic)?;
        if data.len() > self.mtu {
            return Err(BleError::MtuExceeded {
                size: data.len(),
                mtu: self.mtu,
            });
        }
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(target, data, write_type)
            .await
            .map_err(|e| gatt_error("Write failed", e))
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), BleError> {
        self.ensure_connected()?;
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .subscribe(target)
            .await
            .map_err(|e| gatt_error("Subscribe failed", e))?;
        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| gatt_error("Notification stream unavailable", e))?;

        let link = self.me.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                handler(notification.uuid, &notification.value);
            }
            log::debug!("Notification stream ended");
            if let Some(link) = link.upgrade() {
                link.mark_disconnected();
            }
        });
        lock(&self.tasks).push(task);
        Ok(())
    }

    fn on_disconnected(&self, handler: DisconnectHandler) {
        if self.is_connected() {
            lock(&self.disconnect_handlers).push(handler);
        }
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        let result = self
            .peripheral
            .disconnect()
            .await
            .map_err(|e| gatt_error("Disconnect failed", e));
        self.mark_disconnected();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        match result {
            Err(BleError::Disconnected) => Ok(()),
            other => other,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
