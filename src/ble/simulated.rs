//! In-process GATT simulator
//!
//! Provides a simulated BLE network where peripherals expose GATT services
//! and a central can scan for them, connect, write, and subscribe to
//! notifications entirely in-process. Each peripheral is driven from a
//! [`SimPeripheral`] handle: it observes every write, pushes notifications
//! in whatever chunking a test wants, renegotiates the MTU, and can drop the
//! connection from the peer side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::gatt::{ATT_WRITE_OVERHEAD, SMP_CHARACTERISTIC_UUID, SMP_SERVICE_UUID};
use super::link::{
    BleAddress, DeviceIdentifier, DisconnectHandler, DiscoveredDevice, GattCentral, GattLink,
    NotificationHandler,
};
use super::BleError;
use crate::header::HeaderCodec;

type SharedNotificationHandler = Arc<dyn Fn(Uuid, &[u8]) + Send + Sync>;
type SharedDisconnectHandler = Arc<dyn Fn() + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The simulated "air" shared by a central and its peripherals.
pub struct SimGattNetwork {
    peripherals: Mutex<HashMap<BleAddress, Arc<PeripheralState>>>,
}

impl SimGattNetwork {
    /// Create a new simulated network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peripherals: Mutex::new(HashMap::new()),
        })
    }

    /// Add a peripheral exposing the SMP service and characteristic.
    pub fn add_smp_server(self: &Arc<Self>, name: &str) -> SimPeripheral {
        self.add_peripheral(
            name,
            vec![(SMP_SERVICE_UUID, vec![SMP_CHARACTERISTIC_UUID])],
        )
    }

    /// Add a peripheral with an arbitrary GATT table of
    /// `(service, characteristics)` pairs.
    pub fn add_peripheral(
        self: &Arc<Self>,
        name: &str,
        services: Vec<(Uuid, Vec<Uuid>)>,
    ) -> SimPeripheral {
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let state = Arc::new(PeripheralState {
            address: BleAddress::Uuid(Uuid::new_v4()),
            name: name.to_string(),
            services,
            mtu: AtomicUsize::new(247 - ATT_WRITE_OVERHEAD),
            latency: Mutex::new(Duration::ZERO),
            link: Mutex::new(LinkState::default()),
            writes_tx,
        });
        lock(&self.peripherals).insert(state.address.clone(), Arc::clone(&state));
        SimPeripheral { state, writes_rx }
    }

    /// A central that sees every peripheral on this network.
    pub fn central(self: &Arc<Self>) -> SimGattCentral {
        SimGattCentral {
            network: Arc::clone(self),
        }
    }

    fn devices(&self) -> Vec<DiscoveredDevice> {
        lock(&self.peripherals)
            .values()
            .map(|p| p.discovered())
            .collect()
    }
}

/// One write observed by a simulated peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimWrite {
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub with_response: bool,
}

#[derive(Default)]
struct LinkState {
    connected: bool,
    /// Bumped on every connect so links from earlier connections go stale.
    generation: u64,
    subscriptions: HashMap<Uuid, SharedNotificationHandler>,
    disconnect_handlers: Vec<SharedDisconnectHandler>,
}

struct PeripheralState {
    address: BleAddress,
    name: String,
    services: Vec<(Uuid, Vec<Uuid>)>,
    mtu: AtomicUsize,
    latency: Mutex<Duration>,
    link: Mutex<LinkState>,
    writes_tx: mpsc::UnboundedSender<SimWrite>,
}

impl PeripheralState {
    fn discovered(&self) -> DiscoveredDevice {
        DiscoveredDevice {
            address: self.address.clone(),
            name: Some(self.name.clone()),
            rssi: Some(-50),
            services: self.services.iter().map(|(s, _)| *s).collect(),
        }
    }

    fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.services
            .iter()
            .any(|(_, chars)| chars.contains(&characteristic))
    }

    /// Drop the connection if `generation` is still current and fire the
    /// disconnect callbacks outside the lock.
    fn drop_link(&self, generation: Option<u64>) {
        let handlers = {
            let mut link = lock(&self.link);
            if !link.connected || generation.is_some_and(|g| g != link.generation) {
                return;
            }
            link.connected = false;
            link.subscriptions.clear();
            std::mem::take(&mut link.disconnect_handlers)
        };
        for handler in handlers {
            handler();
        }
    }
}

/// Test-side handle to a simulated peripheral.
pub struct SimPeripheral {
    state: Arc<PeripheralState>,
    writes_rx: mpsc::UnboundedReceiver<SimWrite>,
}

impl SimPeripheral {
    /// Get this peripheral's address.
    pub fn address(&self) -> &BleAddress {
        &self.state.address
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Change the per-write payload budget, as an MTU exchange would.
    pub fn set_mtu(&self, mtu: usize) {
        self.state.mtu.store(mtu, Ordering::SeqCst);
    }

    /// Set the simulated link-layer latency applied to each write.
    /// Uses tokio virtual time; paused clocks advance instantly in tests.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.state.latency) = latency;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state.link).connected
    }

    /// Whether a central has enabled notifications on `characteristic`.
    pub fn is_subscribed(&self, characteristic: Uuid) -> bool {
        lock(&self.state.link)
            .subscriptions
            .contains_key(&characteristic)
    }

    /// Wait for the next write from the central.
    pub async fn next_write(&mut self) -> Option<SimWrite> {
        self.writes_rx.recv().await
    }

    /// Take the next write if one is already queued.
    pub fn try_next_write(&mut self) -> Option<SimWrite> {
        self.writes_rx.try_recv().ok()
    }

    /// Collect writes until they form one whole message as framed by `codec`.
    ///
    /// Returns `None` if the central goes away mid-message or writes more
    /// bytes than the header declared.
    pub async fn read_message(&mut self, codec: &dyn HeaderCodec) -> Option<Vec<u8>> {
        let mut message = Vec::new();
        loop {
            let write = self.next_write().await?;
            message.extend_from_slice(&write.data);
            if message.len() < codec.header_size() {
                continue;
            }
            let expected = codec.total_length(&message[..codec.header_size()]).ok()?;
            if message.len() == expected {
                return Some(message);
            }
            if message.len() > expected {
                return None;
            }
        }
    }

    /// Push one notification on `characteristic`.
    pub fn notify(&self, characteristic: Uuid, data: &[u8]) -> Result<(), BleError> {
        self.deliver(characteristic, characteristic, data)
    }

    /// Push `data` as a run of notifications of at most `chunk_size` bytes.
    pub fn notify_chunked(
        &self,
        characteristic: Uuid,
        data: &[u8],
        chunk_size: usize,
    ) -> Result<(), BleError> {
        for chunk in data.chunks(chunk_size.max(1)) {
            self.notify(characteristic, chunk)?;
        }
        Ok(())
    }

    /// Invoke the handler subscribed on `via`, reporting `source` as the
    /// originating characteristic. Models a misrouted notification.
    pub fn deliver(&self, via: Uuid, source: Uuid, data: &[u8]) -> Result<(), BleError> {
        let handler = {
            let link = lock(&self.state.link);
            if !link.connected {
                return Err(BleError::Disconnected);
            }
            link.subscriptions
                .get(&via)
                .cloned()
                .ok_or_else(|| BleError::GattError(format!("No subscriber on {}", via)))?
        };
        handler(source, data);
        Ok(())
    }

    /// Drop the connection from the peripheral side (power loss, out of range).
    pub fn drop_connection(&self) {
        self.state.drop_link(None);
    }
}

/// A simulated GATT connection to one peripheral.
pub struct SimGattLink {
    peripheral: Arc<PeripheralState>,
    generation: u64,
}

impl SimGattLink {
    fn ensure_connected(&self) -> Result<(), BleError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BleError::Disconnected)
        }
    }
}

#[async_trait]
impl GattLink for SimGattLink {
    fn mtu(&self) -> usize {
        self.peripheral.mtu.load(Ordering::SeqCst)
    }

    fn has_characteristic(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.peripheral
            .services
            .iter()
            .any(|(s, chars)| *s == service && chars.contains(&characteristic))
    }

    async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError> {
        self.ensure_connected()?;
        if !self.peripheral.has_characteristic(characteristic) {
            return Err(BleError::CharacteristicNotFound(characteristic));
        }
        let mtu = self.mtu();
        if data.len() > mtu {
            return Err(BleError::MtuExceeded {
                size: data.len(),
                mtu,
            });
        }
        // Simulate BLE link-layer latency.
        let latency = *lock(&self.peripheral.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
            self.ensure_connected()?;
        }
        self.peripheral
            .writes_tx
            .send(SimWrite {
                characteristic,
                data: data.to_vec(),
                with_response,
            })
            .map_err(|_| BleError::Disconnected)
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), BleError> {
        self.ensure_connected()?;
        if !self.peripheral.has_characteristic(characteristic) {
            return Err(BleError::CharacteristicNotFound(characteristic));
        }
        lock(&self.peripheral.link)
            .subscriptions
            .insert(characteristic, Arc::from(handler));
        Ok(())
    }

    fn on_disconnected(&self, handler: DisconnectHandler) {
        let mut link = lock(&self.peripheral.link);
        if link.connected && link.generation == self.generation {
            link.disconnect_handlers.push(Arc::from(handler));
        }
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.peripheral.drop_link(Some(self.generation));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        let link = lock(&self.peripheral.link);
        link.connected && link.generation == self.generation
    }
}

/// Central role on a [`SimGattNetwork`].
pub struct SimGattCentral {
    network: Arc<SimGattNetwork>,
}

#[async_trait]
impl GattCentral for SimGattCentral {
    async fn scan(
        &self,
        service: Uuid,
        _timeout: Duration,
    ) -> Result<Vec<DiscoveredDevice>, BleError> {
        Ok(self
            .network
            .devices()
            .into_iter()
            .filter(|d| d.services.contains(&service))
            .collect())
    }

    async fn find_device(
        &self,
        identifier: &DeviceIdentifier,
        _timeout: Duration,
    ) -> Result<Option<DiscoveredDevice>, BleError> {
        Ok(self
            .network
            .devices()
            .into_iter()
            .find(|d| identifier.matches(d)))
    }

    async fn connect(&self, device: &DiscoveredDevice) -> Result<Arc<dyn GattLink>, BleError> {
        let peripheral = lock(&self.network.peripherals)
            .get(&device.address)
            .cloned()
            .ok_or_else(|| {
                BleError::ConnectionError(format!("No peripheral at {}", device.address))
            })?;

        let generation = {
            let mut link = lock(&peripheral.link);
            link.generation += 1;
            link.connected = true;
            link.subscriptions.clear();
            link.disconnect_handlers.clear();
            link.generation
        };

        Ok(Arc::new(SimGattLink {
            peripheral,
            generation,
        }))
    }
}
