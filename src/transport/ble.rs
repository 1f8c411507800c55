//! BLE SMP transport
//!
//! Ties the fragment sender and the frame assembler to a GATT link and owns
//! the connection lifecycle: resolve the device, connect, check that it is an
//! SMP server, settle the MTU, and subscribe to notifications. Peer
//! disconnects reported by the link are forwarded to the assembler so a
//! pending receive fails instead of hanging.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{ConnectionState, FragmentSender, FrameAssembler, SmpTransport, TransportError};
use crate::ble::link::{DeviceIdentifier, DiscoveredDevice, GattCentral, GattLink};
use crate::config::TransportConfig;
use crate::header::HeaderCodec;

/// An [`SmpTransport`] carried over a single GATT characteristic.
pub struct SmpBleTransport {
    central: Arc<dyn GattCentral>,
    config: TransportConfig,
    assembler: Arc<FrameAssembler>,
    sender: FragmentSender,
    link: Mutex<Option<Arc<dyn GattLink>>>,
    /// SMP server transport buffer size in bytes, 0 until known.
    server_buffer_size: AtomicUsize,
}

impl SmpBleTransport {
    pub fn new(central: Arc<dyn GattCentral>) -> Self {
        Self::with_config(central, TransportConfig::default())
    }

    pub fn with_config(central: Arc<dyn GattCentral>, config: TransportConfig) -> Self {
        log::debug!("Initialized SmpBleTransport");
        Self {
            central,
            assembler: Arc::new(FrameAssembler::new(config.characteristic_uuid)),
            sender: FragmentSender::new(config.characteristic_uuid),
            config,
            link: Mutex::new(None),
            server_buffer_size: AtomicUsize::new(0),
        }
    }

    /// Frame responses with a header other than the SMP one.
    pub fn with_header_codec(mut self, codec: Arc<dyn HeaderCodec>) -> Self {
        self.assembler = Arc::new(FrameAssembler::with_codec(
            self.config.characteristic_uuid,
            codec,
        ));
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.assembler.state()
    }

    /// List the devices advertising the SMP service.
    pub async fn scan(&self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let timeout = self.config.scan_timeout();
        log::debug!("Scanning for SMP servers for {:?}", timeout);
        let devices: Vec<DiscoveredDevice> = self
            .central
            .scan(self.config.service_uuid, timeout)
            .await?
            .into_iter()
            .filter(|d| d.services.contains(&self.config.service_uuid))
            .collect();
        log::debug!("Found {} SMP devices", devices.len());
        Ok(devices)
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Arc<dyn GattLink>>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_link(&self) -> Result<Arc<dyn GattLink>, TransportError> {
        if !self.assembler.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.lock_link().clone().ok_or(TransportError::NotConnected)
    }

    /// Some platforms report the pre-exchange MTU right after connecting and
    /// only update it a little later.
    async fn settle_mtu(&self, link: &dyn GattLink) {
        let mtu = link.mtu();
        log::info!("SMP characteristic mtu={}", mtu);

        let delay = self.config.mtu_settle_delay();
        if mtu <= self.config.suspect_mtu && !delay.is_zero() {
            log::warn!(
                "The SMP characteristic MTU is {} bytes, possibly not negotiated yet, checking again in {:?}",
                mtu,
                delay
            );
            tokio::time::sleep(delay).await;
            log::warn!("SMP characteristic mtu={}", link.mtu());
        }
    }

    /// Tear down a link that never made it into service.
    async fn abandon(&self, link: &dyn GattLink) {
        if let Err(e) = link.disconnect().await {
            log::warn!("Failed to disconnect: {}", e);
        }
    }
}

#[async_trait]
impl SmpTransport for SmpBleTransport {
    async fn connect(&self, identifier: &str) -> Result<(), TransportError> {
        let previous = self.lock_link().take();
        if let Some(previous) = previous {
            log::debug!("Dropping the existing connection before connecting");
            self.assembler.disconnected();
            self.abandon(previous.as_ref()).await;
        }

        let target = DeviceIdentifier::parse(identifier);
        log::debug!("Scanning for {}", target);
        let device = self
            .central
            .find_device(&target, self.config.scan_timeout())
            .await?
            .ok_or_else(|| TransportError::DeviceNotFound(identifier.to_string()))?;

        log::debug!("Found device: {:?}, connecting...", device);
        let link = self.central.connect(&device).await?;
        log::debug!("Connected to {}", device.address);

        let characteristic = self.config.characteristic_uuid;
        if !link.has_characteristic(self.config.service_uuid, characteristic) {
            log::debug!("Missing the SMP characteristic {}", characteristic);
            self.abandon(link.as_ref()).await;
            return Err(TransportError::NotAnSmpServer(characteristic));
        }
        log::debug!("Found SMP characteristic {}", characteristic);

        self.settle_mtu(link.as_ref()).await;

        let session = self.assembler.connected();
        let assembler = Arc::clone(&self.assembler);
        link.on_disconnected(Box::new(move || assembler.peer_disconnected(session)));
        if !link.is_connected() {
            // Lost before the callback was in place.
            self.assembler.peer_disconnected(session);
            return Err(TransportError::NotConnected);
        }

        log::debug!("Starting notify on {}", characteristic);
        let assembler = Arc::clone(&self.assembler);
        let subscribed = link
            .subscribe(
                characteristic,
                Box::new(move |source, data| assembler.on_notification(session, source, data)),
            )
            .await;
        if let Err(e) = subscribed {
            self.assembler.disconnected();
            self.abandon(link.as_ref()).await;
            return Err(e.into());
        }
        log::debug!("Started notify on {}", characteristic);

        *self.lock_link() = Some(link);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.assembler.disconnected();
        let link = self.lock_link().take();
        match link {
            Some(link) => {
                log::debug!("Disconnecting");
                link.disconnect().await?;
                log::debug!("Disconnected");
            }
            None => log::debug!("Disconnect requested while not connected"),
        }
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let link = self.current_link()?;
        self.sender.send(link.as_ref(), &self.assembler, data).await
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        self.assembler.receive().await
    }

    fn mtu(&self) -> Result<usize, TransportError> {
        Ok(self.current_link()?.mtu())
    }

    fn initialize(&self, server_buffer_size: usize) {
        log::debug!("SMP server buffer size is {} bytes", server_buffer_size);
        self.server_buffer_size
            .store(server_buffer_size, Ordering::SeqCst);
    }

    fn max_unencoded_size(&self) -> Result<usize, TransportError> {
        match self.server_buffer_size.load(Ordering::SeqCst) {
            0 => self.mtu(),
            size => Ok(size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::SMP_CHARACTERISTIC_UUID;
    use crate::ble::simulated::SimGattNetwork;
    use std::time::Duration;
    use uuid::Uuid;

    const HR_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
    const HR_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

    fn transport(network: &Arc<SimGattNetwork>) -> SmpBleTransport {
        SmpBleTransport::new(Arc::new(network.central()))
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let network = SimGattNetwork::new();
        let transport = transport(&network);

        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(matches!(transport.send(b"x").await, Err(TransportError::NotConnected)));
        assert!(matches!(transport.receive().await, Err(TransportError::NotConnected)));
        assert!(matches!(transport.mtu(), Err(TransportError::NotConnected)));
        // Disconnecting twice is harmless.
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_by_name_and_address() {
        let network = SimGattNetwork::new();
        let smp = network.add_smp_server("zephyr");
        let transport = transport(&network);

        transport.connect("zephyr").await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);
        assert!(smp.is_connected());
        assert!(smp.is_subscribed(SMP_CHARACTERISTIC_UUID));

        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!smp.is_connected());

        transport
            .connect(&smp.address().to_string())
            .await
            .unwrap();
        assert!(smp.is_connected());
    }

    #[tokio::test]
    async fn test_device_not_found() {
        let network = SimGattNetwork::new();
        let _smp = network.add_smp_server("zephyr");
        let transport = transport(&network);

        let err = transport.connect("AA:BB:CC:DD:EE:FF").await.unwrap_err();
        assert!(matches!(err, TransportError::DeviceNotFound(ref id) if id == "AA:BB:CC:DD:EE:FF"));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_not_an_smp_server() {
        let network = SimGattNetwork::new();
        let hr = network.add_peripheral("heart-rate", vec![(HR_SERVICE, vec![HR_MEASUREMENT])]);
        let transport = transport(&network);

        let err = transport.connect("heart-rate").await.unwrap_err();
        assert!(matches!(err, TransportError::NotAnSmpServer(id) if id == SMP_CHARACTERISTIC_UUID));
        assert!(!hr.is_connected());
        assert!(matches!(transport.send(b"x").await, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_characteristic_in_wrong_service() {
        let network = SimGattNetwork::new();
        let _odd = network.add_peripheral("odd", vec![(HR_SERVICE, vec![SMP_CHARACTERISTIC_UUID])]);
        let transport = transport(&network);

        assert!(matches!(
            transport.connect("odd").await,
            Err(TransportError::NotAnSmpServer(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_lists_smp_servers() {
        let network = SimGattNetwork::new();
        let a = network.add_smp_server("a");
        let b = network.add_smp_server("b");
        let _hr = network.add_peripheral("heart-rate", vec![(HR_SERVICE, vec![HR_MEASUREMENT])]);
        let transport = transport(&network);

        let mut found: Vec<_> = transport
            .scan()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.address)
            .collect();
        found.sort_by_key(|addr| addr.to_string());
        let mut expected = vec![a.address().clone(), b.address().clone()];
        expected.sort_by_key(|addr| addr.to_string());
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn test_mtu_and_max_unencoded_size() {
        let network = SimGattNetwork::new();
        let smp = network.add_smp_server("zephyr");
        smp.set_mtu(244);
        let transport = Arc::new(transport(&network));
        transport.connect("zephyr").await.unwrap();

        assert_eq!(transport.mtu().unwrap(), 244);
        assert_eq!(transport.max_unencoded_size().unwrap(), 244);

        smp.set_mtu(495);
        assert_eq!(transport.mtu().unwrap(), 495);

        // Shared handles can record the size too.
        Arc::clone(&transport).initialize(2475);
        assert_eq!(transport.max_unencoded_size().unwrap(), 2475);

        // Zero means the server did not say; fall back to the MTU.
        transport.initialize(0);
        assert_eq!(transport.max_unencoded_size().unwrap(), 495);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspect_mtu_waits_to_settle() {
        let network = SimGattNetwork::new();
        let smp = network.add_smp_server("zephyr");
        smp.set_mtu(20);
        let transport = transport(&network);

        let before = tokio::time::Instant::now();
        transport.connect("zephyr").await.unwrap();
        assert!(before.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiated_mtu_connects_immediately() {
        let network = SimGattNetwork::new();
        let _smp = network.add_smp_server("zephyr");
        let transport = transport(&network);

        let before = tokio::time::Instant::now();
        transport.connect("zephyr").await.unwrap();
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_delay_disabled() {
        let network = SimGattNetwork::new();
        let smp = network.add_smp_server("zephyr");
        smp.set_mtu(20);
        let config = TransportConfig {
            mtu_settle_delay_ms: 0,
            ..TransportConfig::default()
        };
        let transport = SmpBleTransport::with_config(Arc::new(network.central()), config);

        let before = tokio::time::Instant::now();
        transport.connect("zephyr").await.unwrap();
        assert_eq!(before.elapsed(), Duration::ZERO);
        assert_eq!(transport.mtu().unwrap(), 20);
    }

    #[tokio::test]
    async fn test_connect_replaces_existing_connection() {
        let network = SimGattNetwork::new();
        let first = network.add_smp_server("first");
        let second = network.add_smp_server("second");
        let transport = transport(&network);

        transport.connect("first").await.unwrap();
        transport.connect("second").await.unwrap();

        assert!(!first.is_connected());
        assert!(second.is_connected());
        assert_eq!(transport.state(), ConnectionState::Connected);
    }
}
