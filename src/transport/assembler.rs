//! Inbound reassembly
//!
//! Notifications deliver the response in chunks of arbitrary size that need
//! not line up with anything in the message. The assembler appends them to a
//! single receive buffer and hands the buffer out once it holds exactly the
//! number of bytes the header declares.
//!
//! The buffer and the connection state live behind one lock, shared by the
//! notification handler (producer) and the caller awaiting a response
//! (consumer). The handler never suspends: it appends and signals. A peer
//! disconnect is posted through the same lock and signal, so a waiting
//! receiver always observes it.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use uuid::Uuid;

use super::{ConnectionState, FramingViolation, TransportError};
use crate::header::{HeaderCodec, SmpHeaderCodec};

/// Identifies one connection. Callbacks registered for an earlier connection
/// carry a stale id and are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(u64);

struct Shared {
    buffer: Vec<u8>,
    state: ConnectionState,
    session: u64,
    /// Sticky until the next connect.
    fault: Option<FramingViolation>,
    receiving: bool,
}

/// Reassembles notification chunks into whole messages for a single reader.
///
/// At most one [`FrameAssembler::receive`] may be outstanding; a second
/// concurrent call fails with [`TransportError::ReceiveInProgress`].
pub struct FrameAssembler {
    shared: Mutex<Shared>,
    wakeup: Notify,
    codec: Arc<dyn HeaderCodec>,
    characteristic: Uuid,
}

impl FrameAssembler {
    /// Assembler for SMP messages notified on `characteristic`.
    pub fn new(characteristic: Uuid) -> Self {
        Self::with_codec(characteristic, Arc::new(SmpHeaderCodec))
    }

    pub fn with_codec(characteristic: Uuid, codec: Arc<dyn HeaderCodec>) -> Self {
        Self {
            shared: Mutex::new(Shared {
                buffer: Vec::new(),
                state: ConnectionState::Disconnected,
                session: 0,
                fault: None,
                receiving: false,
            }),
            wakeup: Notify::new(),
            codec,
            characteristic,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Start a new connection: clears the buffer and any recorded fault.
    ///
    /// A receive still pending from an earlier connection fails with
    /// [`TransportError::NotConnected`] and no longer blocks new receives.
    pub fn connected(&self) -> SessionId {
        let session = {
            let mut shared = self.lock();
            shared.session += 1;
            shared.buffer.clear();
            shared.fault = None;
            shared.receiving = false;
            shared.state = ConnectionState::Connected;
            SessionId(shared.session)
        };
        self.wakeup.notify_one();
        session
    }

    /// Caller-initiated disconnect.
    pub fn disconnected(&self) {
        self.lock().state = ConnectionState::Disconnected;
        self.wakeup.notify_one();
    }

    /// The link reported that the peer dropped `session`.
    pub fn peer_disconnected(&self, session: SessionId) {
        {
            let mut shared = self.lock();
            if shared.session != session.0 || shared.state == ConnectionState::Disconnected {
                return;
            }
            shared.state = ConnectionState::Disconnected;
        }
        log::info!("Peer disconnected");
        self.wakeup.notify_one();
    }

    /// Append a chunk of the current message and wake the reader.
    pub fn on_chunk(&self, data: &[u8]) {
        let appended = Self::append(&mut self.lock(), data);
        if appended {
            self.wakeup.notify_one();
        }
    }

    /// Entry point for the link's notification handler.
    ///
    /// Chunks from a superseded connection are dropped. A notification from
    /// any characteristic other than ours poisons the channel.
    pub fn on_notification(&self, session: SessionId, source: Uuid, data: &[u8]) {
        {
            let mut shared = self.lock();
            if shared.session != session.0 {
                log::debug!("Dropping {} bytes from a superseded connection", data.len());
                return;
            }
            if source == self.characteristic {
                if !Self::append(&mut shared, data) {
                    return;
                }
            } else {
                log::warn!(
                    "Unexpected notify from {}; data={}",
                    source,
                    hex::encode(data)
                );
                shared
                    .fault
                    .get_or_insert(FramingViolation::UnexpectedSource(source));
            }
        }
        self.wakeup.notify_one();
    }

    fn append(shared: &mut Shared, data: &[u8]) -> bool {
        if shared.state == ConnectionState::Disconnected {
            log::debug!("Dropping {} bytes received while disconnected", data.len());
            return false;
        }
        if shared.fault.is_some() {
            log::debug!("Dropping {} bytes received after a framing violation", data.len());
            return false;
        }
        shared.buffer.extend_from_slice(data);
        log::debug!(
            "Received {} bytes, {} buffered",
            data.len(),
            shared.buffer.len()
        );
        true
    }

    /// Wait for one whole message and take it out of the buffer.
    ///
    /// Never returns a partial message. Fails with
    /// [`TransportError::NotConnected`] if the connection is down on entry or
    /// goes down while waiting, and with a [`FramingViolation`] if more bytes
    /// arrive than the header declared.
    ///
    /// A receive is bound to the connection it started on: once that
    /// connection ends it fails, even if a new one has been established since.
    ///
    /// Dropping the returned future before it completes leaves the buffer in
    /// an unknown state; later calls fail until the next connect.
    pub async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.begin_receive()?;
        let result = loop {
            match self.poll_message(guard.session) {
                Ok(Some(message)) => break Ok(message),
                Ok(None) => {}
                Err(err) => break Err(err),
            }
            self.wakeup.notified().await;
        };
        guard.finished = true;
        result
    }

    fn begin_receive(&self) -> Result<ReceiveGuard<'_>, TransportError> {
        let mut shared = self.lock();
        if shared.receiving {
            return Err(TransportError::ReceiveInProgress);
        }
        shared.receiving = true;
        Ok(ReceiveGuard {
            assembler: self,
            session: shared.session,
            finished: false,
        })
    }

    /// One check of the buffer under the lock. `Ok(None)` means keep waiting.
    fn poll_message(&self, session: u64) -> Result<Option<Vec<u8>>, TransportError> {
        let mut shared = self.lock();
        if shared.state == ConnectionState::Disconnected || shared.session != session {
            return Err(TransportError::NotConnected);
        }
        if let Some(fault) = &shared.fault {
            return Err(fault.clone().into());
        }

        let header_size = self.codec.header_size();
        if shared.buffer.len() < header_size {
            return Ok(None);
        }
        let expected = match self.codec.total_length(&shared.buffer[..header_size]) {
            Ok(expected) => expected,
            Err(err) => {
                let violation = FramingViolation::from(err);
                shared.fault = Some(violation.clone());
                return Err(violation.into());
            }
        };

        match shared.buffer.len().cmp(&expected) {
            Ordering::Less => {
                log::trace!(
                    "Waiting for the rest of the {} byte response ({} buffered)",
                    expected,
                    shared.buffer.len()
                );
                Ok(None)
            }
            Ordering::Equal => {
                let message: Vec<u8> = shared.buffer.drain(..).collect();
                log::debug!("Finished receiving {} byte response", expected);
                log::trace!("Response: {}", hex::encode(&message));
                Ok(Some(message))
            }
            Ordering::Greater => {
                let violation = FramingViolation::Overrun {
                    expected,
                    actual: shared.buffer.len(),
                };
                log::warn!("Length of buffer passed expected message size: {}", violation);
                shared.fault = Some(violation.clone());
                Err(violation.into())
            }
        }
    }
}

/// Clears the in-flight flag; marks the channel desynchronised if the
/// receive was abandoned mid-wait.
struct ReceiveGuard<'a> {
    assembler: &'a FrameAssembler,
    session: u64,
    finished: bool,
}

impl Drop for ReceiveGuard<'_> {
    fn drop(&mut self) {
        let mut shared = self.assembler.lock();
        // A newer connection owns the flag and the buffer now.
        if shared.session != self.session {
            return;
        }
        shared.receiving = false;
        if !self.finished && shared.state == ConnectionState::Connected {
            log::warn!(
                "Receive abandoned with {} bytes buffered; reconnect before reuse",
                shared.buffer.len()
            );
            shared
                .fault
                .get_or_insert(FramingViolation::AbandonedReceive);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::SMP_CHARACTERISTIC_UUID;
    use crate::header::HeaderError;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    /// 4-byte header whose first two bytes hold the total length, big-endian.
    #[derive(Default)]
    struct TestCodec {
        decodes: AtomicUsize,
    }

    impl HeaderCodec for TestCodec {
        fn header_size(&self) -> usize {
            4
        }

        fn total_length(&self, header: &[u8]) -> Result<usize, HeaderError> {
            self.decodes.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(u16::from_be_bytes([header[0], header[1]]) as usize)
        }
    }

    fn message(total: u16) -> Vec<u8> {
        let mut m = total.to_be_bytes().to_vec();
        m.extend_from_slice(&[0xAB, 0xCD]);
        m.extend((4..total).map(|i| i as u8));
        m
    }

    fn assembler_with(codec: Arc<TestCodec>) -> (Arc<FrameAssembler>, SessionId) {
        let assembler = Arc::new(FrameAssembler::with_codec(SMP_CHARACTERISTIC_UUID, codec));
        let session = assembler.connected();
        (assembler, session)
    }

    fn assembler() -> (Arc<FrameAssembler>, SessionId) {
        assembler_with(Arc::new(TestCodec::default()))
    }

    fn spawn_receive(
        assembler: &Arc<FrameAssembler>,
    ) -> tokio::task::JoinHandle<Result<Vec<u8>, TransportError>> {
        let assembler = Arc::clone(assembler);
        tokio::spawn(async move { assembler.receive().await })
    }

    /// Give spawned tasks a chance to run until they block.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_reassembly_independent_of_chunking() {
        let expected = message(50);
        for chunk_size in [50, 25, 20, 7, 1] {
            let (assembler, _) = assembler();
            for chunk in expected.chunks(chunk_size) {
                assembler.on_chunk(chunk);
            }
            let received = assembler.receive().await.unwrap();
            assert_eq!(received, expected, "chunk size {}", chunk_size);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_arriving_while_waiting() {
        let (assembler, _) = assembler();
        let expected = message(50);
        let handle = spawn_receive(&assembler);

        for chunk in expected.chunks(20) {
            settle().await;
            assert!(!handle.is_finished());
            assembler.on_chunk(chunk);
        }

        assert_eq!(handle.await.unwrap().unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_header_does_not_decode() {
        let codec = Arc::new(TestCodec::default());
        let (assembler, _) = assembler_with(Arc::clone(&codec));
        let expected = message(50);
        let handle = spawn_receive(&assembler);

        assembler.on_chunk(&expected[..3]);
        settle().await;
        assert!(!handle.is_finished());
        assert_eq!(codec.decodes.load(AtomicOrdering::SeqCst), 0);

        assembler.on_chunk(&expected[3..]);
        assert_eq!(handle.await.unwrap().unwrap(), expected);
        assert!(codec.decodes.load(AtomicOrdering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_only_waits_for_payload() {
        let (assembler, _) = assembler();
        let expected = message(50);
        let handle = spawn_receive(&assembler);

        assembler.on_chunk(&expected[..49]);
        settle().await;
        assert!(!handle.is_finished());

        assembler.on_chunk(&expected[49..]);
        assert_eq!(handle.await.unwrap().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_header_only_message() {
        let (assembler, _) = assembler();
        assembler.on_chunk(&message(4));
        assert_eq!(assembler.receive().await.unwrap(), message(4));
    }

    #[tokio::test]
    async fn test_buffer_cleared_between_messages() {
        let (assembler, _) = assembler();
        let first = message(10);
        let second = message(30);

        assembler.on_chunk(&first);
        assert_eq!(assembler.receive().await.unwrap(), first);

        for chunk in second.chunks(4) {
            assembler.on_chunk(chunk);
        }
        assert_eq!(assembler.receive().await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_overrun_is_fatal() {
        let (assembler, _) = assembler();
        let mut bytes = message(50);
        bytes.push(0xFF);
        assembler.on_chunk(&bytes);

        let err = assembler.receive().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::FramingViolation(FramingViolation::Overrun {
                expected: 50,
                actual: 51
            })
        ));

        // No resync: the channel stays broken until the next connect.
        let err = assembler.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::FramingViolation(_)));

        assembler.connected();
        assembler.on_chunk(&message(8));
        assert_eq!(assembler.receive().await.unwrap(), message(8));
    }

    #[tokio::test]
    async fn test_chunks_dropped_after_violation() {
        let (assembler, _) = assembler();
        let mut bytes = message(8);
        bytes.push(0xFF);
        assembler.on_chunk(&bytes);
        assert!(assembler.receive().await.is_err());

        for _ in 0..1000 {
            assembler.on_chunk(&[0u8; 244]);
        }
        assert_eq!(assembler.lock().buffer.len(), bytes.len());

        assembler.connected();
        assert!(assembler.lock().buffer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_while_waiting() {
        let (assembler, _) = assembler();
        let bytes = message(50);
        let handle = spawn_receive(&assembler);

        assembler.on_chunk(&bytes[..40]);
        settle().await;
        assert!(!handle.is_finished());

        // The tail of this message plus the start of another.
        assembler.on_chunk(&bytes[40..]);
        assembler.on_chunk(&message(8)[..2]);
        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(TransportError::FramingViolation(FramingViolation::Overrun { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_wakes_waiting_receiver() {
        let (assembler, session) = assembler();
        let handle = spawn_receive(&assembler);
        settle().await;
        assert!(!handle.is_finished());

        assembler.peer_disconnected(session);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert_eq!(assembler.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_receive_fails_after_reconnect() {
        let (assembler, session) = assembler();
        let handle = spawn_receive(&assembler);
        settle().await;

        // Down and back up before the waiter gets to run again.
        assembler.peer_disconnected(session);
        let current = assembler.connected();
        assembler.on_notification(current, SMP_CHARACTERISTIC_UUID, &message(8));

        assert!(matches!(
            handle.await.unwrap(),
            Err(TransportError::NotConnected)
        ));

        // The new connection's response is still there for its own reader.
        assert_eq!(assembler.receive().await.unwrap(), message(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_reconnect_fails_pending_receive() {
        let (assembler, _) = assembler();
        let handle = spawn_receive(&assembler);
        settle().await;

        assembler.disconnected();
        assembler.connected();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("pending receive should not outlive its connection")
            .unwrap();
        assert!(matches!(result, Err(TransportError::NotConnected)));
        assert!(assembler.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_message() {
        let (assembler, session) = assembler();
        let handle = spawn_receive(&assembler);
        assembler.on_chunk(&message(50)[..30]);
        settle().await;

        assembler.peer_disconnected(session);
        assert!(matches!(
            handle.await.unwrap(),
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_receive_when_disconnected_fails_immediately() {
        let assembler = FrameAssembler::new(SMP_CHARACTERISTIC_UUID);
        assert!(matches!(
            assembler.receive().await,
            Err(TransportError::NotConnected)
        ));

        assembler.connected();
        assembler.disconnected();
        assert!(matches!(
            assembler.receive().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_chunks_dropped_while_disconnected() {
        let (assembler, _) = assembler();
        assembler.disconnected();
        assembler.on_chunk(&message(50)[..20]);

        assembler.connected();
        assembler.on_chunk(&message(8));
        assert_eq!(assembler.receive().await.unwrap(), message(8));
    }

    #[tokio::test]
    async fn test_superseded_session_is_ignored() {
        let (assembler, old) = assembler();
        let current = assembler.connected();

        assembler.on_notification(old, SMP_CHARACTERISTIC_UUID, &message(50)[..10]);
        assembler.peer_disconnected(old);
        assert!(assembler.is_connected());

        assembler.on_notification(current, SMP_CHARACTERISTIC_UUID, &message(8));
        assert_eq!(assembler.receive().await.unwrap(), message(8));
    }

    #[tokio::test]
    async fn test_unexpected_source_is_violation() {
        let (assembler, session) = assembler();
        let stranger = Uuid::new_v4();

        assembler.on_notification(session, stranger, &message(8));

        let err = assembler.receive().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::FramingViolation(FramingViolation::UnexpectedSource(id)) if id == stranger
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_receive_rejected() {
        let (assembler, _) = assembler();
        let handle = spawn_receive(&assembler);
        settle().await;

        assert!(matches!(
            assembler.receive().await,
            Err(TransportError::ReceiveInProgress)
        ));

        // The first receive is unaffected.
        assembler.on_chunk(&message(8));
        assert_eq!(handle.await.unwrap().unwrap(), message(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_receive_requires_reconnect() {
        let (assembler, _) = assembler();
        assembler.on_chunk(&message(50)[..10]);

        let timed_out =
            tokio::time::timeout(Duration::from_millis(100), assembler.receive()).await;
        assert!(timed_out.is_err());

        assert!(matches!(
            assembler.receive().await,
            Err(TransportError::FramingViolation(
                FramingViolation::AbandonedReceive
            ))
        ));

        assembler.connected();
        assembler.on_chunk(&message(8));
        assert_eq!(assembler.receive().await.unwrap(), message(8));
    }

    #[tokio::test]
    async fn test_smp_header_codec() {
        use crate::header::{SmpHeader, SmpOp};

        let assembler = FrameAssembler::new(SMP_CHARACTERISTIC_UUID);
        assembler.connected();
        let header = SmpHeader {
            op: SmpOp::ReadResponse,
            version: 1,
            flags: 0,
            length: 5,
            group_id: 0,
            sequence: 1,
            command_id: 0,
        };
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(&[0xA1, 0x61, 0x72, 0x61, 0x78]);

        for byte in &frame {
            assembler.on_chunk(std::slice::from_ref(byte));
        }
        assert_eq!(assembler.receive().await.unwrap(), frame);
    }
}
