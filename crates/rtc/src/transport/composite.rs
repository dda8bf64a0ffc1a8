//! A transport multiplexing per-device delivery and room broadcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::participant::ParticipantDevice;

use super::{KeyTransport, KeyTransportError, ReceivedKey, RoomKeyTransport, ToDeviceKeyTransport};

/// Sends keys per-device until the session turns out to use room
/// broadcasts.
///
/// Room mode enables itself when the to-device driver reports delivery as
/// unsupported, or when a room-broadcast key arrives (someone in the
/// session is a room-transport client). Both receive paths stay live the
/// whole time.
pub struct RoomAndToDeviceKeyTransport {
    to_device: Arc<ToDeviceKeyTransport>,
    room: Arc<RoomKeyTransport>,
    room_enabled: Arc<AtomicBool>,
    tx: broadcast::Sender<ReceivedKey>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl RoomAndToDeviceKeyTransport {
    /// Creates the composite over the two underlying transports.
    pub fn new(to_device: Arc<ToDeviceKeyTransport>, room: Arc<RoomKeyTransport>) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            to_device,
            room,
            room_enabled: Arc::new(AtomicBool::new(false)),
            tx,
            forwarders: Mutex::new(Vec::new()),
        }
    }

    /// Whether keys currently go out as room broadcasts.
    pub fn room_enabled(&self) -> bool {
        self.room_enabled.load(Ordering::SeqCst)
    }

    fn enable_room(&self, reason: &str) {
        if !self.room_enabled.swap(true, Ordering::SeqCst) {
            info!("enabling the room key transport: {reason}");
        }
    }
}

async fn forward(
    mut rx: broadcast::Receiver<ReceivedKey>,
    tx: broadcast::Sender<ReceivedKey>,
    enable_room: Option<Arc<AtomicBool>>,
) {
    loop {
        match rx.recv().await {
            Ok(key) => {
                if let Some(flag) = &enable_room {
                    if !flag.swap(true, Ordering::SeqCst) {
                        info!(
                            "received a room-broadcast media key, enabling the room key \
                             transport"
                        );
                    }
                }
                let _ = tx.send(key);
            }
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!("dropped {count} forwarded key events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[async_trait]
impl KeyTransport for RoomAndToDeviceKeyTransport {
    async fn start(&self) {
        self.to_device.start().await;
        self.room.start().await;

        let mut forwarders = self.forwarders.lock().expect("forwarder list poisoned");
        forwarders.push(tokio::spawn(forward(
            self.to_device.subscribe(),
            self.tx.clone(),
            None,
        )));
        forwarders.push(tokio::spawn(forward(
            self.room.subscribe(),
            self.tx.clone(),
            Some(self.room_enabled.clone()),
        )));
    }

    async fn stop(&self) {
        self.to_device.stop().await;
        self.room.stop().await;
        for forwarder in self
            .forwarders
            .lock()
            .expect("forwarder list poisoned")
            .drain(..)
        {
            forwarder.abort();
        }
    }

    async fn send_key(
        &self,
        key: &str,
        index: u8,
        members: &[ParticipantDevice],
    ) -> Result<(), KeyTransportError> {
        if self.room_enabled() {
            return self.room.send_key(key, index, members).await;
        }

        match self.to_device.send_key(key, index, members).await {
            Err(KeyTransportError::NotSupported) => {
                self.enable_room("to-device delivery is not supported");
                self.room.send_key(key, index, members).await
            }
            result => result,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ReceivedKey> {
        self.tx.subscribe()
    }
}
