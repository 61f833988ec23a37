//! Command dispatcher.
//!
//! Binds named commands to connected device sessions. Commands for one
//! device run strictly one at a time in call order; a command that
//! expects a reply holds the device until its acknowledgement arrives or
//! its timeout elapses. Different devices never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::event::{Event, EventRouter};
use crate::protocol::{Command, FrameCodec, Params};
use crate::transport::Transport;
use crate::types::{ConnectionState, Device, DeviceId};

/// Default time to wait for a reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// The single response-pending command of a session.
struct Pending {
    tag: u8,
    command: &'static str,
    reply: oneshot::Sender<Result<Bytes>>,
}

/// Per-device state shared by the dispatcher and the session's read task.
struct Session {
    device: DeviceId,
    codec: Arc<dyn FrameCodec>,
    transport: Arc<dyn Transport>,
    queue: Arc<Mutex<()>>,
    pending: StdMutex<Option<Pending>>,
    state: StdMutex<ConnectionState>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn state(&self) -> ConnectionState {
        self.state.lock().map_or(ConnectionState::Error, |s| *s)
    }

    /// Sets the state, returning the previous one.
    fn set_state(&self, state: ConnectionState) -> ConnectionState {
        self.state
            .lock()
            .map_or(ConnectionState::Error, |mut s| std::mem::replace(&mut *s, state))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state().is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Installs the pending slot for a command about to be written.
    fn arm(&self, command: &Command) -> oneshot::Receiver<Result<Bytes>> {
        let (reply, rx) = oneshot::channel();
        if let Ok(mut slot) = self.pending.lock() {
            *slot = Some(Pending {
                tag: command.tag,
                command: command.name,
                reply,
            });
        }
        rx
    }

    fn disarm(&self) {
        if let Ok(mut slot) = self.pending.lock() {
            slot.take();
        }
    }

    /// Resolves the pending command if the acknowledgement is for it.
    fn complete(&self, tag: u8, status: u8, success: bool, payload: &Bytes) {
        let Ok(mut slot) = self.pending.lock() else {
            return;
        };
        match slot.take() {
            Some(pending) if pending.tag == tag => {
                let result = if success {
                    Ok(payload.clone())
                } else {
                    Err(Error::Rejected {
                        command: pending.command,
                        status,
                    })
                };
                if pending.reply.send(result).is_err() {
                    tracing::debug!("{} reply dropped by caller", pending.command);
                }
            }
            other => {
                tracing::trace!("{}: unmatched acknowledgement {:#04x}", self.device, tag);
                *slot = other;
            }
        }
    }

    fn fail_pending(&self) {
        let pending = self.pending.lock().ok().and_then(|mut slot| slot.take());
        if let Some(pending) = pending {
            tracing::debug!("{}: failing in-flight {}", self.device, pending.command);
            let _ = pending.reply.send(Err(Error::NotConnected));
        }
    }
}

/// Waits for a reply or the timeout, whichever comes first.
async fn await_reply(
    session: &Session,
    rx: oneshot::Receiver<Result<Bytes>>,
    timeout: Duration,
) -> Result<Bytes> {
    tokio::select! {
        biased;
        reply = rx => reply.unwrap_or(Err(Error::NotConnected)),
        () = tokio::time::sleep(timeout) => {
            session.disarm();
            Err(Error::timeout(timeout))
        }
    }
}

/// Serializes commands per device and routes inbound traffic.
pub struct CommandDispatcher {
    router: EventRouter,
    sessions: RwLock<HashMap<DeviceId, Arc<Session>>>,
    default_timeout: Duration,
}

impl CommandDispatcher {
    /// Creates a dispatcher publishing to `router`.
    #[must_use]
    pub fn new(router: EventRouter, default_timeout: Duration) -> Self {
        Self {
            router,
            sessions: RwLock::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Returns the timeout used when a caller passes none.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Starts a session for a freshly connected device.
    ///
    /// `inbound` is the chunk receiver returned by the transport's `connect`.
    pub fn attach(
        &self,
        device: &Device,
        codec: Arc<dyn FrameCodec>,
        transport: Arc<dyn Transport>,
        inbound: mpsc::Receiver<Bytes>,
    ) {
        let session = Arc::new(Session {
            device: device.id.clone(),
            codec,
            transport,
            queue: Arc::new(Mutex::new(())),
            pending: StdMutex::new(None),
            state: StdMutex::new(ConnectionState::Connected),
            reader: StdMutex::new(None),
        });

        let reader = tokio::spawn(read_loop(
            Arc::clone(&session),
            self.router.clone(),
            inbound,
        ));
        if let Ok(mut slot) = session.reader.lock() {
            *slot = Some(reader);
        }

        let previous = self
            .sessions
            .write()
            .ok()
            .and_then(|mut sessions| sessions.insert(device.id.clone(), Arc::clone(&session)));
        if let Some(previous) = previous {
            shutdown(&previous);
        }

        tracing::debug!("session started for {} ({})", device.id, session.codec.name());
        self.publish_state(&device.id, ConnectionState::Connected);
    }

    /// Ends a session; the in-flight command fails with [`Error::NotConnected`].
    ///
    /// Returns the session's transport so the caller can close the link.
    pub fn detach(&self, device: &DeviceId) -> Option<Arc<dyn Transport>> {
        let session = self
            .sessions
            .write()
            .ok()
            .and_then(|mut sessions| sessions.remove(device))?;

        let previous = session.set_state(ConnectionState::Disconnected);
        shutdown(&session);
        if previous != ConnectionState::Disconnected {
            self.publish_state(device, ConnectionState::Disconnected);
        }
        Some(Arc::clone(&session.transport))
    }

    /// Returns the session state, if the device has a session.
    #[must_use]
    pub fn state(&self, device: &DeviceId) -> Option<ConnectionState> {
        self.session(device).map(|s| s.state())
    }

    /// Returns the codec bound to a device session.
    #[must_use]
    pub fn codec(&self, device: &DeviceId) -> Option<Arc<dyn FrameCodec>> {
        self.session(device).map(|s| Arc::clone(&s.codec))
    }

    fn session(&self, device: &DeviceId) -> Option<Arc<Session>> {
        self.sessions.read().ok()?.get(device).cloned()
    }

    /// Looks up a connected session and encodes the command for it.
    fn prepare(
        &self,
        device: &DeviceId,
        name: &str,
        params: &Params,
    ) -> Result<(Arc<Session>, &'static Command, Bytes)> {
        let session = self.session(device).ok_or(Error::NotConnected)?;
        session.ensure_connected()?;
        let command = session
            .codec
            .command(name)
            .ok_or_else(|| Error::UnknownCommand {
                name: name.to_owned(),
            })?;
        let frame = session.codec.encode(command, params)?;
        Ok((session, command, frame))
    }

    /// Runs a command and waits for its reply.
    ///
    /// Commands without a reply complete once written, with an empty
    /// payload. Replies are also published to the event router.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if the device has no connected session, or
    ///   is disconnected while the command waits
    /// - [`Error::UnknownCommand`] / [`Error::InvalidParams`] for bad input
    /// - [`Error::CommandTimeout`] if no acknowledgement arrives in time
    /// - [`Error::Rejected`] if the device answers with a failure status
    /// - transport errors from the write
    pub async fn execute(
        &self,
        device: &DeviceId,
        name: &str,
        params: &Params,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let (session, command, frame) = self.prepare(device, name, params)?;
        let timeout = timeout.unwrap_or(self.default_timeout);

        let _turn = session.queue.lock().await;
        session.ensure_connected()?;
        tracing::debug!("{}: {}", device, command.name);

        if !command.response.expects_reply() {
            session.transport.send(device, frame).await?;
            return Ok(Bytes::new());
        }

        let rx = session.arm(command);
        if let Err(e) = session.transport.send(device, frame).await {
            session.disarm();
            return Err(e);
        }
        await_reply(&session, rx, timeout).await
    }

    /// Writes a command without waiting for its reply.
    ///
    /// The command still takes its turn in the device queue and, if it
    /// expects a reply, holds the queue until the reply or the default
    /// timeout. Returns once the bytes are written; a later timeout or
    /// rejection is only logged.
    pub async fn fire_and_forget(&self, device: &DeviceId, name: &str, params: &Params) -> Result<()> {
        let (session, command, frame) = self.prepare(device, name, params)?;

        let turn = Arc::clone(&session.queue).lock_owned().await;
        session.ensure_connected()?;
        tracing::debug!("{}: {} (no wait)", device, command.name);

        if !command.response.expects_reply() {
            return session.transport.send(device, frame).await;
        }

        let rx = session.arm(command);
        if let Err(e) = session.transport.send(device, frame).await {
            session.disarm();
            return Err(e);
        }

        let timeout = self.default_timeout;
        tokio::spawn(async move {
            let _turn = turn;
            if let Err(e) = await_reply(&session, rx, timeout).await {
                tracing::debug!("{}: {} finished with {}", session.device, command.name, e);
            }
        });
        Ok(())
    }

    fn publish_state(&self, device: &DeviceId, state: ConnectionState) {
        self.router.publish(Event::ConnectionStateChanged {
            device: device.clone(),
            state,
        });
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        if let Ok(sessions) = self.sessions.get_mut() {
            for session in sessions.values() {
                shutdown(session);
            }
        }
    }
}

fn shutdown(session: &Session) {
    if let Some(reader) = session.reader.lock().ok().and_then(|mut r| r.take()) {
        reader.abort();
    }
    session.fail_pending();
}

/// Decodes inbound chunks for one session until the link closes.
async fn read_loop(session: Arc<Session>, router: EventRouter, mut inbound: mpsc::Receiver<Bytes>) {
    let mut decoder = session.codec.decoder();

    while let Some(chunk) = inbound.recv().await {
        for frame in decoder.feed(&chunk) {
            for event in session.codec.classify(&session.device, &frame) {
                let ack = match &event {
                    Event::Acknowledgement {
                        command_id,
                        success,
                        payload,
                        ..
                    } => Some((*command_id, *success, payload.clone())),
                    _ => None,
                };
                router.publish(event);
                if let Some((tag, success, payload)) = ack {
                    session.complete(tag, frame.status, success, &payload);
                }
            }
        }
    }

    if session.set_state(ConnectionState::Error) == ConnectionState::Connected {
        tracing::error!("link to {} lost", session.device);
        session.fail_pending();
        router.publish(Event::ConnectionStateChanged {
            device: session.device.clone(),
            state: ConnectionState::Error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventFilter;
    use crate::protocol::sphero::{self, SpheroCodec};
    use crate::transport::{MemoryTransport, PeerHandle};
    use crate::types::{DeviceDescriptor, DeviceFamily, TransportKind};

    async fn connected() -> (CommandDispatcher, EventRouter, PeerHandle, DeviceId) {
        let router = EventRouter::new(64);
        let dispatcher = CommandDispatcher::new(router.clone(), DEFAULT_TIMEOUT);
        let transport = Arc::new(MemoryTransport::new(TransportKind::BluetoothClassic));
        let descriptor = DeviceDescriptor::new(TransportKind::BluetoothClassic, "68:86:e7:00:00:01");
        let peer = transport.add_peer(descriptor.clone());
        let device = Device::from_descriptor(&descriptor, DeviceFamily::Sphero);

        let inbound = transport.connect(&device).await.unwrap();
        dispatcher.attach(&device, Arc::new(SpheroCodec), transport, inbound);
        (dispatcher, router, peer, device.id)
    }

    #[tokio::test]
    async fn test_execute_resolves_on_ack() {
        let (dispatcher, router, mut peer, id) = connected().await;
        let mut acks = router.events(EventFilter::ack(id.clone(), 0x01));

        let responder = tokio::spawn(async move {
            let written = peer.next_write().await.unwrap();
            assert_eq!(&written[..], &[0xFF, 0xFF, 0x00, 0x01, 0x01, 0x01, 0xFC]);
            peer.push(sphero::encode_reply(sphero::MRSP_OK, 0x01, &[])).await.unwrap();
            peer
        });

        let payload = dispatcher.execute(&id, "ping", &Params::new(), None).await.unwrap();
        assert!(payload.is_empty());
        assert!(matches!(acks.recv().await, Some(Event::Acknowledgement { success: true, .. })));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_status() {
        let (dispatcher, _router, mut peer, id) = connected().await;
        tokio::spawn(async move {
            peer.next_write().await;
            peer.push(sphero::encode_reply(0x06, 0x01, &[])).await.unwrap();
            peer
        });

        let result = dispatcher.execute(&id, "ping", &Params::new(), None).await;
        assert!(matches!(
            result,
            Err(Error::Rejected { command: "ping", status: 0x06 })
        ));
    }

    #[tokio::test]
    async fn test_no_reply_command_completes_immediately() {
        let (dispatcher, _router, mut peer, id) = connected().await;
        let payload = dispatcher.execute(&id, "sleep", &Params::new(), None).await.unwrap();
        assert!(payload.is_empty());
        assert_eq!(peer.next_write().await.unwrap()[1], sphero::SOP2_ASYNC);
    }

    #[tokio::test]
    async fn test_input_errors() {
        let (dispatcher, _router, _peer, id) = connected().await;
        let unknown = DeviceId::new(TransportKind::Usb, "nowhere");

        assert!(matches!(
            dispatcher.execute(&unknown, "ping", &Params::new(), None).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            dispatcher.execute(&id, "fly", &Params::new(), None).await,
            Err(Error::UnknownCommand { .. })
        ));
        assert!(matches!(
            dispatcher.execute(&id, "roll", &Params::new().with("speed", 300), None).await,
            Err(Error::InvalidParams { command: "roll", .. })
        ));
    }

    #[tokio::test]
    async fn test_link_loss_sets_error_state() {
        let (dispatcher, router, peer, id) = connected().await;
        let mut states = router.events(EventFilter::device(id.clone()));

        peer.drop_link();
        let event = tokio::time::timeout(Duration::from_secs(1), states.recv())
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(Event::ConnectionStateChanged { state: ConnectionState::Error, .. })
        ));
        assert_eq!(dispatcher.state(&id), Some(ConnectionState::Error));
        assert!(matches!(
            dispatcher.execute(&id, "ping", &Params::new(), None).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_late_reply_matches_by_tag() {
        let (dispatcher, _router, mut peer, id) = connected().await;
        let short = Some(Duration::from_millis(20));

        let first = dispatcher.execute(&id, "ping", &Params::new(), short).await;
        assert!(matches!(first, Err(Error::CommandTimeout { .. })));
        peer.next_write().await.unwrap();

        // A stale ping reply does not complete an unrelated command.
        let late_ping = async {
            peer.next_write().await.unwrap();
            peer.push(sphero::encode_reply(sphero::MRSP_OK, 0x01, &[])).await.unwrap();
        };
        let no_params = Params::new();
        let (version, ()) = tokio::join!(
            dispatcher.execute(&id, "get_version", &no_params, short),
            late_ping
        );
        assert!(matches!(version, Err(Error::CommandTimeout { .. })));

        // It does complete a waiting command of the same kind.
        let late_ping = async {
            peer.next_write().await.unwrap();
            peer.push(sphero::encode_reply(sphero::MRSP_OK, 0x01, &[])).await.unwrap();
        };
        let (retry, ()) = tokio::join!(
            dispatcher.execute(&id, "ping", &no_params, None),
            late_ping
        );
        assert!(retry.is_ok());
    }

    #[tokio::test]
    async fn test_fire_and_forget_keeps_order() {
        let (dispatcher, _router, mut peer, id) = connected().await;

        dispatcher.fire_and_forget(&id, "ping", &Params::new()).await.unwrap();
        assert_eq!(peer.next_write().await.unwrap()[4], 0x01);

        // The second command waits for the first one's acknowledgement.
        let dispatcher = Arc::new(dispatcher);
        let second = {
            let dispatcher = Arc::clone(&dispatcher);
            let id = id.clone();
            tokio::spawn(async move { dispatcher.fire_and_forget(&id, "get_version", &Params::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer.try_next_write().is_none());

        peer.push(sphero::encode_reply(sphero::MRSP_OK, 0x01, &[])).await.unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(peer.next_write().await.unwrap()[4], 0x02);
    }
}
