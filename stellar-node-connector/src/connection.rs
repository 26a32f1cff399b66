//! A single peer connection.
//!
//! Each [`Connection`] is backed by one driver task that owns the socket and
//! every piece of mutable connection state. The driver runs the handshake,
//! checks the sequence and MAC of every authenticated message, and hands
//! decoded messages to the consumer as [`Event`]s. The consumer acknowledges
//! each delivered message through its [`Done`] handle, which feeds flow
//! control and frees a slot in the in-flight budget. When the budget runs out
//! the driver stops reading until a slot is freed.

use crate::auth::ConnectionAuthentication;
use crate::config::Config;
use crate::crypto;
use crate::error::Error;
use crate::flow_control::{FlowController, AUTH_MSG_FLAG_FLOW_CONTROL_BYTES_REQUESTED};
use crate::framing::{self, MAX_MESSAGE_SIZE, MAX_UNAUTH_MESSAGE_SIZE};
use crate::handshake::{self, HandshakeState};
use crate::message::{self, RawMessage};
use crate::session::{MacKeys, PeerInfo, Session};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stellar_xdr::curr::{Auth, Hello, MessageType, StellarMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, AcquireError, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};

/// Frames handled between cooperative yields.
const FRAMES_PER_YIELD: usize = 10;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on writing a farewell ERROR_MSG to a misbehaving peer, and on
/// shutting down the write half.
const ERROR_MESSAGE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Progress of the read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Waiting for a 4-byte length prefix.
    ReadyForLength,
    /// Waiting for the body of a frame.
    ReadyForMessage,
    /// In-flight budget exhausted; nothing is read until a slot frees up.
    Blocked,
}

impl fmt::Display for ReadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadState::ReadyForLength => write!(f, "ready_for_length"),
            ReadState::ReadyForMessage => write!(f, "ready_for_message"),
            ReadState::Blocked => write!(f, "blocked"),
        }
    }
}

/// Observable state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub handshake: HandshakeState,
    pub read: ReadState,
}

/// Something that happened on a connection.
#[derive(Debug)]
pub enum Event {
    /// The handshake completed.
    Connected(PeerInfo),
    /// An authenticated application message. Call [`Done::done`] once it
    /// has been processed.
    Message { message: StellarMessage, done: Done },
    /// The connection failed. Always followed by [`Event::Close`].
    Error(Error),
    /// The handshake or idle deadline passed. Always followed by
    /// [`Event::Close`].
    Timeout,
    /// The connection is gone. No events follow.
    Close,
}

/// Acknowledgment handle for a delivered message.
///
/// Dropping it without calling [`Done::done`] frees the in-flight slot but
/// returns no flow-control credit to the peer.
#[derive(Debug)]
pub struct Done {
    message_type: MessageType,
    size: usize,
    permit: OwnedSemaphorePermit,
    acks: mpsc::UnboundedSender<Acknowledgment>,
}

impl Done {
    /// Mark the message as processed.
    pub fn done(self) {
        let _ = self.acks.send(Acknowledgment {
            message_type: self.message_type,
            size: self.size,
            permit: self.permit,
        });
    }
}

#[derive(Debug)]
struct Acknowledgment {
    message_type: MessageType,
    size: usize,
    permit: OwnedSemaphorePermit,
}

/// Handle to a running peer connection.
///
/// Dropping the handle closes the connection.
#[derive(Debug)]
pub struct Connection {
    remote_address: SocketAddr,
    we_called_remote: bool,
    events: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::Sender<StellarMessage>,
    state: watch::Receiver<ConnectionState>,
    shutdown: Arc<Notify>,
}

impl Connection {
    /// Start a connection over an already established stream.
    ///
    /// `we_called_remote` selects the handshake role: the caller speaks
    /// first. Must be called from within a tokio runtime.
    pub fn from_stream<S>(
        stream: S,
        remote_address: SocketAddr,
        we_called_remote: bool,
        config: Arc<Config>,
        authentication: Arc<ConnectionAuthentication>,
    ) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let (reader, writer) = tokio::io::split(stream);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::channel(config.outbound_queue_capacity);
        let (acks_tx, acks_rx) = mpsc::unbounded_channel();
        let stage = if we_called_remote {
            Stage::Connecting
        } else {
            Stage::Connected
        };
        let (state_tx, state_rx) = watch::channel(ConnectionState {
            handshake: stage.state(),
            read: ReadState::ReadyForLength,
        });
        let shutdown = Arc::new(Notify::new());
        let in_flight = Arc::new(Semaphore::new(config.max_unacknowledged_messages));
        let now = Instant::now();

        let driver = Driver {
            reader,
            writer,
            remote_address,
            we_called_remote,
            local_nonce: crypto::generate_nonce(),
            handshake_deadline: now + config.handshake_timeout,
            last_activity: now,
            config,
            authentication,
            stage,
            read: ReadState::ReadyForLength,
            pending_length: None,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            in_flight,
            permit: None,
            frames_since_yield: 0,
            events: events_tx,
            commands: commands_rx,
            acks_tx,
            acks_rx,
            state: state_tx,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(driver.run());

        Ok(Self {
            remote_address,
            we_called_remote,
            events: events_rx,
            commands: commands_tx,
            state: state_rx,
            shutdown,
        })
    }

    /// Wait for the next event. Returns `None` after [`Event::Close`].
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Queue a message for the peer, waiting for queue space.
    ///
    /// Messages are written once the handshake has completed.
    pub async fn send(&self, message: StellarMessage) -> Result<(), Error> {
        check_sendable(&message)?;
        self.commands
            .send(message)
            .await
            .map_err(|_| Error::Closed)
    }

    /// Queue a message for the peer without waiting.
    ///
    /// Returns `Ok(false)` if the outbound queue is full.
    pub fn try_send(&self, message: StellarMessage) -> Result<bool, Error> {
        check_sendable(&message)?;
        match self.commands.try_send(message) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Closed),
        }
    }

    /// Stop the connection. Further calls have no effect.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn we_called_remote(&self) -> bool {
        self.we_called_remote
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

fn check_sendable(message: &StellarMessage) -> Result<(), Error> {
    match message {
        StellarMessage::Hello(_) | StellarMessage::Auth(_) => Err(Error::ProtocolViolation(
            format!("{} is sent by the handshake only", message.name()),
        )),
        _ => Ok(()),
    }
}

/// Handshake stage together with the data that only exists in that stage.
enum Stage {
    Connecting,
    Connected,
    GotHello(Session),
    Completed {
        session: Session,
        flow_control: FlowController,
    },
}

impl Stage {
    fn state(&self) -> HandshakeState {
        match self {
            Stage::Connecting => HandshakeState::Connecting,
            Stage::Connected => HandshakeState::Connected,
            Stage::GotHello(_) => HandshakeState::GotHello,
            Stage::Completed { .. } => HandshakeState::Completed,
        }
    }

    fn session_mut(&mut self) -> Option<&mut Session> {
        match self {
            Stage::GotHello(session) | Stage::Completed { session, .. } => Some(session),
            Stage::Connecting | Stage::Connected => None,
        }
    }
}

enum Step {
    Shutdown,
    Timeout,
    Command(Option<StellarMessage>),
    Ack(Acknowledgment),
    Unblocked(Result<OwnedSemaphorePermit, AcquireError>),
    Read(std::io::Result<usize>),
}

struct Driver<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    remote_address: SocketAddr,
    we_called_remote: bool,
    config: Arc<Config>,
    authentication: Arc<ConnectionAuthentication>,
    local_nonce: [u8; 32],
    stage: Stage,
    read: ReadState,
    /// Length of the frame whose body is being awaited.
    pending_length: Option<usize>,
    buffer: BytesMut,
    in_flight: Arc<Semaphore>,
    /// Slot reserved for the next delivered message. `None` means Blocked.
    permit: Option<OwnedSemaphorePermit>,
    frames_since_yield: usize,
    handshake_deadline: Instant,
    last_activity: Instant,
    events: mpsc::UnboundedSender<Event>,
    commands: mpsc::Receiver<StellarMessage>,
    acks_tx: mpsc::UnboundedSender<Acknowledgment>,
    acks_rx: mpsc::UnboundedReceiver<Acknowledgment>,
    state: watch::Sender<ConnectionState>,
    shutdown: Arc<Notify>,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(mut self) {
        match self.drive().await {
            Ok(()) | Err(Error::Closed) => {
                tracing::debug!(peer = %self.remote_address, "Connection closed");
            }
            Err(Error::Timeout) => {
                tracing::warn!(
                    peer = %self.remote_address,
                    state = %self.stage.state(),
                    "Connection timed out"
                );
                self.emit(Event::Timeout);
            }
            Err(error) => {
                tracing::warn!(
                    peer = %self.remote_address,
                    error_message = %error,
                    "Dropping connection"
                );
                if let Some(message) = handshake::error_message(&error) {
                    let farewell = self.send_unauthenticated(&message);
                    let _ = tokio::time::timeout(ERROR_MESSAGE_WRITE_TIMEOUT, farewell).await;
                }
                self.emit(Event::Error(error));
            }
        }

        let _ = tokio::time::timeout(ERROR_MESSAGE_WRITE_TIMEOUT, self.writer.shutdown()).await;
        self.state.send_modify(|state| state.handshake = HandshakeState::Closed);
        self.emit(Event::Close);
    }

    async fn drive(&mut self) -> Result<(), Error> {
        if self.we_called_remote {
            self.stage = Stage::Connected;
            self.publish();
            self.send_hello().await?;
        }

        loop {
            self.process_frames().await?;

            let completed = self.stage.state().is_completed();
            let blocked = self.permit.is_none();
            let deadline = self.deadline();
            self.buffer.reserve(READ_BUFFER_SIZE);

            let step = tokio::select! {
                biased;
                _ = self.shutdown.notified() => Step::Shutdown,
                Some(ack) = self.acks_rx.recv() => Step::Ack(ack),
                permit = self.in_flight.clone().acquire_owned(), if blocked => {
                    Step::Unblocked(permit)
                }
                read = self.reader.read_buf(&mut self.buffer), if !blocked => Step::Read(read),
                command = self.commands.recv(), if completed => Step::Command(command),
                _ = sleep_until(deadline) => Step::Timeout,
            };

            match step {
                Step::Shutdown => return Ok(()),
                Step::Timeout => return Err(Error::Timeout),
                Step::Command(None) => return Ok(()),
                Step::Command(Some(message)) => self.send_message(&message).await?,
                Step::Ack(ack) => self.on_ack(ack).await?,
                Step::Unblocked(permit) => {
                    self.permit = Some(permit.map_err(|_| Error::Closed)?);
                }
                Step::Read(read) => {
                    if read? == 0 {
                        tracing::debug!(peer = %self.remote_address, "Peer closed the connection");
                        return Ok(());
                    }
                    self.last_activity = Instant::now();
                }
            }
        }
    }

    /// Handle every complete frame in the buffer while in-flight slots last.
    async fn process_frames(&mut self) -> Result<(), Error> {
        loop {
            let permit = match self.permit.take() {
                Some(permit) => permit,
                None => match self.in_flight.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        self.set_read(ReadState::Blocked);
                        return Ok(());
                    }
                },
            };

            let length = match self.pending_length {
                Some(length) => length,
                None => match framing::split_length(&mut self.buffer) {
                    Some(length) => {
                        framing::check_length(length, self.max_frame_size())?;
                        self.pending_length = Some(length);
                        length
                    }
                    None => {
                        self.permit = Some(permit);
                        self.set_read(ReadState::ReadyForLength);
                        return Ok(());
                    }
                },
            };

            let Some(body) = framing::split_frame(&mut self.buffer, length) else {
                self.permit = Some(permit);
                self.set_read(ReadState::ReadyForMessage);
                return Ok(());
            };
            self.pending_length = None;

            self.permit = self.handle_frame(body, permit).await?;

            self.frames_since_yield += 1;
            if self.frames_since_yield >= FRAMES_PER_YIELD {
                self.frames_since_yield = 0;
                tokio::task::yield_now().await;
            }
        }
    }

    /// Handle one frame body. Returns the permit if the frame did not use it.
    async fn handle_frame(
        &mut self,
        body: Bytes,
        permit: OwnedSemaphorePermit,
    ) -> Result<Option<OwnedSemaphorePermit>, Error> {
        let raw = RawMessage::parse(body)?;
        tracing::trace!(
            peer = %self.remote_address,
            direction = "recv",
            message_type = raw.message_type().name(),
            sequence = raw.sequence(),
            size = raw.payload_size(),
            "Frame"
        );

        if !matches!(
            raw.message_type(),
            MessageType::Hello | MessageType::ErrorMsg
        ) {
            if let Some(session) = self.stage.session_mut() {
                session.verify(&raw)?;
            }
        }

        if self.stage.state().is_completed() {
            self.handle_authenticated(raw, permit).await
        } else {
            self.handle_handshake(raw).await?;
            Ok(Some(permit))
        }
    }

    async fn handle_handshake(&mut self, raw: RawMessage) -> Result<(), Error> {
        let message = raw.decode()?;
        handshake::log_message(self.remote_address, "recv", &message);
        match (self.stage.state(), message) {
            (_, StellarMessage::ErrorMsg(error)) => Err(handshake::peer_error(&error)),
            (HandshakeState::Connected, StellarMessage::Hello(hello)) => self.on_hello(hello).await,
            (HandshakeState::GotHello, StellarMessage::Auth(auth)) => self.on_auth(auth).await,
            (state, other) => Err(Error::ProtocolViolation(format!(
                "unexpected {} in handshake state {}",
                other.name(),
                state
            ))),
        }
    }

    async fn on_hello(&mut self, hello: Hello) -> Result<(), Error> {
        let peer = handshake::validate_hello(
            &self.config,
            &self.authentication,
            &hello,
            self.remote_address,
        )?;

        let keys = MacKeys {
            sending: self.authentication.sending_mac_key(
                &self.local_nonce,
                &hello.nonce.0,
                &hello.cert.pubkey,
                self.we_called_remote,
            ),
            receiving: self.authentication.receiving_mac_key(
                &self.local_nonce,
                &hello.nonce.0,
                &hello.cert.pubkey,
                self.we_called_remote,
            ),
        };
        self.stage = Stage::GotHello(Session::new(peer, keys));
        self.publish();

        if self.we_called_remote {
            self.send_auth().await
        } else {
            self.send_hello().await
        }
    }

    async fn on_auth(&mut self, auth: Auth) -> Result<(), Error> {
        if !self.we_called_remote {
            self.send_auth().await?;
        }

        let Stage::GotHello(session) = std::mem::replace(&mut self.stage, Stage::Connected) else {
            return Err(Error::ProtocolViolation("AUTH before HELLO".to_string()));
        };
        let (flow_control, grant) = FlowController::start(
            self.config.flow_control,
            self.config.overlay_version,
            session.peer.overlay_version,
            auth.flags,
        );
        let peer = session.peer.clone();
        self.stage = Stage::Completed {
            session,
            flow_control,
        };
        self.last_activity = Instant::now();
        self.publish();

        self.send_message(&grant).await?;
        tracing::debug!(
            peer = %self.remote_address,
            node = %peer.strkey(),
            overlay_version = peer.overlay_version,
            "Handshake completed"
        );
        self.emit(Event::Connected(peer));
        Ok(())
    }

    async fn handle_authenticated(
        &mut self,
        raw: RawMessage,
        permit: OwnedSemaphorePermit,
    ) -> Result<Option<OwnedSemaphorePermit>, Error> {
        let message_type = raw.message_type();
        let dropped = match message_type {
            MessageType::ErrorMsg => {
                let message = raw.decode()?;
                handshake::log_message(self.remote_address, "recv", &message);
                return match message {
                    StellarMessage::ErrorMsg(error) => Err(handshake::peer_error(&error)),
                    other => Err(Error::ProtocolViolation(format!(
                        "{} framed as ErrorMsg",
                        other.name()
                    ))),
                };
            }
            MessageType::Hello | MessageType::Auth => {
                return Err(Error::ProtocolViolation(format!(
                    "unexpected {} after handshake",
                    message_type.name()
                )));
            }
            MessageType::Transaction => !self.config.receive_transaction_messages,
            MessageType::ScpMessage => !self.config.receive_scp_messages,
            _ => false,
        };

        if dropped {
            tracing::trace!(
                peer = %self.remote_address,
                message_type = message_type.name(),
                "Dropping unwanted message"
            );
            self.count_processed(message_type, raw.payload_size()).await?;
            return Ok(Some(permit));
        }

        let message = raw.decode()?;
        handshake::log_message(self.remote_address, "recv", &message);
        let done = Done {
            message_type,
            size: raw.payload_size(),
            permit,
            acks: self.acks_tx.clone(),
        };
        self.emit(Event::Message { message, done });
        Ok(None)
    }

    async fn on_ack(&mut self, ack: Acknowledgment) -> Result<(), Error> {
        self.last_activity = Instant::now();
        self.count_processed(ack.message_type, ack.size).await?;
        drop(ack.permit);
        Ok(())
    }

    /// Feed flow control and send the grant it returns, if any.
    async fn count_processed(
        &mut self,
        message_type: MessageType,
        size: usize,
    ) -> Result<(), Error> {
        let grant = match &mut self.stage {
            Stage::Completed { flow_control, .. } => {
                flow_control.on_message_received(message_type, size)
            }
            _ => None,
        };
        if let Some(grant) = grant {
            self.send_message(&grant).await?;
        }
        Ok(())
    }

    async fn send_hello(&mut self) -> Result<(), Error> {
        let hello = handshake::build_hello(&self.config, &self.authentication, &self.local_nonce)?;
        self.send_unauthenticated(&hello).await
    }

    async fn send_auth(&mut self) -> Result<(), Error> {
        let auth = StellarMessage::Auth(Auth {
            flags: AUTH_MSG_FLAG_FLOW_CONTROL_BYTES_REQUESTED,
        });
        self.send_message(&auth).await
    }

    /// Send a message, authenticating it unless it is HELLO or ERROR_MSG.
    async fn send_message(&mut self, message: &StellarMessage) -> Result<(), Error> {
        if matches!(message, StellarMessage::Hello(_) | StellarMessage::ErrorMsg(_)) {
            return self.send_unauthenticated(message).await;
        }
        let session = self.stage.session_mut().ok_or_else(|| {
            Error::ProtocolViolation(format!("cannot send {} before HELLO", message.name()))
        })?;
        let body = session.authenticate(message)?;
        handshake::log_message(self.remote_address, "send", message);
        self.write_body(&body).await
    }

    async fn send_unauthenticated(&mut self, message: &StellarMessage) -> Result<(), Error> {
        let body = message::encode(0, message, None)?;
        handshake::log_message(self.remote_address, "send", message);
        self.write_body(&body).await
    }

    /// Write one frame. A stuck write gives way to `close()` and to the
    /// current deadline.
    async fn write_body(&mut self, body: &[u8]) -> Result<(), Error> {
        let frame = framing::encode_frame(body)?;
        let deadline = self.deadline();
        let shutdown = self.shutdown.clone();
        let writer = &mut self.writer;
        let write = async move {
            writer.write_all(&frame).await?;
            writer.flush().await
        };

        tokio::select! {
            biased;
            _ = shutdown.notified() => return Err(Error::Closed),
            _ = sleep_until(deadline) => return Err(Error::Timeout),
            written = write => written?,
        }
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Handshake deadline until completion, idle deadline afterwards.
    fn deadline(&self) -> Instant {
        if self.stage.state().is_completed() {
            self.last_activity + self.config.idle_timeout
        } else {
            self.handshake_deadline
        }
    }

    fn max_frame_size(&self) -> usize {
        if self.stage.state().is_completed() {
            MAX_MESSAGE_SIZE
        } else {
            MAX_UNAUTH_MESSAGE_SIZE
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn set_read(&mut self, read: ReadState) {
        if self.read != read {
            tracing::trace!(
                peer = %self.remote_address,
                from = %self.read,
                to = %read,
                "Read state"
            );
            self.read = read;
            self.publish();
        }
    }

    fn publish(&self) {
        let next = ConnectionState {
            handshake: self.stage.state(),
            read: self.read,
        };
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
    }
}
