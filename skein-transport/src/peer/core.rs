//! Core peer implementation with automatic reconnection and frame queuing.
//!
//! A [`Peer`] owns one TCP connection. All socket I/O happens in a single
//! background `connection_task`, which is the only writer for the
//! connection. Callers only push encoded frames onto the queue and wake the
//! task, so sending never blocks.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use super::config::PeerConfig;
use super::error::{PeerError, PeerResult};
use super::metrics::PeerMetrics;
use super::queue::{Enqueued, OutboundQueue};
use crate::config::FrameConfig;
use crate::envelope::{Envelope, PacketKind};
use crate::frame::{FrameDecoder, encode_frame};
use skein_core::{NetworkProvider, Providers, TaskProvider, TimeProvider};

/// Type alias for the peer receiver channel.
/// Used when taking ownership via `take_receiver()`.
pub type PeerReceiver = mpsc::UnboundedReceiver<Envelope>;

type Stream<P> = <<P as Providers>::Network as NetworkProvider>::TcpStream;

const READ_BUFFER_SIZE: usize = 8192;

/// State for managing reconnections with exponential backoff.
#[derive(Debug, Clone)]
struct ReconnectState {
    /// Current backoff delay
    current_delay: Duration,

    /// Number of consecutive failures
    failure_count: u32,

    /// Time of last connection attempt
    last_attempt: Option<Duration>,
}

impl ReconnectState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            current_delay: initial_delay,
            failure_count: 0,
            last_attempt: None,
        }
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.current_delay = initial_delay;
        self.failure_count = 0;
        self.last_attempt = None;
    }
}

/// A connection to one remote address.
///
/// Outbound peers (created with [`Peer::new`]) connect lazily when the first
/// frame is queued and reconnect with exponential backoff. Incoming peers
/// (created with [`Peer::new_incoming`]) wrap an accepted stream and close
/// for good when it drops; the remote side is expected to reconnect.
///
/// Decoded envelopes other than keep-alive pings are delivered on the
/// receive channel.
pub struct Peer<P: Providers> {
    /// Shared state accessible to background tasks
    shared_state: Rc<RefCell<PeerSharedState<P>>>,

    /// Trigger to wake the connection task when data is queued
    data_to_send: Rc<Notify>,

    /// Background task handle
    connection_handle: Option<JoinHandle<()>>,

    /// Receive channel for decoded envelopes.
    receive_rx: Option<PeerReceiver>,

    /// Shutdown signaling for connection_task. Dropping the peer drops
    /// the sender, which also stops the task.
    shutdown_tx: mpsc::UnboundedSender<()>,

    /// Shutdown signaling for connection_monitor
    monitor_shutdown_tx: Option<mpsc::UnboundedSender<()>>,
}

/// State shared between the peer handle and its background tasks.
struct PeerSharedState<P: Providers> {
    network: P::Network,
    time: P::Time,
    destination: String,

    /// Whether a stream is currently established (the stream itself is
    /// owned by the connection task)
    connected: bool,

    /// Set once the connection task has exited
    closed: bool,

    queue: OutboundQueue,
    reconnect_state: ReconnectState,
    metrics: PeerMetrics,
}

/// Behavior when connection is lost.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum ConnectionLossBehavior {
    /// Attempt to reconnect (outbound connections)
    Reconnect,
    /// Exit the task (incoming connections - client must reconnect)
    Exit,
}

impl<P: Providers> Peer<P> {
    /// Create an outbound peer for the destination address.
    ///
    /// No connection is attempted until the first frame is queued.
    pub fn new(
        providers: P,
        destination: String,
        config: PeerConfig,
        frame_config: FrameConfig,
    ) -> Self {
        Self::spawn(
            providers,
            destination,
            config,
            frame_config,
            None,
            ConnectionLossBehavior::Reconnect,
        )
    }

    /// Create a peer from an accepted stream.
    pub fn new_incoming(
        providers: P,
        peer_address: String,
        stream: Stream<P>,
        config: PeerConfig,
        frame_config: FrameConfig,
    ) -> Self {
        Self::spawn(
            providers,
            peer_address,
            config,
            frame_config,
            Some(stream),
            ConnectionLossBehavior::Exit,
        )
    }

    fn spawn(
        providers: P,
        destination: String,
        config: PeerConfig,
        frame_config: FrameConfig,
        initial_stream: Option<Stream<P>>,
        on_connection_loss: ConnectionLossBehavior,
    ) -> Self {
        let now = providers.time().now();
        let mut metrics = PeerMetrics::default();
        if initial_stream.is_some() {
            metrics.record_connection_success_at(now);
        }

        let shared_state = Rc::new(RefCell::new(PeerSharedState {
            network: providers.network().clone(),
            time: providers.time().clone(),
            destination,
            connected: initial_stream.is_some(),
            closed: false,
            queue: OutboundQueue::new(config.max_queue_size, config.overflow_policy),
            reconnect_state: ReconnectState::new(config.initial_reconnect_delay),
            metrics,
        }));

        let data_to_send = Rc::new(Notify::new());
        let (receive_tx, receive_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        let task_name = match on_connection_loss {
            ConnectionLossBehavior::Reconnect => "connection_task",
            ConnectionLossBehavior::Exit => "incoming_connection_task",
        };
        let connection_handle = providers.task().spawn_task(
            task_name,
            connection_task(
                shared_state.clone(),
                data_to_send.clone(),
                config.clone(),
                frame_config.clone(),
                receive_tx,
                shutdown_rx,
                initial_stream,
                on_connection_loss,
            ),
        );

        let monitor_shutdown_tx = if config.ping_interval > Duration::ZERO {
            let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
            providers.task().spawn_task(
                "connection_monitor",
                connection_monitor(
                    shared_state.clone(),
                    data_to_send.clone(),
                    providers.clone(),
                    config.ping_interval,
                    frame_config,
                    monitor_rx,
                ),
            );
            Some(monitor_tx)
        } else {
            None
        };

        Self {
            shared_state,
            data_to_send,
            connection_handle: Some(connection_handle),
            receive_rx: Some(receive_rx),
            shutdown_tx,
            monitor_shutdown_tx,
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        self.shared_state.borrow().connected
    }

    /// Check if the connection task has exited.
    ///
    /// A closed peer accepts no more frames and should be replaced.
    pub fn is_closed(&self) -> bool {
        self.shared_state.borrow().closed
    }

    /// Number of frames waiting to be written.
    pub fn queue_size(&self) -> usize {
        self.shared_state.borrow().queue.len()
    }

    /// Get peer metrics.
    pub fn metrics(&self) -> PeerMetrics {
        self.shared_state.borrow().metrics.clone()
    }

    /// Remote address of the connection.
    pub fn peer_address(&self) -> String {
        self.shared_state.borrow().destination.clone()
    }

    /// Queue an encoded frame and wake the connection task.
    ///
    /// Returns without waiting for any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`PeerError::QueueFull`] when the queue is full and the
    /// overflow policy rejects, or [`PeerError::Closed`] when the connection
    /// task has exited.
    pub fn send_frame(&mut self, frame: Vec<u8>) -> PeerResult<()> {
        {
            let mut state = self.shared_state.borrow_mut();
            if state.closed {
                return Err(PeerError::Closed);
            }
            let size = frame.len();
            match state.queue.push(frame)? {
                Enqueued::Accepted => {}
                Enqueued::DroppedOldest => {
                    state.metrics.frames_dropped += 1;
                    tracing::warn!(
                        destination = %state.destination,
                        "outbound queue full, dropped oldest frame"
                    );
                }
            }
            state.metrics.frames_queued += 1;
            tracing::trace!(
                destination = %state.destination,
                size,
                queued = state.queue.len(),
                "frame queued"
            );
        }
        self.data_to_send.notify_one();
        Ok(())
    }

    /// Take ownership of the receive channel.
    ///
    /// After calling this, `receive()` returns `PeerError::ReceiverTaken`.
    pub fn take_receiver(&mut self) -> Option<PeerReceiver> {
        self.receive_rx.take()
    }

    /// Receive the next decoded envelope.
    ///
    /// # Errors
    ///
    /// Returns `PeerError::ReceiverTaken` if `take_receiver()` was called,
    /// or `PeerError::Closed` once the connection task has exited.
    pub async fn receive(&mut self) -> PeerResult<Envelope> {
        match &mut self.receive_rx {
            Some(rx) => rx.recv().await.ok_or(PeerError::Closed),
            None => Err(PeerError::ReceiverTaken),
        }
    }

    /// Stop the background tasks and discard queued frames.
    pub async fn close(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(ref tx) = self.monitor_shutdown_tx {
            let _ = tx.send(());
        }

        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.await;
        }

        let mut state = self.shared_state.borrow_mut();
        let dropped = state.queue.clear();
        state.metrics.frames_dropped += dropped as u64;
        state.connected = false;
        state.closed = true;
        state.metrics.record_disconnected();
    }
}

/// Background task that owns the stream and handles all socket I/O.
///
/// - Waits for `data_to_send` and drains the queue in order
/// - Connects (outbound) or exits (incoming) when there is no stream
/// - Re-queues a frame at the front when its write fails
/// - Decodes inbound bytes and forwards envelopes, dropping pings
#[allow(clippy::too_many_arguments)]
async fn connection_task<P: Providers>(
    shared_state: Rc<RefCell<PeerSharedState<P>>>,
    data_to_send: Rc<Notify>,
    config: PeerConfig,
    frame_config: FrameConfig,
    receive_tx: mpsc::UnboundedSender<Envelope>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
    initial_stream: Option<Stream<P>>,
    on_connection_loss: ConnectionLossBehavior,
) {
    let mut current_connection: Option<Stream<P>> = initial_stream;
    let mut decoder = FrameDecoder::new(frame_config);
    let time = shared_state.borrow().time.clone();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                break;
            }

            _ = data_to_send.notified() => {
                if shared_state.borrow().queue.is_empty() {
                    continue;
                }

                if current_connection.is_none() {
                    if on_connection_loss == ConnectionLossBehavior::Exit {
                        tracing::debug!("connection_task: incoming connection gone, exiting");
                        break;
                    }
                    let established = tokio::select! {
                        result = establish_connection(&shared_state, &config) => result,
                        _ = shutdown_rx.recv() => break,
                    };
                    match established {
                        Ok(stream) => {
                            current_connection = Some(stream);
                            decoder.reset();
                        }
                        Err(e) => {
                            let mut state = shared_state.borrow_mut();
                            let dropped = state.queue.clear();
                            state.metrics.frames_dropped += dropped as u64;
                            tracing::warn!(
                                destination = %state.destination,
                                dropped,
                                error = %e,
                                "giving up on connection"
                            );
                            break;
                        }
                    }
                }

                while let Some(ref mut stream) = current_connection {
                    let Some(frame) = shared_state.borrow_mut().queue.pop_front() else {
                        break;
                    };

                    match stream.write_all(&frame).await {
                        Ok(()) => {
                            shared_state.borrow_mut().metrics.record_frame_sent(frame.len());
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "connection_task: write failed");
                            handle_connection_failure(
                                &shared_state,
                                &mut current_connection,
                                &mut decoder,
                                Some(frame),
                            );
                            if on_connection_loss == ConnectionLossBehavior::Reconnect {
                                data_to_send.notify_one();
                            }
                            break;
                        }
                    }
                }
            }

            read_result = async {
                match &mut current_connection {
                    Some(stream) => {
                        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                        stream.read(&mut buffer).await.map(|n| (buffer, n))
                    }
                    None => std::future::pending().await,
                }
            } => {
                match read_result {
                    Ok((_, 0)) => {
                        tracing::debug!("connection_task: remote closed connection");
                        handle_connection_failure(
                            &shared_state,
                            &mut current_connection,
                            &mut decoder,
                            None,
                        );
                        if on_connection_loss == ConnectionLossBehavior::Exit {
                            break;
                        }
                    }
                    Ok((buffer, n)) => {
                        let envelopes = decoder.feed(&buffer[..n], || time.now());
                        let mut pings = 0;
                        let mut receiver_gone = false;
                        for envelope in envelopes {
                            if envelope.kind == PacketKind::Ping {
                                pings += 1;
                                continue;
                            }
                            if receive_tx.send(envelope).is_err() {
                                receiver_gone = true;
                                break;
                            }
                        }
                        {
                            let mut state = shared_state.borrow_mut();
                            state.metrics.bytes_received += n as u64;
                            state.metrics.pings_received += pings;
                            state.metrics.decoder = decoder.metrics().clone();
                        }
                        if receiver_gone {
                            tracing::debug!("connection_task: receiver dropped, exiting");
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "connection_task: read failed");
                        handle_connection_failure(
                            &shared_state,
                            &mut current_connection,
                            &mut decoder,
                            None,
                        );
                        if on_connection_loss == ConnectionLossBehavior::Exit {
                            break;
                        }
                    }
                }
            }
        }
    }

    let mut state = shared_state.borrow_mut();
    state.connected = false;
    state.closed = true;
    state.metrics.record_disconnected();
    tracing::debug!(destination = %state.destination, "connection_task: exited");
}

/// Clear connection state and put a failed frame back at the front.
fn handle_connection_failure<P: Providers>(
    shared_state: &Rc<RefCell<PeerSharedState<P>>>,
    current_connection: &mut Option<Stream<P>>,
    decoder: &mut FrameDecoder,
    failed_frame: Option<Vec<u8>>,
) {
    *current_connection = None;
    decoder.reset();

    let mut state = shared_state.borrow_mut();
    state.connected = false;
    state.metrics.record_disconnected();
    if let Some(frame) = failed_frame {
        state.queue.requeue_front(frame);
    }
    tracing::debug!(
        destination = %state.destination,
        queued = state.queue.len(),
        "connection lost"
    );
}

/// Establish a connection with exponential backoff.
async fn establish_connection<P: Providers>(
    shared_state: &Rc<RefCell<PeerSharedState<P>>>,
    config: &PeerConfig,
) -> PeerResult<Stream<P>> {
    loop {
        let (network, time, destination, delay) = {
            let state = shared_state.borrow();

            if let Some(max_failures) = config.max_connection_failures {
                if state.reconnect_state.failure_count >= max_failures {
                    return Err(PeerError::ConnectionFailed);
                }
            }

            let now = state.time.now();
            let delay = match state.reconnect_state.last_attempt {
                Some(last_attempt) => state
                    .reconnect_state
                    .current_delay
                    .saturating_sub(now.saturating_sub(last_attempt)),
                None => Duration::ZERO,
            };

            (
                state.network.clone(),
                state.time.clone(),
                state.destination.clone(),
                delay,
            )
        };

        if delay > Duration::ZERO && time.sleep(delay).await.is_err() {
            return Err(PeerError::ConnectionFailed);
        }

        {
            let mut state = shared_state.borrow_mut();
            state.reconnect_state.last_attempt = Some(state.time.now());
            state.metrics.record_connection_attempt();
        }

        match time
            .timeout(config.connection_timeout, network.connect(&destination))
            .await
        {
            Ok(Ok(stream)) => {
                let mut state = shared_state.borrow_mut();
                let now = state.time.now();
                if state.reconnect_state.failure_count > 0 {
                    tracing::info!(
                        destination = %destination,
                        failures = state.reconnect_state.failure_count,
                        "reconnected"
                    );
                }
                state.connected = true;
                state.reconnect_state.reset(config.initial_reconnect_delay);
                state.metrics.record_connection_success_at(now);
                return Ok(stream);
            }
            Ok(Err(e)) => {
                tracing::debug!(destination = %destination, error = %e, "connect failed");
                record_connection_failure(shared_state, config);
            }
            Err(_) => {
                tracing::debug!(destination = %destination, "connect timed out");
                record_connection_failure(shared_state, config);
            }
        }
    }
}

/// Record a connection failure: increment failure count, update backoff delay, record metrics.
fn record_connection_failure<P: Providers>(
    shared_state: &Rc<RefCell<PeerSharedState<P>>>,
    config: &PeerConfig,
) {
    let mut state = shared_state.borrow_mut();
    state.reconnect_state.failure_count += 1;
    let next_delay = std::cmp::min(
        state.reconnect_state.current_delay * 2,
        config.max_reconnect_delay,
    );
    state.reconnect_state.current_delay = next_delay;
    state.metrics.record_connection_failure(next_delay);
}

/// Background keep-alive sender.
///
/// Queues a ping every `interval` while connected. Pings are dropped by
/// the receiving side; they only keep idle connections from being reaped.
async fn connection_monitor<P: Providers>(
    shared_state: Rc<RefCell<PeerSharedState<P>>>,
    data_to_send: Rc<Notify>,
    providers: P,
    interval: Duration,
    frame_config: FrameConfig,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    let time = providers.time().clone();
    loop {
        // Ok means a shutdown signal or a dropped peer.
        if time.timeout(interval, shutdown_rx.recv()).await.is_ok() {
            return;
        }

        let frame = match encode_frame(&Envelope::ping(providers.random(), None), &frame_config) {
            Ok(frame) => frame.bytes,
            Err(e) => {
                tracing::warn!(error = %e, "connection_monitor: cannot encode ping");
                return;
            }
        };

        {
            let mut state = shared_state.borrow_mut();
            if state.closed {
                return;
            }
            if !state.connected || state.queue.push(frame).is_err() {
                continue;
            }
            state.metrics.pings_sent += 1;
        }
        data_to_send.notify_one();
    }
}
