use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use rumqttc::Outgoing;
use rumqttc::v5::{
    AsyncClient, Event, EventLoop, MqttOptions,
    mqttbytes::QoS,
    mqttbytes::v5::{Packet, Publish},
};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, warn};

use crate::client::ServerClient;
use crate::config::{BrokerConfig, RelayConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::response::Response;
use crate::topic::{DeviceEvent, EventKind, TopicRouter};

// The capacity of the request channel of the broker client.
const BROKER_CHANNEL_CAPACITY: usize = 10;

// Upper bound of the time spent flushing the broker disconnection.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// States of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// No session, initial and final state.
    Disconnected,
    /// The first session is being established.
    Connecting,
    /// The session is established and messages are relayed.
    Connected,
    /// The session has been lost and is being established again.
    Reconnecting,
    /// The relay is stopping.
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    Start,
    Established,
    Lost,
    Shutdown,
    Closed,
}

impl RelayState {
    pub(crate) const fn next(self, event: SessionEvent) -> Self {
        match (self, event) {
            (Self::Disconnected, SessionEvent::Start) => Self::Connecting,
            (Self::Connecting | Self::Reconnecting, SessionEvent::Established) => Self::Connected,
            (Self::Connecting | Self::Connected, SessionEvent::Lost) => Self::Reconnecting,
            (Self::Connecting | Self::Connected | Self::Reconnecting, SessionEvent::Shutdown) => {
                Self::ShuttingDown
            }
            (Self::ShuttingDown, SessionEvent::Closed) => Self::Disconnected,
            (state, _) => state,
        }
    }
}

fn transition(state: &watch::Sender<RelayState>, event: SessionEvent) {
    let _ = state.send_if_modified(|current| {
        let next = current.next(event);
        if next == *current {
            return false;
        }
        info!("Relay state: {current:?} -> {next:?}");
        *current = next;
        true
    });
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message has been published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Bytes,
}

impl InboundMessage {
    /// Creates an [`InboundMessage`].
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

async fn dispatch(client: &ServerClient, event: &DeviceEvent) -> Result<Response> {
    match event.kind() {
        EventKind::State => {
            client
                .toggle_device(event.device_id(), event.is_online())
                .await
        }
        EventKind::Record => client.send_record(event.device_id(), event.payload()).await,
    }
}

// Classifies a message and forwards it to the server.
//
// Every failure is logged and swallowed.
async fn relay_message(client: &ServerClient, message: InboundMessage) {
    let event = match TopicRouter::classify(&message.topic, &message.payload) {
        Ok(event) => event,
        Err(e) => {
            warn!("Dropping message on `{}`: {e}", message.topic);
            return;
        }
    };

    debug!(
        "Relaying {} event of device `{}` received at {}",
        event.kind(),
        event.device_id(),
        event.received_at()
    );

    match dispatch(client, &event).await {
        Ok(response) => debug!(
            "{} event of device `{}` delivered with status {}",
            event.kind(),
            event.device_id(),
            response.status()
        ),
        Err(e) => error!(
            "Dropping {} event of device `{}`: {e}",
            event.kind(),
            event.device_id()
        ),
    }
}

async fn run_worker(id: usize, receiver: flume::Receiver<InboundMessage>, client: ServerClient) {
    while let Ok(message) = receiver.recv_async().await {
        relay_message(&client, message).await;
    }
    debug!("Dispatch worker {id} stopped");
}

/// A fixed pool of workers delivering broker messages to the server.
///
/// Messages are queued on a bounded channel. Each worker delivers one
/// message at a time, so a slow delivery only holds its own worker.
#[derive(Debug)]
pub struct Dispatcher {
    sender: flume::Sender<InboundMessage>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Starts `workers` dispatch workers sharing a queue of `capacity`
    /// messages.
    #[must_use]
    pub fn start(client: &ServerClient, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity.max(1));

        let workers = (0..workers.max(1))
            .map(|id| tokio::spawn(run_worker(id, receiver.clone(), client.clone())))
            .collect();

        Self { sender, workers }
    }

    /// Queues a message, waiting while the queue is full.
    ///
    /// Returns `false` when every worker has stopped.
    pub async fn submit(&self, message: InboundMessage) -> bool {
        self.sender.send_async(message).await.is_ok()
    }

    pub(crate) fn sender(&self) -> flume::Sender<InboundMessage> {
        self.sender.clone()
    }

    /// Stops accepting messages and waits for the workers to deliver the
    /// queued ones.
    ///
    /// Workers still running when `grace` expires are aborted.
    pub async fn shutdown(self, grace: Duration) {
        drop(self.sender);

        let mut workers = self.workers;
        let deadline = tokio::time::Instant::now() + grace;
        for worker in &mut workers {
            if tokio::time::timeout_at(deadline, &mut *worker).await.is_err() {
                break;
            }
        }

        let pending = workers.iter().filter(|worker| !worker.is_finished()).count();
        if pending > 0 {
            warn!("Aborting {pending} dispatch workers after the grace period");
            for worker in &workers {
                worker.abort();
            }
        }
    }
}

async fn flush_disconnection(client: &AsyncClient, eventloop: &mut EventLoop) -> Result<()> {
    client.try_disconnect()?;

    let flush = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    tokio::time::timeout(DISCONNECT_TIMEOUT, flush)
        .await
        .map_err(|_| Error::new(ErrorKind::Broker, "Disconnection not flushed in time"))
}

fn subscribe(client: &AsyncClient, topic_filters: &[String]) -> Result<()> {
    for filter in topic_filters {
        client.try_subscribe(filter.as_str(), QoS::AtMostOnce)?;
        info!("Subscribing to `{filter}`");
    }
    Ok(())
}

// Publications are accepted only on an established session.
fn inbound(state: &watch::Sender<RelayState>, publish: Publish) -> Option<InboundMessage> {
    if *state.borrow() != RelayState::Connected {
        warn!("Message received while not connected, discard it");
        return None;
    }

    Some(InboundMessage::new(
        String::from_utf8_lossy(&publish.topic).into_owned(),
        publish.payload,
    ))
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
    topic_filters: Vec<String>,
    reconnect_delay: Duration,
    sender: flume::Sender<InboundMessage>,
    state: Arc<watch::Sender<RelayState>>,
    cancellation_token: CancellationToken,
}

impl Session {
    async fn run(mut self) {
        let mut connected = false;

        loop {
            tokio::select! {
                // Use the cancellation token to stop the loop
                () = self.cancellation_token.cancelled() => { break; }
                // Poll the `MQTT` event coming from the network
                event = self.eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            connected = true;
                            transition(&self.state, SessionEvent::Established);
                            // Subscriptions do not survive a reconnection.
                            if let Err(e) = subscribe(&self.client, &self.topic_filters) {
                                error!("Subscription failed: {e}");
                            }
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let Some(message) = inbound(&self.state, publish) else {
                                continue;
                            };

                            tokio::select! {
                                () = self.cancellation_token.cancelled() => { break; }
                                result = self.sender.send_async(message) => {
                                    if let Err(e) = result {
                                        error!("Stop relaying messages, workers are gone: {e}");
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                            connected = false;
                            warn!("Disconnected by the broker: {:?}", disconnect.reason_code);
                            transition(&self.state, SessionEvent::Lost);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            connected = false;
                            warn!("Broker session lost: {e}");
                            transition(&self.state, SessionEvent::Lost);

                            tokio::select! {
                                () = self.cancellation_token.cancelled() => { break; }
                                () = tokio::time::sleep(self.reconnect_delay) => {}
                            }
                        }
                    }
                }
            }
        }

        drop(self.sender);

        if connected {
            match flush_disconnection(&self.client, &mut self.eventloop).await {
                Ok(()) => info!("Disconnected from the broker"),
                Err(e) => warn!("Broker disconnection failed: {e}"),
            }
        }
    }
}

/// The relay between the broker and the server.
///
/// It owns the broker session: at every connection it subscribes to the
/// device topic filters and it pushes every received message to a
/// [`Dispatcher`].
#[derive(Debug)]
pub struct RelayEngine {
    broker: BrokerConfig,
    relay: RelayConfig,
    client: ServerClient,
}

impl RelayEngine {
    /// Creates a [`RelayEngine`].
    #[must_use]
    pub const fn new(broker: BrokerConfig, relay: RelayConfig, client: ServerClient) -> Self {
        Self {
            broker,
            relay,
            client,
        }
    }

    /// Starts the dispatch workers and the broker session.
    ///
    /// The broker session is established in background, the returned
    /// [`RelayHandle`] reports its state.
    #[must_use]
    pub fn start(self) -> RelayHandle {
        let (state, state_receiver) = watch::channel(RelayState::Disconnected);
        let state = Arc::new(state);

        let dispatcher = Dispatcher::start(
            &self.client,
            self.relay.workers,
            self.relay.queue_capacity,
        );

        let mut options = MqttOptions::new(
            self.broker.client_id.clone(),
            self.broker.address.clone(),
            self.broker.port,
        );
        let _ = options
            .set_keep_alive(self.broker.keep_alive)
            .set_clean_start(true);
        if let Some((username, password)) = &self.broker.credentials {
            let _ = options.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, BROKER_CHANNEL_CAPACITY);

        info!(
            "Connecting to broker `{}:{}` as `{}`",
            self.broker.address, self.broker.port, self.broker.client_id
        );
        transition(&state, SessionEvent::Start);

        let cancellation_token = CancellationToken::new();
        let session = Session {
            client,
            eventloop,
            topic_filters: self.broker.topic_filters,
            reconnect_delay: self.relay.reconnect_delay,
            sender: dispatcher.sender(),
            state: Arc::clone(&state),
            cancellation_token: cancellation_token.clone(),
        };

        RelayHandle {
            state,
            state_receiver,
            cancellation_token,
            session: tokio::spawn(session.run()),
            dispatcher,
            shutdown_grace: self.relay.shutdown_grace,
        }
    }
}

/// A handle to a running [`RelayEngine`].
#[derive(Debug)]
pub struct RelayHandle {
    state: Arc<watch::Sender<RelayState>>,
    state_receiver: watch::Receiver<RelayState>,
    cancellation_token: CancellationToken,
    session: JoinHandle<()>,
    dispatcher: Dispatcher,
    shutdown_grace: Duration,
}

impl RelayHandle {
    /// Returns the current [`RelayState`].
    #[must_use]
    pub fn state(&self) -> RelayState {
        *self.state_receiver.borrow()
    }

    /// Returns a receiver notified at every [`RelayState`] change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.state_receiver.clone()
    }

    /// Stops the relay.
    ///
    /// No more messages are accepted from the broker, queued and in-flight
    /// deliveries are given the shutdown grace period to complete, then the
    /// broker session is closed.
    pub async fn shutdown(self) {
        transition(&self.state, SessionEvent::Shutdown);
        self.cancellation_token.cancel();

        let mut session = self.session;
        if tokio::time::timeout(self.shutdown_grace, &mut session)
            .await
            .is_err()
        {
            warn!("Broker session not closed in time, abort it");
            session.abort();
        }

        self.dispatcher.shutdown(self.shutdown_grace).await;

        transition(&self.state, SessionEvent::Closed);
    }
}
