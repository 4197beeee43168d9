use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn, Instrument, Span};

use crate::connection::cd11_socket::{Cd11Socket, ReadResult};
use crate::connection::config::DataConsumerConfig;
use crate::connection::publisher::{DataFrameReceived, DataPublisher, LoggingMalformedSink, MalformedSink};
use crate::connection::transport;
use crate::factory::FrameFactory;
use crate::frames::{Frame, FrameBody};
use crate::gaps::gap_store::{GapStateStore, InMemoryGapStore, YamlFileGapStore};
use crate::gaps::gap_tracker::GapTracker;

pub const SHUTDOWN_ALERT_MESSAGE: &str = "Shutting down connection";

const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_secs(1);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Closed,
}

enum Flow {
    Continue,
    Drain,
}

/// One data provider connection for a station: the read loop dispatching incoming frames, plus
///  timer tasks for ACKNACK heartbeats, contact expiry and gap state persistence. All of them stop
///  when `cancel` fires.
pub struct StationConnection {
    station: String,
    config: Arc<DataConsumerConfig>,
    socket: Arc<Cd11Socket>,
    factory: Arc<FrameFactory>,
    tracker: Arc<GapTracker>,
    store: Arc<dyn GapStateStore>,
    publisher: Arc<dyn DataPublisher>,
    malformed_sink: Arc<dyn MalformedSink>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

impl StationConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<DataConsumerConfig>,
        socket: Arc<Cd11Socket>,
        factory: Arc<FrameFactory>,
        tracker: Arc<GapTracker>,
        store: Arc<dyn GapStateStore>,
        publisher: Arc<dyn DataPublisher>,
        malformed_sink: Arc<dyn MalformedSink>,
        state: watch::Sender<ConnectionState>,
        cancel: CancellationToken,
    ) -> StationConnection {
        StationConnection {
            station: config.station_name.clone(),
            config,
            socket,
            factory,
            tracker,
            store,
            publisher,
            malformed_sink,
            state,
            cancel,
        }
    }

    /// Serves the connection until the peer closes it, sends an ALERT or CUSTOM_RESET_FRAME, stops
    ///  responding, or `cancel` fires. Returns after the connection is closed.
    #[instrument(name="station_connection", skip_all, fields(station = %self.station, peer = ?self.socket.peer_addr()))]
    pub async fn run(self: Arc<Self>) {
        self.state.send_replace(ConnectionState::Connected);
        info!("data provider connected");

        let timers = vec![
            tokio::spawn(self.clone().acknack_loop().instrument(Span::current())),
            tokio::spawn(self.clone().expiry_loop().instrument(Span::current())),
            tokio::spawn(self.clone().persistence_loop().instrument(Span::current())),
        ];

        if let Err(e) = self.read_loop().await {
            warn!("reading from data provider failed: {}", e);
        }

        self.state.send_replace(ConnectionState::Draining);
        self.cancel.cancel();
        for timer in timers {
            if let Err(e) = timer.await {
                error!("timer task of connection terminated abnormally: {}", e);
            }
        }
        self.close().await;
    }

    async fn read_loop(&self) -> anyhow::Result<()> {
        loop {
            let flow = match self.socket.read_frame(&self.cancel).await? {
                None => {
                    if !self.cancel.is_cancelled() {
                        info!("data provider closed the connection");
                    }
                    return Ok(());
                }
                Some(ReadResult::Frame(frame)) => self.handle_frame(frame).await,
                Some(ReadResult::Malformed(partial)) => {
                    self.malformed_sink.on_malformed(&self.station, &partial);
                    Flow::Continue
                }
            };
            if let Flow::Drain = flow {
                return Ok(());
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) -> Flow {
        if !frame.is_valid_crc() {
            warn!(seq = frame.sequence_number(), "CRC mismatch in {} frame - processing it anyway", frame.frame_type());
        }

        match frame.body() {
            FrameBody::Data(_) => self.on_data(frame).await,
            FrameBody::Acknack(acknack) => {
                trace!("ACKNACK from peer: frameset {} [{}, {}], {} gaps", acknack.frameset_acked, acknack.lowest_seq, acknack.highest_seq, acknack.gaps.len());
                if let Err(e) = self.factory.set_frameset_acked(&acknack.frameset_acked) {
                    warn!("ignoring frameset acked from peer: {}", e);
                }
                self.tracker.check_for_reset(acknack.lowest_seq, acknack.highest_seq);
                Flow::Continue
            }
            FrameBody::CommandResponse(response) => {
                debug!(seq = frame.sequence_number(), "received COMMAND_RESPONSE for '{}'", response.request_message);
                self.tracker.add_sequence_number(frame.sequence_number());
                Flow::Continue
            }
            FrameBody::OptionRequest(option) => {
                debug!("received OPTION_REQUEST {} '{}'", option.option_type, option.value);
                match self.factory.create_option_response(option.option_type, &option.value) {
                    Ok(response) => self.send(&response).await,
                    Err(e) => {
                        warn!("cannot answer OPTION_REQUEST: {}", e);
                        Flow::Continue
                    }
                }
            }
            FrameBody::Alert(alert) => {
                info!("data provider sent ALERT '{}' - closing connection", alert.message);
                Flow::Drain
            }
            FrameBody::CustomReset(_) if self.config.custom_reset_enabled => {
                info!("received CUSTOM_RESET_FRAME - clearing gap state and closing connection");
                if let Err(e) = self.store.remove(&self.station) {
                    error!("removing persisted gap state failed: {}", e);
                }
                self.tracker.reset();
                Flow::Drain
            }
            FrameBody::CustomReset(_) => {
                warn!("received CUSTOM_RESET_FRAME, but resets are disabled - ignoring it");
                Flow::Continue
            }
            FrameBody::Cd1Encapsulation(_) => {
                debug!(seq = frame.sequence_number(), "ignoring CD-1 encapsulation frame");
                Flow::Continue
            }
            FrameBody::ConnectionRequest(_) | FrameBody::ConnectionResponse(_) | FrameBody::CommandRequest(_) | FrameBody::OptionResponse(_) => {
                warn!("protocol violation: a data provider does not send {} frames - ignoring it", frame.frame_type());
                Flow::Continue
            }
        }
    }

    async fn on_data(&self, frame: Frame) -> Flow {
        let seq = frame.sequence_number();
        self.tracker.add_sequence_number(seq);

        let data = DataFrameReceived {
            station: self.station.clone(),
            frame,
        };
        select! {
            _ = self.cancel.cancelled() => debug!(seq, "connection closed while publishing DATA frame"),
            result = self.publisher.publish(data) => if let Err(e) = result {
                error!(seq, "publishing DATA frame failed: {}", e);
            }
        }
        Flow::Continue
    }

    async fn send(&self, frame: &Frame) -> Flow {
        match self.socket.write_frame(frame).await {
            Ok(()) => Flow::Continue,
            Err(e) => {
                warn!("sending {} frame failed - closing connection: {}", frame.frame_type(), e);
                Flow::Drain
            }
        }
    }

    async fn acknack_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.acknack_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let sent = match self.factory.create_acknack_from_tracker(&self.tracker) {
                Ok(acknack) => self.socket.write_frame(&acknack).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!("sending ACKNACK failed - closing connection: {}", e);
                self.cancel.cancel();
                break;
            }
        }
    }

    async fn expiry_loop(self: Arc<Self>) {
        let mut ticker = interval(EXPIRY_CHECK_INTERVAL.min(self.config.connection_expired_limit));
        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let silence = self.socket.time_since_last_contact();
            if silence > self.config.connection_expired_limit {
                warn!("no contact from data provider for {} seconds - closing connection", silence.as_secs());
                self.cancel.cancel();
                break;
            }
        }
    }

    async fn persistence_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.gap_store_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Some(expiration) = self.config.gap_expiration {
                if let Some(older_than) = SystemTime::now().checked_sub(expiration) {
                    let num_removed = self.tracker.remove_expired(older_than);
                    if num_removed > 0 {
                        info!("dropped {} gaps that were unchanged for {:?}", num_removed, expiration);
                    }
                }
            }
            self.persist();
        }
    }

    fn persist(&self) {
        persist_gap_state(&self.station, &self.tracker, self.store.as_ref());
    }

    async fn close(&self) {
        self.persist();

        match self.factory.create_alert(SHUTDOWN_ALERT_MESSAGE) {
            Ok(alert) => {
                if let Err(e) = self.socket.write_frame_with_timeout(&alert, self.config.dispose_timeout).await {
                    debug!("could not send ALERT to data provider: {}", e);
                }
            }
            Err(e) => error!("creating ALERT frame failed: {}", e),
        }
        self.socket.shutdown(self.config.dispose_timeout).await;

        self.state.send_replace(ConnectionState::Closed);
        info!("connection closed");
    }
}

fn persist_gap_state(station: &str, tracker: &GapTracker, store: &dyn GapStateStore) {
    // an empty tracker has nothing worth keeping, and after a reset the stored state is gone on purpose
    if let Some(state) = tracker.to_state() {
        match store.store(station, &state) {
            Ok(()) => trace!("persisted gap state with {} gaps", state.gaps.len()),
            Err(e) => error!("persisting gap state failed: {}", e),
        }
    }
}


/// The data consumer for a single station: listens on its configured address and serves one data
///  provider connection at a time. The gap state outlives individual connections, it is loaded when
///  the consumer is created and persisted while and after connections are served.
pub struct DataConsumer {
    config: Arc<DataConsumerConfig>,
    listener: TcpListener,
    factory: Arc<FrameFactory>,
    tracker: Arc<GapTracker>,
    store: Arc<dyn GapStateStore>,
    publisher: Arc<dyn DataPublisher>,
    malformed_sink: Arc<dyn MalformedSink>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
}

impl DataConsumer {
    /// binds with the gap state store derived from `config.gap_state_dir` and malformed frames
    ///  going to the log
    pub async fn bind(config: DataConsumerConfig, publisher: Arc<dyn DataPublisher>) -> anyhow::Result<DataConsumer> {
        let store: Arc<dyn GapStateStore> = match &config.gap_state_dir {
            Some(dir) => Arc::new(YamlFileGapStore::new(dir)?),
            None => Arc::new(InMemoryGapStore::new()),
        };
        DataConsumer::bind_with(config, publisher, store, Arc::new(LoggingMalformedSink)).await
    }

    pub async fn bind_with(
        config: DataConsumerConfig,
        publisher: Arc<dyn DataPublisher>,
        store: Arc<dyn GapStateStore>,
        malformed_sink: Arc<dyn MalformedSink>,
    ) -> anyhow::Result<DataConsumer> {
        config.validate()?;
        let factory = Arc::new(config.frame_factory_builder().build()?);
        let tracker = Arc::new(load_gap_state(&config.station_name, store.as_ref()));
        let listener = transport::listen(config.data_consumer_addr).await?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(DataConsumer {
            config: Arc::new(config),
            listener,
            factory,
            tracker,
            store,
            publisher,
            malformed_sink,
            state,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn tracker(&self) -> Arc<GapTracker> {
        self.tracker.clone()
    }

    pub fn factory(&self) -> Arc<FrameFactory> {
        self.factory.clone()
    }

    /// cancelling the token closes the current connection and makes [DataConsumer::run] return
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    #[instrument(name="data_consumer", skip_all, fields(station = %self.config.station_name))]
    pub async fn run(&self) -> anyhow::Result<()> {
        info!("waiting for data provider on {:?}", self.local_addr()?);
        loop {
            let accepted = select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = transport::accept(&self.listener, self.config.so_linger) => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = self.serve(stream, addr).instrument(Span::current()).await {
                        warn!("connection from {} broke with an error: {}", addr, e);
                    }
                }
                Err(e) => {
                    warn!("accepting connection failed: {}", e);
                    sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
        persist_gap_state(&self.config.station_name, &self.tracker, self.store.as_ref());
        info!("data consumer shut down");
        Ok(())
    }

    async fn serve(&self, stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
        self.state.send_replace(ConnectionState::Connecting);
        if let Some(expected) = self.config.expected_data_provider_ip {
            if addr.ip() != expected {
                warn!("connection from {}, but the data provider is expected at {} - accepting it anyway", addr, expected);
            }
        }

        let socket = match Cd11Socket::new(stream, self.config.max_frame_size) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.state.send_replace(ConnectionState::Closed);
                return Err(e);
            }
        };

        let connection = Arc::new(StationConnection::new(
            self.config.clone(),
            socket,
            self.factory.clone(),
            self.tracker.clone(),
            self.store.clone(),
            self.publisher.clone(),
            self.malformed_sink.clone(),
            self.state.clone(),
            self.shutdown.child_token(),
        ));
        connection.run().await;
        Ok(())
    }
}

fn load_gap_state(station: &str, store: &dyn GapStateStore) -> GapTracker {
    let loaded = store.load(station)
        .and_then(|state| state.map(|s| GapTracker::from_state(&s)).transpose());
    match loaded {
        Ok(Some(tracker)) => {
            info!("loaded gap state for station {}: {} gaps", station, tracker.gaps().len());
            tracker
        }
        Ok(None) => GapTracker::new(),
        Err(e) => {
            warn!("could not load gap state for station {} - starting without it: {}", station, e);
            GapTracker::new()
        }
    }
}
