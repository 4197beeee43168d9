use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::select;
use tokio::sync::{oneshot, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::connection::cd11_socket::{Cd11Socket, ReadResult};
use crate::connection::transport;
use crate::factory::FrameFactory;
use crate::frames::acknack::Acknack;
use crate::frames::connection::{ConnectionExchange, ServiceType};
use crate::frames::frame_type::FrameType;
use crate::frames::stream_decoder::DEFAULT_MAX_FRAME_SIZE;
use crate::frames::{Frame, FrameBody};
use crate::gaps::gap_tracker::GapTracker;

/// CD-1.1 requires an ACKNACK at least once per minute in both directions
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// the connection is given up if no ACKNACK arrives for this many heartbeat intervals
pub const HEARTBEAT_TIMEOUT_RATIO: f64 = 2.5;
pub const HEARTBEAT_TIMEOUT_MESSAGE: &str = "Acknack heartbeat exceeded timeout threshold";

const OPTION_REQUEST_TYPE: i32 = 1;
const OPTION_REQUEST_VALUE: &str = "Station";
const HEARTBEAT_FRAMESET: &str = "None";

#[derive(Debug, Clone)]
pub struct FrameClientConfig {
    pub station_name: String,
    pub station_type: String,
    pub frame_creator: String,
    pub frame_destination: String,
    pub service_type: ServiceType,
    pub auth_key_id: i32,
    pub protocol_major_version: i16,
    pub protocol_minor_version: i16,

    /// send OPTION_REQUEST(1, "Station") right after connecting
    pub send_option_request: bool,
    pub heartbeat_interval: Duration,
    /// see [transport::connect]
    pub connect_max_wait: Option<Duration>,
    pub so_linger: Option<Duration>,
    /// upper bound for sending the final ALERT when closing
    pub dispose_timeout: Duration,
    pub max_frame_size: usize,
}

impl FrameClientConfig {
    pub fn new(station_name: &str) -> FrameClientConfig {
        FrameClientConfig {
            station_name: station_name.to_string(),
            station_type: "IMS".to_string(),
            frame_creator: "TEST".to_string(),
            frame_destination: "0".to_string(),
            service_type: ServiceType::Tcp,
            auth_key_id: 0,
            protocol_major_version: 1,
            protocol_minor_version: 1,
            send_option_request: true,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_max_wait: Some(Duration::from_secs(10)),
            so_linger: Some(Duration::from_secs(3)),
            dispose_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.station_name.trim().is_empty() {
            bail!("station name must not be empty");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        Ok(())
    }

    fn frame_factory(&self) -> anyhow::Result<FrameFactory> {
        FrameFactory::builder()
            .auth_key_id(self.auth_key_id)
            .frame_creator(&self.frame_creator)
            .frame_destination(&self.frame_destination)
            .protocol_version(self.protocol_major_version, self.protocol_minor_version)
            .responder_name(&self.station_name)
            .responder_type(&self.station_type)
            .service_type(self.service_type)
            .build()
    }
}

struct Shared {
    config: FrameClientConfig,
    socket: Cd11Socket,
    factory: FrameFactory,
    /// sequence numbers of DATA frames sent on this connection
    sent: GapTracker,
    pending_response: Mutex<Option<oneshot::Sender<ConnectionExchange>>>,
    last_acknack_received: Mutex<Instant>,
    acknacks: watch::Sender<Option<Acknack>>,
    cancel: CancellationToken,
}

/// The data provider side of a CD-1.1 connection, as a station or a data injector would run it.
///
/// A reader task handles incoming frames, and a heartbeat task sends ACKNACKs and gives up on the
///  connection when the peer stops sending them.
pub struct FrameClient {
    shared: Arc<Shared>,
}

impl FrameClient {
    pub async fn connect(addr: SocketAddr, config: FrameClientConfig) -> anyhow::Result<FrameClient> {
        config.validate()?;
        let factory = config.frame_factory()?;
        let stream = transport::connect(addr, config.connect_max_wait, config.so_linger).await?;
        let socket = Cd11Socket::new(stream, config.max_frame_size)?;

        let (acknacks, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            config,
            socket,
            factory,
            sent: GapTracker::new(),
            pending_response: Mutex::new(None),
            last_acknack_received: Mutex::new(Instant::now()),
            acknacks,
            cancel: CancellationToken::new(),
        });

        if shared.config.send_option_request {
            let option_request = shared.factory.create_option_request(OPTION_REQUEST_TYPE, OPTION_REQUEST_VALUE)?;
            shared.socket.write_frame(&option_request).await?;
        }

        let span = tracing::info_span!("frame_client", station = %shared.config.station_name, peer = ?addr);
        tokio::spawn(shared.clone().read_loop().instrument(span.clone()));
        tokio::spawn(shared.clone().heartbeat_loop().instrument(span));

        Ok(FrameClient { shared })
    }

    pub fn factory(&self) -> &FrameFactory {
        &self.shared.factory
    }

    /// Sends a CONNECTION_REQUEST announcing `ip:port` and waits for the peer's CONNECTION_RESPONSE
    pub async fn send_connection_request(&self, ip: Ipv4Addr, port: u16) -> anyhow::Result<ConnectionExchange> {
        let (sender, receiver) = oneshot::channel();
        *lock(&self.shared.pending_response) = Some(sender);

        let request = self.shared.factory.create_connection_request(ip, port, None)?;
        self.send_frame(&request).await?;

        select! {
            response = receiver => response.map_err(|_| anyhow!("no CONNECTION_RESPONSE: the request was superseded")),
            _ = self.shared.cancel.cancelled() => Err(anyhow!("connection closed before a CONNECTION_RESPONSE arrived")),
        }
    }

    /// Sends a DATA frame, recording its sequence number even if sending fails: at that point the
    ///  data is lost for this connection
    pub async fn send_data(&self, frame: &Frame) -> anyhow::Result<()> {
        if frame.frame_type() != FrameType::Data {
            bail!("expected a DATA frame, got {}", frame.frame_type());
        }
        self.shared.sent.add_sequence_number(frame.sequence_number());
        self.send_frame(frame).await
    }

    pub async fn send_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        if self.shared.cancel.is_cancelled() {
            bail!("client is closed");
        }
        debug!("sending {} frame #{}", frame.frame_type(), frame.sequence_number());
        self.shared.socket.write_frame(frame).await
    }

    pub fn highest_sent(&self) -> Option<u64> {
        self.shared.sent.highest()
    }

    pub fn lowest_sent(&self) -> Option<u64> {
        self.shared.sent.lowest()
    }

    /// forget which sequence numbers were sent, e.g. when replayed data starts over
    pub fn reset_sequence_bookkeeping(&self) {
        self.shared.sent.reset();
    }

    /// Waits for the next ACKNACK from the peer. ACKNACKs arriving after this call returns count,
    ///  even if the returned future is polled later.
    pub fn wait_for_acknack(&self) -> impl Future<Output = anyhow::Result<Acknack>> + '_ {
        let mut receiver = self.shared.acknacks.subscribe();
        async move {
            select! {
                changed = receiver.changed() => changed?,
                _ = self.shared.cancel.cancelled() => bail!("connection closed"),
            }
            let acknack = receiver.borrow_and_update().clone();
            acknack.ok_or_else(|| anyhow!("no ACKNACK received"))
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// resolves when the connection is closed, by either side
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    /// closes the connection per protocol, sending an ALERT with `message` first
    pub async fn close(&self, message: &str) {
        self.shared.close(message).await
    }
}

impl Drop for FrameClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    async fn read_loop(self: Arc<Self>) {
        loop {
            match self.socket.read_frame(&self.cancel).await {
                Ok(Some(ReadResult::Frame(frame))) => {
                    if self.handle_frame(frame) {
                        break;
                    }
                }
                Ok(Some(ReadResult::Malformed(partial))) => error!("unable to parse frame from peer: {}", partial),
                Ok(None) => {
                    if !self.cancel.is_cancelled() {
                        info!("peer closed the connection");
                    }
                    break;
                }
                Err(e) => {
                    warn!("reading from peer failed: {}", e);
                    break;
                }
            }
        }
        self.shutdown().await;
    }

    /// returns `true` if the connection should be closed
    fn handle_frame(&self, frame: Frame) -> bool {
        debug!("received {} frame #{}", frame.frame_type(), frame.sequence_number());
        match frame.body() {
            FrameBody::Acknack(acknack) => {
                info!("ACKNACK {} received, updating timeout", acknack.frameset_acked);
                *lock(&self.last_acknack_received) = Instant::now();
                if let Err(e) = self.factory.set_frameset_acked(&acknack.frameset_acked) {
                    warn!("ignoring frameset acked from peer: {}", e);
                }
                self.acknacks.send_replace(Some(acknack.clone()));
                false
            }
            FrameBody::Alert(alert) => {
                info!("ALERT received: '{}' - closing client", alert.message);
                true
            }
            FrameBody::ConnectionResponse(response) => {
                info!("CONNECTION_RESPONSE received from {}", response.name);
                match lock(&self.pending_response).take() {
                    Some(pending) => {
                        if pending.send(response.clone()).is_err() {
                            debug!("nobody is waiting for the CONNECTION_RESPONSE anymore");
                        }
                    }
                    None => error!("received CONNECTION_RESPONSE from {} without sending a request", response.name),
                }
                false
            }
            _ => {
                debug!("doing nothing for {} frame", frame.frame_type());
                false
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let heartbeat_interval = self.config.heartbeat_interval;
        let mut ticker = interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if lock(&self.last_acknack_received).elapsed() > heartbeat_interval.mul_f64(HEARTBEAT_TIMEOUT_RATIO) {
                warn!("no ACKNACK for {:?}", heartbeat_interval.mul_f64(HEARTBEAT_TIMEOUT_RATIO));
                self.close(HEARTBEAT_TIMEOUT_MESSAGE).await;
                break;
            }

            let low = self.sent.lowest().unwrap_or(0);
            let high = self.sent.highest().unwrap_or(0);
            let sent = match self.factory.create_acknack(HEARTBEAT_FRAMESET, low, high, Vec::new()) {
                Ok(acknack) => self.socket.write_frame(&acknack).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => debug!("ACKNACK sent"),
                Err(e) => error!("error sending ACKNACK: {}", e),
            }
        }
    }

    async fn close(&self, message: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("stopping CD-1.1 connection: {}", message);
        let sent = match self.factory.create_alert(message) {
            Ok(alert) => self.socket.write_frame_with_timeout(&alert, self.config.dispose_timeout).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("unable to send ALERT frame: {}", e);
        }
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.socket.shutdown(self.config.dispose_timeout).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
