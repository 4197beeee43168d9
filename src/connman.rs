use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

use crate::connection::cd11_socket::{Cd11Socket, ReadResult};
use crate::connection::transport;
use crate::factory::FrameFactory;
use crate::frames::connection::{ConnectionExchange, ServiceType};
use crate::frames::stream_decoder::DEFAULT_MAX_FRAME_SIZE;
use crate::frames::{Frame, FrameBody};

/// where a station's data provider is sent after the handshake
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StationRegistration {
    pub station_name: String,
    pub data_consumer_addr: SocketAddr,
    /// connection requests of stations that are not acquired are ignored
    pub acquired: bool,
}

#[derive(Debug, Clone)]
pub struct ConnManConfig {
    /// the well-known port stations connect to first
    pub connman_addr: SocketAddr,
    pub stations: Vec<StationRegistration>,

    pub frame_creator: String,
    pub frame_destination: String,
    pub responder_name: String,
    pub responder_type: String,
    pub service_type: ServiceType,
    pub auth_key_id: i32,
    pub protocol_major_version: i16,
    pub protocol_minor_version: i16,

    pub so_linger: Option<Duration>,
    pub max_frame_size: usize,
}

impl ConnManConfig {
    pub fn new(connman_addr: SocketAddr) -> ConnManConfig {
        ConnManConfig {
            connman_addr,
            stations: Vec::new(),
            frame_creator: "TEST".to_string(),
            frame_destination: "0".to_string(),
            responder_name: "TEST".to_string(),
            responder_type: "IDC".to_string(),
            service_type: ServiceType::Tcp,
            auth_key_id: 7,
            protocol_major_version: 2,
            protocol_minor_version: 0,
            so_linger: Some(Duration::from_secs(3)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = FxHashSet::default();
        for station in &self.stations {
            if station.station_name.trim().is_empty() {
                bail!("station name must not be empty");
            }
            if !station.data_consumer_addr.is_ipv4() {
                bail!("data consumer address {} of station {} is not IPv4", station.data_consumer_addr, station.station_name);
            }
            if !names.insert(station.station_name.as_str()) {
                bail!("station {} is registered more than once", station.station_name);
            }
        }
        Ok(())
    }

    fn frame_factory(&self) -> anyhow::Result<FrameFactory> {
        FrameFactory::builder()
            .auth_key_id(self.auth_key_id)
            .frame_creator(&self.frame_creator)
            .frame_destination(&self.frame_destination)
            .protocol_version(self.protocol_major_version, self.protocol_minor_version)
            .responder_name(&self.responder_name)
            .responder_type(&self.responder_type)
            .service_type(self.service_type)
            .build()
    }
}

/// The connection manager: answers a station's CONNECTION_REQUEST with the address of the data
///  consumer that is responsible for it.
pub struct ConnMan {
    config: ConnManConfig,
    listener: TcpListener,
    stations: Arc<FxHashMap<String, StationRegistration>>,
    factory: Arc<FrameFactory>,
    shutdown: CancellationToken,
}

impl ConnMan {
    pub async fn bind(config: ConnManConfig) -> anyhow::Result<ConnMan> {
        config.validate()?;
        let factory = Arc::new(config.frame_factory()?);

        let mut stations = FxHashMap::default();
        for station in &config.stations {
            if !station.acquired {
                info!("station {} is configured to not be acquired, ignoring its connection requests", station.station_name);
            }
            stations.insert(station.station_name.clone(), station.clone());
        }

        let listener = transport::listen(config.connman_addr).await?;
        Ok(ConnMan {
            config,
            listener,
            stations: Arc::new(stations),
            factory,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("connection manager listening on {:?} for {} stations", self.local_addr()?, self.stations.len());
        loop {
            let accepted = select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = transport::accept(&self.listener, self.config.so_linger) => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accepting connection failed: {}", e);
                    sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let stations = self.stations.clone();
            let factory = self.factory.clone();
            let max_frame_size = self.config.max_frame_size;
            let cancel = self.shutdown.child_token();
            tokio::spawn(async move {
                match handle_connection(addr, stream, stations, factory, max_frame_size, cancel).await {
                    Ok(_) => {}
                    Err(e) => warn!("connection from {} broke with an error: {}", addr, e),
                }
            });
        }
        info!("connection manager shut down");
        Ok(())
    }
}

#[instrument(name="connman_connection", skip_all, fields(addr = format!("{:?}", _addr)))]
async fn handle_connection(
    _addr: SocketAddr,
    stream: TcpStream,
    stations: Arc<FxHashMap<String, StationRegistration>>,
    factory: Arc<FrameFactory>,
    max_frame_size: usize,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!("a data provider connected, presumably to set up a new data stream");
    let socket = Cd11Socket::new(stream, max_frame_size)?;

    while let Some(read) = socket.read_frame(&cancel).instrument(Span::current()).await? {
        match read {
            ReadResult::Frame(frame) => {
                if let Some(response) = handle_frame(&frame, &stations, &factory)? {
                    socket.write_frame(&response).await?;
                }
            }
            ReadResult::Malformed(partial) => error!("error parsing frame: {}", partial),
        }
    }
    debug!("connection closed");
    Ok(())
}

fn handle_frame(frame: &Frame, stations: &FxHashMap<String, StationRegistration>, factory: &FrameFactory) -> anyhow::Result<Option<Frame>> {
    if !frame.is_valid_crc() {
        error!("CRC check failed for {} frame", frame.frame_type());
    }

    let request = match frame.body() {
        FrameBody::ConnectionRequest(request) => request,
        _ => {
            debug!("expected CONNECTION_REQUEST, but received {} - ignoring it", frame.frame_type());
            return Ok(None);
        }
    };
    response_for(request, stations, factory)
}

fn response_for(request: &ConnectionExchange, stations: &FxHashMap<String, StationRegistration>, factory: &FrameFactory) -> anyhow::Result<Option<Frame>> {
    info!("received connection request for station {} at {}:{}", request.name, request.ip, request.port);

    let station = match stations.get(&request.name) {
        None => {
            warn!("connection request from station {} that has no active configuration - ignoring it", request.name);
            return Ok(None);
        }
        Some(station) if !station.acquired => {
            debug!("connection request for station {} is ignored", request.name);
            return Ok(None);
        }
        Some(station) => station,
    };

    let ip = match station.data_consumer_addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };
    info!("redirecting station {} to {}:{}", request.name, ip, station.data_consumer_addr.port());
    let response = factory.create_connection_response(ip, station.data_consumer_addr.port(), None)?;
    Ok(Some(response))
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::time::timeout;

    fn registration(name: &str, port: u16, acquired: bool) -> StationRegistration {
        StationRegistration {
            station_name: name.to_string(),
            data_consumer_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), port),
            acquired,
        }
    }

    fn stations() -> FxHashMap<String, StationRegistration> {
        let mut stations = FxHashMap::default();
        stations.insert("STA01".to_string(), registration("STA01", 8101, true));
        stations.insert("STA02".to_string(), registration("STA02", 8102, false));
        stations
    }

    fn request_from(station: &str) -> Frame {
        FrameFactory::builder()
            .responder_name(station)
            .responder_type("IMS")
            .build()
            .unwrap()
            .create_connection_request(Ipv4Addr::new(10, 0, 0, 9), 4000, None)
            .unwrap()
    }

    #[test]
    fn test_known_station_is_redirected() {
        let factory = ConnManConfig::new("127.0.0.1:0".parse().unwrap()).frame_factory().unwrap();
        let response = handle_frame(&request_from("STA01"), &stations(), &factory).unwrap().unwrap();

        assert_eq!(response.trailer().auth_key_id, 7);
        match response.body() {
            FrameBody::ConnectionResponse(body) => {
                assert_eq!((body.major_version, body.minor_version), (2, 0));
                assert_eq!(body.name, "TEST");
                assert_eq!(body.kind, "IDC");
                assert_eq!(body.ip, Ipv4Addr::new(10, 0, 0, 5));
                assert_eq!(body.port, 8101);
                assert_eq!(body.secondary, None);
            }
            other => panic!("expected CONNECTION_RESPONSE, got {:?}", other),
        }
    }

    #[rstest]
    #[case::not_acquired("STA02")]
    #[case::unknown("STA99")]
    fn test_no_response(#[case] station: &str) {
        let factory = ConnManConfig::new("127.0.0.1:0".parse().unwrap()).frame_factory().unwrap();
        assert!(handle_frame(&request_from(station), &stations(), &factory).unwrap().is_none());
    }

    #[test]
    fn test_other_frames_are_ignored() {
        let factory = ConnManConfig::new("127.0.0.1:0".parse().unwrap()).frame_factory().unwrap();
        let alert = factory.create_alert("hi").unwrap();
        assert!(handle_frame(&alert, &stations(), &factory).unwrap().is_none());
    }

    #[rstest]
    #[case::empty_name(registration(" ", 1, true))]
    #[case::ipv6(StationRegistration { station_name: "STA03".to_string(), data_consumer_addr: "[::1]:8000".parse().unwrap(), acquired: true })]
    #[case::duplicate(registration("STA01", 1, true))]
    fn test_invalid_config(#[case] station: StationRegistration) {
        let mut config = ConnManConfig::new("127.0.0.1:0".parse().unwrap());
        config.stations.push(registration("STA01", 8101, true));
        config.stations.push(station);
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_over_tcp() {
        let mut config = ConnManConfig::new("127.0.0.1:0".parse().unwrap());
        config.stations.push(registration("STA01", 8101, true));
        let connman = Arc::new(ConnMan::bind(config).await.unwrap());
        let addr = connman.local_addr().unwrap();
        let run = tokio::spawn({
            let connman = connman.clone();
            async move { connman.run().await }
        });

        let stream = transport::connect(addr, Some(Duration::ZERO), None).await.unwrap();
        let socket = Cd11Socket::new(stream, DEFAULT_MAX_FRAME_SIZE).unwrap();
        socket.write_raw(&[0xffu8; 36]).await.unwrap();
        socket.write_frame(&request_from("STA99")).await.unwrap();
        socket.write_frame(&request_from("STA01")).await.unwrap();

        let cancel = CancellationToken::new();
        match timeout(Duration::from_secs(5), socket.read_frame(&cancel)).await.unwrap().unwrap() {
            Some(ReadResult::Frame(frame)) => assert!(matches!(frame.body(), FrameBody::ConnectionResponse(b) if b.port == 8101)),
            other => panic!("expected CONNECTION_RESPONSE, got {:?}", other),
        }

        connman.shutdown_token().cancel();
        run.await.unwrap().unwrap();
    }
}
