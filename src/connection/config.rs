use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;

use crate::factory::{FrameFactory, FrameFactoryBuilder};
use crate::frames::connection::ServiceType;
use crate::frames::stream_decoder::DEFAULT_MAX_FRAME_SIZE;

/// Configuration of the data consumer for a single station
#[derive(Debug, Clone)]
pub struct DataConsumerConfig {
    pub station_name: String,
    pub data_consumer_addr: SocketAddr,
    /// if set, connections from other addresses are logged as suspicious, but still accepted
    pub expected_data_provider_ip: Option<IpAddr>,

    pub frame_creator: String,
    pub frame_destination: String,
    pub responder_name: String,
    pub responder_type: String,
    pub service_type: ServiceType,
    pub auth_key_id: i32,
    pub protocol_major_version: i16,
    pub protocol_minor_version: i16,

    /// CD-1.1 expects an ACKNACK at least once per minute
    pub acknack_interval: Duration,
    /// the connection is closed if nothing was received from the peer for this long
    pub connection_expired_limit: Duration,
    pub gap_store_interval: Duration,
    /// gaps that have not changed for this long are dropped, `None` keeps them forever
    pub gap_expiration: Option<Duration>,
    /// upper bound for sending the final ALERT and closing the socket
    pub dispose_timeout: Duration,
    pub so_linger: Option<Duration>,

    /// maximum number of received DATA frames waiting for the publisher
    pub publisher_queue_capacity: usize,
    pub max_frame_size: usize,

    /// whether CUSTOM_RESET_FRAME is honored - it is a private extension of CD-1.1
    pub custom_reset_enabled: bool,

    /// directory for persisted gap state, `None` for in-memory only
    pub gap_state_dir: Option<PathBuf>,
}

impl DataConsumerConfig {
    pub fn new(station_name: &str, data_consumer_addr: SocketAddr) -> DataConsumerConfig {
        DataConsumerConfig {
            station_name: station_name.to_string(),
            data_consumer_addr,
            expected_data_provider_ip: None,
            frame_creator: "TEST".to_string(),
            frame_destination: "0".to_string(),
            responder_name: "DC".to_string(),
            responder_type: "IDC".to_string(),
            service_type: ServiceType::Tcp,
            auth_key_id: 0,
            protocol_major_version: 1,
            protocol_minor_version: 1,
            acknack_interval: Duration::from_secs(55),
            connection_expired_limit: Duration::from_secs(120),
            gap_store_interval: Duration::from_secs(5 * 60),
            gap_expiration: None,
            dispose_timeout: Duration::from_secs(10),
            so_linger: Some(Duration::from_secs(3)),
            publisher_queue_capacity: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            custom_reset_enabled: true,
            gap_state_dir: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.station_name.trim().is_empty() {
            bail!("station name must not be empty");
        }
        if self.acknack_interval.is_zero() {
            bail!("acknack interval must be positive");
        }
        if self.connection_expired_limit <= self.acknack_interval {
            bail!("connection expired limit ({:?}) must be greater than the acknack interval ({:?})", self.connection_expired_limit, self.acknack_interval);
        }
        if self.gap_store_interval.is_zero() {
            bail!("gap store interval must be positive");
        }
        if self.publisher_queue_capacity == 0 {
            bail!("publisher queue capacity must be positive");
        }
        if self.max_frame_size < 64 {
            bail!("max frame size of {} is too small for any frame", self.max_frame_size);
        }
        Ok(())
    }

    pub fn frame_factory_builder(&self) -> FrameFactoryBuilder {
        FrameFactory::builder()
            .auth_key_id(self.auth_key_id)
            .frame_creator(&self.frame_creator)
            .frame_destination(&self.frame_destination)
            .protocol_version(self.protocol_major_version, self.protocol_minor_version)
            .responder_name(&self.responder_name)
            .responder_type(&self.responder_type)
            .service_type(self.service_type)
    }
}
