use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};

use crate::connection::cd11_socket::Cd11Socket;
use crate::frames::channel_subframe::{ChannelSubframe, CompressionFormat, DataFormat, SensorType};
use crate::frames::stream_decoder::DEFAULT_MAX_FRAME_SIZE;
use crate::util::julian_date::from_epoch_millis;

const CHANNEL_STATUS_LEN: usize = 8;
const AUTH_VALUE_LEN: usize = 0;

/// an unauthenticated s4 subframe with `data_len` data bytes and self-consistent length fields
pub fn test_subframe(site: &str, channel: &str, data_len: usize) -> ChannelSubframe {
    let data: Vec<u8> = (0..data_len).map(|i| (i % 251) as u8).collect();
    let mut subframe = ChannelSubframe {
        channel_length: 0,
        auth_offset: 0,
        authenticated: false,
        compression: CompressionFormat::None,
        sensor_type: SensorType::Seismic,
        is_calibration: false,
        site: site.to_string(),
        channel: channel.to_string(),
        location: "".to_string(),
        data_format: DataFormat::S4,
        calibration_factor: 1.5,
        calibration_period: 1.0,
        timestamp: from_epoch_millis(1_600_000_000_123),
        subframe_time_length_ms: 10_000,
        samples: (data_len / 4) as i32,
        channel_status: Bytes::from(vec![1u8; CHANNEL_STATUS_LEN]),
        data: Bytes::from(data),
        subframe_count: 0,
        auth_key_id: 0,
        auth_value: Bytes::from(vec![0u8; AUTH_VALUE_LEN]),
    };
    subframe.channel_length = subframe.wire_len() as i32;
    // authentication key id and size, the authentication value is empty
    subframe.auth_offset = subframe.channel_length - 8;
    subframe
}

/// two connected sockets over loopback
pub async fn socket_pair() -> (Cd11Socket, Cd11Socket) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connected, accepted) = tokio::join!(
        TcpStream::connect(addr),
        listener.accept(),
    );
    let a = Cd11Socket::new(connected.unwrap(), DEFAULT_MAX_FRAME_SIZE).unwrap();
    let b = Cd11Socket::new(accepted.unwrap().0, DEFAULT_MAX_FRAME_SIZE).unwrap();
    (a, b)
}
