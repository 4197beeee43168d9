use std::net::Ipv4Addr;
use std::sync::RwLock;

use anyhow::bail;
use bytes::Bytes;

use crate::frames::acknack::{Acknack, FRAMESET_ACKED_LEN};
use crate::frames::alert::Alert;
use crate::frames::cd1_encapsulation::Cd1Encapsulation;
use crate::frames::channel_subframe::ChannelSubframe;
use crate::frames::command::{CommandRequest, CommandResponse, CommandTarget};
use crate::frames::connection::{ConnectionExchange, ServiceType, KIND_LEN, NAME_LEN};
use crate::frames::data::DataFrame;
use crate::frames::header::{CREATOR_LEN, DESTINATION_LEN};
use crate::frames::option::OptionExchange;
use crate::frames::reset::CustomReset;
use crate::frames::{Frame, FrameBody};
use crate::gaps::gap_tracker::GapTracker;

/// sequence number of frames that are not part of the numbered data stream
const CONTROL_SEQUENCE_NUMBER: u64 = 0;

pub struct FrameFactoryBuilder {
    auth_key_id: i32,
    frame_creator: String,
    frame_destination: String,
    major_version: i16,
    minor_version: i16,
    responder_name: String,
    responder_type: String,
    service_type: ServiceType,
    frameset_acked: Option<String>,
}

impl FrameFactoryBuilder {
    pub fn auth_key_id(mut self, auth_key_id: i32) -> Self {
        self.auth_key_id = auth_key_id;
        self
    }

    pub fn frame_creator(mut self, frame_creator: &str) -> Self {
        self.frame_creator = frame_creator.to_string();
        self
    }

    pub fn frame_destination(mut self, frame_destination: &str) -> Self {
        self.frame_destination = frame_destination.to_string();
        self
    }

    pub fn protocol_version(mut self, major: i16, minor: i16) -> Self {
        self.major_version = major;
        self.minor_version = minor;
        self
    }

    pub fn responder_name(mut self, responder_name: &str) -> Self {
        self.responder_name = responder_name.to_string();
        self
    }

    pub fn responder_type(mut self, responder_type: &str) -> Self {
        self.responder_type = responder_type.to_string();
        self
    }

    pub fn service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    /// defaults to `creator:destination`
    pub fn frameset_acked(mut self, frameset_acked: &str) -> Self {
        self.frameset_acked = Some(frameset_acked.to_string());
        self
    }

    pub fn build(self) -> anyhow::Result<FrameFactory> {
        if self.frame_creator.len() > CREATOR_LEN {
            bail!("frame creator '{}' exceeds {} characters", self.frame_creator, CREATOR_LEN);
        }
        if self.frame_destination.len() > DESTINATION_LEN {
            bail!("frame destination '{}' exceeds {} characters", self.frame_destination, DESTINATION_LEN);
        }
        if self.responder_name.len() > NAME_LEN {
            bail!("responder name '{}' exceeds {} characters", self.responder_name, NAME_LEN);
        }
        if self.responder_type.len() > KIND_LEN {
            bail!("responder type '{}' exceeds {} characters", self.responder_type, KIND_LEN);
        }
        if self.major_version < 0 || self.minor_version < 0 {
            bail!("protocol version must be non-negative");
        }

        let frameset_acked = self.frameset_acked
            .unwrap_or_else(|| format!("{}:{}", self.frame_creator, self.frame_destination));
        if frameset_acked.len() > FRAMESET_ACKED_LEN {
            bail!("frameset acked '{}' exceeds {} characters", frameset_acked, FRAMESET_ACKED_LEN);
        }

        Ok(FrameFactory {
            auth_key_id: self.auth_key_id,
            frame_creator: self.frame_creator,
            frame_destination: self.frame_destination,
            major_version: self.major_version,
            minor_version: self.minor_version,
            responder_name: self.responder_name,
            responder_type: self.responder_type,
            service_type: self.service_type,
            frameset_acked: RwLock::new(frameset_acked),
        })
    }
}

/// Creates outgoing frames for one connection, filling in header and trailer (including the CRC).
///
/// The identity fields are fixed per connection, except for the 'frameset acked': that mirrors the
///  peer's `creator:destination` and is updated as soon as the peer's frames reveal it.
#[derive(Debug)]
pub struct FrameFactory {
    auth_key_id: i32,
    frame_creator: String,
    frame_destination: String,
    major_version: i16,
    minor_version: i16,
    responder_name: String,
    responder_type: String,
    service_type: ServiceType,
    frameset_acked: RwLock<String>,
}

impl FrameFactory {
    pub fn builder() -> FrameFactoryBuilder {
        FrameFactoryBuilder {
            auth_key_id: 0,
            frame_creator: "TEST".to_string(),
            frame_destination: "0".to_string(),
            major_version: 1,
            minor_version: 1,
            responder_name: "DC".to_string(),
            responder_type: "IDC".to_string(),
            service_type: ServiceType::Tcp,
            frameset_acked: None,
        }
    }

    pub fn frame_creator(&self) -> &str {
        &self.frame_creator
    }

    pub fn frame_destination(&self) -> &str {
        &self.frame_destination
    }

    pub fn protocol_version(&self) -> (i16, i16) {
        (self.major_version, self.minor_version)
    }

    pub fn frameset_acked(&self) -> String {
        self.frameset_acked.read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_frameset_acked(&self, frameset_acked: &str) -> anyhow::Result<()> {
        if frameset_acked.len() > FRAMESET_ACKED_LEN {
            bail!("frameset acked '{}' exceeds {} characters", frameset_acked, FRAMESET_ACKED_LEN);
        }
        let mut current = self.frameset_acked.write()
            .unwrap_or_else(|e| e.into_inner());
        if *current != frameset_acked {
            *current = frameset_acked.to_string();
        }
        Ok(())
    }

    fn create(&self, sequence_number: u64, body: FrameBody) -> anyhow::Result<Frame> {
        Frame::with_computed_crc(
            &self.frame_creator,
            &self.frame_destination,
            sequence_number,
            0,
            body,
            self.auth_key_id,
            Bytes::new(),
        )
    }

    pub fn create_acknack(&self, frameset_acked: &str, lowest_seq: u64, highest_seq: u64, gaps: Vec<(u64, u64)>) -> anyhow::Result<Frame> {
        self.create(CONTROL_SEQUENCE_NUMBER, FrameBody::Acknack(Acknack {
            frameset_acked: frameset_acked.to_string(),
            lowest_seq,
            highest_seq,
            gaps,
        }))
    }

    /// an ACKNACK for the current frameset acked, reporting the tracker's state
    pub fn create_acknack_from_tracker(&self, tracker: &GapTracker) -> anyhow::Result<Frame> {
        let snapshot = tracker.acknack_snapshot();
        self.create_acknack(&self.frameset_acked(), snapshot.lowest_seq, snapshot.highest_seq, snapshot.gaps)
    }

    pub fn create_alert(&self, message: &str) -> anyhow::Result<Frame> {
        self.create(CONTROL_SEQUENCE_NUMBER, FrameBody::Alert(Alert::new(message)?))
    }

    fn connection_exchange(&self, ip: Ipv4Addr, port: u16, secondary: Option<(Ipv4Addr, u16)>) -> ConnectionExchange {
        ConnectionExchange {
            major_version: self.major_version,
            minor_version: self.minor_version,
            name: self.responder_name.clone(),
            kind: self.responder_type.clone(),
            service_type: self.service_type,
            ip,
            port,
            secondary,
        }
    }

    pub fn create_connection_request(&self, ip: Ipv4Addr, port: u16, secondary: Option<(Ipv4Addr, u16)>) -> anyhow::Result<Frame> {
        let body = self.connection_exchange(ip, port, secondary);
        self.create(CONTROL_SEQUENCE_NUMBER, FrameBody::ConnectionRequest(body))
    }

    pub fn create_connection_response(&self, ip: Ipv4Addr, port: u16, secondary: Option<(Ipv4Addr, u16)>) -> anyhow::Result<Frame> {
        let body = self.connection_exchange(ip, port, secondary);
        self.create(CONTROL_SEQUENCE_NUMBER, FrameBody::ConnectionResponse(body))
    }

    pub fn create_option_request(&self, option_type: i32, value: &str) -> anyhow::Result<Frame> {
        self.create(CONTROL_SEQUENCE_NUMBER, FrameBody::OptionRequest(OptionExchange::new(option_type, value)?))
    }

    pub fn create_option_response(&self, option_type: i32, value: &str) -> anyhow::Result<Frame> {
        self.create(CONTROL_SEQUENCE_NUMBER, FrameBody::OptionResponse(OptionExchange::new(option_type, value)?))
    }

    pub fn create_command_request(&self, target: CommandTarget, command: &str) -> anyhow::Result<Frame> {
        self.create(CONTROL_SEQUENCE_NUMBER, FrameBody::CommandRequest(CommandRequest {
            target,
            command: command.to_string(),
        }))
    }

    pub fn create_command_response(&self, target: CommandTarget, request_message: &str, response_message: &str) -> anyhow::Result<Frame> {
        self.create(CONTROL_SEQUENCE_NUMBER, FrameBody::CommandResponse(CommandResponse {
            target,
            request_message: request_message.to_string(),
            response_message: response_message.to_string(),
        }))
    }

    pub fn create_data(&self, subframes: Vec<ChannelSubframe>, sequence_number: u64) -> anyhow::Result<Frame> {
        self.create(sequence_number, FrameBody::Data(DataFrame::from_subframes(subframes)?))
    }

    pub fn create_custom_reset(&self) -> anyhow::Result<Frame> {
        self.create(CONTROL_SEQUENCE_NUMBER, FrameBody::CustomReset(CustomReset::default()))
    }

    pub fn create_cd1_encapsulation(&self, payload: Bytes, sequence_number: u64) -> anyhow::Result<Frame> {
        self.create(sequence_number, FrameBody::Cd1Encapsulation(Cd1Encapsulation { payload }))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::frame_type::FrameType;
    use crate::frames::header::HEADER_LENGTH;
    use crate::util::julian_date::from_epoch_millis;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let factory = FrameFactory::builder().build().unwrap();
        assert_eq!(factory.frame_creator(), "TEST");
        assert_eq!(factory.frame_destination(), "0");
        assert_eq!(factory.protocol_version(), (1, 1));
        assert_eq!(factory.frameset_acked(), "TEST:0");

        let frame = factory.create_connection_response(Ipv4Addr::LOCALHOST, 8100, None).unwrap();
        match frame.body() {
            FrameBody::ConnectionResponse(body) => {
                assert_eq!(body.name, "DC");
                assert_eq!(body.kind, "IDC");
                assert_eq!(body.service_type, ServiceType::Tcp);
                assert_eq!((body.major_version, body.minor_version), (1, 1));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_header_and_trailer() {
        let factory = FrameFactory::builder()
            .auth_key_id(7)
            .frame_creator("STA01")
            .frame_destination("DC")
            .build()
            .unwrap();
        let frame = factory.create_alert("bye").unwrap();

        let header = frame.header();
        assert_eq!(header.frame_type, FrameType::Alert);
        assert_eq!(header.trailer_offset, HEADER_LENGTH + 8);
        assert_eq!(header.frame_creator, "STA01");
        assert_eq!(header.frame_destination, "DC");
        assert_eq!(header.sequence_number, 0);
        assert_eq!(frame.trailer().auth_key_id, 7);
        assert!(frame.trailer().auth_value.is_empty());
        assert!(frame.is_valid_crc());
    }

    #[test]
    fn test_data_sequence_number() {
        let factory = FrameFactory::builder().build().unwrap();
        let frame = factory.create_data(vec![crate::test_util::test_subframe("STA", "BHZ", 8)], 42).unwrap();
        assert_eq!(frame.sequence_number(), 42);
        assert!(factory.create_data(vec![], 43).is_err());
    }

    #[test]
    fn test_acknack_from_tracker() {
        let factory = FrameFactory::builder().build().unwrap();
        let tracker = GapTracker::new();
        for seq in [1, 2, 4] {
            tracker.add_sequence_number(seq);
        }
        factory.set_frameset_acked("STA01:DC").unwrap();

        let frame = factory.create_acknack_from_tracker(&tracker).unwrap();
        assert_eq!(frame.body(), &FrameBody::Acknack(Acknack {
            frameset_acked: "STA01:DC".to_string(),
            lowest_seq: 1,
            highest_seq: 4,
            gaps: vec![(3, 3)],
        }));
    }

    #[test]
    fn test_command_frames() {
        let factory = FrameFactory::builder().build().unwrap();
        let target = CommandTarget {
            station: "STA01".to_string(),
            site: "STA".to_string(),
            channel: "BHZ".to_string(),
            location: "".to_string(),
            timestamp: from_epoch_millis(1_600_000_000_000),
        };
        assert!(factory.create_command_request(target.clone(), "calib").unwrap().is_valid_crc());
        assert!(factory.create_command_response(target.clone(), "calib", "ok").unwrap().is_valid_crc());
        assert!(factory.create_command_request(target, "").is_err());
    }

    #[rstest]
    #[case::creator(FrameFactory::builder().frame_creator("NINECHARS"))]
    #[case::destination(FrameFactory::builder().frame_destination("NINECHARS"))]
    #[case::responder_name(FrameFactory::builder().responder_name("NINECHARS"))]
    #[case::responder_type(FrameFactory::builder().responder_type("FIVE_"))]
    #[case::version(FrameFactory::builder().protocol_version(-1, 0))]
    #[case::frameset_acked(FrameFactory::builder().frameset_acked("this is more than twenty"))]
    fn test_invalid_builder(#[case] builder: FrameFactoryBuilder) {
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_set_frameset_acked_too_long() {
        let factory = FrameFactory::builder().build().unwrap();
        assert!(factory.set_frameset_acked("this is more than twenty").is_err());
        assert_eq!(factory.frameset_acked(), "TEST:0");
    }

    #[test]
    fn test_invalid_inputs() {
        let factory = FrameFactory::builder().build().unwrap();
        assert!(factory.create_alert("").is_err());
        assert!(factory.create_option_request(2, "x").is_err());
        assert!(factory.create_option_response(1, "").is_err());
    }
}
