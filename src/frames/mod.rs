pub mod acknack;
pub mod alert;
pub mod cd1_encapsulation;
pub mod channel_subframe;
pub mod codec;
pub mod command;
pub mod connection;
pub mod crc;
pub mod data;
pub mod frame_type;
pub mod header;
pub mod option;
pub mod reset;
pub mod stream_decoder;
pub mod trailer;

use anyhow::bail;
use bytes::{Buf, Bytes, BytesMut};
use tracing::warn;

use crate::frames::acknack::Acknack;
use crate::frames::alert::Alert;
use crate::frames::cd1_encapsulation::Cd1Encapsulation;
use crate::frames::command::{CommandRequest, CommandResponse};
use crate::frames::connection::{ConnectionRequest, ConnectionResponse};
use crate::frames::data::DataFrame;
use crate::frames::frame_type::FrameType;
use crate::frames::header::{Header, HEADER_LENGTH};
use crate::frames::option::{OptionRequest, OptionResponse};
use crate::frames::reset::CustomReset;
use crate::frames::trailer::Trailer;

/// Type specific part of a frame. There is no variant for malformed frames: those never become a
///  [Frame], see [codec::PartialFrame].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    OptionRequest(OptionRequest),
    OptionResponse(OptionResponse),
    Data(DataFrame),
    Acknack(Acknack),
    Alert(Alert),
    CommandRequest(CommandRequest),
    CommandResponse(CommandResponse),
    Cd1Encapsulation(Cd1Encapsulation),
    CustomReset(CustomReset),
}

impl FrameBody {
    pub fn frame_type(&self) -> FrameType {
        match self {
            FrameBody::ConnectionRequest(_) => FrameType::ConnectionRequest,
            FrameBody::ConnectionResponse(_) => FrameType::ConnectionResponse,
            FrameBody::OptionRequest(_) => FrameType::OptionRequest,
            FrameBody::OptionResponse(_) => FrameType::OptionResponse,
            FrameBody::Data(_) => FrameType::Data,
            FrameBody::Acknack(_) => FrameType::Acknack,
            FrameBody::Alert(_) => FrameType::Alert,
            FrameBody::CommandRequest(_) => FrameType::CommandRequest,
            FrameBody::CommandResponse(_) => FrameType::CommandResponse,
            FrameBody::Cd1Encapsulation(_) => FrameType::Cd1Encapsulation,
            FrameBody::CustomReset(_) => FrameType::CustomResetFrame,
        }
    }

    /// Parses a body of exactly the length given by the header's trailer offset.
    pub fn try_deser(frame_type: FrameType, mut buf: Bytes) -> anyhow::Result<FrameBody> {
        let body = match frame_type {
            FrameType::ConnectionRequest => FrameBody::ConnectionRequest(ConnectionRequest::try_deser(&mut buf)?),
            FrameType::ConnectionResponse => FrameBody::ConnectionResponse(ConnectionResponse::try_deser(&mut buf)?),
            FrameType::OptionRequest => FrameBody::OptionRequest(OptionRequest::try_deser(&mut buf)?),
            FrameType::OptionResponse => FrameBody::OptionResponse(OptionResponse::try_deser(&mut buf)?),
            FrameType::Data => FrameBody::Data(DataFrame::try_deser(&mut buf)?),
            FrameType::Acknack => FrameBody::Acknack(Acknack::try_deser(&mut buf)?),
            FrameType::Alert => FrameBody::Alert(Alert::try_deser(&mut buf)?),
            FrameType::CommandRequest => FrameBody::CommandRequest(CommandRequest::try_deser(&mut buf)?),
            FrameType::CommandResponse => FrameBody::CommandResponse(CommandResponse::try_deser(&mut buf)?),
            FrameType::Cd1Encapsulation => FrameBody::Cd1Encapsulation(Cd1Encapsulation::deser(&mut buf)),
            FrameType::CustomResetFrame => FrameBody::CustomReset(CustomReset::deser(&mut buf)),
            FrameType::MalformedFrame => bail!("{} is not a frame type that can be parsed", frame_type),
        };

        if buf.has_remaining() {
            warn!("{} frame body has {} trailing bytes", frame_type, buf.remaining());
        }
        Ok(body)
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        match self {
            FrameBody::ConnectionRequest(b) => b.ser(buf),
            FrameBody::ConnectionResponse(b) => b.ser(buf),
            FrameBody::OptionRequest(b) => b.ser(buf),
            FrameBody::OptionResponse(b) => b.ser(buf),
            FrameBody::Data(b) => b.ser(buf),
            FrameBody::Acknack(b) => b.ser(buf),
            FrameBody::Alert(b) => b.ser(buf),
            FrameBody::CommandRequest(b) => b.ser(buf),
            FrameBody::CommandResponse(b) => b.ser(buf),
            FrameBody::Cd1Encapsulation(b) => {
                b.ser(buf);
                Ok(())
            }
            FrameBody::CustomReset(b) => {
                b.ser(buf);
                Ok(())
            }
        }
    }
}

/// A complete, immutable CD-1.1 frame. It is either parsed from the wire or assembled by the
///  [crate::factory::FrameFactory], and always has both header and trailer. `raw` holds the exact
///  serialized bytes, so CRC checks and re-sending work on what was actually received or built.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    header: Header,
    body: FrameBody,
    trailer: Trailer,
    raw: Bytes,
}

impl Frame {
    /// Assembles a frame from its parts as given, without touching the comm verification field.
    pub fn new(header: Header, body: FrameBody, trailer: Trailer) -> anyhow::Result<Frame> {
        let raw = Self::encode(&header, &body, &trailer)?;
        Ok(Frame {
            header,
            body,
            trailer,
            raw: raw.freeze(),
        })
    }

    /// Assembles a frame, deriving the trailer offset from the body and computing the CRC over the
    ///  serialized frame.
    pub fn with_computed_crc(
        frame_creator: &str,
        frame_destination: &str,
        sequence_number: u64,
        series: i32,
        body: FrameBody,
        auth_key_id: i32,
        auth_value: Bytes,
    ) -> anyhow::Result<Frame> {
        let mut body_buf = BytesMut::new();
        body.ser(&mut body_buf)?;

        let header = Header {
            frame_type: body.frame_type(),
            trailer_offset: HEADER_LENGTH + body_buf.len(),
            frame_creator: frame_creator.to_string(),
            frame_destination: frame_destination.to_string(),
            sequence_number,
            series,
        };
        let mut trailer = Trailer {
            auth_key_id,
            auth_value,
            comm_verification: 0,
        };

        let mut raw = Self::encode(&header, &body, &trailer)?;
        trailer.comm_verification = crc::patch_crc(&mut raw);

        Ok(Frame {
            header,
            body,
            trailer,
            raw: raw.freeze(),
        })
    }

    /// for the codec, which has already validated the parts against `raw`
    pub(crate) fn from_parsed(header: Header, body: FrameBody, trailer: Trailer, raw: Bytes) -> Frame {
        Frame {
            header,
            body,
            trailer,
            raw,
        }
    }

    fn encode(header: &Header, body: &FrameBody, trailer: &Trailer) -> anyhow::Result<BytesMut> {
        if header.frame_type != body.frame_type() {
            bail!("header frame type {} does not match body frame type {}", header.frame_type, body.frame_type());
        }

        let mut buf = BytesMut::with_capacity(header.trailer_offset + trailer.wire_len());
        header.ser(&mut buf)?;
        body.ser(&mut buf)?;
        if buf.len() != header.trailer_offset {
            bail!("trailer offset {} does not match header length {} + body length {}",
                header.trailer_offset, HEADER_LENGTH, buf.len() - HEADER_LENGTH);
        }
        trailer.ser(&mut buf)?;
        Ok(buf)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &FrameBody {
        &self.body
    }

    pub fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.header.sequence_number
    }

    pub fn to_bytes(&self) -> Bytes {
        self.raw.clone()
    }

    pub fn is_valid_crc(&self) -> bool {
        crc::is_valid_crc(&self.raw)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn alert_header(trailer_offset: usize) -> Header {
        Header {
            frame_type: FrameType::Alert,
            trailer_offset,
            frame_creator: "TEST".to_string(),
            frame_destination: "0".to_string(),
            sequence_number: 0,
            series: 0,
        }
    }

    fn trailer() -> Trailer {
        Trailer {
            auth_key_id: 0,
            auth_value: Bytes::new(),
            comm_verification: 0,
        }
    }

    #[test]
    fn test_new_checks_type() {
        let mut header = alert_header(HEADER_LENGTH + 8);
        header.frame_type = FrameType::Acknack;
        let body = FrameBody::Alert(Alert::new("bye").unwrap());
        assert!(Frame::new(header, body, trailer()).is_err());
    }

    #[test]
    fn test_new_checks_trailer_offset() {
        let body = FrameBody::Alert(Alert::new("bye").unwrap());
        assert!(Frame::new(alert_header(HEADER_LENGTH + 12), body.clone(), trailer()).is_err());
        assert!(Frame::new(alert_header(HEADER_LENGTH + 8), body, trailer()).is_ok());
    }

    #[test]
    fn test_with_computed_crc() {
        let body = FrameBody::Alert(Alert::new("bye").unwrap());
        let frame = Frame::with_computed_crc("TEST", "0", 5, 0, body.clone(), 7, Bytes::new()).unwrap();

        assert_eq!(frame.header().trailer_offset, HEADER_LENGTH + 8);
        assert_eq!(frame.frame_type(), FrameType::Alert);
        assert_eq!(frame.sequence_number(), 5);
        assert!(frame.is_valid_crc());
        assert_eq!(frame.to_bytes().len(), HEADER_LENGTH + 8 + 16);

        let unchecked = Frame::new(frame.header().clone(), body, trailer()).unwrap();
        assert!(!unchecked.is_valid_crc());
    }
}
