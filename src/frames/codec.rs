use std::fmt::{Display, Formatter};

use anyhow::{anyhow, bail};
use bytes::{Buf, Bytes};

use crate::frames::frame_type::FrameType;
use crate::frames::header::{Header, HEADER_LENGTH};
use crate::frames::trailer::Trailer;
use crate::frames::{crc, Frame, FrameBody};

/// Whatever could be salvaged from bytes that did not parse into a [Frame]. This is the
///  MALFORMED_FRAME case: it is routed to diagnostics rather than ending the connection.
#[derive(Debug)]
pub struct PartialFrame {
    pub header: Option<Header>,
    pub body: Option<Bytes>,
    pub trailer: Option<Trailer>,
    pub error: anyhow::Error,
    pub raw: Bytes,
}

impl PartialFrame {
    pub fn frame_type(&self) -> FrameType {
        FrameType::MalformedFrame
    }

    /// the frame type the header claims, if the header could be read
    pub fn claimed_frame_type(&self) -> Option<FrameType> {
        self.header.as_ref().map(|h| h.frame_type)
    }

    pub fn is_valid_crc(&self) -> bool {
        crc::is_valid_crc(&self.raw)
    }
}

impl Display for PartialFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.claimed_frame_type() {
            Some(frame_type) => write!(f, "malformed {} frame ({} bytes): {}", frame_type, self.raw.len(), self.error),
            None => write!(f, "malformed frame ({} bytes): {}", self.raw.len(), self.error),
        }
    }
}

pub fn decode_header(buf: &mut impl Buf) -> anyhow::Result<Header> {
    Header::try_deser(buf)
}

pub fn decode_body(body: Bytes, header: &Header) -> anyhow::Result<FrameBody> {
    if body.len() != header.body_len() {
        bail!("{} frame body should be {} bytes, was {}", header.frame_type, header.body_len(), body.len());
    }
    FrameBody::try_deser(header.frame_type, body)
}

pub fn decode_trailer(buf: &mut impl Buf) -> anyhow::Result<Trailer> {
    Trailer::try_deser(buf)
}

pub fn encode(frame: &Frame) -> Bytes {
    frame.to_bytes()
}

/// Parses a buffer holding exactly one frame. Failures keep the parts that were read successfully.
pub fn parse_frame(raw: Bytes) -> Result<Frame, PartialFrame> {
    let mut partial = PartialFrame {
        header: None,
        body: None,
        trailer: None,
        error: anyhow!("incomplete frame"),
        raw: raw.clone(),
    };

    let header = match decode_header(&mut raw.slice(..)) {
        Ok(header) => header,
        Err(e) => {
            partial.error = e;
            return Err(partial);
        }
    };
    partial.header = Some(header.clone());

    if raw.len() < header.trailer_offset {
        partial.error = anyhow!("frame of {} bytes ends before its trailer offset {}", raw.len(), header.trailer_offset);
        return Err(partial);
    }
    let body = raw.slice(HEADER_LENGTH..header.trailer_offset);
    partial.body = Some(body.clone());

    let mut trailer_buf = raw.slice(header.trailer_offset..);
    let trailer = match decode_trailer(&mut trailer_buf) {
        Ok(trailer) => trailer,
        Err(e) => {
            partial.error = e;
            return Err(partial);
        }
    };
    partial.trailer = Some(trailer.clone());

    if trailer_buf.has_remaining() {
        partial.error = anyhow!("{} bytes after the frame trailer", trailer_buf.remaining());
        return Err(partial);
    }

    match decode_body(body, &header) {
        Ok(body) => Ok(Frame::from_parsed(header, body, trailer, raw)),
        Err(e) => {
            partial.error = e;
            Err(partial)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FrameFactory;
    use crate::frames::alert::Alert;
    use crate::test_util::test_subframe;
    use bytes::BytesMut;
    use std::net::Ipv4Addr;

    fn factory() -> FrameFactory {
        FrameFactory::builder().build().unwrap()
    }

    fn frames() -> Vec<Frame> {
        let factory = factory();
        vec![
            factory.create_connection_request(Ipv4Addr::new(10, 0, 0, 1), 8000, None).unwrap(),
            factory.create_connection_response(Ipv4Addr::new(10, 0, 0, 2), 8001, Some((Ipv4Addr::new(10, 0, 0, 3), 8002))).unwrap(),
            factory.create_option_request(1, "Station").unwrap(),
            factory.create_option_response(1, "STA").unwrap(),
            factory.create_data(vec![test_subframe("STA", "BHZ", 40), test_subframe("STA", "BHE", 41)], 17).unwrap(),
            factory.create_acknack("TEST:0", 1, 9, vec![(3, 4), (6, 6)]).unwrap(),
            factory.create_alert("Shutting down connection").unwrap(),
            factory.create_custom_reset().unwrap(),
            factory.create_cd1_encapsulation(Bytes::from_static(b"cd1 payload"), 3).unwrap(),
        ]
    }

    #[test]
    fn test_parse_round_trip() {
        for frame in frames() {
            let parsed = parse_frame(frame.to_bytes()).unwrap();
            assert_eq!(parsed, frame);
            assert!(parsed.is_valid_crc());
        }
    }

    #[test]
    fn test_truncated_frames_are_partial() {
        for frame in frames() {
            let raw = frame.to_bytes();
            for len in [0, 10, HEADER_LENGTH, frame.header().trailer_offset, raw.len() - 1] {
                let partial = parse_frame(raw.slice(..len)).unwrap_err();
                assert_eq!(partial.frame_type(), FrameType::MalformedFrame);
                assert_eq!(partial.raw.len(), len);
                assert_eq!(partial.header.is_some(), len >= HEADER_LENGTH);
            }
        }
    }

    #[test]
    fn test_trailing_bytes() {
        let mut raw = BytesMut::from(&factory().create_alert("bye").unwrap().to_bytes()[..]);
        raw.extend_from_slice(b"\0\0\0\0");
        let partial = parse_frame(raw.freeze()).unwrap_err();
        assert!(partial.header.is_some());
        assert!(partial.trailer.is_some());
    }

    #[test]
    fn test_broken_body_keeps_header_and_trailer() {
        let frame = factory().create_alert("bye").unwrap();
        let mut raw = BytesMut::from(&frame.to_bytes()[..]);
        // negative alert size
        raw[HEADER_LENGTH] = 0xff;

        let partial = parse_frame(raw.freeze()).unwrap_err();
        assert_eq!(partial.claimed_frame_type(), Some(FrameType::Alert));
        assert_eq!(partial.header.as_ref(), Some(frame.header()));
        assert_eq!(partial.trailer.as_ref().map(|t| t.auth_key_id), Some(0));
        assert!(!partial.is_valid_crc());
    }

    #[test]
    fn test_crc_mismatch_still_parses() {
        let frame = factory().create_alert("bye").unwrap();
        let mut raw = BytesMut::from(&frame.to_bytes()[..]);
        let len = raw.len();
        raw[len - 1] ^= 0x01;

        let parsed = parse_frame(raw.freeze()).unwrap();
        assert!(!parsed.is_valid_crc());
        assert_eq!(parsed.body(), &FrameBody::Alert(Alert::new("bye").unwrap()));
    }

    #[test]
    fn test_body_length_mismatch() {
        let header = factory().create_alert("bye").unwrap().header().clone();
        assert!(decode_body(Bytes::from_static(b"\0\0\0\x03bye\0\0"), &header).is_err());
    }
}
