use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::frames::frame_type::FrameType;
use crate::util::buf_ext::{Cd11BufExt, Cd11BufMutExt};

pub const HEADER_LENGTH: usize = 36;
pub const CREATOR_LEN: usize = 8;
pub const DESTINATION_LEN: usize = 8;

/// Fixed size frame header, all numbers big endian:
///
/// ```ascii
///  0: frame type (i32)
///  4: trailer offset (i32) - byte offset of the trailer from the start of the frame, i.e.
///      header length + body length
///  8: frame creator (char[8])
/// 16: frame destination (char[8])
/// 24: sequence number (i64, compared as unsigned)
/// 32: series (i32)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Header {
    pub frame_type: FrameType,
    pub trailer_offset: usize,
    pub frame_creator: String,
    pub frame_destination: String,
    pub sequence_number: u64,
    pub series: i32,
}

impl Header {
    pub fn body_len(&self) -> usize {
        self.trailer_offset - HEADER_LENGTH
    }

    /// Reads only the two leading fields, which is all that is needed to know how long the frame
    ///  body is.
    pub fn try_read_type_and_offset(buf: &mut impl Buf) -> anyhow::Result<(FrameType, usize)> {
        let frame_type = FrameType::from_wire(buf.try_get_i32_be()?)?;
        let trailer_offset = buf.try_get_i32_be()?;
        if trailer_offset < HEADER_LENGTH as i32 {
            bail!("trailer offset {} is smaller than the header length {}", trailer_offset, HEADER_LENGTH);
        }
        Ok((frame_type, trailer_offset as usize))
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Header> {
        let (frame_type, trailer_offset) = Self::try_read_type_and_offset(buf)?;
        let frame_creator = buf.try_get_fixed_string(CREATOR_LEN)?;
        let frame_destination = buf.try_get_fixed_string(DESTINATION_LEN)?;
        let sequence_number = buf.try_get_i64_be()? as u64;
        let series = buf.try_get_i32_be()?;

        Ok(Header {
            frame_type,
            trailer_offset,
            frame_creator,
            frame_destination,
            sequence_number,
            series,
        })
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        if self.trailer_offset < HEADER_LENGTH || self.trailer_offset > i32::MAX as usize {
            bail!("trailer offset {} out of range", self.trailer_offset);
        }
        buf.put_i32(self.frame_type.code());
        buf.put_i32(self.trailer_offset as i32);
        buf.put_fixed_string(&self.frame_creator, CREATOR_LEN)?;
        buf.put_fixed_string(&self.frame_destination, DESTINATION_LEN)?;
        buf.put_i64(self.sequence_number as i64);
        buf.put_i32(self.series);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn header(frame_type: FrameType, trailer_offset: usize, seq: u64) -> Header {
        Header {
            frame_type,
            trailer_offset,
            frame_creator: "TEST".to_string(),
            frame_destination: "0".to_string(),
            sequence_number: seq,
            series: 0,
        }
    }

    #[test]
    fn test_ser() {
        let mut buf = BytesMut::new();
        let mut h = header(FrameType::Acknack, 64, 0x0102);
        h.series = 3;
        h.ser(&mut buf).unwrap();
        assert_eq!(&buf[..], b"\0\0\0\x06\0\0\0\x40TEST\0\0\0\x000\0\0\0\0\0\0\0\0\0\0\0\0\0\x01\x02\0\0\0\x03");
        assert_eq!(buf.len(), HEADER_LENGTH);
    }

    #[rstest]
    #[case::regular(header(FrameType::Data, 200, 17))]
    #[case::unsigned_max_seq(header(FrameType::Alert, 48, u64::MAX))]
    #[case::empty_body(header(FrameType::CustomResetFrame, HEADER_LENGTH, 0))]
    fn test_deser(#[case] expected: Header) {
        let mut buf = BytesMut::new();
        expected.ser(&mut buf).unwrap();
        let mut read = &buf[..];
        assert_eq!(Header::try_deser(&mut read).unwrap(), expected);
        assert!(read.is_empty());
    }

    #[rstest]
    #[case::unknown_type(b"\0\0\0\x0a\0\0\0\x40")]
    #[case::malformed_type(b"\0\0\0\x1b\0\0\0\x40")]
    #[case::offset_too_small(b"\0\0\0\x06\0\0\0\x23")]
    #[case::negative_offset(b"\0\0\0\x06\xff\xff\xff\xff")]
    #[case::too_short(b"\0\0\0\x06\0\0")]
    fn test_read_type_and_offset_invalid(#[case] mut buf: &[u8]) {
        assert!(Header::try_read_type_and_offset(&mut buf).is_err());
    }

    #[test]
    fn test_creator_too_long() {
        let mut h = header(FrameType::Data, 100, 1);
        h.frame_creator = "NINECHARS".to_string();
        assert!(h.ser(&mut BytesMut::new()).is_err());
    }
}
