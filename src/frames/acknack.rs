use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::util::buf_ext::{Cd11BufExt, Cd11BufMutExt};

pub const FRAMESET_ACKED_LEN: usize = 20;

/// Acknowledgement of a frame set: the receiver's lowest and highest observed sequence numbers and
///  the inclusive ranges in between that it has not received, i.e. requests for retransmission.
///
/// ```ascii
///  0: frameset acked (char[20]) - "creator:destination"
/// 20: lowest sequence number (i64)
/// 28: highest sequence number (i64)
/// 36: gap count (i32)
/// 40: gaps (i64 start, i64 end) * gap count
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Acknack {
    pub frameset_acked: String,
    pub lowest_seq: u64,
    pub highest_seq: u64,
    pub gaps: Vec<(u64, u64)>,
}

impl Acknack {
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Acknack> {
        let frameset_acked = buf.try_get_fixed_string(FRAMESET_ACKED_LEN)?;
        let lowest_seq = buf.try_get_i64_be()? as u64;
        let highest_seq = buf.try_get_i64_be()? as u64;
        let gap_count = buf.try_get_length("gap count")?;

        // each gap is 16 bytes - checking up front avoids allocating for a bogus count
        if buf.remaining() < gap_count.saturating_mul(16) {
            bail!("acknack announces {} gaps, but only {} bytes remain", gap_count, buf.remaining());
        }

        let mut gaps = Vec::with_capacity(gap_count);
        for _ in 0..gap_count {
            let start = buf.try_get_i64_be()? as u64;
            let end = buf.try_get_i64_be()? as u64;
            gaps.push((start, end));
        }

        Ok(Acknack {
            frameset_acked,
            lowest_seq,
            highest_seq,
            gaps,
        })
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_fixed_string(&self.frameset_acked, FRAMESET_ACKED_LEN)?;
        buf.put_i64(self.lowest_seq as i64);
        buf.put_i64(self.highest_seq as i64);
        buf.put_i32(self.gaps.len().try_into()?);
        for (start, end) in &self.gaps {
            buf.put_i64(*start as i64);
            buf.put_i64(*end as i64);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::no_gaps(Acknack { frameset_acked: "STA:0".to_string(), lowest_seq: 1, highest_seq: 4, gaps: vec![] })]
    #[case::one_gap(Acknack { frameset_acked: "STA:0".to_string(), lowest_seq: 1, highest_seq: 4, gaps: vec![(3, 3)] })]
    #[case::empty_tracker(Acknack { frameset_acked: "TEST:0".to_string(), lowest_seq: 0, highest_seq: u64::MAX, gaps: vec![] })]
    #[case::full_width_id(Acknack { frameset_acked: "ABCDEFGH:IJKLMNOPQRS".to_string(), lowest_seq: 5, highest_seq: 99, gaps: vec![(6, 10), (20, 98)] })]
    fn test_ser_deser(#[case] acknack: Acknack) {
        let mut buf = BytesMut::new();
        acknack.ser(&mut buf).unwrap();
        assert_eq!(buf.len(), 40 + 16 * acknack.gaps.len());

        let mut read = &buf[..];
        assert_eq!(Acknack::try_deser(&mut read).unwrap(), acknack);
        assert!(read.is_empty());
    }

    #[test]
    fn test_ser_layout() {
        let mut buf = BytesMut::new();
        Acknack { frameset_acked: "A:B".to_string(), lowest_seq: 1, highest_seq: 2, gaps: vec![(1, 2)] }
            .ser(&mut buf)
            .unwrap();
        let expected: &[u8] = b"A:B\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\
            \0\0\0\0\0\0\0\x01\0\0\0\0\0\0\0\x02\0\0\0\x01\
            \0\0\0\0\0\0\0\x01\0\0\0\0\0\0\0\x02";
        assert_eq!(&buf[..], expected);
    }

    #[rstest]
    #[case::negative_gap_count(-1)]
    #[case::more_gaps_than_bytes(3)]
    fn test_invalid_gap_count(#[case] gap_count: i32) {
        let mut buf = BytesMut::new();
        buf.put_fixed_string("A:B", FRAMESET_ACKED_LEN).unwrap();
        buf.put_i64(1);
        buf.put_i64(2);
        buf.put_i32(gap_count);
        buf.put_i64(1);
        buf.put_i64(2);

        assert!(Acknack::try_deser(&mut &buf[..]).is_err());
    }
}
