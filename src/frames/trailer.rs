use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::util::buf_ext::{pad4, Cd11BufExt, Cd11BufMutExt};

/// authentication key id (i32) + authentication size (i32)
pub const TRAILER_SEGMENT1_LEN: usize = 8;
pub const COMM_VERIFICATION_LEN: usize = 8;

/// Frame trailer:
///
/// ```ascii
/// 0: authentication key identifier (i32)
/// 4: authentication size (i32) - unpadded length of the authentication value
/// 8: authentication value (byte[pad4(size)])
/// *: comm verification (u64) - CRC-64 of the entire frame with this field zeroed
/// ```
///
/// Authentication values are carried, not verified.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Trailer {
    pub auth_key_id: i32,
    /// unpadded
    pub auth_value: Bytes,
    pub comm_verification: u64,
}

impl Trailer {
    pub fn wire_len(&self) -> usize {
        Self::wire_len_for_auth_size(self.auth_value.len())
    }

    pub fn wire_len_for_auth_size(auth_size: usize) -> usize {
        TRAILER_SEGMENT1_LEN + pad4(auth_size) + COMM_VERIFICATION_LEN
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Trailer> {
        let auth_key_id = buf.try_get_i32_be()?;
        let auth_value = buf.try_get_sized_padded_bytes("authentication size")?;
        let comm_verification = buf.try_get_i64_be()? as u64;
        Ok(Trailer {
            auth_key_id,
            auth_value,
            comm_verification,
        })
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        if self.auth_value.len() > i32::MAX as usize {
            bail!("authentication value too long");
        }
        buf.put_i32(self.auth_key_id);
        buf.put_sized_padded_bytes(&self.auth_value)?;
        buf.put_u64(self.comm_verification);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::no_auth(0, b"", 0x1122334455667788, b"\0\0\0\0\0\0\0\0\x11\x22\x33\x44\x55\x66\x77\x88")]
    #[case::padded_auth(7, b"abcde", 1, b"\0\0\0\x07\0\0\0\x05abcde\0\0\0\0\0\0\0\0\0\0\x01")]
    fn test_ser_deser(#[case] auth_key_id: i32, #[case] auth: &[u8], #[case] crc: u64, #[case] expected: &[u8]) {
        let trailer = Trailer {
            auth_key_id,
            auth_value: Bytes::copy_from_slice(auth),
            comm_verification: crc,
        };
        let mut buf = BytesMut::new();
        trailer.ser(&mut buf).unwrap();
        assert_eq!(&buf[..], expected);
        assert_eq!(trailer.wire_len(), expected.len());

        let mut read = &buf[..];
        assert_eq!(Trailer::try_deser(&mut read).unwrap(), trailer);
        assert!(read.is_empty());
    }

    #[test]
    fn test_negative_auth_size() {
        let mut buf: &[u8] = b"\0\0\0\x01\xff\xff\xff\xff\0\0\0\0\0\0\0\0";
        assert!(Trailer::try_deser(&mut buf).is_err());
    }
}
