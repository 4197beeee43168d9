use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

/// CD-1 frames wrapped in CD-1.1. Decoding the encapsulated CD-1 content is not supported, the
///  body is carried as is.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Cd1Encapsulation {
    pub payload: Bytes,
}

impl Cd1Encapsulation {
    pub fn deser(buf: &mut impl Buf) -> Cd1Encapsulation {
        warn!("received CD-1 encapsulation frame - its content is not decoded");
        Cd1Encapsulation {
            payload: buf.copy_to_bytes(buf.remaining()),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.payload);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opaque_body() {
        let mut read: &[u8] = b"\x01\x02\x03\x04\x05";
        let frame = Cd1Encapsulation::deser(&mut read);
        assert!(read.is_empty());

        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        assert_eq!(&buf[..], b"\x01\x02\x03\x04\x05");
    }
}
