use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Body of the CUSTOM_RESET_FRAME extension. Peers that understand it clear their gap state and
///  start over; the body is normally empty and never interpreted.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct CustomReset {
    pub payload: Bytes,
}

impl CustomReset {
    pub fn deser(buf: &mut impl Buf) -> CustomReset {
        CustomReset {
            payload: buf.copy_to_bytes(buf.remaining()),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.payload);
    }
}
