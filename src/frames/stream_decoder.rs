use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::frames::frame_type::FrameType;
use crate::frames::header::{Header, HEADER_LENGTH};
use crate::frames::trailer::{Trailer, TRAILER_SEGMENT1_LEN};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DecodeOutcome {
    /// the complete bytes of one frame, ready for [crate::frames::codec::parse_frame]
    Frame(Bytes),
    NeedMoreData,
    /// bytes that were dropped to get back in sync with the stream
    Malformed { consumed: Bytes, reason: String },
}

/// Splits a CD-1.1 byte stream into frames without parsing their bodies. The decoder works in
///  stages, each of which only needs a fixed number of bytes:
///
/// * the header, which has the trailer offset and therefore the body length
/// * the first trailer segment (auth key id, auth size), which has the padded auth value length
/// * the rest of the trailer
///
/// If a header is structurally broken, the decoder drops it together with any buffered bytes up to
///  the next 4 byte aligned position that looks like the start of a frame.
#[derive(Debug, Clone)]
pub struct StreamDecoder {
    max_frame_size: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        StreamDecoder::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl StreamDecoder {
    pub fn new(max_frame_size: usize) -> StreamDecoder {
        StreamDecoder { max_frame_size }
    }

    pub fn decode(&self, buf: &mut BytesMut) -> DecodeOutcome {
        if buf.len() < HEADER_LENGTH {
            return DecodeOutcome::NeedMoreData;
        }

        let trailer_offset = match Header::try_read_type_and_offset(&mut &buf[..HEADER_LENGTH]) {
            Ok((_, trailer_offset)) => trailer_offset,
            Err(e) => return self.resync(buf, HEADER_LENGTH, e.to_string()),
        };
        if trailer_offset > self.max_frame_size {
            return self.resync(buf, HEADER_LENGTH, format!("trailer offset {} exceeds the maximum frame size {}", trailer_offset, self.max_frame_size));
        }

        let segment1_end = trailer_offset + TRAILER_SEGMENT1_LEN;
        if buf.len() < segment1_end {
            return DecodeOutcome::NeedMoreData;
        }

        let mut auth_size_bytes = [0u8; 4];
        auth_size_bytes.copy_from_slice(&buf[segment1_end - 4..segment1_end]);
        let auth_size = i32::from_be_bytes(auth_size_bytes);
        if auth_size < 0 {
            return self.resync(buf, segment1_end, format!("negative authentication size {}", auth_size));
        }

        let frame_len = trailer_offset + Trailer::wire_len_for_auth_size(auth_size as usize);
        if frame_len > self.max_frame_size {
            return self.resync(buf, segment1_end, format!("frame length {} exceeds the maximum frame size {}", frame_len, self.max_frame_size));
        }
        if buf.len() < frame_len {
            return DecodeOutcome::NeedMoreData;
        }

        trace!("decoded frame of {} bytes", frame_len);
        DecodeOutcome::Frame(buf.split_to(frame_len).freeze())
    }

    fn resync(&self, buf: &mut BytesMut, min_consumed: usize, reason: String) -> DecodeOutcome {
        let mut consumed = min_consumed;
        while consumed + 4 <= buf.len() {
            let code = i32::from_be_bytes([buf[consumed], buf[consumed + 1], buf[consumed + 2], buf[consumed + 3]]);
            if FrameType::is_valid_wire_code(code) {
                break;
            }
            consumed += 4;
        }

        debug!("dropping {} bytes to resynchronize: {}", consumed, reason);
        DecodeOutcome::Malformed {
            consumed: buf.split_to(consumed).freeze(),
            reason,
        }
    }
}

/// Reads from `reader` until `buf` holds a complete frame or a malformed span. Bytes beyond that
///  stay in `buf` for the next call.
///
/// Returns `None` if `cancel` fires or the peer closes the stream between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    decoder: &StreamDecoder,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<DecodeOutcome>> {
    loop {
        match decoder.decode(buf) {
            DecodeOutcome::NeedMoreData => {}
            outcome => return Ok(Some(outcome)),
        }

        buf.reserve(READ_CHUNK_SIZE);
        let num_read = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            num_read = reader.read_buf(buf) => num_read?,
        };

        if num_read == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            bail!("stream closed in the middle of a frame, {} bytes buffered", buf.len());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::FrameFactory;
    use crate::frames::codec::parse_frame;
    use crate::test_util::test_subframe;
    use rstest::rstest;

    fn frame_bytes() -> Vec<Bytes> {
        let factory = FrameFactory::builder().build().unwrap();
        vec![
            factory.create_alert("bye").unwrap().to_bytes(),
            factory.create_data(vec![test_subframe("STA", "BHZ", 40)], 1).unwrap().to_bytes(),
            factory.create_custom_reset().unwrap().to_bytes(),
            factory.create_acknack("TEST:0", 1, 4, vec![(3, 3)]).unwrap().to_bytes(),
        ]
    }

    fn concatenated() -> BytesMut {
        let mut buf = BytesMut::new();
        for f in frame_bytes() {
            buf.extend_from_slice(&f);
        }
        buf
    }

    #[rstest]
    #[case::whole(usize::MAX)]
    #[case::single_bytes(1)]
    #[case::odd_chunks(7)]
    #[case::header_sized_chunks(HEADER_LENGTH)]
    fn test_decode_in_chunks(#[case] chunk_size: usize) {
        let all = concatenated();
        let decoder = StreamDecoder::default();

        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in all.chunks(chunk_size.min(all.len())) {
            buf.extend_from_slice(chunk);
            loop {
                match decoder.decode(&mut buf) {
                    DecodeOutcome::Frame(f) => decoded.push(f),
                    DecodeOutcome::NeedMoreData => break,
                    DecodeOutcome::Malformed { reason, .. } => panic!("unexpected malformed frame: {}", reason),
                }
            }
        }

        assert_eq!(decoded, frame_bytes());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_garbage_is_skipped() {
        let decoder = StreamDecoder::default();
        let frames = frame_bytes();

        let mut buf = BytesMut::new();
        // an invalid frame type, then 8 more bytes of garbage before a valid frame
        buf.extend_from_slice(&[0, 0, 0, 99]);
        buf.extend_from_slice(&[0xab; HEADER_LENGTH - 4 + 8]);
        buf.extend_from_slice(&frames[0]);

        match decoder.decode(&mut buf) {
            DecodeOutcome::Malformed { consumed, .. } => assert_eq!(consumed.len(), HEADER_LENGTH + 8),
            other => panic!("expected malformed, got {:?}", other),
        }
        assert_eq!(decoder.decode(&mut buf), DecodeOutcome::Frame(frames[0].clone()));
    }

    #[test]
    fn test_malformed_consumes_buffered_bytes_only() {
        let decoder = StreamDecoder::default();
        let mut buf = BytesMut::from(&[0xffu8; HEADER_LENGTH + 6][..]);

        match decoder.decode(&mut buf) {
            DecodeOutcome::Malformed { consumed, .. } => assert_eq!(consumed.len(), HEADER_LENGTH + 4),
            other => panic!("expected malformed, got {:?}", other),
        }
        assert_eq!(buf.len(), 2);
        assert_eq!(decoder.decode(&mut buf), DecodeOutcome::NeedMoreData);
    }

    #[test]
    fn test_negative_trailer_offset() {
        let decoder = StreamDecoder::default();
        let mut raw = BytesMut::from(&frame_bytes()[0][..]);
        raw[4..8].copy_from_slice(&(-8i32).to_be_bytes());
        assert!(matches!(decoder.decode(&mut raw), DecodeOutcome::Malformed { .. }));
    }

    #[test]
    fn test_max_frame_size() {
        let decoder = StreamDecoder::new(64);
        let mut buf = BytesMut::from(&frame_bytes()[1][..]);
        assert!(matches!(decoder.decode(&mut buf), DecodeOutcome::Malformed { .. }));
    }

    #[test]
    fn test_negative_auth_size() {
        let decoder = StreamDecoder::default();
        let alert = frame_bytes()[0].clone();
        let trailer_offset = alert.len() - 16;

        let mut buf = BytesMut::from(&alert[..]);
        buf[trailer_offset + 4..trailer_offset + 8].copy_from_slice(&(-1i32).to_be_bytes());
        match decoder.decode(&mut buf) {
            DecodeOutcome::Malformed { consumed, .. } => assert!(consumed.len() >= trailer_offset + 8),
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_frame() {
        let all = concatenated().freeze();
        let mut reader = &all[..];
        let decoder = StreamDecoder::default();
        let cancel = CancellationToken::new();
        let mut buf = BytesMut::new();

        for expected in frame_bytes() {
            match read_frame(&mut reader, &mut buf, &decoder, &cancel).await.unwrap() {
                Some(DecodeOutcome::Frame(raw)) => {
                    assert_eq!(raw, expected);
                    assert!(parse_frame(raw).is_ok());
                }
                other => panic!("expected frame, got {:?}", other),
            }
        }
        assert!(read_frame(&mut reader, &mut buf, &decoder, &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_frame_eof_mid_frame() {
        let alert = frame_bytes()[0].clone();
        let mut reader = &alert[..alert.len() - 3];
        let result = read_frame(&mut reader, &mut BytesMut::new(), &StreamDecoder::default(), &CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_frame_cancelled() {
        let (mut client, _server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = read_frame(&mut client, &mut BytesMut::new(), &StreamDecoder::default(), &cancel).await;
        assert!(result.unwrap().is_none());
    }
}
