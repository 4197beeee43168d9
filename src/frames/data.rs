use std::time::SystemTime;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{error, warn};

use crate::frames::channel_subframe::{ChannelSubframe, CHANNEL_ID_LEN};
use crate::util::buf_ext::{padding_needed, Cd11BufExt, Cd11BufMutExt};
use crate::util::julian_date::{format_julian_date, parse_julian_date, JULIAN_DATE_LEN};

/// Prefix of every DATA frame body, describing the channel subframes that follow.
///
/// ```ascii
///  0: number of channels (i32)
///  4: frame time length in ms (i32)
///  8: nominal time (char[20], julian date)
/// 28: channel string count (i32)
/// 32: channel string (char[count], padded to 4 bytes) - 10 bytes per channel
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelSubframeHeader {
    pub num_channels: i32,
    pub frame_time_length_ms: i32,
    pub nominal_time: SystemTime,
    /// raw and unpadded, `site(5) channel(3) location(2)` per channel
    pub channel_string: Bytes,
}

impl ChannelSubframeHeader {
    fn validate(&self) -> anyhow::Result<()> {
        if self.num_channels <= 0 {
            bail!("number of channels must be positive, was {}", self.num_channels);
        }
        if self.frame_time_length_ms <= 0 {
            bail!("frame time length must be positive, was {}", self.frame_time_length_ms);
        }
        Ok(())
    }

    /// number of subframes announced by the channel string
    pub fn num_channel_ids(&self) -> usize {
        self.channel_string.len() / CHANNEL_ID_LEN
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = &[u8]> {
        self.channel_string.chunks_exact(CHANNEL_ID_LEN)
    }

    fn is_valid_channel_id(id: &[u8]) -> bool {
        id.len() == CHANNEL_ID_LEN
            && id.iter().all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'|' || b == 0)
    }

    pub fn try_deser(buf: &mut (impl Buf + Clone)) -> anyhow::Result<ChannelSubframeHeader> {
        let num_channels = buf.try_get_i32_be()?;
        let frame_time_length_ms = buf.try_get_i32_be()?;
        let nominal_time = parse_julian_date(&buf.try_get_fixed_string(JULIAN_DATE_LEN)?)?;
        let channel_string_count = buf.try_get_length("channel string count")?;
        let channel_string = buf.try_get_bytes(channel_string_count)?;

        // Some providers do not align the channel string, so the padding is only skipped if it is
        //  actually there
        let padding = padding_needed(channel_string_count, 4);
        if padding > 0 {
            match buf.clone().try_get_i32_be() {
                Ok(0) => buf.try_skip(padding)?,
                _ => warn!("channel string did not end on a 4 byte boundary"),
            }
        }

        let result = ChannelSubframeHeader {
            num_channels,
            frame_time_length_ms,
            nominal_time,
            channel_string,
        };
        result.validate()?;

        if result.channel_string.len() % CHANNEL_ID_LEN != 0 {
            warn!("channel string length {} is not a multiple of {}", result.channel_string.len(), CHANNEL_ID_LEN);
        }
        if result.num_channel_ids() != num_channels as usize {
            warn!("channel string lists {} channels, header announces {}", result.num_channel_ids(), num_channels);
        }
        for id in result.channel_ids() {
            if !Self::is_valid_channel_id(id) {
                warn!("invalid channel id {:?} in channel string", String::from_utf8_lossy(id));
            }
        }
        Ok(result)
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.validate()?;
        buf.put_i32(self.num_channels);
        buf.put_i32(self.frame_time_length_ms);
        buf.put_slice(format_julian_date(self.nominal_time)?.as_bytes());
        buf.put_sized_padded_bytes(&self.channel_string)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub header: ChannelSubframeHeader,
    pub subframes: Vec<ChannelSubframe>,
}

impl DataFrame {
    /// Derives the channel subframe header from the subframes: the frame time length is the first
    ///  subframe's, the nominal time is the earliest subframe timestamp.
    pub fn from_subframes(subframes: Vec<ChannelSubframe>) -> anyhow::Result<DataFrame> {
        let Some(first) = subframes.first() else {
            bail!("a DATA frame needs at least one channel subframe");
        };
        let frame_time_length_ms = first.subframe_time_length_ms;

        let nominal_time = subframes.iter()
            .map(|s| s.timestamp)
            .min()
            .unwrap_or(first.timestamp);

        let mut channel_string = BytesMut::with_capacity(subframes.len() * CHANNEL_ID_LEN);
        for subframe in &subframes {
            subframe.validate()?;
            channel_string.put_slice(&subframe.channel_id()?);
        }

        let header = ChannelSubframeHeader {
            num_channels: subframes.len().try_into()?,
            frame_time_length_ms,
            nominal_time,
            channel_string: channel_string.freeze(),
        };
        header.validate()?;

        Ok(DataFrame { header, subframes })
    }

    pub fn try_deser(buf: &mut (impl Buf + Clone)) -> anyhow::Result<DataFrame> {
        let header = ChannelSubframeHeader::try_deser(buf)?;

        let mut subframes = Vec::with_capacity(header.num_channel_ids());
        for i in 0..header.num_channel_ids() {
            match ChannelSubframe::try_deser(buf) {
                Ok(subframe) => subframes.push(subframe),
                Err(e) => {
                    warn!("stopped parsing DATA frame at channel subframe #{}: {}", i, e);
                    break;
                }
            }
        }

        if subframes.is_empty() {
            bail!("DATA frame does not contain a parseable channel subframe");
        }
        if buf.has_remaining() {
            error!("{} bytes of DATA frame body were left unparsed", buf.remaining());
            buf.advance(buf.remaining());
        }

        Ok(DataFrame { header, subframes })
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.header.ser(buf)?;
        for subframe in &self.subframes {
            subframe.ser(buf)?;
        }
        Ok(())
    }
}
