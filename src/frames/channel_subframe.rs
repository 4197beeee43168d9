use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};

use crate::util::buf_ext::{pad4, Cd11BufExt, Cd11BufMutExt};
use crate::util::julian_date::{format_julian_date, parse_julian_date, JULIAN_DATE_LEN};

pub const SITE_LEN: usize = 5;
pub const CHANNEL_LEN: usize = 3;
pub const LOCATION_LEN: usize = 2;
pub const DATA_FORMAT_LEN: usize = 2;
pub const CHANNEL_ID_LEN: usize = SITE_LEN + CHANNEL_LEN + LOCATION_LEN;

/// 4 description bytes + site, channel, location, data format + calibration factor and period
const CHANNEL_DESCRIPTION_LEN: usize = 24;

/// a channel subframe with empty status, data and authentication fields
pub const MINIMUM_SUBFRAME_LEN: usize = 9 * 4 + CHANNEL_DESCRIPTION_LEN + JULIAN_DATE_LEN;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CompressionFormat {
    None = 0,
    CanadianAfterSignature = 1,
    Steim = 2,
    CanadianBeforeSignature = 3,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SensorType {
    Seismic = 0,
    Hydroacoustic = 1,
    Infrasonic = 2,
    Weather = 3,
    #[num_enum(catch_all)]
    Other(u8),
}

/// CSS 3.0 data type of the (uncompressed) samples
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum DataFormat {
    S4,
    S3,
    S2,
    I4,
    I2,
    Cd,
    Other(String),
}

impl DataFormat {
    pub fn code(&self) -> &str {
        match self {
            DataFormat::S4 => "s4",
            DataFormat::S3 => "s3",
            DataFormat::S2 => "s2",
            DataFormat::I4 => "i4",
            DataFormat::I2 => "i2",
            DataFormat::Cd => "cd",
            DataFormat::Other(code) => code,
        }
    }

    pub fn from_code(code: &str) -> DataFormat {
        match code {
            "s4" => DataFormat::S4,
            "s3" => DataFormat::S3,
            "s2" => DataFormat::S2,
            "i4" => DataFormat::I4,
            "i2" => DataFormat::I2,
            "cd" => DataFormat::Cd,
            other => DataFormat::Other(other.to_string()),
        }
    }
}

impl Display for DataFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// One channel's data burst inside a DATA frame:
///
/// ```ascii
///  0: channel length (i32) - self-reported, multiple of 4
///  4: authentication offset (i32)
///  8: authentication flag (u8, 1 = on)
///  9: compression format (u8)
/// 10: sensor type (u8)
/// 11: calibration flag (u8, 1 = calibration)
/// 12: site (char[5])
/// 17: channel (char[3])
/// 20: location (char[2])
/// 22: data format (char[2])
/// 24: calibration factor (f32)
/// 28: calibration period (f32)
/// 32: timestamp (char[20], julian date)
/// 52: subframe time length in ms (i32)
/// 56: number of samples (i32)
/// 60: channel status size (i32) + channel status (byte[pad4(size)])
///  *: data size (i32) + data (byte[pad4(size)])
///  *: subframe count (i32)
///  *: authentication key id (i32)
///  *: authentication size (i32) + authentication value (byte[pad4(size)])
/// ```
///
/// The variable-size byte fields are stored unpadded here, their size fields are derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSubframe {
    pub channel_length: i32,
    pub auth_offset: i32,
    pub authenticated: bool,
    pub compression: CompressionFormat,
    pub sensor_type: SensorType,
    pub is_calibration: bool,
    pub site: String,
    pub channel: String,
    pub location: String,
    pub data_format: DataFormat,
    pub calibration_factor: f32,
    pub calibration_period: f32,
    pub timestamp: SystemTime,
    pub subframe_time_length_ms: i32,
    pub samples: i32,
    pub channel_status: Bytes,
    pub data: Bytes,
    pub subframe_count: i32,
    pub auth_key_id: i32,
    pub auth_value: Bytes,
}

impl ChannelSubframe {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channel_length < MINIMUM_SUBFRAME_LEN as i32 {
            bail!("channel length must be at least {}, was {}", MINIMUM_SUBFRAME_LEN, self.channel_length);
        }
        if self.channel_length % 4 != 0 {
            bail!("channel length must be divisible by 4, was {}", self.channel_length);
        }
        if self.auth_offset < MINIMUM_SUBFRAME_LEN as i32 {
            bail!("authentication offset must be at least {}, was {}", MINIMUM_SUBFRAME_LEN, self.auth_offset);
        }
        if self.site.is_empty() {
            bail!("site name must not be empty");
        }
        if self.channel.is_empty() {
            bail!("channel name must not be empty");
        }
        if self.site.len() > SITE_LEN || self.channel.len() > CHANNEL_LEN || self.location.len() > LOCATION_LEN {
            bail!("channel id {}.{}.{} exceeds its field widths", self.site, self.channel, self.location);
        }
        if self.data_format.code().len() > DATA_FORMAT_LEN {
            bail!("data format code '{}' exceeds {} characters", self.data_format, DATA_FORMAT_LEN);
        }
        if self.subframe_time_length_ms < 0 {
            bail!("subframe time length must be >= 0, was {}", self.subframe_time_length_ms);
        }
        if self.samples < 0 {
            bail!("samples must be >= 0, was {}", self.samples);
        }
        if self.subframe_count < 0 {
            bail!("subframe count must be >= 0, was {}", self.subframe_count);
        }
        Ok(())
    }

    pub fn wire_len(&self) -> usize {
        MINIMUM_SUBFRAME_LEN + pad4(self.channel_status.len()) + pad4(self.data.len()) + pad4(self.auth_value.len())
    }

    /// samples per second
    pub fn sample_rate(&self) -> f64 {
        if self.subframe_time_length_ms == 0 {
            return 0.0;
        }
        self.samples as f64 / self.subframe_time_length_ms as f64 * 1000.0
    }

    /// time of the last sample: start + subframe duration - one sample period
    pub fn end_time(&self) -> SystemTime {
        let sample_rate = self.sample_rate();
        if sample_rate <= 0.0 {
            return self.timestamp;
        }
        let sample_period_nanos = 1e9 / sample_rate;
        let subframe_nanos = self.subframe_time_length_ms as f64 * 1e6;
        let duration_nanos = (subframe_nanos - sample_period_nanos).max(0.0);
        self.timestamp + Duration::from_nanos(duration_nanos as u64)
    }

    /// the 10 byte `site|channel|location` id as it appears in the channel string, null padded
    pub fn channel_id(&self) -> anyhow::Result<[u8; CHANNEL_ID_LEN]> {
        let mut buf = BytesMut::with_capacity(CHANNEL_ID_LEN);
        buf.put_fixed_string(&self.site, SITE_LEN)?;
        buf.put_fixed_string(&self.channel, CHANNEL_LEN)?;
        buf.put_fixed_string(&self.location, LOCATION_LEN)?;

        let mut result = [0u8; CHANNEL_ID_LEN];
        result.copy_from_slice(&buf);
        Ok(result)
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ChannelSubframe> {
        if buf.remaining() < MINIMUM_SUBFRAME_LEN {
            bail!("channel subframe needs at least {} bytes, {} remaining", MINIMUM_SUBFRAME_LEN, buf.remaining());
        }

        let channel_length = buf.try_get_i32_be()?;
        let auth_offset = buf.try_get_i32_be()?;
        let authenticated = buf.try_get_byte()? == 1;
        let compression_code = buf.try_get_byte()?;
        let compression = CompressionFormat::try_from(compression_code)
            .map_err(|_| anyhow!("invalid compression format {}", compression_code))?;
        let sensor_type = SensorType::from(buf.try_get_byte()?);
        let is_calibration = buf.try_get_byte()? == 1;
        let site = buf.try_get_fixed_string(SITE_LEN)?;
        let channel = buf.try_get_fixed_string(CHANNEL_LEN)?;
        let location = buf.try_get_fixed_string(LOCATION_LEN)?;
        let data_format = DataFormat::from_code(&buf.try_get_fixed_string(DATA_FORMAT_LEN)?);
        let calibration_factor = buf.try_get_f32_be()?;
        let calibration_period = buf.try_get_f32_be()?;
        let timestamp = parse_julian_date(&buf.try_get_fixed_string(JULIAN_DATE_LEN)?)?;
        let subframe_time_length_ms = buf.try_get_i32_be()?;
        let samples = buf.try_get_i32_be()?;
        let channel_status = buf.try_get_sized_padded_bytes("channel status size")?;
        let data = buf.try_get_sized_padded_bytes("data size")?;
        let subframe_count = buf.try_get_i32_be()?;
        let auth_key_id = buf.try_get_i32_be()?;
        let auth_value = buf.try_get_sized_padded_bytes("authentication size")?;

        let result = ChannelSubframe {
            channel_length,
            auth_offset,
            authenticated,
            compression,
            sensor_type,
            is_calibration,
            site,
            channel,
            location,
            data_format,
            calibration_factor,
            calibration_period,
            timestamp,
            subframe_time_length_ms,
            samples,
            channel_status,
            data,
            subframe_count,
            auth_key_id,
            auth_value,
        };
        result.validate()?;
        Ok(result)
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.validate()?;

        buf.put_i32(self.channel_length);
        buf.put_i32(self.auth_offset);
        buf.put_u8(self.authenticated as u8);
        buf.put_u8(self.compression.into());
        buf.put_u8(self.sensor_type.into());
        buf.put_u8(self.is_calibration as u8);
        buf.put_slice(&self.channel_id()?);
        buf.put_fixed_string(self.data_format.code(), DATA_FORMAT_LEN)?;
        buf.put_f32(self.calibration_factor);
        buf.put_f32(self.calibration_period);
        buf.put_slice(format_julian_date(self.timestamp)?.as_bytes());
        buf.put_i32(self.subframe_time_length_ms);
        buf.put_i32(self.samples);
        buf.put_sized_padded_bytes(&self.channel_status)?;
        buf.put_sized_padded_bytes(&self.data)?;
        buf.put_i32(self.subframe_count);
        buf.put_i32(self.auth_key_id);
        buf.put_sized_padded_bytes(&self.auth_value)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_subframe;
    use crate::util::julian_date::from_epoch_millis;
    use rstest::rstest;

    #[test]
    fn test_minimum_len() {
        assert_eq!(MINIMUM_SUBFRAME_LEN, 80);
    }

    #[test]
    fn test_ser_deser() {
        let subframe = test_subframe("STA", "BHZ", 1_000);
        let mut buf = BytesMut::new();
        subframe.ser(&mut buf).unwrap();
        assert_eq!(buf.len(), subframe.wire_len());
        assert_eq!(buf.len() as i32, subframe.channel_length);

        let mut read = &buf[..];
        assert_eq!(ChannelSubframe::try_deser(&mut read).unwrap(), subframe);
        assert!(read.is_empty());
    }

    #[test]
    fn test_description_bytes() {
        let mut subframe = test_subframe("STA", "BHZ", 0);
        subframe.authenticated = true;
        subframe.compression = CompressionFormat::Steim;
        subframe.sensor_type = SensorType::Infrasonic;
        subframe.is_calibration = false;

        let mut buf = BytesMut::new();
        subframe.ser(&mut buf).unwrap();
        assert_eq!(&buf[8..12], &[1, 2, 2, 0]);
        assert_eq!(&buf[12..24], b"STA\0\0BHZ\0\0s4");
    }

    #[test]
    fn test_unknown_sensor_type_is_preserved() {
        let mut subframe = test_subframe("STA", "BHZ", 0);
        subframe.sensor_type = SensorType::Other(9);
        let mut buf = BytesMut::new();
        subframe.ser(&mut buf).unwrap();
        assert_eq!(ChannelSubframe::try_deser(&mut &buf[..]).unwrap().sensor_type, SensorType::Other(9));
    }

    #[test]
    fn test_unknown_compression_is_rejected() {
        let subframe = test_subframe("STA", "BHZ", 0);
        let mut buf = BytesMut::new();
        subframe.ser(&mut buf).unwrap();
        buf[9] = 7;
        assert!(ChannelSubframe::try_deser(&mut &buf[..]).is_err());
    }

    #[rstest]
    #[case::channel_length_too_small(|s: &mut ChannelSubframe| s.channel_length = 76)]
    #[case::channel_length_unaligned(|s: &mut ChannelSubframe| s.channel_length += 2)]
    #[case::auth_offset_too_small(|s: &mut ChannelSubframe| s.auth_offset = 79)]
    #[case::empty_site(|s: &mut ChannelSubframe| s.site = String::new())]
    #[case::empty_channel(|s: &mut ChannelSubframe| s.channel = String::new())]
    #[case::negative_samples(|s: &mut ChannelSubframe| s.samples = -1)]
    #[case::negative_time_length(|s: &mut ChannelSubframe| s.subframe_time_length_ms = -1)]
    #[case::negative_subframe_count(|s: &mut ChannelSubframe| s.subframe_count = -1)]
    fn test_validation(#[case] corrupt: fn(&mut ChannelSubframe)) {
        let mut subframe = test_subframe("STA", "BHZ", 0);
        assert!(subframe.validate().is_ok());
        corrupt(&mut subframe);
        assert!(subframe.validate().is_err());
    }

    #[test]
    fn test_derived_times() {
        let mut subframe = test_subframe("STA", "BHZ", 0);
        subframe.timestamp = from_epoch_millis(10_000);
        subframe.subframe_time_length_ms = 10_000;
        subframe.samples = 400;

        assert_eq!(subframe.sample_rate(), 40.0);
        // 10 s minus one sample period of 25 ms
        assert_eq!(subframe.end_time(), from_epoch_millis(19_975));
    }

    #[test]
    fn test_derived_times_without_samples() {
        let mut subframe = test_subframe("STA", "BHZ", 0);
        subframe.samples = 0;
        assert_eq!(subframe.sample_rate(), 0.0);
        assert_eq!(subframe.end_time(), subframe.timestamp);
    }
}
