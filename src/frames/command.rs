use std::time::SystemTime;

use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::util::buf_ext::{strip_string, Cd11BufExt, Cd11BufMutExt};
use crate::util::julian_date::{format_julian_date, parse_julian_date, JULIAN_DATE_LEN};

pub const STATION_LEN: usize = 8;
pub const SITE_LEN: usize = 5;
pub const CHANNEL_LEN: usize = 3;
pub const LOCATION_LEN: usize = 2;

/// Identifies the channel a command refers to. Shared prefix of COMMAND_REQUEST and
///  COMMAND_RESPONSE bodies:
///
/// ```ascii
///  0: station (char[8])
///  8: site (char[5])
/// 13: channel (char[3])
/// 16: location (char[2])
/// 18: 2 null bytes
/// 20: timestamp (char[20], julian date)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandTarget {
    pub station: String,
    pub site: String,
    pub channel: String,
    pub location: String,
    pub timestamp: SystemTime,
}

impl CommandTarget {
    fn validate(&self) -> anyhow::Result<()> {
        for (name, value, max) in [
            ("station", &self.station, STATION_LEN),
            ("site", &self.site, SITE_LEN),
            ("channel", &self.channel, CHANNEL_LEN),
            ("location", &self.location, LOCATION_LEN),
        ] {
            if value.len() > max {
                bail!("{} '{}' exceeds {} characters", name, value, max);
            }
        }
        Ok(())
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CommandTarget> {
        let station = buf.try_get_fixed_string(STATION_LEN)?;
        let site = buf.try_get_fixed_string(SITE_LEN)?;
        let channel = buf.try_get_fixed_string(CHANNEL_LEN)?;
        let location = buf.try_get_fixed_string(LOCATION_LEN)?;
        buf.try_skip(2)?;
        let timestamp = parse_julian_date(&buf.try_get_fixed_string(JULIAN_DATE_LEN)?)?;
        Ok(CommandTarget {
            station,
            site,
            channel,
            location,
            timestamp,
        })
    }

    fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.validate()?;
        buf.put_fixed_string(&self.station, STATION_LEN)?;
        buf.put_fixed_string(&self.site, SITE_LEN)?;
        buf.put_fixed_string(&self.channel, CHANNEL_LEN)?;
        buf.put_fixed_string(&self.location, LOCATION_LEN)?;
        buf.put_bytes(0, 2);
        buf.put_slice(format_julian_date(self.timestamp)?.as_bytes());
        Ok(())
    }
}

/// NB: Message strings are written without alignment padding, matching deployed peers.
fn try_get_message(buf: &mut impl Buf, field: &str) -> anyhow::Result<String> {
    let len = buf.try_get_length(field)?;
    let message = strip_string(&buf.try_get_bytes(len)?);
    if message.is_empty() {
        bail!("{} must not be blank", field);
    }
    Ok(message)
}

fn put_message(buf: &mut BytesMut, field: &str, message: &str) -> anyhow::Result<()> {
    if message.trim().is_empty() {
        bail!("{} must not be blank", field);
    }
    buf.put_i32(message.len().try_into()?);
    buf.put_slice(message.as_bytes());
    Ok(())
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandRequest {
    pub target: CommandTarget,
    pub command: String,
}

impl CommandRequest {
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CommandRequest> {
        let target = CommandTarget::try_deser(buf)?;
        let command = try_get_message(buf, "command message")?;
        Ok(CommandRequest { target, command })
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.target.ser(buf)?;
        put_message(buf, "command message", &self.command)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CommandResponse {
    /// `target.station` is the responding station
    pub target: CommandTarget,
    pub request_message: String,
    pub response_message: String,
}

impl CommandResponse {
    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<CommandResponse> {
        let target = CommandTarget::try_deser(buf)?;
        let request_message = try_get_message(buf, "command request message")?;
        let response_message = try_get_message(buf, "command response message")?;
        Ok(CommandResponse {
            target,
            request_message,
            response_message,
        })
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.target.ser(buf)?;
        put_message(buf, "command request message", &self.request_message)?;
        put_message(buf, "command response message", &self.response_message)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::julian_date::from_epoch_millis;

    fn target() -> CommandTarget {
        CommandTarget {
            station: "STA01".to_string(),
            site: "SITE".to_string(),
            channel: "BHZ".to_string(),
            location: "00".to_string(),
            timestamp: from_epoch_millis(1_600_000_000_123),
        }
    }

    #[test]
    fn test_request_layout() {
        let mut buf = BytesMut::new();
        CommandRequest { target: target(), command: "calib".to_string() }.ser(&mut buf).unwrap();

        assert_eq!(&buf[..8], b"STA01\0\0\0");
        assert_eq!(&buf[8..20], b"SITE\0BHZ00\0\0");
        assert_eq!(&buf[20..40], b"2020257 12:26:40.123");
        assert_eq!(&buf[40..], b"\0\0\0\x05calib");
    }

    #[test]
    fn test_request_ser_deser() {
        let request = CommandRequest { target: target(), command: "calib start".to_string() };
        let mut buf = BytesMut::new();
        request.ser(&mut buf).unwrap();

        let mut read = &buf[..];
        assert_eq!(CommandRequest::try_deser(&mut read).unwrap(), request);
        assert!(read.is_empty());
    }

    #[test]
    fn test_response_ser_deser() {
        let response = CommandResponse {
            target: target(),
            request_message: "calib start".to_string(),
            response_message: "ok".to_string(),
        };
        let mut buf = BytesMut::new();
        response.ser(&mut buf).unwrap();

        let mut read = &buf[..];
        assert_eq!(CommandResponse::try_deser(&mut read).unwrap(), response);
        assert!(read.is_empty());
    }

    #[test]
    fn test_blank_messages_rejected() {
        let request = CommandRequest { target: target(), command: "  ".to_string() };
        assert!(request.ser(&mut BytesMut::new()).is_err());

        let mut buf = BytesMut::new();
        target().ser(&mut buf).unwrap();
        buf.put_i32(0);
        assert!(CommandRequest::try_deser(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_oversized_target_rejected() {
        let mut t = target();
        t.site = "TOOLONG".to_string();
        let request = CommandRequest { target: t, command: "x".to_string() };
        assert!(request.ser(&mut BytesMut::new()).is_err());
    }
}
