use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};

use crate::util::buf_ext::{Cd11BufExt, Cd11BufMutExt};

pub const CONNECTION_BODY_LEN: usize = 32;
pub const NAME_LEN: usize = 8;
pub const KIND_LEN: usize = 4;
pub const SERVICE_TYPE_LEN: usize = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ServiceType {
    Tcp,
    Udp,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Tcp => "TCP",
            ServiceType::Udp => "UDP",
        }
    }
}

impl FromStr for ServiceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(ServiceType::Tcp),
            "UDP" => Ok(ServiceType::Udp),
            other => Err(anyhow!("invalid service type '{}', expected TCP or UDP", other)),
        }
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Body of both CONNECTION_REQUEST and CONNECTION_RESPONSE frames, which share their layout. In a
///  request, `name` / `kind` describe the requesting station and the address is the station's; in
///  a response, they describe the responder and the address is where the data consumer listens.
///
/// ```ascii
///  0: major version (i16)
///  2: minor version (i16)
///  4: station / responder name (char[8])
/// 12: station / responder type (char[4])
/// 16: service type (char[4]) - "TCP" or "UDP"
/// 20: IP address (u32)
/// 24: port (u16)
/// 26: secondary IP address (u32), 0 if absent
/// 30: secondary port (u16), 0 if absent
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionExchange {
    pub major_version: i16,
    pub minor_version: i16,
    pub name: String,
    pub kind: String,
    pub service_type: ServiceType,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub secondary: Option<(Ipv4Addr, u16)>,
}

pub type ConnectionRequest = ConnectionExchange;
pub type ConnectionResponse = ConnectionExchange;

impl ConnectionExchange {
    fn validate(&self) -> anyhow::Result<()> {
        if self.major_version < 0 || self.minor_version < 0 {
            bail!("protocol version must be non-negative, was {}.{}", self.major_version, self.minor_version);
        }
        if self.name.len() > NAME_LEN {
            bail!("name '{}' exceeds {} characters", self.name, NAME_LEN);
        }
        if self.kind.len() > KIND_LEN {
            bail!("type '{}' exceeds {} characters", self.kind, KIND_LEN);
        }
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectionExchange> {
        let major_version = buf.try_get_i16_be()?;
        let minor_version = buf.try_get_i16_be()?;
        let name = buf.try_get_fixed_string(NAME_LEN)?;
        let kind = buf.try_get_fixed_string(KIND_LEN)?;
        let service_type = buf.try_get_fixed_string(SERVICE_TYPE_LEN)?.parse()?;
        let ip = Ipv4Addr::from(buf.try_get_u32_be()?);
        let port = buf.try_get_u16_be()?;
        let secondary_ip = buf.try_get_u32_be()?;
        let secondary_port = buf.try_get_u16_be()?;

        let secondary = if secondary_ip == 0 && secondary_port == 0 {
            None
        }
        else {
            Some((Ipv4Addr::from(secondary_ip), secondary_port))
        };

        let result = ConnectionExchange {
            major_version,
            minor_version,
            name,
            kind,
            service_type,
            ip,
            port,
            secondary,
        };
        result.validate()?;
        Ok(result)
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.validate()?;

        buf.put_i16(self.major_version);
        buf.put_i16(self.minor_version);
        buf.put_fixed_string(&self.name, NAME_LEN)?;
        buf.put_fixed_string(&self.kind, KIND_LEN)?;
        buf.put_fixed_string(self.service_type.as_str(), SERVICE_TYPE_LEN)?;
        buf.put_u32(self.ip.into());
        buf.put_u16(self.port);
        let (secondary_ip, secondary_port) = self.secondary.unwrap_or((Ipv4Addr::UNSPECIFIED, 0));
        buf.put_u32(secondary_ip.into());
        buf.put_u16(secondary_port);
        Ok(())
    }
}
