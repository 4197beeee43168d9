use anyhow::bail;
use bytes::{Buf, BytesMut};

use crate::util::buf_ext::{strip_string, Cd11BufExt, Cd11BufMutExt};

/// ```ascii
/// 0: size (i32)
/// 4: message (char[pad4(size)])
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Alert {
    pub message: String,
}

impl Alert {
    pub fn new(message: &str) -> anyhow::Result<Alert> {
        let alert = Alert { message: message.to_string() };
        alert.validate()?;
        Ok(alert)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.message.trim().is_empty() {
            bail!("alert message must not be empty");
        }
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Alert> {
        let raw = buf.try_get_sized_padded_bytes("alert size")?;
        let alert = Alert { message: strip_string(&raw) };
        alert.validate()?;
        Ok(alert)
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.validate()?;
        buf.put_sized_padded_bytes(self.message.as_bytes())
    }
}
