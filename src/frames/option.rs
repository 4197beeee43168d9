use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use crate::util::buf_ext::{strip_string, Cd11BufExt, Cd11BufMutExt};

/// the only option type defined by CD-1.1: connection establishment
pub const OPTION_TYPE_CONNECTION_ESTABLISHMENT: i32 = 1;
pub const MAX_OPTION_VALUE_LEN: usize = 8;

/// Body of OPTION_REQUEST and OPTION_RESPONSE frames.
///
/// ```ascii
///  0: option count (i32) - always 1
///  4: option type (i32) - always 1
///  8: option size (i32) - unpadded length of the value
/// 12: option value (char[pad4(size)])
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OptionExchange {
    pub option_type: i32,
    pub value: String,
}

pub type OptionRequest = OptionExchange;
pub type OptionResponse = OptionExchange;

impl OptionExchange {
    pub fn new(option_type: i32, value: &str) -> anyhow::Result<OptionExchange> {
        let result = OptionExchange {
            option_type,
            value: value.to_string(),
        };
        result.validate()?;
        Ok(result)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.option_type != OPTION_TYPE_CONNECTION_ESTABLISHMENT {
            bail!("unsupported option type {}", self.option_type);
        }
        let len = self.value.trim().len();
        if len == 0 || len > MAX_OPTION_VALUE_LEN {
            bail!("option value must be between 1 and {} characters, was '{}'", MAX_OPTION_VALUE_LEN, self.value);
        }
        Ok(())
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<OptionExchange> {
        // the option count is fixed at 1 and not interpreted
        let _option_count = buf.try_get_i32_be()?;
        let option_type = buf.try_get_i32_be()?;
        let raw = buf.try_get_sized_padded_bytes("option size")?;

        let result = OptionExchange {
            option_type,
            value: strip_string(&raw),
        };
        result.validate()?;
        Ok(result)
    }

    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.validate()?;
        buf.put_i32(1);
        buf.put_i32(self.option_type);
        buf.put_sized_padded_bytes(self.value.as_bytes())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_ser() {
        let mut buf = BytesMut::new();
        OptionExchange::new(1, "Station").unwrap().ser(&mut buf).unwrap();
        assert_eq!(&buf[..], b"\0\0\0\x01\0\0\0\x01\0\0\0\x07Station\0");

        let mut read = &buf[..];
        assert_eq!(OptionExchange::try_deser(&mut read).unwrap(), OptionExchange::new(1, "Station").unwrap());
        assert!(read.is_empty());
    }

    #[rstest]
    #[case::valid(1, "STA", true)]
    #[case::eight_chars(1, "ABCDEFGH", true)]
    #[case::nine_chars(1, "ABCDEFGHI", false)]
    #[case::empty(1, "", false)]
    #[case::wrong_type(2, "STA", false)]
    fn test_validation(#[case] option_type: i32, #[case] value: &str, #[case] is_valid: bool) {
        assert_eq!(OptionExchange::new(option_type, value).is_ok(), is_valid);
    }

    #[test]
    fn test_deser_rejects_wrong_type() {
        let mut buf: &[u8] = b"\0\0\0\x01\0\0\0\x02\0\0\0\x03STA\0";
        assert!(OptionExchange::try_deser(&mut buf).is_err());
    }
}
