use std::fmt::{Display, Formatter};
use anyhow::anyhow;
use num_enum::{IntoPrimitive, TryFromPrimitive};


/// Wire codes of CD-1.1 frame types.
///
/// `CustomResetFrame` is a private protocol extension between specific peers: it asks the
///  receiving side to drop its gap state and restart. `MalformedFrame` never appears on the wire,
///  it tags frames that failed to parse.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(i32)]
pub enum FrameType {
    ConnectionRequest = 1,
    ConnectionResponse = 2,
    OptionRequest = 3,
    OptionResponse = 4,
    Data = 5,
    Acknack = 6,
    Alert = 7,
    CommandRequest = 8,
    CommandResponse = 9,
    Cd1Encapsulation = 13,
    CustomResetFrame = 26,
    MalformedFrame = 27,
}

impl FrameType {
    /// maps a frame type code read from the wire, rejecting unknown codes and the internal
    ///  `MalformedFrame` marker
    pub fn from_wire(code: i32) -> anyhow::Result<FrameType> {
        match FrameType::try_from(code) {
            Ok(FrameType::MalformedFrame) | Err(_) => Err(anyhow!("invalid CD-1.1 frame type {}", code)),
            Ok(frame_type) => Ok(frame_type),
        }
    }

    pub fn is_valid_wire_code(code: i32) -> bool {
        Self::from_wire(code).is_ok()
    }

    pub fn code(self) -> i32 {
        self.into()
    }
}

impl Display for FrameType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FrameType::ConnectionRequest => "CONNECTION_REQUEST",
            FrameType::ConnectionResponse => "CONNECTION_RESPONSE",
            FrameType::OptionRequest => "OPTION_REQUEST",
            FrameType::OptionResponse => "OPTION_RESPONSE",
            FrameType::Data => "DATA",
            FrameType::Acknack => "ACKNACK",
            FrameType::Alert => "ALERT",
            FrameType::CommandRequest => "COMMAND_REQUEST",
            FrameType::CommandResponse => "COMMAND_RESPONSE",
            FrameType::Cd1Encapsulation => "CD_ONE_ENCAPSULATION",
            FrameType::CustomResetFrame => "CUSTOM_RESET_FRAME",
            FrameType::MalformedFrame => "MALFORMED_FRAME",
        };
        write!(f, "{}", name)
    }
}
