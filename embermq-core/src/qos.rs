//! MQTT quality of service levels.

use bytes::{Buf, BytesMut};

use crate::codec::{Decoder, Encoder};

/// Delivery guarantee requested for a PUBLISH or granted for a subscription.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
    /// Used when a byte on the wire doesn't map to a known level; callers
    /// are expected to reject the packet rather than act on this value.
    Invalid = 0xff,
}

impl From<u8> for QoS {
    fn from(value: u8) -> Self {
        match value {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::Invalid,
        }
    }
}

impl Encoder for QoS {
    fn encode(&self, buffer: &mut BytesMut) {
        (*self as u8).encode(buffer);
    }

    fn encoded_size(&self) -> usize {
        1
    }
}

impl Decoder for QoS {
    fn decode<T: Buf>(buffer: &mut T) -> crate::Result<Self> {
        Ok(QoS::from(u8::decode(buffer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from(0), QoS::AtMostOnce);
        assert_eq!(QoS::from(1), QoS::AtLeastOnce);
        assert_eq!(QoS::from(2), QoS::ExactlyOnce);
        assert_eq!(QoS::from(3), QoS::Invalid);
    }

    #[test]
    fn test_qos_default() {
        assert_eq!(QoS::default(), QoS::AtMostOnce);
    }
}
