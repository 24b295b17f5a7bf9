use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::Error;

/// Protocol version carried by every header.
pub const VERSION: u16 = 1;
/// Encoded header size on the wire.
pub const HEADER_LEN: usize = 8;
/// Largest payload a DATA packet may carry.
pub const MAX_PAYLOAD: usize = 1000;

/*
 0               1               2               3
 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
+-------------------------------+-------------------------------+
|           version             |             type              |
+-------------------------------+-------------------------------+
|                           seqno                               |
+---------------------------------------------------------------+
|                payload (0..1000 bytes, DATA only)             |
+---------------------------------------------------------------+

All fields travel in network byte order. SYN, ACK and FIN are header-only
datagrams.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Syn = 1,
    Ack = 2,
    Data = 3,
    Fin = 4,
}

impl TryFrom<u16> for Kind {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self, Error> {
        match raw {
            1 => Ok(Kind::Syn),
            2 => Ok(Kind::Ack),
            3 => Ok(Kind::Data),
            4 => Ok(Kind::Fin),
            _ => Err(Error::Malformed("unknown packet type")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: Kind,
    pub seq: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn syn(seq: u32) -> Self {
        Packet {
            kind: Kind::Syn,
            seq,
            payload: Bytes::new(),
        }
    }

    pub fn ack(seq: u32) -> Self {
        Packet {
            kind: Kind::Ack,
            seq,
            payload: Bytes::new(),
        }
    }

    pub fn fin(seq: u32) -> Self {
        Packet {
            kind: Kind::Fin,
            seq,
            payload: Bytes::new(),
        }
    }

    pub fn data(seq: u32, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);

        Packet {
            kind: Kind::Data,
            seq,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());

        buf.put_u16(VERSION);
        buf.put_u16(self.kind as u16);
        buf.put_u32(self.seq);
        buf.put_slice(&self.payload);

        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Packet, Error> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Malformed("short datagram"));
        }

        if buf.get_u16() != VERSION {
            return Err(Error::Malformed("version mismatch"));
        }

        let kind = Kind::try_from(buf.get_u16())?;
        let seq = buf.get_u32();

        if buf.len() > MAX_PAYLOAD {
            return Err(Error::Malformed("payload over cap"));
        }

        if kind != Kind::Data && !buf.is_empty() {
            return Err(Error::Malformed("payload on control packet"));
        }

        Ok(Packet {
            kind,
            seq,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_layout_is_big_endian() {
        let wire = Packet::data(0x01020304, b"hi").encode();

        assert_eq!(
            &wire[..],
            &[0x00, 0x01, 0x00, 0x03, 0x01, 0x02, 0x03, 0x04, b'h', b'i']
        );
    }

    #[test]
    fn control_packets_are_header_only() {
        for (packet, code) in [
            (Packet::syn(7), 1u8),
            (Packet::ack(7), 2),
            (Packet::fin(7), 4),
        ] {
            let wire = packet.encode();

            assert_eq!(wire.len(), HEADER_LEN);
            assert_eq!(&wire[..4], &[0x00, 0x01, 0x00, code]);
            assert_eq!(&wire[4..], &[0x00, 0x00, 0x00, 0x07]);
        }
    }

    #[test]
    fn decode_round_trips() {
        let packet = Packet::data(42, b"payload");

        assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);

        let ack = Packet::ack(2_000_000_000);

        assert_eq!(Packet::decode(&ack.encode()).unwrap(), ack);
    }

    #[test]
    fn decode_rejects_garbage() {
        // Truncated header.
        assert!(Packet::decode(&[0x00, 0x01, 0x00]).is_err());

        // Wrong version.
        let mut wire = Packet::syn(1).encode().to_vec();
        wire[1] = 0x09;
        assert!(Packet::decode(&wire).is_err());

        // Unknown type code.
        let mut wire = Packet::syn(1).encode().to_vec();
        wire[3] = 0x08;
        assert!(Packet::decode(&wire).is_err());

        // Payload on a control packet.
        let mut wire = Packet::fin(1).encode().to_vec();
        wire.push(b'x');
        assert!(Packet::decode(&wire).is_err());

        // Payload over the cap.
        let mut wire = Packet::data(1, &[0u8; MAX_PAYLOAD]).encode().to_vec();
        wire.push(0);
        assert!(Packet::decode(&wire).is_err());
    }
}
