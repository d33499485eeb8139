//! The one-shot setup record exchanged over the control socket.
//!
//! Each side sends exactly one fixed-size record: its queue-pair setup
//! information plus the address and remote key of its inbox memory region.
//! The encoding is explicit little-endian with fixed packing, so two hosts
//! of different endianness still interoperate.

use verbs::{Gid, RemoteQpInfo};

/// Local queue-pair setup information, as sent to the peer.
#[derive(Debug, Clone, Copy)]
pub struct SetupInfo {
    /// Local identifier of the port the QP is bound to.
    pub lid: u16,
    /// Queue pair number.
    pub qpn: u32,
    /// Initial packet sequence number.
    pub psn: u32,
    /// Port GID; all-zero when the fabric routes by LID alone.
    pub gid: [u8; 16],
}

impl SetupInfo {
    pub fn to_remote(self) -> RemoteQpInfo {
        RemoteQpInfo {
            qp_number: self.qpn,
            packet_sequence_number: self.psn,
            local_identifier: self.lid,
            global_identifier: Gid::from_raw(self.gid),
        }
    }
}

/// Encoded size of an [`Exchange`] on the wire.
///
/// lid(2) + qpn(4) + psn(4) + gid(16) + addr(8) + rkey(4).
pub const EXCHANGE_LEN: usize = 38;

/// The full bootstrap record.
#[derive(Debug, Clone, Copy)]
pub struct Exchange {
    pub setup: SetupInfo,
    /// Virtual address of the sender's inbox buffer.
    pub inbox_addr: u64,
    /// Remote key of the sender's inbox memory region.
    pub inbox_rkey: u32,
}

impl Exchange {
    pub fn encode(&self) -> [u8; EXCHANGE_LEN] {
        let mut buf = [0u8; EXCHANGE_LEN];
        buf[0..2].copy_from_slice(&self.setup.lid.to_le_bytes());
        buf[2..6].copy_from_slice(&self.setup.qpn.to_le_bytes());
        buf[6..10].copy_from_slice(&self.setup.psn.to_le_bytes());
        buf[10..26].copy_from_slice(&self.setup.gid);
        buf[26..34].copy_from_slice(&self.inbox_addr.to_le_bytes());
        buf[34..38].copy_from_slice(&self.inbox_rkey.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; EXCHANGE_LEN]) -> Self {
        let mut gid = [0u8; 16];
        gid.copy_from_slice(&buf[10..26]);
        Self {
            setup: SetupInfo {
                lid: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
                qpn: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
                psn: u32::from_le_bytes(buf[6..10].try_into().unwrap()),
                gid,
            },
            inbox_addr: u64::from_le_bytes(buf[26..34].try_into().unwrap()),
            inbox_rkey: u32::from_le_bytes(buf[34..38].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let ex = Exchange {
            setup: SetupInfo {
                lid: 0x1234,
                qpn: 0xAABBCC,
                psn: 0x112233,
                gid: [9u8; 16],
            },
            inbox_addr: 0x1000_0000_2000_0040,
            inbox_rkey: 0xDEADBEEF,
        };

        let buf = ex.encode();
        assert_eq!(buf.len(), EXCHANGE_LEN);
        assert_eq!(&buf[0..2], &[0x34, 0x12]);
        assert_eq!(&buf[10..26], &[9u8; 16]);
        assert_eq!(&buf[34..38], &[0xEF, 0xBE, 0xAD, 0xDE]);

        let back = Exchange::decode(&buf);
        assert_eq!(back.setup.lid, ex.setup.lid);
        assert_eq!(back.setup.qpn, ex.setup.qpn);
        assert_eq!(back.setup.psn, ex.setup.psn);
        assert_eq!(back.setup.gid, ex.setup.gid);
        assert_eq!(back.inbox_addr, ex.inbox_addr);
        assert_eq!(back.inbox_rkey, ex.inbox_rkey);
    }
}
