//! Port, address and remote-endpoint types.

use std::fmt;

/// Physical port state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Nop,
    Down,
    Init,
    Armed,
    Active,
    ActiveDefer,
    Unknown(u32),
}

impl PortState {
    fn from_raw(v: u32) -> Self {
        match v {
            ibverbs_sys::ibv_port_state_IBV_PORT_NOP => Self::Nop,
            ibverbs_sys::ibv_port_state_IBV_PORT_DOWN => Self::Down,
            ibverbs_sys::ibv_port_state_IBV_PORT_INIT => Self::Init,
            ibverbs_sys::ibv_port_state_IBV_PORT_ARMED => Self::Armed,
            ibverbs_sys::ibv_port_state_IBV_PORT_ACTIVE => Self::Active,
            ibverbs_sys::ibv_port_state_IBV_PORT_ACTIVE_DEFER => Self::ActiveDefer,
            other => Self::Unknown(other),
        }
    }
}

/// The subset of `ibv_port_attr` the transport cares about.
#[derive(Debug, Clone, Copy)]
pub struct PortAttr {
    pub state: PortState,
    pub lid: u16,
    /// Active path MTU, as the raw `ibv_mtu` enum value.
    pub active_mtu: u32,
    pub link_layer: u8,
}

impl PortAttr {
    pub(crate) fn from_raw(raw: &ibverbs_sys::ibv_port_attr) -> Self {
        Self {
            state: PortState::from_raw(raw.state),
            lid: raw.lid,
            active_mtu: raw.active_mtu,
            link_layer: raw.link_layer,
        }
    }
}

/// A 128-bit global identifier.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Gid([u8; 16]);

impl Gid {
    pub fn from_raw(raw: [u8; 16]) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> [u8; 16] {
        self.0
    }

    /// An all-zero GID, meaning "LID routing only".
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chunk) in self.0.chunks(2).enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}{:02x}", chunk[0], chunk[1])?;
        }
        Ok(())
    }
}

/// Everything needed to address a remote RC queue pair.
#[derive(Debug, Clone, Copy)]
pub struct RemoteQpInfo {
    /// Remote QP number.
    pub qp_number: u32,
    /// Remote initial packet sequence number.
    pub packet_sequence_number: u32,
    /// Remote LID.
    pub local_identifier: u16,
    /// Remote GID; zero when the fabric routes by LID alone.
    pub global_identifier: Gid,
}
