//! What goes over the wire besides the payload itself: the buffer descriptor exchanged as
//! connection private data, and the fixed work-request identifiers.
use std::mem;

use static_assertions::const_assert_eq;

use crate::Error;

/// Port the server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 20079;

/// Address and remote key of a registered receive buffer, as advertised to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RemoteBufferDescriptor {
    pub addr: u64,
    pub rkey: u32,
}

/// `{ addr: u64 BE, rkey: u32 BE }`, packed.
pub const DESCRIPTOR_LEN: usize = mem::size_of::<u64>() + mem::size_of::<u32>();
const_assert_eq!(DESCRIPTOR_LEN, 12);

impl RemoteBufferDescriptor {
    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut buf = [0u8; DESCRIPTOR_LEN];
        buf[..8].copy_from_slice(&self.addr.to_be_bytes());
        buf[8..].copy_from_slice(&self.rkey.to_be_bytes());
        buf
    }

    /// Decodes the leading 12 bytes. Transports may pad private data, trailing bytes are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < DESCRIPTOR_LEN {
            return Err(Error::InvalidPrivateData(data.len()));
        }
        let mut addr = [0u8; 8];
        let mut rkey = [0u8; 4];
        addr.copy_from_slice(&data[..8]);
        rkey.copy_from_slice(&data[8..DESCRIPTOR_LEN]);
        Ok(RemoteBufferDescriptor {
            addr: u64::from_be_bytes(addr),
            rkey: u32::from_be_bytes(rkey),
        })
    }
}

/// Work-request identifiers. Every receive is posted as `Recv` and every send as `Send`; no
/// other value is ever used.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WrId {
    Recv = 0,
    Send = 1,
}

impl WrId {
    #[inline]
    pub fn as_raw(self) -> u64 {
        self as u64
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Option<WrId> {
        match raw {
            0 => Some(WrId::Recv),
            1 => Some(WrId::Send),
            _ => None,
        }
    }
}
