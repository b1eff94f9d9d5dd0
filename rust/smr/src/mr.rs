//! Memory-registration checks for RMA and atomic targets.

use std::collections::HashMap;

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::atomic::AtomicOp;
use crate::error::SmrError;
use crate::proto::OpKind;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MrAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const REMOTE_READ = 1 << 2;
        const REMOTE_WRITE = 1 << 3;
    }
}

impl MrAccess {
    /// Access a target range needs for an inbound operation.
    pub fn for_remote(op: OpKind, atomic_op: Option<AtomicOp>) -> MrAccess {
        match op {
            OpKind::ReadReq => MrAccess::REMOTE_READ,
            OpKind::AtomicFetch if atomic_op == Some(AtomicOp::Read) => MrAccess::REMOTE_READ,
            OpKind::AtomicFetch | OpKind::AtomicCompare => {
                MrAccess::REMOTE_READ | MrAccess::REMOTE_WRITE
            }
            _ => MrAccess::REMOTE_WRITE,
        }
    }
}

/// Validates a remote target range before the engine touches it.
pub trait MrVerifier: Send + Sync {
    /// Returns the local address to use for `addr`.
    fn verify(&self, addr: u64, len: usize, key: u64, access: MrAccess) -> Result<u64, SmrError>;
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    base: u64,
    len: usize,
    access: MrAccess,
}

/// Key-indexed registrations with virtual addressing.
#[derive(Default)]
pub struct MrMap {
    regs: RwLock<HashMap<u64, Registration>>,
}

impl MrMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `buf` under `key`.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid until [`deregister`](Self::deregister), since
    /// peers will read and write it through the returned key.
    pub unsafe fn register(&self, key: u64, buf: &mut [u8], access: MrAccess) -> Result<(), SmrError> {
        let mut regs = self.regs.write();
        if regs.contains_key(&key) {
            return Err(SmrError::InvalidArg);
        }
        regs.insert(
            key,
            Registration {
                base: buf.as_mut_ptr() as u64,
                len: buf.len(),
                access,
            },
        );
        Ok(())
    }

    pub fn deregister(&self, key: u64) -> bool {
        self.regs.write().remove(&key).is_some()
    }
}

impl MrVerifier for MrMap {
    fn verify(&self, addr: u64, len: usize, key: u64, access: MrAccess) -> Result<u64, SmrError> {
        let regs = self.regs.read();
        let reg = regs.get(&key).ok_or(SmrError::Access)?;
        if !reg.access.contains(access) {
            return Err(SmrError::Access);
        }
        let end = addr.checked_add(len as u64).ok_or(SmrError::Access)?;
        if addr < reg.base || end > reg.base + reg.len as u64 {
            return Err(SmrError::Access);
        }
        Ok(addr)
    }
}
