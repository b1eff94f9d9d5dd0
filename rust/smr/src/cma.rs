//! Direct copies into and out of another process's address space.

use std::io;

use crate::iov::{Iov, copy_iov_to_iov};
use crate::proto::RemoteIov;

/// Moves bytes between local buffers and ranges in process `pid`.
/// Returns the number of bytes moved, which may be short.
pub trait ProcessMemory: Send + Sync {
    fn read_from(&self, pid: i32, local: &[Iov], remote: &[RemoteIov]) -> io::Result<usize>;
    fn write_to(&self, pid: i32, local: &[Iov], remote: &[RemoteIov]) -> io::Result<usize>;
}

/// `process_vm_readv` / `process_vm_writev`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cma;

#[cfg(target_os = "linux")]
fn to_iovecs(local: &[Iov], remote: &[RemoteIov]) -> (Vec<libc::iovec>, Vec<libc::iovec>) {
    let l = local
        .iter()
        .map(|v| libc::iovec {
            iov_base: v.base().cast(),
            iov_len: v.len(),
        })
        .collect();
    let r = remote
        .iter()
        .map(|v| libc::iovec {
            iov_base: v.addr as usize as *mut libc::c_void,
            iov_len: v.len as usize,
        })
        .collect();
    (l, r)
}

#[cfg(target_os = "linux")]
impl ProcessMemory for Cma {
    fn read_from(&self, pid: i32, local: &[Iov], remote: &[RemoteIov]) -> io::Result<usize> {
        let (l, r) = to_iovecs(local, remote);
        let n = unsafe {
            libc::process_vm_readv(
                pid,
                l.as_ptr(),
                l.len() as libc::c_ulong,
                r.as_ptr(),
                r.len() as libc::c_ulong,
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write_to(&self, pid: i32, local: &[Iov], remote: &[RemoteIov]) -> io::Result<usize> {
        let (l, r) = to_iovecs(local, remote);
        let n = unsafe {
            libc::process_vm_writev(
                pid,
                l.as_ptr(),
                l.len() as libc::c_ulong,
                r.as_ptr(),
                r.len() as libc::c_ulong,
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(not(target_os = "linux"))]
impl ProcessMemory for Cma {
    fn read_from(&self, _pid: i32, _local: &[Iov], _remote: &[RemoteIov]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn write_to(&self, _pid: i32, _local: &[Iov], _remote: &[RemoteIov]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// Treats remote addresses as addresses in this process. For endpoints that
/// share a process.
#[derive(Debug, Clone, Copy, Default)]
pub struct Loopback;

fn as_local(remote: &[RemoteIov]) -> Vec<Iov> {
    remote
        .iter()
        .map(|r| unsafe { Iov::from_raw(r.addr as usize as *mut u8, r.len as usize) })
        .collect()
}

impl ProcessMemory for Loopback {
    fn read_from(&self, _pid: i32, local: &[Iov], remote: &[RemoteIov]) -> io::Result<usize> {
        Ok(unsafe { copy_iov_to_iov(local, &as_local(remote)) })
    }

    fn write_to(&self, _pid: i32, local: &[Iov], remote: &[RemoteIov]) -> io::Result<usize> {
        Ok(unsafe { copy_iov_to_iov(&as_local(remote), local) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_reads_and_writes() {
        let mut theirs = *b"remote bytes";
        let remote = [Iov::from_mut_slice(&mut theirs).to_remote()];
        let mut mine = [0u8; 12];
        let local = [Iov::from_mut_slice(&mut mine)];

        assert_eq!(Loopback.read_from(0, &local, &remote).unwrap(), 12);
        assert_eq!(&mine, b"remote bytes");

        mine.copy_from_slice(b"local bytes!");
        assert_eq!(Loopback.write_to(0, &local, &remote).unwrap(), 12);
        assert_eq!(&theirs, b"local bytes!");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn cma_reads_own_process() {
        let mut theirs = [0x5au8; 64];
        let remote = [Iov::from_mut_slice(&mut theirs).to_remote()];
        let mut mine = [0u8; 64];
        let local = [Iov::from_mut_slice(&mut mine)];
        match Cma.read_from(std::process::id() as i32, &local, &remote) {
            Ok(n) => {
                assert_eq!(n, 64);
                assert_eq!(mine, [0x5a; 64]);
            }
            // Sandboxes commonly deny ptrace-class access even to self.
            Err(e) => assert!(e.raw_os_error().is_some()),
        }
    }
}
