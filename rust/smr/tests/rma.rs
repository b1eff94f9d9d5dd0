//! One-sided writes and reads against registered memory.

mod support;

use std::io;
use std::sync::Arc;

use smr::{
    CompFlags, Iov, Loopback, MrAccess, OpKind, ProcessMemory, RemoteIov, RmaIoc, SmrConfig,
    SmrError,
};
use support::{pair, pair_with_memory, pattern, small_config};

fn ioc(buf: &[u8], key: u64) -> RmaIoc {
    RmaIoc {
        addr: buf.as_ptr() as u64,
        len: buf.len() as u64,
        key,
    }
}

/// Loopback copies that stop after `limit` bytes.
struct ShortCopy {
    limit: usize,
}

impl ProcessMemory for ShortCopy {
    fn read_from(&self, pid: i32, local: &[Iov], remote: &[RemoteIov]) -> io::Result<usize> {
        Loopback.read_from(pid, local, remote).map(|n| n.min(self.limit))
    }

    fn write_to(&self, pid: i32, local: &[Iov], remote: &[RemoteIov]) -> io::Result<usize> {
        Loopback.write_to(pid, local, remote).map(|n| n.min(self.limit))
    }
}

// ============================================================================
// Writes
// ============================================================================

#[test]
fn inline_write_with_remote_data() {
    let mut p = pair(small_config());
    let mut target = vec![0u8; 64];
    p.b.register(1, &mut target, MrAccess::REMOTE_WRITE);
    let mut src = pattern(64, 9);

    unsafe {
        p.a.ep
            .write(p.b_id, &[Iov::from_mut_slice(&mut src)], &[ioc(&target, 1)], Some(0xabc), 3)
            .unwrap();
    }
    let tx = p.a.tx_completions();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].flags, CompFlags::RMA | CompFlags::WRITE);

    p.b.ep.progress().unwrap();
    assert_eq!(target, src);
    let rx = p.b.rx_completions();
    assert_eq!(rx.len(), 1);
    assert_eq!(rx[0].data, 0xabc);
    assert_eq!(rx[0].op, OpKind::Write);
    assert!(rx[0].flags.contains(CompFlags::REMOTE_WRITE | CompFlags::REMOTE_CQ_DATA));
    assert_eq!(rx[0].err, None);
    assert_eq!(p.b.ep.counters().remote_write, 1);
}

#[test]
fn inject_write_spans_targets_without_completion() {
    let mut p = pair(small_config());
    let mut lo = vec![0u8; 1000];
    let mut hi = vec![0u8; 1000];
    p.b.register(1, &mut lo, MrAccess::REMOTE_WRITE);
    p.b.register(2, &mut hi, MrAccess::REMOTE_WRITE);
    let mut src = pattern(2000, 1);

    unsafe {
        p.a.ep
            .write(
                p.b_id,
                &[Iov::from_mut_slice(&mut src)],
                &[ioc(&lo, 1), ioc(&hi, 2)],
                None,
                0,
            )
            .unwrap();
    }
    assert_eq!(p.b.ep.region().credits(), 6);

    p.b.ep.progress().unwrap();
    assert_eq!(&lo[..], &src[..1000]);
    assert_eq!(&hi[..], &src[1000..]);
    assert!(p.b.rx_completions().is_empty());
    assert_eq!(p.b.ep.counters().remote_write, 1);
    assert_eq!(p.b.ep.region().credits(), 8);
    assert_eq!(p.b.ep.region().inject_free(), 4);
}

#[test]
fn large_write_acknowledged() {
    let mut p = pair(small_config());
    let mut target = vec![0u8; 8192];
    p.b.register(1, &mut target, MrAccess::REMOTE_WRITE);
    let mut src = pattern(8192, 2);

    unsafe {
        p.a.ep
            .write(p.b_id, &[Iov::from_mut_slice(&mut src)], &[ioc(&target, 1)], None, 8)
            .unwrap();
    }
    assert!(p.a.tx_completions().is_empty());
    p.b.ep.progress().unwrap();
    assert_eq!(target, src);

    p.a.ep.progress().unwrap();
    let tx = p.a.tx_completions();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].context, 8);
    assert_eq!(tx[0].len, 8192);
    assert_eq!(tx[0].err, None);
}

#[test]
fn unregistered_target_reports_access() {
    let mut p = pair(small_config());
    let mut target = vec![0u8; 8192];
    let mut src = pattern(8192, 3);

    unsafe {
        p.a.ep
            .write(p.b_id, &[Iov::from_mut_slice(&mut src)], &[ioc(&target, 99)], None, 5)
            .unwrap();
    }
    p.b.ep.progress().unwrap();
    let rx = p.b.rx_completions();
    assert_eq!(rx.len(), 1);
    assert_eq!(rx[0].err, Some(SmrError::Access));
    assert!(target.iter().all(|&b| b == 0));
    assert_eq!(p.b.ep.counters().remote_write, 0);

    p.a.ep.progress().unwrap();
    let tx = p.a.tx_completions();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].err, Some(SmrError::Access));
    assert_eq!(tx[0].len, 0);
    assert_eq!(p.b.ep.region().credits(), 8);
}

#[test]
fn write_needs_write_access() {
    let mut p = pair(small_config());
    let mut target = vec![0u8; 32];
    p.b.register(1, &mut target, MrAccess::REMOTE_READ);
    let mut src = pattern(32, 3);

    unsafe {
        p.a.ep
            .write(p.b_id, &[Iov::from_mut_slice(&mut src)], &[ioc(&target, 1)], None, 0)
            .unwrap();
    }
    p.b.ep.progress().unwrap();
    let rx = p.b.rx_completions();
    assert_eq!(rx.len(), 1);
    assert_eq!(rx[0].err, Some(SmrError::Access));
}

#[test]
fn write_targets_must_cover_payload() {
    let mut p = pair(small_config());
    let target = vec![0u8; 16];
    let mut src = pattern(32, 0);
    let r = unsafe {
        p.a.ep
            .write(p.b_id, &[Iov::from_mut_slice(&mut src)], &[ioc(&target, 1)], None, 0)
    };
    assert_eq!(r, Err(SmrError::InvalidArg));
    assert_eq!(p.b.ep.region().credits(), 8);
}

// ============================================================================
// Reads
// ============================================================================

#[test]
fn small_read_goes_through_inject_buffer() {
    let mut p = pair(small_config());
    let mut remote = pattern(1000, 4);
    p.b.register(1, &mut remote, MrAccess::REMOTE_READ);
    let mut local = vec![0u8; 1000];

    unsafe {
        p.a.ep
            .read(p.b_id, &[Iov::from_mut_slice(&mut local)], &[ioc(&remote, 1)], 6)
            .unwrap();
    }
    assert_eq!(p.b.ep.region().inject_free(), 3);

    p.b.ep.progress().unwrap();
    assert!(p.b.rx_completions().is_empty());
    assert_eq!(p.b.ep.counters().remote_read, 1);
    // Still held until the reader copies out.
    assert_eq!(p.b.ep.region().inject_free(), 3);

    p.a.ep.progress().unwrap();
    let tx = p.a.tx_completions();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].context, 6);
    assert_eq!(tx[0].flags, CompFlags::RMA | CompFlags::READ);
    assert_eq!(tx[0].len, 1000);
    assert_eq!(local, remote);
    assert_eq!(p.b.ep.region().inject_free(), 4);
}

#[test]
fn large_read_copies_directly() {
    let mut p = pair(small_config());
    let mut remote = pattern(8192, 5);
    p.b.register(1, &mut remote, MrAccess::REMOTE_READ);
    let mut local = vec![0u8; 8192];

    unsafe {
        p.a.ep
            .read(p.b_id, &[Iov::from_mut_slice(&mut local)], &[ioc(&remote, 1)], 1)
            .unwrap();
    }
    p.b.ep.progress().unwrap();
    p.a.ep.progress().unwrap();
    let tx = p.a.tx_completions();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].err, None);
    assert_eq!(local, remote);
}

#[test]
fn short_direct_read_fails_without_leaks() {
    let mut p = pair_with_memory(small_config(), Arc::new(ShortCopy { limit: 2048 }));
    let mut remote = pattern(8192, 6);
    p.b.register(1, &mut remote, MrAccess::REMOTE_READ);
    let mut local = vec![0u8; 8192];

    unsafe {
        p.a.ep
            .read(p.b_id, &[Iov::from_mut_slice(&mut local)], &[ioc(&remote, 1)], 2)
            .unwrap();
    }
    p.b.ep.progress().unwrap();
    let rx = p.b.rx_completions();
    assert_eq!(rx.len(), 1);
    assert_eq!(rx[0].err, Some(SmrError::Io));
    assert_eq!(p.b.ep.counters().remote_read, 0);

    p.a.ep.progress().unwrap();
    let tx = p.a.tx_completions();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].err, Some(SmrError::Io));
    assert_eq!(tx[0].len, 0);

    assert_eq!(p.a.ep.pending_sends(), 0);
    assert_eq!(p.b.ep.region().credits(), 8);
    assert_eq!(p.b.ep.region().inject_free(), 4);
}

// ============================================================================
// Mapped-file transfers
// ============================================================================

fn mapped_config(dir: &std::path::Path) -> SmrConfig {
    SmrConfig {
        cma: false,
        map_dir: dir.to_path_buf(),
        ..small_config()
    }
}

#[test]
fn mapped_send_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = pair(mapped_config(dir.path()));
    let mut msg = pattern(8192, 7);
    let mut buf = vec![0u8; 8192];
    let path = smr::map_path(dir.path(), "a", 0);

    unsafe {
        p.b.ep
            .recv(&[Iov::from_mut_slice(&mut buf)], None, 1, smr::OpFlags::empty())
            .unwrap();
        p.a.ep
            .send(p.b_id, &[Iov::from_mut_slice(&mut msg)], 2)
            .unwrap();
    }
    assert!(path.exists());

    p.b.ep.progress().unwrap();
    assert!(!path.exists());
    assert_eq!(buf, msg);

    p.a.ep.progress().unwrap();
    let tx = p.a.tx_completions();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].len, 8192);
    assert_eq!(tx[0].err, None);
    assert_eq!(p.a.ep.pending_sends(), 0);
}

#[test]
fn mapped_read_round_trips_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut p = pair(mapped_config(dir.path()));
    let mut remote = pattern(10_000, 8);
    p.b.register(4, &mut remote, MrAccess::REMOTE_READ);
    let mut local = vec![0u8; 10_000];

    unsafe {
        p.a.ep
            .read(p.b_id, &[Iov::from_mut_slice(&mut local)], &[ioc(&remote, 4)], 3)
            .unwrap();
    }
    p.b.ep.progress().unwrap();
    p.a.ep.progress().unwrap();
    let tx = p.a.tx_completions();
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].err, None);
    assert_eq!(local, remote);
    assert!(!smr::map_path(dir.path(), "a", 0).exists());
}

// ============================================================================
// Async notices
// ============================================================================

#[test]
fn async_notices_only_count() {
    let mut p = pair(small_config());
    p.a.ep.write_async_notice(p.b_id).unwrap();
    p.a.ep.read_async_notice(p.b_id).unwrap();
    p.a.ep.read_async_notice(p.b_id).unwrap();
    assert!(p.a.tx_completions().is_empty());

    p.b.ep.progress().unwrap();
    assert!(p.b.rx_completions().is_empty());
    let counters = p.b.ep.counters();
    assert_eq!(counters.remote_write, 1);
    assert_eq!(counters.remote_read, 2);
}
