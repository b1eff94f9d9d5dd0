//! Per-endpoint shared region.
//!
//! Layout (all offsets 64-byte aligned):
//!
//! ```text
//! [RegionHeader: 128][cmd queue: Cirque<Command>][resp queue: Cirque<Response>][inject pool]
//! ```
//!
//! The header lock guards both queues and the credit counter. Every other
//! process that holds a peer's region only ever `try_lock`s it.

use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use smr_primitives::{
    Cirque, FreeStack, HeapRegion, MmapRegion, Region, ShmLock, ShmLockGuard, align_up,
};

use crate::config::SmrConfig;
use crate::error::{RegionError, SmrError};
use crate::proto::{Command, Response, SMR_INJECT_SIZE, SMR_NAME_MAX};

pub const MAGIC: [u8; 8] = *b"SMRPROG\x01";
pub const VERSION: u32 = 1;

/// Region header (128 bytes).
#[repr(C, align(64))]
pub struct RegionHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub pid: i32,
    pub total_size: u64,
    pub cmd_queue_offset: u64,
    pub resp_queue_offset: u64,
    pub inject_pool_offset: u64,
    /// Command slots senders may still fill.
    pub cmd_cnt: AtomicI64,
    pub lock: ShmLock,
    pub name_len: u32,
    pub name: [u8; SMR_NAME_MAX],
}

const _: () = assert!(size_of::<RegionHeader>() == 128);

/// Offsets of each structure, derived from a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub cmd_queue_offset: usize,
    pub resp_queue_offset: usize,
    pub inject_pool_offset: usize,
    pub total_size: usize,
}

impl RegionLayout {
    pub fn compute(config: &SmrConfig) -> Result<Self, &'static str> {
        config.validate()?;
        let cmd_queue_offset = align_up(size_of::<RegionHeader>(), 64);
        let resp_queue_offset = align_up(
            cmd_queue_offset + Cirque::<Command>::required_size(config.cmd_queue_size),
            64,
        );
        let inject_pool_offset = align_up(
            resp_queue_offset + Cirque::<Response>::required_size(config.resp_queue_size),
            64,
        );
        let total_size = inject_pool_offset
            + FreeStack::required_size(config.inject_count, SMR_INJECT_SIZE as u32);
        Ok(Self {
            cmd_queue_offset,
            resp_queue_offset,
            inject_pool_offset,
            total_size,
        })
    }
}

enum Backing {
    Heap(#[allow(dead_code)] HeapRegion),
    Mapped(#[allow(dead_code)] MmapRegion),
}

/// Handle to a region, either our own or a peer's. Clones share the mapping.
#[derive(Clone)]
pub struct SmrRegion {
    _backing: Arc<Backing>,
    region: Region,
    cmd: Cirque<Command>,
    resp: Cirque<Response>,
    inject: FreeStack,
}

impl SmrRegion {
    /// Region in private memory, for endpoints whose peers share this
    /// process.
    pub fn create(name: &str, config: &SmrConfig) -> Result<Self, RegionError> {
        let layout = RegionLayout::compute(config).map_err(RegionError::Config)?;
        let heap = HeapRegion::new_zeroed(layout.total_size);
        let region = heap.region();
        unsafe { Self::init(region, &layout, name, config, Backing::Heap(heap)) }
    }

    /// Region in a file other processes can [`attach`](Self::attach) to.
    /// The file is removed when the last handle is dropped.
    pub fn create_mapped(path: &Path, name: &str, config: &SmrConfig) -> Result<Self, RegionError> {
        let layout = RegionLayout::compute(config).map_err(RegionError::Config)?;
        let map = MmapRegion::create(path, layout.total_size)?;
        let region = map.region();
        unsafe { Self::init(region, &layout, name, config, Backing::Mapped(map)) }
    }

    unsafe fn init(
        region: Region,
        layout: &RegionLayout,
        name: &str,
        config: &SmrConfig,
        backing: Backing,
    ) -> Result<Self, RegionError> {
        if name.is_empty() || name.len() > SMR_NAME_MAX {
            return Err(RegionError::Config("name must be 1-64 bytes"));
        }
        if name.contains('/') {
            return Err(RegionError::Config("name must not contain '/'"));
        }

        let header: &mut RegionHeader = unsafe { region.get_mut(0) };
        header.magic = MAGIC;
        header.version = VERSION;
        header.pid = std::process::id() as i32;
        header.total_size = layout.total_size as u64;
        header.cmd_queue_offset = layout.cmd_queue_offset as u64;
        header.resp_queue_offset = layout.resp_queue_offset as u64;
        header.inject_pool_offset = layout.inject_pool_offset as u64;
        header.cmd_cnt = AtomicI64::new(config.cmd_queue_size as i64);
        header.lock.init();
        header.name_len = name.len() as u32;
        header.name = [0; SMR_NAME_MAX];
        header.name[..name.len()].copy_from_slice(name.as_bytes());

        let cmd = unsafe { Cirque::init(region, layout.cmd_queue_offset, config.cmd_queue_size) };
        let resp =
            unsafe { Cirque::init(region, layout.resp_queue_offset, config.resp_queue_size) };
        let inject = unsafe {
            FreeStack::init(
                region,
                layout.inject_pool_offset,
                config.inject_count,
                SMR_INJECT_SIZE as u32,
            )
        };

        info!(
            name,
            size = layout.total_size,
            cmd_slots = config.cmd_queue_size,
            inject_bufs = config.inject_count,
            "region created"
        );
        Ok(Self {
            _backing: Arc::new(backing),
            region,
            cmd,
            resp,
            inject,
        })
    }

    /// Map a region another process created.
    pub fn attach(path: &Path) -> Result<Self, RegionError> {
        let map = MmapRegion::attach(path)?;
        let region = map.region();
        let header: &RegionHeader = unsafe { region.try_get(0) }
            .ok_or(RegionError::BadHeader("file smaller than header"))?;
        if header.magic != MAGIC {
            return Err(RegionError::BadHeader("bad magic"));
        }
        if header.version != VERSION {
            return Err(RegionError::BadHeader("unsupported version"));
        }
        if header.total_size as usize > region.len() {
            return Err(RegionError::BadHeader("file shorter than recorded size"));
        }
        if header.name_len as usize > SMR_NAME_MAX {
            return Err(RegionError::BadHeader("name too long"));
        }

        let cmd = unsafe { Cirque::attach(region, header.cmd_queue_offset as usize) }
            .map_err(RegionError::BadHeader)?;
        let resp = unsafe { Cirque::attach(region, header.resp_queue_offset as usize) }
            .map_err(RegionError::BadHeader)?;
        let inject = unsafe { FreeStack::attach(region, header.inject_pool_offset as usize) }
            .map_err(RegionError::BadHeader)?;

        Ok(Self {
            _backing: Arc::new(Backing::Mapped(map)),
            region,
            cmd,
            resp,
            inject,
        })
    }

    #[inline]
    fn header(&self) -> &RegionHeader {
        unsafe { self.region.get(0) }
    }

    #[inline]
    pub fn pid(&self) -> i32 {
        self.header().pid
    }

    pub fn name(&self) -> &str {
        let header = self.header();
        std::str::from_utf8(&header.name[..header.name_len as usize]).unwrap_or("")
    }

    /// Commands senders may still enqueue.
    #[inline]
    pub fn credits(&self) -> i64 {
        self.header().cmd_cnt.load(Ordering::Acquire)
    }

    /// Free inject buffers.
    #[inline]
    pub fn inject_free(&self) -> u32 {
        self.inject.free_count()
    }

    /// Entries waiting in the command queue.
    #[inline]
    pub fn pending_commands(&self) -> u64 {
        self.cmd.len()
    }

    /// True if both handles address the same mapping.
    #[inline]
    pub fn same_mapping(&self, other: &SmrRegion) -> bool {
        self.region.as_ptr() == other.region.as_ptr()
    }

    /// Response slot at `offset`, if the offset names one.
    pub fn response_at(&self, offset: u64) -> Option<&Response> {
        let off = usize::try_from(offset).ok()?;
        self.resp.slot_at(off)?;
        unsafe { self.region.try_get(off) }
    }

    /// Local address of the inject buffer at `offset`, if the offset names
    /// one.
    pub fn inject_ptr(&self, offset: u64) -> Option<*mut u8> {
        let off = usize::try_from(offset).ok()?;
        self.inject.index_of(off)?;
        self.region.span(off, SMR_INJECT_SIZE)
    }

    /// Block until the region lock is ours.
    pub fn lock(&self) -> RegionGuard<'_> {
        RegionGuard {
            region: self,
            _guard: self.header().lock.lock(),
        }
    }

    /// Take the region lock only if it is free.
    pub fn try_lock(&self) -> Option<RegionGuard<'_>> {
        self.header().lock.try_lock().map(|guard| RegionGuard {
            region: self,
            _guard: guard,
        })
    }
}

/// Exclusive access to a region's queues, pool and credit.
pub struct RegionGuard<'a> {
    region: &'a SmrRegion,
    _guard: ShmLockGuard<'a>,
}

impl RegionGuard<'_> {
    #[inline]
    pub fn region(&self) -> &SmrRegion {
        self.region
    }

    #[inline]
    pub fn cmd_queue(&self) -> &Cirque<Command> {
        &self.region.cmd
    }

    #[inline]
    pub fn resp_queue(&self) -> &Cirque<Response> {
        &self.region.resp
    }

    /// Remove the head command and give its slot's credit back.
    pub fn discard_cmd(&self) {
        if self.region.cmd.discard() {
            self.region.header().cmd_cnt.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Spend `n` credits if that many are left.
    pub fn take_credit(&self, n: i64) -> bool {
        let cnt = &self.region.header().cmd_cnt;
        if cnt.load(Ordering::Acquire) < n {
            return false;
        }
        cnt.fetch_sub(n, Ordering::AcqRel);
        true
    }

    #[inline]
    pub fn credits(&self) -> i64 {
        self.region.credits()
    }

    /// Take an inject buffer, returning its region offset.
    pub fn alloc_inject(&self) -> Option<u64> {
        let index = self.region.inject.pop()?;
        Some(self.region.inject.object_offset(index) as u64)
    }

    /// Return the inject buffer at `offset` to the pool.
    pub fn release_inject(&self, offset: u64) -> Result<(), SmrError> {
        let index = usize::try_from(offset)
            .ok()
            .and_then(|off| self.region.inject.index_of(off))
            .ok_or(SmrError::InvalidArg)?;
        self.region.inject.push(index).map_err(|e| {
            warn!(offset, error = %e, "inject buffer release rejected");
            SmrError::InvalidArg
        })
    }

    /// The inject buffer at `offset` as bytes.
    ///
    /// # Safety
    ///
    /// The buffer must be allocated and not aliased by another live slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn inject_bytes(&self, offset: u64) -> Option<&mut [u8]> {
        let ptr = self.region.inject_ptr(offset)?;
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, SMR_INJECT_SIZE) })
    }
}
