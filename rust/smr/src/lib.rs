//! Progress engine for a single-host shared-memory transport.
//!
//! Every endpoint owns a region that its peers map. A peer issues an
//! operation by writing a command into the endpoint's command queue; the
//! endpoint's progress call carries it out and, when the peer asked for
//! one, publishes a status into a response slot in the peer's own region.
//!
//! ```text
//!   sender                                     receiver
//!   ┌───────────────────────┐  command   ┌───────────────────────┐
//!   │ region                │ ─────────▶ │ region                │
//!   │  cmd queue            │            │  cmd queue            │
//!   │  resp queue  ◀────────┼─── status ─┤  inject pool          │
//!   │  inject pool          │            │                       │
//!   └───────────────────────┘            └───────────────────────┘
//! ```
//!
//! Payloads travel one of four ways, picked per command by size:
//! inline in the command, through an inject buffer in the receiver's pool,
//! by a direct cross-process copy, or through a one-shot mapped file.
//!
//! # Usage
//!
//! ```ignore
//! use smr::{Endpoint, Iov, OpFlags, connect};
//!
//! let mut a = Endpoint::builder("a").build()?;
//! let mut b = Endpoint::builder("b").build()?;
//! let (b_id, _) = connect(&mut a, &mut b);
//!
//! let mut buf = [0u8; 64];
//! let mut msg = *b"hello";
//! unsafe { b.recv(&[Iov::from_mut_slice(&mut buf)], None, 1, OpFlags::empty())? };
//! unsafe { a.send(b_id, &[Iov::from_mut_slice(&mut msg)], 2)? };
//! b.progress()?;
//! ```
//!
//! Locking: a progress call holds its own region lock and the matching
//! completion queue lock. Peer regions are only ever try-locked; a failed
//! attempt returns [`SmrError::WouldBlock`] and the work is retried on the
//! next call.

#[macro_use]
mod macros;

pub mod atomic;
pub mod cma;
pub mod config;
pub mod cq;
pub mod ep;
pub mod error;
pub mod iov;
pub mod matching;
pub mod mr;
pub mod peer;
pub mod pool;
pub mod progress;
pub mod proto;
pub mod region;
pub mod tx;
pub mod xfer;

pub use atomic::{AtomicOp, Datatype};
pub use cma::{Cma, Loopback, ProcessMemory};
pub use config::SmrConfig;
pub use cq::{BoundedCq, CompFlags, Completion, CompletionQueue, CqError, SharedCq};
pub use ep::{Counters, Endpoint, EndpointBuilder, connect};
pub use error::{RegionError, SmrError};
pub use iov::Iov;
pub use matching::{QueueKind, RxEntry};
pub use mr::{MrAccess, MrMap, MrVerifier};
pub use proto::{
    Command, OpFlags, OpKind, RESP_BUSY, RemoteIov, Response, RmaIoc, SMR_COMP_DATA_LEN,
    SMR_COMP_INJECT_SIZE, SMR_INJECT_SIZE, SMR_IOV_LIMIT, SMR_MSG_DATA_LEN, SMR_NAME_MAX, SrcKind,
};
pub use region::{RegionGuard, SmrRegion};
pub use tx::AtomicRequest;
pub use xfer::{XferResult, map_path};
