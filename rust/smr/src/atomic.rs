//! Element-wise atomic operations on target memory.
//!
//! Three families: swap-style (conditional on a comparand), fetch-style
//! (read-modify-write that echoes old values) and write-only. All of them run
//! under the target region's lock, so plain loads and stores suffice.

use std::ptr;

use crate::error::SmrError;
use crate::proto::SMR_INJECT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Datatype {
    I8 = 0,
    U8 = 1,
    I16 = 2,
    U16 = 3,
    I32 = 4,
    U32 = 5,
    I64 = 6,
    U64 = 7,
    F32 = 8,
    F64 = 9,
}

impl Datatype {
    pub const fn size(self) -> usize {
        match self {
            Datatype::I8 | Datatype::U8 => 1,
            Datatype::I16 | Datatype::U16 => 2,
            Datatype::I32 | Datatype::U32 | Datatype::F32 => 4,
            Datatype::I64 | Datatype::U64 | Datatype::F64 => 8,
        }
    }
}

impl TryFrom<u8> for Datatype {
    type Error = SmrError;

    fn try_from(raw: u8) -> Result<Self, SmrError> {
        Ok(match raw {
            0 => Datatype::I8,
            1 => Datatype::U8,
            2 => Datatype::I16,
            3 => Datatype::U16,
            4 => Datatype::I32,
            5 => Datatype::U32,
            6 => Datatype::I64,
            7 => Datatype::U64,
            8 => Datatype::F32,
            9 => Datatype::F64,
            _ => return Err(SmrError::InvalidArg),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtomicOp {
    Min = 0,
    Max = 1,
    Sum = 2,
    Prod = 3,
    Lor = 4,
    Land = 5,
    Bor = 6,
    Band = 7,
    Lxor = 8,
    Bxor = 9,
    Read = 10,
    Write = 11,
    Cswap = 12,
    CswapNe = 13,
    CswapLe = 14,
    CswapLt = 15,
    CswapGe = 16,
    CswapGt = 17,
    Mswap = 18,
}

impl TryFrom<u8> for AtomicOp {
    type Error = SmrError;

    fn try_from(raw: u8) -> Result<Self, SmrError> {
        use AtomicOp::*;
        const ALL: [AtomicOp; 19] = [
            Min, Max, Sum, Prod, Lor, Land, Bor, Band, Lxor, Bxor, Read, Write, Cswap, CswapNe,
            CswapLe, CswapLt, CswapGe, CswapGt, Mswap,
        ];
        ALL.get(raw as usize).copied().ok_or(SmrError::InvalidArg)
    }
}

impl AtomicOp {
    #[inline]
    pub fn is_swap(self) -> bool {
        self as u8 >= AtomicOp::Cswap as u8
    }
}

trait Element: Copy + PartialOrd {
    /// `op(old, operand)` for the non-swap operators; `None` if the
    /// operator is undefined for this type.
    fn combine(op: AtomicOp, old: Self, operand: Self) -> Option<Self>;
    /// `(operand & mask) | (old & !mask)`.
    fn masked(old: Self, operand: Self, mask: Self) -> Option<Self>;
}

macro_rules! int_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            fn combine(op: AtomicOp, old: Self, operand: Self) -> Option<Self> {
                Some(match op {
                    AtomicOp::Min => old.min(operand),
                    AtomicOp::Max => old.max(operand),
                    AtomicOp::Sum => old.wrapping_add(operand),
                    AtomicOp::Prod => old.wrapping_mul(operand),
                    AtomicOp::Lor => ((old != 0) || (operand != 0)) as $t,
                    AtomicOp::Land => ((old != 0) && (operand != 0)) as $t,
                    AtomicOp::Bor => old | operand,
                    AtomicOp::Band => old & operand,
                    AtomicOp::Lxor => ((old != 0) ^ (operand != 0)) as $t,
                    AtomicOp::Bxor => old ^ operand,
                    AtomicOp::Read => old,
                    AtomicOp::Write => operand,
                    _ => return None,
                })
            }

            fn masked(old: Self, operand: Self, mask: Self) -> Option<Self> {
                Some((operand & mask) | (old & !mask))
            }
        }
    )*};
}

macro_rules! float_element {
    ($($t:ty),*) => {$(
        impl Element for $t {
            fn combine(op: AtomicOp, old: Self, operand: Self) -> Option<Self> {
                let truth = |b: bool| if b { 1.0 } else { 0.0 };
                Some(match op {
                    AtomicOp::Min => old.min(operand),
                    AtomicOp::Max => old.max(operand),
                    AtomicOp::Sum => old + operand,
                    AtomicOp::Prod => old * operand,
                    AtomicOp::Lor => truth(old != 0.0 || operand != 0.0),
                    AtomicOp::Land => truth(old != 0.0 && operand != 0.0),
                    AtomicOp::Lxor => truth((old != 0.0) ^ (operand != 0.0)),
                    AtomicOp::Read => old,
                    AtomicOp::Write => operand,
                    _ => return None,
                })
            }

            fn masked(_: Self, _: Self, _: Self) -> Option<Self> {
                None
            }
        }
    )*};
}

int_element!(i8, u8, i16, u16, i32, u32, i64, u64);
float_element!(f32, f64);

fn swap_taken<T: PartialOrd>(op: AtomicOp, cmp: T, old: T) -> bool {
    match op {
        AtomicOp::Cswap => cmp == old,
        AtomicOp::CswapNe => cmp != old,
        AtomicOp::CswapLe => cmp <= old,
        AtomicOp::CswapLt => cmp < old,
        AtomicOp::CswapGe => cmp >= old,
        AtomicOp::CswapGt => cmp > old,
        _ => false,
    }
}

#[inline]
fn load<T: Copy>(buf: &[u8], i: usize) -> T {
    unsafe { ptr::read_unaligned(buf.as_ptr().add(i * size_of::<T>()).cast()) }
}

#[inline]
fn store<T: Copy>(buf: &mut [u8], i: usize, v: T) {
    unsafe { ptr::write_unaligned(buf.as_mut_ptr().add(i * size_of::<T>()).cast(), v) }
}

fn run<T: Element>(
    op: AtomicOp,
    fetch: bool,
    operand: &mut [u8],
    dst: *mut u8,
    cmp: Option<&[u8]>,
    cnt: usize,
) -> Result<(), SmrError> {
    let mut scratch = [0u8; SMR_INJECT_SIZE];
    let dst = dst.cast::<T>();

    for i in 0..cnt {
        let old: T = unsafe { ptr::read_unaligned(dst.add(i)) };
        let src: T = load(operand, i);
        let new = if op.is_swap() {
            let c: T = load(cmp.ok_or(SmrError::InvalidArg)?, i);
            if op == AtomicOp::Mswap {
                Some(T::masked(old, src, c).ok_or(SmrError::InvalidArg)?)
            } else {
                swap_taken(op, c, old).then_some(src)
            }
        } else if op == AtomicOp::Read {
            None
        } else {
            Some(T::combine(op, old, src).ok_or(SmrError::InvalidArg)?)
        };
        store(&mut scratch, i, old);
        if let Some(v) = new {
            unsafe { ptr::write_unaligned(dst.add(i), v) };
        }
    }

    if fetch {
        let n = cnt * size_of::<T>();
        operand[..n].copy_from_slice(&scratch[..n]);
    }
    Ok(())
}

/// Apply `op` to `cnt` elements at `dst`, taking operands from `operand`
/// and comparands from `cmp`. With `fetch`, the old target values replace
/// the operands.
///
/// # Safety
///
/// `dst` must be valid for reads and writes of `cnt` elements of `dt`.
pub unsafe fn do_atomic(
    op: AtomicOp,
    dt: Datatype,
    fetch: bool,
    operand: &mut [u8],
    dst: *mut u8,
    cmp: Option<&[u8]>,
    cnt: usize,
) -> Result<(), SmrError> {
    let n = cnt.checked_mul(dt.size()).ok_or(SmrError::InvalidArg)?;
    if n > SMR_INJECT_SIZE || operand.len() < n || cmp.is_some_and(|c| c.len() < n) {
        return Err(SmrError::Truncated);
    }
    if op.is_swap() && cmp.is_none() {
        return Err(SmrError::InvalidArg);
    }
    if op == AtomicOp::Read && !fetch {
        return Ok(());
    }
    match dt {
        Datatype::I8 => run::<i8>(op, fetch, operand, dst, cmp, cnt),
        Datatype::U8 => run::<u8>(op, fetch, operand, dst, cmp, cnt),
        Datatype::I16 => run::<i16>(op, fetch, operand, dst, cmp, cnt),
        Datatype::U16 => run::<u16>(op, fetch, operand, dst, cmp, cnt),
        Datatype::I32 => run::<i32>(op, fetch, operand, dst, cmp, cnt),
        Datatype::U32 => run::<u32>(op, fetch, operand, dst, cmp, cnt),
        Datatype::I64 => run::<i64>(op, fetch, operand, dst, cmp, cnt),
        Datatype::U64 => run::<u64>(op, fetch, operand, dst, cmp, cnt),
        Datatype::F32 => run::<f32>(op, fetch, operand, dst, cmp, cnt),
        Datatype::F64 => run::<f64>(op, fetch, operand, dst, cmp, cnt),
    }
}
