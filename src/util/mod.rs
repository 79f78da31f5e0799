//! Module implement common utility functions and types.

use cbordata::{Cbor, FromCbor, IntoCbor};

use crate::Result;

pub mod files;
pub mod thread;

pub use thread::Thread;

/// Helper function to serialize value `T` implementing IntoCbor, into byte-string.
pub fn into_cbor_bytes<T>(val: T) -> Result<Vec<u8>>
where
    T: IntoCbor,
{
    let mut data: Vec<u8> = vec![];
    let n = err_at!(
        FailCbor,
        err_at!(FailCbor, val.into_cbor())?.encode(&mut data)
    )?;
    if n != data.len() {
        err_at!(Fatal, msg: "cbor encoding len mistmatch {} {}", n, data.len())
    } else {
        Ok(data)
    }
}

/// Helper function to deserialize value `T` implementing FromCbor, from byte-string.
/// Return (value, bytes-consumed)
pub fn from_cbor_bytes<T>(mut data: &[u8]) -> Result<(T, usize)>
where
    T: FromCbor,
{
    let (val, n) = err_at!(FailCbor, Cbor::decode(&mut data))?;
    Ok((err_at!(FailCbor, T::from_cbor(val))?, n))
}

/// Integer division rounded towards positive infinity, `d` must be non-zero.
#[inline]
pub fn ceiling_div(n: u64, d: u64) -> u64 {
    (n / d) + if n % d == 0 { 0 } else { 1 }
}

/// Round up `n` to the nearest multiple of `quantum`.
#[inline]
pub fn round_up(n: usize, quantum: usize) -> usize {
    ((n + quantum - 1) / quantum) * quantum
}
