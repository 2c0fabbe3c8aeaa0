use crate::error::{LoaderError, Result};

/// Rounds `value` down to a multiple of `align`, which must be a power of two.
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

pub fn align_up(value: u64, align: u64, context: &'static str) -> Result<u64> {
    debug_assert!(align.is_power_of_two());
    let add = align - 1;
    value
        .checked_add(add)
        .map(|sum| sum & !add)
        .ok_or(LoaderError::ArithmeticOverflow { context })
}

pub fn checked_add(a: u64, b: u64, context: &'static str) -> Result<u64> {
    a.checked_add(b)
        .ok_or(LoaderError::ArithmeticOverflow { context })
}

pub fn checked_sub(a: u64, b: u64, context: &'static str) -> Result<u64> {
    a.checked_sub(b)
        .ok_or(LoaderError::ArithmeticOverflow { context })
}

pub fn checked_mul(a: u64, b: u64, context: &'static str) -> Result<u64> {
    a.checked_mul(b)
        .ok_or(LoaderError::ArithmeticOverflow { context })
}

pub fn to_usize(value: u64, context: &'static str) -> Result<usize> {
    usize::try_from(value).map_err(|_| LoaderError::ArithmeticOverflow { context })
}
