//! Exact conversion between decimal BSV strings and satoshis.

use crate::SettlementError;

pub const SATOSHIS_PER_BSV: u64 = 100_000_000;
/// Total supply; no single payment can exceed it.
pub const MAX_SATOSHIS: u64 = 21_000_000 * SATOSHIS_PER_BSV;
const DECIMALS: usize = 8;

/// Parse `"0.006"` style amounts into satoshis without floating point.
///
/// At most eight fractional digits are accepted; signs, exponents and
/// empty strings are rejected.
pub fn parse_amount(s: &str) -> Result<u64, SettlementError> {
    let invalid = |why: &str| SettlementError::InvalidAmount(format!("{:?}: {}", s, why));
    let s = s.trim();
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid("empty"));
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("not a decimal number"));
    }
    if frac.len() > DECIMALS {
        return Err(invalid("more than 8 decimal places"));
    }

    let whole: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid("too large"))?
    };
    let mut frac_sats: u64 = 0;
    for (i, digit) in frac.bytes().enumerate() {
        frac_sats += u64::from(digit - b'0') * 10u64.pow((DECIMALS - 1 - i) as u32);
    }
    whole
        .checked_mul(SATOSHIS_PER_BSV)
        .and_then(|w| w.checked_add(frac_sats))
        .filter(|sats| *sats <= MAX_SATOSHIS)
        .ok_or_else(|| invalid("exceeds total supply"))
}

/// Render satoshis as a decimal BSV string with trailing zeros trimmed.
pub fn format_satoshis(sats: u64) -> String {
    let whole = sats / SATOSHIS_PER_BSV;
    let frac = sats % SATOSHIS_PER_BSV;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:08}", frac);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}
