//! Conversion between the unbounded sequence counters kept by the queues and the 32-bit
//! sequence space on the wire.

pub fn to_wire(seq: u64) -> u32 {
    seq as u32
}

/// Returns the 64-bit value congruent to `wire` (mod 2^32) that is closest to `reference`.
///
/// Values that would land below zero fall back to the raw wire value.
pub fn from_wire(wire: u32, reference: u64) -> u64 {
    let delta = wire.wrapping_sub(reference as u32) as i32 as i64;
    reference
        .checked_add_signed(delta)
        .unwrap_or(wire as u64)
}
