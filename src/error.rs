// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// A violation of one of [`Wheel`][crate::Wheel]'s preconditions.
///
/// The panicking entry points (`schedule`, `schedule_in_range`, `advance`)
/// treat all of these as programmer errors and fail fast. The `try_`-prefixed
/// entry points return this instead, for callers that would rather convert a
/// caller's own bad input into a `Result` than abort.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ContractViolation {
    /// `schedule` was called with `delta == 0`.
    ZeroDelta,
    /// `schedule_in_range` was called with `start >= end`.
    EmptyRange { start: u64, end: u64 },
    /// `advance` was called from within a callback it is currently driving.
    ReentrantAdvance,
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractViolation::ZeroDelta => {
                f.write_str("schedule() requires delta >= 1, use schedule_in_range for delta == 0")
            }
            ContractViolation::EmptyRange { start, end } => {
                write!(f, "schedule_in_range() requires start < end, got start={start}, end={end}")
            }
            ContractViolation::ReentrantAdvance => {
                f.write_str("advance() called reentrantly from within a callback it is driving")
            }
        }
    }
}

impl core::error::Error for ContractViolation {}
