// SPDX-License-Identifier: MPL-2.0

#![warn(missing_docs)]

//! Synchronize two versions of a file while transmitting data proportional
//! to the *difference* between them rather than to either file's size.
//!
//! Each peer chunks its file into content-defined blocks ([`chunker`]) and
//! summarizes the resulting block-key set twice: a [`strata`] ladder that
//! estimates how many blocks differ, and an [`iblt`] sketch sized from
//! that estimate whose subtraction-and-peeling decode lists exactly which
//! keys each side is missing. The [`sync`] module composes the two into a
//! two-round protocol; [`field`] and [`hash`] supply the cell algebra and
//! the seeded hash family everything above them depends on.

pub mod chunker;
pub mod codec;
pub mod field;
mod fp;
pub mod hash;
pub mod iblt;
pub mod strata;
pub mod sync;
