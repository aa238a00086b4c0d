//! SDX wire codec primitives.
//!
//! Defines the exchange frame vocabulary and the signed announcement (PNM)
//! record, with encode/decode helpers over plain byte buffers.

pub mod announcement;
pub mod error;
pub mod frame;
