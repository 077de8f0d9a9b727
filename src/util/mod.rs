//! Small formatting helpers shared by the binary and reports.

pub mod bytes;
