//! Fuzzing harnesses for the farline queue protocol.
//!
//! These fuzzers operate on an in-memory replica of the slot/epoch/checksum
//! algorithms, without touching real mmap, to test protocol invariants.

pub mod queue_model;
