//! Record store implementations.
pub mod memory;
