//! Recycling infrastructure backing every hot-path allocation: size-classed
//! byte blocks, bounded object pools and the per-thread cache tying them to
//! the process-wide settings.

pub mod cache;
pub mod memory;
pub mod object;
