//! # DevCache
//!
//! Devcache is a software cache that sits between application code and an
//! accelerator's device-memory allocator
//!
//! For a given host memory address it remembers which device buffer already
//! holds that address's data, so repeated transfers of the same buffer are
//! skipped. Set/way placement and six interchangeable replacement policies
//! are configurable; the accelerator itself is abstracted behind a small
//! backend trait, with an in-process reference backend provided
//!
//! The cache assumes exactly one logical caller: it holds no locks, and
//! concurrent callers need external synchronisation. It also performs no
//! content-based invalidation - a host address is trusted to keep meaning
//! the same data unless the caller forces a refresh

/// Contains the backend abstraction the cache delegates data movement to,
/// and the in-process reference backend
pub mod backend;

/// Contains the implementation of the cache, its geometry and statistics
/// types, and a utility enum for the provided policy instantiations
pub mod cache;

/// Contains definitions for the JSON configuration format, which can be used
/// with the provided replacement policies
pub mod config;

/// Contains the provided replacement policies, with a trait for implementing
/// custom replacement policies
pub mod replacement_policies;

#[cfg(test)]
mod test;
