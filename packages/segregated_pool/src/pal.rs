//! Platform abstraction layer for the system memory allocator.
//!
//! Slabs are acquired from and released to the system allocator through this layer, which
//! allows tests to substitute a fake allocator that records requests and can refuse them.

mod abstractions;
mod facade;
#[cfg(test)]
mod fake;
mod real;

pub(crate) use abstractions::Memory;
pub(crate) use facade::MemoryFacade;
#[cfg(test)]
pub(crate) use fake::FakeMemory;
