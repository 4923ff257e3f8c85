//! Common types and abstractions
//!
//! This module defines the core types used throughout the crate:
//! - Address / Destination: where a session wants to go
//! - Stream: boxed async I/O for physical connections
//! - Pipe / Link: bounded byte channels every session is built on
//! - BufferPool: reusable scratch buffers
//! - Done: awaitable shutdown flag

mod address;
mod destination;
mod stream;
pub mod buffer;
pub mod pipe;
mod signal;

pub use address::Address;
pub use buffer::{BufferPool, PooledBuf};
pub use destination::{Destination, Network};
pub use pipe::{pipe, relay, Link, MultiBuffer, PipeLimit, PipeOptions, PipeReader, PipeState, PipeWriter};
pub use signal::Done;
pub use stream::{AsyncReadWrite, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
