//! Buffer management for the encrypted I/O queue.
//!
//! - [`pool::BufferPool`]: size-keyed freelist for fragment-size scratch buffers
//! - [`fragment::FragmentBuffers`]: ring of in-flight fragment buffers
//!
//! Both zeroize their buffers when dropped, since item and fragment buffers
//! hold plaintext.

pub mod fragment;
pub mod pool;

pub use fragment::{FragmentBuffer, FragmentBuffers};
pub use pool::{BufferPool, PoolBuffer, PoolStats};
