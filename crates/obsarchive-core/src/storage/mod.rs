//! On-disk primitives: the frame codec for the container file and the
//! advisory lock on its sidecar.
//!
//! Higher layers (`container`, `append`, `query`) never touch raw offsets or
//! `flock` directly; they go through the helpers here.

pub(crate) mod frame;
pub mod lock;

pub use lock::{LockMode, lock_path};
