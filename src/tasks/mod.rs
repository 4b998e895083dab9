//! Background Tasks Module
//!
//! Contains background tasks that run periodically while the cache is up.
//!
//! # Tasks
//! - Cull: Sheds entries over the capacity bound at configured intervals

mod cull;

pub use cull::spawn_cull_task;
