//! Pools of fixed size objects.
//!
//! Every [`Pool`] hands out objects of one size and keeps freed ones around so
//! the next allocation does not have to go back to the system. Pools are
//! owned by a [`Registry`], which also runs the periodic sweep that gives idle
//! memory back once it has not been used for a while, or right away when all
//! pools together hold more idle memory than the configured [`IdleLimit`].
//!
//! There are two ways a pool can get its memory, see [`PoolKind`]:
//!
//! - Chunked pools map chunks of pages straight from the kernel and carve
//!   objects out of them. Free slots are linked through their own memory, so
//!   objects carry no header at all.
//! - Flat pools ask the general heap for each object on its own.
//!
//! ```text
//! Registry
//!  |
//!  +-- Pool #1 "request" (128 B, chunked)
//!  |     +-- chunk 0x7f00_0000 [used|free|used|free|...]
//!  |     +-- chunk 0x7f00_8000 [used|used|used|used|...]
//!  |
//!  +-- Pool #2 "header" (32 B, flat)
//!        +-- free list -> obj -> obj -> null
//! ```
//!
//! Nothing here is synchronized. Pools and the registry are [`Send`] and can
//! be put behind a lock, but every call needs exclusive access.

mod chunk;
mod chunked;
mod config;
mod error;
mod flat;
mod freelist;
mod kernel;
mod meter;
mod pool;
mod registry;
mod splay;
mod stats;
mod utils;

pub use chunked::{MEM_CHUNK_MAX_SIZE, MEM_CHUNK_SIZE, MEM_MAX_FREE, MEM_MIN_FREE};
pub use config::{CHUNKING_ENV, GB, IDLE_LIMIT_ENV, IdleLimit, KB, MB, RegistryConfig};
pub use error::{ConfigError, Result};
pub use kernel::page_size;
pub use meter::{CallCounters, Cumulative, Meter, PoolMeter};
pub use pool::{FLUSH_LIMIT, MAX_OBJECT_SIZE, Pool, PoolId, PoolKind};
pub use registry::Registry;
pub use splay::{Iter, Lookup, SplayTree};
pub use stats::{ChunkCensus, GlobalStats, PoolStats};
