//! # Queue Module
//!
//! Durable, directory-sharded queues that survive restarts.
//!
//! ## Layout
//! ```text
//! queue/
//! └── 0000000000/          # top level, 10 digits
//!     ├── 000/             # inner levels, width of max_size
//!     │   ├── 000[a.dcm]   # files only at the deepest level
//!     │   └── 001[b.dcm]
//!     └── 001/
//! ```
//!
//! ## Guarantees
//! - `enqueue` copies; the caller deletes its original afterwards
//! - `dequeue` moves; the file is out of the tree before the call returns
//! - Embedded names (`...[original.dcm]`) survive every round trip
//! - The cached size can always be corrected with `recount`

mod manager;
mod naming;

pub use manager::{QueueManager, DEFAULT_LEVELS, DEFAULT_MAX_SIZE};
pub use naming::{embedded_name, embedded_name_of};

pub(crate) use naming::{move_file, reserve_path};
