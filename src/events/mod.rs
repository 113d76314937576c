//! # Events Module
//!
//! Event-driven reporting for pipelines.
//!
//! ## Design
//! Pipeline threads and exporter threads emit events through channels,
//! so any observer (CLI, status view, tests) can subscribe without the
//! pipeline ever waiting on it.
//!
//! ## Example
//! ```rust,ignore
//! let (sender, receiver) = EventChannel::new();
//!
//! std::thread::spawn(move || {
//!     for event in receiver.iter() {
//!         match event {
//!             Event::Object(ObjectEvent::Quarantined { stage, path }) => {
//!                 println!("{stage} quarantined {}", path.display())
//!             }
//!             _ => {}
//!         }
//!     }
//! });
//!
//! let pipeline = Pipeline::builder("main").events(sender).build()?;
//! ```

mod channel;
mod types;

pub use channel::{null_sender, EventChannel, EventReceiver, EventSender};
pub use types::*;
