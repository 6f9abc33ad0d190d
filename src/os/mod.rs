//! Event-loop substrate.
//!
//! # Data Flow
//! ```text
//! Selector (log sink, defaults, callback guard)
//!     → cloned into every Gensio and Accepter
//! Waiter
//!     → wake() from callbacks, wait() from sequential code
//! ```

pub mod selector;
pub mod waiter;

pub use selector::Selector;
pub use waiter::Waiter;
