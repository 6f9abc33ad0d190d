//! The textual stack description mini-language.
//!
//! ```text
//! "telnet(rfc2217=true),tcp,localhost,3023"
//!     → parser.rs  StackSpec { filters: [telnet{rfc2217}], base: tcp [localhost, 3023] }
//!     → args.rs    typed lookups on each layer's option list
//! ```

pub mod args;
pub mod parser;

pub use args::{str_to_argv, Args};
pub use parser::{BaseSpec, Family, FilterKind, FilterSpec, NetAddr, StackSpec, TransportKind};
