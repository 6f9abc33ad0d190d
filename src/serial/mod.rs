//! Serial port control model shared by serialdev and RFC2217 telnet.
//!
//! # Data Flow
//! ```text
//! SerGensio setter ──SerialOp + value──▶ telnet(rfc2217) | serialdev
//!                  ◀──applied value───── SerialDone
//! modem lines ──ModemStateTracker──▶ Event::modemstate
//! ```

pub mod modemstate;
pub mod ops;
pub mod settings;

pub use modemstate::{ModemState, ModemStateTracker};
pub use ops::{SerialDone, SerialOp};
pub use settings::{LineSettings, Rs485Config};
