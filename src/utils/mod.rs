//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod clock;
mod error;
mod timer;
mod uid;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::RiverError;
pub use print::{logger_init, ME};
pub use uid::{Uid, UidGenerator};

pub(crate) use timer::Timer;
