//! Parallax Propeller P1 ROM download protocol implementation.

pub mod constants;
pub mod format;
pub mod loader;
pub mod protocol;
pub mod transport;

pub use self::loader::{Loader, ProgressSink};
pub use self::protocol::{Error, LoadType, Phase};
pub use self::transport::Transport;
