//! Abstract serial link to the target.
use std::time::Duration;

use anyhow::Result;

pub use self::serial::SerialTransport;

mod serial;

/// Everything the download engine needs from the outside world.
/// Might be a real serial port, or a mock in tests.
pub trait Transport {
    /// Drive the target into its ROM bootloader, settle delay included.
    fn reset(&mut self) -> Result<()>;

    /// Send all of `buf`, in order, before returning.
    fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Receive up to `buf.len()` bytes within `timeout`. `Ok(0)` means
    /// nothing arrived, which is not necessarily an error: the target may
    /// just be slower than expected.
    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
}
