//! Fixed values of the Propeller P1 ROM download protocol.

/// Byte used for receiver bit-timing calibration, also the ACK probe.
pub const CALIBRATION_BYTE: u8 = 0xf9;

/// Positive acknowledgement byte from the target.
pub const ACK: u8 = 0xfe;

/// Seed of the connect-pattern LFSR.
pub const LFSR_SEED: u8 = b'P';

/// Bits in the connect pattern and in the echoed response.
pub const HANDSHAKE_BITS: usize = 250;

/// Bits in the chip version readback.
pub const VERSION_BITS: usize = 8;

pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Reset pulse width in ms.
pub const RESET_PULSE_MS: u64 = 25;

/// Worst-case post-reset delay in ms, used to size the receive buffer.
pub const MAX_RESET_DELAY_MS: u64 = 500;

/// Post-reset settle delay in ms before the handshake may start.
pub const RESET_SETTLE_MS: u64 = 100;

/// Addressable hub memory of the P1, the upper bound on image size.
pub const HUB_MEMORY_SIZE: usize = 32 * 1024;

/// Room for every hub long plus the command and count longs, 11 bytes each.
pub const TX_BUF_SIZE: usize = (HUB_MEMORY_SIZE / 4 + 2) * 11;

/// Large enough for everything the target can emit during the reset window
/// plus the handshake response and the version byte.
pub const RX_BUF_SIZE: usize = ((DEFAULT_BAUD_RATE as usize / 10
    * (RESET_PULSE_MS + MAX_RESET_DELAY_MS) as usize
    / 1000)
    & !1)
    + HANDSHAKE_BITS
    + VERSION_BITS;

pub mod timeouts {
    /// Single ACK probe window in ms.
    pub const ACK_MS: u64 = 25;
    /// Per-bit window while receiving the handshake response, in ms.
    pub const RESPONSE_BIT_MS: u64 = 100;
    /// Per-bit window while receiving the version byte, in ms.
    pub const VERSION_BIT_MS: u64 = 50;

    // overall budgets, spent in ACK_MS slices
    const CHECKSUM_MS: u64 = 10_000;
    const EEPROM_PROGRAMMING_MS: u64 = 5_000;
    const EEPROM_VERIFICATION_MS: u64 = 2_000;

    /// Checksum wait is long because it covers program loading and start.
    pub const CHECKSUM_RETRIES: u32 = (CHECKSUM_MS / ACK_MS) as u32;
    pub const EEPROM_PROGRAMMING_RETRIES: u32 = (EEPROM_PROGRAMMING_MS / ACK_MS) as u32;
    pub const EEPROM_VERIFICATION_RETRIES: u32 = (EEPROM_VERIFICATION_MS / ACK_MS) as u32;
}
