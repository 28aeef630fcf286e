//! The bit-level encoding of the P1 ROM download protocol.

use crate::constants::LFSR_SEED;

/// Load phases reported through a [`ProgressSink`](crate::loader::ProgressSink).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Handshake,
    Response,
    Version,
    HandshakeDone,
    Program,
    EepromWrite,
    EepromVerify,
    Done,
}

/// What the target does with the image once its checksum passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadType {
    /// Stop the loader without loading anything.
    Shutdown = 0,
    /// Load to hub memory and run.
    #[default]
    Run = 1,
    /// Load to hub memory and program the EEPROM.
    Eeprom = 2,
    /// Program the EEPROM, then run.
    EepromRun = 3,
}

impl LoadType {
    /// Whether the target will program and verify its EEPROM after the load.
    pub fn writes_eeprom(self) -> bool {
        matches!(self, LoadType::Eeprom | LoadType::EepromRun)
    }
}

/// Terminal failures of a download session.
///
/// A session that fails is left unusable; run the handshake again before
/// reusing the loader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Nothing arrived within the window or retry budget. The target may be
    /// disconnected or still busy.
    #[error("timed out waiting for the target")]
    Timeout,
    /// The connect response did not match the expected bit sequence: wrong
    /// device, or line noise. Retrying will not help.
    #[error("handshake response mismatch, wrong or no Propeller")]
    HandshakeMismatch,
    /// The target answered an ACK probe with something other than `0xFE`.
    #[error("target rejected the load (NAK byte 0x{0:02x})")]
    Nak(u8),
    #[error("load attempted without a successful handshake")]
    NoHandshake,
    #[error("image of {size} bytes exceeds the {max} byte hub memory")]
    ImageTooLarge { size: usize, max: usize },
    #[error("image size {size} is not a multiple of 4")]
    UnalignedImage { size: usize },
}

/// The 8-bit maximal-length LFSR the ROM uses to verify the connection.
///
/// The connect pattern is bits 0..250 of the sequence; the target echoes
/// bits 250..500 back, produced by the same register carried across. The
/// taps and seed are fixed by the ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lfsr(u8);

impl Lfsr {
    pub fn new() -> Self {
        Lfsr(LFSR_SEED)
    }

    /// Emit the next bit of the sequence and advance the register.
    pub fn next_bit(&mut self) -> u8 {
        let r = self.0;
        self.0 = ((r << 1) & 0xfe) | (((r >> 7) ^ (r >> 5) ^ (r >> 4) ^ (r >> 1)) & 1);
        r & 1
    }
}

impl Default for Lfsr {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode one hub long as the 11 bytes the ROM expects.
///
/// Each byte carries three data bits at positions 0, 3 and 6 over the
/// `0x92` framing pattern; the final byte forces bits 5 and 6 high to mark
/// end-of-long. 11 bytes give 33 bit slots, so the top slot of the final
/// byte is always zero. The ROM decodes by framing pattern, not position,
/// so this layout is not tunable.
pub fn encode_long(value: u32) -> [u8; 11] {
    let mut out = [0u8; 11];
    let mut x = value;
    for (i, byte) in out.iter_mut().enumerate() {
        let mut b = 0x92 | (x & 1) as u8 | ((x & 2) << 2) as u8 | ((x & 4) << 4) as u8;
        if i == 10 {
            b |= 0x60;
        }
        *byte = b;
        x >>= 3;
    }
    out
}
