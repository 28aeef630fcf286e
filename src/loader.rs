//! The download engine: handshake, image streaming, acknowledge/retry.
//!
//! Adapted from Chip Gracey's PNut IDE loader sequence. One [`Loader`] is
//! one session; it is not safe to share across threads, and after any
//! failure the handshake must be run again before the loader is reused.

use std::time::Duration;

use anyhow::Result;
use scroll::{LE, Pread};

use crate::constants::{
    ACK, CALIBRATION_BYTE, HANDSHAKE_BITS, HUB_MEMORY_SIZE, RX_BUF_SIZE, TX_BUF_SIZE, VERSION_BITS,
    timeouts,
};
use crate::protocol::{Error, Lfsr, LoadType, Phase, encode_long};
use crate::transport::Transport;

/// Observer of load progress. `current`/`total` are byte offsets and only
/// meaningful for the Program phase; the engine never reads anything back.
pub trait ProgressSink {
    fn report(&mut self, phase: Phase, current: usize, total: usize);
}

/// Download protocol engine over some [`Transport`].
pub struct Loader<T: Transport> {
    transport: T,
    progress: Option<Box<dyn ProgressSink>>,
    txbuf: Vec<u8>,
    rxbuf: Vec<u8>,
    rxnext: usize,
    rxcnt: usize,
    lfsr: Lfsr,
    version: Option<u8>,
}

impl<T: Transport> Loader<T> {
    pub fn new(transport: T) -> Self {
        Loader {
            transport,
            progress: None,
            txbuf: Vec::with_capacity(TX_BUF_SIZE),
            rxbuf: vec![0u8; RX_BUF_SIZE],
            rxnext: 0,
            rxcnt: 0,
            lfsr: Lfsr::new(),
            version: None,
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Chip version detected by the last successful handshake.
    pub fn version(&self) -> Option<u8> {
        self.version
    }

    fn report(&mut self, phase: Phase, current: usize, total: usize) {
        if let Some(progress) = self.progress.as_mut() {
            progress.report(phase, current, total);
        }
    }

    /// Add one byte to the transmit buffer, flushing first if it is full.
    fn append_byte(&mut self, byte: u8) -> Result<()> {
        if self.txbuf.len() >= TX_BUF_SIZE {
            self.flush()?;
        }
        self.txbuf.push(byte);
        Ok(())
    }

    /// Add one hub long, 11 encoded bytes.
    fn append_long(&mut self, value: u32) -> Result<()> {
        for byte in encode_long(value) {
            self.append_byte(byte)?;
        }
        Ok(())
    }

    /// Write the transmit buffer to the wire.
    fn flush(&mut self) -> Result<()> {
        if self.txbuf.len() <= 16 {
            log::debug!("=> {}", hex::encode(&self.txbuf));
        } else {
            log::debug!("=> {} bytes", self.txbuf.len());
        }
        self.transport.send(&self.txbuf)?;
        self.txbuf.clear();
        Ok(())
    }

    /// Receive one logical bit, refilling the receive window as needed.
    ///
    /// An empty refill is hardware-lost and fails immediately with
    /// [`Error::Timeout`]; a byte outside `0xFE..=0xFF` is framing noise
    /// and is skipped without consuming the timeout budget.
    fn receive_bit(&mut self, timeout: Duration) -> Result<u8> {
        loop {
            if self.rxnext >= self.rxcnt {
                let n = self.transport.recv_timeout(&mut self.rxbuf, timeout)?;
                if n == 0 {
                    return Err(Error::Timeout.into());
                }
                self.rxcnt = n;
                self.rxnext = 0;
            }
            let delta = self.rxbuf[self.rxnext].wrapping_sub(ACK);
            self.rxnext += 1;
            if delta <= 1 {
                return Ok(delta);
            }
        }
    }

    /// Probe for an acknowledgement, up to `retries` times.
    ///
    /// Silence retries: the target may still be busy, e.g. writing EEPROM.
    /// An explicit NAK fails immediately, since a desynchronized protocol
    /// will not resynchronize on its own.
    pub fn wait_for_ack(&mut self, mut retries: u32) -> Result<()> {
        while retries > 0 {
            retries -= 1;
            self.append_byte(CALIBRATION_BYTE)?;
            self.flush()?;
            let mut buf = [0u8; 1];
            if self
                .transport
                .recv_timeout(&mut buf, Duration::from_millis(timeouts::ACK_MS))?
                > 0
            {
                log::debug!("<= {}", hex::encode(buf));
                if buf[0] == ACK {
                    return Ok(());
                }
                return Err(Error::Nak(buf[0]).into());
            }
        }
        Err(Error::Timeout.into())
    }

    /// Run the connect sequence and read back the chip version.
    ///
    /// Resets the target, sends the 250-bit LFSR pattern plus enough
    /// calibration bytes to clock the echo and version byte out, then
    /// verifies the echoed bits against the continued LFSR stream. May be
    /// called again to start a fresh session on the same port.
    pub fn handshake(&mut self) -> Result<u8> {
        self.txbuf.clear();
        self.rxnext = 0;
        self.rxcnt = 0;
        self.version = None;

        self.report(Phase::Handshake, 0, 0);
        self.transport.reset()?;

        self.append_byte(CALIBRATION_BYTE)?;

        self.lfsr = Lfsr::new();
        for _ in 0..HANDSHAKE_BITS {
            let bit = self.lfsr.next_bit();
            self.append_byte(bit | 0xfe)?;
        }

        // clock out the connection response and the version byte
        for _ in 0..HANDSHAKE_BITS + VERSION_BITS {
            self.append_byte(CALIBRATION_BYTE)?;
        }
        self.flush()?;

        self.report(Phase::Response, 0, 0);
        for i in 0..HANDSHAKE_BITS {
            let bit = self.receive_bit(Duration::from_millis(timeouts::RESPONSE_BIT_MS))?;
            if bit != self.lfsr.next_bit() {
                log::debug!("handshake response mismatch at bit {}", i);
                return Err(Error::HandshakeMismatch.into());
            }
        }

        self.report(Phase::Version, 0, 0);
        let mut version = 0u8;
        for _ in 0..VERSION_BITS {
            let bit = self.receive_bit(Duration::from_millis(timeouts::VERSION_BIT_MS))?;
            // bits arrive LSB first
            version = (version >> 1) | (bit << 7);
        }
        self.version = Some(version);

        self.report(Phase::HandshakeDone, 0, 0);
        log::info!("Found Propeller version {}", version);
        Ok(version)
    }

    /// Load a spin binary into hub memory, optionally persisting it.
    ///
    /// Must follow a successful [`handshake`](Self::handshake) on this
    /// loader. The image must be long-aligned and fit in hub memory; both
    /// are checked before anything is transmitted.
    pub fn load_image(&mut self, load_type: LoadType, image: &[u8]) -> Result<()> {
        if self.version.is_none() {
            return Err(Error::NoHandshake.into());
        }
        if image.len() % 4 != 0 {
            return Err(Error::UnalignedImage { size: image.len() }.into());
        }
        if image.len() > HUB_MEMORY_SIZE {
            return Err(Error::ImageTooLarge {
                size: image.len(),
                max: HUB_MEMORY_SIZE,
            }
            .into());
        }

        self.append_long(load_type as u32)?;
        self.append_long((image.len() / 4) as u32)?;

        for offset in (0..image.len()).step_by(4) {
            if offset % 1024 == 0 {
                self.report(Phase::Program, offset, image.len());
            }
            let data: u32 = image.pread_with(offset, LE)?;
            self.append_long(data)?;
        }
        self.flush()?;

        // covers target-side checksum validation and, for Run, program start
        self.wait_for_ack(timeouts::CHECKSUM_RETRIES)?;

        if load_type.writes_eeprom() {
            self.report(Phase::EepromWrite, 0, image.len());
            self.wait_for_ack(timeouts::EEPROM_PROGRAMMING_RETRIES)?;

            self.report(Phase::EepromVerify, 0, image.len());
            self.wait_for_ack(timeouts::EEPROM_VERIFICATION_RETRIES)?;
        }

        self.report(Phase::Done, 0, image.len());
        Ok(())
    }

    /// Tell the target to shut the loader down. No acknowledgement follows.
    pub fn shutdown(&mut self) -> Result<()> {
        self.append_long(LoadType::Shutdown as u32)?;
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;

    #[derive(Default)]
    struct MockTransport {
        sent: Vec<u8>,
        pending: VecDeque<u8>,
        resets: usize,
        recv_calls: usize,
    }

    impl MockTransport {
        fn queue(&mut self, bytes: &[u8]) {
            self.pending.extend(bytes);
        }
    }

    impl Transport for MockTransport {
        fn reset(&mut self) -> Result<()> {
            self.resets += 1;
            Ok(())
        }

        fn send(&mut self, buf: &[u8]) -> Result<()> {
            self.sent.extend_from_slice(buf);
            Ok(())
        }

        fn recv_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            self.recv_calls += 1;
            let n = buf.len().min(self.pending.len());
            for slot in &mut buf[..n] {
                *slot = self.pending.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    #[derive(Default, Clone)]
    struct Recorder(Rc<RefCell<Vec<(Phase, usize, usize)>>>);

    impl ProgressSink for Recorder {
        fn report(&mut self, phase: Phase, current: usize, total: usize) {
            self.0.borrow_mut().push((phase, current, total));
        }
    }

    fn protocol_error(err: &anyhow::Error) -> &Error {
        err.downcast_ref::<Error>().expect("not a protocol error")
    }

    /// Bytes a well-behaved target sends back during the handshake:
    /// the LFSR echo (bits 250..500) followed by the version byte, LSB
    /// first, one bit per byte over 0xFE.
    fn handshake_reply(version: u8) -> Vec<u8> {
        let mut lfsr = Lfsr::new();
        for _ in 0..HANDSHAKE_BITS {
            lfsr.next_bit();
        }
        let mut reply = Vec::new();
        for _ in 0..HANDSHAKE_BITS {
            reply.push(ACK | lfsr.next_bit());
        }
        for i in 0..8 {
            reply.push(ACK | ((version >> i) & 1));
        }
        reply
    }

    fn connected_loader(version: u8) -> Loader<MockTransport> {
        let mut mock = MockTransport::default();
        mock.queue(&handshake_reply(version));
        let mut loader = Loader::new(mock);
        loader.handshake().unwrap();
        loader
    }

    #[test]
    fn wait_for_ack_times_out_on_silence() {
        let mut loader = Loader::new(MockTransport::default());
        let err = loader.wait_for_ack(1).unwrap_err();
        assert_eq!(protocol_error(&err), &Error::Timeout);
        // exactly one probe went out
        assert_eq!(loader.transport.sent, vec![CALIBRATION_BYTE]);
    }

    #[test]
    fn wait_for_ack_fails_fast_on_nak() {
        let mut loader = Loader::new(MockTransport::default());
        loader.transport.queue(&[0x00]);
        let err = loader.wait_for_ack(400).unwrap_err();
        assert_eq!(protocol_error(&err), &Error::Nak(0x00));
        // no further retries after an explicit NAK
        assert_eq!(loader.transport.recv_calls, 1);
        assert_eq!(loader.transport.sent, vec![CALIBRATION_BYTE]);
    }

    #[test]
    fn wait_for_ack_retries_until_budget_exhausted() {
        let mut loader = Loader::new(MockTransport::default());
        let err = loader.wait_for_ack(5).unwrap_err();
        assert_eq!(protocol_error(&err), &Error::Timeout);
        assert_eq!(loader.transport.recv_calls, 5);
        assert_eq!(loader.transport.sent.len(), 5);
    }

    #[test]
    fn handshake_detects_version() {
        let mut mock = MockTransport::default();
        mock.queue(&handshake_reply(1));
        let mut loader = Loader::new(mock);

        let version = loader.handshake().unwrap();
        assert_eq!(version, 1);
        assert_eq!(loader.version(), Some(1));
        assert_eq!(loader.transport.resets, 1);

        // one calibration byte, 250 pattern bytes, 258 more calibration bytes
        let sent = &loader.transport.sent;
        assert_eq!(sent.len(), 1 + HANDSHAKE_BITS + HANDSHAKE_BITS + VERSION_BITS);
        assert_eq!(sent[0], CALIBRATION_BYTE);
        let mut lfsr = Lfsr::new();
        for (i, &b) in sent[1..1 + HANDSHAKE_BITS].iter().enumerate() {
            assert_eq!(b, lfsr.next_bit() | 0xfe, "pattern byte {i}");
        }
        assert!(sent[1 + HANDSHAKE_BITS..].iter().all(|&b| b == CALIBRATION_BYTE));
    }

    #[test]
    fn handshake_times_out_on_silent_target() {
        let mut loader = Loader::new(MockTransport::default());
        let err = loader.handshake().unwrap_err();
        assert_eq!(protocol_error(&err), &Error::Timeout);
        assert_eq!(loader.version(), None);
    }

    #[test]
    fn handshake_rejects_wrong_echo() {
        let mut mock = MockTransport::default();
        // invert every echoed bit
        let reply: Vec<u8> = handshake_reply(1)
            .into_iter()
            .map(|b| b ^ 1)
            .collect();
        mock.queue(&reply);
        let mut loader = Loader::new(mock);

        let err = loader.handshake().unwrap_err();
        assert_eq!(protocol_error(&err), &Error::HandshakeMismatch);
    }

    #[test]
    fn handshake_skips_framing_noise() {
        let mut mock = MockTransport::default();
        let mut reply = vec![0x00, 0x7f, 0xf8]; // reset-window garbage
        reply.extend(handshake_reply(1));
        mock.queue(&reply);
        let mut loader = Loader::new(mock);

        assert_eq!(loader.handshake().unwrap(), 1);
    }

    #[test]
    fn load_image_reports_progress_and_acks() {
        let recorder = Recorder::default();
        let mut mock = MockTransport::default();
        mock.queue(&handshake_reply(1));
        let mut loader = Loader::new(mock).with_progress(Box::new(recorder.clone()));
        loader.handshake().unwrap();
        let handshake_bytes = loader.transport.sent.len();

        loader.transport.queue(&[ACK]);
        let image = vec![0u8; 4100];
        loader.load_image(LoadType::Run, &image).unwrap();

        let events = recorder.0.borrow();
        let program: Vec<usize> = events
            .iter()
            .filter(|(p, _, _)| *p == Phase::Program)
            .map(|&(_, current, _)| current)
            .collect();
        assert_eq!(program, [0, 1024, 2048, 3072, 4096]);
        assert_eq!(*events.last().unwrap(), (Phase::Done, 0, 4100));

        // command long, count long, 1025 image longs, one ACK probe
        let sent = &loader.transport.sent[handshake_bytes..];
        assert_eq!(sent.len(), (2 + 1025) * 11 + 1);
        assert_eq!(&sent[..11], encode_long(LoadType::Run as u32));
        assert_eq!(&sent[11..22], encode_long(1025));
        assert_eq!(*sent.last().unwrap(), CALIBRATION_BYTE);
    }

    #[test]
    fn load_image_eeprom_waits_for_both_phases() {
        let recorder = Recorder::default();
        let mut mock = MockTransport::default();
        mock.queue(&handshake_reply(1));
        let mut loader = Loader::new(mock).with_progress(Box::new(recorder.clone()));
        loader.handshake().unwrap();

        // checksum, programming, verification
        loader.transport.queue(&[ACK, ACK, ACK]);
        loader.load_image(LoadType::EepromRun, &[0u8; 16]).unwrap();

        let events = recorder.0.borrow();
        let phases: Vec<Phase> = events.iter().map(|&(p, _, _)| p).collect();
        assert!(phases.contains(&Phase::EepromWrite));
        assert!(phases.contains(&Phase::EepromVerify));
        assert_eq!(phases.last(), Some(&Phase::Done));
    }

    #[test]
    fn load_image_eeprom_nak_is_terminal() {
        let mut loader = connected_loader(1);
        // checksum passes, EEPROM programming NAKs
        loader.transport.queue(&[ACK, 0x42]);
        let err = loader.load_image(LoadType::Eeprom, &[0u8; 16]).unwrap_err();
        assert_eq!(protocol_error(&err), &Error::Nak(0x42));
    }

    #[test]
    fn load_image_requires_handshake() {
        let mut loader = Loader::new(MockTransport::default());
        let err = loader.load_image(LoadType::Run, &[0u8; 16]).unwrap_err();
        assert_eq!(protocol_error(&err), &Error::NoHandshake);
        assert!(loader.transport.sent.is_empty());
    }

    #[test]
    fn load_image_rejects_bad_sizes_before_transmitting() {
        let mut loader = connected_loader(1);
        let handshake_bytes = loader.transport.sent.len();

        let err = loader.load_image(LoadType::Run, &[0u8; 6]).unwrap_err();
        assert_eq!(protocol_error(&err), &Error::UnalignedImage { size: 6 });

        let big = vec![0u8; HUB_MEMORY_SIZE + 4];
        let err = loader.load_image(LoadType::Run, &big).unwrap_err();
        assert_eq!(
            protocol_error(&err),
            &Error::ImageTooLarge {
                size: HUB_MEMORY_SIZE + 4,
                max: HUB_MEMORY_SIZE
            }
        );

        assert_eq!(loader.transport.sent.len(), handshake_bytes);
    }

    #[test]
    fn shutdown_sends_single_long() {
        let mut loader = Loader::new(MockTransport::default());
        loader.shutdown().unwrap();
        assert_eq!(loader.transport.sent, encode_long(LoadType::Shutdown as u32));
    }
}
