//! Serial transportation. The reset line is wired to DTR on the usual
//! Prop Plug style adapters.
use std::{
    io::{Read, Write},
    thread::sleep,
    time::Duration,
};

use anyhow::{Error, Result};
use serialport::SerialPort;

use super::Transport;
use crate::constants::{RESET_PULSE_MS, RESET_SETTLE_MS};

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baud_rate);
        let port = serialport::new(port, baud_rate)
            .timeout(Duration::from_millis(1000))
            .open()?;
        Ok(SerialTransport { serial_port: port })
    }

    pub fn open_nth(nth: usize, baud_rate: u32) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name, baud_rate),
            None => Err(Error::msg("No serial ports found!")),
        }
    }

    pub fn open_any(baud_rate: u32) -> Result<Self> {
        Self::open_nth(0, baud_rate)
    }
}

impl Transport for SerialTransport {
    fn reset(&mut self) -> Result<()> {
        self.serial_port.write_data_terminal_ready(true)?;
        sleep(Duration::from_millis(RESET_PULSE_MS));
        self.serial_port.write_data_terminal_ready(false)?;
        sleep(Duration::from_millis(RESET_SETTLE_MS));
        // drop whatever the reset pulse left in the receiver
        self.serial_port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.serial_port.write_all(buf)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.serial_port.set_timeout(timeout)?;
        match self.serial_port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
