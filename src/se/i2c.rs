use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

const I2C_SLAVE: u16 = 0x0703;
nix::ioctl_write_int_bad!(i2c_set_slave, I2C_SLAVE);

/// Time the chip needs after the wake pulse before it accepts commands.
const WAKE_DELAY: Duration = Duration::from_micros(1500);

/// Raw byte transport to a secure element.
pub trait ByteBus: Send {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<()>;
    /// Hold SDA low long enough to wake a sleeping chip.
    fn wake_pulse(&mut self) -> io::Result<()>;
}

/// `/dev/i2c-N` character device bound to one 7-bit address.
pub struct LinuxI2c {
    file: File,
    address: u16,
}

impl LinuxI2c {
    pub fn open(bus: &Path, address: u16) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(bus)?;
        let dev = Self { file, address };
        dev.select(address)?;
        tracing::debug!(bus = %bus.display(), address = format!("{address:#04x}"), "I2C device opened");
        Ok(dev)
    }

    fn select(&self, address: u16) -> io::Result<()> {
        // SAFETY: the descriptor is owned by `self.file` and stays open for the call.
        unsafe { i2c_set_slave(self.file.as_raw_fd(), address as nix::libc::c_int) }
            .map_err(io::Error::from)?;
        Ok(())
    }
}

impl ByteBus for LinuxI2c {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact(buf)
    }

    fn wake_pulse(&mut self) -> io::Result<()> {
        // A write to the general-call address is NAKed but holds SDA low for
        // long enough to wake the chip.
        self.select(0x00)?;
        let _ = self.file.write(&[0x00]);
        self.select(self.address)?;
        std::thread::sleep(WAKE_DELAY);
        Ok(())
    }
}
