//! USB Mass Storage subclasses
//!
//! A subclass implements [CommandHandler] and is driven by a transport. The
//! transport owns the IO buffer; handlers read and write it in place.

use crate::transport::pipe::BusEvent;
use usb_device::UsbDirection;

#[cfg(feature = "scsi")]
pub mod container;
#[cfg(feature = "scsi")]
pub mod disk;
#[cfg(feature = "scsi")]
pub mod scsi;

/// Handler verdict on a command or a finished data transfer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    /// Proceed with the returned data length
    Success,
    /// The command failed, halt the data phase
    Stall,
    /// Data will be supplied later through the transport
    Pending,
    /// The handler hit an error, nothing more to transfer
    Failed,
}

/// The data phase a handler asks for in reply to a new command
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataPhase {
    pub status: Status,
    pub direction: UsbDirection,
    /// Bytes of the IO buffer to send (IN) or to receive into (OUT)
    pub len: usize,
}

impl DataPhase {
    pub const fn none(status: Status) -> Self {
        Self {
            status,
            direction: UsbDirection::Out,
            len: 0,
        }
    }

    pub const fn to_host(len: usize) -> Self {
        Self {
            status: Status::Success,
            direction: UsbDirection::In,
            len,
        }
    }

    pub const fn from_host(len: usize) -> Self {
        Self {
            status: Status::Success,
            direction: UsbDirection::Out,
            len,
        }
    }
}

/// Handler reply to a finished data transfer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reply {
    pub status: Status,
    /// Length of the next chunk, zero when the data phase is over
    pub len: usize,
}

impl Reply {
    pub const fn done() -> Self {
        Self {
            status: Status::Success,
            len: 0,
        }
    }

    pub const fn success(len: usize) -> Self {
        Self {
            status: Status::Success,
            len,
        }
    }
}

/// The Command Block of a validated CBW
///
/// The low three bits of the LUN are patched into bits 7..5 of `bytes[1]`.
/// Route on `lun`, which holds all of it.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandBlock<'a> {
    pub bytes: &'a [u8],
    pub lun: u8,
}

impl CommandBlock<'_> {
    pub fn opcode(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0)
    }
}

/// Errors a handler may return from [CommandHandler::connect]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Rejected;

/// Command interpreter bound to a Bulk-Only session
pub trait CommandHandler {
    /// A CBW arrived. Prepare the first data chunk in `buf` (IN) or declare how
    /// much to receive into it (OUT).
    fn new_command(&mut self, cb: &CommandBlock<'_>, buf: &mut [u8]) -> DataPhase;

    /// A data transfer finished with `len` bytes actually moved. For OUT the
    /// received bytes are in `buf[..len]`. Return the next chunk, if any.
    fn transfer_done(&mut self, buf: &mut [u8], len: usize) -> Reply;

    /// A session is being created
    fn connect(&mut self) -> Result<(), Rejected> {
        Ok(())
    }

    /// The session was torn down
    fn disconnect(&mut self) {}

    /// Bulk-Only Mass Storage Reset
    fn reset(&mut self) {}

    /// Highest LUN in use, `None` when no unit is available
    fn max_lun(&self) -> Option<u8> {
        Some(0)
    }

    /// A bus event was observed
    fn notify(&mut self, _event: BusEvent) {}
}

impl<T: CommandHandler + ?Sized> CommandHandler for &mut T {
    fn new_command(&mut self, cb: &CommandBlock<'_>, buf: &mut [u8]) -> DataPhase {
        (**self).new_command(cb, buf)
    }

    fn transfer_done(&mut self, buf: &mut [u8], len: usize) -> Reply {
        (**self).transfer_done(buf, len)
    }

    fn connect(&mut self) -> Result<(), Rejected> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn max_lun(&self) -> Option<u8> {
        (**self).max_lun()
    }

    fn notify(&mut self, event: BusEvent) {
        (**self).notify(event)
    }
}
