//! USB Mass Storage transports

use core::fmt::Debug;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use usb_device::UsbError;

#[cfg(feature = "bbb")]
pub mod bbb;
pub mod pipe;
#[cfg(feature = "bbb")]
pub mod wrapper;

/// Generic error type returned by transport entry points.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError<E: Debug> {
    /// USB stack error
    Usb(UsbError),
    /// Transport-specific error
    Error(E),
}

impl<E: Debug> From<UsbError> for TransportError<E> {
    fn from(err: UsbError) -> Self {
        TransportError::Usb(err)
    }
}

/// The status of a Mass Storage command.
///
/// Refer to the USB-MS doc.
#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}
