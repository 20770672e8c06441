//! Bulk pipe interface consumed by the transport engine.
//!
//! A pipe layer accepts IRPs (I/O request packets), moves them over the bus
//! and later reports each one back as a [Completion]. Completions are fed to
//! the engine one at a time.

use usb_device::endpoint::EndpointAddress;
use usb_device::UsbError;

/// What an IRP is used for, echoed back in its [Completion]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IrpKind {
    /// CBW receive on Bulk-OUT
    Command,
    /// Data phase transfer in either direction
    Data,
    /// CSW send on Bulk-IN
    Status,
}

/// Payload of an IRP
#[derive(Debug, Copy, Clone)]
pub enum Transfer<'a> {
    /// Send these bytes to the host
    In(&'a [u8]),
    /// Receive up to `length` bytes from the host. With `short_ok` a short
    /// packet ends the transfer early.
    Out { length: usize, short_ok: bool },
}

impl Transfer<'_> {
    pub fn len(&self) -> usize {
        match self {
            Transfer::In(data) => data.len(),
            Transfer::Out { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// I/O request packet
#[derive(Debug, Copy, Clone)]
pub struct Irp<'a> {
    pub endpoint: EndpointAddress,
    pub kind: IrpKind,
    pub transfer: Transfer<'a>,
}

/// Final status of an IRP
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IrpStatus {
    Success,
    /// The pipe was flushed before the IRP finished
    Cancelled,
    /// The bus reported an error part way through
    Failed(UsbError),
}

/// A finished IRP
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completion {
    pub endpoint: EndpointAddress,
    pub kind: IrpKind,
    pub status: IrpStatus,
    /// Requested length
    pub length: usize,
    /// Bytes actually moved
    pub actual: usize,
}

/// Bulk pipe pair as provided by a USB function core
pub trait BulkPipes {
    /// Queues an IRP. IN payloads are copied before this returns.
    fn submit(&mut self, irp: Irp<'_>) -> Result<(), UsbError>;

    /// Copies the bytes received by the last completed OUT IRP on `endpoint`
    /// into `dst`, returning the number of bytes copied.
    fn take_received(&mut self, endpoint: EndpointAddress, dst: &mut [u8]) -> usize;

    /// Cancels every pending IRP on `endpoint`. Each one is still reported
    /// with [IrpStatus::Cancelled].
    fn flush(&mut self, endpoint: EndpointAddress);

    fn stall(&mut self, endpoint: EndpointAddress) -> Result<(), UsbError>;

    fn unstall(&mut self, endpoint: EndpointAddress) -> Result<(), UsbError>;

    fn is_stalled(&self, endpoint: EndpointAddress) -> Result<bool, UsbError>;

    /// Whether the controller answers SET_CONFIGURATION without the class
    /// driver. Such controllers report connect only once, so bus disconnect
    /// events must not tear the session down.
    fn handles_set_configuration(&self) -> bool {
        true
    }
}

/// Type of an endpoint found on the active alternate setting
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EndpointKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// An endpoint of the interface being connected
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EndpointInfo {
    pub address: EndpointAddress,
    pub kind: EndpointKind,
}

/// The interface the engine is bound to on connect
#[derive(Debug, Copy, Clone)]
pub struct InterfaceInfo<'a> {
    pub number: u8,
    pub endpoints: &'a [EndpointInfo],
}

/// Bus events forwarded by the USB function core
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusEvent {
    Reset,
    Connect,
    Disconnect,
    /// The host cleared ENDPOINT_HALT on this endpoint
    ClearHalt(EndpointAddress),
}
