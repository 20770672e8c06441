//! [usb-device] class adapter
//!
//! [MassStorageClass] exposes a Bulk-Only SCSI interface on a [UsbBus]. The
//! bulk endpoints are wrapped in [EndpointPipes], which moves IRPs one packet
//! at a time and reports them back to the [BulkOnly] engine.
//!
//! [usb-device]: https://crates.io/crates/usb-device

use crate::staging::Staging;
use crate::subclass::scsi::SUBCLASS_SCSI;
use crate::subclass::CommandHandler;
use crate::transport::bbb::{
    BulkOnly, BulkOnlyError, BulkOnlyTransportResult, Dispatch,
    CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET, CLASS_SPECIFIC_GET_MAX_LUN, TRANSPORT_BBB,
};
use crate::transport::pipe::{
    BulkPipes, BusEvent, Completion, EndpointInfo, EndpointKind, InterfaceInfo, Irp, IrpKind,
    IrpStatus, Transfer,
};
use crate::transport::TransportError;
use crate::CLASS_MASS_STORAGE;
use core::borrow::BorrowMut;
use core::cmp::min;
use usb_device::class_prelude::*;
use usb_device::control::{Recipient, Request, RequestType};

/// Completions waiting for the engine
const QUEUE_LEN: usize = 8;

#[derive(Debug, Copy, Clone)]
struct Active {
    kind: IrpKind,
    length: usize,
    actual: usize,
    short_ok: bool,
}

impl Active {
    fn finish(self, endpoint: EndpointAddress, status: IrpStatus) -> Completion {
        Completion {
            endpoint,
            kind: self.kind,
            status,
            length: self.length,
            actual: self.actual,
        }
    }
}

struct Completions {
    queue: [Option<Completion>; QUEUE_LEN],
    head: usize,
    len: usize,
}

impl Completions {
    const fn new() -> Self {
        Self {
            queue: [None; QUEUE_LEN],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, completion: Completion) {
        if self.len == QUEUE_LEN {
            warn!("usb: msc: Completion queue full, dropped {}", completion.kind);
            return;
        }
        self.queue[(self.head + self.len) % QUEUE_LEN] = Some(completion);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Completion> {
        if self.len == 0 {
            return None;
        }
        let completion = self.queue[self.head].take();
        self.head = (self.head + 1) % QUEUE_LEN;
        self.len -= 1;
        completion
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

/// [BulkPipes] over a pair of usb-device bulk endpoints
///
/// Each direction stages one IRP of up to `N` bytes.
pub struct EndpointPipes<'a, B: UsbBus, const N: usize> {
    in_ep: EndpointIn<'a, B>,
    out_ep: EndpointOut<'a, B>,
    tx: Staging<[u8; N]>,
    rx: Staging<[u8; N]>,
    tx_irp: Option<Active>,
    rx_irp: Option<Active>,
    in_stalled: bool,
    out_stalled: bool,
    done: Completions,
}

impl<'a, B: UsbBus, const N: usize> EndpointPipes<'a, B, N> {
    pub fn new(in_ep: EndpointIn<'a, B>, out_ep: EndpointOut<'a, B>) -> Self {
        Self {
            in_ep,
            out_ep,
            tx: Staging::new([0; N]),
            rx: Staging::new([0; N]),
            tx_irp: None,
            rx_irp: None,
            in_stalled: false,
            out_stalled: false,
            done: Completions::new(),
        }
    }

    pub fn in_address(&self) -> EndpointAddress {
        self.in_ep.address()
    }

    pub fn out_address(&self) -> EndpointAddress {
        self.out_ep.address()
    }

    pub fn owns(&self, endpoint: EndpointAddress) -> bool {
        endpoint == self.in_address() || endpoint == self.out_address()
    }

    /// Moves as many packets as the endpoints accept
    pub fn poll_endpoints(&mut self) {
        self.poll_in();
        self.poll_out();
    }

    /// Next finished IRP, if any
    pub fn pop_completion(&mut self) -> Option<Completion> {
        self.done.pop()
    }

    /// The host cleared the halt on `endpoint` through the standard request
    pub fn halt_cleared(&mut self, endpoint: EndpointAddress) {
        if endpoint == self.in_address() {
            self.in_stalled = false;
        } else if endpoint == self.out_address() {
            self.out_stalled = false;
        }
    }

    /// Drops every IRP and completion after a bus reset
    pub fn reset(&mut self) {
        self.tx_irp = None;
        self.rx_irp = None;
        self.tx.clean();
        self.rx.clean();
        self.in_stalled = false;
        self.out_stalled = false;
        self.done.clear();
    }

    fn poll_in(&mut self) {
        let Some(mut irp) = self.tx_irp else {
            return;
        };
        if self.in_stalled {
            return;
        }

        let address = self.in_ep.address();
        let packet_size = self.in_ep.max_packet_size() as usize;
        let in_ep = &self.in_ep;
        while self.tx.available_read() > 0 {
            match self
                .tx
                .read(|bytes| in_ep.write(&bytes[..min(packet_size, bytes.len())]))
            {
                Ok(count) => irp.actual += count,
                Err(UsbError::WouldBlock) => {
                    self.tx_irp = Some(irp);
                    return;
                }
                Err(err) => {
                    warn!("usb: msc: IN write failed: {}", err);
                    self.tx_irp = None;
                    self.tx.clean();
                    self.done.push(irp.finish(address, IrpStatus::Failed(err)));
                    return;
                }
            }
        }

        trace!("usb: msc: IN IRP done: {}", irp.actual);
        self.tx_irp = None;
        self.done.push(irp.finish(address, IrpStatus::Success));
    }

    fn poll_out(&mut self) {
        let Some(mut irp) = self.rx_irp else {
            return;
        };
        if self.out_stalled {
            return;
        }

        let address = self.out_ep.address();
        let packet_size = self.out_ep.max_packet_size() as usize;
        let out_ep = &self.out_ep;
        loop {
            let room = min(packet_size, self.rx.available_write());
            match self
                .rx
                .write_with(room, UsbError::BufferOverflow, |space| out_ep.read(space))
            {
                Ok(count) => {
                    irp.actual += count;
                    let short = count < packet_size && irp.short_ok;
                    if short || irp.actual >= irp.length {
                        break;
                    }
                }
                Err(UsbError::WouldBlock) => {
                    self.rx_irp = Some(irp);
                    return;
                }
                Err(err) => {
                    warn!("usb: msc: OUT read failed: {}", err);
                    self.rx_irp = None;
                    self.done.push(irp.finish(address, IrpStatus::Failed(err)));
                    return;
                }
            }
        }

        trace!("usb: msc: OUT IRP done: {}", irp.actual);
        self.rx_irp = None;
        self.done.push(irp.finish(address, IrpStatus::Success));
    }
}

impl<B: UsbBus, const N: usize> BulkPipes for EndpointPipes<'_, B, N> {
    fn submit(&mut self, irp: Irp<'_>) -> Result<(), UsbError> {
        match irp.transfer {
            Transfer::In(data) if irp.endpoint == self.in_address() => {
                if self.tx_irp.is_some() {
                    return Err(UsbError::InvalidState);
                }
                if data.len() > self.tx.capacity() {
                    return Err(UsbError::BufferOverflow);
                }
                self.tx.clean();
                self.tx.write(data);
                self.tx_irp = Some(Active {
                    kind: irp.kind,
                    length: data.len(),
                    actual: 0,
                    short_ok: false,
                });
                Ok(())
            }
            Transfer::Out { length, short_ok } if irp.endpoint == self.out_address() => {
                if self.rx_irp.is_some() {
                    return Err(UsbError::InvalidState);
                }
                if length > self.rx.capacity() {
                    return Err(UsbError::BufferOverflow);
                }
                self.rx.clean();
                self.rx_irp = Some(Active {
                    kind: irp.kind,
                    length,
                    actual: 0,
                    short_ok,
                });
                Ok(())
            }
            _ => Err(UsbError::InvalidEndpoint),
        }
    }

    fn take_received(&mut self, endpoint: EndpointAddress, dst: &mut [u8]) -> usize {
        if endpoint != self.out_address() {
            return 0;
        }
        self.rx
            .read(|bytes| {
                let count = min(bytes.len(), dst.len());
                dst[..count].copy_from_slice(&bytes[..count]);
                Ok::<usize, ()>(count)
            })
            .unwrap_or(0)
    }

    fn flush(&mut self, endpoint: EndpointAddress) {
        let (irp, staging) = if endpoint == self.in_address() {
            (self.tx_irp.take(), &mut self.tx)
        } else if endpoint == self.out_address() {
            (self.rx_irp.take(), &mut self.rx)
        } else {
            return;
        };
        staging.clean();
        if let Some(irp) = irp {
            self.done.push(irp.finish(endpoint, IrpStatus::Cancelled));
        }
    }

    fn stall(&mut self, endpoint: EndpointAddress) -> Result<(), UsbError> {
        if endpoint == self.in_address() {
            self.in_ep.stall();
            self.in_stalled = true;
        } else if endpoint == self.out_address() {
            self.out_ep.stall();
            self.out_stalled = true;
        } else {
            return Err(UsbError::InvalidEndpoint);
        }
        Ok(())
    }

    fn unstall(&mut self, endpoint: EndpointAddress) -> Result<(), UsbError> {
        if endpoint == self.in_address() {
            self.in_ep.unstall();
            self.in_stalled = false;
        } else if endpoint == self.out_address() {
            self.out_ep.unstall();
            self.out_stalled = false;
        } else {
            return Err(UsbError::InvalidEndpoint);
        }
        Ok(())
    }

    fn is_stalled(&self, endpoint: EndpointAddress) -> Result<bool, UsbError> {
        if endpoint == self.in_address() {
            Ok(self.in_stalled)
        } else if endpoint == self.out_address() {
            Ok(self.out_stalled)
        } else {
            Err(UsbError::InvalidEndpoint)
        }
    }
}

/// USB Mass Storage Class, SCSI transparent command set over Bulk-Only
///
/// `N` is the size of each endpoint staging buffer. It must fit the IO buffer
/// and one packet.
pub struct MassStorageClass<'a, B, H, Buf, const N: usize>
where
    B: UsbBus,
    H: CommandHandler,
    Buf: BorrowMut<[u8]>,
{
    interface: InterfaceNumber,
    transport: BulkOnly<EndpointPipes<'a, B, N>, H, Buf>,
    cleared: [Option<EndpointAddress>; 2],
}

impl<'a, B, H, Buf, const N: usize> MassStorageClass<'a, B, H, Buf, N>
where
    B: UsbBus,
    H: CommandHandler,
    Buf: BorrowMut<[u8]>,
{
    /// Allocates the interface and endpoints and starts a session
    ///
    /// # Arguments
    /// * `alloc` - [UsbBusAllocator]
    /// * `packet_size` - Maximum USB packet size. Allowed values: 8,16,32,64
    /// * `handler` - the command interpreter, usually a
    /// [ScsiContainer](crate::subclass::container::ScsiContainer)
    /// * `buf` - the IO buffer, see [BulkOnly::new]
    /// * `max_lun` - the max index of the Logical Unit
    /// * `dispatch` - with [Dispatch::Deferred] call [run_pending] from the
    /// worker context
    ///
    /// # Errors
    /// * [BufferTooSmall] - `N` cannot stage the IO buffer or a packet
    /// * any error of [BulkOnly::new] or of the endpoint allocation
    ///
    /// [run_pending]: crate::class::MassStorageClass::run_pending
    /// [BufferTooSmall]: crate::transport::bbb::BulkOnlyError::BufferTooSmall
    pub fn new(
        alloc: &'a UsbBusAllocator<B>,
        packet_size: u16,
        handler: H,
        buf: Buf,
        max_lun: u8,
        dispatch: Dispatch,
    ) -> BulkOnlyTransportResult<Self> {
        if N < buf.borrow().len() || N < packet_size as usize {
            return Err(TransportError::Error(BulkOnlyError::BufferTooSmall));
        }

        let in_ep = alloc.alloc(None, EndpointType::Bulk, packet_size, 0)?;
        let out_ep = alloc.alloc(None, EndpointType::Bulk, packet_size, 0)?;
        let pipes = EndpointPipes::new(in_ep, out_ep);
        let transport =
            BulkOnly::new(pipes, handler, buf, max_lun, dispatch).map_err(TransportError::Error)?;

        let mut class = Self {
            interface: alloc.interface(),
            transport,
            cleared: [None; 2],
        };
        class.connect()?;
        Ok(class)
    }

    /// Binds the engine to this interface and arms the first CBW
    pub fn connect(&mut self) -> BulkOnlyTransportResult<()> {
        let pipes = self.transport.pipes();
        let endpoints = [
            EndpointInfo {
                address: pipes.in_address(),
                kind: EndpointKind::Bulk,
            },
            EndpointInfo {
                address: pipes.out_address(),
                kind: EndpointKind::Bulk,
            },
        ];
        self.transport.connect(InterfaceInfo {
            number: self.interface.into(),
            endpoints: &endpoints,
        })
    }

    /// Runs the work posted in [Dispatch::Deferred] mode and moves the
    /// resulting transfers
    pub fn run_pending(&mut self) -> BulkOnlyTransportResult<()> {
        self.transport.run_pending()?;
        self.pump();
        Ok(())
    }

    /// Starts a data transfer for a handler that answered
    /// [Status::Pending](crate::subclass::Status::Pending). See
    /// [BulkOnly::submit_data].
    pub fn submit_data(&mut self, len: usize) -> BulkOnlyTransportResult<()> {
        self.transport.submit_data(len)?;
        self.pump();
        Ok(())
    }

    pub fn transport(&self) -> &BulkOnly<EndpointPipes<'a, B, N>, H, Buf> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut BulkOnly<EndpointPipes<'a, B, N>, H, Buf> {
        &mut self.transport
    }

    /// Feeds finished IRPs to the engine until the pipes go quiet
    fn pump(&mut self) {
        loop {
            let pipes = self.transport.pipes_mut();
            pipes.poll_endpoints();
            let Some(completion) = pipes.pop_completion() else {
                return;
            };
            if let Err(err) = self.transport.complete(completion) {
                warn!("usb: msc: Completion of {} failed: {}", completion.kind, err);
            }
        }
    }

    fn service_cleared(&mut self) {
        for slot in self.cleared.iter_mut() {
            let Some(endpoint) = slot.take() else {
                continue;
            };
            self.transport.pipes_mut().halt_cleared(endpoint);
            if let Err(err) = self.transport.notify(BusEvent::ClearHalt(endpoint)) {
                warn!("usb: msc: Clear-Feature recovery failed: {}", err);
            }
        }
    }

    fn is_ours(&self, req: &Request) -> bool {
        req.request_type == RequestType::Class
            && req.recipient == Recipient::Interface
            && req.index == u8::from(self.interface) as u16
    }
}

impl<B, H, Buf, const N: usize> UsbClass<B> for MassStorageClass<'_, B, H, Buf, N>
where
    B: UsbBus,
    H: CommandHandler,
    Buf: BorrowMut<[u8]>,
{
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<(), UsbError> {
        writer.interface(
            self.interface,
            CLASS_MASS_STORAGE,
            SUBCLASS_SCSI,
            TRANSPORT_BBB,
        )?;
        let pipes = self.transport.pipes();
        writer.endpoint(&pipes.in_ep)?;
        writer.endpoint(&pipes.out_ep)?;
        Ok(())
    }

    fn reset(&mut self) {
        info!("usb: msc: Bus reset");
        if self.transport.is_connected() {
            if let Err(err) = self.transport.notify(BusEvent::Reset) {
                warn!("usb: msc: Reset notification failed: {}", err);
            }
            if let Err(err) = self.transport.disconnect() {
                warn!("usb: msc: Disconnect on reset failed: {}", err);
            }
        }
        self.transport.pipes_mut().reset();
        self.cleared = [None; 2];
        if let Err(err) = self.connect() {
            warn!("usb: msc: Reconnect failed: {}", err);
        }
    }

    fn poll(&mut self) {
        self.service_cleared();
        self.pump();
    }

    fn control_in(&mut self, xfer: ControlIn<B>) {
        let req = *xfer.request();
        if !self.is_ours(&req) || req.request != CLASS_SPECIFIC_GET_MAX_LUN {
            return;
        }

        let result = match self.transport.get_max_lun(&req) {
            Ok(lun) => xfer.accept_with(&[lun]),
            Err(err) => {
                warn!("usb: msc: Get Max LUN refused: {}", err);
                xfer.reject()
            }
        };
        if let Err(err) = result {
            warn!("usb: msc: Control IN failed: {}", err);
        }
    }

    fn control_out(&mut self, xfer: ControlOut<B>) {
        let req = *xfer.request();

        if self.is_ours(&req) && req.request == CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET {
            let result = match self.transport.bulk_only_reset(&req) {
                Ok(()) => xfer.accept(),
                Err(err) => {
                    warn!("usb: msc: Reset refused: {}", err);
                    xfer.reject()
                }
            };
            if let Err(err) = result {
                warn!("usb: msc: Control OUT failed: {}", err);
            }
            return;
        }

        // Left for the device to accept, the recovery runs on the next poll
        if req.request_type == RequestType::Standard
            && req.recipient == Recipient::Endpoint
            && req.request == Request::CLEAR_FEATURE
            && req.value == Request::FEATURE_ENDPOINT_HALT
        {
            let endpoint = EndpointAddress::from((req.index as u8) & 0x8F);
            if !self.transport.pipes().owns(endpoint) {
                return;
            }
            debug!("usb: msc: CLEAR_FEATURE(ENDPOINT_HALT) on {}", endpoint);
            if let Some(slot) = self
                .cleared
                .iter_mut()
                .find(|slot| slot.is_none() || **slot == Some(endpoint))
            {
                *slot = Some(endpoint);
            }
        }
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if self.transport.pipes().owns(addr) {
            self.pump();
        }
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if self.transport.pipes().owns(addr) {
            self.pump();
        }
    }
}
