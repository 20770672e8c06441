//! Bulk Only Transport (BBB/BOT)
//!
//! [BulkOnly] runs the function side of the Bulk-Only protocol on top of a
//! [BulkPipes] implementation. Every step is triggered by a pipe
//! [Completion]: a CBW receive starts a command, data completions move the
//! data phase forward, and the CSW send loops back to the next CBW.
//!
//! Faults that the protocol resolves through the host (stall, then
//! Clear-Feature or Reset Recovery) are kept as sticky [Faults] until the host
//! comes back.

use crate::subclass::{CommandBlock, CommandHandler, Status};
use crate::transport::pipe::{
    BulkPipes, BusEvent, Completion, EndpointKind, InterfaceInfo, Irp, IrpKind, IrpStatus,
    Transfer,
};
use crate::transport::wrapper::{encode_csw, CommandBlockWrapper, CBW_LEN};
use crate::transport::{CommandStatus, TransportError};
use bitflags::bitflags;
use core::borrow::BorrowMut;
use core::cmp::min;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;

/// Bulk Only Transport interface protocol
pub const TRANSPORT_BBB: u8 = 0x50;

/// Bulk-Only Mass Storage Reset class request
pub const CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;
/// Get Max LUN class request
pub const CLASS_SPECIFIC_GET_MAX_LUN: u8 = 0xFE;

/// Highest LUN the protocol can address
pub const MAX_LUN: u8 = 0x0F;

const CB_LUN_BYTE: usize = 1;
const CB_LUN_SHIFT: u8 = 5;
const CB_LUN_KEEP_MASK: u8 = 0x1F;
/// CDB byte 1 only has room for LUN 0..=7, handlers route on [CommandBlock::lun]
const CB_LUN_MASK: u8 = 0x07;

/// Residue some hosts probe with and expect to be cleared on failure
const PROBE_RESIDUE: u32 = 0x08;

/// Bulk Only Transport error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BulkOnlyError {
    /// Invalid MAX_LUN value. Refer to USB BBB doc
    InvalidMaxLun,
    /// The IO buffer cannot fit a CBW or the requested data chunk
    BufferTooSmall,
    /// No session is active
    NotConnected,
    /// The interface has no bulk pipe pair or the handler refused the session
    NotPresent,
    /// The call is not legal in the current stage
    InvalidState,
    /// Malformed class-specific request
    InvalidRequest,
    /// No logical unit is available
    NoMedia,
}

pub type BulkOnlyTransportResult<T> = Result<T, TransportError<BulkOnlyError>>;

const NOT_CONNECTED: TransportError<BulkOnlyError> =
    TransportError::Error(BulkOnlyError::NotConnected);

/// How completions reach the state machine
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Dispatch {
    /// The state machine runs inside [BulkOnly::complete]
    #[default]
    Direct,
    /// Completions only post [Events]; [BulkOnly::run_pending] does the work
    Deferred,
}

/// Stage of the current command
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    /// Waiting for a CBW
    Command,
    /// Data phase in progress or awaited
    Data,
    /// CSW sent, waiting for it to complete
    Status,
}

bitflags! {
    /// Sticky faults consumed by the Clear-Feature recovery
    #[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Faults: u8 {
        /// Malformed CBW, only Reset Recovery clears it
        const INVALID_CBW = 1 << 0;
        /// Command failed with the data pipe halted
        const CMD_FAILED = 1 << 1;
        /// Host and device disagree on the data phase
        const PHASE_ERROR = 1 << 2;
    }
}

bitflags! {
    /// Work posted for the worker in [Dispatch::Deferred] mode
    #[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Events: u8 {
        const COMMAND = 1 << 0;
        const DATA_STATUS = 1 << 1;
        const CLEAR_FEATURE = 1 << 2;
    }
}

struct Session {
    interface: u8,
    in_ep: EndpointAddress,
    out_ep: EndpointAddress,
    stage: Stage,
    raw_cbw: [u8; CBW_LEN],
    cbw: CommandBlockWrapper,
    residue: u32,
    data_len: usize,
    data_direction: Option<UsbDirection>,
    data_ep: EndpointAddress,
    data_in_flight: bool,
    faults: Faults,
    events: Events,
    data_done: Option<Completion>,
}

impl Session {
    fn new(interface: u8, in_ep: EndpointAddress, out_ep: EndpointAddress) -> Self {
        Self {
            interface,
            in_ep,
            out_ep,
            stage: Stage::Command,
            raw_cbw: [0; CBW_LEN],
            cbw: Default::default(),
            residue: 0,
            data_len: 0,
            data_direction: None,
            data_ep: out_ep,
            data_in_flight: false,
            faults: Faults::empty(),
            events: Events::empty(),
            data_done: None,
        }
    }

    fn owns(&self, ep: EndpointAddress) -> bool {
        ep == self.in_ep || ep == self.out_ep
    }
}

/// Bulk Only Transport
///
/// Owns the pipe layer, the command handler and the IO buffer. Drive it by
/// passing every pipe completion to [complete] and, in [Dispatch::Deferred]
/// mode, by calling [run_pending] from the worker context.
///
/// [complete]: crate::transport::bbb::BulkOnly::complete
/// [run_pending]: crate::transport::bbb::BulkOnly::run_pending
pub struct BulkOnly<P, H, Buf>
where
    P: BulkPipes,
    H: CommandHandler,
    Buf: BorrowMut<[u8]>,
{
    pipes: P,
    handler: H,
    buf: Buf,
    max_lun: u8,
    dispatch: Dispatch,
    session: Option<Session>,
}

impl<P, H, Buf> BulkOnly<P, H, Buf>
where
    P: BulkPipes,
    H: CommandHandler,
    Buf: BorrowMut<[u8]>,
{
    /// Creates a Bulk Only Transport instance
    ///
    /// # Arguments
    /// * `pipes` - the bulk pipe layer
    /// * `handler` - the command interpreter
    /// * `buf` - the IO buffer. It is **required** to fit at least a `CBW`. It is
    /// **recommended** that it fits at least one block of the media
    /// * `max_lun` - the max index of the Logical Unit accepted in a CBW
    /// * `dispatch` - where the state machine runs
    ///
    /// # Errors
    /// * [InvalidMaxLun]
    /// * [BufferTooSmall]
    ///
    /// [InvalidMaxLun]: crate::transport::bbb::BulkOnlyError::InvalidMaxLun
    /// [BufferTooSmall]: crate::transport::bbb::BulkOnlyError::BufferTooSmall
    pub fn new(
        pipes: P,
        handler: H,
        buf: Buf,
        max_lun: u8,
        dispatch: Dispatch,
    ) -> Result<Self, BulkOnlyError> {
        if max_lun > MAX_LUN {
            return Err(BulkOnlyError::InvalidMaxLun);
        }
        if buf.borrow().len() < CBW_LEN {
            return Err(BulkOnlyError::BufferTooSmall);
        }

        Ok(BulkOnly {
            pipes,
            handler,
            buf,
            max_lun,
            dispatch,
            session: None,
        })
    }

    /// Binds a session to `interface` and arms the first CBW receive
    ///
    /// # Errors
    /// * [NotPresent] - no bulk IN/OUT pair on the interface, or the handler
    /// refused the connection
    /// * [InvalidState] - a session is already active
    ///
    /// [NotPresent]: crate::transport::bbb::BulkOnlyError::NotPresent
    /// [InvalidState]: crate::transport::bbb::BulkOnlyError::InvalidState
    pub fn connect(&mut self, interface: InterfaceInfo<'_>) -> BulkOnlyTransportResult<()> {
        if self.session.is_some() {
            return Err(TransportError::Error(BulkOnlyError::InvalidState));
        }

        let find = |direction: UsbDirection| {
            interface
                .endpoints
                .iter()
                .find(|ep| ep.kind == EndpointKind::Bulk && ep.address.direction() == direction)
                .map(|ep| ep.address)
        };
        let (Some(in_ep), Some(out_ep)) = (find(UsbDirection::In), find(UsbDirection::Out))
        else {
            warn!("usb: bbb: No bulk pipe pair on interface {}", interface.number);
            return Err(TransportError::Error(BulkOnlyError::NotPresent));
        };

        if self.handler.connect().is_err() {
            warn!("usb: bbb: Connection refused by handler");
            return Err(TransportError::Error(BulkOnlyError::NotPresent));
        }

        info!("usb: bbb: Connect interface {}", interface.number);
        self.session = Some(Session::new(interface.number, in_ep, out_ep));

        if !self.pipes.handles_set_configuration() {
            self.handler.notify(BusEvent::Connect);
        }

        if let Err(err) = self.arm_cbw() {
            self.session = None;
            self.handler.disconnect();
            return Err(err);
        }
        Ok(())
    }

    /// Flushes both pipes and releases the session
    ///
    /// Completions of the flushed IRPs are ignored when they arrive.
    pub fn disconnect(&mut self) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_ref().ok_or(NOT_CONNECTED)?;
        info!("usb: bbb: Disconnect interface {}", session.interface);

        self.pipes.flush(session.in_ep);
        self.pipes.flush(session.out_ep);
        self.handler.disconnect();
        self.session = None;
        Ok(())
    }

    /// Feeds a pipe completion to the state machine
    pub fn complete(&mut self, completion: Completion) -> BulkOnlyTransportResult<()> {
        let Some(session) = self.session.as_mut() else {
            trace!("usb: bbb: Completion without session ignored");
            return Ok(());
        };
        if completion.status == IrpStatus::Cancelled {
            trace!("usb: bbb: Cancelled {} ignored", completion.kind);
            return Ok(());
        }

        match completion.kind {
            IrpKind::Command => {
                if let IrpStatus::Failed(err) = completion.status {
                    warn!("usb: bbb: CBW receive failed: {}", err);
                    return Ok(());
                }
                let received = self
                    .pipes
                    .take_received(completion.endpoint, &mut session.raw_cbw);
                // an overlong transfer only copies a CBW worth of bytes
                let actual = if completion.actual > CBW_LEN {
                    completion.actual
                } else {
                    min(completion.actual, received)
                };

                match CommandBlockWrapper::validate(&session.raw_cbw, actual, self.max_lun) {
                    Ok(cbw) => {
                        info!("usb: bbb: Recv CBW: {}", cbw);
                        session.cbw = cbw;
                        match self.dispatch {
                            Dispatch::Direct => self.process_cbw(),
                            Dispatch::Deferred => {
                                session.events.insert(Events::COMMAND);
                                Ok(())
                            }
                        }
                    }
                    Err(reason) => {
                        warn!("usb: bbb: Invalid CBW: {}", reason);
                        session.faults.insert(Faults::INVALID_CBW);
                        self.stall_pipes()
                    }
                }
            }
            IrpKind::Data => {
                session.data_in_flight = false;
                match self.dispatch {
                    Dispatch::Direct => self.process_data_and_status(completion),
                    Dispatch::Deferred => {
                        session.data_done = Some(completion);
                        session.events.insert(Events::DATA_STATUS);
                        Ok(())
                    }
                }
            }
            IrpKind::Status => {
                trace!("usb: bbb: CSW sent");
                if session.stage == Stage::Status {
                    session.stage = Stage::Command;
                }
                Ok(())
            }
        }
    }

    /// The host cleared ENDPOINT_HALT on `endpoint`
    pub fn clear_feature(&mut self, endpoint: EndpointAddress) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_mut().ok_or(NOT_CONNECTED)?;
        if !session.owns(endpoint) {
            return Ok(());
        }
        debug!("usb: bbb: Clear halt: {}", endpoint);
        match self.dispatch {
            Dispatch::Direct => self.clear_feature_recovery(),
            Dispatch::Deferred => {
                session.events.insert(Events::CLEAR_FEATURE);
                Ok(())
            }
        }
    }

    /// Drains the events posted in [Dispatch::Deferred] mode
    ///
    /// Runs the posted steps one at a time in the order: command, data and
    /// status, Clear-Feature. Returns once nothing is left.
    pub fn run_pending(&mut self) -> BulkOnlyTransportResult<()> {
        loop {
            let Some(session) = self.session.as_mut() else {
                return Ok(());
            };

            if session.events.contains(Events::COMMAND) {
                session.events.remove(Events::COMMAND);
                self.process_cbw()?;
                continue;
            }

            if session.events.contains(Events::DATA_STATUS) {
                session.events.remove(Events::DATA_STATUS);
                if let Some(completion) = session.data_done.take() {
                    self.process_data_and_status(completion)?;
                }
                continue;
            }

            if session.events.contains(Events::CLEAR_FEATURE) {
                session.events.remove(Events::CLEAR_FEATURE);
                self.clear_feature_recovery()?;
                continue;
            }

            return Ok(());
        }
    }

    /// Starts a data transfer of `len` bytes of the IO buffer
    ///
    /// Used by handlers that answered [Status::Pending]: fill [io_buffer] (IN)
    /// and call this, or call it to receive into the buffer (OUT).
    ///
    /// [io_buffer]: crate::transport::bbb::BulkOnly::io_buffer
    ///
    /// # Errors
    /// * [InvalidState] - not in the Data stage or a transfer is in flight
    /// * [BufferTooSmall] - `len` does not fit the IO buffer
    ///
    /// [InvalidState]: crate::transport::bbb::BulkOnlyError::InvalidState
    /// [BufferTooSmall]: crate::transport::bbb::BulkOnlyError::BufferTooSmall
    pub fn submit_data(&mut self, len: usize) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_ref().ok_or(NOT_CONNECTED)?;
        if session.stage != Stage::Data || session.data_in_flight {
            return Err(TransportError::Error(BulkOnlyError::InvalidState));
        }

        if len == 0 {
            self.halt(Faults::CMD_FAILED)
        } else if len <= session.residue as usize {
            if len > self.buf.borrow().len() {
                return Err(TransportError::Error(BulkOnlyError::BufferTooSmall));
            }
            self.submit_data_irp(len)
        } else {
            self.halt(Faults::PHASE_ERROR)
        }
    }

    /// Handles Bulk-Only Mass Storage Reset
    ///
    /// # Errors
    /// * [InvalidRequest] - not a well-formed reset for this interface
    ///
    /// [InvalidRequest]: crate::transport::bbb::BulkOnlyError::InvalidRequest
    pub fn bulk_only_reset(&mut self, req: &Request) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_mut().ok_or(NOT_CONNECTED)?;
        if !is_class_request(req, CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET, session.interface)
            || req.length != 0
        {
            return Err(TransportError::Error(BulkOnlyError::InvalidRequest));
        }

        info!("usb: bbb: Recv Bulk-Only Mass Storage Reset");
        session.faults.remove(Faults::INVALID_CBW);
        self.unstall_pipes()?;

        let session = self.session.as_mut().ok_or(NOT_CONNECTED)?;
        self.pipes.flush(session.in_ep);
        self.pipes.flush(session.out_ep);
        session.data_direction = None;
        session.data_len = 0;
        session.data_in_flight = false;
        session.data_done = None;
        session.events = Events::empty();
        session.faults.remove(Faults::CMD_FAILED | Faults::PHASE_ERROR);

        self.handler.reset();
        self.arm_cbw()
    }

    /// Handles Get Max LUN, returning the byte to answer with
    ///
    /// # Errors
    /// * [InvalidRequest] - not a well-formed request for this interface
    /// * [NoMedia] - the handler has no logical unit
    ///
    /// [InvalidRequest]: crate::transport::bbb::BulkOnlyError::InvalidRequest
    /// [NoMedia]: crate::transport::bbb::BulkOnlyError::NoMedia
    pub fn get_max_lun(&mut self, req: &Request) -> BulkOnlyTransportResult<u8> {
        let session = self.session.as_ref().ok_or(NOT_CONNECTED)?;
        if !is_class_request(req, CLASS_SPECIFIC_GET_MAX_LUN, session.interface)
            || req.length != 1
        {
            return Err(TransportError::Error(BulkOnlyError::InvalidRequest));
        }

        match self.handler.max_lun() {
            Some(lun) => {
                let lun = min(lun, self.max_lun);
                info!("usb: bbb: Get Max LUN: {}", lun);
                Ok(lun)
            }
            None => Err(TransportError::Error(BulkOnlyError::NoMedia)),
        }
    }

    /// Forwards a bus event to the handler and reacts to it
    pub fn notify(&mut self, event: BusEvent) -> BulkOnlyTransportResult<()> {
        if self.session.is_none() {
            return Ok(());
        }
        debug!("usb: bbb: Bus event: {}", event);
        self.handler.notify(event);

        match event {
            BusEvent::ClearHalt(endpoint) => self.clear_feature(endpoint),
            BusEvent::Disconnect if !self.pipes.handles_set_configuration() => self.disconnect(),
            _ => Ok(()),
        }
    }

    /// Unstalls the bulk pipes that report a halt
    pub fn unstall_pipes(&mut self) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_ref().ok_or(NOT_CONNECTED)?;
        for ep in [session.in_ep, session.out_ep] {
            if self.pipes.is_stalled(ep)? {
                info!("usb: bbb: Unstall ep {}", ep);
                self.pipes.unstall(ep)?;
            }
        }
        Ok(())
    }

    /// The IO buffer shared with the handler
    pub fn io_buffer(&mut self) -> &mut [u8] {
        self.buf.borrow_mut()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn stage(&self) -> Option<Stage> {
        self.session.as_ref().map(|s| s.stage)
    }

    pub fn faults(&self) -> Faults {
        self.session.as_ref().map_or(Faults::empty(), |s| s.faults)
    }

    pub fn pending_events(&self) -> Events {
        self.session.as_ref().map_or(Events::empty(), |s| s.events)
    }

    pub fn residue(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.residue)
    }

    /// Direction and length of the last data phase the handler asked for
    pub fn data_phase(&self) -> Option<(UsbDirection, usize)> {
        self.session
            .as_ref()
            .and_then(|s| s.data_direction.map(|dir| (dir, s.data_len)))
    }

    pub fn interface(&self) -> Option<u8> {
        self.session.as_ref().map(|s| s.interface)
    }

    pub fn max_lun(&self) -> u8 {
        self.max_lun
    }

    pub fn pipes(&self) -> &P {
        &self.pipes
    }

    pub fn pipes_mut(&mut self) -> &mut P {
        &mut self.pipes
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    fn process_cbw(&mut self) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_mut().ok_or(NOT_CONNECTED)?;
        let cbw = &mut session.cbw;

        session.residue = cbw.transfer_len;
        let lun_bits = (cbw.lun & CB_LUN_MASK) << CB_LUN_SHIFT;
        cbw.block[CB_LUN_BYTE] = (cbw.block[CB_LUN_BYTE] & CB_LUN_KEEP_MASK) | lun_bits;

        let host_direction = cbw.direction();
        session.data_ep = match host_direction {
            UsbDirection::In => session.in_ep,
            UsbDirection::Out => session.out_ep,
        };

        let cb = CommandBlock {
            bytes: &cbw.block,
            lun: cbw.lun,
        };
        let buf = self.buf.borrow_mut();
        let phase = self.handler.new_command(&cb, buf);
        let buf_len = buf.len();

        session.data_len = phase.len;
        session.data_direction = Some(phase.direction);

        let host_len = session.residue as usize;
        let len = phase.len;
        let mismatch = len > 0 && phase.direction != host_direction;

        trace!(
            "usb: bbb: H: {}, D: {}, status: {}, mismatch: {}",
            host_len,
            len,
            phase.status,
            mismatch
        );

        match phase.status {
            Status::Stall | Status::Failed if host_len > 0 => self.halt(Faults::CMD_FAILED),
            Status::Stall | Status::Failed => self.submit_status(CommandStatus::Failed),
            _ if host_len == 0 => {
                if len > 0 {
                    self.submit_status(CommandStatus::PhaseError)
                } else {
                    self.submit_status(CommandStatus::Passed)
                }
            }
            Status::Pending if len == 0 => self.halt(Faults::CMD_FAILED),
            Status::Pending if mismatch => self.halt(Faults::PHASE_ERROR),
            Status::Pending => {
                session.stage = Stage::Data;
                Ok(())
            }
            _ if mismatch => self.halt(Faults::PHASE_ERROR),
            _ if len == 0 => self.halt(Faults::CMD_FAILED),
            _ if len <= host_len => {
                if len > buf_len {
                    warn!("usb: bbb: Data phase of {} does not fit the IO buffer", len);
                    return self.halt(Faults::CMD_FAILED);
                }
                self.submit_data_irp(len)
            }
            _ => self.halt(Faults::PHASE_ERROR),
        }
    }

    fn process_data_and_status(&mut self, completion: Completion) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_mut().ok_or(NOT_CONNECTED)?;

        if completion.length == 0 {
            if session.residue == PROBE_RESIDUE {
                session.residue = 0;
            }
            return self.submit_status(CommandStatus::Failed);
        }

        let actual = min(completion.actual, completion.length);
        let shortfall = completion.length - actual;
        session.residue += shortfall as u32;
        session.data_len = actual;

        trace!(
            "usb: bbb: Data done: {} of {}, residue: {}",
            actual,
            completion.length,
            session.residue
        );

        let buf = self.buf.borrow_mut();
        let actual = min(actual, buf.len());
        if completion.endpoint.direction() == UsbDirection::Out {
            self.pipes
                .take_received(completion.endpoint, &mut buf[..actual]);
        }
        let reply = self.handler.transfer_done(buf, actual);
        let buf_len = buf.len();
        let residue = session.residue;

        match reply.status {
            Status::Pending => {
                session.stage = Stage::Data;
                Ok(())
            }
            Status::Success if residue != 0 && shortfall == 0 && reply.len > 0 => {
                let len = min(reply.len, residue as usize);
                if len > buf_len {
                    warn!("usb: bbb: Data chunk of {} does not fit the IO buffer", len);
                    return self.halt(Faults::CMD_FAILED);
                }
                self.submit_data_irp(len)
            }
            _ if residue != 0 => self.halt(Faults::CMD_FAILED),
            _ => self.submit_status(CommandStatus::Passed),
        }
    }

    /// Runs exactly one recovery action for the faults that are set
    fn clear_feature_recovery(&mut self) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_mut().ok_or(NOT_CONNECTED)?;
        let faults = session.faults;
        debug!("usb: bbb: Clear-Feature recovery, faults: {}", faults.bits());

        if faults.contains(Faults::INVALID_CBW) {
            self.stall_pipes()
        } else if faults.contains(Faults::CMD_FAILED) {
            session.faults.remove(Faults::CMD_FAILED | Faults::PHASE_ERROR);
            self.submit_status(CommandStatus::Failed)
        } else if faults.contains(Faults::PHASE_ERROR) {
            session.faults.remove(Faults::PHASE_ERROR);
            self.submit_status(CommandStatus::PhaseError)
        } else {
            Ok(())
        }
    }

    fn submit_data_irp(&mut self, len: usize) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_mut().ok_or(NOT_CONNECTED)?;
        let transfer = match session.cbw.direction() {
            UsbDirection::In => Transfer::In(&self.buf.borrow()[..len]),
            UsbDirection::Out => Transfer::Out {
                length: len,
                short_ok: true,
            },
        };

        self.pipes.submit(Irp {
            endpoint: session.data_ep,
            kind: IrpKind::Data,
            transfer,
        })?;

        session.residue -= len as u32;
        session.stage = Stage::Data;
        session.data_in_flight = true;
        trace!("usb: bbb: Data IRP: {}, residue: {}", len, session.residue);
        Ok(())
    }

    fn arm_cbw(&mut self) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_mut().ok_or(NOT_CONNECTED)?;
        self.pipes.submit(Irp {
            endpoint: session.out_ep,
            kind: IrpKind::Command,
            transfer: Transfer::Out {
                length: CBW_LEN,
                short_ok: true,
            },
        })?;
        session.stage = Stage::Command;
        Ok(())
    }

    fn submit_status(&mut self, status: CommandStatus) -> BulkOnlyTransportResult<()> {
        self.arm_cbw()?;

        let session = self.session.as_mut().ok_or(NOT_CONNECTED)?;
        let csw = encode_csw(session.cbw.tag, session.residue, status);
        info!(
            "usb: bbb: Send CSW: tag: {}, residue: {}, status: {}",
            session.cbw.tag,
            session.residue,
            status
        );

        self.pipes.submit(Irp {
            endpoint: session.in_ep,
            kind: IrpKind::Status,
            transfer: Transfer::In(&csw),
        })?;
        session.stage = Stage::Status;
        session.residue = 0;
        session.data_direction = None;
        session.data_len = 0;
        Ok(())
    }

    /// Records `fault` and halts the data pipe of the current command
    fn halt(&mut self, fault: Faults) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_mut().ok_or(NOT_CONNECTED)?;
        session.faults.insert(fault);
        info!(
            "usb: bbb: Stall data ep {}, faults: {}",
            session.data_ep,
            session.faults.bits()
        );
        self.pipes.stall(session.data_ep)?;
        Ok(())
    }

    /// Stalls IN then OUT, rolling the IN stall back if OUT fails
    fn stall_pipes(&mut self) -> BulkOnlyTransportResult<()> {
        let session = self.session.as_ref().ok_or(NOT_CONNECTED)?;
        let (in_ep, out_ep) = (session.in_ep, session.out_ep);

        info!("usb: bbb: Stall IN ep");
        self.pipes.stall(in_ep)?;
        info!("usb: bbb: Stall OUT ep");
        if let Err(err) = self.pipes.stall(out_ep) {
            warn!("usb: bbb: Stall OUT ep failed: {}, rolling back IN", err);
            if self.pipes.unstall(in_ep).is_err() {
                warn!("usb: bbb: Unstall IN ep failed");
            }
            return Err(TransportError::Usb(err));
        }
        Ok(())
    }
}

fn is_class_request(req: &Request, request: u8, interface: u8) -> bool {
    req.request_type == RequestType::Class
        && req.recipient == Recipient::Interface
        && req.request == request
        && req.value == 0
        && req.index == interface as u16
}
