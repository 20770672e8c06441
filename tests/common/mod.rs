#![allow(dead_code)]

use std::collections::VecDeque;
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbError;
use usbd_bulk_only::subclass::{CommandBlock, CommandHandler, DataPhase, Rejected, Reply};
use usbd_bulk_only::transport::bbb::{BulkOnly, Dispatch};
use usbd_bulk_only::transport::pipe::{
    BulkPipes, BusEvent, Completion, EndpointInfo, EndpointKind, InterfaceInfo, Irp, IrpKind,
    IrpStatus, Transfer,
};
use usbd_bulk_only::transport::CommandStatus;

#[cfg(feature = "scsi")]
pub mod bus;
#[cfg(feature = "scsi")]
pub mod disk;

pub const OUT_EP: u8 = 0x01;
pub const IN_EP: u8 = 0x81;
pub const INTERFACE: u8 = 0;
pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

pub fn ep(addr: u8) -> EndpointAddress {
    EndpointAddress::from(addr)
}

#[allow(dead_code)]
pub enum DataDirection {
    Out,
    In,
    NotExpected,
}

/// Command Block Wrapper as a host would build it
pub struct Cbw {
    pub tag: u32,
    pub data_transfer_len: u32,
    pub direction: DataDirection,
    pub lun: u8,
    pub block: Vec<u8>,
}

impl Cbw {
    pub fn new(tag: u32, data_transfer_len: u32, direction: DataDirection, block: &[u8]) -> Self {
        Self {
            tag,
            data_transfer_len,
            direction,
            lun: 0,
            block: block.to_vec(),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();

        assert!((1..=16).contains(&self.block.len()));

        let mut bytes = vec![];
        bytes.extend_from_slice(CBW_SIGNATURE_LE.as_slice()); // signature
        bytes.extend_from_slice(self.tag.to_le_bytes().as_slice()); // tag
        bytes.extend_from_slice(self.data_transfer_len.to_le_bytes().as_slice()); // data transfer len

        let direction = match self.direction {
            DataDirection::In => 1_u8 << 7,
            DataDirection::Out | DataDirection::NotExpected => 0u8,
        };
        bytes.push(direction); // direction
        bytes.push(self.lun); // lun
        bytes.push(self.block.len() as u8); // block size

        let mut block = vec![0u8; 16];
        block[..self.block.len()].copy_from_slice(self.block.as_slice());
        bytes.extend_from_slice(block.as_slice()); // block

        bytes
    }
}

/// Command Status Wrapper as a host would parse it
#[derive(Debug, Eq, PartialEq)]
pub struct Csw {
    pub tag: u32,
    pub data_residue: u32,
    pub status: CommandStatus,
}

impl Csw {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(CSW_LEN, bytes.len());
        assert_eq!(0x53425355u32.to_le_bytes(), bytes[..4]);

        Self {
            tag: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            data_residue: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            status: CommandStatus::try_from(bytes[12]).expect("invalid status code"),
        }
    }
}

/// A call the engine made on the pipes
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Call {
    Submit {
        ep: u8,
        kind: IrpKind,
        length: usize,
        /// IN payload
        data: Vec<u8>,
    },
    Stall(u8),
    Unstall(u8),
    Flush(u8),
}

/// Recording pipe double
pub struct MockPipes {
    pub calls: Vec<Call>,
    pub stalled: Vec<u8>,
    /// Bytes handed out by the next `take_received`
    pub received: Vec<u8>,
    pub fail_submit: bool,
    pub fail_stall: Option<u8>,
    pub set_configuration: bool,
}

impl Default for MockPipes {
    fn default() -> Self {
        Self {
            calls: vec![],
            stalled: vec![],
            received: vec![],
            fail_submit: false,
            fail_stall: None,
            set_configuration: true,
        }
    }
}

impl MockPipes {
    pub fn submits(&self) -> Vec<&Call> {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Submit { .. }))
            .collect()
    }

    pub fn data_submits(&self) -> Vec<(u8, usize)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Submit {
                    ep,
                    kind: IrpKind::Data,
                    length,
                    ..
                } => Some((*ep, *length)),
                _ => None,
            })
            .collect()
    }

    pub fn csws(&self) -> Vec<Csw> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Submit {
                    ep,
                    kind: IrpKind::Status,
                    data,
                    ..
                } => {
                    assert_eq!(IN_EP, *ep);
                    Some(Csw::from_bytes(data))
                }
                _ => None,
            })
            .collect()
    }

    pub fn cbw_arms(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::Submit {
                        ep: OUT_EP,
                        kind: IrpKind::Command,
                        length: CBW_LEN,
                        ..
                    }
                )
            })
            .count()
    }

    pub fn stalls(&self) -> Vec<u8> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Stall(ep) => Some(*ep),
                _ => None,
            })
            .collect()
    }

    pub fn is_halted(&self, addr: u8) -> bool {
        self.stalled.contains(&addr)
    }
}

impl BulkPipes for MockPipes {
    fn submit(&mut self, irp: Irp<'_>) -> Result<(), UsbError> {
        if self.fail_submit {
            return Err(UsbError::WouldBlock);
        }
        let data = match irp.transfer {
            Transfer::In(data) => data.to_vec(),
            Transfer::Out { .. } => vec![],
        };
        self.calls.push(Call::Submit {
            ep: irp.endpoint.into(),
            kind: irp.kind,
            length: irp.transfer.len(),
            data,
        });
        Ok(())
    }

    fn take_received(&mut self, _endpoint: EndpointAddress, dst: &mut [u8]) -> usize {
        let count = dst.len().min(self.received.len());
        dst[..count].copy_from_slice(&self.received[..count]);
        self.received.drain(..count);
        count
    }

    fn flush(&mut self, endpoint: EndpointAddress) {
        self.calls.push(Call::Flush(endpoint.into()));
    }

    fn stall(&mut self, endpoint: EndpointAddress) -> Result<(), UsbError> {
        let addr: u8 = endpoint.into();
        if self.fail_stall == Some(addr) {
            return Err(UsbError::InvalidEndpoint);
        }
        self.calls.push(Call::Stall(addr));
        if !self.stalled.contains(&addr) {
            self.stalled.push(addr);
        }
        Ok(())
    }

    fn unstall(&mut self, endpoint: EndpointAddress) -> Result<(), UsbError> {
        let addr: u8 = endpoint.into();
        self.calls.push(Call::Unstall(addr));
        self.stalled.retain(|a| *a != addr);
        Ok(())
    }

    fn is_stalled(&self, endpoint: EndpointAddress) -> Result<bool, UsbError> {
        Ok(self.is_halted(endpoint.into()))
    }

    fn handles_set_configuration(&self) -> bool {
        self.set_configuration
    }
}

/// Command handler that answers from a script
pub struct ScriptedHandler {
    /// Answer to every new command
    pub phase: DataPhase,
    /// Answers to data completions, `Reply::done()` once empty
    pub replies: VecDeque<Reply>,
    /// Byte IN data is filled with
    pub fill: u8,
    pub commands: Vec<Vec<u8>>,
    /// `(len, bytes)` of every data completion
    pub transfers: Vec<(usize, Vec<u8>)>,
    pub events: Vec<BusEvent>,
    pub resets: usize,
    pub refuse_connect: bool,
    pub max_lun: Option<u8>,
    pub connected: bool,
    /// Set on disconnect. Command callbacks panic once set.
    pub poisoned: bool,
}

impl ScriptedHandler {
    pub fn new(phase: DataPhase) -> Self {
        Self {
            phase,
            replies: VecDeque::new(),
            fill: 0xA5,
            commands: vec![],
            transfers: vec![],
            events: vec![],
            resets: 0,
            refuse_connect: false,
            max_lun: Some(0),
            connected: false,
            poisoned: false,
        }
    }

    pub fn replying(mut self, replies: &[Reply]) -> Self {
        self.replies.extend(replies.iter().copied());
        self
    }
}

impl CommandHandler for ScriptedHandler {
    fn new_command(&mut self, cb: &CommandBlock<'_>, buf: &mut [u8]) -> DataPhase {
        assert!(!self.poisoned, "handler used after disconnect");
        self.commands.push(cb.bytes.to_vec());
        let len = self.phase.len.min(buf.len());
        buf[..len].fill(self.fill);
        self.phase
    }

    fn transfer_done(&mut self, buf: &mut [u8], len: usize) -> Reply {
        assert!(!self.poisoned, "handler used after disconnect");
        self.transfers.push((len, buf[..len].to_vec()));
        let reply = self.replies.pop_front().unwrap_or(Reply::done());
        let fill = reply.len.min(buf.len());
        buf[..fill].fill(self.fill);
        reply
    }

    fn connect(&mut self) -> Result<(), Rejected> {
        if self.refuse_connect {
            return Err(Rejected);
        }
        self.connected = true;
        self.poisoned = false;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.poisoned = true;
    }

    fn reset(&mut self) {
        self.resets += 1;
    }

    fn max_lun(&self) -> Option<u8> {
        self.max_lun
    }

    fn notify(&mut self, event: BusEvent) {
        self.events.push(event);
    }
}

pub type Bot<H> = BulkOnly<MockPipes, H, [u8; 512]>;

pub fn endpoints() -> [EndpointInfo; 2] {
    [
        EndpointInfo {
            address: ep(IN_EP),
            kind: EndpointKind::Bulk,
        },
        EndpointInfo {
            address: ep(OUT_EP),
            kind: EndpointKind::Bulk,
        },
    ]
}

/// An engine with a live session and a clean call log
pub fn connected<H: CommandHandler>(handler: H, max_lun: u8, dispatch: Dispatch) -> Bot<H> {
    let mut bot = BulkOnly::new(MockPipes::default(), handler, [0u8; 512], max_lun, dispatch)
        .expect("valid configuration");
    let endpoints = endpoints();
    bot.connect(InterfaceInfo {
        number: INTERFACE,
        endpoints: &endpoints,
    })
    .expect("connect");
    bot.pipes_mut().calls.clear();
    bot
}

/// Delivers raw CBW bytes as a finished command IRP
pub fn send_raw<H: CommandHandler>(bot: &mut Bot<H>, bytes: &[u8]) {
    bot.pipes_mut().received = bytes.to_vec();
    bot.complete(Completion {
        endpoint: ep(OUT_EP),
        kind: IrpKind::Command,
        status: IrpStatus::Success,
        length: CBW_LEN,
        actual: bytes.len(),
    })
    .expect("command completion");
}

pub fn send_cbw<H: CommandHandler>(bot: &mut Bot<H>, cbw: Cbw) {
    send_raw(bot, &cbw.into_bytes());
}

/// Finishes the data IRP on `addr` with `actual` of `length` bytes moved
pub fn finish_data<H: CommandHandler>(bot: &mut Bot<H>, addr: u8, length: usize, actual: usize) {
    finish_data_with(bot, addr, length, actual, IrpStatus::Success);
}

pub fn finish_data_with<H: CommandHandler>(
    bot: &mut Bot<H>,
    addr: u8,
    length: usize,
    actual: usize,
    status: IrpStatus,
) {
    if addr == OUT_EP {
        bot.pipes_mut().received = vec![0x5A; actual];
    }
    bot.complete(Completion {
        endpoint: ep(addr),
        kind: IrpKind::Data,
        status,
        length,
        actual,
    })
    .expect("data completion");
}

pub fn finish_csw<H: CommandHandler>(bot: &mut Bot<H>) {
    bot.complete(Completion {
        endpoint: ep(IN_EP),
        kind: IrpKind::Status,
        status: IrpStatus::Success,
        length: CSW_LEN,
        actual: CSW_LEN,
    })
    .expect("status completion");
}
