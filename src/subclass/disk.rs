//! SCSI direct access disk
//!
//! A [LogicalUnit] answering the block command set over a [BlockDevice].
//! Register it in a [ScsiContainer](crate::subclass::container::ScsiContainer)
//! together with [ScsiDisk::COMMANDS].
//!
//! READ and WRITE data is moved through the IO buffer in chunks of as many
//! whole blocks as the buffer holds.

use crate::subclass::container::{CommandDescriptor, LogicalUnit};
use crate::subclass::scsi::*;
use crate::subclass::{Reply, Status};
use core::cmp::min;
use usb_device::UsbDirection;

/// Error reported by a [BlockDevice]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockError;

/// Storage backing a [ScsiDisk]
pub trait BlockDevice {
    /// Block length in bytes
    fn block_size(&self) -> u32;

    /// Number of addressable blocks
    fn block_count(&self) -> u32;

    fn is_write_protected(&self) -> bool {
        false
    }

    /// Reads block `lba` into `dst`, which is exactly one block long
    fn read_block(&mut self, lba: u32, dst: &mut [u8]) -> Result<(), BlockError>;

    /// Writes one block from `src` to `lba`
    fn write_block(&mut self, lba: u32, src: &[u8]) -> Result<(), BlockError>;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Medium {
    Absent,
    /// Inserted, unit attention not reported yet
    Inserted,
    Present,
}

/// Data phase in progress
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Progress {
    /// `remaining` blocks starting at `lba` are still to be read
    Read { lba: u32, remaining: u32 },
    /// `remaining` blocks starting at `lba` are still to be written
    Write { lba: u32, remaining: u32 },
    /// Parameter data to be dropped
    Discard,
}

/// INQUIRY identification strings, space padded
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Identity {
    pub vendor: [u8; 8],
    pub product: [u8; 16],
    pub revision: [u8; 4],
}

impl Identity {
    /// Builds an identity from ASCII strings, truncating and space padding them
    pub fn new(vendor: &str, product: &str, revision: &str) -> Self {
        Self {
            vendor: pad(vendor),
            product: pad(product),
            revision: pad(revision),
        }
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new("usbd", "Bulk-Only Disk", "0.1")
    }
}

fn pad<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [b' '; N];
    let n = min(N, s.len());
    out[..n].copy_from_slice(&s.as_bytes()[..n]);
    out
}

/// SCSI disk over a [BlockDevice]
pub struct ScsiDisk<D> {
    device: D,
    identity: Identity,
    medium: Medium,
    sense: Sense,
    last_command: u8,
    progress: Option<Progress>,
}

impl<D: BlockDevice> ScsiDisk<D> {
    /// Creates a disk with the medium present
    pub fn new(device: D) -> Self {
        Self::with_identity(device, Identity::default())
    }

    pub fn with_identity(device: D, identity: Identity) -> Self {
        Self {
            device,
            identity,
            medium: Medium::Present,
            sense: Sense::default(),
            last_command: TEST_UNIT_READY,
            progress: None,
        }
    }

    /// The medium was inserted. The next TEST UNIT READY reports a unit
    /// attention.
    pub fn insert(&mut self) {
        debug!("usb: scsi: Medium inserted");
        self.medium = Medium::Inserted;
    }

    /// The medium was removed
    pub fn remove(&mut self) {
        debug!("usb: scsi: Medium removed");
        self.medium = Medium::Absent;
        self.progress = None;
    }

    pub fn is_present(&self) -> bool {
        self.medium != Medium::Absent
    }

    /// Current sense data
    pub fn sense(&self) -> Sense {
        self.sense
    }

    /// Opcode of the last command handled
    pub fn last_command(&self) -> u8 {
        self.last_command
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_device(self) -> D {
        self.device
    }

    /// Common command prologue. Returns the reply to send right away when no
    /// medium is present.
    fn begin(&mut self, cdb: &[u8]) -> Option<Reply> {
        self.last_command = cdb.first().copied().unwrap_or(TEST_UNIT_READY);
        self.sense.asc = asc::NO_ADDITIONAL_SENSE;
        self.sense.ascq = 0;
        self.progress = None;

        if self.medium == Medium::Absent {
            return Some(self.refuse(SenseKey::NotReady, asc::MEDIUM_NOT_PRESENT));
        }
        None
    }

    fn refuse(&mut self, key: SenseKey, code: u8) -> Reply {
        self.sense = Sense::new(key, code);
        Reply {
            status: Status::Stall,
            len: 0,
        }
    }

    fn accept(&mut self, len: usize) -> Reply {
        self.sense = Sense::default();
        Reply::success(len)
    }

    /// Blocks that fit into `buf`, zero when not even one does
    fn blocks_per_chunk(&self, buf: &[u8]) -> u32 {
        match self.device.block_size() as usize {
            0 => 0,
            bs => (buf.len() / bs) as u32,
        }
    }

    fn in_range(&self, lba: u32, len: u32) -> bool {
        lba as u64 + len as u64 <= self.device.block_count() as u64
    }

    /// Reads up to `remaining` blocks from `lba` into `buf`
    fn read_chunk(&mut self, lba: u32, remaining: u32, buf: &mut [u8]) -> Reply {
        let bs = self.device.block_size() as usize;
        let blocks = min(remaining, self.blocks_per_chunk(buf));
        for (i, block) in buf.chunks_exact_mut(bs).take(blocks as usize).enumerate() {
            let at = lba + i as u32;
            if self.device.read_block(at, block).is_err() {
                warn!("usb: scsi: Read error at LBA {}", at);
                self.sense = Sense::new(SenseKey::MediumError, asc::UNRECOVERED_READ_ERROR);
                self.progress = None;
                return Reply {
                    status: Status::Failed,
                    len: 0,
                };
            }
        }
        self.progress = Some(Progress::Read {
            lba: lba + blocks,
            remaining: remaining - blocks,
        });
        Reply::success(blocks as usize * bs)
    }

    /// Writes the whole blocks received in `buf[..len]`
    fn write_chunk(&mut self, lba: u32, remaining: u32, buf: &[u8], len: usize) -> Reply {
        let bs = self.device.block_size() as usize;
        let chunk = self.blocks_per_chunk(buf);
        let expected = min(remaining, chunk) as usize * bs;
        let blocks = min(remaining, (min(len, buf.len()) / bs) as u32);

        for (i, block) in buf.chunks_exact(bs).take(blocks as usize).enumerate() {
            let at = lba + i as u32;
            if self.device.write_block(at, block).is_err() {
                warn!("usb: scsi: Write error at LBA {}", at);
                self.sense = Sense::new(SenseKey::MediumError, asc::WRITE_ERROR);
                self.progress = None;
                return Reply {
                    status: Status::Failed,
                    len: 0,
                };
            }
        }

        let remaining = remaining - blocks;
        if remaining == 0 || len < expected {
            // the host sent less than announced, the transport accounts for it
            self.progress = None;
            return Reply::done();
        }
        self.progress = Some(Progress::Write {
            lba: lba + blocks,
            remaining,
        });
        Reply::success(min(remaining, chunk) as usize * bs)
    }

    fn test_unit_ready(&mut self, cdb: &[u8], _buf: &mut [u8]) -> Reply {
        if let Some(reply) = self.begin(cdb) {
            return reply;
        }
        if self.medium == Medium::Inserted {
            self.medium = Medium::Present;
            return self.refuse(SenseKey::UnitAttention, asc::NOT_READY_TO_READY_CHANGE);
        }
        self.accept(0)
    }

    fn request_sense(&mut self, cdb: &[u8], buf: &mut [u8]) -> Reply {
        self.last_command = REQUEST_SENSE;
        self.progress = None;
        let ScsiCommand::RequestSense { alloc_len, .. } = parse_cb(cdb) else {
            return self.refuse(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB);
        };
        if self.medium == Medium::Absent {
            self.sense = Sense::new(SenseKey::NotReady, asc::MEDIUM_NOT_PRESENT);
        }

        let len = min(alloc_len as usize, buf.len());
        let len = self.sense.write_fixed(&mut buf[..len]);
        Reply::success(len)
    }

    fn inquiry(&mut self, cdb: &[u8], buf: &mut [u8]) -> Reply {
        if let Some(reply) = self.begin(cdb) {
            return reply;
        }
        let ScsiCommand::Inquiry {
            evpd,
            page_code,
            alloc_len,
        } = parse_cb(cdb)
        else {
            return self.refuse(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB);
        };
        if evpd || page_code != 0 {
            // vital product data pages are not supported
            return self.refuse(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB);
        }

        let mut data = [0u8; INQUIRY_DATA_LEN];
        data[0] = 0x00; // direct access block device
        data[1] = 0x80; // removable
        data[2] = 0x04; // SPC-2
        data[3] = 0x02; // response data format
        data[4] = (INQUIRY_DATA_LEN - 5) as u8;
        data[8..16].copy_from_slice(&self.identity.vendor);
        data[16..32].copy_from_slice(&self.identity.product);
        data[32..36].copy_from_slice(&self.identity.revision);

        let len = min(min(alloc_len as usize, INQUIRY_DATA_LEN), buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        self.accept(len)
    }

    fn mode_sense(&mut self, cdb: &[u8], buf: &mut [u8]) -> Reply {
        if let Some(reply) = self.begin(cdb) {
            return reply;
        }
        let wp = if self.device.is_write_protected() {
            0x80
        } else {
            0x00
        };

        let mut data = [0u8; 8];
        let (header, alloc_len) = match parse_cb(cdb) {
            ScsiCommand::ModeSense6 { alloc_len, .. } => {
                data[0] = 3; // mode data length
                data[2] = wp;
                (4, alloc_len as usize)
            }
            ScsiCommand::ModeSense10 { alloc_len, .. } => {
                data[..2].copy_from_slice(&6u16.to_be_bytes());
                data[3] = wp;
                (8, alloc_len as usize)
            }
            _ => return self.refuse(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB),
        };

        let len = min(min(alloc_len, header), buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        self.accept(len)
    }

    fn mode_select(&mut self, cdb: &[u8], buf: &mut [u8]) -> Reply {
        if let Some(reply) = self.begin(cdb) {
            return reply;
        }
        let ScsiCommand::ModeSelect { param_list_len } = parse_cb(cdb) else {
            return self.refuse(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB);
        };
        let len = min(param_list_len as usize, buf.len());
        if len > 0 {
            self.progress = Some(Progress::Discard);
        }
        self.accept(len)
    }

    fn read_format_capacities(&mut self, cdb: &[u8], buf: &mut [u8]) -> Reply {
        if let Some(reply) = self.begin(cdb) {
            return reply;
        }
        let ScsiCommand::ReadFormatCapacities { alloc_len } = parse_cb(cdb) else {
            return self.refuse(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB);
        };

        let mut data = [0u8; FORMAT_CAPACITIES_DATA_LEN];
        data[3] = 8; // capacity list length
        data[4..8].copy_from_slice(&self.device.block_count().to_be_bytes());
        data[8] = 0x02; // formatted media
        data[9..12].copy_from_slice(&self.device.block_size().to_be_bytes()[1..]);

        let len = min(min(alloc_len as usize, FORMAT_CAPACITIES_DATA_LEN), buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        self.accept(len)
    }

    fn read_capacity(&mut self, cdb: &[u8], buf: &mut [u8]) -> Reply {
        if let Some(reply) = self.begin(cdb) {
            return reply;
        }
        let mut data = [0u8; READ_CAPACITY_10_DATA_LEN];
        let last_lba = self.device.block_count().saturating_sub(1);
        data[..4].copy_from_slice(&last_lba.to_be_bytes());
        data[4..].copy_from_slice(&self.device.block_size().to_be_bytes());

        let len = min(READ_CAPACITY_10_DATA_LEN, buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        self.accept(len)
    }

    fn read(&mut self, cdb: &[u8], buf: &mut [u8]) -> Reply {
        if let Some(reply) = self.begin(cdb) {
            return reply;
        }
        let ScsiCommand::Read { lba, len } = parse_cb(cdb) else {
            return self.refuse(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB);
        };
        if !self.in_range(lba, len) {
            return self.refuse(SenseKey::IllegalRequest, asc::LBA_OUT_OF_RANGE);
        }
        if len == 0 {
            return self.accept(0);
        }
        if self.blocks_per_chunk(buf) == 0 {
            return self.refuse(SenseKey::HardwareError, asc::NO_ADDITIONAL_SENSE);
        }
        self.sense = Sense::default();
        self.read_chunk(lba, len, buf)
    }

    fn write(&mut self, cdb: &[u8], buf: &mut [u8]) -> Reply {
        if let Some(reply) = self.begin(cdb) {
            return reply;
        }
        let ScsiCommand::Write { lba, len } = parse_cb(cdb) else {
            return self.refuse(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB);
        };
        if self.device.is_write_protected() {
            return self.refuse(SenseKey::DataProtect, asc::WRITE_PROTECTED);
        }
        if !self.in_range(lba, len) {
            return self.refuse(SenseKey::IllegalRequest, asc::LBA_OUT_OF_RANGE);
        }
        if len == 0 {
            return self.accept(0);
        }
        let chunk = self.blocks_per_chunk(buf);
        if chunk == 0 {
            return self.refuse(SenseKey::HardwareError, asc::NO_ADDITIONAL_SENSE);
        }

        self.progress = Some(Progress::Write { lba, remaining: len });
        let bs = self.device.block_size() as usize;
        self.accept(min(len, chunk) as usize * bs)
    }

    /// VERIFY, START STOP UNIT and SEND DIAGNOSTIC
    fn no_data(&mut self, cdb: &[u8], _buf: &mut [u8]) -> Reply {
        if let Some(reply) = self.begin(cdb) {
            return reply;
        }
        self.accept(0)
    }

    fn prevent_allow_medium_removal(&mut self, cdb: &[u8], _buf: &mut [u8]) -> Reply {
        if let Some(reply) = self.begin(cdb) {
            return reply;
        }
        match parse_cb(cdb) {
            ScsiCommand::PreventAllowMediumRemoval { prevent: false } => self.accept(0),
            _ => self.refuse(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_PARAMETER_LIST),
        }
    }
}

impl<D: BlockDevice + 'static> ScsiDisk<D> {
    /// Command table of the disk, pass it to the container
    pub const COMMANDS: &'static [CommandDescriptor<Self>] = &[
        CommandDescriptor {
            opcode: TEST_UNIT_READY,
            direction: UsbDirection::Out,
            handler: Self::test_unit_ready,
        },
        CommandDescriptor {
            opcode: REQUEST_SENSE,
            direction: UsbDirection::In,
            handler: Self::request_sense,
        },
        CommandDescriptor {
            opcode: INQUIRY,
            direction: UsbDirection::In,
            handler: Self::inquiry,
        },
        CommandDescriptor {
            opcode: MODE_SENSE_6,
            direction: UsbDirection::In,
            handler: Self::mode_sense,
        },
        CommandDescriptor {
            opcode: MODE_SENSE_10,
            direction: UsbDirection::In,
            handler: Self::mode_sense,
        },
        CommandDescriptor {
            opcode: MODE_SELECT_6,
            direction: UsbDirection::Out,
            handler: Self::mode_select,
        },
        CommandDescriptor {
            opcode: MODE_SELECT_10,
            direction: UsbDirection::Out,
            handler: Self::mode_select,
        },
        CommandDescriptor {
            opcode: READ_FORMAT_CAPACITIES,
            direction: UsbDirection::In,
            handler: Self::read_format_capacities,
        },
        CommandDescriptor {
            opcode: READ_CAPACITY_10,
            direction: UsbDirection::In,
            handler: Self::read_capacity,
        },
        CommandDescriptor {
            opcode: READ_6,
            direction: UsbDirection::In,
            handler: Self::read,
        },
        CommandDescriptor {
            opcode: READ_10,
            direction: UsbDirection::In,
            handler: Self::read,
        },
        CommandDescriptor {
            opcode: READ_12,
            direction: UsbDirection::In,
            handler: Self::read,
        },
        CommandDescriptor {
            opcode: WRITE_6,
            direction: UsbDirection::Out,
            handler: Self::write,
        },
        CommandDescriptor {
            opcode: WRITE_10,
            direction: UsbDirection::Out,
            handler: Self::write,
        },
        CommandDescriptor {
            opcode: WRITE_12,
            direction: UsbDirection::Out,
            handler: Self::write,
        },
        CommandDescriptor {
            opcode: VERIFY_10,
            direction: UsbDirection::Out,
            handler: Self::no_data,
        },
        CommandDescriptor {
            opcode: START_STOP_UNIT,
            direction: UsbDirection::Out,
            handler: Self::no_data,
        },
        CommandDescriptor {
            opcode: SEND_DIAGNOSTIC,
            direction: UsbDirection::Out,
            handler: Self::no_data,
        },
        CommandDescriptor {
            opcode: PREVENT_ALLOW_MEDIUM_REMOVAL,
            direction: UsbDirection::Out,
            handler: Self::prevent_allow_medium_removal,
        },
    ];
}

impl<D: BlockDevice> LogicalUnit for ScsiDisk<D> {
    fn disconnect(&mut self) {
        self.progress = None;
    }

    fn reset(&mut self) {
        self.progress = None;
        self.sense = Sense::default();
    }

    fn transfer_done(&mut self, buf: &mut [u8], len: usize) -> Reply {
        match self.progress.take() {
            Some(Progress::Read { remaining: 0, .. }) | Some(Progress::Discard) | None => {
                Reply::done()
            }
            Some(Progress::Read { lba, remaining }) => self.read_chunk(lba, remaining, buf),
            Some(Progress::Write { lba, remaining }) => self.write_chunk(lba, remaining, buf, len),
        }
    }

    fn unknown_command(&mut self, cdb: &[u8]) -> Status {
        self.last_command = cdb.first().copied().unwrap_or(TEST_UNIT_READY);
        self.progress = None;
        self.sense = Sense::new(SenseKey::IllegalRequest, asc::INVALID_COMMAND_OPERATION_CODE);
        Status::Stall
    }
}
