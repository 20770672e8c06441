//! USB SCSI
//!
//! Opcodes, Command Block parsing and sense data of the SCSI transparent
//! command set (subclass `0x06`).

use core::cmp::min;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// SCSI device subclass code
pub const SUBCLASS_SCSI: u8 = 0x06; // SCSI Transparent command set

/* SCSI codes */

/* SPC */
pub const TEST_UNIT_READY: u8 = 0x00;
pub const REQUEST_SENSE: u8 = 0x03;
pub const INQUIRY: u8 = 0x12;
pub const MODE_SELECT_6: u8 = 0x15;
pub const MODE_SENSE_6: u8 = 0x1A;
pub const SEND_DIAGNOSTIC: u8 = 0x1D;
pub const PREVENT_ALLOW_MEDIUM_REMOVAL: u8 = 0x1E;
pub const MODE_SELECT_10: u8 = 0x55;
pub const MODE_SENSE_10: u8 = 0x5A;

/* SBC */
pub const READ_6: u8 = 0x08;
pub const WRITE_6: u8 = 0x0A;
pub const START_STOP_UNIT: u8 = 0x1B;
pub const READ_CAPACITY_10: u8 = 0x25;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2A;
pub const VERIFY_10: u8 = 0x2F;
pub const READ_12: u8 = 0xA8;
pub const WRITE_12: u8 = 0xAA;

/* MMC */
pub const READ_FORMAT_CAPACITIES: u8 = 0x23;

/// Fixed format sense data length
pub const SENSE_DATA_LEN: usize = 18;
/// Standard INQUIRY data length
pub const INQUIRY_DATA_LEN: usize = 36;
/// READ CAPACITY (10) data length
pub const READ_CAPACITY_10_DATA_LEN: usize = 8;
/// READ FORMAT CAPACITIES data length, header plus one descriptor
pub const FORMAT_CAPACITIES_DATA_LEN: usize = 12;

const SENSE_RESPONSE_CURRENT: u8 = 0x70;
const SENSE_ADDITIONAL_LEN: u8 = 0x0A;

/// Additional Sense Codes used by this crate
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const WRITE_ERROR: u8 = 0x0C;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const INVALID_FIELD_IN_PARAMETER_LIST: u8 = 0x26;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const NOT_READY_TO_READY_CHANGE: u8 = 0x28;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
}

/// SCSI sense key
#[repr(u8)]
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SenseKey {
    #[default]
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    AbortedCommand = 0x0B,
}

/// Sense state of a logical unit, reported by REQUEST SENSE
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sense {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    pub const fn new(key: SenseKey, asc: u8) -> Self {
        Self { key, asc, ascq: 0 }
    }

    /// Writes fixed format sense data into `dst`, returning the bytes written
    pub fn write_fixed(&self, dst: &mut [u8]) -> usize {
        let mut data = [0u8; SENSE_DATA_LEN];
        data[0] = SENSE_RESPONSE_CURRENT;
        data[2] = u8::from(self.key) & 0x0F;
        data[7] = SENSE_ADDITIONAL_LEN;
        data[12] = self.asc;
        data[13] = self.ascq;

        let len = min(dst.len(), SENSE_DATA_LEN);
        dst[..len].copy_from_slice(&data[..len]);
        len
    }
}

/// SCSI command
///
/// Refer to specifications (SPC,SAM,SBC,MMC,etc.)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum ScsiCommand {
    Unknown,

    /* SPC */
    Inquiry {
        evpd: bool,
        page_code: u8,
        alloc_len: u16,
    },
    TestUnitReady,
    RequestSense {
        desc: bool,
        alloc_len: u8,
    },
    ModeSense6 {
        dbd: bool,
        page_control: PageControl,
        page_code: u8,
        subpage_code: u8,
        alloc_len: u8,
    },
    ModeSense10 {
        dbd: bool,
        page_control: PageControl,
        page_code: u8,
        subpage_code: u8,
        alloc_len: u16,
    },
    ModeSelect {
        param_list_len: u16,
    },
    SendDiagnostic,
    PreventAllowMediumRemoval {
        prevent: bool,
    },

    /* SBC */
    StartStopUnit {
        start: bool,
        load_eject: bool,
    },
    ReadCapacity10,
    Read {
        lba: u32,
        len: u32,
    },
    Write {
        lba: u32,
        len: u32,
    },
    Verify {
        lba: u32,
        len: u16,
    },

    /* MMC */
    ReadFormatCapacities {
        alloc_len: u16,
    },
}

#[repr(u8)]
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PageControl {
    #[default]
    CurrentValues = 0b00,
    ChangeableValues = 0b01,
    DefaultValues = 0b10,
    SavedValues = 0b11,
}

/// Parses a Command Block. Missing trailing bytes read as zero.
pub fn parse_cb(bytes: &[u8]) -> ScsiCommand {
    let mut cb = [0u8; 16];
    let n = min(bytes.len(), cb.len());
    cb[..n].copy_from_slice(&bytes[..n]);

    match cb[0] {
        TEST_UNIT_READY => ScsiCommand::TestUnitReady,
        INQUIRY => ScsiCommand::Inquiry {
            evpd: (cb[1] & 0b00000001) != 0,
            page_code: cb[2],
            alloc_len: u16::from_be_bytes([cb[3], cb[4]]),
        },
        REQUEST_SENSE => ScsiCommand::RequestSense {
            desc: (cb[1] & 0b00000001) != 0,
            alloc_len: cb[4],
        },
        READ_CAPACITY_10 => ScsiCommand::ReadCapacity10,
        READ_6 => ScsiCommand::Read {
            lba: u32::from_be_bytes([0, cb[1] & 0b00011111, cb[2], cb[3]]),
            len: transfer_len_6(cb[4]),
        },
        WRITE_6 => ScsiCommand::Write {
            lba: u32::from_be_bytes([0, cb[1] & 0b00011111, cb[2], cb[3]]),
            len: transfer_len_6(cb[4]),
        },
        READ_10 => ScsiCommand::Read {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u16::from_be_bytes([cb[7], cb[8]]) as u32,
        },
        WRITE_10 => ScsiCommand::Write {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u16::from_be_bytes([cb[7], cb[8]]) as u32,
        },
        READ_12 => ScsiCommand::Read {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u32::from_be_bytes([cb[6], cb[7], cb[8], cb[9]]),
        },
        WRITE_12 => ScsiCommand::Write {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u32::from_be_bytes([cb[6], cb[7], cb[8], cb[9]]),
        },
        VERIFY_10 => ScsiCommand::Verify {
            lba: u32::from_be_bytes([cb[2], cb[3], cb[4], cb[5]]),
            len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        MODE_SENSE_6 => ScsiCommand::ModeSense6 {
            dbd: (cb[1] & 0b00001000) != 0,
            page_control: PageControl::try_from_primitive(cb[2] >> 6).unwrap_or_default(),
            page_code: cb[2] & 0b00111111,
            subpage_code: cb[3],
            alloc_len: cb[4],
        },
        MODE_SENSE_10 => ScsiCommand::ModeSense10 {
            dbd: (cb[1] & 0b00001000) != 0,
            page_control: PageControl::try_from_primitive(cb[2] >> 6).unwrap_or_default(),
            page_code: cb[2] & 0b00111111,
            subpage_code: cb[3],
            alloc_len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        MODE_SELECT_6 => ScsiCommand::ModeSelect {
            param_list_len: cb[4] as u16,
        },
        MODE_SELECT_10 => ScsiCommand::ModeSelect {
            param_list_len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        SEND_DIAGNOSTIC => ScsiCommand::SendDiagnostic,
        PREVENT_ALLOW_MEDIUM_REMOVAL => ScsiCommand::PreventAllowMediumRemoval {
            prevent: (cb[4] & 0b00000011) != 0,
        },
        START_STOP_UNIT => ScsiCommand::StartStopUnit {
            start: (cb[4] & 0b00000001) != 0,
            load_eject: (cb[4] & 0b00000010) != 0,
        },
        READ_FORMAT_CAPACITIES => ScsiCommand::ReadFormatCapacities {
            alloc_len: u16::from_be_bytes([cb[7], cb[8]]),
        },
        _ => ScsiCommand::Unknown,
    }
}

/// A zero transfer length in a 6-byte READ/WRITE means 256 blocks
fn transfer_len_6(len: u8) -> u32 {
    if len == 0 {
        256
    } else {
        len as u32
    }
}
