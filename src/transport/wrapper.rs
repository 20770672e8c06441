//! Command Block Wrapper and Command Status Wrapper codecs.
//!
//! Refer to the USB Mass Storage Bulk-Only Transport doc, section 5.

use crate::transport::CommandStatus;
use usb_device::UsbDirection;

/// Length of a Command Block Wrapper on the wire
pub const CBW_LEN: usize = 31;
/// Length of a Command Status Wrapper on the wire
pub const CSW_LEN: usize = 13;
/// Maximum Command Block length
pub const MAX_CB_LEN: usize = 16;

pub(crate) const CBW_SIGNATURE: u32 = 0x43425355;
pub(crate) const CSW_SIGNATURE: u32 = 0x53425355;

const CBW_SIGNATURE_LE: [u8; 4] = CBW_SIGNATURE.to_le_bytes();
const CSW_SIGNATURE_LE: [u8; 4] = CSW_SIGNATURE.to_le_bytes();

const FLAGS_DIRECTION_IN: u8 = 1 << 7;
const LUN_RESERVED_MASK: u8 = 0xF0;
const LUN_MASK: u8 = 0x0F;

/// The reason a received CBW was rejected
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InvalidCbw {
    /// Transfer was not exactly 31 bytes long
    Length,
    /// dCBWSignature is not `USBC`
    Signature,
    /// The upper nibble of bCBWLUN is not zero
    ReservedBits,
    /// bCBWLUN is greater than the max LUN
    Lun,
    /// bCBWCBLength is greater than 16
    BlockLength,
}

/// A parsed and validated Command Block Wrapper
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandBlockWrapper {
    pub tag: u32,
    pub transfer_len: u32,
    pub flags: u8,
    pub lun: u8,
    pub block_len: u8,
    pub block: [u8; MAX_CB_LEN],
}

impl CommandBlockWrapper {
    /// Validates a received CBW
    ///
    /// Checks stop at the first failure and run in this order: transfer length,
    /// signature, reserved LUN bits, LUN range, Command Block length.
    ///
    /// # Arguments
    /// * `bytes` - received bytes, at least `actual_len` long
    /// * `actual_len` - number of bytes the transfer actually moved
    /// * `max_lun` - the highest LUN the device accepts
    pub fn validate(bytes: &[u8], actual_len: usize, max_lun: u8) -> Result<Self, InvalidCbw> {
        if actual_len != CBW_LEN || bytes.len() < CBW_LEN {
            return Err(InvalidCbw::Length);
        }
        if bytes[..4] != CBW_SIGNATURE_LE {
            return Err(InvalidCbw::Signature);
        }
        let lun = bytes[13];
        if lun & LUN_RESERVED_MASK != 0 {
            return Err(InvalidCbw::ReservedBits);
        }
        if lun & LUN_MASK > max_lun {
            return Err(InvalidCbw::Lun);
        }
        let block_len = bytes[14];
        if block_len as usize > MAX_CB_LEN {
            return Err(InvalidCbw::BlockLength);
        }

        let mut block = [0u8; MAX_CB_LEN];
        block.copy_from_slice(&bytes[15..CBW_LEN]);

        Ok(CommandBlockWrapper {
            tag: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            transfer_len: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            flags: bytes[12],
            lun: lun & LUN_MASK,
            block_len,
            block,
        })
    }

    /// Data direction requested by the host
    pub fn direction(&self) -> UsbDirection {
        if self.flags & FLAGS_DIRECTION_IN != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }
}

/// Encodes a CSW in little-endian wire order
pub fn encode_csw(tag: u32, residue: u32, status: CommandStatus) -> [u8; CSW_LEN] {
    let mut csw = [0u8; CSW_LEN];
    csw[..4].copy_from_slice(CSW_SIGNATURE_LE.as_slice());
    csw[4..8].copy_from_slice(tag.to_le_bytes().as_slice());
    csw[8..12].copy_from_slice(residue.to_le_bytes().as_slice());
    csw[12] = status.into();
    csw
}
