//! SCSI media container
//!
//! Multiplexes up to `N` logical units onto one transport. Each LUN slot holds
//! one media driver. Commands are routed by the LUN of their CBW and then by
//! opcode through an immutable [CommandDescriptor] table. The LUN bits of CDB
//! byte 1 only hold three bits and are left to the media handlers.
//!
//! Slots are stable: removing a unit leaves its slot empty, so the remaining
//! units keep their LUN numbers.

use crate::subclass::{CommandBlock, CommandHandler, DataPhase, Rejected, Reply, Status};
use usb_device::UsbDirection;

/// Media handler for one opcode
///
/// Gets the CDB and the IO buffer, returns the status and the number of bytes
/// of the buffer to transfer.
pub type CommandFn<M> = fn(&mut M, &[u8], &mut [u8]) -> Reply;

/// An entry of the opcode table
pub struct CommandDescriptor<M> {
    pub opcode: u8,
    /// Data direction the command expects
    pub direction: UsbDirection,
    pub handler: CommandFn<M>,
}

impl<M> Clone for CommandDescriptor<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for CommandDescriptor<M> {}

/// A media driver bound to a LUN slot
pub trait LogicalUnit {
    /// The transport session started
    fn connect(&mut self) -> Result<(), Rejected> {
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn reset(&mut self) {}

    /// A data transfer of the current command finished. See
    /// [CommandHandler::transfer_done].
    fn transfer_done(&mut self, buf: &mut [u8], len: usize) -> Reply;

    /// Called for opcodes missing from the command table. Unknown commands
    /// never move data.
    fn unknown_command(&mut self, cdb: &[u8]) -> Status;
}

/// Media container error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScsiError {
    /// All LUN slots are taken
    TableFull,
    /// The command table is empty
    NoCommands,
    /// No unit is registered at this LUN
    InvalidLun,
    /// The unit refused the running session
    MediaRejected,
}

/// SCSI media container
pub struct ScsiContainer<'c, M: LogicalUnit, const N: usize> {
    commands: &'c [CommandDescriptor<M>],
    slots: [Option<M>; N],
    connected: bool,
    current: Option<usize>,
}

impl<'c, M: LogicalUnit, const N: usize> ScsiContainer<'c, M, N> {
    /// Creates an empty container routing through `commands`
    pub fn new(commands: &'c [CommandDescriptor<M>]) -> Self {
        Self {
            commands,
            slots: core::array::from_fn(|_| None),
            connected: false,
            current: None,
        }
    }

    /// Binds `media` to the first free slot, returning its LUN
    ///
    /// # Errors
    /// * [ScsiError::NoCommands] - the command table is empty
    /// * [ScsiError::TableFull] - every slot is taken
    /// * [ScsiError::MediaRejected] - a session is running and the unit refused it
    pub fn register(&mut self, mut media: M) -> Result<u8, ScsiError> {
        if self.commands.is_empty() {
            return Err(ScsiError::NoCommands);
        }
        let Some(lun) = self.slots.iter().position(Option::is_none) else {
            return Err(ScsiError::TableFull);
        };
        if self.connected && media.connect().is_err() {
            return Err(ScsiError::MediaRejected);
        }

        info!("usb: scsi: Register LUN {}", lun);
        self.slots[lun] = Some(media);
        Ok(lun as u8)
    }

    /// Unbinds the unit at `lun` and hands it back
    pub fn deregister(&mut self, lun: u8) -> Result<M, ScsiError> {
        let index = lun as usize;
        let mut media = self
            .slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or(ScsiError::InvalidLun)?;

        info!("usb: scsi: Deregister LUN {}", lun);
        if self.current == Some(index) {
            self.current = None;
        }
        if self.connected {
            media.disconnect();
        }
        Ok(media)
    }

    pub fn media(&self, lun: u8) -> Option<&M> {
        self.slots.get(lun as usize).and_then(Option::as_ref)
    }

    pub fn media_mut(&mut self, lun: u8) -> Option<&mut M> {
        self.slots.get_mut(lun as usize).and_then(Option::as_mut)
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Routes a CDB to the unit at `lun`
    pub fn dispatch(&mut self, lun: u8, cdb: &[u8], buf: &mut [u8]) -> DataPhase {
        let Some(&opcode) = cdb.first() else {
            return DataPhase::none(Status::Stall);
        };
        let lun = lun as usize;

        let Some(media) = self.slots.get_mut(lun).and_then(Option::as_mut) else {
            warn!("usb: scsi: No media at LUN {}", lun);
            self.current = None;
            return DataPhase::none(Status::Stall);
        };
        self.current = Some(lun);

        match self.commands.iter().find(|desc| desc.opcode == opcode) {
            Some(desc) => {
                let reply = (desc.handler)(media, cdb, buf);
                debug!(
                    "usb: scsi: LUN {} opcode {=u8:#x}: {}, len {}",
                    lun,
                    opcode,
                    reply.status,
                    reply.len
                );
                DataPhase {
                    status: reply.status,
                    direction: desc.direction,
                    len: reply.len,
                }
            }
            None => {
                debug!("usb: scsi: LUN {} unknown opcode {=u8:#x}", lun, opcode);
                DataPhase::none(media.unknown_command(cdb))
            }
        }
    }
}

impl<M: LogicalUnit, const N: usize> CommandHandler for ScsiContainer<'_, M, N> {
    fn new_command(&mut self, cb: &CommandBlock<'_>, buf: &mut [u8]) -> DataPhase {
        self.dispatch(cb.lun, cb.bytes, buf)
    }

    fn transfer_done(&mut self, buf: &mut [u8], len: usize) -> Reply {
        match self
            .current
            .and_then(|lun| self.slots.get_mut(lun))
            .and_then(Option::as_mut)
        {
            Some(media) => media.transfer_done(buf, len),
            None => Reply {
                status: Status::Failed,
                len: 0,
            },
        }
    }

    fn connect(&mut self) -> Result<(), Rejected> {
        self.connected = true;
        for (lun, slot) in self.slots.iter_mut().enumerate() {
            if slot.as_mut().is_some_and(|unit| unit.connect().is_err()) {
                warn!("usb: scsi: LUN {} refused the session, dropped", lun);
                *slot = None;
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.current = None;
        for media in self.slots.iter_mut().flatten() {
            media.disconnect();
        }
    }

    fn reset(&mut self) {
        self.current = None;
        for media in self.slots.iter_mut().flatten() {
            media.reset();
        }
    }

    fn max_lun(&self) -> Option<u8> {
        self.slots
            .iter()
            .rposition(Option::is_some)
            .map(|lun| lun as u8)
    }
}
