//! USB Mass Storage Bulk-Only Transport function engine for [usb-device]
//!
//! The engine is completion driven: a pipe layer reports finished transfers
//! and the [Bulk Only] state machine reacts to them by submitting the next
//! transfer, stalling, or sending a status. Commands are handed to a
//! [CommandHandler], usually the [SCSI media container].
//!
//! # Transports:
//! * [Bulk Only]
//!
//! # Subclasses:
//! * [SCSI] - SCSI transparent command set with a LUN container and a disk media driver
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `bbb` | Include Bulk Only Transport           |
//! | `scsi` | Include SCSI subclass and the [usb-device] class adapter |
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//!
//! [usb-device]: https://crates.io/crates/usb-device
//! [SCSI]: crate::subclass::scsi
//! [SCSI media container]: crate::subclass::container::ScsiContainer
//! [Bulk Only]: crate::transport::bbb
//! [CommandHandler]: crate::subclass::CommandHandler

#![no_std]

#[macro_use]
pub(crate) mod fmt;

#[cfg(all(feature = "bbb", feature = "scsi"))]
pub mod class;
#[cfg(all(feature = "bbb", feature = "scsi"))]
pub(crate) mod staging;
pub mod subclass;
pub mod transport;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;
