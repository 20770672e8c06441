mod common;

use crate::common::bus::DummyUsbBus;
use crate::common::disk::{RamDisk, BLOCK_SIZE};
use crate::common::*;
use usb_device::bus::UsbBusAllocator;
use usb_device::class::UsbClass;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::device::{UsbDeviceBuilder, UsbVidPid};
use usb_device::UsbDirection;
use usbd_bulk_only::class::MassStorageClass;
use usbd_bulk_only::subclass::container::ScsiContainer;
use usbd_bulk_only::subclass::disk::ScsiDisk;
use usbd_bulk_only::subclass::scsi::{INQUIRY, READ_10, TEST_UNIT_READY, WRITE_10};
use usbd_bulk_only::transport::bbb::{
    BulkOnlyError, Dispatch, Faults, CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET,
};
use usbd_bulk_only::transport::pipe::BusEvent;
use usbd_bulk_only::transport::{CommandStatus, TransportError};

type Disk = ScsiDisk<RamDisk>;
type Container = ScsiContainer<'static, Disk, 1>;
type Class<'a> = MassStorageClass<'a, DummyUsbBus, Container, [u8; 512], 1024>;

fn container(blocks: u32) -> Container {
    let mut container = ScsiContainer::new(Disk::COMMANDS);
    assert_eq!(Ok(0), container.register(ScsiDisk::new(RamDisk::new(blocks))));
    container
}

fn class(alloc: &UsbBusAllocator<DummyUsbBus>, dispatch: Dispatch) -> Class<'_> {
    let class = MassStorageClass::new(alloc, 64, container(8), [0u8; 512], 0, dispatch)
        .expect("class");
    let _ = UsbDeviceBuilder::new(alloc, UsbVidPid(0xabcd, 0xabcd)).build();
    class
}

fn rw10(opcode: u8, lba: u32, blocks: u16) -> [u8; 10] {
    let mut cb = [0u8; 10];
    cb[0] = opcode;
    cb[2..6].copy_from_slice(&lba.to_be_bytes());
    cb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cb
}

fn passed(tag: u32) -> Csw {
    Csw {
        tag,
        data_residue: 0,
        status: CommandStatus::Passed,
    }
}

#[test]
fn staging_must_fit_the_io_buffer() {
    let alloc = UsbBusAllocator::new(DummyUsbBus::new());
    let class = MassStorageClass::<_, _, _, 256>::new(
        &alloc,
        64,
        container(8),
        [0u8; 512],
        0,
        Dispatch::Direct,
    );
    assert_eq!(
        Some(TransportError::Error(BulkOnlyError::BufferTooSmall)),
        class.err()
    );
}

#[test]
fn class_arms_a_cbw_on_creation() {
    let bus = DummyUsbBus::new();
    let alloc = UsbBusAllocator::new(bus.clone());
    let class = class(&alloc, Dispatch::Direct);

    assert!(class.transport().is_connected());
    assert!(class.transport().handler().is_connected());
    assert_eq!(0, bus.pending_in());
}

#[test]
fn inquiry_over_the_bus() {
    let bus = DummyUsbBus::new();
    let alloc = UsbBusAllocator::new(bus.clone());
    let mut class = class(&alloc, Dispatch::Direct);

    bus.write_cbw(Cbw::new(1, 36, DataDirection::In, &[INQUIRY, 0, 0, 0, 36, 0]));
    class.poll();

    assert_eq!(0, bus.pending_out());
    let data = bus.read_bytes(36);
    assert_eq!(36, data.len());
    assert_eq!(0x80, data[1]);
    assert_eq!(b"usbd    ", &data[8..16]);
    assert_eq!(Some(passed(1)), bus.read_csw());
    assert_eq!(None, bus.read_csw());
}

#[test]
fn read_streams_packets_across_chunks() {
    let bus = DummyUsbBus::new();
    let alloc = UsbBusAllocator::new(bus.clone());
    let mut class = class(&alloc, Dispatch::Direct);

    bus.write_cbw(Cbw::new(
        7,
        3 * BLOCK_SIZE,
        DataDirection::In,
        &rw10(READ_10, 4, 3),
    ));
    class.poll();

    // 64 byte packets, three blocks and the CSW
    assert_eq!(3 * 8 + 1, bus.pending_in());
    let data = bus.read_bytes(3 * BLOCK_SIZE as usize);
    for (i, block) in data.chunks(BLOCK_SIZE as usize).enumerate() {
        assert!(block.iter().all(|b| *b == 4 + i as u8));
    }
    assert_eq!(Some(passed(7)), bus.read_csw());
}

#[test]
fn write_lands_on_the_disk() {
    let bus = DummyUsbBus::new();
    let alloc = UsbBusAllocator::new(bus.clone());
    let mut class = class(&alloc, Dispatch::Direct);

    let payload: Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    bus.write_cbw(Cbw::new(
        2,
        2 * BLOCK_SIZE,
        DataDirection::Out,
        &rw10(WRITE_10, 1, 2),
    ));
    bus.write_data(&payload);
    class.poll();

    assert_eq!(0, bus.pending_out());
    assert_eq!(Some(passed(2)), bus.read_csw());

    let device = class
        .transport()
        .handler()
        .media(0)
        .expect("LUN 0")
        .device();
    assert_eq!(&payload[..512], device.block(1));
    assert_eq!(&payload[512..], device.block(2));
    assert!(device.block(3).iter().all(|b| *b == 3));
}

#[test]
fn data_arriving_later_is_picked_up_by_the_next_poll() {
    let bus = DummyUsbBus::new();
    let alloc = UsbBusAllocator::new(bus.clone());
    let mut class = class(&alloc, Dispatch::Direct);

    bus.write_cbw(Cbw::new(
        3,
        BLOCK_SIZE,
        DataDirection::Out,
        &rw10(WRITE_10, 0, 1),
    ));
    class.poll();
    assert_eq!(None, bus.read_csw());

    bus.write_data(&[0xEE; 256]);
    class.poll();
    assert_eq!(None, bus.read_csw());

    bus.write_data(&[0xEE; 256]);
    class.endpoint_out(ep(OUT_EP));
    assert_eq!(Some(passed(3)), bus.read_csw());

    let device = class.transport().handler().media(0).expect("LUN 0").device();
    assert!(device.block(0).iter().all(|b| *b == 0xEE));
}

#[test]
fn failed_command_halts_in_until_cleared() {
    let bus = DummyUsbBus::new();
    let alloc = UsbBusAllocator::new(bus.clone());
    let mut class = class(&alloc, Dispatch::Direct);

    bus.write_cbw(Cbw::new(
        5,
        BLOCK_SIZE,
        DataDirection::In,
        &rw10(READ_10, 8, 1),
    ));
    class.poll();

    assert!(bus.stalled(IN_EP));
    assert!(!bus.stalled(OUT_EP));
    assert_eq!(None, bus.read_csw());
    assert_eq!(Faults::CMD_FAILED, class.transport().faults());

    // the device clears the halt, then the class runs the recovery
    bus.clear_halt(IN_EP);
    let transport = class.transport_mut();
    transport.pipes_mut().halt_cleared(ep(IN_EP));
    transport.notify(BusEvent::ClearHalt(ep(IN_EP))).unwrap();
    class.poll();

    assert_eq!(
        Some(Csw {
            tag: 5,
            data_residue: BLOCK_SIZE,
            status: CommandStatus::Failed,
        }),
        bus.read_csw()
    );
    assert_eq!(Faults::empty(), class.transport().faults());
}

#[test]
fn reset_recovery_after_invalid_cbw() {
    let bus = DummyUsbBus::new();
    let alloc = UsbBusAllocator::new(bus.clone());
    let mut class = class(&alloc, Dispatch::Direct);

    bus.write_data(&[0u8; 31]);
    class.poll();
    assert!(bus.stalled(IN_EP));
    assert!(bus.stalled(OUT_EP));
    assert_eq!(None, bus.read_csw());

    let reset = Request {
        direction: UsbDirection::Out,
        request_type: RequestType::Class,
        recipient: Recipient::Interface,
        request: CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET,
        value: 0,
        index: INTERFACE as u16,
        length: 0,
    };
    class.transport_mut().bulk_only_reset(&reset).unwrap();
    assert!(!bus.stalled(IN_EP));
    assert!(!bus.stalled(OUT_EP));

    bus.write_cbw(Cbw::new(
        6,
        0,
        DataDirection::NotExpected,
        &[TEST_UNIT_READY, 0, 0, 0, 0, 0],
    ));
    class.poll();
    assert_eq!(Some(passed(6)), bus.read_csw());
}

#[test]
fn bus_reset_starts_a_new_session() {
    let bus = DummyUsbBus::new();
    let alloc = UsbBusAllocator::new(bus.clone());
    let mut class = class(&alloc, Dispatch::Direct);

    bus.write_data(&[0u8; 31]);
    class.poll();
    assert_eq!(Faults::INVALID_CBW, class.transport().faults());

    UsbClass::reset(&mut class);
    assert!(class.transport().is_connected());
    assert_eq!(Faults::empty(), class.transport().faults());

    bus.write_cbw(Cbw::new(
        8,
        0,
        DataDirection::NotExpected,
        &[TEST_UNIT_READY, 0, 0, 0, 0, 0],
    ));
    class.poll();
    assert_eq!(Some(passed(8)), bus.read_csw());
}

#[test]
fn deferred_class_waits_for_the_worker() {
    let bus = DummyUsbBus::new();
    let alloc = UsbBusAllocator::new(bus.clone());
    let mut class = class(&alloc, Dispatch::Deferred);

    bus.write_cbw(Cbw::new(9, 36, DataDirection::In, &[INQUIRY, 0, 0, 0, 36, 0]));
    class.poll();
    assert_eq!(0, bus.pending_out());
    assert_eq!(0, bus.pending_in());

    class.run_pending().unwrap();
    assert_eq!(36, bus.read_bytes(36).len());
    assert_eq!(None, bus.read_csw());

    class.run_pending().unwrap();
    assert_eq!(Some(passed(9)), bus.read_csw());
}
