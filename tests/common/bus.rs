use crate::common::{Csw, CSW_LEN, IN_EP, OUT_EP};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use usb_device::bus::{PollResult, UsbBus};
use usb_device::class_prelude::{EndpointAddress, EndpointType};
use usb_device::{UsbDirection, UsbError};

/// One side of a bulk pipe, packets queued in bus order
pub struct DummyEp {
    addr: EndpointAddress,
    max_packet_size: u16,
    stalled: bool,
    packets: VecDeque<Vec<u8>>,
}

impl DummyEp {
    fn new(addr: EndpointAddress, max_packet_size: u16) -> Self {
        Self {
            addr,
            max_packet_size,
            stalled: false,
            packets: VecDeque::new(),
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks(self.max_packet_size as usize) {
            self.packets.push_back(chunk.to_vec());
        }
    }
}

/// Test bus with one bulk IN and one bulk OUT endpoint
#[derive(Clone)]
pub struct DummyUsbBus {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    enabled: bool,
    ep_in: Option<DummyEp>,
    ep_out: Option<DummyEp>,
}

impl DummyUsbBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                enabled: false,
                ep_in: None,
                ep_out: None,
            })),
        }
    }

    /// Host side OUT transfer, split into packets
    pub fn write_data(&self, data: &[u8]) {
        let mut lock = self.inner.lock().unwrap();
        lock.ep_out.as_mut().unwrap().push_bytes(data);
    }

    pub fn write_cbw(&self, cbw: crate::common::Cbw) {
        self.write_data(&cbw.into_bytes());
    }

    /// Host side read of a single IN packet
    pub fn read_packet(&self) -> Option<Vec<u8>> {
        let mut lock = self.inner.lock().unwrap();
        lock.ep_in.as_mut().unwrap().packets.pop_front()
    }

    /// Reads IN packets until `n` bytes arrived or nothing is left
    pub fn read_bytes(&self, n: usize) -> Vec<u8> {
        let mut bytes = vec![];
        while bytes.len() < n {
            match self.read_packet() {
                Some(mut packet) => bytes.append(&mut packet),
                None => break,
            }
        }
        bytes
    }

    pub fn read_csw(&self) -> Option<Csw> {
        let bytes = self.read_bytes(CSW_LEN);
        if bytes.is_empty() {
            return None;
        }
        Some(Csw::from_bytes(&bytes))
    }

    /// Number of IN packets the host has not read yet
    pub fn pending_in(&self) -> usize {
        let lock = self.inner.lock().unwrap();
        lock.ep_in.as_ref().map_or(0, |ep| ep.packets.len())
    }

    /// Number of OUT packets the device has not read yet
    pub fn pending_out(&self) -> usize {
        let lock = self.inner.lock().unwrap();
        lock.ep_out.as_ref().map_or(0, |ep| ep.packets.len())
    }

    pub fn stalled(&self, addr: u8) -> bool {
        self.is_stalled(EndpointAddress::from(addr))
    }

    /// Clears the halt the way the device does for CLEAR_FEATURE
    pub fn clear_halt(&self, addr: u8) {
        self.set_stalled(EndpointAddress::from(addr), false);
    }
}

impl UsbBus for DummyUsbBus {
    fn alloc_ep(
        &mut self,
        ep_dir: UsbDirection,
        _ep_addr: Option<EndpointAddress>,
        ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> usb_device::Result<EndpointAddress> {
        assert!(!self.inner.lock().unwrap().enabled);

        if matches!(ep_type, EndpointType::Control) {
            return Ok(EndpointAddress::from(0u8));
        }

        let mut lock = self.inner.lock().unwrap();
        let addr = match ep_dir {
            UsbDirection::Out => {
                let addr = EndpointAddress::from(OUT_EP);
                lock.ep_out.replace(DummyEp::new(addr, max_packet_size));
                addr
            }
            UsbDirection::In => {
                let addr = EndpointAddress::from(IN_EP);
                lock.ep_in.replace(DummyEp::new(addr, max_packet_size));
                addr
            }
        };

        Ok(addr)
    }

    fn enable(&mut self) {
        self.inner.lock().unwrap().enabled = true;
    }

    fn reset(&self) {}

    fn set_device_address(&self, _addr: u8) {}

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> usb_device::Result<usize> {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep_in.as_mut().unwrap();

        if ep.addr != ep_addr {
            return Err(UsbError::InvalidEndpoint);
        }
        if buf.len() > ep.max_packet_size as usize {
            return Err(UsbError::BufferOverflow);
        }

        ep.packets.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> usb_device::Result<usize> {
        let mut lock = self.inner.lock().unwrap();
        let ep = lock.ep_out.as_mut().unwrap();

        if ep.addr != ep_addr {
            return Err(UsbError::InvalidEndpoint);
        }

        let Some(len) = ep.packets.front().map(Vec::len) else {
            return Err(UsbError::WouldBlock);
        };
        if len > buf.len() {
            return Err(UsbError::BufferOverflow);
        }

        let packet = ep.packets.pop_front().unwrap();
        buf[..len].copy_from_slice(&packet);
        Ok(len)
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        let mut lock = self.inner.lock().unwrap();
        let inner = &mut *lock;
        for ep in [inner.ep_in.as_mut(), inner.ep_out.as_mut()].into_iter().flatten() {
            if ep.addr == ep_addr {
                ep.stalled = stalled;
            }
        }
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        let lock = self.inner.lock().unwrap();
        let stalled = [lock.ep_in.as_ref(), lock.ep_out.as_ref()]
            .into_iter()
            .flatten()
            .any(|ep| ep.addr == ep_addr && ep.stalled);
        stalled
    }

    fn suspend(&self) {}

    fn resume(&self) {}

    fn poll(&self) -> PollResult {
        PollResult::None
    }
}
