use crate::device_ids::UsbId;
use rusb::UsbContext;
use std::fmt::Display;
use std::time::Duration;

/// Where a device sits on the bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub bus: u8,
    pub address: u8,
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "bus {:03} address {:03}", self.bus, self.address)
    }
}

/// The USB primitives a [Session](crate::session::Session) needs. Closing a handle is dropping it,
/// and shutting the subsystem down is dropping the transport itself.
pub trait Transport {
    type Device;
    type Handle;

    /// Snapshot of every attached device. The underlying enumeration list is released before this
    /// returns.
    fn devices(&self) -> rusb::Result<Vec<Self::Device>>;

    fn id(&self, device: &Self::Device) -> rusb::Result<UsbId>;

    fn location(&self, device: &Self::Device) -> Location;

    fn open(&self, device: &Self::Device) -> rusb::Result<Self::Handle>;

    fn claim_interface(&self, handle: &mut Self::Handle, iface: u8) -> rusb::Result<()>;

    fn release_interface(&self, handle: &mut Self::Handle, iface: u8) -> rusb::Result<()>;

    fn write_bulk(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn read_bulk(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
}

/// [Transport] backed by a dedicated libusb context.
pub struct UsbTransport {
    context: rusb::Context,
}

impl UsbTransport {
    pub fn new() -> rusb::Result<Self> {
        Ok(UsbTransport {
            context: rusb::Context::new()?,
        })
    }
}

impl Transport for UsbTransport {
    type Device = rusb::Device<rusb::Context>;
    type Handle = rusb::DeviceHandle<rusb::Context>;

    fn devices(&self) -> rusb::Result<Vec<Self::Device>> {
        Ok(self.context.devices()?.iter().collect())
    }

    fn id(&self, device: &Self::Device) -> rusb::Result<UsbId> {
        Ok((&device.device_descriptor()?).into())
    }

    fn location(&self, device: &Self::Device) -> Location {
        Location {
            bus: device.bus_number(),
            address: device.address(),
        }
    }

    fn open(&self, device: &Self::Device) -> rusb::Result<Self::Handle> {
        device.open()
    }

    fn claim_interface(&self, handle: &mut Self::Handle, iface: u8) -> rusb::Result<()> {
        handle.claim_interface(iface)
    }

    fn release_interface(&self, handle: &mut Self::Handle, iface: u8) -> rusb::Result<()> {
        handle.release_interface(iface)
    }

    fn write_bulk(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        handle.write_bulk(endpoint, data, timeout)
    }

    fn read_bulk(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        handle.read_bulk(endpoint, buf, timeout)
    }
}
