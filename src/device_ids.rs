use std::fmt::Display;

/// The only device we know how to talk to.
pub const EMS_CART: UsbId = UsbId {
    vid: 0x4670,
    pid: 0x9394,
};

/// Interface carrying the command protocol.
pub const INTERFACE: u8 = 0;

/// Bulk OUT endpoint for command frames and write payloads.
pub const SEND_ENDPOINT: u8 = 0x02;

/// Bulk IN endpoint for read data.
pub const RECEIVE_ENDPOINT: u8 = 0x81;

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

impl From<&rusb::DeviceDescriptor> for UsbId {
    fn from(desc: &rusb::DeviceDescriptor) -> Self {
        UsbId {
            vid: desc.vendor_id(),
            pid: desc.product_id(),
        }
    }
}

/// Whether a device with the given ID is an EMS cart.
pub fn is_ems_cart(id: UsbId) -> bool {
    id == EMS_CART
}
