/// USB IDs, interface and endpoint numbers of the EMS cart.
pub mod device_ids;

/// Build command frames and read or write the cart's ROM and SRAM over a ready session.
pub mod protocol;

/// Find, claim and own the connection to an attached cart.
pub mod session;

/// The USB primitives a session is built on, with a libusb-backed implementation.
pub mod transport;
