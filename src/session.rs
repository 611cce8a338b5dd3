use crate::device_ids::{self, INTERFACE, RECEIVE_ENDPOINT, SEND_ENDPOINT};
use crate::protocol;
use crate::transport::{Location, Transport, UsbTransport};
use log::{debug, info, warn};
use std::time::Duration;
use thiserror::Error;

/// Upper bound on any single bulk transfer unless changed with [Session::set_timeout].
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives best-effort status updates from a [Session]. Nothing a session does depends on what
/// these return or how long they take.
pub trait Notify {
    /// A failure worth showing to a human. The same failure is also returned to the caller.
    fn error(&mut self, _message: &str) {}

    /// Readiness flipped. Fired once per transition.
    fn ready_changed(&mut self, _ready: bool) {}
}

impl Notify for () {}

/// Exclusive connection to one cart. A session is ready when it holds an open handle and has
/// claimed the command interface; reads and writes are refused otherwise.
pub struct Session<T: Transport, N: Notify = ()> {
    handle: Option<T::Handle>,
    claimed: bool,
    timeout: Duration,
    notify: N,
    // Must stay below `handle` so the subsystem outlives it during drop.
    transport: T,
}

/// Where every attached cart sits on the bus, without opening any of them. Devices whose
/// descriptor can't be read are logged and skipped.
pub fn list_carts<T: Transport>(transport: &T) -> Result<Vec<Location>, Error> {
    let devices = transport.devices().map_err(Error::Enumeration)?;

    let mut carts = Vec::new();
    for device in &devices {
        let location = transport.location(device);
        match transport.id(device) {
            Ok(id) if device_ids::is_ems_cart(id) => carts.push(location),
            Ok(_) => {}
            Err(e) => warn!("Skipping device at {location}: {e}"),
        }
    }

    Ok(carts)
}

impl<N: Notify> Session<UsbTransport, N> {
    /// Start a libusb context and wrap it in an idle session.
    pub fn initialize(mut notify: N) -> Result<Self, Error> {
        match UsbTransport::new() {
            Ok(transport) => Ok(Session::with_notify(transport, notify)),
            Err(e) => {
                let err = Error::TransportInit(e);
                warn!("{err}");
                notify.error(&err.to_string());
                Err(err)
            }
        }
    }
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Session::with_notify(transport, ())
    }
}

impl<T: Transport, N: Notify> Session<T, N> {
    pub fn with_notify(transport: T, notify: N) -> Self {
        Session {
            handle: None,
            claimed: false,
            timeout: DEFAULT_TIMEOUT,
            notify,
            transport,
        }
    }

    pub fn ready(&self) -> bool {
        self.handle.is_some() && self.claimed
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn notify(&self) -> &N {
        &self.notify
    }

    /// Make sure we hold a claimed cart. An already ready session is revalidated by releasing and
    /// re-claiming its interface; only if that fails is the bus scanned again. The first attached
    /// device with the cart's USB ID is opened, and no other is tried if that fails.
    pub fn find_device(&mut self) -> Result<(), Error> {
        if self.ready() {
            match self.reclaim() {
                Ok(()) => {
                    debug!("Re-claimed interface {INTERFACE}; session still ready");
                    return Ok(());
                }
                Err(e) => {
                    warn!("Failed to re-claim interface {INTERFACE}: {e}; rescanning bus");
                    self.claimed = false;
                    self.handle = None;
                    self.notify.ready_changed(false);
                }
            }
        }

        let result = self.discover();
        if let Err(ref e) = result {
            self.report(e);
        }
        result
    }

    fn reclaim(&mut self) -> rusb::Result<()> {
        let handle = self.handle.as_mut().ok_or(rusb::Error::NoDevice)?;
        // Only the outcome of the claim matters here.
        let _ = self.transport.release_interface(handle, INTERFACE);
        self.transport.claim_interface(handle, INTERFACE)
    }

    fn discover(&mut self) -> Result<(), Error> {
        // Left over from an earlier claim failure, if anything.
        self.handle = None;
        self.claimed = false;

        let devices = self.transport.devices().map_err(Error::Enumeration)?;

        let mut found = None;
        for (index, device) in devices.iter().enumerate() {
            match self.transport.id(device) {
                Ok(id) if device_ids::is_ems_cart(id) => {
                    info!("Found cart {id} at enumeration index {index}");
                    found = Some(device);
                    break;
                }
                Ok(id) => debug!("Skipping device {id}"),
                Err(e) => self.report(&Error::DescriptorRead(e)),
            }
        }

        let device = found.ok_or(Error::DeviceNotFound)?;
        let mut handle = self.transport.open(device).map_err(|e| match e {
            rusb::Error::Access => Error::Permission(e),
            rusb::Error::NotSupported => Error::DriverMissing(e),
            _ => Error::Open(e),
        })?;

        let claim = self.transport.claim_interface(&mut handle, INTERFACE);
        self.handle = Some(handle);
        claim.map_err(Error::InterfaceClaim)?;

        self.claimed = true;
        info!("Claimed interface {INTERFACE}; cart ready");
        self.notify.ready_changed(true);
        Ok(())
    }

    /// Send `data` on the command endpoint. Anything short of the whole buffer is an error.
    pub(crate) fn write_bulk(
        &mut self,
        data: &[u8],
        action: &'static str,
    ) -> Result<(), protocol::Error> {
        let handle = self.ready_handle()?;
        let written = self
            .transport
            .write_bulk(handle, SEND_ENDPOINT, data, self.timeout)
            .map_err(|e| protocol::Error::transfer(e, action))?;
        protocol::ensure_complete(data.len(), written)
    }

    /// Fill `buf` from the data endpoint. Anything short of the whole buffer is an error.
    pub(crate) fn read_bulk(
        &mut self,
        buf: &mut [u8],
        action: &'static str,
    ) -> Result<(), protocol::Error> {
        let handle = self.ready_handle()?;
        let read = self
            .transport
            .read_bulk(handle, RECEIVE_ENDPOINT, buf, self.timeout)
            .map_err(|e| protocol::Error::transfer(e, action))?;
        protocol::ensure_complete(buf.len(), read)
    }

    fn ready_handle(&self) -> Result<&T::Handle, protocol::Error> {
        match self.handle {
            Some(ref handle) if self.claimed => Ok(handle),
            _ => Err(protocol::Error::NotReady),
        }
    }

    /// Log a failure and pass it on to the observer, causes included.
    pub(crate) fn report(&mut self, err: &dyn std::error::Error) {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        warn!("{message}");
        self.notify.error(&message);
    }
}

impl<T: Transport, N: Notify> Drop for Session<T, N> {
    fn drop(&mut self) {
        if self.claimed {
            if let Some(handle) = self.handle.as_mut() {
                if let Err(e) = self.transport.release_interface(handle, INTERFACE) {
                    warn!("Failed to release interface {INTERFACE}: {e}");
                }
            }
            self.claimed = false;
        }

        if self.handle.take().is_some() {
            debug!("Closed cart handle");
        }
    }
}

/// Failures while bringing up the subsystem or finding and claiming a cart. None of them are
/// fatal; [Session::find_device] can simply be called again.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to initialize libusb")]
    TransportInit(#[source] rusb::Error),

    #[error("failed to list USB devices")]
    Enumeration(#[source] rusb::Error),

    #[error("failed to read USB device descriptor")]
    DescriptorRead(#[source] rusb::Error),

    #[error("could not find cart ({id}); is it plugged in?", id = device_ids::EMS_CART)]
    DeviceNotFound,

    #[error("cart access denied; are the udev rules installed?")]
    Permission(#[source] rusb::Error),

    #[error("cart not supported by the OS; is the driver installed?")]
    DriverMissing(#[source] rusb::Error),

    #[error("failed to open cart")]
    Open(#[source] rusb::Error),

    #[error("failed to claim interface {iface}", iface = INTERFACE)]
    InterfaceClaim(#[source] rusb::Error),
}
