//! Capture devices: where frames enter and leave the process.
//!
//! This module provides a raw packet socket device for Linux and an
//! in-memory device pair for simulators and tests. Both move whole
//! Ethernet frames as bytes.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::ethernet::MacAddress;

/// Largest frame a device reads at once.
pub const MAX_FRAME_SIZE: usize = 65536;

/// A source and sink of link-layer frames.
pub trait CaptureDevice: Send + Sync {
    /// Name of the underlying interface.
    fn name(&self) -> &str;

    /// Hardware address of the device, when it has one.
    fn mac_address(&self) -> Option<MacAddress> {
        None
    }

    /// Waits up to `timeout` for one frame.
    ///
    /// # Returns
    /// * `Ok(Some(bytes))` - A received frame
    /// * `Ok(None)` - If the timeout elapsed
    /// * `Err(io::Error)` - If the device failed or was closed
    fn receive(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;

    /// Transmits one frame.
    ///
    /// # Returns
    /// * `Ok(usize)` - The number of bytes sent
    /// * `Err(io::Error)` - If sending fails
    fn send(&self, bytes: &[u8]) -> io::Result<usize>;

    /// Closes the device. Pending and later calls fail.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device is closed")
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<Vec<u8>>,
    closed: bool,
}

#[derive(Debug, Default)]
struct FrameQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl FrameQueue {
    fn push(&self, frame: Vec<u8>) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed_error());
        }
        state.frames.push_back(frame);
        self.ready.notify_one();
        Ok(())
    }

    fn pop(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        if state.frames.is_empty() && !state.closed {
            self.ready.wait_for(&mut state, timeout);
        }
        match state.frames.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None if state.closed => Err(closed_error()),
            None => Ok(None),
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// One end of an in-process link.
///
/// Frames sent on one device of a [`pair`](MemoryDevice::pair) are received
/// by the other.
#[derive(Debug)]
pub struct MemoryDevice {
    name: String,
    mac: MacAddress,
    inbox: Arc<FrameQueue>,
    peer: Arc<FrameQueue>,
}

impl MemoryDevice {
    /// Creates two connected devices with random locally administered MACs.
    pub fn pair(first: impl Into<String>, second: impl Into<String>) -> (MemoryDevice, MemoryDevice) {
        let a = Arc::new(FrameQueue::default());
        let b = Arc::new(FrameQueue::default());
        (
            MemoryDevice {
                name: first.into(),
                mac: random_mac(),
                inbox: a.clone(),
                peer: b.clone(),
            },
            MemoryDevice {
                name: second.into(),
                mac: random_mac(),
                inbox: b,
                peer: a,
            },
        )
    }

    pub fn with_mac(mut self, mac: MacAddress) -> Self {
        self.mac = mac;
        self
    }

    /// Queues `bytes` as if they had arrived on the link.
    pub fn inject(&self, bytes: &[u8]) -> io::Result<()> {
        self.inbox.push(bytes.to_vec())
    }
}

impl CaptureDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mac_address(&self) -> Option<MacAddress> {
        Some(self.mac)
    }

    fn receive(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        self.inbox.pop(timeout)
    }

    fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        if self.inbox.is_closed() {
            return Err(closed_error());
        }
        self.peer.push(bytes.to_vec())?;
        Ok(bytes.len())
    }

    fn close(&self) {
        self.inbox.close();
    }

    fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

/// A random unicast, locally administered MAC address.
pub fn random_mac() -> MacAddress {
    let mut octets: [u8; 6] = rand::random();
    octets[0] = (octets[0] & 0xfe) | 0x02;
    MacAddress::new(octets)
}

#[cfg(target_os = "linux")]
pub use raw::RawSocketDevice;

#[cfg(target_os = "linux")]
mod raw {
    use std::ffi::CString;
    use std::io::{self, ErrorKind, Read};
    use std::net::Shutdown;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use socket2::{Domain, Protocol, SockAddr, Socket, Type};
    use tracing::debug;

    use super::{CaptureDevice, MAX_FRAME_SIZE, closed_error};
    use crate::ethernet::MacAddress;

    /// Every EtherType, in network byte order as the kernel expects.
    fn all_protocols() -> u16 {
        (libc::ETH_P_ALL as u16).to_be()
    }

    fn interface_index(name: &str) -> io::Result<u32> {
        let name = CString::new(name).map_err(|_| io::Error::new(ErrorKind::InvalidInput, "interface name contains NUL"))?;
        // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
        let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if index == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(index)
    }

    fn link_layer_address(index: u32) -> io::Result<SockAddr> {
        // SAFETY: the storage handed out by `try_init` is zeroed and large
        // enough for a `sockaddr_ll`; we report exactly that length.
        let ((), address) = unsafe {
            SockAddr::try_init(|storage, length| {
                let address = storage.cast::<libc::sockaddr_ll>();
                (*address).sll_family = libc::AF_PACKET as libc::c_ushort;
                (*address).sll_protocol = all_protocols();
                (*address).sll_ifindex = index as libc::c_int;
                *length = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
                Ok(())
            })
        }?;
        Ok(address)
    }

    fn read_mac(name: &str) -> Option<MacAddress> {
        std::fs::read_to_string(format!("/sys/class/net/{}/address", name))
            .ok()
            .and_then(|text| text.trim().parse().ok())
    }

    /// A Linux `AF_PACKET` raw socket bound to one interface.
    ///
    /// Opening requires `CAP_NET_RAW`.
    #[derive(Debug)]
    pub struct RawSocketDevice {
        name: String,
        socket: Socket,
        mac: Option<MacAddress>,
        closed: AtomicBool,
    }

    impl RawSocketDevice {
        /// Opens a raw socket on the interface called `name`.
        ///
        /// # Arguments
        /// * `name` - The interface name, e.g. `eth0`
        ///
        /// # Returns
        /// * `Ok(RawSocketDevice)` - The bound device
        /// * `Err(io::Error)` - If the interface does not exist or permissions are missing
        pub fn open(name: &str) -> io::Result<Self> {
            let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(i32::from(all_protocols()))))?;
            socket.bind(&link_layer_address(interface_index(name)?)?)?;
            debug!(device = %name, "Raw socket opened");
            Ok(Self {
                name: name.to_string(),
                socket,
                mac: read_mac(name),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl CaptureDevice for RawSocketDevice {
        fn name(&self) -> &str {
            &self.name
        }

        fn mac_address(&self) -> Option<MacAddress> {
            self.mac
        }

        fn receive(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
            if self.is_closed() {
                return Err(closed_error());
            }
            // a zero timeout would block forever
            self.socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
            let mut buffer = vec![0u8; MAX_FRAME_SIZE];
            match (&self.socket).read(&mut buffer) {
                Ok(n) => {
                    buffer.truncate(n);
                    Ok(Some(buffer))
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
                Err(e) => Err(e),
            }
        }

        fn send(&self, bytes: &[u8]) -> io::Result<usize> {
            if self.is_closed() {
                return Err(closed_error());
            }
            self.socket.send(bytes)
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                // packet sockets may not support shutdown; the flag is what readers check
                let _ = self.socket.shutdown(Shutdown::Both);
                debug!(device = %self.name, "Raw socket closed");
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}
