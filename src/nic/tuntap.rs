// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use crate::runtime::fail::Fail;
use ::libc;
use ::std::os::unix::io::RawFd;

//==============================================================================
// Constants
//==============================================================================

static TUN_PATH: &[u8] = b"/dev/net/tun\0";

// ioctl request to attach a queue to a TUN/TAP interface.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

// Interface flags: TAP mode (Ethernet frames), no packet-info prefix.
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

//==============================================================================
// Structures
//==============================================================================

#[repr(C)]
struct IfReq {
    ifr_name: [u8; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _padding: [u8; 22],
}

/// A TAP interface: whole Ethernet frames in, whole Ethernet frames out.
///
/// The descriptor is non-blocking; the event loop polls it for readiness and
/// `recv`/`send` report `EWOULDBLOCK` when the device has nothing for us.
#[derive(Debug)]
pub struct TunTapDevice {
    fd: RawFd,
}

//==============================================================================
// Associated Functions
//==============================================================================

impl TunTapDevice {
    /// Opens `/dev/net/tun` and attaches the TAP interface `name`.
    pub fn open(name: &str) -> Result<Self, Fail> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(Fail::new(libc::EINVAL, "interface name too long"));
        }

        let fd: RawFd = unsafe {
            libc::open(
                TUN_PATH.as_ptr() as *const libc::c_char,
                libc::O_RDWR | libc::O_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(Fail::last_os_error("cannot open /dev/net/tun"));
        }

        let mut ifreq: IfReq = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: IFF_TAP | IFF_NO_PI,
            _padding: [0; 22],
        };
        ifreq.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        if unsafe { libc::ioctl(fd, TUNSETIFF, &ifreq) } < 0 {
            let fail: Fail = Fail::last_os_error("cannot attach TAP interface");
            unsafe { libc::close(fd) };
            return Err(fail);
        }

        info!("attached TAP interface {}", name);
        Ok(Self { fd })
    }

    /// Raw descriptor, for readiness polling.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Reads one frame into `buffer`, returning its length.
    pub fn recv(&self, buffer: &mut [u8]) -> Result<usize, Fail> {
        let len: isize = unsafe { libc::read(self.fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
        if len < 0 {
            return Err(Fail::last_os_error("read from TAP device failed"));
        }
        Ok(len as usize)
    }

    /// Writes one frame, returning the number of bytes accepted.
    pub fn send(&self, buffer: &[u8]) -> Result<usize, Fail> {
        let len: isize = unsafe { libc::write(self.fd, buffer.as_ptr() as *const libc::c_void, buffer.len()) };
        if len < 0 {
            return Err(Fail::last_os_error("write to TAP device failed"));
        }
        Ok(len as usize)
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

impl Drop for TunTapDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
