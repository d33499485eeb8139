//! Device discovery and device context.

use std::ffi::CStr;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::rc::Rc;
use std::slice;
use std::{fmt, io};

use crate::types::{Gid, PortAttr};

/// One entry of the host's RDMA device table.
pub struct Device {
    dev: NonNull<ibverbs_sys::ibv_device>,
}

/// The host's RDMA device table.
///
/// [`Device`] entries point into the table and are only valid while it is
/// alive; the table is returned to libibverbs on drop.
pub struct DeviceList {
    raw: NonNull<*mut ibverbs_sys::ibv_device>,
    devices: Vec<Device>,
}

impl DeviceList {
    pub fn list() -> io::Result<Self> {
        let mut count = 0i32;
        let raw = unsafe { ibverbs_sys::ibv_get_device_list(&mut count) };
        let raw = NonNull::new(raw).ok_or_else(io::Error::last_os_error)?;

        let devices = unsafe { slice::from_raw_parts(raw.as_ptr(), count.max(0) as usize) }
            .iter()
            .filter_map(|&dev| NonNull::new(dev))
            .map(|dev| Device { dev })
            .collect();

        Ok(Self { raw, devices })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        // The entries borrow from the table; clear them before freeing it.
        self.devices.clear();
        unsafe { ibverbs_sys::ibv_free_device_list(self.raw.as_ptr()) };
    }
}

impl Device {
    /// Kernel name of the device, e.g. `mlx5_0`.
    pub fn name(&self) -> Option<&str> {
        let name = unsafe { ibverbs_sys::ibv_get_device_name(self.dev.as_ptr()) };
        if name.is_null() {
            return None;
        }
        unsafe { CStr::from_ptr(name) }.to_str().ok()
    }

    /// Open the device, yielding an independently owned context.
    pub fn open(&self) -> io::Result<Context> {
        let ctx = unsafe { ibverbs_sys::ibv_open_device(self.dev.as_ptr()) };
        let ctx = NonNull::new(ctx).ok_or_else(io::Error::last_os_error)?;
        Ok(Context(Rc::new(ContextInner { ctx })))
    }
}

pub(crate) struct ContextInner {
    ctx: NonNull<ibverbs_sys::ibv_context>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_close_device(self.ctx.as_ptr());
        }
    }
}

/// An open device context.
///
/// Cheaply cloneable; the device is closed when the last clone drops.
#[derive(Clone)]
pub struct Context(Rc<ContextInner>);

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

impl Context {
    pub fn as_ptr(&self) -> *mut ibverbs_sys::ibv_context {
        self.0.ctx.as_ptr()
    }

    pub fn query_port(&self, port: u8) -> io::Result<PortAttr> {
        unsafe {
            let mut attr: MaybeUninit<ibverbs_sys::ibv_port_attr> = MaybeUninit::zeroed();
            let ret = ibverbs_sys::inline::ibv_query_port(self.as_ptr(), port, attr.as_mut_ptr());
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret));
            }
            Ok(PortAttr::from_raw(&attr.assume_init()))
        }
    }

    pub fn query_gid(&self, port: u8, index: u8) -> io::Result<Gid> {
        unsafe {
            let mut gid: MaybeUninit<ibverbs_sys::ibv_gid> = MaybeUninit::zeroed();
            let ret = ibverbs_sys::ibv_query_gid(
                self.as_ptr(),
                port,
                index as i32,
                gid.as_mut_ptr(),
            );
            if ret != 0 {
                return Err(io::Error::from_raw_os_error(ret));
            }
            Ok(Gid::from_raw(gid.assume_init().raw))
        }
    }
}
