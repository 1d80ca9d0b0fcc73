//! Device enumeration, the first step of every harness fixture.
use std::sync::Arc;
use std::{ffi::CStr, io, marker::PhantomData};

use rdma_mummy_sys::{
    ibv_device, ibv_free_device_list, ibv_get_device_guid, ibv_get_device_list, ibv_get_device_name, ibv_open_device,
    ibv_transport_type,
};

use super::device_context::{DeviceContext, Guid};

/// Error returned by [`DeviceList::new`] for getting a new [`DeviceList`].
#[derive(Debug, thiserror::Error)]
#[error("failed to get device list")]
#[non_exhaustive]
pub struct GetDeviceListError(#[from] pub GetDeviceListErrorKind);

/// The enum type for [`GetDeviceListError`].
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
#[non_exhaustive]
pub enum GetDeviceListErrorKind {
    Ibverbs(#[from] io::Error),
}

/// Error returned by [`Device::open`] for opening a device.
#[derive(Debug, thiserror::Error)]
#[error("failed to open device {name}")]
#[non_exhaustive]
pub struct OpenDeviceError {
    pub name: String,
    #[source]
    pub source: io::Error,
}

/// All RDMA devices visible to this process.
pub struct DeviceList {
    devices: *mut *mut ibv_device,
    num_devices: usize,
}

impl DeviceList {
    pub fn new() -> Result<DeviceList, GetDeviceListError> {
        let mut num_devices: i32 = 0;
        let devices = unsafe { ibv_get_device_list(&mut num_devices as *mut _) };
        if devices.is_null() {
            return Err(GetDeviceListErrorKind::Ibverbs(io::Error::last_os_error()).into());
        }

        Ok(DeviceList {
            devices,
            num_devices: num_devices.max(0) as usize,
        })
    }

    pub fn iter(&self) -> DeviceListIter<'_> {
        DeviceListIter {
            current: 0,
            devices: self,
        }
    }

    /// Get the device at `index`, in the order the verbs library enumerated them.
    pub fn get(&self, index: usize) -> Option<Device<'_>> {
        if index >= self.num_devices {
            return None;
        }
        let device = unsafe { *self.devices.add(index) };
        if device.is_null() {
            None
        } else {
            Some(Device {
                device,
                _dev_list: PhantomData,
            })
        }
    }

    /// Find a device by its name, for example `mlx5_0` or `rxe0`.
    pub fn find_by_name(&self, name: &str) -> Option<Device<'_>> {
        self.iter().find(|device| device.name() == name)
    }

    pub fn len(&self) -> usize {
        self.num_devices
    }

    pub fn is_empty(&self) -> bool {
        self.num_devices == 0
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { ibv_free_device_list(self.devices) };
    }
}

impl<'list> IntoIterator for &'list DeviceList {
    type Item = Device<'list>;
    type IntoIter = DeviceListIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct DeviceListIter<'list> {
    current: usize,
    devices: &'list DeviceList,
}

impl<'list> Iterator for DeviceListIter<'list> {
    type Item = Device<'list>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.current < self.devices.len() {
            let index = self.current;
            self.current += 1;
            if let Some(device) = self.devices.get(index) {
                return Some(device);
            }
        }
        None
    }
}

/// The underlying transport type of the device.
#[repr(i32)]
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum TransportType {
    Unknown = ibv_transport_type::IBV_TRANSPORT_UNKNOWN,
    InfiniBand = ibv_transport_type::IBV_TRANSPORT_IB,
    IWarp = ibv_transport_type::IBV_TRANSPORT_IWARP,
    Usnic = ibv_transport_type::IBV_TRANSPORT_USNIC,
    UsnicUdp = ibv_transport_type::IBV_TRANSPORT_USNIC_UDP,
    Unspecified = ibv_transport_type::IBV_TRANSPORT_UNSPECIFIED,
}

impl From<i32> for TransportType {
    fn from(trans: i32) -> Self {
        match trans {
            ibv_transport_type::IBV_TRANSPORT_IB => TransportType::InfiniBand,
            ibv_transport_type::IBV_TRANSPORT_IWARP => TransportType::IWarp,
            ibv_transport_type::IBV_TRANSPORT_USNIC => TransportType::Usnic,
            ibv_transport_type::IBV_TRANSPORT_USNIC_UDP => TransportType::UsnicUdp,
            ibv_transport_type::IBV_TRANSPORT_UNSPECIFIED => TransportType::Unspecified,
            _ => TransportType::Unknown,
        }
    }
}

/// A device entry borrowed from a [`DeviceList`]; it cannot outlive the list.
#[derive(Clone, Copy, Debug)]
pub struct Device<'list> {
    device: *mut ibv_device,
    _dev_list: PhantomData<&'list ()>,
}

impl Device<'_> {
    /// Open the device. The returned context stays open until the last [`Arc`] is dropped.
    pub fn open(&self) -> Result<Arc<DeviceContext>, OpenDeviceError> {
        let context = unsafe { ibv_open_device(self.device) };
        if context.is_null() {
            return Err(OpenDeviceError {
                name: self.name(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(Arc::new(DeviceContext { context }))
    }
}

/// Trait for common device information access.
pub trait DeviceInfo {
    /// Get the name of the device, for example, `mlx5_0`.
    fn name(&self) -> String;

    fn guid(&self) -> Guid;

    fn transport_type(&self) -> TransportType;
}

pub(crate) unsafe fn device_name(device: *mut ibv_device) -> String {
    let name = ibv_get_device_name(device);
    if name.is_null() {
        String::new()
    } else {
        String::from_utf8_lossy(CStr::from_ptr(name).to_bytes()).to_string()
    }
}

impl DeviceInfo for Device<'_> {
    fn name(&self) -> String {
        unsafe { device_name(self.device) }
    }

    fn guid(&self) -> Guid {
        unsafe { Guid(ibv_get_device_guid(self.device)) }
    }

    fn transport_type(&self) -> TransportType {
        unsafe { (*self.device).transport_type.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ibv_transport_type::IBV_TRANSPORT_IB, TransportType::InfiniBand)]
    #[case(ibv_transport_type::IBV_TRANSPORT_IWARP, TransportType::IWarp)]
    #[case(ibv_transport_type::IBV_TRANSPORT_UNSPECIFIED, TransportType::Unspecified)]
    #[case(999, TransportType::Unknown)]
    fn test_transport_type_conversion(#[case] raw: i32, #[case] expected: TransportType) {
        assert_eq!(TransportType::from(raw), expected);
    }

    #[test]
    fn test_get_out_of_range() -> Result<(), Box<dyn std::error::Error>> {
        // hosts without any verbs provider cannot even list devices
        let Ok(devices) = DeviceList::new() else {
            return Ok(());
        };
        assert!(devices.get(devices.len()).is_none());
        assert_eq!(devices.iter().count(), devices.len());

        for device in &devices {
            assert!(devices.find_by_name(&device.name()).is_some());
        }
        Ok(())
    }
}
