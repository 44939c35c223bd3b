use crate::{error::Result, DeviceMap, ModelStore};

/// Builds a component from the installed model store.
///
/// Loading resolves the device once; the returned model keeps that placement
/// for its whole life. To switch between CPU and accelerator, drop the model
/// and load it again with another [`DeviceMap`].
pub trait Loader {
    type Model;

    fn load(store: &ModelStore, device_map: DeviceMap) -> Result<Self::Model>
    where
        Self: Sized;
}
