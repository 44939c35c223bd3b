use std::fmt;

use candle_core::{DType, Device};

/// Which device a component should be placed on: the CPU, or a CUDA/Metal
/// ordinal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => f.write_str("cpu"),
            Self::Ordinal(ordinal) => write!(f, "{ordinal}"),
        }
    }
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl DeviceMap {
    pub fn from_cpu_flag(cpu: bool) -> Self {
        if cpu {
            Self::ForceCpu
        } else {
            Self::default()
        }
    }
}

/// Placement and precision of a loaded component, fixed for its lifetime.
///
/// A profile is resolved once when a component is constructed. Changing mode
/// means dropping the component and building a new one from a different
/// [`DeviceMap`]; there is no setter.
#[derive(Clone, Debug)]
pub struct DeviceProfile {
    device: Device,
    dtype: DType,
}

impl DeviceProfile {
    /// CPU runs in full precision; accelerators run in half precision with the
    /// memory-saving strategies switched on.
    pub fn for_device(device: Device) -> Self {
        let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };
        Self { device, dtype }
    }

    /// Full precision regardless of device (used by the captioner).
    pub fn full_precision(device: Device) -> Self {
        Self {
            device,
            dtype: DType::F32,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn is_accelerated(&self) -> bool {
        !self.device.is_cpu()
    }

    /// Keep only one submodule resident on the device at a time.
    pub fn sequential_offload(&self) -> bool {
        self.is_accelerated()
    }

    /// Decode latent batches one sample at a time.
    pub fn sliced_decode(&self) -> bool {
        self.is_accelerated()
    }

    pub fn label(&self) -> &'static str {
        match self.device {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
            Device::Metal(_) => "metal",
        }
    }
}
