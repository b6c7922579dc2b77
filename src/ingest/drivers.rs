//! Driver selection and device discovery.
//!
//! Driver choice is table-driven: each platform lists its capture drivers in
//! preference order, and `BackendRegistry::select` walks that list against
//! the backends compiled into this build, falling back explicitly to the next
//! entry. The synthetic driver is never chosen automatically.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::{CaptureParams, DeviceBackend, SyntheticBackend};
use crate::frame::DeviceId;

/// Capture drivers the rig knows about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Driver {
    V4l2,
    MediaFoundation,
    DirectShow,
    AvFoundation,
    Synthetic,
}

impl Driver {
    pub fn name(self) -> &'static str {
        match self {
            Self::V4l2 => "v4l2",
            Self::MediaFoundation => "msmf",
            Self::DirectShow => "dshow",
            Self::AvFoundation => "avfoundation",
            Self::Synthetic => "synthetic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "v4l2" => Some(Self::V4l2),
            "msmf" | "mediafoundation" => Some(Self::MediaFoundation),
            "dshow" | "directshow" => Some(Self::DirectShow),
            "avfoundation" => Some(Self::AvFoundation),
            "synthetic" | "stub" => Some(Self::Synthetic),
            _ => None,
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Platform {
    Linux,
    Windows,
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Other
        }
    }

    /// Drivers to try on this platform, most preferred first.
    pub fn preferences(self) -> &'static [Driver] {
        DRIVER_PREFERENCES
            .iter()
            .find(|(platform, _)| *platform == self)
            .map(|(_, drivers)| *drivers)
            .unwrap_or(&[])
    }
}

/// Platform → ordered driver preferences.
pub const DRIVER_PREFERENCES: &[(Platform, &[Driver])] = &[
    (Platform::Linux, &[Driver::V4l2]),
    (
        Platform::Windows,
        &[Driver::MediaFoundation, Driver::DirectShow],
    ),
    (Platform::MacOs, &[Driver::AvFoundation]),
    (Platform::Other, &[]),
];

/// How the caller wants the driver chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DriverSelection {
    /// Walk the platform preference table.
    #[default]
    Auto,
    /// Use exactly this driver or fail.
    Require(Driver),
}

impl DriverSelection {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "any" | "default" => Some(Self::Auto),
            other => Driver::parse(other).map(Self::Require),
        }
    }
}

/// Backends available in this build, keyed by driver.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<Driver, Arc<dyn DeviceBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every backend compiled into this build.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(SyntheticBackend::new());
        #[cfg(feature = "ingest-v4l2")]
        registry.register(super::V4l2Backend::new());
        registry
    }

    /// Registers a backend under its driver, replacing any previous one.
    pub fn register<B: DeviceBackend + 'static>(&mut self, backend: B) {
        self.backends.insert(backend.driver(), Arc::new(backend));
    }

    pub fn get(&self, driver: Driver) -> Option<Arc<dyn DeviceBackend>> {
        self.backends.get(&driver).cloned()
    }

    pub fn drivers(&self) -> Vec<Driver> {
        let mut drivers: Vec<Driver> = self.backends.keys().copied().collect();
        drivers.sort_by_key(|driver| driver.name());
        drivers
    }

    /// Picks a backend for `platform`.
    ///
    /// `Auto` tries the platform's preferences in order and falls back to the
    /// next one when a driver is not available in this build.
    pub fn select(
        &self,
        platform: Platform,
        selection: DriverSelection,
    ) -> Result<Arc<dyn DeviceBackend>> {
        match selection {
            DriverSelection::Require(driver) => self
                .get(driver)
                .ok_or_else(|| anyhow!("driver '{}' is not available in this build", driver)),
            DriverSelection::Auto => {
                for driver in platform.preferences() {
                    if let Some(backend) = self.get(*driver) {
                        log::info!("driver selected: {} ({:?})", driver, platform);
                        return Ok(backend);
                    }
                    log::debug!("driver {} not available, trying next preference", driver);
                }
                Err(anyhow!(
                    "no capture driver available for {:?} (tried {:?}); select one explicitly",
                    platform,
                    platform.preferences()
                ))
            }
        }
    }
}

/// Highest device index the rig will address.
pub const MAX_DEVICE_ID: u32 = 255;

/// Parses a device list such as `"0,2-3"`.
///
/// Ranges are inclusive and may be written in either order. Entries that are
/// not numbers are skipped, ids above [`MAX_DEVICE_ID`] are dropped and ranges
/// are clipped to it. The result is sorted and deduplicated.
pub fn parse_device_list(value: &str) -> Vec<DeviceId> {
    let mut ids = BTreeSet::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let (Ok(start), Ok(end)) = (start.trim().parse::<u32>(), end.trim().parse::<u32>())
            else {
                log::warn!("ignoring malformed device range '{}'", part);
                continue;
            };
            let (low, high) = if start <= end { (start, end) } else { (end, start) };
            if low > MAX_DEVICE_ID {
                log::warn!("ignoring device range '{}' above {}", part, MAX_DEVICE_ID);
                continue;
            }
            ids.extend(low..=high.min(MAX_DEVICE_ID));
        } else {
            match part.parse::<u32>() {
                Ok(id) if id > MAX_DEVICE_ID => {
                    log::warn!("ignoring device id {} above {}", id, MAX_DEVICE_ID)
                }
                Ok(id) => {
                    ids.insert(id);
                }
                Err(_) => log::warn!("ignoring malformed device id '{}'", part),
            }
        }
    }
    ids.into_iter().map(DeviceId).collect()
}

/// Returns the devices to run.
///
/// A non-empty `allow_list` restricts the run to exactly those ids, without
/// probing; devices that then fail to open are simply absent. Otherwise ids
/// `0..max_devices` are probed and those that open are returned.
pub fn discover_devices(
    backend: &dyn DeviceBackend,
    params: &CaptureParams,
    max_devices: u32,
    allow_list: &[DeviceId],
) -> Vec<DeviceId> {
    if !allow_list.is_empty() {
        let mut ids = allow_list.to_vec();
        ids.sort();
        ids.dedup();
        return ids;
    }
    (0..max_devices.min(MAX_DEVICE_ID + 1))
        .map(DeviceId)
        .filter(|id| backend.probe(*id, params))
        .collect()
}
