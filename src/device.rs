//! The `Device` trait: the abstract contract the monitor needs from the (externally owned)
//! device-object library. `Monitor` is generic over any `Device` implementation; this crate
//! ships [`SimpleDevice`] only as an in-memory stand-in for its own tests and demos, not as a
//! substitute for a real `sd_device`-equivalent.

use crate::Result;

/// The capabilities the monitor needs from an opaque device handle.
///
/// A real implementation (out of scope for this crate) would back these with sysfs state; the
/// monitor never looks past this trait.
pub trait Device: Sized {
    /// Constructs a device from a NUL-delimited properties buffer (`KEY=VALUE\0` runs,
    /// optionally preceded by a kernel-format `"<action>@<devpath>\0"` header line).
    fn from_properties(buf: &[u8]) -> Result<Self>;

    /// Serializes the device's properties back to a NUL-delimited buffer suitable for sending.
    fn serialize_properties(&self) -> Vec<u8>;

    /// The device's subsystem, e.g. `"net"`, `"block"`, `"usb"`.
    fn subsystem(&self) -> &str;

    /// The device's devtype, if any, e.g. `"disk"`, `"usb_device"`.
    fn devtype(&self) -> Option<&str>;

    /// Iterates the device's tags.
    fn tags(&self) -> Box<dyn Iterator<Item = &str> + '_>;

    /// Whether the device carries the given tag.
    fn has_tag(&self, tag: &str) -> bool {
        self.tags().any(|t| t == tag)
    }

    /// Marks the device as fully initialized (set only for devices received in peer format).
    fn set_initialized(&mut self);

    /// Whether [`Device::set_initialized`] has been called.
    fn is_initialized(&self) -> bool;
}

/// A minimal in-memory [`Device`] used by this crate's own tests and demos.
///
/// Properties are stored as an ordered list of `(key, value)` pairs plus the conventional
/// `SUBSYSTEM`, `DEVTYPE`, and `TAGS` keys, which are parsed out on construction and re-emitted
/// on serialization so a round-trip through [`Device::serialize_properties`] and
/// [`Device::from_properties`] is lossless.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimpleDevice {
    properties: Vec<(String, String)>,
    subsystem: String,
    devtype: Option<String>,
    tags: Vec<String>,
    initialized: bool,
}

impl SimpleDevice {
    /// Creates a new, empty [SimpleDevice].
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder function that sets the subsystem.
    pub fn with_subsystem<S: Into<String>>(mut self, subsystem: S) -> Self {
        self.subsystem = subsystem.into();
        self
    }

    /// Builder function that sets the devtype.
    pub fn with_devtype<S: Into<String>>(mut self, devtype: S) -> Self {
        self.devtype = Some(devtype.into());
        self
    }

    /// Builder function that adds a tag.
    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Builder function that sets an arbitrary `KEY=VALUE` property.
    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.set_property(key, value);
        self
    }

    /// Sets an arbitrary `KEY=VALUE` property, replacing any existing value for `key`.
    pub fn set_property<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let key = key.into();
        let value = value.into();

        match key.as_str() {
            "SUBSYSTEM" => self.subsystem = value,
            "DEVTYPE" => self.devtype = Some(value),
            "TAGS" => {
                self.tags = value
                    .split(':')
                    .filter(|t| !t.is_empty())
                    .map(str::to_owned)
                    .collect()
            }
            _ => {
                if let Some(existing) = self.properties.iter_mut().find(|(k, _)| *k == key) {
                    existing.1 = value;
                } else {
                    self.properties.push((key, value));
                }
            }
        }
    }

    /// Gets the value of an arbitrary property by key.
    pub fn get_property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl Device for SimpleDevice {
    fn from_properties(buf: &[u8]) -> Result<Self> {
        let mut device = Self::new();

        for run in buf.split(|&b| b == 0) {
            if run.is_empty() {
                continue;
            }
            let line = String::from_utf8_lossy(run);
            // kernel-format messages prepend an "<action>@<devpath>" line with no '='; skip it.
            if let Some((key, value)) = line.split_once('=') {
                device.set_property(key, value);
            }
        }

        Ok(device)
    }

    fn serialize_properties(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.extend_from_slice(format!("SUBSYSTEM={}\0", self.subsystem).as_bytes());
        if let Some(devtype) = &self.devtype {
            buf.extend_from_slice(format!("DEVTYPE={devtype}\0").as_bytes());
        }
        if !self.tags.is_empty() {
            buf.extend_from_slice(format!("TAGS={}\0", self.tags.join(":")).as_bytes());
        }
        for (key, value) in &self.properties {
            buf.extend_from_slice(format!("{key}={value}\0").as_bytes());
        }

        buf
    }

    fn subsystem(&self) -> &str {
        self.subsystem.as_str()
    }

    fn devtype(&self) -> Option<&str> {
        self.devtype.as_deref()
    }

    fn tags(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        Box::new(self.tags.iter().map(String::as_str))
    }

    fn set_initialized(&mut self) {
        self.initialized = true;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}
