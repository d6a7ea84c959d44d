/*!
    Structured device descriptions, and the repository resolving them from device identifiers.

    A description lists the data groups (PDOs) a device exchanges cyclically, each being an ordered list of signals (PDO entries). This is the data layout a raw discovered device is bound to.

    Parsing of vendor description files (ESI) is not done here, [DescriptionCache::load_dir] reads descriptions already converted to the following TOML form:

    ```toml
    name = "EL3102"
    vendor_id = 0x2
    product_code = 0x0c1e3052

    [[groups]]
    name = "AI Inputs Ch.1"
    index = 0x1a00
    direction = "Input"
    signals = [
        { name = "Status", index = 0x6000, sub_index = 1, bits = 16, data_type = "U16" },
        { name = "Value", index = 0x6000, sub_index = 17, bits = 16, data_type = "I16" },
    ]
    ```
*/

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
    };
use serde::Deserialize;

use crate::{
    data::DataType,
    error::{BindingError, Error},
    };


/// direction of a data group, seen from the master
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Deserialize)]
pub enum Direction {
    /// data written by the master and read by the device (RxPDO)
    Output,
    /// data written by the device and read by the master (TxPDO)
    Input,
}

/// structured metadata of one device type
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DeviceDescription {
    pub name: String,
    pub vendor_id: u32,
    pub product_code: u32,
    /// data groups in the order the device exchanges them
    #[serde(default)]
    pub groups: Vec<DataGroup>,
}

/// a named group of signals exchanged cyclically (PDO)
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DataGroup {
    pub name: String,
    /// PDO index in the device object dictionary
    #[serde(default)]
    pub index: u16,
    pub direction: Direction,
    #[serde(default)]
    pub signals: Vec<Signal>,
}

/// one scalar or bit-field value in a data group (PDO entry)
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Signal {
    pub name: String,
    #[serde(default)]
    pub index: u16,
    #[serde(default)]
    pub sub_index: u8,
    /// width of the signal in bits
    pub bits: u16,
    pub data_type: DataType,
}

impl DeviceDescription {
    pub fn new(name: impl Into<String>, vendor_id: u32, product_code: u32) -> Self {
        Self {name: name.into(), vendor_id, product_code, groups: Vec::new()}
    }
    /// builder-style append of a data group
    pub fn group(mut self, group: DataGroup) -> Self {
        self.groups.push(group);
        self
    }
    /// total number of signals in all groups
    pub fn signal_count(&self) -> usize {
        self.groups.iter().map(|group| group.signals.len()).sum()
    }

    /**
        check the description can be used for mapping

        - every signal width is consistent with its data type
        - group names are unique in the device, and signal names unique in their group, since they are used to address signals
    */
    pub fn validate(&self) -> Result<(), BindingError> {
        let invalid = |reason: String|  BindingError::InvalidDescription {
            name: self.name.clone(),
            reason,
            };
        let mut groups = HashSet::new();
        for group in &self.groups {
            // group names are a component of signal paths
            if group.name.contains('/')
                {return Err(invalid(format!("group name {:?} contains '/'", group.name)))}
            if ! groups.insert(group.name.as_str())
                {return Err(invalid(format!("group {:?} declared twice", group.name)))}
            let mut signals = HashSet::new();
            for signal in &group.signals {
                if ! signals.insert(signal.name.as_str())
                    {return Err(invalid(format!("signal {:?} declared twice in group {:?}", signal.name, group.name)))}
                if ! signal.data_type.accepts(signal.bits)
                    {return Err(invalid(format!("signal {:?} cannot hold {:?} in {} bits", signal.name, signal.data_type, signal.bits)))}
            }
        }
        Ok(())
    }
}

impl DataGroup {
    pub fn new(name: impl Into<String>, index: u16, direction: Direction) -> Self {
        Self {name: name.into(), index, direction, signals: Vec::new()}
    }
    /// builder-style append of a signal
    pub fn signal(mut self, signal: Signal) -> Self {
        self.signals.push(signal);
        self
    }
}

impl Signal {
    /// signal with the nominal width of its data type (1 bit for raw)
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            index: 0,
            sub_index: 0,
            bits: data_type.bits().unwrap_or(1),
            data_type,
        }
    }
    /// raw bit field of the given width
    pub fn raw(name: impl Into<String>, bits: u16) -> Self {
        Self {bits, .. Self::new(name, DataType::RAW)}
    }
    /// set the object dictionary entry this signal maps
    pub fn entry(mut self, index: u16, sub_index: u8) -> Self {
        self.index = index;
        self.sub_index = sub_index;
        self
    }
}


/**
    resolves device descriptions from device identifiers

    Descriptions are shared read-only between all devices of the same type.
*/
pub trait Repository: Send + Sync {
    fn lookup(&self, vendor_id: u32, product_code: u32) -> Option<Arc<DeviceDescription>>;
}

/// in-memory [Repository], filled by hand or from a directory of description files
#[derive(Default, Debug)]
pub struct DescriptionCache {
    descriptions: HashMap<(u32, u32), Arc<DeviceDescription>>,
}
impl DescriptionCache {
    pub fn new() -> Self {Self::default()}

    /// add or replace the description for its vendor and product
    pub fn insert(&mut self, description: DeviceDescription) -> Arc<DeviceDescription> {
        let description = Arc::new(description);
        self.descriptions.insert(
            (description.vendor_id, description.product_code),
            description.clone(),
            );
        description
    }
    pub fn len(&self) -> usize {self.descriptions.len()}
    pub fn is_empty(&self) -> bool {self.descriptions.is_empty()}

    /// parse one description in TOML form
    pub fn parse(text: &str) -> Result<DeviceDescription, Error> {
        toml::from_str(text)
            .map_err(|e|  Error::Config(format!("bad device description: {}", e)))
    }

    /// load every `*.toml` description file in the given directory, in file name order
    pub fn load_dir(path: impl AsRef<Path>) -> Result<Self, Error> {
        let mut files = std::fs::read_dir(path.as_ref())?
            .map(|entry|  entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?;
        files.retain(|file|  file.extension().map_or(false, |ext| ext == "toml"));
        files.sort();

        let mut cache = Self::new();
        for file in files {
            let text = std::fs::read_to_string(&file)?;
            let description = Self::parse(&text)
                .map_err(|e|  Error::Config(format!("{}: {}", file.display(), e)))?;
            log::debug!("loaded description {:?} from {}", description.name, file.display());
            cache.insert(description);
        }
        log::info!("{} device descriptions loaded from {}", cache.len(), path.as_ref().display());
        Ok(cache)
    }
}
impl Repository for DescriptionCache {
    fn lookup(&self, vendor_id: u32, product_code: u32) -> Option<Arc<DeviceDescription>> {
        self.descriptions.get(&(vendor_id, product_code)).cloned()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const EL3102: &str = r#"
        name = "EL3102"
        vendor_id = 0x2
        product_code = 0x0c1e3052

        [[groups]]
        name = "AI Inputs Ch.1"
        index = 0x1a00
        direction = "Input"
        signals = [
            { name = "Status", index = 0x6000, sub_index = 1, bits = 16, data_type = "U16" },
            { name = "Value", index = 0x6000, sub_index = 17, bits = 16, data_type = "I16" },
        ]
        "#;

    #[test]
    fn parse_toml() {
        let description = DescriptionCache::parse(EL3102).unwrap();
        assert_eq!(description.name, "EL3102");
        assert_eq!(description.product_code, 0x0c1e3052);
        assert_eq!(description.groups[0].direction, Direction::Input);
        assert_eq!(description.groups[0].signals[1].data_type, DataType::I16);
        assert_eq!(description.signal_count(), 2);
        description.validate().unwrap();
    }

    #[test]
    fn lookup() {
        let mut cache = DescriptionCache::new();
        cache.insert(DescriptionCache::parse(EL3102).unwrap());
        assert!(cache.lookup(2, 0x0c1e3052).is_some());
        assert!(cache.lookup(2, 0x0c1e3053).is_none());
    }

    #[test]
    fn reject_inconsistent() {
        let description = DeviceDescription::new("bad", 1, 1)
            .group(DataGroup::new("in", 0x1a00, Direction::Input)
                .signal(Signal {bits: 12, .. Signal::new("value", DataType::I16)}));
        assert!(matches!(description.validate(), Err(BindingError::InvalidDescription {..})));

        let description = DeviceDescription::new("twice", 1, 1)
            .group(DataGroup::new("in", 0x1a00, Direction::Input).signal(Signal::new("a", DataType::U8)))
            .group(DataGroup::new("in", 0x1a01, Direction::Input).signal(Signal::new("b", DataType::U8)));
        assert!(description.validate().is_err());

        let description = DeviceDescription::new("slashed", 1, 1)
            .group(DataGroup::new("in/out", 0x1a00, Direction::Input).signal(Signal::new("a", DataType::U8)));
        assert!(matches!(description.validate(), Err(BindingError::InvalidDescription {..})));
    }

    #[test]
    fn load_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.toml"), EL3102.replace(r#"name = "EL3102""#, r#"name = "EL3102 rev 2""#)).unwrap();
        std::fs::write(dir.path().join("a.toml"), EL3102).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a description").unwrap();
        std::fs::write(dir.path().join("c.toml.bak"), "name = 3").unwrap();

        let cache = DescriptionCache::load_dir(dir.path()).unwrap();
        assert_eq!(cache.len(), 1);
        // files are loaded in name order, the last one describing a device wins
        assert_eq!(cache.lookup(2, 0x0c1e3052).map(|d| d.name.clone()), Some("EL3102 rev 2".to_owned()));

        std::fs::write(dir.path().join("z.toml"), "name = 3").unwrap();
        match DescriptionCache::load_dir(dir.path()) {
            Err(Error::Config(message)) => assert!(message.contains("z.toml"), "{}", message),
            other => panic!("unexpected {:?}", other.map(|cache| cache.len())),
        }
        assert!(matches!(
            DescriptionCache::load_dir(dir.path().join("missing")),
            Err(Error::Io(_)),
            ));
    }
}
