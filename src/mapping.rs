/*!
    This module computes the layout of the process image: where every signal of every bound device lives in the contiguous byte buffer exchanged each cycle.

    It highlights
    - [Mapper] to create a mapping of contiguous memory for multiple devices, computing each inserted signal's offset
    - [map] which runs a [Mapper] over a bound [Topology]
    - [Mapping] the resulting signal table, and the per-device [DeviceLayout] handed to the bus

    Signals are placed in the exact order they are pushed, one after the other, each occupying a whole number of bytes. [map] pushes them in the topology traversal order, so the same topology always gives the same offsets.

    ## Example

    ```
    use ecmaster::{mapping::Mapper, DataType, Direction, Signal};

    let mut mapper = Mapper::new();
    let mut device = mapper.device(0x1001);
    let mut inputs = device.group("AI Inputs Ch.1", Direction::Input);
    let status = inputs.push(&Signal::new("Status", DataType::U16));
    let value = inputs.push(&Signal::new("Value", DataType::I16));
    let mapping = mapper.finish()?;

    assert_eq!(mapping.size(), 4);
    assert_eq!(mapping.get(status).map(|signal| signal.range()), Some(0 .. 2));
    assert_eq!(mapping.get(value).map(|signal| signal.range()), Some(2 .. 4));
    # Ok::<(), ecmaster::error::MappingError>(())
    ```
*/

use core::{
    fmt,
    ops::Range,
    str::FromStr,
    };
use std::collections::HashMap;

use crate::{
    data::{DataType, storage_len},
    description::{Direction, Signal},
    error::{AccessError, MappingError},
    topology::Topology,
    };


/// address of a signal by name: device station address, data group name, signal name
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SignalPath {
    pub address: u16,
    pub group: String,
    pub signal: String,
}
impl SignalPath {
    pub fn new(address: u16, group: impl Into<String>, signal: impl Into<String>) -> Self {
        Self {address, group: group.into(), signal: signal.into()}
    }
}
impl fmt::Display for SignalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}/{}/{}", self.address, self.group, self.signal)
    }
}
/// parse `"<address>/<group>/<signal>"`, the address being decimal or `0x` hexadecimal. The signal name may contain slashes, not the group name.
impl FromStr for SignalPath {
    type Err = AccessError;
    fn from_str(text: &str) -> Result<Self, AccessError> {
        let unknown = || AccessError::UnknownSignal(text.to_owned());
        let mut parts = text.splitn(3, '/');
        let (Some(address), Some(group), Some(signal)) = (parts.next(), parts.next(), parts.next())
            else {return Err(unknown())};
        let address = match address.strip_prefix("0x").or_else(|| address.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16),
            None => address.parse(),
            }.map_err(|_| unknown())?;
        Ok(Self::new(address, group, signal))
    }
}

/// stable reference to a mapped signal, this is an index in the signal table of a [Mapping]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SignalHandle(usize);
impl SignalHandle {
    pub fn index(&self) -> usize  {self.0}
}

/// a signal with its location in the process image
#[derive(Clone, Debug, PartialEq)]
pub struct MappedSignal {
    pub path: SignalPath,
    pub data_type: DataType,
    pub bits: u16,
    pub direction: Direction,
    /// byte offset in the process image
    pub offset: usize,
    /// number of bytes in the process image
    pub len: usize,
}
impl MappedSignal {
    pub fn range(&self) -> Range<usize>  {self.offset .. self.offset + self.len}
}

/// process image layout of one device, as it is loaded into the device
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceLayout {
    pub address: u16,
    /// entries in mapping order, so with increasing offsets
    pub entries: Vec<LayoutEntry>,
}
/// one mapped signal in a [DeviceLayout]
#[derive(Clone, Debug, PartialEq)]
pub struct LayoutEntry {
    pub group: String,
    /// PDO index of the group
    pub group_index: u16,
    pub signal: String,
    /// object dictionary entry mapped
    pub index: u16,
    pub sub_index: u8,
    pub bits: u16,
    pub direction: Direction,
    pub offset: usize,
    pub len: usize,
}
impl DeviceLayout {
    /// bytes used by this device in the image
    pub fn size(&self) -> usize {
        self.entries.iter().map(|entry| entry.len).sum()
    }
}


/**
    Convenient struct to create a mapping of multiple devices into one contiguous process image.

    Each signal insertion returns a [SignalHandle] to the signal in the final [Mapping]. Signals are mapped in the exact order they are pushed, depending on the memory layout desired, push calls must be ordered accordingly.
*/
#[derive(Default, Debug)]
pub struct Mapper {
    offset: usize,
    signals: Vec<MappedSignal>,
    layouts: Vec<DeviceLayout>,
}
impl Mapper {
    pub fn new() -> Self  {Self::default()}
    /// current size of the image
    pub fn size(&self) -> usize  {self.offset}

    /// create an object for mapping data of a given device
    pub fn device(&mut self, address: u16) -> MappingDevice<'_> {
        let layout = match self.layouts.iter().position(|layout| layout.address == address) {
            Some(index) => index,
            None => {
                self.layouts.push(DeviceLayout {address, entries: Vec::new()});
                self.layouts.len() - 1
            },
        };
        MappingDevice {mapper: self, layout}
    }

    /// internal method incrementing the offset with the given data length, returning the start of the inserted data
    fn insert(&mut self, len: usize) -> usize {
        let start = self.offset;
        self.offset += len;
        start
    }

    /**
        check and release the mapping

        signals paths must be unique, ranges must not overlap and must lie in the image
    */
    pub fn finish(self) -> Result<Mapping, MappingError> {
        if self.signals.is_empty()
            {return Err(MappingError::EmptyMapping)}

        let mut by_path = HashMap::with_capacity(self.signals.len());
        for (index, signal) in self.signals.iter().enumerate() {
            if by_path.insert(signal.path.clone(), SignalHandle(index)).is_some()
                {return Err(MappingError::DuplicateSignal(signal.path.clone()))}
        }
        let mapping = Mapping {
            size: self.offset,
            signals: self.signals,
            layouts: self.layouts,
            by_path,
            };
        mapping.validate()?;
        Ok(mapping)
    }
}

/// object allowing to map data groups of one device
pub struct MappingDevice<'a> {
    mapper: &'a mut Mapper,
    layout: usize,
}
impl MappingDevice<'_> {
    pub fn address(&self) -> u16  {self.mapper.layouts[self.layout].address}

    /// map a data group, its signals are appended by the returned object
    pub fn group(&mut self, name: &str, direction: Direction) -> MappingGroup<'_> {
        self.group_at(name, 0, direction)
    }
    /// same as [Self::group] with the PDO index of the group
    pub fn group_at(&mut self, name: &str, index: u16, direction: Direction) -> MappingGroup<'_> {
        MappingGroup {
            mapper: &mut *self.mapper,
            layout: self.layout,
            name: name.to_owned(),
            index,
            direction,
        }
    }
}

/// object allowing to map signals of one data group
pub struct MappingGroup<'a> {
    mapper: &'a mut Mapper,
    layout: usize,
    name: String,
    index: u16,
    direction: Direction,
}
impl MappingGroup<'_> {
    /// add a signal to this group, and return its handle in the final mapping
    pub fn push(&mut self, signal: &Signal) -> SignalHandle {
        let len = storage_len(signal.bits);
        let offset = self.mapper.insert(len);
        let layout = &mut self.mapper.layouts[self.layout];
        layout.entries.push(LayoutEntry {
            group: self.name.clone(),
            group_index: self.index,
            signal: signal.name.clone(),
            index: signal.index,
            sub_index: signal.sub_index,
            bits: signal.bits,
            direction: self.direction,
            offset,
            len,
            });
        self.mapper.signals.push(MappedSignal {
            path: SignalPath::new(layout.address, self.name.as_str(), signal.name.as_str()),
            data_type: signal.data_type,
            bits: signal.bits,
            direction: self.direction,
            offset,
            len,
            });
        SignalHandle(self.mapper.signals.len() - 1)
    }
}


/**
    map every signal of every device of a bound topology

    devices are walked in traversal order, then their data groups, then their signals, each placed right after the previous one
*/
pub fn map(topology: &Topology) -> Result<Mapping, MappingError> {
    let mut mapper = Mapper::new();
    for device in topology.iter() {
        let description = device.description()
            .ok_or(MappingError::Unbound(device.address()))?;
        let mut slave = mapper.device(device.address());
        for group in &description.groups {
            let mut pdo = slave.group_at(&group.name, group.index, group.direction);
            for signal in &group.signals {
                pdo.push(signal);
            }
        }
    }
    let mapping = mapper.finish()?;
    for layout in mapping.layouts() {
        log::debug!("device 0x{:04x} mapped {} entries, {} bytes", layout.address, layout.entries.len(), layout.size());
    }
    log::info!("process image of {} bytes for {} signals", mapping.size(), mapping.signals().len());
    Ok(mapping)
}


/// flattened signal table of a process image, resolved once after mapping
#[derive(Clone, Debug)]
pub struct Mapping {
    size: usize,
    signals: Vec<MappedSignal>,
    layouts: Vec<DeviceLayout>,
    by_path: HashMap<SignalPath, SignalHandle>,
}
impl Mapping {
    /// size of the process image in bytes
    pub fn size(&self) -> usize  {self.size}
    /// all signals in mapping order, a [SignalHandle] is an index in it
    pub fn signals(&self) -> &[MappedSignal]  {&self.signals}
    /// layouts of all devices, in mapping order
    pub fn layouts(&self) -> &[DeviceLayout]  {&self.layouts}
    pub fn layout(&self, address: u16) -> Option<&DeviceLayout> {
        self.layouts.iter().find(|layout| layout.address == address)
    }

    /// resolve a path into a handle
    pub fn lookup(&self, path: &SignalPath) -> Option<SignalHandle> {
        self.by_path.get(path).copied()
    }
    pub fn get(&self, handle: SignalHandle) -> Option<&MappedSignal> {
        self.signals.get(handle.0)
    }

    /// byte ranges of the image written by the devices, contiguous ranges merged
    pub fn input_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges: Vec<Range<usize>> = Vec::new();
        for signal in self.signals.iter().filter(|signal| signal.direction == Direction::Input) {
            match ranges.last_mut() {
                Some(last) if last.end == signal.offset => last.end = signal.offset + signal.len,
                _ => ranges.push(signal.range()),
            }
        }
        ranges
    }

    /// check ranges do not overlap and are all in the image
    pub fn validate(&self) -> Result<(), MappingError> {
        let mut sorted = self.signals.iter().collect::<Vec<_>>();
        sorted.sort_by_key(|signal| signal.offset);
        for signal in &sorted {
            let end = signal.offset + signal.len;
            if end > self.size
                {return Err(MappingError::OutOfImage {path: signal.path.clone(), end, size: self.size})}
        }
        for pair in sorted.windows(2) {
            if pair[0].offset + pair[0].len > pair[1].offset
                {return Err(MappingError::Overlap(pair[0].path.clone(), pair[1].path.clone()))}
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_offset() {
        let mut mapper = Mapper::new();
        let mut device = mapper.device(0x1001);
        let mut outputs = device.group("out", Direction::Output);
        let a = outputs.push(&Signal::new("a", DataType::U16));
        let b = outputs.push(&Signal::raw("b", 12));
        let mut inputs = device.group("in", Direction::Input);
        let c = inputs.push(&Signal::new("c", DataType::BOOL));
        let d = inputs.push(&Signal::new("d", DataType::I32));
        let mut device = mapper.device(0x1002);
        let e = device.group("in", Direction::Input).push(&Signal::new("e", DataType::U8));

        let mapping = mapper.finish().unwrap();
        assert_eq!(mapping.size(), 2 + 2 + 1 + 4 + 1);
        let offsets = [a, b, c, d, e].map(|handle| mapping.get(handle).unwrap().offset);
        assert_eq!(offsets, [0, 2, 4, 5, 9]);
        assert_eq!(mapping.input_ranges(), vec![4 .. 10]);
        assert_eq!(mapping.lookup(&SignalPath::new(0x1002, "in", "e")), Some(e));
        assert_eq!(mapping.layout(0x1001).unwrap().size(), 9);
    }

    #[test]
    fn reject_duplicates() {
        let mut mapper = Mapper::new();
        let mut device = mapper.device(1);
        device.group("in", Direction::Input).push(&Signal::new("a", DataType::U8));
        device.group("in", Direction::Input).push(&Signal::new("a", DataType::U8));
        assert!(matches!(mapper.finish(), Err(MappingError::DuplicateSignal(_))));
        assert!(matches!(Mapper::new().finish(), Err(MappingError::EmptyMapping)));
    }

    #[test]
    fn paths() {
        let path: SignalPath = "0x1001/AI Inputs Ch.1/Value".parse().unwrap();
        assert_eq!(path, SignalPath::new(0x1001, "AI Inputs Ch.1", "Value"));
        assert_eq!("4097/g/s/x".parse::<SignalPath>().unwrap(), SignalPath::new(4097, "g", "s/x"));
        assert_eq!(path.to_string(), "0x1001/AI Inputs Ch.1/Value");
        assert!("g/s".parse::<SignalPath>().is_err());
        assert!("0xzz/g/s".parse::<SignalPath>().is_err());
    }
}
