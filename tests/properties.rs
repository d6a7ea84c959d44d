//! Property-based tests of the process image layout using proptest

use ecmaster::{
    binding, mapping,
    bus::DiscoveredDevice,
    DataGroup, DataType, DescriptionCache, DeviceDescription, Direction, Signal, Topology,
};
use proptest::prelude::*;

/// groups of a device: direction and bit widths of their signals
type Groups = Vec<(bool, Vec<u16>)>;

/// one device: nesting level relative to the previous device, and its data groups
fn device_strategy() -> impl Strategy<Value = (u8, Groups)> {
    (
        0u8 ..= 2,
        prop::collection::vec((any::<bool>(), prop::collection::vec(1u16 ..= 64, 0 .. 5)), 0 .. 4),
    )
}

/// build a bound topology, levels are turned into a valid nesting in bus order
fn bound_topology(devices: &[(u8, Groups)]) -> Topology {
    let mut repository = DescriptionCache::new();
    let mut discovered = Vec::new();
    // positions of the devices on the path to the last one, by level
    let mut path: Vec<u16> = Vec::new();
    for (position, (step, groups)) in devices.iter().enumerate() {
        let position = position as u16;
        let level = match step {
            0 => 0,
            1 => path.len().saturating_sub(1),
            _ => path.len(),
        };
        path.truncate(level);
        let parent = path.last().copied();
        path.push(position);

        let mut description = DeviceDescription::new(format!("device {}", position), 1, u32::from(position));
        for (index, (input, widths)) in groups.iter().enumerate() {
            let direction = if *input {Direction::Input} else {Direction::Output};
            let mut group = DataGroup::new(format!("g{}", index), 0x1600 + index as u16, direction);
            for (index, &bits) in widths.iter().enumerate() {
                group = group.signal(Signal::raw(format!("s{}", index), bits));
            }
            description = description.group(group);
        }
        repository.insert(description);
        discovered.push(DiscoveredDevice {position, parent, vendor_id: 1, product_code: u32::from(position)});
    }
    let mut topology = Topology::build(&discovered, 0x1001).unwrap();
    binding::bind(&mut topology, &repository).unwrap();
    topology
}

#[cfg(test)]
mod layout_properties {
    use super::*;

    proptest! {
        #[test]
        fn signals_never_overlap(devices in prop::collection::vec(device_strategy(), 1 .. 12)) {
            let topology = bound_topology(&devices);
            let total: usize = devices.iter()
                .flat_map(|(_, groups)| groups.iter())
                .flat_map(|(_, widths)| widths.iter())
                .map(|&bits| (usize::from(bits) + 7) / 8)
                .sum();

            match mapping::map(&topology) {
                Ok(mapping) => {
                    prop_assert_eq!(mapping.size(), total);
                    let mut ranges = mapping.signals().iter().map(|signal| signal.range()).collect::<Vec<_>>();
                    ranges.sort_by_key(|range| range.start);
                    for pair in ranges.windows(2) {
                        prop_assert!(pair[0].end <= pair[1].start);
                    }
                    prop_assert!(ranges.iter().all(|range| range.end <= mapping.size()));
                    // same tree, same layout
                    let again = mapping::map(&topology).unwrap();
                    prop_assert_eq!(mapping.signals(), again.signals());
                },
                Err(error) => {
                    prop_assert_eq!(total, 0);
                    prop_assert!(matches!(error, ecmaster::error::MappingError::EmptyMapping));
                },
            }
        }

        #[test]
        fn traversal_is_bus_order(devices in prop::collection::vec(device_strategy(), 1 .. 12)) {
            let topology = bound_topology(&devices);
            let positions = topology.iter().map(|device| device.position()).collect::<Vec<_>>();
            prop_assert_eq!(positions, (0 .. devices.len() as u16).collect::<Vec<_>>());
        }

        #[test]
        fn image_size_of_uniform_devices(
                devices in 1usize .. 8,
                signals in 1usize .. 6,
                width in prop::sample::select(vec![8u16, 16, 32, 64]),
                ) {
            let layout = (0 .. devices)
                .map(|_| (0u8, vec![(true, vec![width; signals])]))
                .collect::<Vec<_>>();
            let mapping = mapping::map(&bound_topology(&layout)).unwrap();
            prop_assert_eq!(mapping.size(), devices * signals * usize::from(width) / 8);
            prop_assert_eq!(mapping.input_ranges(), vec![0 .. mapping.size()]);
        }
    }

    #[test]
    fn typed_signals_use_their_width() {
        let description = DeviceDescription::new("mixed", 1, 0)
            .group(DataGroup::new("g", 0x1a00, Direction::Input)
                .signal(Signal::new("flag", DataType::BOOL))
                .signal(Signal::new("count", DataType::U64)));
        let mut repository = DescriptionCache::new();
        repository.insert(description);
        let mut topology = Topology::build(&[DiscoveredDevice {position: 0, parent: None, vendor_id: 1, product_code: 0}], 1).unwrap();
        binding::bind(&mut topology, &repository).unwrap();
        let mapping = mapping::map(&topology).unwrap();
        assert_eq!(mapping.size(), 1 + 8);
    }
}
