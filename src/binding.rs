//! Attaching device descriptions to the raw devices of a [Topology].

use crate::{
    description::Repository,
    error::BindingError,
    topology::{RawDevice, Topology},
    };


/**
    resolve the description of every device of the topology, in traversal order

    A device with no description in the repository, or with an invalid description, aborts the whole binding: a session with an unbound device would silently miss its data. No bus access is done here.
*/
pub fn bind(topology: &mut Topology, repository: &dyn Repository) -> Result<(), BindingError> {
    bind_all(topology.roots_mut(), repository)?;
    log::info!("{} devices bound", topology.len());
    Ok(())
}

fn bind_all(devices: &mut [RawDevice], repository: &dyn Repository) -> Result<(), BindingError> {
    for device in devices {
        let description = repository.lookup(device.vendor_id(), device.product_code())
            .ok_or(BindingError::UnknownDevice {
                address: device.address(),
                vendor_id: device.vendor_id(),
                product_code: device.product_code(),
                })?;
        description.validate()?;
        log::debug!("device 0x{:04x} is {}", device.address(), description.name);
        device.attach(description);
        bind_all(device.children_mut(), repository)?;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::DiscoveredDevice,
        data::DataType,
        description::{DescriptionCache, DeviceDescription, DataGroup, Direction, Signal},
        };

    fn topology(products: &[u32]) -> Topology {
        let discovered = products.iter().enumerate()
            .map(|(position, &product_code)|  DiscoveredDevice {
                position: position as u16,
                parent: if position == 0 {None} else {Some(0)},
                vendor_id: 2,
                product_code,
                })
            .collect::<Vec<_>>();
        Topology::build(&discovered, 0x1001).unwrap()
    }

    fn repository() -> DescriptionCache {
        let mut cache = DescriptionCache::new();
        cache.insert(DeviceDescription::new("coupler", 2, 1));
        cache.insert(DeviceDescription::new("input", 2, 2)
            .group(DataGroup::new("in", 0x1a00, Direction::Input).signal(Signal::new("value", DataType::U16))));
        cache
    }

    #[test]
    fn descriptions_are_shared() {
        let mut topology = topology(&[1, 2, 2]);
        bind(&mut topology, &repository()).unwrap();
        let devices = topology.iter().collect::<Vec<_>>();
        assert_eq!(devices[0].description().unwrap().name, "coupler");
        let (a, b) = (devices[1].description().unwrap(), devices[2].description().unwrap());
        assert!(std::sync::Arc::ptr_eq(a, b));
    }

    #[test]
    fn unknown_device_aborts() {
        let mut topology = topology(&[1, 3, 2]);
        assert!(matches!(
            bind(&mut topology, &repository()),
            Err(BindingError::UnknownDevice {address: 0x1002, vendor_id: 2, product_code: 3}),
            ));
    }
}
