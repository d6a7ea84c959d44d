/*!
    Discovery of the devices present on the segment, and their arrangement in a tree.

    The scan assigns every device a configured station address derived from its physical position, so scanning an unchanged segment twice always gives the same tree and the same addresses.

    Every later stage (binding, mapping, configuration, lifecycle) walks the tree with [Topology::iter], a depth-first pre-order traversal. Since a device always comes after its parent on the bus, this traversal is the physical bus order.
*/

use std::sync::Arc;

use crate::{
    bus::{Bus, DiscoveredDevice},
    description::DeviceDescription,
    error::DiscoveryError,
    };


/**
    a device discovered on the bus

    Its identity never changes after the scan, only its bound description is attached later by [crate::binding].
*/
#[derive(Clone, Debug)]
pub struct RawDevice {
    /// index in physical bus order
    position: u16,
    /// configured station address, unique in the session
    address: u16,
    vendor_id: u32,
    product_code: u32,
    /// devices connected behind this one, in bus order
    children: Vec<RawDevice>,
    /// description resolved from the identifiers, shared with all devices of the same type
    description: Option<Arc<DeviceDescription>>,
}
impl RawDevice {
    pub fn position(&self) -> u16  {self.position}
    pub fn address(&self) -> u16  {self.address}
    pub fn vendor_id(&self) -> u32  {self.vendor_id}
    pub fn product_code(&self) -> u32  {self.product_code}
    pub fn children(&self) -> &[RawDevice]  {&self.children}
    /// description bound to this device, if any
    pub fn description(&self) -> Option<&Arc<DeviceDescription>>  {self.description.as_ref()}

    pub(crate) fn attach(&mut self, description: Arc<DeviceDescription>) {
        self.description = Some(description);
    }
    pub(crate) fn children_mut(&mut self) -> &mut [RawDevice]  {&mut self.children}
}

/// all devices of a segment, as a forest of devices directly connected to the master
#[derive(Clone, Debug, Default)]
pub struct Topology {
    roots: Vec<RawDevice>,
    count: usize,
}
impl Topology {
    /**
        build the tree from the enumerated devices

        devices must be sorted in physical order, each with a parent preceding it.
        addresses are assigned as `first_address + position`
    */
    pub fn build(discovered: &[DiscoveredDevice], first_address: u16) -> Result<Self, DiscoveryError> {
        let mut roots: Vec<RawDevice> = Vec::new();
        // path of positions from a root to the last inserted device
        let mut stack: Vec<u16> = Vec::new();

        for (index, found) in discovered.iter().enumerate() {
            if usize::from(found.position) != index
                {return Err(DiscoveryError::Bus(crate::EthercatError::Protocol("devices are not enumerated in physical order")))}
            // address 0 is reserved, so wrapping around is never valid
            let address = first_address.checked_add(found.position)
                .ok_or(DiscoveryError::AddressSpaceExhausted {position: found.position, first_address})?;
            let device = RawDevice {
                position: found.position,
                address,
                vendor_id: found.vendor_id,
                product_code: found.product_code,
                children: Vec::new(),
                description: None,
            };
            match found.parent {
                None => {
                    stack.clear();
                    roots.push(device);
                },
                Some(parent) => {
                    // in pre-order, a parent is always on the path to the previous device
                    let Some(depth) = stack.iter().position(|&p| p == parent)
                        else {return Err(DiscoveryError::InvalidTopology {position: found.position, parent})};
                    stack.truncate(depth + 1);
                    let mut level = &mut roots;
                    for _ in 0 ..= depth {
                        level = match level.last_mut() {
                            Some(node) => &mut node.children,
                            None => return Err(DiscoveryError::InvalidTopology {position: found.position, parent}),
                        };
                    }
                    level.push(device);
                },
            }
            stack.push(found.position);
        }
        Ok(Self {roots, count: discovered.len()})
    }

    /// devices directly connected to the master
    pub fn roots(&self) -> &[RawDevice]  {&self.roots}
    pub(crate) fn roots_mut(&mut self) -> &mut [RawDevice]  {&mut self.roots}
    /// total number of devices
    pub fn len(&self) -> usize  {self.count}
    pub fn is_empty(&self) -> bool  {self.count == 0}

    /// iterate all devices depth-first, which is the physical bus order
    pub fn iter(&self) -> TopologyIter<'_> {
        TopologyIter {stack: self.roots.iter().rev().collect()}
    }
    /// find a device by its configured station address
    pub fn device(&self, address: u16) -> Option<&RawDevice> {
        self.iter().find(|device| device.address == address)
    }
    /// configured station addresses in bus order
    pub fn addresses(&self) -> Vec<u16> {
        self.iter().map(|device| device.address).collect()
    }
}

/// depth-first iterator over a [Topology]
pub struct TopologyIter<'a> {
    stack: Vec<&'a RawDevice>,
}
impl<'a> Iterator for TopologyIter<'a> {
    type Item = &'a RawDevice;
    fn next(&mut self) -> Option<Self::Item> {
        let device = self.stack.pop()?;
        self.stack.extend(device.children.iter().rev());
        Some(device)
    }
}


/**
    discover all devices on the segment reachable through the given interface

    The interface is opened on the bus, devices are enumerated, and each one gets its configured station address. On failure the interface is closed again.
*/
pub async fn scan(bus: &dyn Bus, interface: &str, first_address: u16) -> Result<Topology, DiscoveryError> {
    bus.open(interface).await
        .map_err(|e|  DiscoveryError::NoBusAccess {
            interface: interface.to_owned(),
            reason: e.to_string(),
            })?;

    let result = enumerate(bus, interface, first_address).await;
    if result.is_err() {
        bus.close().await;
    }
    result
}

async fn enumerate(bus: &dyn Bus, interface: &str, first_address: u16) -> Result<Topology, DiscoveryError> {
    let mut discovered = bus.enumerate().await.map_err(DiscoveryError::Bus)?;
    if discovered.is_empty()
        {return Err(DiscoveryError::NoDevicesFound)}
    discovered.sort_by_key(|device| device.position);

    let topology = Topology::build(&discovered, first_address)?;
    for device in topology.iter() {
        bus.assign_address(device.position, device.address).await
            .map_err(DiscoveryError::Bus)?;
        log::debug!("device {} at address 0x{:04x}: vendor 0x{:08x} product 0x{:08x}",
            device.position, device.address, device.vendor_id, device.product_code);
    }
    log::info!("{} devices found on {}", topology.len(), interface);
    Ok(topology)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn found(position: u16, parent: Option<u16>) -> DiscoveredDevice {
        DiscoveredDevice {position, parent, vendor_id: 2, product_code: u32::from(position)}
    }

    #[test]
    fn nested_tree() {
        // coupler 0 with 1, 2 behind it; 2 has 3 behind it; coupler 4 with 5
        let discovered = [
            found(0, None),
            found(1, Some(0)),
            found(2, Some(0)),
            found(3, Some(2)),
            found(4, None),
            found(5, Some(4)),
            ];
        let topology = Topology::build(&discovered, 0x1001).unwrap();
        assert_eq!(topology.len(), 6);
        assert_eq!(topology.roots().len(), 2);
        assert_eq!(topology.roots()[0].children().len(), 2);
        assert_eq!(topology.roots()[0].children()[1].children()[0].position(), 3);
        assert_eq!(topology.addresses(), vec![0x1001, 0x1002, 0x1003, 0x1004, 0x1005, 0x1006]);
        assert_eq!(topology.device(0x1004).map(|d| d.position()), Some(3));
    }

    #[test]
    fn parent_must_precede() {
        let discovered = [found(0, None), found(1, Some(2)), found(2, None)];
        assert!(matches!(
            Topology::build(&discovered, 1),
            Err(DiscoveryError::InvalidTopology {position: 1, parent: 2}),
            ));
        // a parent closed by a later root is not reachable anymore
        let discovered = [found(0, None), found(1, None), found(2, Some(0))];
        assert!(Topology::build(&discovered, 1).is_err());
    }

    #[test]
    fn addresses_do_not_wrap() {
        let discovered = [found(0, None), found(1, Some(0)), found(2, None)];
        let topology = Topology::build(&discovered, 0xfffd).unwrap();
        assert_eq!(topology.addresses(), vec![0xfffd, 0xfffe, 0xffff]);

        assert!(matches!(
            Topology::build(&discovered, 0xfffe),
            Err(DiscoveryError::AddressSpaceExhausted {position: 2, first_address: 0xfffe}),
            ));
        assert!(matches!(
            Topology::build(&discovered[.. 2], 0xffff),
            Err(DiscoveryError::AddressSpaceExhausted {position: 1, first_address: 0xffff}),
            ));
    }
}
