/*!
    An in-process [Bus] simulating a segment of devices, for tests and demonstrations without hardware.

    The simulated devices follow the state changes they are requested, store the layout they are loaded with, and answer process data frames: they read their outputs from the frame and write their inputs in the reply, at the offsets of their layout.

    Failures can be injected at every step: interface opening, layout loading, state changes, and individual exchanges. Every call to the bus is logged with its time, so tests can check what happened and when.

    ```ignore
    let bus = SimulatedBus::new()
        .device(2, 0x04442c52)
        .child(0, 2, 0x0c1e3052)
        .input(0x1002, "AI Inputs Ch.1", "Value", |cycle| (cycle as i16).to_le_bytes().to_vec())
        .fail_exchange(5, ExchangeFault::Timeout);
    ```
*/

use core::time::Duration;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Instant,
    };
use async_trait::async_trait;

use crate::{
    bus::{AlError, AlState, Bus, DiscoveredDevice},
    description::Direction,
    error::{EthercatError, EthercatResult},
    mapping::{DeviceLayout, SignalPath},
    };


/// generator of the value of an input signal, given the exchange number
pub type InputGenerator = Box<dyn Fn(u64) -> Vec<u8> + Send + Sync>;

/// failure of a device state change
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransitionFault {
    /// the device never acknowledges
    Timeout,
    /// the device refuses with the given status code
    Refuse(AlError),
}

/// failure of one frame exchange
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExchangeFault {
    /// the reply never comes
    Timeout,
    /// the reply is malformed
    Corrupt,
    /// only the given number of bytes is received
    Partial(usize),
}

/// one call received by the simulated bus
#[derive(Clone, Debug, PartialEq)]
pub struct BusCall {
    pub at: Instant,
    pub kind: CallKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum CallKind {
    Open(String),
    Close,
    Enumerate,
    AssignAddress {position: u16, address: u16},
    LoadMapping {address: u16},
    RequestState {address: u16, state: AlState},
    /// start of an exchange, numbered from 1
    SendFrame {exchange: u64},
    /// end of an exchange, logged when the reply is delivered or the failure reported
    ReceiveFrame {exchange: u64},
}

struct SimDevice {
    position: u16,
    parent: Option<u16>,
    vendor_id: u32,
    product_code: u32,
    address: Option<u16>,
    state: AlState,
    layout: Option<DeviceLayout>,
}

#[derive(Default)]
struct Segment {
    devices: Vec<SimDevice>,
    open: bool,
    fail_open: Option<String>,
    rejections: HashMap<u16, String>,
    transitions: HashMap<(u16, AlState), TransitionFault>,
    faults: HashMap<u64, ExchangeFault>,
    generators: HashMap<SignalPath, InputGenerator>,
    latency: Duration,
    exchanges: u64,
    /// exchange number and reply of the last frame sent
    pending: Option<(u64, Vec<u8>)>,
    /// last frame sent by the master
    outputs: Vec<u8>,
    calls: Vec<BusCall>,
}
impl Segment {
    fn log(&mut self, kind: CallKind) {
        self.calls.push(BusCall {at: Instant::now(), kind});
    }
    fn device(&mut self, address: u16) -> Option<&mut SimDevice> {
        self.devices.iter_mut().find(|device| device.address == Some(address))
    }
}

/// simulated segment, see the module documentation
pub struct SimulatedBus {
    segment: Mutex<Segment>,
}

impl Default for SimulatedBus {
    fn default() -> Self  {Self::new()}
}
impl SimulatedBus {
    /// segment with no device
    pub fn new() -> Self {
        Self {segment: Mutex::new(Segment::default())}
    }
    fn lock(&self) -> MutexGuard<'_, Segment> {
        self.segment.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    fn with(self, callback: impl FnOnce(&mut Segment)) -> Self {
        callback(&mut self.lock());
        self
    }

    /// append a device directly connected to the segment, its position is the number of devices already added
    pub fn device(self, vendor_id: u32, product_code: u32) -> Self {
        self.attach(None, vendor_id, product_code)
    }
    /// append a device connected behind the device at the given position
    pub fn child(self, parent: u16, vendor_id: u32, product_code: u32) -> Self {
        self.attach(Some(parent), vendor_id, product_code)
    }
    fn attach(self, parent: Option<u16>, vendor_id: u32, product_code: u32) -> Self {
        self.with(|segment| {
            let position = segment.devices.len() as u16;
            segment.devices.push(SimDevice {
                position,
                parent,
                vendor_id,
                product_code,
                address: None,
                state: AlState::Init,
                layout: None,
                });
        })
    }
    /// opening the interface fails with the given reason
    pub fn fail_open(self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.with(|segment| segment.fail_open = Some(reason))
    }
    /// the device at the given address rejects its layout
    pub fn reject_mapping(self, address: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.with(|segment| {segment.rejections.insert(address, reason);})
    }
    /// the device at the given address fails when requested the given state
    pub fn fail_transition(self, address: u16, state: AlState, fault: TransitionFault) -> Self {
        self.with(|segment| {segment.transitions.insert((address, state), fault);})
    }
    /// the given exchange (numbered from 1) fails
    pub fn fail_exchange(self, exchange: u64, fault: ExchangeFault) -> Self {
        self.with(|segment| {segment.faults.insert(exchange, fault);})
    }
    /// delay between sending a frame and receiving its reply
    pub fn latency(self, latency: Duration) -> Self {
        self.with(|segment| segment.latency = latency)
    }
    /// the devices answer the given input signal with the generator's value for each exchange
    pub fn input(self, address: u16, group: &str, signal: &str, generator: impl Fn(u64) -> Vec<u8> + Send + Sync + 'static) -> Self {
        let path = SignalPath::new(address, group, signal);
        self.with(|segment| {segment.generators.insert(path, Box::new(generator));})
    }

    /// current state of the device at the given address
    pub fn state(&self, address: u16) -> Option<AlState> {
        self.lock().device(address).map(|device| device.state)
    }
    /// layout loaded in the device at the given address
    pub fn layout(&self, address: u16) -> Option<DeviceLayout> {
        self.lock().device(address).and_then(|device| device.layout.clone())
    }
    /// bytes of an output signal in the last frame received by the devices
    pub fn output(&self, path: &SignalPath) -> Option<Vec<u8>> {
        let mut segment = self.lock();
        let range = {
            let layout = segment.device(path.address)?.layout.as_ref()?;
            let entry = layout.entries.iter()
                .find(|entry|  entry.group == path.group && entry.signal == path.signal)?;
            entry.offset .. entry.offset + entry.len
        };
        segment.outputs.get(range).map(|slot| slot.to_vec())
    }
    /// number of exchanges started so far
    pub fn exchanges(&self) -> u64  {self.lock().exchanges}
    pub fn is_open(&self) -> bool  {self.lock().open}
    /// all calls received so far, in order
    pub fn calls(&self) -> Vec<BusCall>  {self.lock().calls.clone()}
}

/// order of the states in the startup sequence
fn rank(state: AlState) -> u8 {
    match state {
        AlState::Init | AlState::Bootstrap => 0,
        AlState::PreOperational => 1,
        AlState::SafeOperational => 2,
        AlState::Operational => 3,
    }
}

#[async_trait]
impl Bus for SimulatedBus {
    async fn open(&self, interface: &str) -> std::io::Result<()> {
        let mut segment = self.lock();
        segment.log(CallKind::Open(interface.to_owned()));
        if let Some(reason) = &segment.fail_open
            {return Err(std::io::Error::new(std::io::ErrorKind::NotFound, reason.clone()))}
        segment.open = true;
        Ok(())
    }
    async fn close(&self) {
        let mut segment = self.lock();
        segment.log(CallKind::Close);
        segment.open = false;
    }

    async fn enumerate(&self) -> EthercatResult<Vec<DiscoveredDevice>> {
        let mut segment = self.lock();
        segment.log(CallKind::Enumerate);
        if ! segment.open
            {return Err(EthercatError::Master("interface not open"))}
        Ok(segment.devices.iter()
            .map(|device|  DiscoveredDevice {
                position: device.position,
                parent: device.parent,
                vendor_id: device.vendor_id,
                product_code: device.product_code,
                })
            .collect())
    }
    async fn assign_address(&self, position: u16, address: u16) -> EthercatResult {
        let mut segment = self.lock();
        segment.log(CallKind::AssignAddress {position, address});
        let device = segment.devices.get_mut(usize::from(position))
            .ok_or(EthercatError::Master("no device at this position"))?;
        device.address = Some(address);
        Ok(())
    }
    async fn load_mapping(&self, address: u16, layout: &DeviceLayout) -> EthercatResult<(), String> {
        let mut segment = self.lock();
        segment.log(CallKind::LoadMapping {address});
        if let Some(reason) = segment.rejections.get(&address).cloned()
            {return Err(EthercatError::Slave(address, reason))}
        let device = segment.device(address)
            .ok_or(EthercatError::Timeout("no device at this address"))?;
        device.layout = Some(layout.clone());
        Ok(())
    }
    async fn request_state(&self, address: u16, state: AlState, timeout: Duration) -> EthercatResult<(), AlError> {
        let fault = {
            let mut segment = self.lock();
            segment.log(CallKind::RequestState {address, state});
            segment.transitions.get(&(address, state)).copied()
        };
        match fault {
            Some(TransitionFault::Timeout) => {
                tokio::time::sleep(timeout).await;
                return Err(EthercatError::Timeout("state change not acknowledged"));
            },
            Some(TransitionFault::Refuse(code)) => return Err(EthercatError::Slave(address, code)),
            None => {},
        }

        let mut segment = self.lock();
        let device = segment.device(address)
            .ok_or(EthercatError::Timeout("no device at this address"))?;
        if state == AlState::Bootstrap || rank(state) > rank(device.state) + 1
            {return Err(EthercatError::Slave(address, AlError::InvalidStateRequest))}
        if rank(state) >= rank(AlState::SafeOperational) && device.layout.is_none()
            {return Err(EthercatError::Slave(address, AlError::InvalidDeviceSetup))}
        device.state = state;
        Ok(())
    }

    async fn send_frame(&self, data: &[u8]) -> std::io::Result<()> {
        let mut segment = self.lock();
        if ! segment.open
            {return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "interface not open"))}
        segment.exchanges += 1;
        let exchange = segment.exchanges;
        segment.log(CallKind::SendFrame {exchange});

        // devices running process data write their inputs in the passing frame
        let mut reply = data.to_vec();
        for device in &segment.devices {
            if rank(device.state) < rank(AlState::SafeOperational)
                {continue}
            let (Some(address), Some(layout)) = (device.address, &device.layout)
                else {continue};
            for entry in layout.entries.iter().filter(|entry| entry.direction == Direction::Input) {
                let path = SignalPath::new(address, entry.group.as_str(), entry.signal.as_str());
                let Some(generator) = segment.generators.get(&path)
                    else {continue};
                let value = generator(exchange);
                if let Some(slot) = reply.get_mut(entry.offset .. entry.offset + entry.len) {
                    let len = value.len().min(slot.len());
                    slot[.. len].copy_from_slice(&value[.. len]);
                }
            }
        }
        segment.outputs = data.to_vec();
        segment.pending = Some((exchange, reply));
        Ok(())
    }
    async fn receive_frame(&self, data: &mut [u8], timeout: Duration) -> EthercatResult<usize> {
        let (pending, fault, latency) = {
            let mut segment = self.lock();
            let pending = segment.pending.take();
            let fault = pending.as_ref().and_then(|(exchange, _)| segment.faults.get(exchange).copied());
            (pending, fault, segment.latency)
        };
        let Some((exchange, reply)) = pending
            else {
                tokio::time::sleep(timeout).await;
                return Err(EthercatError::Timeout("no frame sent"));
            };

        let result = if fault == Some(ExchangeFault::Timeout) || latency > timeout {
            tokio::time::sleep(timeout).await;
            Err(EthercatError::Timeout("no reply"))
        }
        else {
            tokio::time::sleep(latency).await;
            match fault {
                Some(ExchangeFault::Corrupt) => Err(EthercatError::Protocol("frame checksum mismatch")),
                Some(ExchangeFault::Partial(received)) => {
                    let received = received.min(data.len()).min(reply.len());
                    data[.. received].copy_from_slice(&reply[.. received]);
                    Ok(received)
                },
                _ => {
                    let received = data.len().min(reply.len());
                    data[.. received].copy_from_slice(&reply[.. received]);
                    Ok(received)
                },
            }
        };
        self.lock().log(CallKind::ReceiveFrame {exchange});
        result
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::LayoutEntry;

    fn layout(address: u16) -> DeviceLayout {
        DeviceLayout {address, entries: vec![
            LayoutEntry {
                group: "in".into(), group_index: 0x1a00,
                signal: "value".into(), index: 0x6000, sub_index: 1,
                bits: 16, direction: Direction::Input,
                offset: 0, len: 2,
            },
            LayoutEntry {
                group: "out".into(), group_index: 0x1600,
                signal: "value".into(), index: 0x7000, sub_index: 1,
                bits: 8, direction: Direction::Output,
                offset: 2, len: 1,
            },
            ]}
    }

    #[tokio::test]
    async fn lifecycle_steps() {
        let bus = SimulatedBus::new().device(2, 1);
        bus.open("sim").await.unwrap();
        bus.assign_address(0, 0x1001).await.unwrap();
        let timeout = Duration::from_millis(10);
        // cannot jump states, nor run without a layout
        assert!(bus.request_state(0x1001, AlState::SafeOperational, timeout).await.is_err());
        bus.request_state(0x1001, AlState::PreOperational, timeout).await.unwrap();
        assert!(matches!(
            bus.request_state(0x1001, AlState::SafeOperational, timeout).await,
            Err(EthercatError::Slave(0x1001, AlError::InvalidDeviceSetup)),
            ));
        bus.load_mapping(0x1001, &layout(0x1001)).await.unwrap();
        bus.request_state(0x1001, AlState::SafeOperational, timeout).await.unwrap();
        bus.request_state(0x1001, AlState::Init, timeout).await.unwrap();
        assert_eq!(bus.state(0x1001), Some(AlState::Init));
    }

    #[tokio::test]
    async fn frame_exchange() {
        let bus = SimulatedBus::new()
            .device(2, 1)
            .input(0x1001, "in", "value", |exchange| (exchange as u16 * 10).to_le_bytes().to_vec())
            .fail_exchange(2, ExchangeFault::Partial(1));
        bus.open("sim").await.unwrap();
        bus.assign_address(0, 0x1001).await.unwrap();
        bus.load_mapping(0x1001, &layout(0x1001)).await.unwrap();
        for state in [AlState::PreOperational, AlState::SafeOperational] {
            bus.request_state(0x1001, state, Duration::from_millis(10)).await.unwrap();
        }

        let mut frame = [0, 0, 7];
        bus.send_frame(&frame.clone()).await.unwrap();
        assert_eq!(bus.receive_frame(&mut frame, Duration::from_millis(10)).await.unwrap(), 3);
        assert_eq!(frame, [10, 0, 7]);
        assert_eq!(bus.output(&SignalPath::new(0x1001, "out", "value")), Some(vec![7]));

        bus.send_frame(&frame.clone()).await.unwrap();
        assert_eq!(bus.receive_frame(&mut frame, Duration::from_millis(10)).await.unwrap(), 1);
        assert_eq!(bus.exchanges(), 2);
        assert!(matches!(bus.calls().last().map(|call| &call.kind), Some(CallKind::ReceiveFrame {exchange: 2})));
    }
}
