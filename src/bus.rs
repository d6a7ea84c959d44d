/*!
    This module provide the trait [Bus], boundary between this master and the native bus-access layer.

    The master never builds frames itself: the bus implementor is responsible for assembling the frames, hiding the details of headers, checksums, working counters, and for driving the devices registers.
    From the master point of view, a bus provides

    - enumeration of the devices in physical order, and assignment of their station addresses
    - loading of the process image layout computed by [crate::mapping] into every device
    - device lifecycle transitions
    - one frame exchange: sending a frame, receiving its reply

    [crate::simulation::SimulatedBus] implements it in-process.
*/

use core::time::Duration;
use async_trait::async_trait;

use crate::{
    error::EthercatResult,
    mapping::DeviceLayout,
    };


/**
    device as reported by the bus enumeration, before any binding

    devices are listed in physical bus order, `position` being the index in that order
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveredDevice {
    /// index of the device in the physical order
    pub position: u16,
    /// position of the device this one is connected behind (like a coupler), `None` if directly on the segment
    pub parent: Option<u16>,
    pub vendor_id: u32,
    pub product_code: u32,
}

/**
    the current operation state on one device.

    Except [Self::Bootstrap], changing to any mode can be requested from any upper mode or from the preceding one.

    ETG.1000.6 table 9
*/
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AlState {
    /**
        Transitional state meaning the slave is booting up and ready for nothing yet. The slave should normally reach the [Self::Init] state within seconds.

        It cannot be requested, nor changed while it is active.
    */
    Bootstrap = 3,
    /**
        The init mode allows to set many communication registers, like the station address, the mailbox setup, etc.

        This is the idle state of a device for this master.
    */
    Init = 1,
    /// the pre operational mode allows mailbox communication, the process image layout is loaded before leaving it
    PreOperational = 2,
    /**
        Mode allowing realtime operations, except that commands sent to the slaves via its mapping will not be executed.

        Inputs are already refreshed in the process image, outputs are ignored.
    */
    SafeOperational = 4,
    /// Realtime operations running
    Operational = 8,
}
impl AlState {
    /// states crossed by a device brought up for cyclic exchange, in order
    pub const STARTUP: [AlState; 4] = [
        AlState::Init,
        AlState::PreOperational,
        AlState::SafeOperational,
        AlState::Operational,
        ];
    /// states crossed by a device brought back to idle from operation, in order
    pub const SHUTDOWN: [AlState; 3] = [
        AlState::SafeOperational,
        AlState::PreOperational,
        AlState::Init,
        ];
}
impl TryFrom<u8> for AlState {
    type Error = u8;
    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            1 => Ok(Self::Init),
            2 => Ok(Self::PreOperational),
            3 => Ok(Self::Bootstrap),
            4 => Ok(Self::SafeOperational),
            8 => Ok(Self::Operational),
            other => Err(other),
        }
    }
}

/// status code reported by a device refusing a state change, ETG.1000.6 table 11 (subset)
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum AlError {
    ///  No error Any Current state
    NoError = 0x0000,
    ///  Unspecified error
    #[default]
    Unspecified = 0x0001,
    ///  Invalid Device Setup
    InvalidDeviceSetup = 0x0003,
    ///  Invalid requested state change
    InvalidStateRequest = 0x0011,
    ///  Unknown requested state
    UnknownStateRequest = 0x0012,
    ///  Invalid sync manager configuration
    InvalidSyncConfig = 0x0017,
    ///  No valid inputs available
    NoInputsAvailable = 0x0018,
    ///  Sync manager watchdog
    SyncWatchdog = 0x001B,
    ///  Invalid Output Configuration
    InvalidOutputConfig = 0x001D,
    ///  Invalid Input Configuration
    InvalidInputConfig = 0x001E,
    ///  Invalid Input Mapping
    InvalidInputMapping = 0x0024,
    ///  Invalid Output Mapping
    InvalidOutputMapping = 0x0025,
}


/**
    trait implementing the access to a physical bus segment

    All methods take `&self`: implementors are shared between the configuration code and the cyclic engine thread, and handle their own internal synchronization. The master guarantees the cyclic frame exchange is never running concurrently with configuration calls.
*/
#[async_trait]
pub trait Bus: Send + Sync {
    /// bind to the given network interface, this must be called before anything else
    async fn open(&self, interface: &str) -> std::io::Result<()>;
    /// release the network interface, no other call is expected afterward
    async fn close(&self);

    /// list all devices answering on the segment, in physical order
    async fn enumerate(&self) -> EthercatResult<Vec<DiscoveredDevice>>;
    /// set the configured station address of the device at the given physical position
    async fn assign_address(&self, position: u16, address: u16) -> EthercatResult;
    /**
        load the process image layout of one device, so it reads its outputs and writes its inputs at the right place of the exchanged frame

        a device rejecting its layout (like a vendor constraint on data group size) reports a reason
    */
    async fn load_mapping(&self, address: u16, layout: &DeviceLayout) -> EthercatResult<(), String>;
    /// send a state change request to a device, and return once the device has switched or `timeout` elapsed
    async fn request_state(&self, address: u16, state: AlState, timeout: Duration) -> EthercatResult<(), AlError>;

    /**
        send one process data frame, containing the whole process image

        the devices read their outputs from it and write their inputs in it
    */
    async fn send_frame(&self, data: &[u8]) -> std::io::Result<()>;
    /**
        receive the reply to the last frame sent into the given buffer, returning the number of bytes received

        a reply not received within `timeout` is reported as [EthercatError::Timeout](crate::EthercatError::Timeout), a malformed reply as [EthercatError::Protocol](crate::EthercatError::Protocol)
    */
    async fn receive_frame(&self, data: &mut [u8], timeout: Duration) -> EthercatResult<usize>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes() {
        for state in AlState::STARTUP {
            assert_eq!(AlState::try_from(state as u8), Ok(state));
        }
        assert_eq!(AlState::try_from(3), Ok(AlState::Bootstrap));
        assert_eq!(AlState::try_from(5), Err(5));
    }
}
