//! definition of the error types, from the transport level to the master session level

use std::sync::Arc;
use core::fmt;
use thiserror::Error;

use crate::{
    bus::{AlError, AlState},
    data::{DataType, PackingError},
    mapping::SignalPath,
    };

/**
    general object reporting an unexpected result from the bus transport

    Its variant are meant to help finding the cause responsible for the problem and how to deal with it.

    [Self::Slave] variant should not be used without an appropriate type for `T`, `T` depend on the operation the slave reports for, and is usually an error code, or a reason.
*/
#[derive(Clone, Debug)]
pub enum EthercatError<T=()> {
    /// error caused by communication support
    ///
    /// these errors are exterior to this library
    Io(Arc<std::io::Error>),

    /// error reported by a slave, its type depend on the operation returning this error
    ///
    /// these errors can generally be handled and fixed by retrying the operation or reconfiguring the slave
    Slave(u16, T),

    /// error reported by the master side of the transport
    Master(&'static str),

    /// error detected in the frames exchanged (bad checksum, malformed reply, unexpected working counter)
    ///
    /// these errors do not compromise the session but the data they carried is lost
    Protocol(&'static str),

    /// error is due to too much time elapsed, but does not compromise the communication
    ///
    /// these errors are generally contextual and the operation can be retried.
    Timeout(&'static str),
}

/// convenient alias to simplify return annotations
pub type EthercatResult<T=(), E=()> = core::result::Result<T, EthercatError<E>>;

impl<T: fmt::Debug> fmt::Display for EthercatError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(error) => write!(f, "io: {}", error),
            Self::Slave(address, value) => write!(f, "slave 0x{:04x}: {:?}", address, value),
            Self::Master(message) => write!(f, "master: {}", message),
            Self::Protocol(message) => write!(f, "protocol: {}", message),
            Self::Timeout(message) => write!(f, "timeout: {}", message),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for EthercatError<T> {}

impl<T> From<std::io::Error> for EthercatError<T> {
    fn from(src: std::io::Error) -> Self {
        EthercatError::Io(Arc::new(src))
    }
}

impl<E> EthercatError<E> {
    /// convert the error with a callback handling the case of slave-specific error
    pub fn map<F,T>(self, callback: F) -> EthercatError<T>
    where F: Fn(E) -> T
    {
        match self {
            EthercatError::Slave(address, value) => EthercatError::Slave(address, callback(value)),
            EthercatError::Io(e) => EthercatError::Io(e),
            EthercatError::Master(message) => EthercatError::Master(message),
            EthercatError::Protocol(message) => EthercatError::Protocol(message),
            EthercatError::Timeout(message) => EthercatError::Timeout(message),
        }
    }
}
impl EthercatError<()> {
    /// convert an error with no slave-specific type into an error with one
    pub fn upgrade<F: Default>(self) -> EthercatError<F> {
        self.map(|_|  F::default())
    }
}



/// the bus could not be enumerated
#[derive(Clone, Debug, Error)]
pub enum DiscoveryError {
    #[error("cannot open network interface {interface:?}: {reason}")]
    NoBusAccess {interface: String, reason: String},
    #[error("the bus answered but no device was enumerated")]
    NoDevicesFound,
    #[error("device at position {position} names parent {parent} which does not precede it")]
    InvalidTopology {position: u16, parent: u16},
    #[error("device at position {position} cannot be addressed from 0x{first_address:04x}, station addresses exhausted")]
    AddressSpaceExhausted {position: u16, first_address: u16},
    #[error("enumeration failed: {0}")]
    Bus(EthercatError),
}

/// a discovered device could not be given its data layout
#[derive(Clone, Debug, Error)]
pub enum BindingError {
    #[error("no description for device 0x{address:04x} (vendor 0x{vendor_id:08x}, product 0x{product_code:08x})")]
    UnknownDevice {address: u16, vendor_id: u32, product_code: u32},
    #[error("description {name:?} is invalid: {reason}")]
    InvalidDescription {name: String, reason: String},
}

/// the bound tree does not produce a valid process image
#[derive(Clone, Debug, Error)]
pub enum MappingError {
    #[error("no signal to map")]
    EmptyMapping,
    #[error("device 0x{0:04x} has no description bound")]
    Unbound(u16),
    #[error("signal {0} is mapped twice")]
    DuplicateSignal(SignalPath),
    #[error("signals {0} and {1} overlap in the process image")]
    Overlap(SignalPath, SignalPath),
    #[error("signal {path} ends at byte {end} outside of the {size} bytes image")]
    OutOfImage {path: SignalPath, end: usize, size: usize},
}

/// a device refused the session setup
#[derive(Clone, Debug, Error)]
pub enum ConfigurationError {
    #[error("device 0x{address:04x} rejected its mapping: {reason}")]
    Rejected {address: u16, reason: String},
    #[error("device 0x{address:04x} did not acknowledge {state:?} in time")]
    NotResponding {address: u16, state: AlState},
    #[error("device 0x{address:04x} refused {state:?}: {code:?}")]
    TransitionRefused {address: u16, state: AlState, code: AlError},
    #[error("bus failure during configuration: {0}")]
    Bus(EthercatError),
}

/// one process data exchange failed, the image was left untouched
#[derive(Clone, Debug, Error)]
pub enum CycleError {
    #[error("no reply before the exchange timeout")]
    Timeout,
    #[error("corrupted reply: {0}")]
    Corrupted(&'static str),
    #[error("partial reply: {received} bytes out of {expected}")]
    PartialReply {received: usize, expected: usize},
    #[error("transport failure: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<EthercatError> for CycleError {
    fn from(src: EthercatError) -> Self {
        match src {
            EthercatError::Io(error) => CycleError::Io(error),
            EthercatError::Timeout(_) => CycleError::Timeout,
            EthercatError::Protocol(message)
            | EthercatError::Master(message) => CycleError::Corrupted(message),
            EthercatError::Slave(_, ()) => CycleError::Corrupted("slave reported an error"),
        }
    }
}

/// a signal access could not be performed
#[derive(Clone, Debug, Error)]
pub enum AccessError {
    #[error("unknown signal {0}")]
    UnknownSignal(String),
    #[error("signal {path} holds {expected:?}, not {requested:?}")]
    TypeMismatch {path: SignalPath, expected: DataType, requested: DataType},
    #[error("cannot pack signal {path}: {reason:?}")]
    Packing {path: SignalPath, reason: PackingError},
}

/**
    session level error, returned by the [Master](crate::Master) operations

    Each variant is a category, deciding how the error propagates:
    startup categories abort the operation that raised them, cycle categories never abort anything.
*/
#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error("bus degraded: {consecutive} consecutive exchanges failed")]
    BusDegraded {consecutive: u32},
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("operation {operation} is not allowed in state {state:?}")]
    InvalidState {operation: &'static str, state: crate::master::MasterState},
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io: {0}")]
    Io(Arc<std::io::Error>),
}

impl Error {
    /// whether the session can go on after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Cycle(_) | Error::BusDegraded {..})
    }
}

impl From<std::io::Error> for Error {
    fn from(src: std::io::Error) -> Self {
        Error::Io(Arc::new(src))
    }
}

/// convenient alias for session level results
pub type Result<T=()> = core::result::Result<T, Error>;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_categories() {
        assert!(Error::from(CycleError::Timeout).is_recoverable());
        assert!(Error::BusDegraded {consecutive: 3}.is_recoverable());
        assert!(! Error::from(DiscoveryError::NoDevicesFound).is_recoverable());
        assert!(! Error::from(MappingError::EmptyMapping).is_recoverable());
        assert!(! Error::from(ConfigurationError::Rejected {address: 1, reason: "size".into()}).is_recoverable());
    }

    #[test]
    fn transport_errors_become_cycle_errors() {
        assert!(matches!(CycleError::from(EthercatError::Timeout("reply")), CycleError::Timeout));
        assert!(matches!(CycleError::from(EthercatError::Protocol("checksum")), CycleError::Corrupted("checksum")));
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged");
        assert!(matches!(CycleError::from(EthercatError::from(io)), CycleError::Io(_)));
    }

    #[test]
    fn display() {
        let error: EthercatError<&str> = EthercatError::Slave(0x1001, "too big");
        assert_eq!(error.to_string(), "slave 0x1001: \"too big\"");
        let error = Error::from(BindingError::UnknownDevice {address: 0x1002, vendor_id: 2, product_code: 0x044c2c52});
        assert_eq!(error.to_string(), "no description for device 0x1002 (vendor 0x00000002, product 0x044c2c52)");
    }
}
