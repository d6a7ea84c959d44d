/*!
    A field-bus master discovering the devices of a segment, laying out their process data in one process image, and exchanging it cyclically.

    A session goes through
    - [topology] discovery of the devices in bus order
    - [binding] of each device to its [description]
    - [mapping] of every signal to its place in the [image]
    - loading of the layouts in the devices and startup, driven by [Master]
    - the [cyclic] exchange of the process image

    The physical transport is abstracted by the [Bus] trait, [simulation] provides an in-process implementation of it.
*/

pub mod error;
pub mod data;
pub mod bus;
pub mod description;
pub mod topology;
pub mod binding;
pub mod mapping;
pub mod image;
pub mod cyclic;
pub mod config;
pub mod master;
pub mod simulation;

pub use crate::error::{Error, Result, EthercatError, EthercatResult};
pub use crate::data::{PduData, DataType, Value};
pub use crate::bus::{Bus, AlState, AlError, DiscoveredDevice};
pub use crate::description::{DeviceDescription, DataGroup, Signal, Direction, Repository, DescriptionCache};
pub use crate::topology::{RawDevice, Topology};
pub use crate::mapping::{Mapping, MappedSignal, SignalPath, SignalHandle, DeviceLayout};
pub use crate::image::ProcessImage;
pub use crate::cyclic::{CancellationToken, CycleMonitor, CycleReport, CycleStatus, CycleStats};
pub use crate::config::MasterConfig;
pub use crate::master::{Master, MasterState};
pub use crate::simulation::SimulatedBus;
