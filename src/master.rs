use core::time::Duration;
use std::sync::Arc;
use futures_concurrency::future::Join;

use crate::{
    binding,
    bus::{AlState, Bus},
    config::MasterConfig,
    cyclic::{CancellationToken, CycleMonitor, CyclicEngine, EngineHandle},
    data::{PduData, Value},
    description::{DescriptionCache, Repository},
    error::{AccessError, ConfigurationError, Error, Result},
    image::ProcessImage,
    mapping::{self, MappedSignal, Mapping, SignalHandle, SignalPath},
    topology::{self, Topology},
    EthercatError,
    };


/// step of a master session, sessions only move forward
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MasterState {
    /// nothing known about the segment yet
    Unconfigured,
    /// devices discovered, bound to their descriptions, and the process image laid out
    Mapped,
    /// every device received its process image layout
    Configured,
    /// devices operational and cyclic exchange running
    Operational,
    /// session ended, the bus is released
    Stopped,
}


/**
    This struct is the entry point of a master session, owning the device tree, the process image, the bus and the cyclic engine.

    ## Note

    The session goes through [MasterState] in order, each step being one method call. Calling a method in the wrong step is reported as [Error::InvalidState] and changes nothing. A step failing leaves the session in its previous state, so the step can be retried.

    State changes need exclusive access to the master, so none can happen while the cyclic engine is exchanging. Signal accesses only need shared access and can be done from any thread.

    Dropping the master only cancels the cyclic engine and waits for its end: devices are left in their current state and the bus stays open. [Self::stop] is the way to end a session.

    ## Example

    The following is the typical session

    ```ignore
    let mut master = Master::from_config(MasterConfig::load("master.toml")?, bus)?;
    master.scan_topology().await?;
    master.configure().await?;
    master.start(Duration::from_millis(1)).await?;

    let speed: SignalPath = "0x1002/Outputs/Target velocity".parse()?;
    master.write_signal(&speed, Value::I32(1200))?;
    // ...
    master.stop().await?;
    ```
*/
pub struct Master {
    config: MasterConfig,
    bus: Arc<dyn Bus>,
    repository: Arc<dyn Repository>,
    state: MasterState,
    topology: Topology,
    mapping: Option<Mapping>,
    image: Option<Arc<ProcessImage>>,
    token: CancellationToken,
    engine: Option<EngineHandle>,
    monitor: Option<CycleMonitor>,
}
impl Master {
    /// create a session on the given bus, resolving device descriptions with the given repository
    pub fn new(config: MasterConfig, bus: Arc<dyn Bus>, repository: Arc<dyn Repository>) -> Self {
        Self {
            config,
            bus,
            repository,
            state: MasterState::Unconfigured,
            topology: Topology::default(),
            mapping: None,
            image: None,
            token: CancellationToken::new(),
            engine: None,
            monitor: None,
        }
    }
    /// create a session on the given bus, loading device descriptions from the directory named in the configuration
    pub fn from_config(config: MasterConfig, bus: Arc<dyn Bus>) -> Result<Self> {
        config.validate()?;
        let repository = match &config.descriptions {
            Some(path) => DescriptionCache::load_dir(path)?,
            None => return Err(Error::Config("no description directory given".into())),
            };
        Ok(Self::new(config, bus, Arc::new(repository)))
    }

    pub fn config(&self) -> &MasterConfig  {&self.config}
    pub fn state(&self) -> MasterState  {self.state}
    /// devices discovered, empty before [Self::scan_topology]
    pub fn topology(&self) -> &Topology  {&self.topology}
    /// process image layout, once mapped
    pub fn mapping(&self) -> Option<&Mapping>  {self.mapping.as_ref()}
    /// all mapped signals, empty before [Self::scan_topology]
    pub fn signals(&self) -> &[MappedSignal] {
        self.mapping.as_ref().map_or(&[], |mapping| mapping.signals())
    }
    /**
        token stopping the cyclic engine at the end of its current exchange, [Self::stop] must still be called to end the session

        the same token is used for the whole session: a cancellation done before [Self::start] is cleared by it
    */
    pub fn cancellation(&self) -> CancellationToken  {self.token.clone()}
    /// cycle reports and statistics of the last cyclic engine started
    pub fn monitor(&self) -> Option<&CycleMonitor>  {self.monitor.as_ref()}
    /// `Err(BusDegraded)` while too many exchanges failed in a row
    pub fn health(&self) -> Result {
        match &self.monitor {
            Some(monitor) => monitor.health(),
            None => Ok(()),
        }
    }

    fn expect(&self, operation: &'static str, state: MasterState) -> Result {
        if self.state != state
            {return Err(Error::InvalidState {operation, state: self.state})}
        Ok(())
    }

    /**
        discover the devices on the configured interface, bind them to their descriptions, and lay out the process image

        on failure the interface is released and the session stays [MasterState::Unconfigured]
    */
    pub async fn scan_topology(&mut self) -> Result<&Topology> {
        self.expect("scan_topology", MasterState::Unconfigured)?;
        self.config.validate()?;

        let mut topology = topology::scan(self.bus.as_ref(), &self.config.interface, self.config.first_address).await?;
        let mapped = binding::bind(&mut topology, self.repository.as_ref())
            .map_err(Error::from)
            .and_then(|()|  mapping::map(&topology).map_err(Error::from));
        let mapping = match mapped {
            Ok(mapping) => mapping,
            Err(error) => {
                self.bus.close().await;
                return Err(error);
            },
        };

        self.image = Some(Arc::new(ProcessImage::new(mapping.size())));
        self.mapping = Some(mapping);
        self.topology = topology;
        self.state = MasterState::Mapped;
        Ok(&self.topology)
    }

    /**
        load its process image layout into every device, in traversal order

        on failure the session stays [MasterState::Mapped]
    */
    pub async fn configure(&mut self) -> Result {
        self.expect("configure", MasterState::Mapped)?;
        let Some(mapping) = &self.mapping
            else {return Err(Error::InvalidState {operation: "configure", state: self.state})};

        for address in self.topology.addresses() {
            let Some(layout) = mapping.layout(address)
                else {continue};
            self.bus.load_mapping(address, layout).await
                .map_err(|error|  match error {
                    EthercatError::Slave(address, reason) => ConfigurationError::Rejected {address, reason},
                    EthercatError::Timeout(_) => ConfigurationError::NotResponding {address, state: AlState::Init},
                    other => ConfigurationError::Bus(other.map(|_| ())),
                })?;
            log::debug!("device 0x{:04x} configured with {} entries", address, layout.entries.len());
        }
        log::info!("{} devices configured", self.topology.len());
        self.state = MasterState::Configured;
        Ok(())
    }

    /**
        bring every device to operation and start the cyclic exchange at the given period

        devices are switched to [AlState::SafeOperational] first, then the exchange is started so they receive process data before being switched to [AlState::Operational].
        On failure the exchange is stopped, every device is sent back to [AlState::Init] and the session stays [MasterState::Configured]
    */
    pub async fn start(&mut self, period: Duration) -> Result {
        self.expect("start", MasterState::Configured)?;
        self.config.validate_period(period)?;
        let (Some(mapping), Some(image)) = (&self.mapping, &self.image)
            else {return Err(Error::InvalidState {operation: "start", state: self.state})};
        let (inputs, image) = (mapping.input_ranges(), image.clone());
        // tokens given by [Self::cancellation] stay valid for the engine started now
        self.token.reset();

        for state in [AlState::Init, AlState::PreOperational, AlState::SafeOperational] {
            if let Err(error) = self.transition(state).await {
                self.rollback().await;
                return Err(error.into());
            }
        }

        let engine = CyclicEngine::new(
            self.bus.clone(),
            image,
            inputs,
            self.config.cycle(period),
            self.token.clone(),
            );
        self.monitor = Some(engine.monitor().clone());
        let engine = match engine.spawn() {
            Ok(engine) => engine,
            Err(error) => {
                self.rollback().await;
                return Err(error.into());
            },
        };

        if let Err(error) = self.transition(AlState::Operational).await {
            engine.stop().await;
            self.rollback().await;
            return Err(error.into());
        }
        self.engine = Some(engine);
        self.state = MasterState::Operational;
        log::info!("master operational, period {:?}", period);
        Ok(())
    }

    /**
        stop the cyclic exchange, bring every device back to [AlState::Init] and release the bus

        it returns once the exchange in progress is finished, no bus access is done after it returns.
        The session ends [MasterState::Stopped] even if a device did not follow, the first such failure being returned
    */
    pub async fn stop(&mut self) -> Result {
        self.expect("stop", MasterState::Operational)?;
        self.token.cancel();
        if let Some(engine) = self.engine.take() {
            let stats = engine.stop().await;
            log::debug!("cyclic statistics: {:?}", stats);
        }

        let mut result = Ok(());
        for state in AlState::SHUTDOWN {
            if let Err(error) = self.transition(state).await {
                log::warn!("shutdown: {}", error);
                if result.is_ok() {
                    result = Err(error.into());
                }
            }
        }
        self.bus.close().await;
        self.state = MasterState::Stopped;
        log::info!("master stopped");
        result
    }

    /// request the given state from all devices at once, waiting for all of them
    async fn transition(&self, state: AlState) -> core::result::Result<(), ConfigurationError> {
        let bus = self.bus.as_ref();
        let timeout = self.config.lifecycle_timeout;
        let results = self.topology.addresses().into_iter()
            .map(|address|  request_state(bus, address, state, timeout))
            .collect::<Vec<_>>()
            .join().await;
        log::debug!("devices switched to {:?}", state);
        results.into_iter().collect()
    }

    /// best effort return of every device to init, after a failed start
    async fn rollback(&mut self) {
        self.token.cancel();
        if let Err(error) = self.transition(AlState::Init).await {
            log::error!("rollback to init failed: {}", error);
        }
    }

    fn image(&self, operation: &'static str) -> Result<(&Mapping, &ProcessImage)> {
        match (&self.mapping, &self.image) {
            (Some(mapping), Some(image)) => Ok((mapping, image)),
            _ => Err(Error::InvalidState {operation, state: self.state}),
        }
    }
    fn slot(&self, operation: &'static str, handle: SignalHandle) -> Result<(&MappedSignal, &ProcessImage)> {
        let (mapping, image) = self.image(operation)?;
        let signal = mapping.get(handle)
            .ok_or_else(|| AccessError::UnknownSignal(format!("#{}", handle.index())))?;
        Ok((signal, image))
    }

    /// resolve a signal path once, for repeated accesses
    pub fn signal(&self, path: &SignalPath) -> Result<SignalHandle> {
        let (mapping, _) = self.image("signal")?;
        Ok(mapping.lookup(path)
            .ok_or_else(|| AccessError::UnknownSignal(path.to_string()))?)
    }
    /// current value of a signal in the process image
    pub fn read_signal(&self, path: &SignalPath) -> Result<Value> {
        self.read(self.signal(path)?)
    }
    /// write a value in the process image, sent to the device at the next cycle
    pub fn write_signal(&self, path: &SignalPath, value: Value) -> Result {
        self.write(self.signal(path)?, value)
    }
    pub fn read(&self, handle: SignalHandle) -> Result<Value> {
        let (signal, image) = self.slot("read", handle)?;
        Ok(image.read(signal)?)
    }
    pub fn write(&self, handle: SignalHandle, value: Value) -> Result {
        let (signal, image) = self.slot("write", handle)?;
        Ok(image.write(signal, &value)?)
    }
    /// typed read, `T` must match the signal data type
    pub fn get<T: PduData>(&self, handle: SignalHandle) -> Result<T> {
        let (signal, image) = self.slot("get", handle)?;
        Ok(image.get(signal)?)
    }
    /// typed write, `T` must match the signal data type
    pub fn set<T: PduData>(&self, handle: SignalHandle, value: T) -> Result {
        let (signal, image) = self.slot("set", handle)?;
        Ok(image.set(signal, value)?)
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            log::warn!("master dropped while operational, cyclic exchange cancelled");
            self.token.cancel();
            drop(engine);
        }
    }
}

/// request a state change from one device, bounded in time
async fn request_state(bus: &dyn Bus, address: u16, state: AlState, timeout: Duration) -> core::result::Result<(), ConfigurationError> {
    let result = tokio::time::timeout(timeout, bus.request_state(address, state, timeout)).await;
    match result {
        Ok(Ok(())) => Ok(()),
        Err(_) | Ok(Err(EthercatError::Timeout(_))) => {
            log::warn!("device 0x{:04x} did not reach {:?} within {:?}", address, state, timeout);
            Err(ConfigurationError::NotResponding {address, state})
        },
        Ok(Err(EthercatError::Slave(_, code))) => {
            log::warn!("device 0x{:04x} refused {:?}: {:?}", address, state, code);
            Err(ConfigurationError::TransitionRefused {address, state, code})
        },
        Ok(Err(other)) => Err(ConfigurationError::Bus(other.map(|_| ()))),
    }
}
