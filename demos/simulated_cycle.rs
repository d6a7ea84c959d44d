use std::{
    sync::Arc,
    error::Error,
    };
use core::time::Duration;
use ecmaster::{
    DescriptionCache, Master, MasterConfig, SignalPath, Value, CycleStatus,
    simulation::{SimulatedBus, ExchangeFault},
    };

const EK1100: &str = r#"
    name = "EK1100"
    vendor_id = 0x2
    product_code = 0x044c2c52
    "#;
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
const EL4102: &str = r#"
    name = "EL4102"
    vendor_id = 0x2
    product_code = 0x10063052

    [[groups]]
    name = "AO Outputs Ch.1"
    index = 0x1600
    direction = "Output"
    signals = [
        { name = "Analog output", index = 0x7000, sub_index = 1, bits = 16, data_type = "I16" },
    ]
    "#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut repository = DescriptionCache::new();
    for text in [EK1100, EL3102, EL4102] {
        repository.insert(DescriptionCache::parse(text)?);
    }

    // a coupler with an analog input sampling a sawtooth, and an analog output
    let bus = Arc::new(SimulatedBus::new()
        .device(0x2, 0x044c2c52)
        .child(0, 0x2, 0x0c1e3052)
        .child(0, 0x2, 0x10063052)
        .input(0x1002, "AI Inputs Ch.1", "Value", |cycle| (((cycle % 20) as i16 - 10) * 1000).to_le_bytes().to_vec())
        .latency(Duration::from_micros(300))
        .fail_exchange(12, ExchangeFault::Corrupt));

    let config = MasterConfig {
        period: Duration::from_millis(10),
        exchange_timeout: Duration::from_millis(2),
        .. MasterConfig::new("sim0")
        };
    let period = config.period;
    let mut master = Master::new(config, bus.clone(), Arc::new(repository));

    println!("scan");
    let topology = master.scan_topology().await?;
    for device in topology.iter() {
        println!("  0x{:04x}  {}", device.address(), device.description().map_or("?", |d| d.name.as_str()));
    }
    for signal in master.signals() {
        println!("  {:<40} {:?} at {}..{}", signal.path.to_string(), signal.data_type, signal.offset, signal.offset + signal.len);
    }
    master.configure().await?;
    master.start(period).await?;

    let input = master.signal(&"0x1002/AI Inputs Ch.1/Value".parse()?)?;
    let output = SignalPath::new(0x1003, "AO Outputs Ch.1", "Analog output");
    let mut reports = master.monitor().ok_or("no cyclic engine")?.subscribe();

    // copy the input to the output, halved
    for _ in 0 .. 30 {
        let report = reports.recv().await?;
        match &report.status {
            CycleStatus::Ok => {
                let value = master.get::<i16>(input)?;
                master.write_signal(&output, Value::I16(value / 2))?;
                println!("cycle {:>3}  input {:>6}  output {:?}", report.cycle, value, bus.output(&output));
            },
            status => println!("cycle {:>3}  {:?}", report.cycle, status.error()),
        }
    }

    master.stop().await?;
    println!("{:#?}", master.monitor().map(|monitor| monitor.stats()));
    Ok(())
}
