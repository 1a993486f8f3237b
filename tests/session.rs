use std::{
    sync::Arc,
    time::Duration,
    };
use tokio::{
    io::DuplexStream,
    task::JoinHandle,
    time::Instant,
    };

use basik::{
    Error, Value, Session, Config,
    convert::ConversionError,
    registers::{CatalogError, Catalog, RegisterDescriptor, Kind},
    session::{TransportError, ExchangeState},
    simulator::{Simulator, Fault},
    telegram::Operation,
    };


type Module = JoinHandle<std::io::Result<Simulator>>;

fn config() -> Config {
    Config::default()
        .with_timeout(Duration::from_millis(100))
        .with_attempts(3)
}

/// session connected to a simulated module running in the background
fn connect(simulator: Simulator, config: Config) -> (Session<DuplexStream>, Module) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (host, module) = tokio::io::duplex(1024);
    (Session::new(host, config), tokio::spawn(simulator.run(module)))
}

/// close the session and get the simulated module back
async fn finish(session: Session<DuplexStream>, module: Module) -> Simulator {
    drop(session);
    module.await.expect("simulator panicked").expect("simulator failed")
}


#[tokio::test(start_paused = true)]
async fn read_and_write() {
    let (session, module) = connect(Simulator::basik(1), config());

    assert_eq!(session.read("WAVELENGTH_CENTER").await.unwrap(), Value::Float(1086.77));
    assert_eq!(session.read("TEMPERATURE").await.unwrap(), Value::Float(23.5));
    assert_eq!(session.read("EMISSION").await.unwrap(), Value::Tag("OFF".into()));
    assert_eq!(session.read("SERIAL_NUMBER").await.unwrap(), Value::Text("BK000042".into()));

    session.write("EMISSION", "ON").await.unwrap();
    session.write("WAVELENGTH_CENTER", 1064.5).await.unwrap();
    assert_eq!(session.read("emission").await.unwrap(), Value::Tag("ON".into()));
    assert_eq!(session.read("WAVELENGTH_CENTER").await.unwrap(), Value::Float(1064.5));
    assert_eq!(
        session.read("STATUS").await.unwrap(),
        Value::flags_of(["EMISSION", "WAVELENGTH_STABILIZED"]),
        );
    assert_eq!(session.state(), ExchangeState::Idle);

    let statistics = session.statistics().await;
    assert_eq!(statistics.exchanges, 9);
    assert_eq!(statistics.retries, 0);
    assert_eq!(statistics.failures, 0);

    let module = finish(session, module).await;
    assert_eq!(module.register(0x32), Some(&10_645_000u32.to_le_bytes()[..]));
    assert_eq!(module.requests().len(), 9);
}

#[tokio::test(start_paused = true)]
async fn write_encodes_scaled_wavelength() {
    let (session, module) = connect(Simulator::basik(1), config());
    session.write("WAVELENGTH_CENTER", 1086.77).await.unwrap();
    let module = finish(session, module).await;

    let request = &module.requests()[0];
    assert_eq!(request.operation, Operation::Write);
    assert_eq!(request.register, 0x32);
    assert_eq!(request.payload.as_slice(), &10_867_700u32.to_le_bytes());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_report_no_response() {
    let config = config().with_attempts(4);
    let (session, module) = connect(Simulator::basik(1).muted(), config.clone());

    let start = Instant::now();
    let error = session.read("WAVELENGTH_CENTER").await.unwrap_err();
    let elapsed = start.elapsed();
    assert!(matches!(error, Error::Transport(TransportError::NoResponse {address: 1, register: 0x32, attempts: 4})));
    assert!(elapsed >= 4 * config.timeout, "gave up too early after {:?}", elapsed);
    assert!(elapsed < 4 * config.timeout + Duration::from_millis(20), "gave up too late after {:?}", elapsed);

    let statistics = session.statistics().await;
    assert_eq!(statistics.timeouts, 4);
    assert_eq!(statistics.retries, 3);
    assert_eq!(statistics.failures, 1);
    assert_eq!(session.state(), ExchangeState::Idle);

    // every attempt sent the same frame
    let module = finish(session, module).await;
    assert_eq!(module.requests().len(), 4);
    assert!(module.requests().iter().all(|request| request == &module.requests()[0]));
}

#[tokio::test(start_paused = true)]
async fn corrupt_response_is_retried() {
    let simulator = Simulator::basik(1).with_fault(Fault::Corrupt);
    let (session, module) = connect(simulator, config());

    assert_eq!(session.read("WAVELENGTH_CENTER").await.unwrap(), Value::Float(1086.77));
    let statistics = session.statistics().await;
    assert_eq!(statistics.corrupt, 1);
    assert_eq!(statistics.retries, 1);
    assert_eq!(finish(session, module).await.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn persistent_corruption_reports_corrupt_response() {
    let simulator = Simulator::basik(1)
        .with_fault(Fault::Silent)
        .with_fault(Fault::Corrupt)
        .with_fault(Fault::Corrupt);
    let (session, module) = connect(simulator, config());

    // the last attempt decides the reported failure
    let error = session.read("TEMPERATURE").await.unwrap_err();
    assert!(matches!(error, Error::Transport(TransportError::CorruptResponse {register: 0x1C, attempts: 3, ..})));
    let statistics = session.statistics().await;
    assert_eq!(statistics.timeouts, 1);
    assert_eq!(statistics.corrupt, 2);

    // the next exchange is not affected
    assert_eq!(session.read("TEMPERATURE").await.unwrap(), Value::Float(23.5));
    finish(session, module).await;
}

#[tokio::test(start_paused = true)]
async fn stale_response_does_not_consume_retries() {
    // the module repeats the answer of an already resolved exchange before the expected one
    let simulator = Simulator::basik(1).with_fault(Fault::Stale(0x32));
    let (session, module) = connect(simulator, config());

    assert_eq!(session.read("TEMPERATURE").await.unwrap(), Value::Float(23.5));
    let statistics = session.statistics().await;
    assert_eq!(statistics.stale, 1);
    assert_eq!(statistics.retries, 0);
    assert_eq!(statistics.timeouts, 0);
    assert_eq!(finish(session, module).await.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn garbage_before_response_is_skipped() {
    let simulator = Simulator::basik(1).with_fault(Fault::Garbage(vec![0x00, 0xFF, 0x0A, 0x42]));
    let (session, module) = connect(simulator, config());
    assert_eq!(session.read("SUPPLY_VOLTAGE").await.unwrap(), Value::Float(12.0));
    assert_eq!(session.statistics().await.retries, 0);
    finish(session, module).await;
}

#[tokio::test(start_paused = true)]
async fn start_byte_in_garbage_is_skipped() {
    // the start delimiter in the noise cuts a fragment, the real answer follows in the same attempt
    let simulator = Simulator::basik(1).with_fault(Fault::Garbage(vec![0x0D, 0x42]));
    let (session, module) = connect(simulator, config().with_attempts(1));
    assert_eq!(session.read("SUPPLY_VOLTAGE").await.unwrap(), Value::Float(12.0));
    let statistics = session.statistics().await;
    assert_eq!(statistics.malformed, 1);
    assert_eq!((statistics.corrupt, statistics.retries, statistics.failures), (0, 0, 0));
    assert_eq!(finish(session, module).await.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn write_ignores_datagram_of_same_register() {
    let simulator = Simulator::basik(1).with_fault(Fault::Stale(0x30));
    let (session, module) = connect(simulator, config());
    session.write("EMISSION", "ON").await.unwrap();
    let statistics = session.statistics().await;
    assert_eq!((statistics.stale, statistics.retries), (1, 0));
    finish(session, module).await;

    // the datagram must not hide the refusal that follows it
    let simulator = Simulator::new(1)
        .with_register(0x30, &[0])
        .with_fault(Fault::Stale(0x30));
    let (session, module) = connect(simulator, config());
    let error = session.write("EMISSION", "ON").await.unwrap_err();
    assert!(matches!(error, Error::Transport(TransportError::Rejected {register: 0x30, ..})));
    assert_eq!(session.statistics().await.stale, 1);
    finish(session, module).await;
}

#[tokio::test(start_paused = true)]
async fn read_ignores_acknowledge_of_same_register() {
    let simulator = Simulator::basik(1).with_fault(Fault::Unexpected(Operation::Ack));
    let (session, module) = connect(simulator, config());
    assert_eq!(session.read("EMISSION").await.unwrap(), Value::Tag("OFF".into()));
    let statistics = session.statistics().await;
    assert_eq!((statistics.stale, statistics.retries), (1, 0));
    finish(session, module).await;
}

#[tokio::test(start_paused = true)]
async fn module_reporting_corrupt_requests() {
    let simulator = Simulator::basik(1).with_fault(Fault::CrcError);
    let (session, module) = connect(simulator, config());
    assert_eq!(session.read("WAVELENGTH_CENTER").await.unwrap(), Value::Float(1086.77));
    let statistics = session.statistics().await;
    assert_eq!((statistics.corrupt, statistics.retries), (1, 1));
    finish(session, module).await;

    let simulator = Simulator::basik(1)
        .with_fault(Fault::CrcError)
        .with_fault(Fault::CrcError)
        .with_fault(Fault::CrcError);
    let (session, module) = connect(simulator, config());
    let error = session.write("EMISSION", "ON").await.unwrap_err();
    assert!(matches!(error, Error::Transport(TransportError::CorruptResponse {register: 0x30, attempts: 3, ..})));
    let statistics = session.statistics().await;
    assert_eq!((statistics.corrupt, statistics.failures), (3, 1));
    assert_eq!(session.state(), ExchangeState::Idle);
    let module = finish(session, module).await;
    assert_eq!(module.requests().len(), 3);
    assert_eq!(module.register(0x30), Some(&[0][..]));
}

#[tokio::test(start_paused = true)]
async fn busy_module() {
    let simulator = Simulator::basik(1).with_fault(Fault::Busy);
    let (session, module) = connect(simulator, config());
    session.write("EMISSION", 1).await.unwrap();
    assert_eq!(session.statistics().await.retries, 1);
    finish(session, module).await;

    let simulator = Simulator::basik(1)
        .with_fault(Fault::Busy)
        .with_fault(Fault::Busy)
        .with_fault(Fault::Busy);
    let (session, module) = connect(simulator, config());
    let error = session.write("EMISSION", 1).await.unwrap_err();
    assert!(matches!(error, Error::Transport(TransportError::Busy {register: 0x30, attempts: 3, ..})));
    let module = finish(session, module).await;
    assert_eq!(module.register(0x30), Some(&[0][..]));
}

#[tokio::test(start_paused = true)]
async fn rejection_is_not_retried() {
    let (session, module) = connect(Simulator::basik(1), config());
    let error = session.request(0x01, Operation::Read, &[]).await.unwrap_err();
    assert!(matches!(error, TransportError::Rejected {address: 1, register: 0x01}));
    assert_eq!(session.statistics().await.retries, 0);
    assert_eq!(finish(session, module).await.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_values_never_reach_the_module() {
    let (session, module) = connect(Simulator::basik(1), config());

    let error = session.write("EMISSION", 2).await.unwrap_err();
    assert!(matches!(error, Error::Conversion(ConversionError::InvalidEnumValue {..})));
    let error = session.write("OUTPUT_POWER_SETPOINT_MW", -1.0).await.unwrap_err();
    assert!(matches!(error, Error::Conversion(ConversionError::OutOfRange {..})));
    let error = session.write("SETUP", Value::flags_of(["TURBO"])).await.unwrap_err();
    assert!(matches!(error, Error::Conversion(ConversionError::UnknownFlag {..})));
    let error = session.write("STATUS", Value::flags_of(["EMISSION"])).await.unwrap_err();
    assert!(matches!(error, Error::Catalog(CatalogError::ReadOnly("STATUS"))));
    let error = session.read("WAVELENGTH_PM").await.unwrap_err();
    assert!(matches!(error, Error::Catalog(CatalogError::UnknownRegister(_))));

    assert_eq!(session.statistics().await.exchanges, 0);
    assert!(finish(session, module).await.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn undeclared_enum_value_from_module() {
    let simulator = Simulator::basik(1).with_register(0x30, &[7]);
    let (session, module) = connect(simulator, config());
    let error = session.read("EMISSION").await.unwrap_err();
    assert!(matches!(error, Error::Conversion(ConversionError::ProtocolViolation {register: "EMISSION", ..})));
    finish(session, module).await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_callers_are_served_in_order() {
    let (session, module) = connect(Simulator::basik(1), config());
    let session = Arc::new(session);

    let mut tasks = Vec::new();
    for name in ["TEMPERATURE", "WAVELENGTH_CENTER", "STATUS", "NAME"] {
        let session = session.clone();
        tasks.push(tokio::spawn(async move { session.read(name).await }));
        // let the task take its place in the queue
        tokio::task::yield_now().await;
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let session = Arc::into_inner(session).unwrap();
    let module = finish(session, module).await;
    let order: Vec<u8> = module.requests().iter().map(|request| request.register).collect();
    assert_eq!(order, [0x1C, 0x32, 0x66, 0x8D]);
}

#[tokio::test(start_paused = true)]
async fn cancelled_request_frees_the_session() {
    let simulator = Simulator::basik(1).with_fault(Fault::Silent);
    let (session, module) = connect(simulator, config());

    let cancelled = tokio::time::timeout(Duration::from_millis(10), session.read("TEMPERATURE")).await;
    assert!(cancelled.is_err());
    assert_eq!(session.state(), ExchangeState::Idle);

    assert_eq!(session.read("TEMPERATURE").await.unwrap(), Value::Float(23.5));
    assert_eq!(session.statistics().await.retries, 0);
    finish(session, module).await;
}

#[tokio::test(start_paused = true)]
async fn lost_connection_until_reconnected() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (host, module) = tokio::io::duplex(1024);
    let session = Session::new(host, config());
    drop(module);

    let error = session.read("TEMPERATURE").await.unwrap_err();
    assert!(matches!(error, Error::Transport(TransportError::ConnectionLost(_))));
    assert!(!session.is_connected().await);
    let error = session.read("TEMPERATURE").await.unwrap_err();
    assert!(matches!(error, Error::Transport(TransportError::ConnectionLost(_))));

    let (host, module) = tokio::io::duplex(1024);
    let module = tokio::spawn(Simulator::basik(1).run(module));
    session.reconnect(host).await;
    assert!(session.is_connected().await);
    assert_eq!(session.read("TEMPERATURE").await.unwrap(), Value::Float(23.5));
    finish(session, module).await;
}

#[tokio::test(start_paused = true)]
async fn pinned_module_address() {
    static REGISTERS: [RegisterDescriptor; 2] = [
        RegisterDescriptor::signed("TEMPERATURE", 0x1C, 2, Kind::Float).scaled(1, 10).unit("°C"),
        RegisterDescriptor::signed("BOARD_TEMPERATURE", 0x1C, 2, Kind::Float).scaled(1, 10).unit("°C").at(2),
    ];
    // only module 2 is on the bus
    let simulator = Simulator::new(2).with_register(0x1C, &(-50i16).to_le_bytes());
    let (session, module) = connect(simulator, config().with_address(1).with_attempts(1));
    let session = session.with_catalog(Catalog::new("dual", &REGISTERS));

    assert_eq!(session.read("BOARD_TEMPERATURE").await.unwrap(), Value::Float(-5.0));
    let error = session.read("TEMPERATURE").await.unwrap_err();
    assert!(matches!(error, Error::Transport(TransportError::NoResponse {address: 1, register: 0x1C, attempts: 1})));

    let module = finish(session, module).await;
    assert_eq!(module.requests().len(), 1);
    assert_eq!(module.requests()[0].address, 2);
}
