use std::sync::Arc;
use std::time::Duration;

use renogy_ble::driver::{Controller, DataType, Inverter, RegisterEntry};
use renogy_ble::manager::{ConnectionManager, ConnectionManagerConfig};
use renogy_ble::mock::{MockDevice, MockReply, MockTransportFactory};
use renogy_ble::scheduler::{NextPoll, PollScheduler, SchedulerConfig};
use renogy_ble::{
    BackoffPolicy, ChannelBridge, DeviceProfile, DeviceRecord, ErrorClass, GatewayError, LogBridge, SensorValue,
};

const ADDRESS: &str = "AA:BB:CC:DD:EE:01";
const INVERTER_STATUS: [u16; 10] = [2301, 150, 1200, 80, 5000, 262, 0xfff6, 5000, 640, 120];

struct Harness {
    factory: Arc<MockTransportFactory>,
    manager: Arc<ConnectionManager>,
    scheduler: PollScheduler,
}

impl Harness {
    fn new(config: SchedulerConfig) -> Self {
        Self::with_manager(config, ConnectionManagerConfig::default())
    }

    fn with_manager(config: SchedulerConfig, manager_config: ConnectionManagerConfig) -> Self {
        let factory = Arc::new(MockTransportFactory::new());
        let manager = ConnectionManager::new(factory.clone(), manager_config);
        let scheduler = PollScheduler::new(manager.clone(), Arc::new(LogBridge), config);
        Self { factory, manager, scheduler }
    }

    fn device(&self) -> MockDevice {
        self.factory.device(ADDRESS)
    }
}

fn no_jitter() -> SchedulerConfig {
    SchedulerConfig { backoff: BackoffPolicy { jitter: false, ..Default::default() }, ..Default::default() }
}

fn inverter() -> DeviceRecord {
    DeviceRecord::new(ADDRESS, DeviceProfile::Inverter, Inverter::DEFAULT_UNIT_ID, Duration::from_secs(30))
}

fn number(value: &Option<SensorValue>) -> f64 {
    value.as_ref().and_then(SensorValue::as_f64).unwrap()
}

#[tokio::test(start_paused = true)]
async fn cold_poll_reads_every_inverter_value() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.set_registers(4000, &INVERTER_STATUS);

    let mut record = inverter();
    let (result, next) = harness.scheduler.poll_once(&mut record).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(next, NextPoll::After(Duration::from_secs(30)));
    assert_eq!(result.values.len(), 10);
    assert!(result.values.values().all(Option::is_some));
    assert!((number(&result.values["input_voltage"]) - 230.1).abs() < 1e-9);
    assert_eq!(number(&result.values["solar_power"]), 120.0);
    assert_eq!(device.opens(), 1);
    assert!(harness.manager.is_cached(ADDRESS).await);

    // The request went to the inverter's unit id.
    assert_eq!(device.writes()[0][0], Inverter::DEFAULT_UNIT_ID);
}

#[tokio::test(start_paused = true)]
async fn second_poll_reuses_the_session() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.set_registers(4000, &INVERTER_STATUS);

    let mut record = inverter();
    harness.scheduler.poll_once(&mut record).await;
    let (result, _) = harness.scheduler.poll_once(&mut record).await;

    assert!(result.is_success());
    assert_eq!(device.opens(), 1);
    assert_eq!(device.writes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn busy_device_is_retried_on_the_same_session() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.set_registers(4000, &INVERTER_STATUS);
    device.push_reply(MockReply::Exception(0x06));

    let mut record = inverter();
    let (result, _) = harness.scheduler.poll_once(&mut record).await;

    assert!(result.is_success());
    assert_eq!(device.opens(), 1);
    assert_eq!(device.closes(), 0);
    assert_eq!(device.writes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn busy_until_retries_run_out_keeps_the_session() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    for _ in 0..3 {
        device.push_reply(MockReply::Exception(0x05));
    }

    let mut record = inverter();
    let (result, next) = harness.scheduler.poll_once(&mut record).await;

    assert!(matches!(result.error, Some(GatewayError::DeviceBusy(_))));
    assert!(!result.offline);
    assert_eq!(next, NextPoll::After(Duration::from_secs(1)));
    assert_eq!(record.consecutive_failures, 1);
    assert_eq!(device.writes().len(), 3);
    assert_eq!(device.closes(), 0);
    assert!(harness.manager.is_cached(ADDRESS).await);
}

#[tokio::test(start_paused = true)]
async fn disconnect_mid_poll_invalidates_and_reconnects_next_time() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.set_registers(4000, &INVERTER_STATUS);
    device.push_reply(MockReply::Disconnect);

    let mut record = inverter();
    let (result, next) = harness.scheduler.poll_once(&mut record).await;
    assert!(matches!(result.error, Some(GatewayError::Disconnected(_))));
    assert_eq!(next, NextPoll::After(Duration::from_secs(1)));
    assert_eq!(device.closes(), 1);
    assert!(!harness.manager.is_cached(ADDRESS).await);

    let (result, next) = harness.scheduler.poll_once(&mut record).await;
    assert!(result.is_success());
    assert_eq!(next, NextPoll::After(Duration::from_secs(30)));
    assert_eq!(record.consecutive_failures, 0);
    assert_eq!(device.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn silent_device_times_out_and_backs_off() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.push_reply(MockReply::Silence);
    device.push_reply(MockReply::Silence);

    let mut record = inverter();
    let (result, next) = harness.scheduler.poll_once(&mut record).await;
    assert_eq!(result.error, Some(GatewayError::ResponseTimeout(Duration::from_secs(5))));
    assert_eq!(next, NextPoll::After(Duration::from_secs(1)));

    let (_, next) = harness.scheduler.poll_once(&mut record).await;
    assert_eq!(next, NextPoll::After(Duration::from_secs(2)));
    assert_eq!(record.consecutive_failures, 2);
    assert_eq!(device.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn missing_device_goes_offline() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.fail_connect(Some(GatewayError::DeviceNotFound(ADDRESS.into())));

    let mut record = inverter();
    let (result, next) = harness.scheduler.poll_once(&mut record).await;

    assert!(result.offline);
    assert_eq!(result.error.as_ref().map(GatewayError::class), Some(ErrorClass::Permanent));
    assert_eq!(next, NextPoll::Parked);
    assert!(result.values.is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_window_leaves_only_its_values_empty() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.set_registers(0x000C, &[0x524e, 0x472d, 0x4354, 0x524c, 0x2d52, 0x5652, 0x3430, 0x2020]);
    device.set_registers(0x0100, &[87, 132, 250]);
    device.set_registers(0x0120, &[0x8002]);
    // Windows are read in order, the second one is refused.
    device.push_reply(MockReply::Registers);
    device.push_reply(MockReply::Exception(0x02));

    let mut record = DeviceRecord::new(ADDRESS, DeviceProfile::Controller, Controller::DEFAULT_UNIT_ID, Duration::from_secs(30));
    let (result, next) = harness.scheduler.poll_once(&mut record).await;

    assert!(result.is_success());
    assert_eq!(next, NextPoll::After(Duration::from_secs(30)));
    assert_eq!(result.values["model"], Some(SensorValue::Text("RNG-CTRL-RVR40".into())));
    assert_eq!(result.values["battery_percentage"], None);
    assert_eq!(result.values["battery_voltage"], None);
    assert_eq!(result.values["load_on"], Some(SensorValue::Number(1.0)));
    assert_eq!(result.values["charging_state"], Some(SensorValue::Text("mppt".into())));
    assert_eq!(device.writes().len(), 5);
    assert_eq!(device.closes(), 0);
}

#[tokio::test(start_paused = true)]
async fn every_window_rejected_fails_the_poll() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    for _ in 0..5 {
        device.push_reply(MockReply::Exception(0x02));
    }

    let mut record = DeviceRecord::new(ADDRESS, DeviceProfile::Controller, Controller::DEFAULT_UNIT_ID, Duration::from_secs(30));
    let (result, next) = harness.scheduler.poll_once(&mut record).await;

    assert!(matches!(result.error, Some(GatewayError::ModbusException(_))));
    assert!(result.offline);
    assert_eq!(next, NextPoll::Parked);
}

#[tokio::test(start_paused = true)]
async fn fragmented_responses_decode_the_same() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.set_registers(4000, &INVERTER_STATUS);
    device.set_fragment_size(3);

    let mut record = inverter();
    let (result, _) = harness.scheduler.poll_once(&mut record).await;

    assert!(result.is_success(), "{:?}", result.error);
    assert!(result.values.values().all(Option::is_some));
    assert!((number(&result.values["temperature"]) + 1.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn stray_notifications_are_discarded() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.set_registers(4000, &INVERTER_STATUS);

    harness.manager.acquire(ADDRESS).await.unwrap();
    device.notify_unsolicited(&[0x20, 0x03, 0x02, 0x00]);

    let mut record = inverter();
    let (result, _) = harness.scheduler.poll_once(&mut record).await;
    assert!(result.is_success(), "{:?}", result.error);
}

#[tokio::test(start_paused = true)]
async fn generic_device_polls_its_register_map() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.set_registers(0x0010, &[1234, 0, 0, 7]);
    device.set_registers(0x0200, &[0xffff]);

    let register_map = vec![
        RegisterEntry::new(0x0010, 1, DataType::Uint16, 0.1, "voltage"),
        RegisterEntry::new(0x0013, 1, DataType::Uint16, 1.0, "mode"),
        RegisterEntry::new(0x0200, 1, DataType::Int16, 1.0, "offset"),
    ];
    let mut record = DeviceRecord::new(ADDRESS, DeviceProfile::GenericModbus { register_map }, 1, Duration::from_secs(10));
    let (result, _) = harness.scheduler.poll_once(&mut record).await;

    assert!(result.is_success());
    assert!((number(&result.values["voltage"]) - 123.4).abs() < 1e-9);
    assert_eq!(number(&result.values["mode"]), 7.0);
    assert_eq!(number(&result.values["offset"]), -1.0);
    // 0x0010..0x0013 share a window, 0x0200 is too far away.
    assert_eq!(device.writes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn scheduled_devices_publish_until_shutdown() {
    let factory = Arc::new(MockTransportFactory::new());
    let device = factory.device(ADDRESS);
    device.set_registers(4000, &INVERTER_STATUS);
    let manager = ConnectionManager::new(factory.clone(), ConnectionManagerConfig::default());
    let (bridge, mut results) = ChannelBridge::new(16);
    let scheduler = PollScheduler::new(manager.clone(), Arc::new(bridge), no_jitter());

    scheduler.add_device(inverter()).await;
    for _ in 0..3 {
        let result = results.recv().await.unwrap();
        assert_eq!(result.device_address, ADDRESS);
        assert!(result.is_success());
    }
    assert_eq!(device.opens(), 1);
    assert_eq!(scheduler.devices().await, vec![ADDRESS.to_string()]);

    scheduler.shutdown().await;
    assert!(scheduler.devices().await.is_empty());
    let writes = device.writes().len();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(device.writes().len(), writes);
}

#[tokio::test(start_paused = true)]
async fn removed_device_stops_polling_and_disconnects() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.set_registers(4000, &INVERTER_STATUS);

    harness.scheduler.add_device(inverter()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(device.writes().len(), 1);

    assert!(harness.scheduler.remove_device(ADDRESS).await);
    assert!(!harness.scheduler.remove_device(ADDRESS).await);
    assert_eq!(device.closes(), 1);
    assert!(!harness.manager.is_cached(ADDRESS).await);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(device.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn parked_device_does_not_block_shutdown() {
    let harness = Harness::new(no_jitter());
    harness.device().fail_connect(Some(GatewayError::AccessDenied(ADDRESS.into())));

    harness.scheduler.add_device(inverter()).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.device().opens(), 1);

    tokio::time::timeout(Duration::from_secs(1), harness.scheduler.shutdown())
        .await
        .expect("shutdown waits on a parked device");
}

#[tokio::test(start_paused = true)]
async fn corrupted_response_is_transient_and_reconnects() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    device.set_registers(4000, &INVERTER_STATUS);
    let mut corrupted = renogy_ble::frame::encode_read_response(Inverter::DEFAULT_UNIT_ID, &INVERTER_STATUS);
    corrupted[5] ^= 0x40;
    device.push_reply(MockReply::Frame(corrupted));

    let mut record = inverter();
    let (result, next) = harness.scheduler.poll_once(&mut record).await;
    assert_eq!(result.error, Some(GatewayError::InvalidFrame("CRC check failed")));
    assert!(!result.offline);
    assert_eq!(next, NextPoll::After(Duration::from_secs(1)));
    assert_eq!(device.closes(), 1);

    let (result, _) = harness.scheduler.poll_once(&mut record).await;
    assert!(result.is_success());
}

#[tokio::test(start_paused = true)]
async fn scripted_fragments_are_reassembled() {
    let harness = Harness::new(no_jitter());
    let device = harness.device();
    let frame = renogy_ble::frame::encode_read_response(Inverter::DEFAULT_UNIT_ID, &INVERTER_STATUS);
    device.push_reply(MockReply::Fragments(vec![frame[..1].to_vec(), frame[1..20].to_vec(), frame[20..].to_vec()]));

    let mut record = inverter();
    let (result, _) = harness.scheduler.poll_once(&mut record).await;
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(number(&result.values["load_power"]), 640.0);
}

#[tokio::test(start_paused = true)]
async fn slot_pressure_does_not_close_a_running_poll() {
    let manager_config = ConnectionManagerConfig { max_sessions: 2, ..Default::default() };
    let harness = Harness::with_manager(no_jitter(), manager_config);
    let device = harness.device();
    // The second window is answered with busy, the poll waits before retrying it.
    device.push_reply(MockReply::Registers);
    device.push_reply(MockReply::Exception(0x06));

    let mut record = DeviceRecord::new(ADDRESS, DeviceProfile::Controller, Controller::DEFAULT_UNIT_ID, Duration::from_secs(30));
    let other_devices = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        harness.manager.acquire("B").await.unwrap();
        harness.manager.acquire("C").await.unwrap();
    };
    let ((result, _), ()) = tokio::join!(harness.scheduler.poll_once(&mut record), other_devices);

    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(device.opens(), 1);
    assert_eq!(device.closes(), 0);
    assert_eq!(harness.factory.device("B").closes(), 1);
    assert!(harness.manager.is_cached(ADDRESS).await);
}
