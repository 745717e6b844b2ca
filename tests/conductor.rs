use chrono::Utc;
use meditation_conductor::ingest::handle_datagram;
use meditation_conductor::osc::{encode_band, encode_bundle, encode_message, OscArg, BLINK_ADDR};
use meditation_conductor::{
    Band, BroadcastBus, ChannelInput, Conductor, ConductorConfig, CycleReport, TransitionSource,
    STATE_SLOT,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn local_config() -> ConductorConfig {
    ConductorConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..ConductorConfig::default()
    }
}

fn alpha_datagram(rng: &mut fastrand::Rng, base: f32) -> Vec<u8> {
    let v = base + (rng.f32() - 0.5) * 0.02;
    encode_band(Band::Alpha, [0.0, v, v, 0.0])
}

async fn next<T: Clone>(rx: &mut broadcast::Receiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("bus closed")
}

#[test]
fn rising_alpha_moves_level_from_one_to_two() {
    let bus = BroadcastBus::new(64);
    let mut states = bus.subscribe_state();
    let conductor = Conductor::new(local_config(), Arc::new(bus)).unwrap();

    conductor.machine().announce(Utc::now());

    let mut rng = fastrand::Rng::with_seed(21);
    for i in 0..300 {
        let base = if i < 240 { 0.5 } else { 0.8 };
        assert!(handle_datagram(conductor.state(), &alpha_datagram(&mut rng, base)));
    }
    assert_eq!(conductor.state().history_len(), 300);

    let report = conductor.forecaster().run_cycle(Utc::now());
    assert!(matches!(report, CycleReport::Evaluated { .. }), "{report:?}");

    let startup = states.try_recv().unwrap();
    assert_eq!(startup.source, TransitionSource::Startup);
    assert_eq!(startup.level.get(), 1);

    let forecast = states.try_recv().unwrap();
    assert_eq!(forecast.source, TransitionSource::Forecast);
    assert_eq!(forecast.level.get(), 2);

    assert!(states.try_recv().is_err());
}

#[test]
fn nan_channel_does_not_block_the_forecast() {
    let bus = BroadcastBus::new(64);
    let mut states = bus.subscribe_state();
    let conductor = Conductor::new(local_config(), Arc::new(bus)).unwrap();

    let mut rng = fastrand::Rng::with_seed(21);
    for i in 0..300 {
        let base = if i < 240 { 0.5 } else { 0.8 };
        handle_datagram(conductor.state(), &alpha_datagram(&mut rng, base));
        if i == 100 {
            handle_datagram(conductor.state(), &encode_band(Band::Alpha, [0.5, f32::NAN, 0.5, 0.5]));
        }
    }
    assert!(conductor.state().history_snapshot().iter().all(|v| v.is_finite()));

    let report = conductor.forecaster().run_cycle(Utc::now());
    assert!(matches!(report, CycleReport::Evaluated { .. }), "{report:?}");
    assert_eq!(conductor.machine().level().get(), 2);
    assert_eq!(states.try_recv().unwrap().source, TransitionSource::Forecast);
}

#[test]
fn short_history_leaves_level_alone() {
    let bus = BroadcastBus::new(16);
    let mut states = bus.subscribe_state();
    let conductor = Conductor::new(local_config(), Arc::new(bus)).unwrap();

    let mut rng = fastrand::Rng::with_seed(5);
    for _ in 0..20 {
        handle_datagram(conductor.state(), &alpha_datagram(&mut rng, 0.5));
    }
    handle_datagram(conductor.state(), &encode_message(BLINK_ADDR, &[OscArg::Int(1)]));

    let report = conductor.forecaster().run_cycle(Utc::now());
    assert!(matches!(report, CycleReport::Skipped(_)));
    assert_eq!(conductor.machine().level().get(), 1);
    assert_eq!(conductor.state().blink_count(), 1);
    assert!(states.try_recv().is_err());
}

#[test]
fn bundle_applies_first_element_only() {
    let conductor = Conductor::new(local_config(), Arc::new(BroadcastBus::default())).unwrap();
    let bundle = encode_bundle(&[
        encode_band(Band::Theta, [0.25; 4]),
        encode_band(Band::Beta, [0.75; 4]),
    ]);

    assert!(handle_datagram(conductor.state(), &bundle));
    let raw = conductor.state().raw_snapshot();
    assert_eq!(raw.band(Band::Theta), [0.25; 4]);
    assert_eq!(raw.band(Band::Beta), [0.0; 4]);
}

#[test]
fn invalid_config_is_rejected() {
    let config = ConductorConfig {
        upper_threshold: -0.5,
        ..local_config()
    };
    assert!(Conductor::new(config, Arc::new(BroadcastBus::default())).is_err());
}

#[tokio::test]
async fn running_conductor_ingests_publishes_and_stops() {
    let bus = BroadcastBus::new(256);
    let mut states = bus.subscribe_state();
    let mut telemetry = bus.subscribe_telemetry();

    let config = ConductorConfig {
        telemetry_period_ms: 20,
        ..local_config()
    };
    let mut conductor = Conductor::new(config, Arc::new(bus)).unwrap();
    let addr = conductor.start().await.unwrap();
    assert_eq!(conductor.local_addr(), Some(addr));

    let startup = next(&mut states).await;
    assert_eq!(startup.source, TransitionSource::Startup);
    assert_eq!(startup.level.get(), 1);

    let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    sender.send_to(&encode_band(Band::Alpha, [0.1, 0.2, 0.4, 0.1]), addr).unwrap();
    sender.send_to(&encode_message(BLINK_ADDR, &[OscArg::Int(1)]), addr).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while conductor.state().blink_count() < 1 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(conductor.state().history_len(), 1);
    assert_eq!(conductor.state().blink_count(), 1);

    let event = loop {
        let event = next(&mut telemetry).await;
        if event.values.blink_count() >= 1.0 {
            break event;
        }
    };
    assert_eq!(event.values.as_slice()[STATE_SLOT], 1.0);
    assert_eq!(event.values.band(Band::Alpha), [0.1f32 as f64, 0.2f32 as f64, 0.4f32 as f64, 0.1f32 as f64]);

    conductor.shutdown();
    timeout(Duration::from_secs(2), conductor.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn keyboard_override_reaches_the_bus() {
    let bus = BroadcastBus::new(64);
    let mut states = bus.subscribe_state();
    let (keys, input) = ChannelInput::pair();

    let config = ConductorConfig {
        override_poll_period_ms: 5,
        ..local_config()
    };
    let mut conductor = Conductor::new(config, Arc::new(bus)).unwrap().with_control_input(input);
    conductor.start().await.unwrap();
    assert_eq!(next(&mut states).await.source, TransitionSource::Startup);

    keys.send('4').unwrap();
    let event = next(&mut states).await;
    assert_eq!(event.source, TransitionSource::Manual);
    assert_eq!(event.level.get(), 4);
    assert_eq!(conductor.machine().level().get(), 4);

    conductor.shutdown();
    timeout(Duration::from_secs(2), conductor.join()).await.unwrap().unwrap();
}

#[tokio::test]
async fn second_start_is_refused() {
    let mut conductor = Conductor::new(local_config(), Arc::new(BroadcastBus::default())).unwrap();
    conductor.start().await.unwrap();
    assert!(conductor.start().await.is_err());

    conductor.shutdown();
    timeout(Duration::from_secs(2), conductor.join()).await.unwrap().unwrap();
}
