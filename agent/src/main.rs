//! Relay cabinet edge agent binary: loads config, opens the CAN bus and
//! drives the core's reactor ticks. JSON-RPC/MQTT wiring is out of scope
//! (see SPEC_FULL.md §1) — this binary only owns the core's own loops.

use clap::Parser;
use relaycore::can::socketcan_sink::SocketCanSink;
use relaycore::can::transport::ProcessLinkResetter;
use relaycore::clock::SystemClock;
use relaycore::config::CoreConfig;
use relaycore::context::{CoreContext, DeviceKind};
use relaycore::sensors::{LocalSensorConfig, MqttSensorConfig};
use relaycore::strategy::TimeOfDay;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the core config file (CAN interface, devices, groups, sensor wiring).
    #[arg(short, long)]
    filepath: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = CoreConfig::from_file(args.filepath);

    let clock: Arc<dyn relaycore::Clock> = Arc::new(SystemClock);
    let mut context = CoreContext::<SocketCanSink>::new(config.can_interface.clone(), clock);

    for device in &config.devices {
        if let Err(err) = context.add_device(device.node_id, DeviceKind::Relay) {
            tracing::error!(node_id = device.node_id, %err, "failed to register device");
        }
    }
    for group in &config.groups {
        if let Err(err) = context.create_group(group.group_id, group.name.clone()) {
            tracing::error!(group_id = group.group_id, %err, "failed to create group");
            continue;
        }
        for &node in &group.nodes {
            let _ = context.add_device_to_group(group.group_id, node);
        }
        for &key in &group.channels {
            let node = key / 256;
            let channel = (key % 256) as u8;
            if let Err(err) = context.add_channel_to_group(group.group_id, node, channel) {
                tracing::error!(group_id = group.group_id, node, channel, %err, "failed to wire group channel");
            }
        }
    }
    for sensor in &config.local_sensors {
        context.sensors_mut().register_local(LocalSensorConfig {
            sensor_id: sensor.sensor_id.clone(),
            node: sensor.node,
            channel: sensor.channel,
            scale: sensor.scale,
            offset: sensor.offset,
        });
    }
    for sensor in &config.mqtt_sensors {
        context.sensors_mut().register_mqtt(MqttSensorConfig {
            sensor_id: sensor.sensor_id.clone(),
            channel_id: sensor.channel_id.clone(),
            json_path: sensor.json_path.clone(),
        });
    }

    if let Err(err) = context.open_bus() {
        tracing::error!(%err, "failed to open CAN bus at startup; continuing with bus down");
    }

    let context = Arc::new(Mutex::new(context));

    let tx_pump = {
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            let resetter = ProcessLinkResetter;
            let mut ticker = interval(Duration::from_millis(relaycore::can::TX_INTERVAL_MS));
            loop {
                ticker.tick().await;
                let needs_reset = context.lock().await.tx_pump_tick();
                if needs_reset {
                    if let Err(err) = context.lock().await.maybe_reset_interface(&resetter).await {
                        tracing::error!(%err, "CAN interface reset failed");
                    }
                }
            }
        })
    };

    let rx_pump = {
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(relaycore::can::TX_INTERVAL_MS));
            loop {
                ticker.tick().await;
                let frames = context.lock().await.drain_inbound();
                if frames.is_empty() {
                    continue;
                }
                let mut guard = context.lock().await;
                for frame in &frames {
                    guard.on_frame(frame);
                }
            }
        })
    };

    let queue_pump = {
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(10));
            loop {
                ticker.tick().await;
                context.lock().await.process_queue_tick();
            }
        })
    };

    let strategy_pump = {
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let now = chrono::Local::now();
                let time_of_day = TimeOfDay {
                    hour: now.format("%H").to_string().parse().unwrap_or(0),
                    minute: now.format("%M").to_string().parse().unwrap_or(0),
                };
                context.lock().await.evaluate_strategies_tick(time_of_day);
            }
        })
    };

    let _ = tokio::join!(tx_pump, rx_pump, queue_pump, strategy_pump);
}
