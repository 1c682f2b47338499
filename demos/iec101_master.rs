use iec60870::command::CommandSpec;
use iec60870::common::{LinkLayerParameters, TypeId};
use iec60870::cs101::{Iec101MasterConfig, Iec101MasterUnbalanced};
use iec60870::events::{ChannelSink, ControlEvent, EngineEvent};
use iec60870::transport::TcpClientTransport;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// An IEC 60870-5-101 unbalanced master polling one slave through a
/// serial-to-ethernet gateway. With the `serial` feature enabled the
/// same code runs over `iec60870::transport::serial::SerialTransport`.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (sink, mut events) = ChannelSink::new();
    let config = Iec101MasterConfig {
        client_id: "demo-101-master".to_string(),
        link: LinkLayerParameters {
            address_length: 1,
            timeout_for_ack_ms: 1000,
            ..Default::default()
        },
        ..Default::default()
    };

    let master = Iec101MasterUnbalanced::new(config, Arc::new(sink))?;
    // Gateway in front of the serial line; adjust to your setup.
    let transport = TcpClientTransport::new("127.0.0.1", 20001, Duration::from_secs(5));
    master.connect(Box::new(transport)).await?;
    master.add_slave(1).await?;
    println!("Polling slave 1 via 127.0.0.1:20001...");

    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Control { event, reason, .. } => {
                println!("control event: {event:?} ({reason})");
                match event {
                    ControlEvent::Activated => {
                        // The master interrogates automatically on link
                        // bring-up; queue a clock sync as well.
                        let now_ms = std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)?
                            .as_millis() as i64;
                        master
                            .send_commands(
                                1,
                                vec![CommandSpec::new(TypeId::ClockSyncCommand, 0, now_ms)],
                            )
                            .await?;
                        println!("clock synchronization queued");
                    }
                    ControlEvent::Failed => break,
                    _ => {}
                }
            }
            EngineEvent::Data { points, .. } => {
                for point in points {
                    println!(
                        "  data: {:?} ioa={} value={} quality={:#04x}",
                        point.type_id, point.ioa, point.value, point.quality
                    );
                }
            }
            EngineEvent::Error { reason, .. } => {
                eprintln!("link error: {reason}");
            }
        }
    }

    master.disconnect().await;
    Ok(())
}
