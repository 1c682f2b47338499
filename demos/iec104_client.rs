use iec60870::command::CommandSpec;
use iec60870::common::{Cause, TypeId};
use iec60870::cs104::{Iec104Client, Iec104ClientConfig};
use iec60870::events::{ChannelSink, ControlEvent, EngineEvent};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// A simple IEC 60870-5-104 client that connects to a server, activates
/// the link, interrogates the station and prints what comes back.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (sink, mut events) = ChannelSink::new();
    let config = Iec104ClientConfig::new()
        .with_host("127.0.0.1") // Replace with your server address
        .with_port(2404)
        .with_client_id("demo-client")
        .with_reconnect_delay(Duration::from_secs(5))
        .with_max_retries(10);

    let client = Iec104Client::new(config, Arc::new(sink))?;
    client.connect().await?;
    println!("Connecting to 127.0.0.1:2404...");
    client.send_start_dt().await?;

    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Control {
                event, reason, ..
            } => {
                println!("control event: {event:?} ({reason})");
                match event {
                    ControlEvent::Activated => {
                        // Station interrogation, QOI 20.
                        client
                            .send_commands(vec![CommandSpec::new(
                                TypeId::InterrogationCommand,
                                0,
                                20i64,
                            )
                            .with_cause(Cause::Activation)])
                            .await?;
                        println!("station interrogation sent");

                        // And a single command with select-before-operate.
                        client
                            .send_commands(vec![
                                CommandSpec::new(TypeId::SingleCommand, 1000, true)
                                    .with_select(true),
                                CommandSpec::new(TypeId::SingleCommand, 1000, true),
                            ])
                            .await?;
                        println!("select + execute sent for IOA 1000");
                    }
                    ControlEvent::Failed => break,
                    _ => {}
                }
            }
            EngineEvent::Data { points, .. } => {
                for point in points {
                    println!(
                        "  data: {:?} ioa={} value={} quality={:#04x} ts={:?}",
                        point.type_id, point.ioa, point.value, point.quality, point.timestamp
                    );
                }
            }
            EngineEvent::Error { reason, .. } => {
                eprintln!("engine error: {reason}");
            }
        }
    }

    client.disconnect().await;
    Ok(())
}
