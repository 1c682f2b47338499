use iec60870::command::CommandSpec;
use iec60870::common::{Cause, Quality, TypeId};
use iec60870::cs104::{Iec104Server, Iec104ServerConfig};
use iec60870::events::{ChannelSink, EngineEvent};
use std::error::Error;
use std::sync::Arc;

/// A simple IEC 60870-5-104 server that accepts connections, answers
/// station interrogations with a fixed point image and echoes received
/// commands as activation confirmations.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (sink, mut events) = ChannelSink::new();
    let config = Iec104ServerConfig::new()
        .with_bind("0.0.0.0", 2404)
        .with_server_id("demo-server");

    let server = Iec104Server::new(config, Arc::new(sink))?;
    server.start().await?;
    println!("Server listening on 0.0.0.0:2404, waiting for clients...");

    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Control {
                endpoint,
                event,
                reason,
            } => {
                println!("[{endpoint}] control event: {event:?} ({reason})");
            }
            EngineEvent::Data { endpoint, points } => {
                for point in &points {
                    println!(
                        "[{endpoint}] received: {:?} ioa={} value={}",
                        point.type_id, point.ioa, point.value
                    );
                }
                let Some(first) = points.first() else {
                    continue;
                };
                match first.type_id {
                    TypeId::InterrogationCommand => {
                        // Confirm, send the point image, terminate.
                        server
                            .send_commands(
                                &endpoint,
                                vec![CommandSpec::new(TypeId::InterrogationCommand, 0, 20i64)
                                    .with_cause(Cause::ActivationConfirmation)],
                            )
                            .await?;
                        server
                            .send_commands(
                                &endpoint,
                                vec![
                                    CommandSpec::new(TypeId::SinglePoint, 1001, true)
                                        .with_cause(Cause::InterrogatedByStation),
                                    CommandSpec::new(TypeId::SinglePoint, 1002, false)
                                        .with_cause(Cause::InterrogatedByStation),
                                    CommandSpec::new(TypeId::MeasuredShort, 2001, 230.5)
                                        .with_quality(Quality::GOOD)
                                        .with_cause(Cause::InterrogatedByStation),
                                ],
                            )
                            .await?;
                        server
                            .send_commands(
                                &endpoint,
                                vec![CommandSpec::new(TypeId::InterrogationCommand, 0, 20i64)
                                    .with_cause(Cause::ActivationTermination)],
                            )
                            .await?;
                        println!("[{endpoint}] interrogation answered");
                    }
                    TypeId::SingleCommand => {
                        // Mirror the command back as a confirmation.
                        let mut mirror = CommandSpec::new(
                            TypeId::SingleCommand,
                            first.ioa,
                            first.value >= 0.5,
                        )
                        .with_cause(Cause::ActivationConfirmation);
                        if let Some(select) = first.bsel_cmd {
                            mirror = mirror.with_select(select);
                        }
                        if let Some(ql) = first.ql {
                            mirror = mirror.with_ql(ql);
                        }
                        server.send_commands(&endpoint, vec![mirror]).await?;
                        println!("[{endpoint}] command confirmed");
                    }
                    _ => {}
                }
            }
            EngineEvent::Error { endpoint, reason } => {
                eprintln!("[{endpoint}] engine error: {reason}");
            }
        }
    }

    server.stop().await;
    Ok(())
}
