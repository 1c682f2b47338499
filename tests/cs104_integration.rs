//! End-to-end CS104 exchanges between the client and server roles over
//! localhost TCP.

use std::sync::Arc;
use std::time::Duration;

use iec60870::command::CommandSpec;
use iec60870::common::{ApciParameters, Cause, TypeId};
use iec60870::cs104::{
    Iec104Client, Iec104ClientConfig, Iec104Server, Iec104ServerConfig, ServerMode,
};
use iec60870::events::{ChannelSink, ControlEvent, EngineEvent};
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(10);

/// Pull events until one matches, failing the test on timeout.
async fn wait_for<F>(rx: &mut UnboundedReceiver<EngineEvent>, what: &str, mut pred: F) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

fn is_control(event: &EngineEvent, wanted: ControlEvent) -> bool {
    matches!(event, EngineEvent::Control { event, .. } if *event == wanted)
}

async fn start_server(config: Iec104ServerConfig) -> (Iec104Server, UnboundedReceiver<EngineEvent>) {
    let (sink, rx) = ChannelSink::new();
    let server = Iec104Server::new(config, Arc::new(sink)).unwrap();
    server.start().await.unwrap();
    (server, rx)
}

async fn connect_client(
    port: u16,
    config: Iec104ClientConfig,
) -> (Iec104Client, UnboundedReceiver<EngineEvent>) {
    let (sink, rx) = ChannelSink::new();
    let client = Iec104Client::new(config.with_host("127.0.0.1").with_port(port), Arc::new(sink))
        .unwrap();
    client.connect().await.unwrap();
    (client, rx)
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn startdt_handshake_activates_both_sides() {
    let port = free_port();
    let (server, mut server_events) =
        start_server(Iec104ServerConfig::default().with_bind("127.0.0.1", port)).await;
    let (client, mut client_events) = connect_client(port, Iec104ClientConfig::default()).await;

    wait_for(&mut client_events, "client opened", |e| {
        is_control(e, ControlEvent::Opened)
    })
    .await;
    client.send_start_dt().await.unwrap();

    wait_for(&mut client_events, "client activated", |e| {
        is_control(e, ControlEvent::Activated)
    })
    .await;
    wait_for(&mut server_events, "server-side activation", |e| {
        is_control(e, ControlEvent::Activated)
    })
    .await;

    let status = client.get_status().await;
    assert!(status.connected);
    assert!(status.activated);

    let server_status = server.get_status().await;
    assert_eq!(server_status.connections.len(), 1);
    assert!(server_status.connections[0].activated);

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn interrogation_round_trip_delivers_batches() {
    let port = free_port();
    let (server, mut server_events) =
        start_server(Iec104ServerConfig::default().with_bind("127.0.0.1", port)).await;
    let (client, mut client_events) = connect_client(port, Iec104ClientConfig::default()).await;

    wait_for(&mut client_events, "client opened", |e| {
        is_control(e, ControlEvent::Opened)
    })
    .await;
    client.send_start_dt().await.unwrap();
    wait_for(&mut client_events, "client activated", |e| {
        is_control(e, ControlEvent::Activated)
    })
    .await;

    // Station interrogation, QOI 20, COT activation.
    client
        .send_commands(vec![CommandSpec::new(TypeId::InterrogationCommand, 0, 20i64)
            .with_cause(Cause::Activation)])
        .await
        .unwrap();

    // The server host sees the interrogation request.
    let event = wait_for(&mut server_events, "interrogation at server", |e| {
        matches!(e, EngineEvent::Data { points, .. }
            if points.iter().any(|p| p.type_id == TypeId::InterrogationCommand))
    })
    .await;
    let client_id = match &event {
        EngineEvent::Data { endpoint, points } => {
            assert_eq!(points[0].value, 20.0);
            endpoint.clone()
        }
        _ => unreachable!(),
    };

    // Host answers: confirmation, a batch of points, termination.
    server
        .send_commands(
            &client_id,
            vec![CommandSpec::new(TypeId::InterrogationCommand, 0, 20i64)
                .with_cause(Cause::ActivationConfirmation)],
        )
        .await
        .unwrap();
    server
        .send_commands(
            &client_id,
            vec![
                CommandSpec::new(TypeId::SinglePoint, 1001, true)
                    .with_cause(Cause::InterrogatedByStation),
                CommandSpec::new(TypeId::SinglePoint, 1002, false)
                    .with_cause(Cause::InterrogatedByStation),
                CommandSpec::new(TypeId::MeasuredScaled, 2001, 75i64)
                    .with_cause(Cause::InterrogatedByStation),
            ],
        )
        .await
        .unwrap();
    server
        .send_commands(
            &client_id,
            vec![CommandSpec::new(TypeId::InterrogationCommand, 0, 20i64)
                .with_cause(Cause::ActivationTermination)],
        )
        .await
        .unwrap();

    // The client host receives the monitoring batch, grouped per type.
    let event = wait_for(&mut client_events, "single points at client", |e| {
        matches!(e, EngineEvent::Data { points, .. }
            if points.iter().any(|p| p.type_id == TypeId::SinglePoint))
    })
    .await;
    match event {
        EngineEvent::Data { points, .. } => {
            assert_eq!(points.len(), 2);
            assert_eq!(points[0].ioa, 1001);
            assert_eq!(points[0].value, 1.0);
            assert_eq!(points[1].ioa, 1002);
            assert_eq!(points[1].value, 0.0);
        }
        _ => unreachable!(),
    }
    wait_for(&mut client_events, "measured value at client", |e| {
        matches!(e, EngineEvent::Data { points, .. }
            if points.iter().any(|p| p.type_id == TypeId::MeasuredScaled && p.value == 75.0))
    })
    .await;

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn select_before_operate_preserves_order() {
    let port = free_port();
    let (server, mut server_events) =
        start_server(Iec104ServerConfig::default().with_bind("127.0.0.1", port)).await;
    let (client, mut client_events) = connect_client(port, Iec104ClientConfig::default()).await;

    wait_for(&mut client_events, "client opened", |e| {
        is_control(e, ControlEvent::Opened)
    })
    .await;
    client.send_start_dt().await.unwrap();
    wait_for(&mut client_events, "client activated", |e| {
        is_control(e, ControlEvent::Activated)
    })
    .await;

    // Select, then execute, in one call.
    client
        .send_commands(vec![
            CommandSpec::new(TypeId::SingleCommand, 1000, true).with_select(true),
            CommandSpec::new(TypeId::SingleCommand, 1000, true).with_select(false),
        ])
        .await
        .unwrap();

    let first = wait_for(&mut server_events, "select at server", |e| {
        matches!(e, EngineEvent::Data { points, .. }
            if points.iter().any(|p| p.type_id == TypeId::SingleCommand))
    })
    .await;
    match first {
        EngineEvent::Data { points, .. } => {
            assert_eq!(points[0].ioa, 1000);
            assert_eq!(points[0].bsel_cmd, Some(true));
            assert_eq!(points[0].ql, Some(0));
        }
        _ => unreachable!(),
    }
    let second = wait_for(&mut server_events, "execute at server", |e| {
        matches!(e, EngineEvent::Data { points, .. }
            if points.iter().any(|p| p.type_id == TypeId::SingleCommand))
    })
    .await;
    match second {
        EngineEvent::Data { points, .. } => {
            assert_eq!(points[0].bsel_cmd, Some(false));
        }
        _ => unreachable!(),
    }

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn reconnect_loop_after_server_goes_away() {
    let port = free_port();
    let (server, _server_events) =
        start_server(Iec104ServerConfig::default().with_bind("127.0.0.1", port)).await;

    let config = Iec104ClientConfig::default()
        .with_reconnect_delay(Duration::from_secs(1))
        .with_max_retries(2);
    let (client, mut client_events) = connect_client(port, config).await;

    wait_for(&mut client_events, "client opened", |e| {
        is_control(e, ControlEvent::Opened)
    })
    .await;

    // Kill the server mid-session.
    server.stop().await;

    wait_for(&mut client_events, "connection closed", |e| {
        is_control(e, ControlEvent::Closed)
    })
    .await;
    let event = wait_for(&mut client_events, "first reconnect attempt", |e| {
        is_control(e, ControlEvent::Reconnecting)
    })
    .await;
    match event {
        EngineEvent::Control { reason, .. } => assert_eq!(reason, "attempt 1 of 2"),
        _ => unreachable!(),
    }

    // Nothing is listening any more: the loop runs out of attempts.
    wait_for(&mut client_events, "reconnect exhaustion", |e| {
        is_control(e, ControlEvent::Failed)
    })
    .await;

    client.disconnect().await;
}

#[tokio::test]
async fn redundant_group_allows_one_activation_at_a_time() {
    let port = free_port();
    let config = Iec104ServerConfig::default()
        .with_bind("127.0.0.1", port)
        .with_mode(ServerMode::Redundant)
        .with_group("G", vec!["127.0.0.1".parse().unwrap()]);
    let (server, _server_events) = start_server(config).await;

    let (client_a, mut events_a) = connect_client(port, Iec104ClientConfig::default()).await;
    wait_for(&mut events_a, "A opened", |e| is_control(e, ControlEvent::Opened)).await;
    client_a.send_start_dt().await.unwrap();
    wait_for(&mut events_a, "A activated", |e| {
        is_control(e, ControlEvent::Activated)
    })
    .await;

    let (client_b, mut events_b) = connect_client(port, Iec104ClientConfig::default()).await;
    wait_for(&mut events_b, "B opened", |e| is_control(e, ControlEvent::Opened)).await;
    client_b.send_start_dt().await.unwrap();

    // B must stay deactivated while A holds the group.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!client_b.get_status().await.activated);
    let status = server.get_status().await;
    let activated: Vec<_> = status.connections.iter().filter(|c| c.activated).collect();
    assert_eq!(activated.len(), 1);

    // A releases; the server hands the group to B.
    client_a.send_stop_dt().await.unwrap();
    wait_for(&mut events_a, "A deactivated", |e| {
        is_control(e, ControlEvent::Deactivated)
    })
    .await;
    wait_for(&mut events_b, "B activated after handover", |e| {
        is_control(e, ControlEvent::Activated)
    })
    .await;

    let status = server.get_status().await;
    let activated: Vec<_> = status.connections.iter().filter(|c| c.activated).collect();
    assert_eq!(activated.len(), 1);
    assert!(client_b.get_status().await.activated);
    assert!(!client_a.get_status().await.activated);

    client_a.disconnect().await;
    client_b.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn commands_to_unactivated_connection_fail_synchronously() {
    let port = free_port();
    let (server, mut server_events) =
        start_server(Iec104ServerConfig::default().with_bind("127.0.0.1", port)).await;
    let (client, mut client_events) = connect_client(port, Iec104ClientConfig::default()).await;

    wait_for(&mut client_events, "client opened", |e| {
        is_control(e, ControlEvent::Opened)
    })
    .await;

    // The client is connected but not activated.
    let err = client
        .send_commands(vec![CommandSpec::new(TypeId::SingleCommand, 1, true)])
        .await;
    assert!(matches!(err, Err(iec60870::Iec60870Error::NotActivated)));

    // Same rule server-side.
    let opened = wait_for(&mut server_events, "server saw the peer", |e| {
        is_control(e, ControlEvent::Opened)
    })
    .await;
    let client_id = match opened {
        EngineEvent::Control { endpoint, .. } => endpoint,
        _ => unreachable!(),
    };
    let err = server
        .send_commands(
            &client_id,
            vec![CommandSpec::new(TypeId::SinglePoint, 1, true)],
        )
        .await;
    assert!(matches!(err, Err(iec60870::Iec60870Error::NotActivated)));

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn apci_parameters_flow_through_the_window() {
    // A small k with many commands forces the window logic to throttle.
    let port = free_port();
    let apci = ApciParameters {
        k: 2,
        w: 1,
        ..Default::default()
    };
    let (server, mut server_events) = start_server(
        Iec104ServerConfig::default()
            .with_bind("127.0.0.1", port)
            .with_apci(apci),
    )
    .await;
    let (client, mut client_events) =
        connect_client(port, Iec104ClientConfig::default().with_apci(apci)).await;

    wait_for(&mut client_events, "client opened", |e| {
        is_control(e, ControlEvent::Opened)
    })
    .await;
    client.send_start_dt().await.unwrap();
    wait_for(&mut client_events, "client activated", |e| {
        is_control(e, ControlEvent::Activated)
    })
    .await;

    let commands: Vec<_> = (0..10)
        .map(|i| CommandSpec::new(TypeId::SetpointScaled, 4000 + i, i as i64))
        .collect();
    client.send_commands(commands).await.unwrap();

    // All ten arrive, in submission order.
    let mut seen = Vec::new();
    while seen.len() < 10 {
        let event = wait_for(&mut server_events, "setpoint batch", |e| {
            matches!(e, EngineEvent::Data { points, .. }
                if points.iter().any(|p| p.type_id == TypeId::SetpointScaled))
        })
        .await;
        if let EngineEvent::Data { points, .. } = event {
            seen.extend(points.into_iter().map(|p| p.ioa));
        }
    }
    let expected: Vec<u32> = (4000..4010).collect();
    assert_eq!(seen, expected);

    client.disconnect().await;
    server.stop().await;
}
