//! End-to-end CS101 exchanges: the unbalanced master polls a slave over
//! an in-memory duplex channel.

use std::sync::Arc;
use std::time::Duration;

use iec60870::command::CommandSpec;
use iec60870::common::TypeId;
use iec60870::cs101::{Iec101MasterConfig, Iec101MasterUnbalanced, Iec101Slave, Iec101SlaveConfig};
use iec60870::events::{ChannelSink, ControlEvent, EngineEvent};
use iec60870::transport::StreamTransport;
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(10);

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

async fn master_and_slave() -> (
    Iec101MasterUnbalanced,
    UnboundedReceiver<EngineEvent>,
    Iec101Slave,
    UnboundedReceiver<EngineEvent>,
) {
    let (master_side, slave_side) = tokio::io::duplex(4096);

    let (slave_sink, slave_events) = ChannelSink::new();
    let slave = Iec101Slave::new(Iec101SlaveConfig::default(), Arc::new(slave_sink)).unwrap();
    slave
        .start(Box::new(StreamTransport::new(slave_side, "master")))
        .await
        .unwrap();

    let (master_sink, master_events) = ChannelSink::new();
    let master =
        Iec101MasterUnbalanced::new(Iec101MasterConfig::default(), Arc::new(master_sink)).unwrap();
    master
        .connect(Box::new(StreamTransport::new(master_side, "slave")))
        .await
        .unwrap();
    master.add_slave(1).await.unwrap();

    (master, master_events, slave, slave_events)
}

#[tokio::test]
async fn link_bring_up_sends_initial_interrogation() {
    let (master, mut master_events, slave, mut slave_events) = master_and_slave().await;

    wait_for(&mut master_events, "master activated", |e| {
        is_control(e, ControlEvent::Activated)
    })
    .await;

    // The master negotiates the link and interrogates automatically.
    let event = wait_for(&mut slave_events, "interrogation at slave", |e| {
        matches!(e, EngineEvent::Data { points, .. }
            if points.iter().any(|p| p.type_id == TypeId::InterrogationCommand))
    })
    .await;
    match event {
        EngineEvent::Data { points, .. } => {
            assert_eq!(points[0].value, 20.0);
            assert_eq!(points[0].ioa, 0);
        }
        _ => unreachable!(),
    }

    master.disconnect().await;
    slave.stop().await;
}

#[tokio::test]
async fn class2_poll_collects_monitoring_data() {
    let (master, mut master_events, slave, _slave_events) = master_and_slave().await;

    wait_for(&mut master_events, "master activated", |e| {
        is_control(e, ControlEvent::Activated)
    })
    .await;

    slave
        .send_commands(vec![
            CommandSpec::new(TypeId::MeasuredShort, 2001, 230.5),
            CommandSpec::new(TypeId::MeasuredShort, 2002, 231.25),
        ])
        .await
        .unwrap();

    let event = wait_for(&mut master_events, "measurands at master", |e| {
        matches!(e, EngineEvent::Data { points, .. }
            if points.iter().any(|p| p.type_id == TypeId::MeasuredShort))
    })
    .await;
    match event {
        EngineEvent::Data { points, .. } => {
            assert_eq!(points.len(), 2);
            assert_eq!(points[0].ioa, 2001);
            assert_eq!(points[0].value, 230.5);
            assert_eq!(points[1].value, 231.25);
        }
        _ => unreachable!(),
    }

    master.disconnect().await;
    slave.stop().await;
}

#[tokio::test]
async fn commands_reach_the_slave_in_order() {
    let (master, mut master_events, slave, mut slave_events) = master_and_slave().await;

    wait_for(&mut master_events, "master activated", |e| {
        is_control(e, ControlEvent::Activated)
    })
    .await;

    master
        .send_commands(
            1,
            vec![
                CommandSpec::new(TypeId::SingleCommand, 1000, true).with_select(true),
                CommandSpec::new(TypeId::SingleCommand, 1000, true).with_select(false),
            ],
        )
        .await
        .unwrap();

    let first = wait_for(&mut slave_events, "select at slave", |e| {
        matches!(e, EngineEvent::Data { points, .. }
            if points.iter().any(|p| p.type_id == TypeId::SingleCommand))
    })
    .await;
    match first {
        EngineEvent::Data { points, .. } => assert_eq!(points[0].bsel_cmd, Some(true)),
        _ => unreachable!(),
    }
    let second = wait_for(&mut slave_events, "execute at slave", |e| {
        matches!(e, EngineEvent::Data { points, .. }
            if points.iter().any(|p| p.type_id == TypeId::SingleCommand))
    })
    .await;
    match second {
        EngineEvent::Data { points, .. } => assert_eq!(points[0].bsel_cmd, Some(false)),
        _ => unreachable!(),
    }

    master.disconnect().await;
    slave.stop().await;
}

#[tokio::test]
async fn timed_events_arrive_via_class1() {
    let (master, mut master_events, slave, _slave_events) = master_and_slave().await;

    wait_for(&mut master_events, "master activated", |e| {
        is_control(e, ControlEvent::Activated)
    })
    .await;

    slave
        .send_commands(vec![CommandSpec::new(
            TypeId::SinglePointWithCp56,
            3001,
            true,
        )
        .with_timestamp(1_705_321_496_789)])
        .await
        .unwrap();

    let event = wait_for(&mut master_events, "timed point at master", |e| {
        matches!(e, EngineEvent::Data { points, .. }
            if points.iter().any(|p| p.type_id == TypeId::SinglePointWithCp56))
    })
    .await;
    match event {
        EngineEvent::Data { points, .. } => {
            assert_eq!(points[0].ioa, 3001);
            assert_eq!(points[0].value, 1.0);
            assert_eq!(points[0].timestamp, Some(1_705_321_496_789));
        }
        _ => unreachable!(),
    }

    master.disconnect().await;
    slave.stop().await;
}
