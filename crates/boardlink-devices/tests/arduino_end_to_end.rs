use std::sync::Arc;
use std::time::Duration;

use boardlink_core::telemetry::{SampleValue, TelemetryRingBuffer};
use boardlink_core::types::Value;
use boardlink_devices::transport::{MockTransport, TranscriptEntry};
use boardlink_devices::{DeviceError, DriverRegistry, SessionOptions, SessionState, Transport};
use futures::StreamExt;
use test_log::test;

fn uno() -> Arc<MockTransport> {
    let mock = Arc::new(MockTransport::named("uno"));
    mock.respond("ID?\n", "ARDUINO UNO R3\n");
    mock.respond("INIT\n", "READY\n");
    mock.respond("CMD:digitalWrite:13,true\n", "OK\n");
    mock.respond("CMD:analogRead:0\n", "OK:512\n");
    mock.respond("CMD:servo:9,90\n", "ERR:unknown command\n");
    mock
}

#[test(tokio::test(start_paused = true))]
async fn probe_open_invoke_and_close() -> anyhow::Result<()> {
    let mock = uno();
    mock.connect().await?;

    let ring = Arc::new(TelemetryRingBuffer::new(2000));
    let registry = DriverRegistry::with_builtin_drivers();
    let (driver, session) = registry
        .probe_and_open(mock.clone(), SessionOptions::default().with_telemetry(ring.clone()))
        .await?;
    assert_eq!(driver.descriptor().name, "arduino");
    assert_eq!(session.state(), SessionState::Ready);

    mock.clear_transcript();
    let ack = session
        .call("digitalWrite", &[Value::from(13), Value::from(true)])
        .await?;
    assert_eq!(ack, Value::Null);
    assert_eq!(
        mock.transcript(),
        vec![
            TranscriptEntry::Tx("CMD:digitalWrite:13,true\n".into()),
            TranscriptEntry::Rx("OK\n".into()),
        ]
    );

    let reading = session.call("analogRead", &[Value::from(0)]).await?;
    assert_eq!(reading, Value::Integer(512));

    let rejected = session.call("servo", &[Value::from(9), Value::from(90)]).await;
    assert!(matches!(rejected, Err(DeviceError::Rejected(ref m)) if m == "unknown command"));

    let mut temps = session.telemetry_stream("temp");
    mock.inject("TLM:temp:21.5\nTLM:door:1\nTLM:temp:21.75\n");
    let first = temps.next().await.expect("temperature sample");
    let second = temps.next().await.expect("temperature sample");
    assert_eq!(first.value, SampleValue::Numeric(21.5));
    assert_eq!(second.value, SampleValue::Numeric(21.75));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let stored = ring.snapshot();
    let channels: Vec<&str> = stored.iter().map(|s| s.channel.as_str()).collect();
    assert_eq!(channels, vec!["temp", "door", "temp"]);

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(mock.active_tasks(), 0);
    assert!(temps.next().await.is_none());
    assert!(matches!(
        session.call("analogRead", &[Value::from(0)]).await,
        Err(DeviceError::Closed)
    ));
    Ok(())
}
