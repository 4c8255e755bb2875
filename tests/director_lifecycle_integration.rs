//! Integration tests for reader lifecycle
//!
//! These tests validate the director workflow against a recording source:
//! - Connection sharing and exactly-once disconnection
//! - Pause and resume
//! - Closing, including from inside a listener
//! - Failure isolation between channels

mod common;

use common::builders::NotificationRecorder;
use common::mock_helpers::RecordingDataSource;
use common::{context_with, test_timeout, wait_until};
use pvmonitor_rs::expression::{average_of, channel, channels_for_write, queue_of, value_of};
use pvmonitor_rs::{
    DirectorLifecycle, Notification, NotifyPolicy, PvError, PvReader, PvWriter, Value,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

fn reader_for(source: &std::sync::Arc<RecordingDataSource>, policy: NotifyPolicy) -> PvReader {
    PvReader::builder(context_with(source.clone()))
        .period(Duration::from_millis(5))
        .notify(policy)
        .name("lifecycle")
        .build()
        .unwrap()
}

#[test]
fn test_close_twice_disconnects_each_channel_once() {
    let source = RecordingDataSource::new("rec");
    let reader = reader_for(&source, NotifyPolicy::OnChange);

    let a = channel("A");
    reader
        .add_expression(value_of(&a), NotificationRecorder::new().listener())
        .unwrap();
    reader
        .add_expression(average_of(&a), NotificationRecorder::new().listener())
        .unwrap();
    reader
        .add_expression(value_of(&channel("B")), NotificationRecorder::new().listener())
        .unwrap();
    assert_eq!(source.connect_count("A"), 1);
    assert_eq!(reader.connected_channels(), vec!["A", "B"]);

    reader.close();
    reader.close();

    assert!(reader.is_closed());
    assert_eq!(source.disconnect_count("A"), 1);
    assert_eq!(source.disconnect_count("B"), 1);
    assert!(source.targets("A").is_empty());
}

#[test]
fn test_dropping_last_handle_closes_reader() {
    let source = RecordingDataSource::new("rec");
    let reader = reader_for(&source, NotifyPolicy::OnChange);
    reader
        .add_expression(value_of(&channel("A")), NotificationRecorder::new().listener())
        .unwrap();

    drop(reader);
    assert_eq!(source.disconnect_count("A"), 1);
}

#[test]
fn test_pause_disconnects_and_resume_reconnects() {
    let source = RecordingDataSource::new("rec");
    let reader = reader_for(&source, NotifyPolicy::Always);
    let recorder = NotificationRecorder::new();
    reader
        .add_expression(value_of(&channel("A")), recorder.listener())
        .unwrap();
    wait_until(test_timeout(), || recorder.len() > 0).unwrap();

    reader.pause().unwrap();
    assert_eq!(reader.lifecycle(), DirectorLifecycle::Paused);
    assert_eq!(source.disconnect_count("A"), 1);
    assert!(reader.connected_channels().is_empty());

    // A tick already past the lifecycle check may still deliver
    thread::sleep(Duration::from_millis(20));
    let paused_at = recorder.len();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.len(), paused_at);

    reader.resume().unwrap();
    assert_eq!(reader.lifecycle(), DirectorLifecycle::Running);
    assert_eq!(source.connect_count("A"), 2);
    wait_until(test_timeout(), || recorder.len() > paused_at).unwrap();

    reader.close();
}

#[test]
fn test_expression_added_while_paused_connects_on_resume() {
    let source = RecordingDataSource::new("rec");
    let reader = reader_for(&source, NotifyPolicy::OnChange);
    reader.pause().unwrap();

    let recorder = NotificationRecorder::new();
    reader
        .add_expression(value_of(&channel("A")), recorder.listener())
        .unwrap();
    assert_eq!(source.connect_count("A"), 0);

    reader.resume().unwrap();
    assert_eq!(source.connect_count("A"), 1);
    source.publish("A", Value::Int(3));
    recorder.wait_for_value(&Value::Int(3), test_timeout()).unwrap();
    reader.close();
}

#[test]
fn test_close_from_listener() {
    let source = RecordingDataSource::new("rec");
    let reader = reader_for(&source, NotifyPolicy::Always);
    let (tx, rx) = crossbeam_channel::bounded(1);

    let handle = reader.clone();
    reader
        .add_expression(value_of(&channel("A")), move |_: &Notification| {
            handle.close();
            let _ = tx.try_send(());
        })
        .unwrap();

    rx.recv_timeout(test_timeout()).unwrap();
    wait_until(test_timeout(), || reader.is_closed()).unwrap();
    assert_eq!(source.disconnect_count("A"), 1);
    assert!(matches!(
        reader.add_expression(value_of(&channel("B")), |_: &Notification| {}),
        Err(PvError::Closed(_))
    ));
}

#[test]
fn test_no_notification_after_close_returns() {
    let source = RecordingDataSource::new("rec");
    let reader = reader_for(&source, NotifyPolicy::Always);
    let recorder = NotificationRecorder::new();
    reader
        .add_expression(value_of(&channel("A")), recorder.listener())
        .unwrap();
    wait_until(test_timeout(), || recorder.len() >= 3).unwrap();

    reader.close();
    let at_close = recorder.len();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(recorder.len(), at_close);
}

#[test]
fn test_failing_channel_does_not_block_siblings() {
    let source = RecordingDataSource::new("rec");
    source.fail_channel("bad");
    let reader = reader_for(&source, NotifyPolicy::OnChange);

    let bad = NotificationRecorder::new();
    let good = NotificationRecorder::new();
    reader
        .add_expression(value_of(&channel("bad")), bad.listener())
        .unwrap();
    reader
        .add_expression(value_of(&channel("good")), good.listener())
        .unwrap();

    source.publish("good", Value::Double(5.0));
    good.wait_for_value(&Value::Double(5.0), test_timeout())
        .unwrap();
    wait_until(test_timeout(), || bad.errors() > 0).unwrap();

    let error = bad
        .notifications()
        .into_iter()
        .find_map(|n| n.error)
        .unwrap();
    assert!(matches!(error, PvError::Connection { ref channel, .. } if channel == "bad"));
    assert!(bad.notifications().iter().all(|n| !n.connected));
    assert_eq!(reader.connected_channels(), vec!["good"]);
    reader.close();
}

#[test]
fn test_panicking_listener_is_isolated() {
    let source = RecordingDataSource::new("rec");
    let reader = reader_for(&source, NotifyPolicy::Always);
    let recorder = NotificationRecorder::new();

    reader
        .add_expression(value_of(&channel("A")), |_: &Notification| panic!("listener bug"))
        .unwrap();
    reader
        .add_expression(value_of(&channel("A")), recorder.listener())
        .unwrap();

    wait_until(test_timeout(), || recorder.len() >= 3).unwrap();
    assert!(reader.stats().evaluation_errors >= 1);
    assert_eq!(reader.lifecycle(), DirectorLifecycle::Running);
    reader.close();
}

#[test]
fn test_on_change_skips_unchanged_values() {
    let source = RecordingDataSource::new("rec");
    let reader = reader_for(&source, NotifyPolicy::OnChange);
    let recorder = NotificationRecorder::new();
    reader
        .add_expression(value_of(&channel("A")), recorder.listener())
        .unwrap();

    source.publish("A", Value::Int(1));
    recorder.wait_for_value(&Value::Int(1), test_timeout()).unwrap();
    // Same value again: new data but no change
    source.publish("A", Value::Int(1));
    thread::sleep(Duration::from_millis(40));
    source.publish("A", Value::Int(2));
    recorder.wait_for_value(&Value::Int(2), test_timeout()).unwrap();

    assert_eq!(recorder.values(), vec![Value::Int(1), Value::Int(2)]);
    assert!(reader.stats().skipped_notifications > 0);
    reader.close();
}

#[test]
fn test_two_leaves_on_one_channel_both_see_updates() {
    let source = RecordingDataSource::new("rec");
    let reader = reader_for(&source, NotifyPolicy::OnChange);
    let a = channel("A");
    let first = NotificationRecorder::new();
    let second = NotificationRecorder::new();
    reader.add_expression(value_of(&a), first.listener()).unwrap();
    reader.add_expression(value_of(&a), second.listener()).unwrap();
    assert_eq!(source.connect_count("A"), 1);

    source.publish("A", Value::Int(5));
    first.wait_for_value(&Value::Int(5), test_timeout()).unwrap();
    second.wait_for_value(&Value::Int(5), test_timeout()).unwrap();

    source.targets("A")[0].write_error(PvError::connection("A", "glitch"));
    wait_until(test_timeout(), || first.errors() > 0 && second.errors() > 0).unwrap();
    reader.close();
}

#[test]
fn test_same_value_after_error_is_notified() {
    let source = RecordingDataSource::new("rec");
    let reader = reader_for(&source, NotifyPolicy::OnChange);
    let recorder = NotificationRecorder::new();
    reader
        .add_expression(value_of(&channel("A")), recorder.listener())
        .unwrap();

    source.publish("A", Value::Int(5));
    recorder.wait_for_value(&Value::Int(5), test_timeout()).unwrap();
    source.targets("A")[0].write_error(PvError::connection("A", "glitch"));
    wait_until(test_timeout(), || recorder.errors() > 0).unwrap();

    source.publish("A", Value::Int(5));
    wait_until(test_timeout(), || recorder.values().len() == 2).unwrap();
    let last = recorder.notifications().pop().unwrap();
    assert_eq!(last.value, Some(Value::Int(5)));
    assert!(last.error.is_none());
    reader.close();
}

#[test]
fn test_listener_can_pause_and_resume_repeatedly() {
    let source = RecordingDataSource::new("rec");
    let reader = reader_for(&source, NotifyPolicy::Always);
    let (tx, rx) = crossbeam_channel::bounded(1);
    let done = AtomicBool::new(false);

    let handle = reader.clone();
    reader
        .add_expression(value_of(&channel("A")), move |_: &Notification| {
            if done.swap(true, Ordering::SeqCst) {
                return;
            }
            for _ in 0..40 {
                handle.pause().unwrap();
                handle.resume().unwrap();
            }
            let _ = tx.try_send(());
        })
        .unwrap();

    rx.recv_timeout(test_timeout()).unwrap();
    assert_eq!(reader.lifecycle(), DirectorLifecycle::Running);
    assert_eq!(source.connect_count("A"), 41);
    reader.close();
}

#[test]
fn test_samples_queued_before_pause_are_dropped() {
    let source = RecordingDataSource::new("rec");
    let reader = PvReader::builder(context_with(source.clone()))
        .period(Duration::from_millis(300))
        .notify(NotifyPolicy::OnChange)
        .build()
        .unwrap();
    let recorder = NotificationRecorder::new();
    reader
        .add_expression(queue_of(&channel("A")), recorder.listener())
        .unwrap();

    source.publish("A", Value::Int(1));
    source.publish("A", Value::Int(2));
    reader.pause().unwrap();
    reader.resume().unwrap();
    let resumed_at = recorder.len();
    source.publish("A", Value::Int(3));

    let expected = Value::List(vec![Value::Int(3)]);
    recorder.wait_for_value(&expected, test_timeout()).unwrap();
    let after_resume: Vec<_> = recorder.notifications()[resumed_at..]
        .iter()
        .filter_map(|n| n.value.clone())
        .filter(|v| !matches!(v, Value::List(items) if items.is_empty()))
        .collect();
    assert_eq!(after_resume, vec![expected]);
    reader.close();
}

#[test]
fn test_writer_releases_write_channels_once() {
    let source = RecordingDataSource::new("rec");
    source.fail_channel("C");
    let context = context_with(source.clone());

    let writer = PvWriter::new(&context, channels_for_write(&["A", "B", "C"]).unwrap()).unwrap();
    assert_eq!(source.write_connect_count("A"), 1);
    assert_eq!(source.write_connect_count("C"), 1);
    assert_eq!(writer.connected_channels(), vec!["A", "B"]);

    writer.close();
    writer.close();
    drop(writer);
    assert_eq!(source.write_disconnect_count("A"), 1);
    assert_eq!(source.write_disconnect_count("B"), 1);
    assert_eq!(source.write_disconnect_count("C"), 0);

    // Dropping the last handle without closing also releases
    let dropped = PvWriter::new(&context, channels_for_write(&["A"]).unwrap()).unwrap();
    drop(dropped);
    assert_eq!(source.write_connect_count("A"), 2);
    assert_eq!(source.write_disconnect_count("A"), 2);
}
