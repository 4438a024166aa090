use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use simplecom_core::demo::LoopbackDevice;
use simplecom_core::dispatch::{AbortReason, DispatchEvent, DispatchQueue, DispatchState, LineEnding};
use simplecom_core::history::CommandHistory;
use simplecom_core::serial::{ConnectionConfig, SerialChannel, SerialError};

struct Rig {
    device: LoopbackDevice,
    channel: Arc<SerialChannel>,
    queue: DispatchQueue,
    events: mpsc::UnboundedReceiver<DispatchEvent>,
}

fn rig() -> Rig {
    let device = LoopbackDevice::new();
    let channel = Arc::new(SerialChannel::new(Arc::new(device.opener())));
    channel
        .configure(ConnectionConfig::new("loop0", 115200))
        .unwrap();
    channel.open().unwrap();

    let history = Arc::new(Mutex::new(CommandHistory::new()));
    let queue = DispatchQueue::new(
        Arc::clone(&channel),
        history,
        tokio::runtime::Handle::current(),
    );
    let (tx, events) = mpsc::unbounded_channel();
    queue.subscribe(move |e| {
        let _ = tx.send(e.clone());
    });

    Rig {
        device,
        channel,
        queue,
        events,
    }
}

async fn next_event(rig: &mut Rig) -> DispatchEvent {
    tokio::time::timeout(Duration::from_secs(30), rig.events.recv())
        .await
        .expect("timed out waiting for dispatch event")
        .expect("event channel closed")
}

async fn collect_until_idle(rig: &mut Rig) -> Vec<String> {
    let mut messages = Vec::new();
    loop {
        let event = next_event(rig).await;
        let terminal = matches!(
            event,
            DispatchEvent::Completed { .. } | DispatchEvent::Stopped | DispatchEvent::Aborted(_)
        );
        messages.push(event.to_string());
        if terminal {
            return messages;
        }
    }
}

#[tokio::test]
async fn test_crlf_batch_skips_blank_lines() {
    let mut rig = rig();

    let queued = rig.queue.start("a\n\nb\n", LineEnding::CrLf, 0).unwrap();
    assert_eq!(queued, 2);

    // No interval: the whole batch is written before start returns
    assert_eq!(rig.device.writes(), vec![b"a\r\n".to_vec(), b"b\r\n".to_vec()]);
    assert_eq!(rig.queue.state(), DispatchState::Idle);

    let messages = collect_until_idle(&mut rig).await;
    assert_eq!(
        messages,
        vec!["1/2: a", "2/2: b", "completed: all 2 commands sent"]
    );
}

#[tokio::test]
async fn test_single_line_messages() {
    let mut rig = rig();
    rig.queue.start("AT+GMR", LineEnding::None, 500).unwrap();

    let messages = collect_until_idle(&mut rig).await;
    assert_eq!(messages, vec!["Sent: AT+GMR", "completed"]);
    assert_eq!(rig.device.written(), b"AT+GMR".to_vec());
}

#[tokio::test]
async fn test_blank_text_is_noop() {
    let rig = rig();
    assert_eq!(rig.queue.start(" \n\t\n", LineEnding::CrLf, 0).unwrap(), 0);
    assert_eq!(rig.queue.state(), DispatchState::Idle);
    assert!(rig.device.writes().is_empty());
}

#[tokio::test]
async fn test_history_records_original_lines() {
    let mut rig = rig();
    rig.queue.start("one\ntwo\none", LineEnding::Lf, 0).unwrap();
    collect_until_idle(&mut rig).await;

    let history = rig.queue.history().lock().unwrap();
    assert_eq!(history.entries(), ["one", "two"]);
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let mut rig = rig();
    rig.queue.start("a\nb\nc", LineEnding::Cr, 1000).unwrap();

    let err = rig.queue.start("other", LineEnding::Cr, 0).unwrap_err();
    assert!(matches!(err, SerialError::AlreadySending));

    rig.queue.stop();
    let messages = collect_until_idle(&mut rig).await;
    assert_eq!(messages.last().map(String::as_str), Some("stopped"));
}

#[tokio::test(start_paused = true)]
async fn test_interval_paces_lines() {
    let mut rig = rig();
    let started = tokio::time::Instant::now();
    rig.queue.start("x\ny\nz", LineEnding::Lf, 250).unwrap();

    let mut sent_at = Vec::new();
    loop {
        match next_event(&mut rig).await {
            DispatchEvent::Sent { .. } => sent_at.push(started.elapsed()),
            DispatchEvent::Completed { total } => {
                assert_eq!(total, 3);
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    assert_eq!(sent_at[0], Duration::ZERO);
    assert!(sent_at[1] >= Duration::from_millis(250));
    assert!(sent_at[2] >= Duration::from_millis(500));
    assert_eq!(rig.device.written(), b"x\ny\nz\n".to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_schedule() {
    let mut rig = rig();
    rig.queue.start("1\n2\n3", LineEnding::CrLf, 1000).unwrap();

    assert_eq!(next_event(&mut rig).await.to_string(), "1/3: 1");
    rig.queue.stop();
    assert_eq!(next_event(&mut rig).await, DispatchEvent::Stopped);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(rig.device.writes().len(), 1);
    assert!(rig.events.try_recv().is_err());

    // stop while idle does nothing
    rig.queue.stop();
    assert!(rig.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_first_line_written_before_start_returns() {
    let mut rig = rig();
    rig.queue.start("a\nb", LineEnding::CrLf, 1000).unwrap();
    assert_eq!(rig.device.writes(), vec![b"a\r\n".to_vec()]);

    rig.queue.stop();
    let messages = collect_until_idle(&mut rig).await;
    assert_eq!(messages, vec!["1/2: a", "stopped"]);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(rig.device.writes(), vec![b"a\r\n".to_vec()]);
}

#[tokio::test]
async fn test_zero_interval_checks_connection_before_each_line() {
    let mut rig = rig();
    let channel = Arc::clone(&rig.channel);
    rig.queue.subscribe(move |e| {
        if let DispatchEvent::Sent { index: 0, .. } = e {
            channel.close();
        }
    });

    rig.queue.start("1\n2\n3", LineEnding::Lf, 0).unwrap();

    let messages = collect_until_idle(&mut rig).await;
    assert_eq!(messages, vec!["1/3: 1", "aborted: disconnected"]);
    assert_eq!(rig.device.writes(), vec![b"1\n".to_vec()]);
    assert_eq!(rig.queue.state(), DispatchState::Idle);
}

#[tokio::test]
async fn test_zero_interval_stop_from_listener_ends_batch() {
    let rig = rig();
    let queue = Arc::new(DispatchQueue::new(
        Arc::clone(&rig.channel),
        Arc::new(Mutex::new(CommandHistory::new())),
        tokio::runtime::Handle::current(),
    ));

    let (tx, mut events) = mpsc::unbounded_channel();
    let weak = Arc::downgrade(&queue);
    queue.subscribe(move |e| {
        let _ = tx.send(e.to_string());
        if let DispatchEvent::Sent { index: 1, .. } = e {
            if let Some(queue) = weak.upgrade() {
                queue.stop();
            }
        }
    });

    queue.start("x\ny\nz", LineEnding::Cr, 0).unwrap();

    let mut messages = Vec::new();
    while let Ok(message) = events.try_recv() {
        messages.push(message);
    }
    assert_eq!(messages, vec!["1/3: x", "2/3: y", "stopped"]);
    assert_eq!(rig.device.written(), b"x\ry\r".to_vec());
    assert!(!queue.is_sending());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_mid_batch_aborts() {
    let mut rig = rig();
    rig.queue.start("l1\nl2\nl3", LineEnding::CrLf, 200).unwrap();

    assert_eq!(next_event(&mut rig).await.to_string(), "1/3: l1");
    rig.channel.close();

    assert_eq!(
        next_event(&mut rig).await,
        DispatchEvent::Aborted(AbortReason::Disconnected)
    );
    assert_eq!(rig.queue.state(), DispatchState::Idle);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rig.device.writes(), vec![b"l1\r\n".to_vec()]);
    assert!(rig.events.try_recv().is_err());
}

#[tokio::test]
async fn test_start_while_disconnected_aborts() {
    let mut rig = rig();
    rig.channel.close();

    rig.queue.start("AT", LineEnding::CrLf, 0).unwrap();
    assert_eq!(rig.queue.state(), DispatchState::Idle);
    let messages = collect_until_idle(&mut rig).await;
    assert_eq!(messages, vec!["aborted: disconnected"]);
    assert!(rig.device.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_does_not_stop_batch() {
    let mut rig = rig();
    rig.device.set_write_failure(Some("I/O error"));

    rig.queue.start("a\nb", LineEnding::Lf, 100).unwrap();

    let first = next_event(&mut rig).await;
    assert!(matches!(first, DispatchEvent::Failed { index: 0, .. }));
    // Clear the fault so the second line goes through
    rig.device.set_write_failure(None);

    let rest = collect_until_idle(&mut rig).await;
    assert_eq!(rest, vec!["2/2: b", "completed: all 2 commands sent"]);

    assert_eq!(rig.device.written(), b"b\n".to_vec());
    let history = rig.queue.history().lock().unwrap();
    assert_eq!(history.entries(), ["b"]);
}

#[tokio::test]
async fn test_queue_usable_after_completion() {
    let mut rig = rig();
    rig.queue.start("first", LineEnding::Cr, 0).unwrap();
    collect_until_idle(&mut rig).await;

    rig.queue.start("second", LineEnding::Cr, 0).unwrap();
    collect_until_idle(&mut rig).await;

    assert_eq!(rig.device.written(), b"first\rsecond\r".to_vec());
}
