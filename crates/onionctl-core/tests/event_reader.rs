//! Event reader tests: events and replies sharing one connection.

use std::sync::Arc;
use std::time::Duration;

use onionctl_core::{BaseController, ControlError, ControlMessage, EventReader};
use onionctl_test_utils::config::TestConfigBuilder;
use onionctl_test_utils::tracing_setup::init_test_tracing;
use onionctl_test_utils::{FakeDaemon, LogCapture};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tracing::Level;

async fn connected(daemon: &FakeDaemon) -> Arc<BaseController> {
    init_test_tracing();
    let config = TestConfigBuilder::new()
        .endpoint(daemon.endpoint().clone())
        .reply_queue(4)
        .build();
    let controller = BaseController::from_config(&config).unwrap();
    controller.connect().await.unwrap();
    controller
}

fn channel_reader(
    controller: Arc<BaseController>,
) -> (EventReader, mpsc::UnboundedReceiver<ControlMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let reader = EventReader::spawn(
        controller,
        move |event: ControlMessage| {
            let _ = tx.send(event);
        },
        &TestConfigBuilder::new().build().reader,
    );
    (reader, rx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ControlMessage>) -> ControlMessage {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no event within five seconds")
        .expect("event handler dropped")
}

#[tokio::test]
async fn reply_goes_to_msg_and_events_to_handler() {
    let mut daemon = FakeDaemon::unix().await;
    let controller = connected(&daemon).await;
    let (reader, mut events) = channel_reader(controller);

    let (reply, ()) = tokio::join!(reader.msg("GETINFO version"), async {
        assert_eq!(daemon.next_request().await.unwrap(), "GETINFO version");
        daemon.push("650 BW 1024 2048\r\n");
        daemon.push("250-version=0.4.8.9\r\n250 OK\r\n");
        daemon.push("650 BW 10 20\r\n");
    });

    let reply = reply.unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.lines()[0].content, "version=0.4.8.9");

    assert_eq!(next_event(&mut events).await.to_string(), "BW 1024 2048");
    assert_eq!(next_event(&mut events).await.to_string(), "BW 10 20");
}

#[tokio::test]
async fn error_reply_is_returned_not_raised() {
    let mut daemon = FakeDaemon::tcp().await;
    let controller = connected(&daemon).await;
    let (reader, _events) = channel_reader(controller);

    let (reply, ()) = tokio::join!(reader.msg("GETINFO nonsense"), async {
        daemon.next_request().await.unwrap();
        daemon.push("552 Unrecognized key \"nonsense\"\r\n");
    });

    let reply = reply.unwrap();
    assert!(!reply.is_ok());
    assert_eq!(reply.status_code(), "552");
}

#[tokio::test]
async fn concurrent_msgs_pair_with_their_replies() {
    let mut daemon = FakeDaemon::unix().await;
    let controller = connected(&daemon).await;
    let (reader, _events) = channel_reader(controller);
    let reader = Arc::new(reader);

    let first = tokio::spawn({
        let reader = Arc::clone(&reader);
        async move { reader.msg("GETINFO alpha").await }
    });
    let second = tokio::spawn({
        let reader = Arc::clone(&reader);
        async move { reader.msg("GETINFO beta").await }
    });

    for _ in 0..2 {
        let request = daemon.next_request().await.unwrap();
        let key = request.trim_start_matches("GETINFO ");
        daemon.push(&format!("250-{key}=1\r\n250 OK\r\n"));
    }

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.lines()[0].content, "alpha=1");
    assert_eq!(second.lines()[0].content, "beta=1");
}

#[tokio::test]
async fn msg_fails_when_connection_drops() {
    let mut daemon = FakeDaemon::unix().await;
    let controller = connected(&daemon).await;
    let (reader, _events) = channel_reader(controller);

    let (reply, ()) = tokio::join!(reader.msg("GETINFO version"), async {
        daemon.next_request().await.unwrap();
        daemon.hang_up();
    });

    assert!(matches!(reply, Err(ControlError::ConnectionClosed)));
    assert!(!reader.controller().is_alive());

    tokio::time::timeout(Duration::from_secs(5), async {
        while reader.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("receive loop kept running after hangup");
}

#[tokio::test]
async fn msg_on_closed_controller_fails_fast() {
    let daemon = FakeDaemon::unix().await;
    let controller = connected(&daemon).await;
    controller.close().await;
    let (reader, _events) = channel_reader(controller);

    assert!(matches!(
        reader.msg("GETINFO version").await,
        Err(ControlError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn malformed_message_is_skipped() {
    let capture = LogCapture::new(64);
    let _guard = capture.set_default();

    let mut daemon = FakeDaemon::unix().await;
    let controller = connected(&daemon).await;
    let (reader, _events) = channel_reader(controller);

    let (reply, ()) = tokio::join!(reader.msg("GETINFO version"), async {
        daemon.next_request().await.unwrap();
        daemon.push("garbage\r\n");
        daemon.push("250 OK\r\n");
    });

    assert!(reply.unwrap().is_ok());
    assert!(reader.is_running());
    assert!(capture.contains(Level::WARN, "skipping malformed control message"));
}

#[tokio::test]
async fn unsolicited_reply_is_discarded() {
    let mut daemon = FakeDaemon::unix().await;
    let controller = connected(&daemon).await;
    let (reader, mut events) = channel_reader(controller);

    // An event pushed after the stray reply proves the loop has queued it.
    daemon.push("250 stray\r\n650 NOTICE marker\r\n");
    assert_eq!(next_event(&mut events).await.to_string(), "NOTICE marker");

    let (reply, ()) = tokio::join!(reader.msg("GETINFO version"), async {
        daemon.next_request().await.unwrap();
        daemon.push("250-version=0.4.8.9\r\n250 OK\r\n");
    });
    assert_eq!(reply.unwrap().lines()[0].content, "version=0.4.8.9");
}

#[tokio::test]
async fn panicking_handler_keeps_loop_alive() {
    let mut daemon = FakeDaemon::unix().await;
    let controller = connected(&daemon).await;
    let reader = EventReader::spawn(
        controller,
        |event: ControlMessage| {
            if event.to_string().contains("boom") {
                panic!("handler exploded");
            }
        },
        &TestConfigBuilder::new().build().reader,
    );

    daemon.push("650 boom\r\n");
    let (reply, ()) = tokio::join!(reader.msg("GETINFO version"), async {
        daemon.next_request().await.unwrap();
        daemon.push("250 OK\r\n");
    });

    assert!(reply.unwrap().is_ok());
    assert!(reader.is_running());
}

#[tokio::test]
async fn shutdown_stops_loop_but_not_connection() {
    let daemon = FakeDaemon::unix().await;
    let controller = connected(&daemon).await;
    let (reader, _events) = channel_reader(Arc::clone(&controller));
    assert!(reader.is_running());

    reader.shutdown();
    tokio::time::timeout(Duration::from_secs(5), async {
        while reader.is_running() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    assert!(controller.is_alive());
    daemon.push("250 OK\r\n");
    assert!(controller.recv().await.unwrap().is_ok());
}

#[tokio::test]
async fn cancelled_msg_reply_is_not_handed_to_next_caller() {
    let mut daemon = FakeDaemon::unix().await;
    let controller = connected(&daemon).await;
    let (reader, _events) = channel_reader(controller);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), reader.msg("GETINFO first")).await;
    assert!(abandoned.is_err());
    assert_eq!(daemon.next_request().await.unwrap(), "GETINFO first");

    let (reply, ()) = tokio::join!(reader.msg("GETINFO second"), async {
        assert_eq!(daemon.next_request().await.unwrap(), "GETINFO second");
        daemon.push("250 first\r\n");
        daemon.push("250 second\r\n");
    });
    assert_eq!(reply.unwrap().to_string(), "second");
}

#[tokio::test]
async fn queued_reply_to_cancelled_msg_is_skipped() {
    let mut daemon = FakeDaemon::unix().await;
    let controller = connected(&daemon).await;
    let (reader, mut events) = channel_reader(controller);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), reader.msg("GETINFO first")).await;
    assert!(abandoned.is_err());
    assert_eq!(daemon.next_request().await.unwrap(), "GETINFO first");

    daemon.push("250 first\r\n650 NOTICE marker\r\n");
    assert_eq!(next_event(&mut events).await.to_string(), "NOTICE marker");

    let (reply, ()) = tokio::join!(reader.msg("GETINFO second"), async {
        daemon.next_request().await.unwrap();
        daemon.push("250 second\r\n");
    });
    assert_eq!(reply.unwrap().to_string(), "second");

    // The count is back to zero: the next reply belongs to the next caller.
    let (reply, ()) = tokio::join!(reader.msg("GETINFO third"), async {
        daemon.next_request().await.unwrap();
        daemon.push("250 third\r\n");
    });
    assert_eq!(reply.unwrap().to_string(), "third");
}

#[tokio::test]
async fn reader_does_not_outlive_its_connection() {
    let mut daemon = FakeDaemon::unix().await;
    let controller = connected(&daemon).await;
    let (reader, _events) = channel_reader(Arc::clone(&controller));

    controller.close().await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while reader.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("receive loop kept running after close");
    controller.connect().await.unwrap();

    assert!(matches!(
        reader.msg("SIGNAL NEWNYM").await,
        Err(ControlError::ConnectionClosed)
    ));
    assert!(controller.is_alive());

    // Nothing was written for the refused request.
    controller.send("GETINFO version").await.unwrap();
    assert_eq!(daemon.next_request().await.unwrap(), "GETINFO version");

    let (fresh, _events) = channel_reader(controller);
    let (reply, ()) = tokio::join!(fresh.msg("SIGNAL NEWNYM"), async {
        assert_eq!(daemon.next_request().await.unwrap(), "SIGNAL NEWNYM");
        daemon.push("250 OK\r\n");
    });
    assert!(reply.unwrap().is_ok());
}
