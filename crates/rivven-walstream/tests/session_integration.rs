//! Stream session and supervisor behaviour against an in-memory WAL sender.

use rivven_walstream::testing::{ClientMessage, MockConnector, MockWalSender};
use rivven_walstream::{
    AbortFlag, Lsn, ReplicationConfig, ReplicationConnection, ResumePolicy, StreamSession,
    Supervisor, SupervisorState, TerminationReason,
};
use std::time::Duration;
use tokio::time::Instant;

fn config() -> ReplicationConfig {
    ReplicationConfig::builder()
        .user("repl")
        .database("app")
        .slot("s1")
        .status_interval(Duration::from_secs(10))
        .build()
        .unwrap()
}

fn config_with_end(end: u64) -> ReplicationConfig {
    let mut config = config();
    config.end_lsn = Some(Lsn::new(end));
    config
}

fn status_updates(messages: &[ClientMessage]) -> Vec<(Lsn, Lsn)> {
    messages
        .iter()
        .filter_map(|m| match m {
            ClientMessage::StatusUpdate(u) => Some((u.written, u.flushed)),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_record_at_end_position_is_delivered() {
    let (client, mut server) = MockWalSender::pair();
    let server_task = tokio::spawn(async move {
        let command = server.accept_start_replication().await;
        server.send_xlog(Lsn::new(0x100), b"a").await;
        server.send_xlog(Lsn::new(0x200), b"b").await;
        server.send_xlog(Lsn::new(0x300), b"c").await;
        (command, server.read_until_closed().await)
    });

    let mut session = StreamSession::new(&config_with_end(0x200), AbortFlag::new());
    let mut delivered = Vec::new();
    let reason = session
        .run(ReplicationConnection::new(client), Lsn::INVALID, |data: &[u8]| {
            delivered.push(data.to_vec())
        })
        .await;

    assert!(reason.is_intentional());
    assert_eq!(delivered, vec![b"a".to_vec(), b"b".to_vec()]);

    let (command, messages) = server_task.await.unwrap();
    assert_eq!(command, "START_REPLICATION SLOT \"s1\" LOGICAL 0/0");
    let updates = status_updates(&messages);
    assert_eq!(updates.last(), Some(&(Lsn::new(0x200), Lsn::new(0x200))));
    assert!(messages.contains(&ClientMessage::CopyDone));
}

#[tokio::test(start_paused = true)]
async fn test_record_past_end_position_is_not_delivered() {
    let (client, mut server) = MockWalSender::pair();
    let server_task = tokio::spawn(async move {
        server.accept_start_replication().await;
        server.send_xlog(Lsn::new(0x100), b"a").await;
        server.send_xlog(Lsn::new(0x201), b"b").await;
        server.read_until_closed().await
    });

    let mut session = StreamSession::new(&config_with_end(0x200), AbortFlag::new());
    let mut delivered = Vec::new();
    let reason = session
        .run(ReplicationConnection::new(client), Lsn::INVALID, |data: &[u8]| {
            delivered.push(data.to_vec())
        })
        .await;

    assert!(reason.is_intentional());
    assert_eq!(delivered, vec![b"a".to_vec()]);
    // the frame past the end was received, not delivered
    assert_eq!(session.stats().data_frames(), 2);
    assert_eq!(session.stats().bytes_received(), 2);
    let messages = server_task.await.unwrap();
    assert!(messages.contains(&ClientMessage::CopyDone));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_at_end_position_stops_session() {
    let (client, mut server) = MockWalSender::pair();
    let server_task = tokio::spawn(async move {
        server.accept_start_replication().await;
        server.send_xlog(Lsn::new(0x100), b"a").await;
        server.send_keepalive(Lsn::new(0x250), false).await;
        server.send_xlog(Lsn::new(0x110), b"late").await;
        server.read_until_closed().await
    });

    let mut session = StreamSession::new(&config_with_end(0x200), AbortFlag::new());
    let mut delivered = 0;
    let reason = session
        .run(ReplicationConnection::new(client), Lsn::INVALID, |_: &[u8]| {
            delivered += 1
        })
        .await;

    assert!(reason.is_intentional());
    assert_eq!(delivered, 1);

    let messages = server_task.await.unwrap();
    let updates = status_updates(&messages);
    assert_eq!(updates.last(), Some(&(Lsn::new(0x250), Lsn::new(0x250))));
    let copy_done = messages
        .iter()
        .position(|m| *m == ClientMessage::CopyDone)
        .expect("end of copy sent");
    let last_update = messages
        .iter()
        .rposition(|m| matches!(m, ClientMessage::StatusUpdate(_)))
        .unwrap();
    assert!(last_update < copy_done);
}

#[tokio::test(start_paused = true)]
async fn test_zero_end_position_does_not_stop_stream() {
    let (client, mut server) = MockWalSender::pair();
    let abort = AbortFlag::new();
    let server_abort = abort.clone();
    let server_task = tokio::spawn(async move {
        server.accept_start_replication().await;
        server.send_keepalive(Lsn::new(0x10), false).await;
        server.send_xlog(Lsn::new(0x20), b"a").await;
        server.send_keepalive(Lsn::new(0x30), true).await;
        let update = server.read_status_update().await;
        let update = if update.written == Lsn::new(0x30) {
            update
        } else {
            server.read_status_update().await
        };
        server_abort.raise();
        server.read_until_closed().await;
        update
    });

    let mut session = StreamSession::new(&config_with_end(0), abort);
    let mut delivered = 0;
    let reason = session
        .run(ReplicationConnection::new(client), Lsn::INVALID, |_: &[u8]| {
            delivered += 1
        })
        .await;

    assert!(reason.is_intentional());
    assert_eq!(delivered, 1);
    let update = server_task.await.unwrap();
    assert_eq!(update.written, Lsn::new(0x30));
}

#[tokio::test(start_paused = true)]
async fn test_reply_requested_gets_exactly_one_update() {
    let (client, mut server) = MockWalSender::pair();
    let server_task = tokio::spawn(async move {
        server.accept_start_replication().await;
        // timer-driven update on the first iteration
        let first = server.read_status_update().await;
        assert_eq!(first.written, Lsn::INVALID);

        server.send_keepalive(Lsn::new(0x50), true).await;
        let reply = server.read_status_update().await;

        // anything sent before our CopyDone is answered
        let extra = server.finish_copy().await;
        (reply, extra, server.read_until_closed().await)
    });

    let mut session = StreamSession::new(&config(), AbortFlag::new());
    let stats = session.stats();
    let reason = session
        .run(ReplicationConnection::new(client), Lsn::INVALID, |_: &[u8]| {})
        .await;

    assert!(matches!(reason, TerminationReason::EndOfStream));
    let (reply, extra, tail) = server_task.await.unwrap();
    assert_eq!(reply.written, Lsn::new(0x50));
    assert_eq!(reply.flushed, Lsn::new(0x50));
    assert_eq!(reply.applied, Lsn::INVALID);
    assert!(!reply.reply_requested);
    assert!(extra.is_empty(), "unexpected traffic: {extra:?}");
    assert_eq!(tail, vec![ClientMessage::Terminate]);

    assert_eq!(stats.keepalives(), 1);
    assert_eq!(stats.feedback_sent(), 2);
    // the final update after the server's end of copy repeated the last one
    assert_eq!(stats.feedback_skipped(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_written_position_never_moves_back() {
    let (client, mut server) = MockWalSender::pair();
    let server_task = tokio::spawn(async move {
        server.accept_start_replication().await;
        server.read_status_update().await;

        server.send_xlog(Lsn::new(0x300), b"a").await;
        server.send_keepalive(Lsn::new(0x100), true).await;
        let first = server.read_status_update().await;

        server.send_xlog(Lsn::new(0x200), b"b").await;
        server.send_keepalive(Lsn::new(0x250), true).await;
        let second = server.read_status_update().await;

        server.send_keepalive(Lsn::new(0x400), true).await;
        let third = server.read_status_update().await;

        server.finish_copy().await;
        vec![first.written, second.written, third.written]
    });

    let mut session = StreamSession::new(&config(), AbortFlag::new());
    let mut delivered = 0;
    session
        .run(ReplicationConnection::new(client), Lsn::INVALID, |_: &[u8]| {
            delivered += 1
        })
        .await;

    assert_eq!(delivered, 2);
    let written = server_task.await.unwrap();
    assert_eq!(
        written,
        vec![Lsn::new(0x300), Lsn::new(0x300), Lsn::new(0x400)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_status_update_sent_on_interval() {
    let (client, mut server) = MockWalSender::pair();
    let abort = AbortFlag::new();
    let server_abort = abort.clone();
    let server_task = tokio::spawn(async move {
        server.accept_start_replication().await;
        let started = Instant::now();
        server.read_status_update().await;
        server.read_status_update().await;
        let elapsed = started.elapsed();
        server_abort.raise();
        server.read_until_closed().await;
        elapsed
    });

    let mut session = StreamSession::new(&config(), abort);
    let reason = session
        .run(ReplicationConnection::new(client), Lsn::INVALID, |_: &[u8]| {})
        .await;

    assert!(reason.is_intentional());
    let elapsed = server_task.await.unwrap();
    assert!(elapsed >= Duration::from_secs(10), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(11), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_idle_stops_within_a_second() {
    let (connector, servers) = MockConnector::new();
    let mut server = servers.push();
    let server_task = tokio::spawn(async move {
        server.accept_start_replication().await;
        server.read_until_closed().await
    });

    let abort = AbortFlag::new();
    let raiser = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        raiser.raise();
    });

    let started = Instant::now();
    let mut supervisor = Supervisor::new(connector, config(), abort);
    let report = supervisor.run(None, |_: &[u8]| {}).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(2_500));
    assert!(elapsed <= Duration::from_millis(3_600), "{elapsed:?}");
    assert_eq!(report.sessions_started, 1);
    assert_eq!(report.failed_connects, 0);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    let messages = server_task.await.unwrap();
    assert!(messages.contains(&ClientMessage::CopyDone));
}

#[tokio::test(start_paused = true)]
async fn test_abort_while_waiting_for_start_reply() {
    let (connector, servers) = MockConnector::new();
    let mut server = servers.push();
    let server_task = tokio::spawn(async move {
        // take the command and never answer it
        let command = server.read_query().await;
        let rest = server.read_until_closed().await;
        (command, rest)
    });

    let abort = AbortFlag::new();
    let raiser = abort.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        raiser.raise();
    });

    let started = Instant::now();
    let mut supervisor = Supervisor::new(connector, config(), abort);
    let report = tokio::time::timeout(
        Duration::from_secs(60),
        supervisor.run(None, |_: &[u8]| {}),
    )
    .await
    .expect("supervisor ignored the abort flag");

    assert!(started.elapsed() <= Duration::from_millis(3_100));
    assert_eq!(report.sessions_started, 1);
    assert_eq!(report.last_termination.as_deref(), Some("intentional"));
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    let (command, rest) = server_task.await.unwrap();
    assert!(command.starts_with("START_REPLICATION"));
    // never in copy mode, so nothing but the goodbye
    assert_eq!(rest, vec![ClientMessage::Terminate]);
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_reconnects_from_configured_position() {
    let (connector, servers) = MockConnector::new();
    let mut first = servers.push();
    let mut second = servers.push();

    let first_task = tokio::spawn(async move {
        let command = first.accept_start_replication().await;
        first.send_xlog(Lsn::new(0x2000), b"one").await;
        first
            .send_error("terminating connection due to administrator command")
            .await;
        first.read_until_closed().await;
        command
    });
    let second_task = tokio::spawn(async move {
        let command = second.accept_start_replication().await;
        second.send_xlog(Lsn::new(0x3000), b"two").await;
        second.read_until_closed().await;
        (command, Instant::now())
    });

    let mut config = config_with_end(0x3000);
    config.start_lsn = Lsn::new(0x1000);
    let started = Instant::now();
    let mut supervisor = Supervisor::new(connector, config, AbortFlag::new());
    let mut delivered = Vec::new();
    let report = supervisor
        .run(None, |data: &[u8]| delivered.push(data.to_vec()))
        .await;

    assert_eq!(delivered, vec![b"one".to_vec(), b"two".to_vec()]);
    assert_eq!(report.sessions_started, 2);
    assert_eq!(report.failed_sessions, 1);
    assert_eq!(report.last_termination.as_deref(), Some("intentional"));

    let first_command = first_task.await.unwrap();
    let (second_command, second_started) = second_task.await.unwrap();
    assert!(first_command.ends_with("LOGICAL 0/1000"));
    assert!(second_command.ends_with("LOGICAL 0/1000"));
    assert!(second_started.duration_since(started) >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_can_resume_from_last_flushed() {
    let (connector, servers) = MockConnector::new();
    let mut first = servers.push();
    let mut second = servers.push();

    tokio::spawn(async move {
        first.accept_start_replication().await;
        first.send_xlog(Lsn::new(0x2000), b"one").await;
        first.send_keepalive(Lsn::new(0x2000), true).await;
        first.read_status_update().await;
        first.send_error("server closed the connection").await;
        first.read_until_closed().await;
    });
    let second_task = tokio::spawn(async move {
        let command = second.accept_start_replication().await;
        second.send_keepalive(Lsn::new(0x3000), false).await;
        second.read_until_closed().await;
        command
    });

    let mut config = config_with_end(0x3000);
    config.start_lsn = Lsn::new(0x1000);
    config.resume = ResumePolicy::LastFlushed;
    let mut supervisor = Supervisor::new(connector, config, AbortFlag::new());
    let report = supervisor.run(None, |_: &[u8]| {}).await;

    assert_eq!(report.sessions_started, 2);
    let second_command = second_task.await.unwrap();
    assert!(second_command.ends_with("LOGICAL 0/2000"), "{second_command}");
}
