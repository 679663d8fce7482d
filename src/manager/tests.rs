use std::{sync::Arc, time::Duration};

use serde_json::{Value, json};
use tokio::sync::oneshot;

use super::*;
use crate::{
    dispatch::{NoopObserver, tests::Recorder},
    error::ErrorKind,
    mock::{MockPeer, MockQemu, MockScript},
};

async fn scripted(script: MockScript) -> (Manager, MockQemu, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let (stream, mock) = MockQemu::pair(script);
    let manager = Manager::new(stream, recorder.clone());
    manager.connect().await.unwrap();
    recorder.take();
    (manager, mock, recorder)
}

async fn driven(builder: ManagerBuilder) -> (Manager, MockPeer, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let (stream, mut peer) = MockPeer::pair();
    let manager = builder.observer(recorder.clone()).attach(stream);
    let (connected, handshake) = tokio::join!(manager.connect(), peer.handshake());
    connected.unwrap();
    handshake.unwrap();
    recorder.take();
    (manager, peer, recorder)
}

async fn wait_for_state(manager: &Manager, state: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn connect_negotiates_command_mode() {
    let recorder = Arc::new(Recorder::default());
    let (stream, mock) = MockQemu::pair(MockScript::new());
    let manager = Manager::new(stream, recorder.clone());
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let greeting = manager.connect().await.unwrap();
    assert_eq!(greeting.qmp.version.qemu.major, 8);
    assert_eq!(manager.state(), ConnectionState::CommandMode);
    assert_eq!(manager.greeting(), Some(greeting));
    assert_eq!(recorder.take(), vec!["connected", "command_mode"]);
    assert_eq!(mock.commands()[0].execute, "qmp_capabilities");
    assert_eq!(mock.commands()[0].arguments, None);

    let err = manager.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lifecycle);
}

#[tokio::test]
async fn requested_capabilities_are_enabled() {
    let (stream, mut peer) = MockPeer::pair();
    let manager = Manager::builder()
        .enable_capabilities(vec!["oob".to_string()])
        .attach(stream);

    let peer_side = async {
        peer.send_greeting().await.unwrap();
        let caps = peer.recv_command().await.unwrap();
        peer.reply(json!({})).await.unwrap();
        caps
    };
    let (connected, caps) = tokio::join!(manager.connect(), peer_side);
    connected.unwrap();
    assert_eq!(caps.arguments, Some(json!({"enable": ["oob"]})));
}

#[tokio::test]
async fn failed_negotiation_leaves_session_disconnected() {
    let recorder = Arc::new(Recorder::default());
    let (stream, mut peer) = MockPeer::pair();
    let manager = Manager::new(stream, recorder.clone());

    let peer_side = async {
        peer.send_greeting().await.unwrap();
        peer.recv_command().await.unwrap();
        peer.reply_error("GenericError", "negotiation refused")
            .await
            .unwrap();
    };
    let (connected, ()) = tokio::join!(manager.connect(), peer_side);

    let err = connected.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Remote);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        recorder.take(),
        vec!["connected", "error:negotiation refused"]
    );
}

#[tokio::test]
async fn commands_before_command_mode_never_reach_the_wire() {
    let (stream, mock) = MockQemu::pair(MockScript::new());
    let manager = Manager::new(stream, Arc::new(NoopObserver));

    let err = manager.power(PowerAction::Stop).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lifecycle);
    assert!(mock.commands().is_empty());
}

#[tokio::test]
async fn absolute_mouse_lookup() {
    let script = MockScript::new().reply_return(
        "query-mice",
        json!([
            {"name": "QEMU PS/2 Mouse", "index": 1, "current": true, "absolute": false},
            {"name": "QEMU HID Tablet", "index": 2, "current": false, "absolute": true}
        ]),
    );
    let (manager, mock, _) = scripted(script).await;

    assert_eq!(manager.mouse_index_for_absolute(true).await.unwrap(), Some(2));
    assert_eq!(manager.mouse_index_for_absolute(false).await.unwrap(), Some(1));
    assert!(mock.commands().iter().skip(1).all(|c| c.execute == "query-mice"));
}

#[tokio::test]
async fn absolute_mouse_lookup_reports_query_failure() {
    let script = MockScript::new().reply_error("query-mice", "GenericError", "no input");
    let (manager, _mock, _) = scripted(script).await;

    let err = manager.mouse_index_for_absolute(true).await.unwrap_err();
    assert_eq!(err.description(), "no input");
}

#[tokio::test]
async fn monitor_commands_use_verb_and_arguments() {
    let script = MockScript::new()
        .reply_monitor("savevm mysnap", "Completed\r\n")
        .reply_monitor("delvm mysnap", "")
        .reply_monitor("mouse_set 2", "");
    let (manager, mock, _) = scripted(script).await;

    assert_eq!(manager.save_state("mysnap").await.unwrap(), "Completed\r\n");
    assert_eq!(manager.delete_state("mysnap").await.unwrap(), "");
    assert_eq!(manager.mouse_select(2).await.unwrap(), "");

    let lines: Vec<Value> = mock
        .commands()
        .into_iter()
        .skip(1)
        .map(|c| {
            assert_eq!(c.execute, "human-monitor-command");
            c.arguments.unwrap()["command-line"].clone()
        })
        .collect();
    assert_eq!(lines, vec!["savevm mysnap", "delvm mysnap", "mouse_set 2"]);
}

#[tokio::test]
async fn guest_panic_fires_once_without_disturbing_calls() {
    let (manager, mut peer, recorder) = driven(Manager::builder()).await;

    peer.send(&json!({
        "event": "GUEST_PANICKED",
        "data": {"action": "pause"},
        "timestamp": {"seconds": 1700000000, "microseconds": 1}
    }))
    .await
    .unwrap();

    let peer_side = async {
        assert_eq!(peer.recv_command().await.unwrap().execute, "query-status");
        peer.reply(json!({"running": false, "status": "guest-panicked"}))
            .await
            .unwrap();
    };
    let (status, ()) = tokio::join!(manager.query_status(), peer_side);

    assert_eq!(status.unwrap().status, "guest-panicked");
    assert_eq!(recorder.take(), vec!["panicked:Pause"]);
}

#[tokio::test]
async fn events_between_request_and_reply_are_routed_separately() {
    let (manager, mut peer, recorder) = driven(Manager::builder()).await;

    let peer_side = async {
        peer.recv_command().await.unwrap();
        peer.send(&json!({"event": "STOP", "timestamp": {"seconds": 0, "microseconds": 0}}))
            .await
            .unwrap();
        peer.reply(json!({})).await.unwrap();
    };
    let (stopped, ()) = tokio::join!(manager.power(PowerAction::Stop), peer_side);

    stopped.unwrap();
    assert_eq!(recorder.take(), vec!["stopped"]);
}

#[tokio::test]
async fn repeated_verbs_are_paired_in_order() {
    let (manager, mut peer, _) = driven(Manager::builder()).await;

    for n in 1..=2 {
        let peer_side = async {
            assert_eq!(peer.recv_command().await.unwrap().execute, "stop");
            peer.reply(json!({"n": n})).await.unwrap();
        };
        let (reply, ()) = tokio::join!(
            manager.execute::<(), Value>("stop", None),
            peer_side
        );
        assert_eq!(reply.unwrap(), json!({"n": n}));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_are_serialized() {
    let (manager, mut peer, _) = driven(Manager::builder()).await;
    let manager = Arc::new(manager);

    let calls: Vec<_> = (0..6)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.query_status().await })
        })
        .collect();

    for _ in 0..6 {
        peer.recv_command().await.unwrap();
        let overlap = tokio::time::timeout(Duration::from_millis(20), peer.recv_command()).await;
        assert!(overlap.is_err(), "a second command was sent before the reply");
        peer.reply(json!({"running": true, "status": "running"}))
            .await
            .unwrap();
    }

    for call in calls {
        assert!(call.await.unwrap().unwrap().running);
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_call_does_not_shift_replies() {
    let (manager, mut peer, _) =
        driven(Manager::builder().command_timeout(Duration::from_secs(1))).await;

    let started = tokio::time::Instant::now();
    let peer_side = async {
        peer.recv_command().await.unwrap();
    };
    let (first, ()) = tokio::join!(manager.power(PowerAction::Reset), peer_side);
    assert_eq!(first.unwrap_err().kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_secs(1));

    tokio::time::sleep(Duration::from_millis(1)).await;
    peer.reply(json!("late")).await.unwrap();

    let peer_side = async {
        peer.recv_command().await.unwrap();
        peer.reply(json!({"running": true, "status": "running"}))
            .await
            .unwrap();
    };
    let (status, ()) = tokio::join!(manager.query_status(), peer_side);
    assert_eq!(status.unwrap().status, "running");
    assert_eq!(manager.state(), ConnectionState::CommandMode);
}

#[tokio::test]
async fn per_call_timeout_override() {
    let (manager, mut peer, _) = driven(Manager::builder()).await;

    let options = CallOptions {
        timeout: Some(Duration::from_millis(20)),
    };
    let peer_side = async {
        peer.recv_command().await.unwrap();
    };
    let (result, ()) = tokio::join!(
        manager.execute_with_options::<(), Value>("query-status", None, options),
        peer_side
    );
    assert!(matches!(
        result,
        Err(Error::Timeout { timeout }) if timeout == Duration::from_millis(20)
    ));
}

#[tokio::test]
async fn disconnect_mid_call_resolves_the_caller() {
    let (manager, mut peer, recorder) = driven(Manager::builder()).await;

    let peer_side = async move {
        peer.recv_command().await.unwrap();
        drop(peer);
    };
    let (result, ()) = tokio::join!(manager.query_status(), peer_side);

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Transport);
    wait_for_state(&manager, ConnectionState::Disconnected).await;
    assert_eq!(recorder.take(), vec!["disconnected"]);

    let err = manager.power(PowerAction::Stop).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lifecycle);
}

#[tokio::test]
async fn teardown_during_call_abandons_it_with_an_error() {
    let (manager, mut peer, _) = driven(Manager::builder()).await;

    let (tx, rx) = oneshot::channel();
    manager.stop(move |result| {
        let _ = tx.send(result);
    });
    assert_eq!(peer.recv_command().await.unwrap().execute, "stop");

    drop(manager);

    let result = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Lifecycle);
}

#[tokio::test]
async fn shutdown_resolves_pending_and_rejects_later_calls() {
    let (manager, mut peer, recorder) = driven(Manager::builder()).await;
    let manager = Arc::new(manager);

    let call = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.query_mice().await })
    };
    peer.recv_command().await.unwrap();

    manager.shutdown();
    assert_eq!(call.await.unwrap().unwrap_err().kind(), ErrorKind::Lifecycle);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    let err = manager.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lifecycle);
    assert!(!recorder.take().contains(&"disconnected".to_string()));
}

#[tokio::test]
async fn failed_continue_leaves_command_mode() {
    let script = MockScript::new().reply_error("cont", "GenericError", "Resetting the VM failed");
    let (manager, _mock, _) = scripted(script).await;

    let err = manager.continue_boot().await.unwrap_err();
    assert_eq!(err.description(), "Resetting the VM failed");
    assert_eq!(manager.state(), ConnectionState::Connected);

    let err = manager.query_status().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lifecycle);
}

#[tokio::test]
async fn continue_boot_succeeds() {
    let script = MockScript::new().reply_return("cont", json!({}));
    let (manager, mock, _) = scripted(script).await;

    manager.continue_boot().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::CommandMode);
    assert_eq!(mock.commands()[1].execute, "cont");
}

#[tokio::test]
async fn background_power_actions_report_completion() {
    let script = MockScript::new()
        .reply_return("system_powerdown", json!({}))
        .reply_error("system_reset", "GenericError", "reset refused");
    let (manager, _mock, _) = scripted(script).await;

    let (tx, rx) = oneshot::channel();
    manager.power_down(move |result| {
        let _ = tx.send(result);
    });
    rx.await.unwrap().unwrap();

    let (tx, rx) = oneshot::channel();
    manager.reset(move |result| {
        let _ = tx.send(result);
    });
    assert_eq!(rx.await.unwrap().unwrap_err().description(), "reset refused");
}

#[tokio::test]
async fn quit_ends_the_session() {
    let script = MockScript::new()
        .reply_return("quit", json!({}))
        .event_after(
            "quit",
            json!({
                "event": "SHUTDOWN",
                "data": {"guest": false, "reason": "host-qmp-quit"},
                "timestamp": {"seconds": 0, "microseconds": 0}
            }),
        );
    let (manager, mock, recorder) = scripted(script).await;

    let (tx, rx) = oneshot::channel();
    manager.quit(move |result| {
        let _ = tx.send(result);
    });
    rx.await.unwrap().unwrap();
    mock.finish().await.unwrap();

    wait_for_state(&manager, ConnectionState::Disconnected).await;
    assert_eq!(
        recorder.take(),
        vec!["shutdown:false:HostQmpQuit", "disconnected"]
    );
}

#[tokio::test]
async fn malformed_frames_are_reported_and_skipped() {
    let (manager, mut peer, recorder) = driven(Manager::builder()).await;

    peer.send_raw(b"{\"return\" oops}\r\n").await.unwrap();
    peer.send(&json!({"event": "BLOCK_IO_ERROR", "data": {"device": 1}}))
        .await
        .unwrap();

    let peer_side = async {
        peer.recv_command().await.unwrap();
        peer.reply(json!({"running": true, "status": "running"}))
            .await
            .unwrap();
    };
    let (status, ()) = tokio::join!(manager.query_status(), peer_side);
    assert!(status.unwrap().running);

    let calls = recorder.take();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("error:QMP protocol error: malformed JSON frame"));
}

#[tokio::test(start_paused = true)]
async fn malformed_reply_fails_only_its_own_call() {
    let (manager, mut peer, recorder) =
        driven(Manager::builder().command_timeout(Duration::from_secs(1))).await;

    let peer_side = async {
        peer.recv_command().await.unwrap();
        peer.send(&json!({"error": {"class": "GenericError"}}))
            .await
            .unwrap();
    };
    let (first, ()) = tokio::join!(manager.query_status(), peer_side);
    let err = first.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.description().contains("query-status"));

    let peer_side = async {
        peer.recv_command().await.unwrap();
        peer.send(&json!({"error": "flat"})).await.unwrap();
        peer.recv_command().await.unwrap();
        peer.reply(json!({"running": true, "status": "running"}))
            .await
            .unwrap();
    };
    let calls = async {
        let second = manager.query_status().await;
        let third = manager.query_status().await;
        (second, third)
    };
    let ((second, third), ()) = tokio::join!(calls, peer_side);
    assert_eq!(second.unwrap_err().kind(), ErrorKind::Protocol);
    assert_eq!(third.unwrap().status, "running");

    let reported = recorder.take();
    assert_eq!(reported.len(), 2);
    assert!(reported.iter().all(|r| r.starts_with("error:")));
    assert_eq!(manager.state(), ConnectionState::CommandMode);
}

#[tokio::test]
async fn undecodable_reply_is_a_protocol_error() {
    let script = MockScript::new().reply_return("query-status", json!({"running": "yes"}));
    let (manager, _mock, _) = scripted(script).await;

    let err = manager.query_status().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.description().contains("query-status"));
}

#[tokio::test]
async fn greeting_wait_fails_when_peer_hangs_up() {
    let (stream, peer) = MockPeer::pair();
    let manager = Manager::new(stream, Arc::new(NoopObserver));
    drop(peer);

    let err = manager.connect().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[test]
fn monitor_line_joins_with_spaces() {
    assert_eq!(monitor_line("savevm", &["snap"]), "savevm snap");
    assert_eq!(monitor_line("info", &[]), "info");
}
