//! End-to-end scenarios against worker sessions served from in-process
//! threads over localhost sockets.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use gatewire_exec::{
    serve_connection, ChannelError, ExecCall, ExecContext, Group, Item, OpRegistry,
    MAIN_THREAD_ONLY_DEADLOCK,
};
use gatewire_proto::Value;

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

fn test_registry() -> OpRegistry {
    let mut registry = OpRegistry::with_builtins();
    registry.register("double", |ctx: &ExecContext| {
        let n = ctx
            .channel()
            .receive(None)?
            .into_value()
            .and_then(|v| v.as_int())
            .ok_or_else(|| anyhow::anyhow!("expected an integer"))?;
        ctx.channel().send(Value::Int(n * 2))?;
        Ok(())
    });
    registry.register("add_one", |ctx: &ExecContext| {
        let n = ctx
            .channel()
            .receive(None)?
            .into_value()
            .and_then(|v| v.as_int())
            .ok_or_else(|| anyhow::anyhow!("expected an integer"))?;
        ctx.channel().send(Value::Int(n + 1))?;
        Ok(())
    });
    registry.register("boom", |_ctx: &ExecContext| {
        anyhow::bail!("ValueError: boom")
    });
    registry.register("forward_seven", |ctx: &ExecContext| {
        let sub = ctx
            .channel()
            .receive(None)?
            .into_channel()
            .ok_or_else(|| anyhow::anyhow!("expected a channel"))?;
        sub.send(7i64)?;
        Ok(())
    });
    registry.register("three_then_fail", |ctx: &ExecContext| {
        for i in 1..=3i64 {
            ctx.channel().send(Value::Int(i))?;
        }
        anyhow::bail!("IndexError: pop from empty list")
    });
    registry.register("hold", |ctx: &ExecContext| {
        let _ = ctx.channel().receive(None);
        Ok(())
    });
    registry.register("sleep_forever", |_ctx: &ExecContext| loop {
        std::thread::sleep(Duration::from_secs(3600));
    });
    registry
}

/// Serve `accepts` worker sessions on an ephemeral port, each in its own
/// thread.
fn spawn_worker(accepts: usize) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("cannot bind test worker");
    let addr = listener.local_addr().unwrap().to_string();
    let handle = std::thread::spawn(move || {
        for _ in 0..accepts {
            let (stream, _) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let registry = Arc::new(test_registry());
            std::thread::spawn(move || {
                let _ = serve_connection(stream, registry);
            });
        }
    });
    (addr, handle)
}

fn make_group(addr: &str, n: usize) -> Group {
    let group = Group::new();
    for _ in 0..n {
        group
            .make_gateway(&format!("socket={}", addr))
            .expect("cannot bootstrap test gateway");
    }
    group
}

#[test]
fn echo_roundtrip() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);
    assert_eq!(gw.spec().socket.as_deref(), Some(addr.as_str()));

    let channel = gw.remote_exec(ExecCall::call("double")).unwrap();
    channel.send(21i64).unwrap();
    assert_eq!(channel.receive(WAIT).unwrap(), Item::Value(Value::Int(42)));
    channel.wait_close(WAIT).unwrap();

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn source_text_resolves_as_an_operation() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    // remote_exec accepts bare text; the worker resolves it by name
    let channel = gw.remote_exec("double").unwrap();
    channel.send(4i64).unwrap();
    assert_eq!(channel.receive(WAIT).unwrap(), Item::Value(Value::Int(8)));

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn remote_failure_carries_the_error_text() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    let channel = gw.remote_exec(ExecCall::call("boom")).unwrap();
    match channel.receive(WAIT) {
        Err(ChannelError::Remote(err)) => {
            let text = err.to_string();
            assert!(text.contains("ValueError"), "{}", text);
            assert!(text.contains("boom"), "{}", text);
        }
        other => panic!("expected a remote error, got {:?}", other),
    }

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn unknown_operations_are_reported() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    let channel = gw.remote_exec(ExecCall::call("no_such_op")).unwrap();
    match channel.wait_close(WAIT) {
        Err(ChannelError::Remote(err)) => {
            assert!(err.to_string().contains("no_such_op"), "{}", err);
        }
        other => panic!("expected a remote error, got {:?}", other),
    }

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn kwargs_require_a_callname() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    let call = ExecCall {
        source: Some("double".to_owned()),
        callname: None,
        kwargs: vec![("n".to_owned(), Value::Int(1))],
    };
    assert!(gw.remote_exec(call).is_err());

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn a_channel_travels_through_a_channel() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    let sub = gw.new_channel().unwrap();
    let channel = gw.remote_exec(ExecCall::call("forward_seven")).unwrap();
    channel.send(sub.clone()).unwrap();
    assert_eq!(sub.receive(WAIT).unwrap(), Item::Value(Value::Int(7)));
    channel.wait_close(WAIT).unwrap();

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn endmarker_callback_sees_items_then_marker_then_error() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    let channel = gw.remote_exec(ExecCall::call("three_then_fail")).unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    channel
        .set_callback_with_endmarker(move |item| tx.send(item).unwrap(), Value::Int(-1))
        .unwrap();

    let mut seen = Vec::new();
    loop {
        let item = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let done = item == Item::Value(Value::Int(-1));
        seen.push(item);
        if done {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            Item::Value(Value::Int(1)),
            Item::Value(Value::Int(2)),
            Item::Value(Value::Int(3)),
            Item::Value(Value::Int(-1)),
        ]
    );
    match channel.wait_close(WAIT) {
        Err(ChannelError::Remote(err)) => {
            assert!(err.to_string().contains("IndexError"), "{}", err)
        }
        other => panic!("expected a remote error, got {:?}", other),
    }

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn group_fan_out_and_fan_in() {
    let (addr, server) = spawn_worker(4);
    let group = make_group(&addr, 4);
    assert_eq!(group.len(), 4);

    let mc = group.remote_exec(ExecCall::call("add_one")).unwrap();
    mc.send_each(41i64).unwrap();
    let replies = mc.receive_each(WAIT).unwrap();
    assert_eq!(replies, vec![Item::Value(Value::Int(42)); 4]);
    mc.wait_close(WAIT).unwrap();

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn multichannel_merges_into_one_queue() {
    let (addr, server) = spawn_worker(2);
    let group = make_group(&addr, 2);

    let mc = group.remote_exec(ExecCall::call("double")).unwrap();
    let rx = mc
        .make_receive_queue(Some(Item::Value(Value::Nil)))
        .unwrap();
    mc.send_each(5i64).unwrap();

    let mut values = 0;
    let mut markers = 0;
    while markers < 2 {
        let (_channel, item) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        match item {
            Item::Value(Value::Int(10)) => values += 1,
            Item::Value(Value::Nil) => markers += 1,
            other => panic!("unexpected item {:?}", other),
        }
    }
    assert_eq!(values, 2);

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn remote_status_reports_counters() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    let status = gw.remote_status(WAIT).unwrap();
    assert!(status.receiving);
    assert_eq!(status.numexecuting, 0);

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn remote_info_is_fetched_and_cached() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    let info = gw.remote_info().unwrap();
    assert!(info.platform.contains(std::env::consts::OS));
    assert!(info.pid > 0);
    let again = gw.remote_info().unwrap();
    assert_eq!(info.pid, again.pid);

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn remote_init_threads_is_acknowledged() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    gw.remote_init_threads(Some(4)).unwrap();

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn receive_times_out_without_data() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    let channel = gw.remote_exec(ExecCall::call("hold")).unwrap();
    assert!(matches!(
        channel.receive(Some(Duration::from_millis(200))),
        Err(ChannelError::Timeout)
    ));
    channel.send(Value::Nil).unwrap();
    channel.wait_close(WAIT).unwrap();

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn explicit_close_forbids_sending_but_drains() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    let channel = gw.remote_exec(ExecCall::call("double")).unwrap();
    channel.send(3i64).unwrap();
    assert_eq!(channel.receive(WAIT).unwrap(), Item::Value(Value::Int(6)));
    channel.wait_close(WAIT).unwrap();
    channel.close(None).unwrap();
    assert!(matches!(
        channel.send(1i64),
        Err(ChannelError::Closed(_))
    ));
    channel.wait_close(Some(Duration::from_secs(1))).unwrap();

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn file_adapters_stream_bytes_both_ways() {
    use std::io::{BufRead, Write};

    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    let channel = gw.remote_exec(ExecCall::call("echo")).unwrap();
    let mut writer = channel.make_write_file(false);
    writer.write_all(b"hello\nworld\n").unwrap();
    let mut reader = channel.make_read_file(false);
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "hello\n");
    line.clear();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "world\n");
    channel.close(None).unwrap();

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn reconfigure_switches_text_decoding() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    gw.reconfigure(false, true).unwrap();
    let channel = gw.remote_exec(ExecCall::call("echo")).unwrap();
    channel.send(Value::from("abc")).unwrap();
    assert_eq!(
        channel.receive(WAIT).unwrap(),
        Item::Value(Value::Bytes(b"abc".to_vec()))
    );
    channel.close(None).unwrap();

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn main_thread_only_refuses_concurrent_execution() {
    let (addr, server) = spawn_worker(1);
    let group = Group::new();
    let gw = group
        .make_gateway(&format!("socket={}//execmodel=main-thread-only", addr))
        .unwrap();

    let first = gw.remote_exec(ExecCall::call("hold")).unwrap();
    // wait for the worker to actually start executing
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = gw.remote_status(WAIT).unwrap();
        if status.numexecuting == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "worker never started the task");
        std::thread::sleep(Duration::from_millis(20));
    }

    let second = gw.remote_exec(ExecCall::call("double")).unwrap();
    match second.wait_close(WAIT) {
        Err(ChannelError::Remote(err)) => {
            assert!(
                err.to_string().contains(MAIN_THREAD_ONLY_DEADLOCK),
                "{}",
                err
            );
        }
        other => panic!("expected the deadlock guard, got {:?}", other),
    }

    first.send(Value::Nil).unwrap();
    first.wait_close(WAIT).unwrap();

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn terminate_returns_quickly_with_a_blocked_worker() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    let _channel = gw.remote_exec(ExecCall::call("sleep_forever")).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    group.terminate(Some(Duration::from_secs(1))).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(!gw.is_receiving());
    server.join().unwrap();
}

#[test]
fn terminate_kills_an_unresponsive_peer() {
    // a peer that completes the bootstrap and then plays dead
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let peer = std::thread::spawn(move || {
        use std::io::{Read, Write};
        let (mut stream, _) = listener.accept().unwrap();
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).unwrap();
        let mut blob = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut blob).unwrap();
        stream.write_all(b"1").unwrap();
        // hold the connection open well past the terminate timeout
        std::thread::sleep(Duration::from_secs(3));
    });

    let group = Group::new();
    let gw = group.make_gateway(&format!("socket={}", addr)).unwrap();
    assert!(gw.is_receiving());

    let start = Instant::now();
    group
        .terminate(Some(Duration::from_millis(500)))
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(!gw.is_receiving());
    peer.join().unwrap();
}

#[test]
fn dead_gateways_refuse_new_work() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);
    let gw = group.gateways().remove(0);

    group.terminate(WAIT).unwrap();
    assert!(group.is_empty());
    assert!(gw.remote_exec(ExecCall::call("double")).is_err());
    server.join().unwrap();
}

#[test]
fn install_a_socket_gateway_via_an_existing_one() {
    let (addr, server) = spawn_worker(1);
    let group = make_group(&addr, 1);

    let second = group
        .make_gateway("socket=127.0.0.1:0//installvia=gw0")
        .unwrap();
    let channel = second.remote_exec(ExecCall::call("double")).unwrap();
    channel.send(8i64).unwrap();
    assert_eq!(channel.receive(WAIT).unwrap(), Item::Value(Value::Int(16)));
    channel.wait_close(WAIT).unwrap();
    assert_eq!(group.len(), 2);

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}

#[test]
fn workspace_setup_applies_chdir_and_env() {
    let scratch = tempfile::tempdir().unwrap();
    let workdir = scratch.path().join("workspace");
    let workdir_text = workdir.to_string_lossy().into_owned();

    let (addr, server) = spawn_worker(1);
    let group = Group::new();
    let gw = group
        .make_gateway(&format!(
            "socket={}//chdir={}//env:GATEWIRE_TEST_FLAG=on",
            addr, workdir_text
        ))
        .unwrap();

    // the worker runs in this process, so its cwd/env are observable here
    assert!(workdir.exists());
    assert_eq!(
        std::env::var("GATEWIRE_TEST_FLAG").as_deref(),
        Ok("on")
    );
    let info = gw.remote_info().unwrap();
    assert_eq!(
        std::fs::canonicalize(&info.cwd).unwrap(),
        std::fs::canonicalize(&workdir).unwrap()
    );

    group.terminate(WAIT).unwrap();
    server.join().unwrap();
}
