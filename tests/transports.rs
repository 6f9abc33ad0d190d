//! End-to-end tests over the network, process and file transports.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gensio::{
    Accepter, Aux, ControlOp, Event, Gensio, GensioError, LogLevel, LogSink, Selector, StreamState,
};

mod common;
use common::{pair, payload, start_accepter, Incoming, Recorder, TIMEOUT};

async fn round_trip(accept: &str, connect: impl Fn(u16) -> String) {
    let p = pair(accept, connect).await;
    assert!(p.client.is_client());
    assert!(!p.server.is_client());

    assert_eq!(p.client.write(b"", &Aux::default()).unwrap(), 0);

    let mut expect = Vec::new();
    for len in [1, 512, 100_000] {
        let data = payload(len);
        p.client.write_s(&data, &Aux::default()).await.unwrap();
        expect.extend_from_slice(&data);
        let got = p.server_rec.wait_data(expect.len()).await;
        assert_eq!(got, expect, "client to server, {len} bytes");
    }

    let back = payload(70_000);
    p.server.write_s(&back, &Aux::default()).await.unwrap();
    assert_eq!(p.client_rec.wait_data(back.len()).await, back);
    p.close().await;
}

#[tokio::test]
async fn tcp_round_trips() {
    round_trip("tcp,localhost,0", |port| format!("tcp,localhost,{port}")).await;
}

#[tokio::test]
async fn tcp_reliable_and_not_packet() {
    let p = pair("tcp,0", |port| format!("tcp,localhost,{port}")).await;
    assert!(p.client.is_reliable());
    assert!(!p.client.is_packet());
    assert!(!p.client.is_encrypted());
    assert_eq!(p.client.get_type(0), Some("tcp"));
    let rport = p.client.control(0, true, ControlOp::RAddr, "").unwrap();
    assert!(rport.ends_with(&format!(":{}", p.acc.local_port().unwrap())));
    assert_eq!(p.acc.active_connections(), 1);
    p.close().await;
}

#[tokio::test]
async fn tcp_oob_is_one_byte_ahead_of_data() {
    let p = pair("tcp,localhost,0", |port| format!("tcp,localhost,{port}")).await;
    assert_eq!(p.client.write(b"XY", &Aux::oob()).unwrap(), 1);
    p.server_rec.wait_until("oob byte", |r| r.oob == b"X").await;

    p.client.write_s(b"plain", &Aux::default()).await.unwrap();
    assert_eq!(p.server_rec.wait_data(5).await, b"plain");
    p.close().await;
}

#[tokio::test]
async fn lone_urgent_byte_reaches_the_client() {
    let p = pair("tcp,localhost,0", |port| format!("tcp,localhost,{port}")).await;
    assert_eq!(p.server.control(0, true, ControlOp::EnableOob, "").unwrap(), "1");
    assert!(matches!(
        p.server.control(0, false, ControlOp::EnableOob, "0"),
        Err(GensioError::NotSupported)
    ));

    // nothing follows the urgent byte, so only a priority wakeup delivers it
    assert_eq!(p.server.write(b"U", &Aux::oob()).unwrap(), 1);
    p.client_rec.wait_until("urgent byte", |r| r.oob == b"U").await;
    assert!(p.client_rec.with(|r| r.data.is_empty()));
    p.close().await;
}

#[tokio::test]
async fn oob_needs_an_unfiltered_stack() {
    let p = pair("telnet,tcp,localhost,0", |port| format!("telnet,tcp,localhost,{port}")).await;
    assert!(matches!(
        p.client.write(b"X", &Aux::oob()),
        Err(GensioError::NotSupported)
    ));
    assert!(matches!(
        p.client.write(b"X", &Aux::stream(1)),
        Err(GensioError::NotSupported)
    ));
    p.close().await;
}

#[tokio::test]
async fn remote_close_reported_after_data() {
    let p = pair("tcp,localhost,0", |port| format!("tcp,localhost,{port}")).await;
    p.server.write_s(b"last words", &Aux::default()).await.unwrap();
    p.server.close_s().await.unwrap();
    assert_eq!(p.client_rec.wait_data(10).await, b"last words");
    assert!(matches!(p.client_rec.wait_error().await, GensioError::RemoteClosed));
    assert!(p.client.write(b"more", &Aux::default()).is_err());
    p.client.close_s().await.unwrap();
    assert_eq!(p.client.state(), StreamState::Closed);
    // closing again completes at once
    p.client.close_s().await.unwrap();
    tokio::time::timeout(TIMEOUT, p.acc.wait_idle()).await.unwrap();
}

#[tokio::test]
async fn partial_reads_are_redelivered() {
    let p = pair("tcp,localhost,0", |port| format!("tcp,localhost,{port}")).await;
    p.server_rec.read_limit.store(3, Ordering::Relaxed);
    let data = payload(1000);
    p.client.write_s(&data, &Aux::default()).await.unwrap();
    assert_eq!(p.server_rec.wait_data(1000).await, data);
    p.close().await;
}

#[tokio::test]
async fn write_ready_fires_when_enabled() {
    let p = pair("tcp,localhost,0", |port| format!("tcp,localhost,{port}")).await;
    p.client.write_cb_enable(true);
    p.client_rec.wait_until("write ready", |r| r.write_ready > 0).await;
    p.close().await;
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    let sel = Selector::new();
    let (_, acc, _) = start_accepter("tcp,localhost,0").await;
    let port = acc.local_port().unwrap();
    acc.shutdown().await;

    let io = Gensio::new(&format!("tcp,localhost,{port}"), &sel, None).unwrap();
    let err = io.open_s().await.unwrap_err();
    assert!(matches!(err, GensioError::OpenFailure(_)), "{err:?}");
    assert_eq!(io.state(), StreamState::Closed);
    assert!(io.open_s().await.is_err());
}

#[tokio::test]
async fn udp_first_write_creates_the_server_stream() {
    let (sel, acc, incoming) = start_accepter("udp,localhost,0").await;
    let port = acc.local_port().unwrap();

    let client_rec = Recorder::new();
    let client = Gensio::new(&format!("udp,localhost,{port}"), &sel, Some(client_rec.clone())).unwrap();
    client.open_s().await.unwrap();
    assert!(client.is_packet());
    assert!(!client.is_reliable());
    client.read_cb_enable(true);
    client.write_s(b"A", &Aux::default()).await.unwrap();

    let server = incoming.next().await;
    let server_rec = Recorder::new();
    server.set_handler(server_rec.clone());
    server.read_cb_enable(true);
    assert_eq!(server_rec.wait_data(1).await, b"A");

    for len in [1, 512] {
        let data = payload(len);
        server.write_s(&data, &Aux::default()).await.unwrap();
        client_rec.wait_until("udp reply", |r| r.data.ends_with(&data)).await;
    }
    client.close_s().await.unwrap();
    server.close_s().await.unwrap();
    acc.shutdown().await;
}

#[tokio::test]
async fn sctp_streams_and_unordered_oob() {
    if !gensio::sctp_supported() {
        eprintln!("sctp not available, skipping");
        return;
    }
    let p = pair("sctp(instreams=4,ostreams=4),localhost,0", |port| {
        format!("sctp(instreams=4,ostreams=4),localhost,{port}")
    })
    .await;
    assert!(p.client.is_packet());
    assert!(p.client.is_reliable());
    assert_eq!(
        p.client.control(0, true, ControlOp::Streams, "").unwrap(),
        "instreams=4,ostreams=4"
    );

    p.client.write_s(b"on two", &Aux::stream(2)).await.unwrap();
    p.server_rec
        .wait_until("stream 2", |r| r.streams.iter().any(|(s, d)| *s == 2 && d == b"on two"))
        .await;

    p.client.write_s(b"urgent", &Aux::oob()).await.unwrap();
    p.server_rec.wait_until("unordered", |r| r.oob == b"urgent").await;

    assert!(matches!(
        p.client.write(b"x", &Aux::stream(9)),
        Err(GensioError::OutOfRange(_))
    ));
    p.close().await;
}

#[tokio::test]
async fn sctp_round_trips() {
    if !gensio::sctp_supported() {
        return;
    }
    round_trip("sctp,localhost,0", |port| format!("sctp,localhost,{port}")).await;
}

#[tokio::test]
async fn stdio_cat_echoes() {
    let sel = Selector::new();
    let rec = Recorder::new();
    let io = Gensio::new("stdio,cat", &sel, Some(rec.clone())).unwrap();
    io.open_s().await.unwrap();
    io.read_cb_enable(true);

    let data = payload(20_000);
    io.write_s(&data, &Aux::default()).await.unwrap();
    assert_eq!(rec.wait_data(data.len()).await, data);

    io.control(0, false, ControlOp::CloseOutput, "").unwrap();
    assert!(matches!(rec.wait_error().await, GensioError::RemoteClosed));
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    let code = loop {
        match io.control(0, true, ControlOp::ExitCode, "") {
            Ok(code) => break code,
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await
            }
            Err(e) => panic!("no exit code: {e}"),
        }
    };
    assert_eq!(code, "0");
    io.close_s().await.unwrap();
}

#[tokio::test]
async fn stdio_stderr_channel() {
    let sel = Selector::new();
    let rec = Recorder::new();
    let io = Gensio::new("stdio,sh -c \"echo oops 1>&2; cat\"", &sel, Some(rec.clone())).unwrap();
    io.open_s().await.unwrap();

    let err_rec = Recorder::new();
    let channel = io.open_channel_s("", Some(err_rec.clone())).await.unwrap();
    channel.read_cb_enable(true);
    assert_eq!(err_rec.wait_data(5).await, b"oops\n");
    assert!(io.open_channel_s("", None).await.is_err());

    io.read_cb_enable(true);
    io.write_s(b"out", &Aux::default()).await.unwrap();
    assert_eq!(rec.wait_data(3).await, b"out");
    channel.close_s().await.unwrap();
    io.close_s().await.unwrap();
}

#[tokio::test]
async fn file_transport_reads_then_ends() {
    let dir = common::temp_dir("file-in");
    let infile = dir.join("in.bin");
    let data = payload(50_000);
    std::fs::write(&infile, &data).unwrap();

    let sel = Selector::new();
    let rec = Recorder::new();
    let io = Gensio::new(&format!("file(infile={})", infile.display()), &sel, Some(rec.clone())).unwrap();
    io.open_s().await.unwrap();
    io.read_cb_enable(true);
    assert_eq!(rec.wait_data(data.len()).await, data);
    assert!(matches!(rec.wait_error().await, GensioError::RemoteClosed));
    io.close_s().await.unwrap();
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn file_transport_writes_outfile() {
    let dir = common::temp_dir("file-out");
    let outfile = dir.join("out.bin");
    let sel = Selector::new();
    let io = Gensio::new(
        &format!("file(outfile={},create,mode=600)", outfile.display()),
        &sel,
        None,
    )
    .unwrap();
    io.open_s().await.unwrap();
    let data = payload(30_000);
    io.write_s(&data, &Aux::default()).await.unwrap();
    io.close_s().await.unwrap();
    assert_eq!(std::fs::read(&outfile).unwrap(), data);

    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(&outfile).unwrap().permissions().mode();
    assert_eq!(mode & 0o077, 0);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn trace_filter_records_traffic() {
    let dir = common::temp_dir("trace");
    let log = dir.join("trace.log");
    let p = pair("tcp,localhost,0", |port| {
        format!("trace(dir=both,raw,file={}),tcp,localhost,{port}", log.display())
    })
    .await;
    p.client.write_s(b"hello", &Aux::default()).await.unwrap();
    p.server_rec.wait_data(5).await;
    p.server.write_s(b"world", &Aux::default()).await.unwrap();
    p.client_rec.wait_data(5).await;
    p.close().await;

    let traced = std::fs::read(&log).unwrap();
    assert_eq!(traced, b"helloworld");
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn accepter_sources_client_streams() {
    let (sel, acc, incoming) = start_accepter("tcp,localhost,0").await;
    let port = acc.local_port().unwrap();
    let (_, peer_acc, peer_incoming) = start_accepter("tcp,localhost,0").await;
    let peer_port = peer_acc.local_port().unwrap();

    let io = acc
        .str_to_gensio(&format!("tcp,localhost,{peer_port}"), None)
        .unwrap();
    io.open_s().await.unwrap();
    let laddr = io.control(0, true, ControlOp::LPort, "").unwrap();
    assert_eq!(laddr, port.to_string());

    let server = peer_incoming.next().await;
    let raddr = server.control(0, true, ControlOp::RAddr, "").unwrap();
    assert!(raddr.ends_with(&format!(":{port}")));
    assert_eq!(incoming.pending(), 0);

    io.close_s().await.unwrap();
    server.close_s().await.unwrap();
    drop(sel);
    acc.shutdown().await;
    peer_acc.shutdown().await;
}

#[tokio::test]
async fn paused_accepter_holds_connections() {
    let (sel, acc, incoming) = start_accepter("tcp,localhost,0").await;
    acc.set_accept_callback_enable(false);
    let port = acc.local_port().unwrap();

    let client = Gensio::new(&format!("tcp,localhost,{port}"), &sel, None).unwrap();
    // the kernel completes the handshake from the backlog
    client.open_s().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(incoming.pending(), 0);

    acc.set_accept_callback_enable(true);
    let server = incoming.next().await;
    server.close_s().await.unwrap();
    client.close_s().await.unwrap();
    acc.shutdown().await;
}

struct Panicky;

impl Event for Panicky {
    fn read(&self, _io: &Gensio, _data: gensio::Result<&[u8], &GensioError>, _aux: &Aux) -> usize {
        panic!("handler bug");
    }
}

#[derive(Default)]
struct Capture(Mutex<Vec<(LogLevel, String)>>);

impl LogSink for Capture {
    fn log(&self, level: LogLevel, msg: &str) {
        self.0.lock().unwrap().push((level, msg.to_string()));
    }
}

#[tokio::test]
async fn panicking_callback_closes_only_its_stream() {
    let sink = Arc::new(Capture::default());
    let sel = Selector::with_sink(sink.clone());
    let incoming = Incoming::new();
    let acc = Accepter::new("tcp,localhost,0", &sel, incoming.clone()).unwrap();
    acc.startup().await.unwrap();
    let port = acc.local_port().unwrap();

    let rec = Recorder::new();
    let client = Gensio::new(&format!("tcp,localhost,{port}"), &sel, Some(rec.clone())).unwrap();
    client.open_s().await.unwrap();
    client.read_cb_enable(true);
    let server = incoming.next().await;
    server.set_handler(Arc::new(Panicky));
    server.read_cb_enable(true);

    client.write_s(b"boom", &Aux::default()).await.unwrap();
    assert!(matches!(rec.wait_error().await, GensioError::RemoteClosed));
    let logged = sink.0.lock().unwrap().clone();
    assert!(
        logged
            .iter()
            .any(|(level, msg)| *level == LogLevel::Err && msg.contains("handler bug")),
        "{logged:?}"
    );

    // the accepter keeps serving
    let other = Gensio::new(&format!("tcp,localhost,{port}"), &sel, None).unwrap();
    other.open_s().await.unwrap();
    let second = incoming.next().await;
    second.close_s().await.unwrap();
    other.close_s().await.unwrap();
    client.close_s().await.unwrap();
    tokio::time::timeout(TIMEOUT, acc.wait_idle()).await.unwrap();
    acc.shutdown().await;
}
