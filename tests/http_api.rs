//! Live-socket tests of the HTTP unicast dispatcher: request routing,
//! channel binding, the control/streaming split and the monitor
//! endpoints.

mod common;

use common::*;
use dvbfan::cam;
use dvbfan::config::Config;
use dvbfan::fanout::Fanout;
use dvbfan::filter::NoopDemux;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::time::{Duration, Instant};

const TABLE_ID_PAT: u8 = 0x00;
const TABLE_ID_PMT: u8 = 0x02;
const TABLE_ID_SDT: u8 = 0x42;

fn serving_fanout() -> Fanout {
    let mut config = Config::default();
    config.apply("autoconfiguration", "full").unwrap();
    config.apply("multicast", "0").unwrap();
    config.apply("unicast", "1").unwrap();
    config.apply("ip_http", "127.0.0.1").unwrap();
    config.apply("port_http", "0").unwrap();
    let mut fanout = Fanout::new(config, Box::new(NoopDemux), cam::inert()).unwrap();

    let sdt = build_section(
        TABLE_ID_SDT,
        1,
        0,
        &sdt_body(&[(100, 0x01, false, "A"), (200, 0x01, false, "B")]),
    );
    for pkt in packetize(0x11, &sdt, 0) {
        fanout.handle_ts_packet(&pkt).unwrap();
    }
    let pat = build_section(TABLE_ID_PAT, 1, 0, &pat_body(&[(100, 256), (200, 512)]));
    for pkt in packetize(0, &pat, 0) {
        fanout.handle_ts_packet(&pkt).unwrap();
    }
    for (sid, pmt_pid, video, audio) in [(100u16, 256u16, 257u16, 258u16), (200, 512, 513, 514)] {
        let pmt = build_section(
            TABLE_ID_PMT,
            sid,
            1,
            &pmt_body(video, &[(0x02, video, None), (0x04, audio, Some("fra"))]),
        );
        for pkt in packetize(pmt_pid, &pmt, 0) {
            fanout.handle_ts_packet(&pkt).unwrap();
        }
    }
    fanout
}

/// Performs one blocking GET from a helper thread while the reactor
/// runs; returns the raw reply bytes.
fn http_get(fanout: &mut Fanout, addr: SocketAddr, path: &str) -> Vec<u8> {
    let (tx, rx) = mpsc::channel();
    let path = path.to_string();
    let worker = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(stream, "GET {path} HTTP/1.0\r\nHost: test\r\n\r\n").unwrap();
        let mut reply = Vec::new();
        let _ = stream.read_to_end(&mut reply);
        tx.send(reply).unwrap();
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    let reply = loop {
        fanout.tick().unwrap();
        match rx.try_recv() {
            Ok(reply) => break reply,
            Err(mpsc::TryRecvError::Empty) if Instant::now() < deadline => continue,
            Err(e) => panic!("no reply: {e}"),
        }
    };
    worker.join().unwrap();
    reply
}

fn body_of(reply: &[u8]) -> String {
    let text = String::from_utf8_lossy(reply);
    text.split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default()
}

#[test]
fn test_channel_list_endpoints() {
    let mut fanout = serving_fanout();
    let addr = fanout.dispatcher_mut().master_addr().unwrap();

    let reply = http_get(&mut fanout, addr, "/channels_list.json");
    let text = String::from_utf8_lossy(&reply).into_owned();
    assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(text.contains("Content-Type: application/json"));
    let body = body_of(&reply);
    assert!(body.contains("\"service_id\":100"));
    assert!(body.contains("\"service_id\":200"));

    let reply = http_get(&mut fanout, addr, "/channels_list.html");
    let body = body_of(&reply);
    // The Host header from the request shows up in the unicast links.
    assert!(body.contains("http://test/bysid/100"));
}

#[test]
fn test_playlists_over_http() {
    let mut fanout = serving_fanout();
    let addr = fanout.dispatcher_mut().master_addr().unwrap();

    let reply = http_get(&mut fanout, addr, "/playlist.m3u");
    let body = body_of(&reply);
    assert!(body.starts_with("#EXTM3U"));
    assert!(body.contains(&format!("http://127.0.0.1:{}/bysid/100", addr.port())));
}

#[test]
fn test_monitor_endpoints() {
    let mut fanout = serving_fanout();
    let addr = fanout.dispatcher_mut().master_addr().unwrap();

    let reply = http_get(&mut fanout, addr, "/monitor/signal_power.json");
    let body = body_of(&reply);
    assert!(body.contains("\"ber\":0"));

    let reply = http_get(&mut fanout, addr, "/monitor/channels_traffic.json");
    assert!(body_of(&reply).is_empty(), "traffic list hidden before 10s uptime");

    let reply = http_get(&mut fanout, addr, "/monitor/state.xml");
    let body = body_of(&reply);
    assert_eq!(body.matches("<channel ").count(), fanout.channels().len());
    assert!(body.contains("<service_id>100</service_id>"));
    assert!(body.contains("<service_id>200</service_id>"));

    let reply = http_get(&mut fanout, addr, "/cam/menu.xml");
    assert!(body_of(&reply).contains("No CAM support"));
}

#[test]
fn test_unknown_path_is_404() {
    let mut fanout = serving_fanout();
    let addr = fanout.dispatcher_mut().master_addr().unwrap();
    let reply = http_get(&mut fanout, addr, "/nonexistent");
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.0 404 Not found"));

    let reply = http_get(&mut fanout, addr, "/byname/A");
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.0 404 Not found"));

    let reply = http_get(&mut fanout, addr, "/bysid/999");
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.0 404 Not found"));
}

#[test]
fn test_bysid_streams_and_rejects_second_request() {
    let mut fanout = serving_fanout();
    let addr = fanout.dispatcher_mut().master_addr().unwrap();

    let (tx, rx) = mpsc::channel();
    let worker = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(stream, "GET /bysid/200 HTTP/1.0\r\n\r\n").unwrap();

        // Read the streaming header plus at least one TS packet.
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        while collected.len() < 2048 {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(e) => panic!("read failed: {e}"),
            }
        }

        // A second request on a streaming connection gets 501 and a
        // disconnect.
        write!(stream, "GET /bysid/100 HTTP/1.0\r\n\r\n").unwrap();
        let mut tail = Vec::new();
        let _ = stream.read_to_end(&mut tail);
        tx.send((collected, tail)).unwrap();
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut cc = 0u8;
    let (collected, tail) = loop {
        // Keep service 200 data flowing so the client sees TS bytes.
        fanout.handle_ts_packet(&payload_packet(513, cc)).unwrap();
        cc = (cc + 1) & 0x0F;
        fanout.tick().unwrap();
        match rx.try_recv() {
            Ok(result) => break result,
            Err(mpsc::TryRecvError::Empty) if Instant::now() < deadline => continue,
            Err(e) => panic!("no reply: {e}"),
        }
    };
    worker.join().unwrap();

    let text = String::from_utf8_lossy(&collected).into_owned();
    assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
    assert!(text.contains("Content-Type: video/mpegts"));
    let header_end = text.find("\r\n\r\n").unwrap() + 4;
    assert_eq!(collected[header_end], 0x47, "raw TS follows the header");

    let tail = String::from_utf8_lossy(&tail).into_owned();
    assert!(tail.contains("501"), "second request rejected: {tail:?}");

    // Keep the reactor running until the close is processed, then the
    // client list must be empty again.
    let deadline = Instant::now() + Duration::from_secs(5);
    while fanout.dispatcher_mut().client_count() > 0 && Instant::now() < deadline {
        fanout.tick().unwrap();
    }
    assert_eq!(fanout.dispatcher_mut().client_count(), 0);
    assert!(fanout.channels().read()[1].clients.is_empty());
}

#[test]
fn test_bynumber_routing() {
    let mut fanout = serving_fanout();
    let addr = fanout.dispatcher_mut().master_addr().unwrap();

    let reply = http_get(&mut fanout, addr, "/bynumber/9");
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.0 404 Not found"));
}

#[test]
fn test_non_get_method_gets_501() {
    let mut fanout = serving_fanout();
    let addr = fanout.dispatcher_mut().master_addr().unwrap();

    let (tx, rx) = mpsc::channel();
    let worker = std::thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(stream, "POST /channels_list.json HTTP/1.0\r\n\r\n").unwrap();
        let mut reply = Vec::new();
        let _ = stream.read_to_end(&mut reply);
        tx.send(reply).unwrap();
    });
    let deadline = Instant::now() + Duration::from_secs(5);
    let reply = loop {
        fanout.tick().unwrap();
        match rx.try_recv() {
            Ok(reply) => break reply,
            Err(mpsc::TryRecvError::Empty) if Instant::now() < deadline => continue,
            Err(e) => panic!("no reply: {e}"),
        }
    };
    worker.join().unwrap();
    assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.0 501"));
}
