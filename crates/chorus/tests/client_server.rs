//! Drives a real client over a UNIX socket against an in-test server that
//! speaks the wire protocol directly.

use std::{
    cell::{Cell, RefCell},
    io::{Read, Write},
    os::unix::net::{UnixListener, UnixStream},
    rc::Rc,
    time::{Duration, Instant},
};

use chorus::{
    Context, ContextState, ListResult, Stream, StreamFlags, StreamState,
    config::ClientConfig,
    mainloop::Mainloop,
    subscribe::{SubscriptionFacility, SubscriptionMask, SubscriptionOperation},
    timing::{MicroSeconds, Timeval},
    wire::{
        ChannelVolumes, Command, DESCRIPTOR_SIZE, ErrorCode, FrameDescriptor, SampleFormat,
        SampleSpec, TagstructReader, TagstructWriter, VOLUME_NORM,
    },
};
use tempfile::TempDir;

const SPEC: SampleSpec = SampleSpec { format: SampleFormat::S16Le, channels: 2, rate: 44_100 };

struct FakeServer {
    sock: UnixStream,
    tag: u32,
}

impl FakeServer {
    fn read_frame(&mut self) -> Option<(FrameDescriptor, Vec<u8>)> {
        let mut hdr = [0u8; DESCRIPTOR_SIZE];
        if self.sock.read_exact(&mut hdr).is_err() {
            return None;
        }
        let d = FrameDescriptor::decode(&hdr);
        let mut body = vec![0; d.length as usize];
        self.sock.read_exact(&mut body).ok()?;
        Some((d, body))
    }

    /// Next control frame as (command, tag, serialized fields).
    fn expect_control(&mut self) -> (Command, u32, Vec<u8>) {
        let (d, body) = self.read_frame().expect("peer vanished mid-test");
        assert!(d.is_control(), "expected control frame, got channel {}", d.channel);
        let mut ts = TagstructReader::new(&body);
        let command = Command::from_repr(ts.get_u32().unwrap()).unwrap();
        let tag = ts.get_u32().unwrap();
        // Two u32 fields consumed: one tag byte plus four payload bytes each.
        (command, tag, body[10..].to_vec())
    }

    fn expect_bulk(&mut self) -> (FrameDescriptor, Vec<u8>) {
        let (d, body) = self.read_frame().expect("peer vanished mid-test");
        assert!(!d.is_control(), "expected bulk frame");
        (d, body)
    }

    fn write_control(&mut self, w: TagstructWriter) {
        let body = w.into_vec();
        self.sock.write_all(&FrameDescriptor::control(body.len() as u32).encode()).unwrap();
        self.sock.write_all(&body).unwrap();
    }

    fn reply(&mut self, tag: u32, fields: impl FnOnce(&mut TagstructWriter)) {
        let mut w = TagstructWriter::new();
        w.put_u32(Command::Reply as u32);
        w.put_u32(tag);
        fields(&mut w);
        self.write_control(w);
    }

    fn error_reply(&mut self, tag: u32, code: ErrorCode) {
        let mut w = TagstructWriter::new();
        w.put_u32(Command::Error as u32);
        w.put_u32(tag);
        w.put_u32(code as u32);
        self.write_control(w);
    }

    fn push_command(&mut self, command: Command, fields: impl FnOnce(&mut TagstructWriter)) {
        let mut w = TagstructWriter::new();
        w.put_u32(command as u32);
        let tag = self.tag;
        self.tag += 1;
        w.put_u32(tag);
        fields(&mut w);
        self.write_control(w);
    }

    fn send_bulk(&mut self, channel: u32, offset: i64, payload: &[u8]) {
        self.sock
            .write_all(&FrameDescriptor::bulk(payload.len() as u32, channel, offset).encode())
            .unwrap();
        self.sock.write_all(payload).unwrap();
    }

    /// AUTH + SET_CLIENT_NAME, returning the announced client name.
    fn handshake(&mut self) -> String {
        let (command, tag, fields) = self.expect_control();
        assert_eq!(command, Command::Auth);
        {
            let mut ts = TagstructReader::new(&fields);
            let cookie = ts.get_arbitrary(256).unwrap();
            assert_eq!(cookie.len(), 256);
            ts.expect_eof().unwrap();
        }
        self.reply(tag, |_| {});

        let (command, tag, fields) = self.expect_control();
        assert_eq!(command, Command::SetClientName);
        let name = {
            let mut ts = TagstructReader::new(&fields);
            let name = ts.get_string().unwrap().unwrap().to_owned();
            ts.expect_eof().unwrap();
            name
        };
        self.reply(tag, |_| {});
        name
    }
}

struct Fixture {
    _dir: TempDir,
    ml: Mainloop,
    context: Context,
}

fn fixture_with(config: impl FnOnce(&mut ClientConfig)) -> (Fixture, FakeServer) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("native");
    let listener = UnixListener::bind(&path).unwrap();

    let mut conf = ClientConfig {
        autospawn: false,
        cookie_file: Some(dir.path().join("cookie")),
        ..ClientConfig::default()
    };
    config(&mut conf);

    let ml = Mainloop::new();
    let context = Context::with_config(&ml.api(), "test", conf);
    context.connect(Some(path.to_str().unwrap()), None).unwrap();

    let (sock, _) = listener.accept().unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    (Fixture { _dir: dir, ml, context }, FakeServer { sock, tag: 0 })
}

fn fixture() -> (Fixture, FakeServer) {
    fixture_with(|_| {})
}

fn drive_until(ml: &Mainloop, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "condition never became true");
        ml.iterate(false).unwrap();
        std::thread::sleep(Duration::from_micros(200));
    }
}

fn ready_context(f: &Fixture, server: FakeServer) -> (FakeServer, String) {
    let handle = std::thread::spawn(move || {
        let mut server = server;
        let name = server.handshake();
        (server, name)
    });
    drive_until(&f.ml, || f.context.state() == ContextState::Ready);
    let (server, name) = handle.join().unwrap();
    (server, name)
}

fn make_playback_stream(
    f: &Fixture,
    server: FakeServer,
    initial_credit: u32,
) -> (Stream, FakeServer) {
    let stream = Stream::new(&f.context, "music", &SPEC, None).unwrap();
    stream
        .connect_playback(
            None,
            None,
            StreamFlags::empty(),
            ChannelVolumes::uniform(SPEC.channels, VOLUME_NORM),
        )
        .unwrap();

    let handle = std::thread::spawn(move || {
        let mut server = server;
        let (command, tag, fields) = server.expect_control();
        assert_eq!(command, Command::CreatePlaybackStream);
        {
            let mut ts = TagstructReader::new(&fields);
            assert_eq!(ts.get_string().unwrap(), Some("music"));
            assert_eq!(ts.get_sample_spec().unwrap(), SPEC);
            assert_eq!(ts.get_channel_map().unwrap().len(), 2);
            assert_eq!(ts.get_u32().unwrap(), u32::MAX);
            assert_eq!(ts.get_string().unwrap(), None);
            let _maxlength = ts.get_u32().unwrap();
            assert!(!ts.get_boolean().unwrap());
            let _tlength = ts.get_u32().unwrap();
            let _prebuf = ts.get_u32().unwrap();
            let _minreq = ts.get_u32().unwrap();
            let volume = ts.get_cvolume().unwrap();
            assert_eq!(volume.values(), [VOLUME_NORM, VOLUME_NORM]);
            ts.expect_eof().unwrap();
        }
        server.reply(tag, |w| {
            w.put_u32(0);
            w.put_u32(7);
            w.put_u32(initial_credit);
        });
        server
    });

    drive_until(&f.ml, || stream.state() == StreamState::Ready);
    let server = handle.join().unwrap();
    assert_eq!(stream.channel(), 0);
    assert_eq!(stream.device_index(), 7);
    (stream, server)
}

#[test]
fn connect_and_set_name() {
    let (f, server) = fixture();
    assert_eq!(f.context.state(), ContextState::Connecting);

    let (_server, name) = ready_context(&f, server);
    assert_eq!(name, "test");
    assert_eq!(f.context.state(), ContextState::Ready);
    assert_eq!(f.context.last_error(), ErrorCode::Ok);
    assert!(f.context.is_local());
}

#[test]
fn auth_rejection_fails_the_context() {
    let (f, server) = fixture();

    let handle = std::thread::spawn(move || {
        let mut server = server;
        let (command, tag, _) = server.expect_control();
        assert_eq!(command, Command::Auth);
        server.error_reply(tag, ErrorCode::Access);
    });

    drive_until(&f.ml, || f.context.state().is_terminal());
    handle.join().unwrap();
    assert_eq!(f.context.state(), ContextState::Failed);
    assert_eq!(f.context.last_error(), ErrorCode::Access);
}

#[test]
fn playback_write_cycle_honors_credit() {
    let (f, server) = fixture();
    let (server, _) = ready_context(&f, server);
    let (stream, server) = make_playback_stream(&f, server, 1024);

    // Initial credit is all writable.
    assert_eq!(stream.writable_size(), 1024);

    let data: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
    stream.write(&data, 0).unwrap();
    // Half went out against the credit, half is queued.
    assert_eq!(stream.writable_size(), 0);

    let expected = data.clone();
    let handle = std::thread::spawn(move || {
        let mut server = server;
        let (d, body) = server.expect_bulk();
        assert_eq!(d.channel, 0);
        assert_eq!(body.len(), 1024);
        assert_eq!(body, expected[..1024]);

        server.push_command(Command::Request, |w| {
            w.put_u32(0);
            w.put_u32(1024);
        });

        let (d, body) = server.expect_bulk();
        assert_eq!(d.channel, 0);
        assert_eq!(d.offset, 0);
        assert_eq!(body.len(), 1024);
        assert_eq!(body, expected[1024..]);
        server
    });

    drive_until(&f.ml, || stream.counter() == 2048);
    let _server = handle.join().unwrap();
    // Credit conservation: everything sent was covered by grants.
    assert_eq!(stream.counter(), 2048);
    assert_eq!(stream.writable_size(), 0);
}

#[test]
fn reply_timeout_fires_exactly_once() {
    let (f, server) = fixture_with(|c| c.reply_timeout = MicroSeconds::from_millis(300));
    let (mut server, _) = ready_context(&f, server);

    let hits = Rc::new(Cell::new(0));
    let h = Rc::clone(&hits);
    let started = Instant::now();
    f.context
        .stat(Box::new(move |info| {
            assert!(info.is_none());
            h.set(h.get() + 1);
        }))
        .unwrap();

    // The server swallows the request and never answers.
    let swallow = std::thread::spawn(move || {
        let (command, _tag, _) = server.expect_control();
        assert_eq!(command, Command::Stat);
        // Hold the socket open until the client is done.
        let _ = server.read_frame();
    });

    drive_until(&f.ml, || hits.get() > 0);
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(hits.get(), 1);
    assert_eq!(f.context.last_error(), ErrorCode::Timeout);
    assert_eq!(f.context.state(), ContextState::Ready);

    // Late replies for the expired tag are dropped silently.
    for _ in 0..5 {
        f.ml.iterate(false).unwrap();
    }
    assert_eq!(hits.get(), 1);

    f.context.disconnect();
    drop(f);
    swallow.join().unwrap();
}

#[test]
fn server_killing_a_stream_leaves_the_context_ready() {
    let (f, server) = fixture();
    let (server, _) = ready_context(&f, server);
    let (stream, mut server) = make_playback_stream(&f, server, 0);

    let states = Rc::new(RefCell::new(Vec::new()));
    let s = Rc::clone(&states);
    stream.set_state_callback(Box::new(move |st| s.borrow_mut().push(st)));

    server.push_command(Command::PlaybackStreamKilled, |w| w.put_u32(0));

    drive_until(&f.ml, || stream.state().is_terminal());
    assert_eq!(stream.state(), StreamState::Failed);
    assert_eq!(*states.borrow(), [StreamState::Failed]);
    assert_eq!(f.context.last_error(), ErrorCode::Killed);
    assert_eq!(f.context.state(), ContextState::Ready);
}

#[test]
fn cancelled_operation_never_calls_back() {
    let (f, server) = fixture();
    let (mut server, _) = ready_context(&f, server);

    let fired = Rc::new(Cell::new(false));
    let fi = Rc::clone(&fired);
    let op = f.context.stat(Box::new(move |_| fi.set(true))).unwrap();
    op.cancel();
    // Cancel after cancel is a no-op.
    op.cancel();

    // A second call behind the cancelled one proves the reply for the
    // cancelled tag was consumed and dropped without reaching a callback.
    let answered = Rc::new(Cell::new(false));
    let a = Rc::clone(&answered);
    f.context
        .get_server_info(Box::new(move |info| {
            assert!(info.is_some());
            a.set(true);
        }))
        .unwrap();

    let handle = std::thread::spawn(move || {
        let (command, tag, _) = server.expect_control();
        assert_eq!(command, Command::Stat);
        server.reply(tag, |w| {
            w.put_u32(1);
            w.put_u32(2);
            w.put_u32(3);
            w.put_u32(4);
            w.put_u32(5);
        });

        let (command, tag, _) = server.expect_control();
        assert_eq!(command, Command::GetServerInfo);
        server.reply(tag, |w| {
            w.put_string(Some("chorusd"));
            w.put_string(Some("0.1.0"));
            w.put_string(Some("user"));
            w.put_string(Some("host"));
            w.put_sample_spec(&SPEC);
            w.put_string(Some("sink0"));
            w.put_string(None);
        });
    });

    drive_until(&f.ml, || answered.get());
    handle.join().unwrap();
    assert!(!fired.get());
}

#[test]
fn record_stream_delivers_and_buffers() {
    let (f, server) = fixture();
    let (server, _) = ready_context(&f, server);

    let stream = Stream::new(&f.context, "mic", &SPEC, None).unwrap();
    stream.connect_record(None, None, StreamFlags::empty()).unwrap();

    let handle = std::thread::spawn(move || {
        let mut server = server;
        let (command, tag, fields) = server.expect_control();
        assert_eq!(command, Command::CreateRecordStream);
        {
            let mut ts = TagstructReader::new(&fields);
            assert_eq!(ts.get_string().unwrap(), Some("mic"));
            assert_eq!(ts.get_sample_spec().unwrap(), SPEC);
            ts.get_channel_map().unwrap();
            ts.get_u32().unwrap();
            ts.get_string().unwrap();
            ts.get_u32().unwrap();
            ts.get_boolean().unwrap();
            let _fragsize = ts.get_u32().unwrap();
            ts.expect_eof().unwrap();
        }
        server.reply(tag, |w| {
            w.put_u32(4);
            w.put_u32(11);
        });
        server
    });
    drive_until(&f.ml, || stream.state() == StreamState::Ready);
    let mut server = handle.join().unwrap();
    assert_eq!(stream.channel(), 4);

    // With a read callback the data is delivered immediately.
    let got = Rc::new(RefCell::new(Vec::new()));
    let g = Rc::clone(&got);
    stream.set_read_callback(Box::new(move |chunk| {
        g.borrow_mut().extend_from_slice(chunk.as_slice());
    }));
    server.send_bulk(4, 0, b"first");
    drive_until(&f.ml, || !got.borrow().is_empty());
    assert_eq!(*got.borrow(), b"first");

    // Without one, fragments queue up for peek/discard.
    let stream2 = Stream::new(&f.context, "mic2", &SPEC, None).unwrap();
    stream2.connect_record(None, None, StreamFlags::empty()).unwrap();
    let handle = std::thread::spawn(move || {
        let (_, tag, _) = server.expect_control();
        server.reply(tag, |w| {
            w.put_u32(5);
            w.put_u32(12);
        });
        server.send_bulk(5, 0, b"buffered");
        server
    });
    drive_until(&f.ml, || stream2.readable_size() == 8);
    let _server = handle.join().unwrap();

    let chunk = stream2.peek().unwrap();
    assert_eq!(chunk.as_slice(), b"buffered");
    stream2.discard(3);
    assert_eq!(stream2.readable_size(), 5);
    assert_eq!(stream2.peek().unwrap().as_slice(), b"fered");
}

#[test]
fn subscription_events_reach_the_callback() {
    let (f, server) = fixture();
    let (mut server, _) = ready_context(&f, server);

    let events = Rc::new(RefCell::new(Vec::new()));
    let e = Rc::clone(&events);
    f.context.set_subscribe_callback(Box::new(move |event, index| {
        e.borrow_mut().push((event, index));
    }));

    let acked = Rc::new(Cell::new(false));
    let a = Rc::clone(&acked);
    f.context
        .subscribe(
            SubscriptionMask::SINK_INPUT | SubscriptionMask::SINK,
            Some(Box::new(move |ok| a.set(ok))),
        )
        .unwrap();

    let handle = std::thread::spawn(move || {
        let (command, tag, fields) = server.expect_control();
        assert_eq!(command, Command::Subscribe);
        let mut ts = TagstructReader::new(&fields);
        assert_eq!(ts.get_u32().unwrap(), 5);
        server.reply(tag, |_| {});

        // sink-input removed, index 9
        server.push_command(Command::SubscribeEvent, |w| {
            w.put_u32(2 | 32);
            w.put_u32(9);
        });
    });

    drive_until(&f.ml, || acked.get() && !events.borrow().is_empty());
    handle.join().unwrap();

    let (event, index) = events.borrow()[0];
    assert_eq!(event.facility, SubscriptionFacility::SinkInput);
    assert_eq!(event.operation, SubscriptionOperation::Removed);
    assert!(event.matches(SubscriptionMask::SINK_INPUT));
    assert_eq!(index, 9);
}

#[test]
fn sink_info_list_streams_items_then_end() {
    let (f, server) = fixture();
    let (mut server, _) = ready_context(&f, server);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let ended = Rc::new(Cell::new(false));
    let s = Rc::clone(&seen);
    let en = Rc::clone(&ended);
    f.context
        .get_sink_info_list(Box::new(move |r| match r {
            ListResult::Item(i) => s.borrow_mut().push((i.index, i.name.clone(), i.volume)),
            ListResult::End => en.set(true),
            ListResult::Error => panic!("unexpected list error"),
        }))
        .unwrap();

    let handle = std::thread::spawn(move || {
        let (command, tag, _) = server.expect_control();
        assert_eq!(command, Command::GetSinkInfoList);
        server.reply(tag, |w| {
            for (index, name) in [(0u32, "sink0"), (1, "sink1")] {
                w.put_u32(index);
                w.put_string(Some(name));
                w.put_string(Some("a test sink"));
                w.put_sample_spec(&SPEC);
                w.put_u32(u32::MAX);
                w.put_u32(VOLUME_NORM);
                w.put_u32(index + 100);
                w.put_string(Some("monitor"));
                w.put_usec(MicroSeconds(1500));
            }
        });
    });

    drive_until(&f.ml, || ended.get());
    handle.join().unwrap();
    assert_eq!(
        *seen.borrow(),
        [(0, "sink0".to_owned(), VOLUME_NORM), (1, "sink1".to_owned(), VOLUME_NORM)]
    );
}

#[test]
fn failed_lookup_reports_none_and_caches_the_error() {
    let (f, server) = fixture();
    let (mut server, _) = ready_context(&f, server);

    let answered = Rc::new(Cell::new(false));
    let a = Rc::clone(&answered);
    f.context
        .get_sink_info_by_name(
            "nosuch",
            Box::new(move |info| {
                assert!(info.is_none());
                a.set(true);
            }),
        )
        .unwrap();

    let handle = std::thread::spawn(move || {
        let (command, tag, fields) = server.expect_control();
        assert_eq!(command, Command::GetSinkInfo);
        let mut ts = TagstructReader::new(&fields);
        assert_eq!(ts.get_u32().unwrap(), u32::MAX);
        assert_eq!(ts.get_string().unwrap(), Some("nosuch"));
        server.error_reply(tag, ErrorCode::NoEntity);
    });

    drive_until(&f.ml, || answered.get());
    handle.join().unwrap();
    assert_eq!(f.context.last_error(), ErrorCode::NoEntity);
    assert_eq!(f.context.state(), ContextState::Ready);
}

#[test]
fn upload_stream_writes_exactly_and_terminates() {
    let (f, server) = fixture();
    let (server, _) = ready_context(&f, server);

    let stream = Stream::new(&f.context, "sample", &SPEC, None).unwrap();
    stream.connect_upload(8).unwrap();

    let handle = std::thread::spawn(move || {
        let mut server = server;
        let (command, tag, fields) = server.expect_control();
        assert_eq!(command, Command::CreateUploadStream);
        {
            let mut ts = TagstructReader::new(&fields);
            assert_eq!(ts.get_string().unwrap(), Some("sample"));
            assert_eq!(ts.get_sample_spec().unwrap(), SPEC);
            assert_eq!(ts.get_u32().unwrap(), 8);
            ts.expect_eof().unwrap();
        }
        server.reply(tag, |w| {
            w.put_u32(3);
            w.put_u32(8);
        });

        let (d, body) = server.expect_bulk();
        assert_eq!(d.channel, 3);
        assert_eq!(body, b"\x01\x02\x03\x04\x05\x06\x07\x08");

        let (command, tag, _) = server.expect_control();
        assert_eq!(command, Command::FinishUploadStream);
        server.reply(tag, |_| {});
        server
    });

    drive_until(&f.ml, || stream.state() == StreamState::Ready);
    stream.write(&[1, 2, 3, 4, 5, 6, 7, 8], 0).unwrap();

    let finished = Rc::new(Cell::new(false));
    let fi = Rc::clone(&finished);
    stream.finish_upload(Some(Box::new(move |ok| fi.set(ok)))).unwrap();

    drive_until(&f.ml, || finished.get());
    let _server = handle.join().unwrap();
    assert_eq!(stream.state(), StreamState::Terminated);
}

#[test]
fn latency_uses_server_clock_when_clocks_agree() {
    let (f, server) = fixture();
    let (server, _) = ready_context(&f, server);
    let (stream, server) = make_playback_stream(&f, server, 0);

    let result = Rc::new(RefCell::new(None));
    let r = Rc::clone(&result);
    stream
        .get_latency_info(Some(Box::new(move |info| {
            *r.borrow_mut() = Some(info.copied());
        })))
        .unwrap();

    let handle = std::thread::spawn(move || {
        let mut server = server;
        let (command, tag, fields) = server.expect_control();
        assert_eq!(command, Command::GetPlaybackLatency);
        let (local, counter) = {
            let mut ts = TagstructReader::new(&fields);
            assert_eq!(ts.get_u32().unwrap(), 0);
            let local = ts.get_timeval().unwrap();
            let counter = ts.get_u64().unwrap();
            ts.expect_eof().unwrap();
            (local, counter)
        };
        // One microsecond after the client's stamp: inside (local, now).
        let remote = local.add_usec(MicroSeconds(1));
        server.reply(tag, |w| {
            w.put_usec(MicroSeconds(5_000));
            w.put_usec(MicroSeconds(2_000));
            w.put_usec(MicroSeconds::ZERO);
            w.put_boolean(true);
            w.put_u32(4096);
            w.put_timeval(local);
            w.put_timeval(remote);
            w.put_u64(counter);
        });
        server
    });

    drive_until(&f.ml, || result.borrow().is_some());
    let _server = handle.join().unwrap();

    let info = result.borrow().unwrap().unwrap();
    assert!(info.synchronized_clocks);
    assert_eq!(info.transport_usec, MicroSeconds(1));
    assert!(info.playing);
    assert_eq!(info.queue_length, 4096);
    assert_eq!(info.buffer_usec, MicroSeconds(5_000));

    // get_time never goes backwards.
    let t1 = stream.get_time(Some(&info));
    let t2 = stream.get_time(None);
    assert!(t2 >= t1);
}

#[test]
fn latency_estimates_when_clocks_disagree() {
    let (f, server) = fixture();
    let (server, _) = ready_context(&f, server);
    let (stream, server) = make_playback_stream(&f, server, 0);

    let result = Rc::new(RefCell::new(None));
    let r = Rc::clone(&result);
    stream
        .get_latency_info(Some(Box::new(move |info| {
            *r.borrow_mut() = Some(info.copied());
        })))
        .unwrap();

    let handle = std::thread::spawn(move || {
        let mut server = server;
        let (command, tag, fields) = server.expect_control();
        assert_eq!(command, Command::GetPlaybackLatency);
        let (local, counter) = {
            let mut ts = TagstructReader::new(&fields);
            ts.get_u32().unwrap();
            (ts.get_timeval().unwrap(), ts.get_u64().unwrap())
        };
        // A clock an hour behind cannot satisfy local < server < now.
        let remote = Timeval::new(local.sec - 3600, local.usec);
        server.reply(tag, |w| {
            w.put_usec(MicroSeconds::ZERO);
            w.put_usec(MicroSeconds::ZERO);
            w.put_usec(MicroSeconds::ZERO);
            w.put_boolean(false);
            w.put_u32(0);
            w.put_timeval(local);
            w.put_timeval(remote);
            w.put_u64(counter);
        });
        server
    });

    drive_until(&f.ml, || result.borrow().is_some());
    let _server = handle.join().unwrap();

    let info = result.borrow().unwrap().unwrap();
    assert!(!info.synchronized_clocks);
    // Half a round trip measured on the local clock: tiny but nonnegative,
    // and certainly less than a second in-process.
    assert!(info.transport_usec < MicroSeconds(1_000_000));
}

#[test]
fn transport_death_fails_everything_and_caches_the_error() {
    let (f, server) = fixture();
    let (server, _) = ready_context(&f, server);
    let (stream, mut server) = make_playback_stream(&f, server, 0);

    let answered = Rc::new(Cell::new(0));
    let a = Rc::clone(&answered);
    f.context
        .stat(Box::new(move |info| {
            assert!(info.is_none());
            a.set(a.get() + 1);
        }))
        .unwrap();

    // Swallow the request, then slam the connection shut.
    let handle = std::thread::spawn(move || {
        let (command, _, _) = server.expect_control();
        assert_eq!(command, Command::Stat);
        drop(server);
    });

    drive_until(&f.ml, || f.context.state().is_terminal());
    handle.join().unwrap();
    assert_eq!(f.context.state(), ContextState::Failed);
    assert_eq!(f.context.last_error(), ErrorCode::ConnectionTerminated);
    // The stream went down first, then the pending call completed.
    assert_eq!(stream.state(), StreamState::Failed);
    assert_eq!(answered.get(), 1);

    // Failure is sticky: new work is rejected synchronously.
    let err = f.context.stat(Box::new(|_| {})).unwrap_err();
    assert_eq!(err, ErrorCode::ConnectionTerminated);
    assert!(stream.write(b"xx", 0).is_err());
}

#[test]
fn context_drain_completes_when_idle() {
    let (f, server) = fixture();
    let (mut server, _) = ready_context(&f, server);

    let acked = Rc::new(Cell::new(false));
    let a = Rc::clone(&acked);
    f.context.set_default_sink("sink0", Some(Box::new(move |ok| a.set(ok)))).unwrap();

    let drained = Rc::new(Cell::new(false));
    let d = Rc::clone(&drained);
    let op = f.context.drain(Box::new(move || d.set(true)));
    assert!(op.is_some(), "a request is in flight, drain must wait");

    let handle = std::thread::spawn(move || {
        let (command, tag, fields) = server.expect_control();
        assert_eq!(command, Command::SetDefaultSink);
        let mut ts = TagstructReader::new(&fields);
        assert_eq!(ts.get_string().unwrap(), Some("sink0"));
        server.reply(tag, |_| {});
        server
    });

    drive_until(&f.ml, || acked.get() && drained.get());
    let _server = handle.join().unwrap();
    assert!(!f.context.is_pending());
    assert!(f.context.drain(Box::new(|| {})).is_none());
}

#[test]
fn stream_control_commands_round_trip() {
    let (f, server) = fixture();
    let (server, _) = ready_context(&f, server);
    let (stream, server) = make_playback_stream(&f, server, 0);

    let corked = Rc::new(Cell::new(false));
    let c = Rc::clone(&corked);
    stream.cork(true, Some(Box::new(move |ok| c.set(ok)))).unwrap();

    let drained = Rc::new(Cell::new(false));
    let d = Rc::clone(&drained);
    stream.drain(Some(Box::new(move |ok| d.set(ok)))).unwrap();

    let handle = std::thread::spawn(move || {
        let mut server = server;
        let (command, tag, fields) = server.expect_control();
        assert_eq!(command, Command::CorkPlaybackStream);
        {
            let mut ts = TagstructReader::new(&fields);
            assert_eq!(ts.get_u32().unwrap(), 0);
            assert!(ts.get_boolean().unwrap());
            ts.expect_eof().unwrap();
        }
        server.reply(tag, |_| {});

        // The cork also triggered a quiet latency poll.
        let (command, tag, _) = server.expect_control();
        assert_eq!(command, Command::GetPlaybackLatency);
        server.error_reply(tag, ErrorCode::NoEntity);

        let (command, tag, fields) = server.expect_control();
        assert_eq!(command, Command::DrainPlaybackStream);
        {
            let mut ts = TagstructReader::new(&fields);
            assert_eq!(ts.get_u32().unwrap(), 0);
            ts.expect_eof().unwrap();
        }
        server.reply(tag, |_| {});
        server
    });

    drive_until(&f.ml, || corked.get() && drained.get());
    let _server = handle.join().unwrap();
}

#[test]
fn interpolated_clock_is_monotonic_and_freezes_under_cork() {
    let (f, server) = fixture();
    let (server, _) = ready_context(&f, server);

    let stream = Stream::new(&f.context, "music", &SPEC, None).unwrap();
    stream
        .connect_playback(
            None,
            None,
            StreamFlags::INTERPOLATE_LATENCY,
            ChannelVolumes::uniform(SPEC.channels, VOLUME_NORM),
        )
        .unwrap();

    // The interpolating client keeps polling latency in the background;
    // answer everything until it hangs up.
    let handle = std::thread::spawn(move || {
        let mut server = server;
        let (command, tag, _) = server.expect_control();
        assert_eq!(command, Command::CreatePlaybackStream);
        server.reply(tag, |w| {
            w.put_u32(0);
            w.put_u32(7);
            w.put_u32(0);
        });

        while let Some((d, body)) = server.read_frame() {
            if !d.is_control() {
                continue;
            }
            let (command, tag, local, counter) = {
                let mut ts = TagstructReader::new(&body);
                let command = Command::from_repr(ts.get_u32().unwrap()).unwrap();
                let tag = ts.get_u32().unwrap();
                match command {
                    Command::GetPlaybackLatency => {
                        ts.get_u32().unwrap();
                        let local = ts.get_timeval().unwrap();
                        let counter = ts.get_u64().unwrap();
                        (command, tag, local, counter)
                    }
                    _ => (command, tag, Timeval::ZERO, 0),
                }
            };
            match command {
                Command::GetPlaybackLatency => server.reply(tag, |w| {
                    w.put_usec(MicroSeconds::ZERO);
                    w.put_usec(MicroSeconds::ZERO);
                    w.put_usec(MicroSeconds::ZERO);
                    w.put_boolean(true);
                    w.put_u32(0);
                    w.put_timeval(local);
                    w.put_timeval(local.add_usec(MicroSeconds(1)));
                    w.put_u64(counter);
                }),
                _ => server.reply(tag, |_| {}),
            }
        }
    });

    drive_until(&f.ml, || stream.state() == StreamState::Ready);

    let mut last = MicroSeconds::ZERO;
    for _ in 0..40 {
        f.ml.iterate(false).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let t = stream.get_interpolated_time();
        assert!(t >= last, "interpolated clock went backwards");
        last = t;
    }

    let corked = Rc::new(Cell::new(false));
    let c = Rc::clone(&corked);
    stream.cork(true, Some(Box::new(move |ok| c.set(ok)))).unwrap();
    drive_until(&f.ml, || corked.get());

    let frozen = stream.get_interpolated_time();
    std::thread::sleep(Duration::from_millis(20));
    for _ in 0..5 {
        f.ml.iterate(false).unwrap();
    }
    assert_eq!(stream.get_interpolated_time(), frozen, "corked clock must not advance");

    drop(f);
    handle.join().unwrap();
}

static PREFORK_RAN: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
static POSTFORK_RAN: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

#[test]
fn autospawn_runs_the_daemon_binary_and_proceeds_to_auth() {
    use std::sync::atomic::Ordering;

    fn prefork() {
        PREFORK_RAN.store(true, Ordering::SeqCst);
    }
    fn postfork() {
        POSTFORK_RAN.store(true, Ordering::SeqCst);
    }

    let dir = TempDir::new().unwrap();
    let conf = ClientConfig {
        autospawn: true,
        daemon_binary: "/bin/true".into(),
        cookie_file: Some(dir.path().join("cookie")),
        ..ClientConfig::default()
    };

    let ml = Mainloop::new();
    let context = Context::with_config(&ml.api(), "spawned", conf);
    let spawn = chorus::SpawnApi {
        prefork: Some(prefork),
        postfork: Some(postfork),
        atfork: None,
    };

    // No server is configured and none is listening, so the context forks
    // the (stand-in) daemon, adopts its end of the socketpair and starts
    // the handshake on it.
    context.connect(None, Some(spawn)).unwrap();
    assert_eq!(context.state(), ContextState::Authorizing);
    assert!(context.is_local());
    assert!(PREFORK_RAN.load(Ordering::SeqCst));
    assert!(POSTFORK_RAN.load(Ordering::SeqCst));

    context.disconnect();
}

#[test]
fn stream_disconnect_terminates_cleanly() {
    let (f, server) = fixture();
    let (server, _) = ready_context(&f, server);
    let (stream, server) = make_playback_stream(&f, server, 0);

    stream.disconnect().unwrap();

    let handle = std::thread::spawn(move || {
        let mut server = server;
        let (command, tag, fields) = server.expect_control();
        assert_eq!(command, Command::DeletePlaybackStream);
        let mut ts = TagstructReader::new(&fields);
        assert_eq!(ts.get_u32().unwrap(), 0);
        server.reply(tag, |_| {});
        server
    });

    drive_until(&f.ml, || stream.state().is_terminal());
    let _server = handle.join().unwrap();
    assert_eq!(stream.state(), StreamState::Terminated);
    assert_eq!(f.context.state(), ContextState::Ready);
}
