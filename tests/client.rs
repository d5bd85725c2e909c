use matches::assert_matches;
use rueckenmark::catalog::{DeploymentModel, ProjectDescription};
use rueckenmark::client::{
    AlreadyStarted, LoadFailed, ProcessClient, StartFailed, StartupFailed, StopFailed,
};
use rueckenmark::name_service::{MemoryNameService, NameService, NotFound};
use rueckenmark::process::SpawnOptions;
use rueckenmark::protocol::{
    self, CreateLogDirRequest, DeathAnnouncement, ExitStatus, InfoBundle, MoveLogDirRequest,
    StartRequest, TypekitRegistry,
};
use rueckenmark::remote_process::Unsupported;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn info_bundle() -> InfoBundle {
    let description = ProjectDescription {
        name: "vision".to_string(),
        deployments: vec![DeploymentModel {
            name: "camera".to_string(),
            project: "vision".to_string(),
            task_names: vec!["camera".to_string(), "filter".to_string()],
        }],
    }
    .render()
    .expect("rendering the description");
    InfoBundle {
        projects: [("vision".to_string(), description)].iter().cloned().collect(),
        deployments: [("camera".to_string(), "vision".to_string())]
            .iter()
            .cloned()
            .collect(),
        typekits: [(
            "std".to_string(),
            TypekitRegistry {
                registry: "<registry/>".to_string(),
                typelist: "int\n".to_string(),
            },
        )]
        .iter()
        .cloned()
        .collect(),
        server_pid: 4242,
    }
}

/// Runs `script` against the one connection a test makes. Assertion
/// failures inside the script surface when the test joins the handle.
fn fake_server(script: impl FnOnce(&mut TcpStream) + Send + 'static) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("binding");
    let port = listener.local_addr().expect("local addr").port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accepting");
        script(&mut stream);
    });
    (port, handle)
}

fn serve_handshake(stream: &mut TcpStream) {
    expect_command(stream, protocol::CMD_GET_INFO);
    protocol::write_message(stream, &info_bundle()).expect("writing the info bundle");
}

fn expect_command(stream: &mut TcpStream, expected: u8) {
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).expect("reading a command byte");
    assert_eq!(buf[0], expected, "unexpected command {:?}", buf[0] as char);
}

fn expect_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    assert_eq!(
        stream.read(&mut buf).expect("reading"),
        0,
        "expected the client to hang up"
    );
}

fn read_name(stream: &mut TcpStream) -> String {
    protocol::read_message(stream).expect("reading a name")
}

fn connect(port: u16) -> (ProcessClient, Arc<MemoryNameService>) {
    let names = Arc::new(MemoryNameService::new());
    let client = ProcessClient::connect("127.0.0.1", port, names.clone()).expect("connecting");
    (client, names)
}

#[test]
fn connects_and_downloads_the_catalog() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_eof(s);
    });
    let (client, _) = connect(port);
    assert_eq!(client.server_pid(), 4242);
    assert_eq!(client.host_id(), format!("127.0.0.1:{}:4242", port));
    assert!(client.available_projects().contains_key("vision"));
    assert_eq!(
        client.available_deployments().get("camera").map(String::as_str),
        Some("vision")
    );
    assert!(client.available_typekits().contains_key("std"));
    client.disconnect();
    handle.join().expect("server thread");
}

#[test]
fn a_server_that_hangs_up_fails_the_handshake() {
    let (port, handle) = fake_server(|s| {
        expect_command(s, protocol::CMD_GET_INFO);
        // Hang up instead of answering.
    });
    let names = Arc::new(MemoryNameService::new());
    let e = ProcessClient::connect("127.0.0.1", port, names).expect_err("no info bundle");
    assert!(e.downcast_ref::<StartupFailed>().is_some());
    handle.join().expect("server thread");
}

#[test]
fn loads_projects_once() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_command(s, protocol::CMD_LOAD_PROJECT);
        assert_eq!(read_name(s), "vision");
        s.write_all(&[protocol::REPLY_OK]).expect("acking");
        expect_eof(s);
    });
    let (mut client, _) = connect(port);
    client.load_project("vision").expect("first load");
    // The second load is answered from memory; the script would flag a
    // second command on the wire as an early non-EOF byte.
    client.load_project("vision").expect("second load");
    let e = client.load_project("nope").expect_err("unknown project");
    assert_matches!(e.downcast_ref::<NotFound>(), Some(NotFound::Project(_)));
    client.disconnect();
    handle.join().expect("server thread");
}

#[test]
fn refused_loads_surface_as_errors() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_command(s, protocol::CMD_LOAD_PROJECT);
        read_name(s);
        s.write_all(&[protocol::REPLY_FAIL]).expect("nacking");
        expect_eof(s);
    });
    let (mut client, _) = connect(port);
    let e = client.load_project("vision").expect_err("server said no");
    assert!(e.downcast_ref::<LoadFailed>().is_some());
    client.disconnect();
    handle.join().expect("server thread");
}

#[test]
fn preloads_typekits() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_command(s, protocol::CMD_PRELOAD_TYPEKIT);
        assert_eq!(read_name(s), "std");
        s.write_all(&[protocol::REPLY_OK]).expect("acking");
        expect_eof(s);
    });
    let (mut client, _) = connect(port);
    client.preload_typekit("std").expect("preloading");
    let e = client.preload_typekit("exotic").expect_err("unknown typekit");
    assert_matches!(e.downcast_ref::<NotFound>(), Some(NotFound::Typekit(_)));
    client.disconnect();
    handle.join().expect("server thread");
}

#[test]
fn starts_a_deployment() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_command(s, protocol::CMD_LOAD_PROJECT);
        assert_eq!(read_name(s), "vision");
        s.write_all(&[protocol::REPLY_OK]).expect("acking");
        expect_command(s, protocol::CMD_START);
        let req: StartRequest = protocol::read_message(s).expect("reading the start request");
        assert_eq!(req.name, "front_camera");
        assert_eq!(req.deployment, "camera");
        // The prefix got resolved into mappings, with the explicit one
        // winning over the generated one.
        assert_eq!(
            req.name_mappings.get("camera").map(String::as_str),
            Some("left_camera")
        );
        assert_eq!(
            req.name_mappings.get("filter").map(String::as_str),
            Some("the_filter")
        );
        assert_eq!(req.options.prefix, None);
        s.write_all(&[protocol::REPLY_PID]).expect("pid reply");
        protocol::write_message(s, &777u32).expect("writing the pid");
        expect_eof(s);
    });
    let (mut client, _) = connect(port);
    let mut mappings = HashMap::new();
    mappings.insert("filter".to_string(), "the_filter".to_string());
    let options = SpawnOptions {
        prefix: Some("left_".to_string()),
        ..Default::default()
    };
    let process = client
        .start("front_camera", "camera", mappings, options)
        .expect("starting");
    assert_eq!(process.pid(), 777);
    assert!(process.alive());
    assert_eq!(process.host_id(), client.host_id());
    let mut tasks = process.task_names();
    tasks.sort();
    assert_eq!(tasks, vec!["left_camera".to_string(), "the_filter".to_string()]);
    assert!(client.process("front_camera").is_some());

    let e = client
        .start("front_camera", "camera", HashMap::new(), Default::default())
        .expect_err("the name is taken");
    assert!(e.downcast_ref::<AlreadyStarted>().is_some());
    client.disconnect();
    handle.join().expect("server thread");
}

#[test]
fn server_refusals_become_start_failures() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_command(s, protocol::CMD_LOAD_PROJECT);
        read_name(s);
        s.write_all(&[protocol::REPLY_OK]).expect("acking");
        expect_command(s, protocol::CMD_START);
        let _: StartRequest = protocol::read_message(s).expect("reading the start request");
        s.write_all(&[protocol::REPLY_FAIL]).expect("nacking");
        expect_eof(s);
    });
    let (mut client, _) = connect(port);
    let e = client
        .start("front_camera", "camera", HashMap::new(), Default::default())
        .expect_err("the server refused");
    assert!(e.downcast_ref::<StartFailed>().is_some());
    assert!(client.process("front_camera").is_none());
    client.disconnect();
    handle.join().expect("server thread");
}

#[test]
fn stop_failures_surface() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_command(s, protocol::CMD_END);
        assert_eq!(read_name(s), "front_camera");
        s.write_all(&[protocol::REPLY_FAIL]).expect("nacking");
        expect_eof(s);
    });
    let (mut client, _) = connect(port);
    let e = client.stop("front_camera").expect_err("the server refused");
    assert!(e.downcast_ref::<StopFailed>().is_some());
    client.disconnect();
    handle.join().expect("server thread");
}

#[test]
fn absorbs_interleaved_death_notifications() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_command(s, protocol::CMD_LOAD_PROJECT);
        read_name(s);
        // News of a death lands just before the ack the client waits for.
        s.write_all(&[protocol::NOTIFY_DEATH]).expect("death byte");
        protocol::write_message(
            s,
            &DeathAnnouncement {
                name: "unrelated".to_string(),
                status: ExitStatus::Exited { code: 0 },
            },
        )
        .expect("writing the announcement");
        s.write_all(&[protocol::REPLY_OK]).expect("acking");
        expect_eof(s);
    });
    let (mut client, _) = connect(port);
    client.load_project("vision").expect("the ack still arrives");
    // The death got queued; draining it finds no matching process.
    let dead = client
        .wait_termination(Some(Duration::from_millis(0)))
        .expect("draining");
    assert!(dead.is_empty());
    client.disconnect();
    handle.join().expect("server thread");
}

#[test]
fn wait_termination_delivers_each_death_once() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_command(s, protocol::CMD_LOAD_PROJECT);
        read_name(s);
        s.write_all(&[protocol::REPLY_OK]).expect("acking");
        expect_command(s, protocol::CMD_START);
        let _: StartRequest = protocol::read_message(s).expect("reading the start request");
        s.write_all(&[protocol::REPLY_PID]).expect("pid reply");
        protocol::write_message(s, &4321u32).expect("writing the pid");
        s.write_all(&[protocol::NOTIFY_DEATH]).expect("death byte");
        protocol::write_message(
            s,
            &DeathAnnouncement {
                name: "front_camera".to_string(),
                status: ExitStatus::Signaled { signal: 2 },
            },
        )
        .expect("writing the announcement");
        expect_eof(s);
    });
    let (mut client, _) = connect(port);
    let process = client
        .start("front_camera", "camera", HashMap::new(), Default::default())
        .expect("starting");
    assert!(process.alive());

    let dead = client
        .wait_termination(Some(Duration::from_secs(5)))
        .expect("waiting");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].0.name(), "front_camera");
    assert_eq!(dead[0].1, ExitStatus::Signaled { signal: 2 });
    assert!(!dead[0].0.alive());
    // The handle returned by start shares the same state.
    assert!(!process.alive());
    assert!(client.process("front_camera").is_none());

    let again = client
        .wait_termination(Some(Duration::from_millis(0)))
        .expect("no repeats");
    assert!(again.is_empty());
    client.disconnect();
    handle.join().expect("server thread");
}

#[test]
fn a_closed_connection_reads_as_no_news() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        // Hang up; the client should treat the wait as newsless.
    });
    let (mut client, _) = connect(port);
    handle.join().expect("server thread");
    let dead = client
        .wait_termination(Some(Duration::from_secs(5)))
        .expect("waiting on a closed socket");
    assert!(dead.is_empty());
}

#[test]
fn log_dir_requests_are_fire_and_forget() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_command(s, protocol::CMD_CREATE_LOG_DIR);
        let req: CreateLogDirRequest = protocol::read_message(s).expect("create request");
        assert_eq!(req.log_dir.to_str(), Some("/tmp/run/logs"));
        assert_eq!(req.time_tag, "20260822-1423");
        expect_command(s, protocol::CMD_MOVE_LOG_DIR);
        let req: MoveLogDirRequest = protocol::read_message(s).expect("move request");
        assert_eq!(req.log_dir.to_str(), Some("/tmp/run/logs"));
        assert_eq!(req.results_dir.to_str(), Some("/tmp/results"));
        expect_eof(s);
    });
    let (mut client, _) = connect(port);
    client
        .create_log_dir("/tmp/run/logs", "20260822-1423")
        .expect("requesting the log dir");
    client
        .save_log_dir("/tmp/run/logs", "/tmp/results")
        .expect("requesting the move");
    client.disconnect();
    handle.join().expect("server thread");
}

#[test]
fn remote_handles_reject_local_process_operations() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_command(s, protocol::CMD_LOAD_PROJECT);
        read_name(s);
        s.write_all(&[protocol::REPLY_OK]).expect("acking");
        expect_command(s, protocol::CMD_START);
        let _: StartRequest = protocol::read_message(s).expect("reading the start request");
        s.write_all(&[protocol::REPLY_PID]).expect("pid reply");
        protocol::write_message(s, &4321u32).expect("writing the pid");
        expect_command(s, protocol::CMD_END);
        assert_eq!(read_name(s), "front_camera");
        s.write_all(&[protocol::REPLY_OK]).expect("acking");
        expect_eof(s);
    });
    let (mut client, _) = connect(port);
    let process = client
        .start("front_camera", "camera", HashMap::new(), Default::default())
        .expect("starting");

    let e = process.join().expect_err("there is no local child");
    assert!(e.downcast_ref::<Unsupported>().is_some());
    let e = process
        .kill(&mut client, true)
        .expect_err("waiting is not a thing here");
    assert!(e.downcast_ref::<Unsupported>().is_some());
    // Without waiting, kill turns into a stop request.
    process.kill(&mut client, false).expect("stopping");
    client.disconnect();
    handle.join().expect("server thread");
}

#[test]
fn remote_wait_running_consults_the_name_service() {
    let (port, handle) = fake_server(|s| {
        serve_handshake(s);
        expect_command(s, protocol::CMD_LOAD_PROJECT);
        read_name(s);
        s.write_all(&[protocol::REPLY_OK]).expect("acking");
        expect_command(s, protocol::CMD_START);
        let _: StartRequest = protocol::read_message(s).expect("reading the start request");
        s.write_all(&[protocol::REPLY_PID]).expect("pid reply");
        protocol::write_message(s, &4321u32).expect("writing the pid");
        s.write_all(&[protocol::NOTIFY_DEATH]).expect("death byte");
        protocol::write_message(
            s,
            &DeathAnnouncement {
                name: "front_camera".to_string(),
                status: ExitStatus::Exited { code: 1 },
            },
        )
        .expect("writing the announcement");
        expect_eof(s);
    });
    let (mut client, names) = connect(port);
    let process = client
        .start("front_camera", "camera", HashMap::new(), Default::default())
        .expect("starting");
    names.announce("camera");
    names.announce("filter");
    process
        .wait_running(Some(Duration::from_secs(1)))
        .expect("everything answers");

    client
        .wait_termination(Some(Duration::from_secs(5)))
        .expect("collecting the death");
    names.unregister("camera");
    names.unregister("filter");
    let e = process
        .wait_running(Some(Duration::from_secs(1)))
        .expect_err("the process is gone");
    assert_matches!(e, NotFound::Crashed(_));
    client.disconnect();
    handle.join().expect("server thread");
}
