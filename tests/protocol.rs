use futures::executor::block_on;
use matches::assert_matches;
use rueckenmark::protocol::*;
use serde_json::json;
use std::collections::HashMap;

#[test]
fn frames_round_trip() {
    let mut buf = Vec::new();
    write_frame(&mut buf, b"hello").expect("writing");
    assert_eq!(&buf[..4], &5u32.to_be_bytes());

    let mut r = &buf[..];
    let payload = read_frame(&mut r).expect("reading");
    assert_eq!(payload, b"hello");
    assert!(r.is_empty());
}

#[test]
fn rejects_oversized_incoming_frames() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
    let mut r = &buf[..];
    let e = read_frame(&mut r).expect_err("frame should be too big");
    assert_matches!(
        e.downcast_ref::<ProtocolViolation>(),
        Some(ProtocolViolation::OversizedFrame { .. })
    );
}

#[test]
fn rejects_oversized_outgoing_frames() {
    let payload = vec![0u8; MAX_FRAME_LEN as usize + 1];
    let mut buf = Vec::new();
    let e = write_frame(&mut buf, &payload).expect_err("frame should be too big");
    assert_matches!(
        e.downcast_ref::<ProtocolViolation>(),
        Some(ProtocolViolation::OversizedFrame { .. })
    );
    assert!(buf.is_empty());
}

#[test]
fn encodes_command_byte_plus_frame() {
    let buf = encode_command(CMD_LOAD_PROJECT, &"vision").expect("encoding");
    assert_eq!(buf[0], b'L');
    let mut r = &buf[1..];
    let name: String = read_message(&mut r).expect("decoding");
    assert_eq!(name, "vision");
}

#[test]
fn reads_a_command_stream() {
    let mut bytes = vec![CMD_GET_INFO, CMD_LOAD_PROJECT];
    write_message(&mut bytes, &"vision").expect("encoding name");
    bytes.push(CMD_START);
    write_message(
        &mut bytes,
        &StartRequest {
            name: "front_camera".to_string(),
            deployment: "camera".to_string(),
            name_mappings: HashMap::new(),
            options: Default::default(),
        },
    )
    .expect("encoding start request");

    block_on(async {
        let mut r = &bytes[..];
        assert_eq!(
            read_request(&mut r).await.expect("first"),
            Some(Request::GetInfo)
        );
        assert_eq!(
            read_request(&mut r).await.expect("second"),
            Some(Request::LoadProject {
                name: "vision".to_string()
            })
        );
        match read_request(&mut r).await.expect("third") {
            Some(Request::Start(req)) => {
                assert_eq!(req.name, "front_camera");
                assert_eq!(req.deployment, "camera");
                assert!(req.name_mappings.is_empty());
            }
            other => panic!("expected a start request, got {:?}", other),
        }
        // Clean end-of-stream between commands reads as no request.
        assert_eq!(read_request(&mut r).await.expect("eof"), None);
    });
}

#[test]
fn unknown_command_bytes_are_errors() {
    block_on(async {
        let mut r = &b"X"[..];
        let e = read_request(&mut r).await.expect_err("should not parse");
        assert_matches!(
            e.downcast_ref::<ProtocolViolation>(),
            Some(ProtocolViolation::UnknownCommand { byte: b'X' })
        );
    });
}

#[test]
fn eof_inside_a_frame_is_an_error() {
    let mut bytes = vec![CMD_LOAD_PROJECT];
    bytes.extend_from_slice(&10u32.to_be_bytes());
    bytes.push(b'"');
    block_on(async {
        let mut r = &bytes[..];
        assert!(read_request(&mut r).await.is_err());
    });
}

#[test]
fn garbage_payloads_are_errors() {
    let mut bytes = vec![CMD_LOAD_PROJECT];
    write_frame(&mut bytes, b"{definitely not json").expect("framing");
    block_on(async {
        let mut r = &bytes[..];
        let e = read_request(&mut r).await.expect_err("should not parse");
        assert_matches!(
            e.downcast_ref::<ProtocolViolation>(),
            Some(ProtocolViolation::MalformedPayload { .. })
        );
    });
}

#[test]
fn start_requests_default_the_optional_fields() {
    let req: StartRequest =
        serde_json::from_str(r#"{"name": "a", "deployment": "b"}"#).expect("parsing");
    assert!(req.name_mappings.is_empty());
    assert_eq!(req.options, Default::default());
}

#[test]
fn exit_status_wire_shape() {
    assert_eq!(
        serde_json::to_value(ExitStatus::Exited { code: 3 }).expect("encoding"),
        json!({"kind": "exited", "code": 3})
    );
    assert_eq!(
        serde_json::to_value(ExitStatus::Signaled { signal: 2 }).expect("encoding"),
        json!({"kind": "signaled", "signal": 2})
    );
    assert_eq!(ExitStatus::Exited { code: 3 }.to_string(), "exit status 3");
    assert_eq!(ExitStatus::Signaled { signal: 2 }.to_string(), "signal 2");
}
