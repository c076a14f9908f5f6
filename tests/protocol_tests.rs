//! Integration tests for protocol serialization and framing

use terra_panel::process::ExitState;
use terra_panel::protocol::{
    check_version_compatibility, deserialize, frame_message, read_frame, recv_message,
    send_message, serialize, ClientMessage, LogEntry, ServerMessage, StatusInfo, SupervisorEvent,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use terra_panel::{LogStream, SupervisorState};

#[test]
fn test_client_message_roundtrip() {
    let messages = vec![
        ClientMessage::Hello {
            protocol_version: 1,
        },
        ClientMessage::Start,
        ClientMessage::SendCommand {
            text: "say hello".to_string(),
        },
        ClientMessage::GetSystemStats,
        ClientMessage::Subscribe,
        ClientMessage::Shutdown,
    ];

    for msg in messages {
        let encoded = serialize(&msg).expect("serialize failed");
        let decoded: ClientMessage = deserialize(&encoded).expect("deserialize failed");

        // Compare debug representations since ClientMessage doesn't derive PartialEq
        assert_eq!(format!("{:?}", msg), format!("{:?}", decoded));
    }
}

#[test]
fn test_server_message_roundtrip() {
    let msg = ServerMessage::Status(StatusInfo {
        state: SupervisorState::Stopped,
        pid: None,
        uptime_secs: None,
        run_id: 2,
        last_exit: Some(ExitState::Crashed { signal: Some(9) }),
        last_error: Some("crashed".to_string()),
    });

    let encoded = serialize(&msg).expect("serialize failed");
    let decoded: ServerMessage = deserialize(&encoded).expect("deserialize failed");

    assert_eq!(format!("{:?}", msg), format!("{:?}", decoded));
}

#[test]
fn test_event_roundtrip() {
    let event = SupervisorEvent::StateChanged {
        state: SupervisorState::Running,
        pid: Some(1234),
    };

    let encoded = serialize(&ServerMessage::Event(event.clone())).unwrap();
    match deserialize::<ServerMessage>(&encoded).unwrap() {
        ServerMessage::Event(decoded) => assert_eq!(decoded, event),
        other => panic!("Expected Event, got {:?}", other),
    }
}

#[test]
fn test_garbage_is_rejected() {
    let result = deserialize::<ClientMessage>(&[0xc1, 0xff, 0x00]);
    assert!(result.is_err());
}

#[test]
fn test_version_check() {
    assert!(check_version_compatibility(PROTOCOL_VERSION, PROTOCOL_VERSION).is_ok());

    let err = check_version_compatibility(PROTOCOL_VERSION + 1, PROTOCOL_VERSION).unwrap_err();
    assert!(err.to_string().contains("version mismatch"));
}

#[test]
fn test_frame_has_big_endian_length() {
    let framed = frame_message(b"abc");
    assert_eq!(&framed[..4], &[0, 0, 0, 3]);
    assert_eq!(&framed[4..], b"abc");
}

#[tokio::test]
async fn test_messages_over_a_stream() {
    let (mut client, mut server) = tokio::io::duplex(1024);

    let entry = LogEntry {
        seq: 1,
        timestamp: 1_700_000_000_000,
        stream: LogStream::Stdout,
        text: "Server started".to_string(),
    };
    send_message(&mut server, &ServerMessage::Log(entry.clone()))
        .await
        .unwrap();
    send_message(
        &mut server,
        &ServerMessage::Ack {
            for_command: "Start".to_string(),
        },
    )
    .await
    .unwrap();
    drop(server);

    match recv_message::<_, ServerMessage>(&mut client).await.unwrap() {
        Some(ServerMessage::Log(received)) => assert_eq!(received, entry),
        other => panic!("Expected Log, got {:?}", other),
    }
    assert!(matches!(
        recv_message::<_, ServerMessage>(&mut client).await.unwrap(),
        Some(ServerMessage::Ack { .. })
    ));
    // Clean EOF after the last frame
    assert!(recv_message::<_, ServerMessage>(&mut client)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_oversized_frame_is_rejected() {
    use tokio::io::AsyncWriteExt;

    let (mut client, mut server) = tokio::io::duplex(64);
    server
        .write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
        .await
        .unwrap();

    let err = read_frame(&mut client).await.unwrap_err();
    assert!(err.to_string().contains("too large"));
}
