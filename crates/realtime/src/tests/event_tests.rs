use super::*;
use chrono::TimeZone;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("timestamp")
}

#[test]
fn client_sender_and_timestamp_are_overwritten() {
    let raw = r#"{"type":"message","chat_id":4,"sender_id":999,"content":"hi","timestamp":"2001-01-01T00:00:00Z"}"#;
    let event = Event::decode_client(raw, UserId(7), at(1_700_000_000)).expect("decode");

    let Event::ChatMessage(message) = event else {
        panic!("expected chat message");
    };
    assert_eq!(message.sender_id, UserId(7));
    assert_eq!(message.timestamp, at(1_700_000_000));
    assert_eq!(message.chat_id, ChatId(4));
    assert_eq!(message.kind, MessageKind::Text);
    assert_eq!(message.seq_id, SeqId::ZERO);
}

#[test]
fn unreadable_client_timestamp_does_not_reject_the_frame() {
    for stamp in ["12345", "\"yesterday\"", "null", "{}"] {
        let raw = format!(r#"{{"type":"WS_TYPING","chat_id":4,"timestamp":{stamp}}}"#);
        let event = Event::decode_client(&raw, UserId(7), at(1_700_000_000))
            .unwrap_or_else(|err| panic!("timestamp {stamp} rejected: {err}"));
        assert_eq!(
            event,
            Event::Typing {
                chat_id: ChatId(4),
                sender_id: UserId(7),
                timestamp: at(1_700_000_000),
            }
        );
    }

    let frame: WsFrame =
        serde_json::from_str(r#"{"type":"message","timestamp":"2001-01-01T00:00:00Z"}"#)
            .expect("frame");
    assert_eq!(frame.timestamp, at(978_307_200));
}

#[test]
fn join_and_leave_frames_only_need_a_chat() {
    let join = Event::decode_client(r#"{"type":"join_chat","chat_id":3}"#, UserId(1), at(0))
        .expect("join");
    assert_eq!(join, Event::Join { chat_id: ChatId(3) });

    let leave = Event::decode_client(r#"{"type":"leave_chat","chat_id":3}"#, UserId(1), at(0))
        .expect("leave");
    assert_eq!(leave, Event::Leave { chat_id: ChatId(3) });
}

#[test]
fn message_without_content_or_media_is_rejected() {
    let err = Event::decode_client(r#"{"type":"message","chat_id":3,"content":"  "}"#, UserId(1), at(0))
        .expect_err("empty");
    assert!(matches!(err, FrameError::EmptyMessage));

    let media = Event::decode_client(
        r#"{"type":"message","chat_id":3,"msg_type":2,"media_url":"https://cdn/x.png"}"#,
        UserId(1),
        at(0),
    )
    .expect("media message");
    let Event::ChatMessage(message) = media else {
        panic!("expected chat message");
    };
    assert_eq!(message.kind, MessageKind::Image);
}

#[test]
fn unknown_type_and_missing_chat_are_errors() {
    let unknown = Event::decode_client(r#"{"type":"presence","chat_id":3}"#, UserId(1), at(0))
        .expect_err("unknown");
    assert!(matches!(unknown, FrameError::Unsupported(FrameType::Unknown)));

    let missing = Event::decode_client(r#"{"type":"WS_TYPING"}"#, UserId(1), at(0))
        .expect_err("missing chat");
    assert!(matches!(missing, FrameError::MissingChat(FrameType::Typing)));

    let garbage = Event::decode_client("not json", UserId(1), at(0)).expect_err("garbage");
    assert!(matches!(garbage, FrameError::Malformed(_)));
}

#[test]
fn read_receipt_falls_back_to_first_listed_message() {
    let event = Event::decode_client(
        r#"{"type":"WS_MSG_READ","chat_id":9,"message_ids":[41,42]}"#,
        UserId(5),
        at(10),
    )
    .expect("receipt");
    assert_eq!(
        event,
        Event::ReadReceipt(ReadReceipt {
            message_id: MessageId(41),
            chat_id: ChatId(9),
            reader_id: UserId(5),
            timestamp: at(10),
        })
    );
}

#[test]
fn outbound_read_receipt_carries_reader_as_sender() {
    let event = Event::ReadReceipt(ReadReceipt {
        message_id: MessageId(12),
        chat_id: ChatId(2),
        reader_id: UserId(8),
        timestamp: at(20),
    });
    let value: serde_json::Value =
        serde_json::from_str(&event.encode().expect("encode")).expect("json");
    assert_eq!(value["type"], "WS_MSG_READ");
    assert_eq!(value["message_id"], 12);
    assert_eq!(value["chat_id"], 2);
    assert_eq!(value["sender_id"], 8);
    assert!(value.get("content").is_none());
}

#[test]
fn restamped_message_encodes_ids() {
    let mut message = match Event::decode_client(
        r#"{"type":"message","chat_id":1,"content":"yo"}"#,
        UserId(3),
        at(0),
    )
    .expect("decode")
    {
        Event::ChatMessage(message) => message,
        other => panic!("unexpected {other:?}"),
    };
    message.restamp(&SavedMessage {
        message_id: MessageId(77),
        seq_id: SeqId(123_456),
        created_at: at(30),
    });

    let value: serde_json::Value = serde_json::from_str(
        &Event::ChatMessage(message).encode().expect("encode"),
    )
    .expect("json");
    assert_eq!(value["type"], "message");
    assert_eq!(value["message_id"], 77);
    assert_eq!(value["seq_id"], 123_456);
    assert_eq!(value["msg_type"], 1);
    assert_eq!(value["content"], "yo");
}
