use serde_json::json;

use crate::{
    domain::ContactId,
    error::{RemoteError, CODE_CAPTCHA_NEEDED},
    protocol::{ApiErrorBody, Attachment, PollPayload, RemoteMessage, UpdateEvent},
};

#[test]
fn poll_payload_with_failed_flag_requests_reinitialization() {
    assert_eq!(PollPayload::parse(br#"{"failed": 1}"#), Some(PollPayload::Failed));
    assert_eq!(
        PollPayload::parse(br#"{"failed": 2, "ts": 10}"#),
        Some(PollPayload::Failed)
    );
}

#[test]
fn empty_or_garbage_poll_payload_is_undecodable() {
    assert_eq!(PollPayload::parse(b""), None);
    assert_eq!(PollPayload::parse(b"  \n"), None);
    assert_eq!(PollPayload::parse(b"<html>502</html>"), None);
    assert_eq!(PollPayload::parse(b"[1, 2]"), None);
}

#[test]
fn poll_payload_decodes_known_update_tags() {
    let raw = br#"{"ts": "1700", "updates": [[4, 99, 1], [8, -55, 7], [9, -55, 0], [61, 42, 1], [80, 3], "junk"]}"#;
    let payload = PollPayload::parse(raw).expect("payload");
    assert_eq!(
        payload,
        PollPayload::Updates {
            ts: 1700,
            updates: vec![
                UpdateEvent::NewMessage,
                UpdateEvent::ContactOnline(ContactId(55)),
                UpdateEvent::ContactOffline(ContactId(55)),
                UpdateEvent::Typing(ContactId(42)),
                UpdateEvent::Other(80),
            ],
        }
    );
}

#[test]
fn soft_codes_map_to_empty_result() {
    let body = ApiErrorBody {
        error_code: 9,
        error_msg: "Flood control".to_string(),
        ..Default::default()
    };
    assert_eq!(RemoteError::from_api(&body), None);
}

#[test]
fn auth_failure_distinguishes_revocation() {
    let revoked = ApiErrorBody {
        error_code: 5,
        error_msg: "User authorization failed: user revoke access for this token.".to_string(),
        ..Default::default()
    };
    let invalid = ApiErrorBody {
        error_code: 5,
        error_msg: "User authorization failed: invalid access_token.".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        RemoteError::from_api(&revoked),
        Some(RemoteError::CredentialsRevoked(_))
    ));
    assert!(matches!(
        RemoteError::from_api(&invalid),
        Some(RemoteError::CredentialsInvalid(_))
    ));
}

#[test]
fn captcha_error_carries_challenge_with_numeric_sid() {
    let body: ApiErrorBody = serde_json::from_value(json!({
        "error_code": CODE_CAPTCHA_NEEDED,
        "error_msg": "Captcha needed",
        "captcha_sid": 123456,
        "captcha_img": "https://api.example/captcha.php?sid=123456"
    }))
    .expect("error body");
    match RemoteError::from_api(&body) {
        Some(RemoteError::CaptchaRequired(challenge)) => {
            assert_eq!(challenge.sid, "123456");
            assert_eq!(challenge.image_url, "https://api.example/captcha.php?sid=123456");
            assert_eq!(challenge.answer, None);
        }
        other => panic!("unexpected classification: {other:?}"),
    }
}

#[test]
fn unknown_codes_keep_their_number() {
    let body = ApiErrorBody {
        error_code: 902,
        error_msg: "privacy".to_string(),
        ..Default::default()
    };
    assert_eq!(
        RemoteError::from_api(&body),
        Some(RemoteError::Unknown {
            code: 902,
            message: "privacy".to_string()
        })
    );
}

#[test]
fn message_without_id_sorts_as_zero() {
    let message: RemoteMessage =
        serde_json::from_value(json!({"user_id": -7, "body": "hi"})).expect("message");
    assert_eq!(message.sort_key().0, 0);
    assert_eq!(message.contact(), ContactId(7));
    assert!(!message.is_outgoing());
}

#[test]
fn attachment_url_prefers_largest_photo() {
    let attachment: Attachment = serde_json::from_value(json!({
        "type": "photo",
        "photo": {"photo_130": "small.jpg", "photo_604": "big.jpg", "owner_id": 1, "id": 2}
    }))
    .expect("attachment");
    assert_eq!(attachment.url().as_deref(), Some("big.jpg"));

    let video: Attachment = serde_json::from_value(json!({
        "type": "video",
        "video": {"owner_id": -10, "id": 20}
    }))
    .expect("attachment");
    assert_eq!(video.url().as_deref(), Some("https://vk.com/video-10_20"));
}
