use super::*;

// =============================================================================
// bytes_to_hex
// =============================================================================

#[test]
fn bytes_to_hex_empty() {
    assert_eq!(bytes_to_hex(&[]), "");
}

#[test]
fn bytes_to_hex_single_byte() {
    assert_eq!(bytes_to_hex(&[0xff]), "ff");
}

#[test]
fn bytes_to_hex_leading_zero() {
    assert_eq!(bytes_to_hex(&[0x0a]), "0a");
}

#[test]
fn bytes_to_hex_multi_byte() {
    assert_eq!(bytes_to_hex(&[0xde, 0xad, 0xbe, 0xef]), "deadbeef");
}

// =============================================================================
// generate_token
// =============================================================================

#[test]
fn generate_token_is_64_hex_chars() {
    let token = generate_token();
    assert_eq!(token.len(), 64);
}

#[test]
fn generate_token_all_valid_hex() {
    let token = generate_token();
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn generate_token_two_calls_differ() {
    let a = generate_token();
    let b = generate_token();
    assert_ne!(a, b);
}

// =============================================================================
// generate_ws_ticket
// =============================================================================

#[test]
fn generate_ws_ticket_is_32_hex_chars() {
    let ticket = generate_ws_ticket();
    assert_eq!(ticket.len(), 32);
}

#[test]
fn generate_ws_ticket_two_calls_differ() {
    let a = generate_ws_ticket();
    let b = generate_ws_ticket();
    assert_ne!(a, b);
}

// =============================================================================
// SessionUser
// =============================================================================

#[test]
fn session_user_serialize_round_trip() {
    let user = SessionUser {
        id: Uuid::nil(),
        display_name: "charlie".into(),
        avatar_url: Some("https://example.com/pic.png".into()),
        can_speak: true,
        auth_method: "password".into(),
    };
    let json = serde_json::to_string(&user).unwrap();
    let restored: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(restored["display_name"], "charlie");
    assert_eq!(restored["avatar_url"], "https://example.com/pic.png");
    assert_eq!(restored["can_speak"], true);
}

#[test]
fn session_user_serialize_none_avatar() {
    let user = SessionUser {
        id: Uuid::nil(),
        display_name: "dave".into(),
        avatar_url: None,
        can_speak: false,
        auth_method: "github".into(),
    };
    let json = serde_json::to_string(&user).unwrap();
    let restored: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert!(restored["avatar_url"].is_null());
}
