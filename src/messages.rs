// src/messages.rs

/// A direct message ready for rendering. The Discord layer turns this into
/// an embed; tests inspect it as plain data.
#[derive(Debug, Clone, PartialEq)]
pub struct DmMessage {
    pub title: String,
    pub body: String,
    pub fields: Vec<(String, String)>,
    pub link: Option<String>,
    pub color: u32,
}

pub const COLOR_OK: u32 = 0x57F287;
pub const COLOR_WARN: u32 = 0xED4245;
pub const COLOR_INFO: u32 = 0x5865F2;

pub fn verification_link_message(username: &str, verify_url: &str) -> DmMessage {
    DmMessage {
        title: "Verify your identity".to_string(),
        body: format!(
            "Hello, **{}**!\n\n\
            To gain full access to the server you need to verify that you are a student.\n\
            Open the link below and sign in with your university account.\n\n\
            The link is personal — do not share it with anyone.",
            username
        ),
        fields: vec![("Verification link".to_string(), verify_url.to_string())],
        link: Some(verify_url.to_string()),
        color: COLOR_INFO,
    }
}

pub fn confirmation_message(
    verified_at: &str,
    student_number: Option<&str>,
    method: &str,
) -> DmMessage {
    let mut fields = vec![("Verified at".to_string(), verified_at.to_string())];
    if let Some(number) = student_number {
        fields.push(("Linked student number".to_string(), number.to_string()));
    }
    fields.push(("Verification method".to_string(), method.to_string()));

    DmMessage {
        title: "Done!".to_string(),
        body: "Verification successful! You can manage your verification with the \
            `/manage` command."
            .to_string(),
        fields,
        link: None,
        color: COLOR_OK,
    }
}

pub fn rejection_message(reason: &str) -> DmMessage {
    DmMessage {
        title: "Verification rejected".to_string(),
        body: format!(
            "Your account could not be verified for the following reason: {}\n\n\
            You may submit a new request or contact the server staff.",
            reason
        ),
        fields: vec![],
        link: None,
        color: COLOR_WARN,
    }
}

pub fn evidence_request_message(upload_url: &str) -> DmMessage {
    DmMessage {
        title: "Papers, please!".to_string(),
        body: format!(
            "A reviewer asked you to submit photos of your student ID card to confirm \
            your identity. Visit {} to upload the document.",
            upload_url
        ),
        fields: vec![],
        link: Some(upload_url.to_string()),
        color: COLOR_WARN,
    }
}

pub fn reviewer_alert_message(user_name: &str, review_url: &str) -> DmMessage {
    DmMessage {
        title: "New verification to review".to_string(),
        body: format!("{} is waiting for verification!", user_name),
        fields: vec![],
        link: Some(review_url.to_string()),
        color: COLOR_INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_message_fields() {
        let message = confirmation_message("2026-01-01T00:00:00Z", Some("s12345"), "OAuth login");

        assert_eq!(message.fields.len(), 3);
        assert!(message
            .fields
            .iter()
            .any(|(k, v)| k == "Linked student number" && v == "s12345"));
        assert_eq!(message.color, COLOR_OK);
    }

    #[test]
    fn test_confirmation_without_student_number() {
        let message = confirmation_message("2026-01-01T00:00:00Z", None, "assigned by staff");
        assert!(!message
            .fields
            .iter()
            .any(|(k, _)| k == "Linked student number"));
    }

    #[test]
    fn test_link_messages_carry_url() {
        let dm = verification_link_message("alice", "https://example.com/verify/abc");
        assert_eq!(dm.link.as_deref(), Some("https://example.com/verify/abc"));

        let dm = evidence_request_message("https://example.com/verify/abc");
        assert!(dm.body.contains("https://example.com/verify/abc"));
    }
}
