use serde::{Deserialize, Serialize};

/// Snapshot of who is being verified and where.
///
/// Captured once when a request is created and never updated afterwards,
/// so a record keeps the names the user had at verification time even if
/// they rename later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    /// Guild (server) ID
    pub guild_id: u64,

    /// Guild name at capture time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guild_name: Option<String>,

    /// Discord user ID
    pub user_id: u64,

    /// Username at capture time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

impl UserIdentity {
    pub fn new(guild_id: u64, user_id: u64) -> Self {
        Self {
            guild_id,
            guild_name: None,
            user_id,
            user_name: None,
        }
    }

    pub fn with_names(
        guild_id: u64,
        guild_name: impl Into<String>,
        user_id: u64,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            guild_id,
            guild_name: Some(guild_name.into()),
            user_id,
            user_name: Some(user_name.into()),
        }
    }

    /// Two identities refer to the same member when guild and user match.
    /// Name snapshots are display data and do not participate in equality.
    pub fn same_member(&self, other: &UserIdentity) -> bool {
        self.guild_id == other.guild_id && self.user_id == other.user_id
    }

    pub fn display_name(&self) -> String {
        self.user_name
            .clone()
            .unwrap_or_else(|| self.user_id.to_string())
    }
}

/// How a trusted record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    /// User completed the OAuth login flow
    Oauth,
    /// Staff assigned the trusted role manually
    StaffAssigned,
    /// Staff ran the enforce command
    StaffEnforced,
    /// Record imported during a migration
    Migrated,
    /// Record created while checking the user's permissions
    ContextProvided,
    /// A reviewer accepted submitted documents
    Reviewed,
}

impl VerificationMethod {
    pub fn describe(&self) -> &'static str {
        match self {
            VerificationMethod::Oauth => "OAuth login",
            VerificationMethod::StaffAssigned => "assigned by staff",
            VerificationMethod::StaffEnforced => "enforced by staff",
            VerificationMethod::Migrated => "migrated",
            VerificationMethod::ContextProvided => "context provided",
            VerificationMethod::Reviewed => "document review",
        }
    }
}

/// One side of a submitted identity document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentImage {
    /// MIME type as submitted (image/jpeg, image/png)
    pub content_type: String,

    /// Raw image bytes, stored base64-encoded in the state file
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

/// Evidence submitted for manual review: both sides of a student ID card.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub front: DocumentImage,
    pub back: DocumentImage,

    /// Contact email supplied with the documents, used for decision mail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Extract a student-number token from an email-like string.
///
/// Student mail addresses start with the student number: `s12345@pja.edu.pl`
/// yields `s12345`. Returns None when the local part is not shaped that way.
pub fn student_number_from_email(email: &str) -> Option<String> {
    let local = email.split('@').next()?;
    let mut chars = local.chars();
    if chars.next()? != 's' {
        return None;
    }
    let digits: String = chars.take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() < 5 {
        return None;
    }
    Some(format!("s{}", &digits[..5]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_member_ignores_names() {
        let a = UserIdentity::with_names(1, "Guild", 42, "alice");
        let b = UserIdentity::new(1, 42);
        let c = UserIdentity::new(2, 42);

        assert!(a.same_member(&b));
        assert!(!a.same_member(&c));
    }

    #[test]
    fn test_student_number_extraction() {
        assert_eq!(
            student_number_from_email("s12345@test"),
            Some("s12345".to_string())
        );
        assert_eq!(
            student_number_from_email("s123456789@pja.edu.pl"),
            Some("s12345".to_string())
        );
        assert_eq!(student_number_from_email("alice@test"), None);
        assert_eq!(student_number_from_email("s12@test"), None);
        assert_eq!(student_number_from_email(""), None);
    }

    #[test]
    fn test_document_image_roundtrips_as_base64() {
        let image = DocumentImage {
            content_type: "image/jpeg".to_string(),
            bytes: vec![0xff, 0xd8, 0xff, 0xe0],
        };

        let json = serde_json::to_string(&image).unwrap();
        assert!(json.contains("image/jpeg"));
        // bytes must not appear as a raw array
        assert!(!json.contains("255"));

        let back: DocumentImage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.bytes, image.bytes);
    }
}
