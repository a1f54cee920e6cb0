use crate::limits::LimitOverrides;
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

/// One request to compile and run a piece of user code against an input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,
    #[serde(rename = "languageId", alias = "language")]
    language: String,
    #[serde(rename = "sourceCode", alias = "source", with = "payload")]
    source: Vec<u8>,
    #[serde(default, with = "payload")]
    stdin: Vec<u8>,
    #[serde(default)]
    limits: Option<LimitOverrides>,
}

impl Submission {
    pub fn new(language: impl Into<String>, source: impl Into<Vec<u8>>, stdin: impl Into<Vec<u8>>) -> Self {
        Submission {
            id: Uuid::new_v4(),
            language: language.into(),
            source: source.into(),
            stdin: stdin.into(),
            limits: None,
        }
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn source(&self) -> &[u8] {
        &self.source
    }

    pub fn stdin(&self) -> &[u8] {
        &self.stdin
    }

    pub fn limits(&self) -> Option<&LimitOverrides> {
        self.limits.as_ref()
    }
}

/// Sources and inputs are bytes. On the wire they are plain strings, or
/// `{ "base64": "..." }` when they are not valid UTF-8.
mod payload {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{de::Error as _, ser::SerializeStruct, Deserialize, Deserializer, Serializer};
    use serde_derive::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        Text(String),
        Encoded { base64: String },
    }

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(value) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => {
                let mut state = serializer.serialize_struct("Payload", 1)?;
                state.serialize_field("base64", &BASE64.encode(value))?;
                state.end()
            }
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Payload::deserialize(deserializer)? {
            Payload::Text(text) => Ok(text.into_bytes()),
            Payload::Encoded { base64 } => BASE64.decode(base64).map_err(D::Error::custom),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_wire_format() {
        let submission: Submission = serde_json::from_str(
            r#"{
                "language": "cpp",
                "source": "int main() {}",
                "stdin": "7",
                "limits": { "wallTimeMs": 500 }
            }"#,
        )
        .unwrap();

        assert_eq!(submission.language(), "cpp");
        assert_eq!(submission.source(), b"int main() {}");
        assert_eq!(submission.stdin(), b"7");
        assert_eq!(submission.limits().and_then(|l| l.wall_time_ms), Some(500));
    }

    #[test]
    fn parses_documented_field_names() {
        let submission: Submission = serde_json::from_str(
            r#"{ "languageId": "cpp", "sourceCode": "int main(){}", "stdin": "7" }"#,
        )
        .unwrap();

        assert_eq!(submission.language(), "cpp");
        assert_eq!(submission.source(), b"int main(){}");
        assert_eq!(submission.stdin(), b"7");

        let json = serde_json::to_value(&submission).unwrap();
        assert_eq!(json["languageId"], "cpp");
        assert_eq!(json["sourceCode"], "int main(){}");
    }

    #[test]
    fn binary_stdin_survives_the_wire() {
        let submission = Submission::new("python", "print(1)", vec![0xff, 0x00, 0xfe]);

        let json = serde_json::to_string(&submission).unwrap();
        assert!(json.contains(r#""stdin":{"base64":"/wD+"}"#));

        let parsed: Submission = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.stdin(), &[0xff, 0x00, 0xfe]);
        assert_eq!(parsed, submission);
    }

    #[test]
    fn missing_stdin_is_empty() {
        let submission: Submission =
            serde_json::from_str(r#"{ "language": "python", "source": "print(1)" }"#).unwrap();
        assert!(submission.stdin().is_empty());
        assert!(submission.limits().is_none());
    }

    #[test]
    fn every_submission_gets_its_own_id() {
        let a = Submission::new("cpp", "", "");
        let b = Submission::new("cpp", "", "");
        assert_ne!(a.id(), b.id());
    }
}
