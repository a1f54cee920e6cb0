use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::ser::{Serialize, SerializeStruct, Serializer};

/// Bytes captured from one output stream of a sandboxed process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    data: Vec<u8>,
    truncated: bool,
}

impl CapturedOutput {
    pub fn new(data: Vec<u8>, truncated: bool) -> Self {
        CapturedOutput { data, truncated }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Whether the process wrote more than the capture limit.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// `text` is always present for display. Output that is not valid UTF-8 also
/// carries the exact bytes in `base64`.
impl Serialize for CapturedOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let exact = std::str::from_utf8(&self.data).is_ok();
        let mut state = serializer.serialize_struct("CapturedOutput", if exact { 2 } else { 3 })?;
        state.serialize_field("text", &self.text())?;
        state.serialize_field("truncated", &self.truncated)?;
        if exact {
            state.skip_field("base64")?;
        } else {
            state.serialize_field("base64", &BASE64.encode(&self.data))?;
        }
        state.end()
    }
}

/// Incremental capture with a hard byte ceiling. Bytes past the ceiling are
/// discarded, so a runaway program cannot grow the supervisor's memory.
#[derive(Debug)]
pub struct OutputBuffer {
    limit: usize,
    data: Vec<u8>,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        OutputBuffer {
            limit,
            data: Vec::new(),
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let remaining = self.limit - self.data.len();
        if chunk.len() > remaining {
            self.truncated = true;
        }
        let take = chunk.len().min(remaining);
        self.data.extend_from_slice(&chunk[..take]);
    }

    pub fn into_captured(self) -> CapturedOutput {
        CapturedOutput::new(self.data, self.truncated)
    }
}
