use bytes::Bytes;

/// One complete, non-empty line of the upstream body, without its
/// terminator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame(Bytes);

impl RawFrame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy text view for diagnostics.
    pub fn preview(&self, max: usize) -> String {
        let end = self.0.len().min(max);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl AsRef<[u8]> for RawFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
