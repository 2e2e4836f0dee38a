use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Client-generated photo identity. Stable for the life of the record, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoId(Uuid);

impl PhotoId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PhotoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One photograph attached to a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoRecord {
    pub id: PhotoId,
    pub report_id: String,
    pub raw_path: Option<String>,
    pub optimized_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub display_url: Option<String>,
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl PhotoRecord {
    /// Empty slot: every path is unset until an upload lands.
    pub fn new(report_id: impl Into<String>) -> Self {
        Self {
            id: PhotoId::new(),
            report_id: report_id.into(),
            raw_path: None,
            optimized_path: None,
            thumbnail_path: None,
            display_url: None,
            thumbnail_url: None,
            description: String::new(),
        }
    }

    /// The most refined stored path: optimized when present, raw otherwise.
    pub fn display_path(&self) -> Option<&str> {
        self.optimized_path
            .as_deref()
            .or(self.raw_path.as_deref())
    }

    /// Paths of every stored variant, for bulk deletion.
    pub fn stored_paths(&self) -> Vec<String> {
        [&self.raw_path, &self.optimized_path, &self.thumbnail_path]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Binary payload selected by the user, possibly shrunk by the pre-processor.
#[derive(Clone)]
pub struct PhotoFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl PhotoFile {
    pub fn new(name: impl Into<String>, content_type: Option<String>, bytes: Bytes) -> Self {
        let name = name.into();
        let content_type = content_type
            .filter(|c| !c.is_empty() && c != mime::APPLICATION_OCTET_STREAM.essence_str())
            .unwrap_or_else(|| {
                mime_guess::from_path(&name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });
        Self {
            name,
            content_type,
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for PhotoFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhotoFile")
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Paths and URLs resolved after a successful processing handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedPhoto {
    pub raw_path: String,
    pub optimized_path: Option<String>,
    pub thumbnail_path: Option<String>,
    pub display_url: String,
    pub thumbnail_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_path_prefers_optimized() {
        let mut rec = PhotoRecord::new("r1");
        assert_eq!(rec.display_path(), None);
        rec.raw_path = Some("r1/a/raw.jpg".into());
        assert_eq!(rec.display_path(), Some("r1/a/raw.jpg"));
        rec.optimized_path = Some("r1/a/opt.webp".into());
        assert_eq!(rec.display_path(), Some("r1/a/opt.webp"));
    }

    #[test]
    fn content_type_guessed_from_name() {
        let f = PhotoFile::new("site.JPG", None, Bytes::from_static(b"x"));
        assert_eq!(f.content_type, "image/jpeg");
        let f = PhotoFile::new("blob", Some("image/png".into()), Bytes::new());
        assert_eq!(f.content_type, "image/png");
    }

    #[test]
    fn ids_are_unique() {
        let a = PhotoRecord::new("r");
        let b = PhotoRecord::new("r");
        assert_ne!(a.id, b.id);
    }
}
