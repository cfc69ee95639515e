//! Metadata shown for an uploaded file before it is processed.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use tracing::debug;

/// Extensions accepted for upload.
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["pdf", "jpg", "jpeg", "png"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Image,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preview {
    pub file_name: String,
    pub kind: FileKind,
    pub size_bytes: usize,
    /// Hex-encoded SHA-256 of the content.
    pub sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

fn extension(file_name: &str) -> Option<String> {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

pub fn is_supported(file_name: &str) -> bool {
    extension(file_name).map_or(false, |ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
}

pub fn kind_of(file_name: &str) -> FileKind {
    match extension(file_name).as_deref() {
        Some("pdf") => FileKind::Pdf,
        Some("jpg" | "jpeg" | "png") => FileKind::Image,
        _ => FileKind::Other,
    }
}

/// Inspect an upload. Content that cannot be decoded still gets size and hash.
pub fn inspect(file_name: &str, data: &[u8]) -> Preview {
    let kind = kind_of(file_name);
    let mut preview = Preview {
        file_name: file_name.to_string(),
        kind,
        size_bytes: data.len(),
        sha256: format!("{:x}", Sha256::digest(data)),
        pages: None,
        width: None,
        height: None,
    };

    match kind {
        FileKind::Pdf => match lopdf::Document::load_mem(data) {
            Ok(doc) => preview.pages = Some(doc.get_pages().len()),
            Err(e) => debug!("Could not read PDF {}: {}", file_name, e),
        },
        FileKind::Image => {
            let dimensions = image::io::Reader::new(Cursor::new(data))
                .with_guessed_format()
                .map_err(image::ImageError::IoError)
                .and_then(|reader| reader.into_dimensions());
            match dimensions {
                Ok((w, h)) => {
                    preview.width = Some(w);
                    preview.height = Some(h);
                }
                Err(e) => debug!("Could not read image {}: {}", file_name, e),
            }
        }
        FileKind::Other => {}
    }

    preview
}
