//! Upload allow-list and content type helpers.

/// Content type prefixes accepted for upload.
///
/// A declared type is accepted when it equals or starts with one of these.
pub const ALLOWED_PREFIXES: &[&str] = &[
    "image/",
    "application/pdf",
    "text/",
    "application/msword",
    "application/vnd.openxmlformats-officedocument",
    "application/vnd.ms-excel",
    "application/vnd.ms-powerpoint",
    "video/",
    "audio/",
    "application/zip",
    "application/x-zip-compressed",
    "application/x-rar-compressed",
    "application/vnd.rar",
    "application/x-7z-compressed",
    "application/json",
    "application/octet-stream",
];

/// Fallback when nothing better is known.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Lowercase the type and drop any parameters (`text/plain; charset=utf-8` -> `text/plain`).
pub fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Whether a declared content type may be uploaded.
pub fn is_allowed(content_type: &str) -> bool {
    let normalized = normalize(content_type);
    !normalized.is_empty()
        && ALLOWED_PREFIXES
            .iter()
            .any(|prefix| normalized == *prefix || normalized.starts_with(prefix))
}

/// Guess a content type from a file name's extension.
pub fn guess_from_name(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

pub fn is_image(content_type: &str) -> bool {
    content_type.starts_with("image/")
}

pub fn is_pdf(content_type: &str) -> bool {
    content_type == PDF_CONTENT_TYPE
}
