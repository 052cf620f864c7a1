//! Extension-driven content classification.
//!
//! The tables below are the contract: an extension listed as binary is
//! stored in the binary column, everything else as text. Extensions
//! outside both tables fall through to `mime_guess`, then
//! `application/octet-stream`.

/// MIME type recorded for directory rows.
pub const DIRECTORY: &str = "directory";

const BINARY: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("ico", "image/x-icon"),
    ("tiff", "image/tiff"),
    ("webp", "image/webp"),
    ("pdf", "application/pdf"),
    ("doc", "application/msword"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    ("xls", "application/vnd.ms-excel"),
    (
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    ("ppt", "application/vnd.ms-powerpoint"),
    (
        "pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    ("zip", "application/zip"),
    ("tar", "application/x-tar"),
    ("gz", "application/gzip"),
    ("rar", "application/vnd.rar"),
    ("7z", "application/x-7z-compressed"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("avi", "video/x-msvideo"),
    ("mov", "video/quicktime"),
    ("wmv", "video/x-ms-wmv"),
    ("flv", "video/x-flv"),
    ("exe", "application/octet-stream"),
    ("dll", "application/octet-stream"),
    ("so", "application/octet-stream"),
    ("dylib", "application/octet-stream"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("otf", "font/otf"),
];

const TEXT: &[(&str, &str)] = &[
    ("md", "text/markdown"),
    ("txt", "text/plain"),
    ("json", "application/json"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("ts", "text/typescript"),
    ("xml", "application/xml"),
    ("yaml", "application/yaml"),
    ("yml", "application/yaml"),
];

fn extension(filename: &str) -> Option<String> {
    let dot = filename.rfind('.')?;
    if dot == 0 || dot + 1 == filename.len() {
        return None;
    }
    Some(filename[dot + 1..].to_ascii_lowercase())
}

/// True iff the filename's extension is classified as binary.
pub fn is_binary_name(filename: &str) -> bool {
    match extension(filename) {
        Some(ext) => BINARY.iter().any(|(e, _)| *e == ext),
        None => false,
    }
}

/// MIME type for a file name, per the classification tables.
pub fn content_type_for(filename: &str) -> String {
    let Some(ext) = extension(filename) else {
        return "application/octet-stream".to_string();
    };
    if let Some((_, mime)) = BINARY.iter().find(|(e, _)| *e == ext) {
        return (*mime).to_string();
    }
    if let Some((_, mime)) = TEXT.iter().find(|(e, _)| *e == ext) {
        return (*mime).to_string();
    }
    mime_guess::from_ext(&ext)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_classification() {
        assert!(is_binary_name("photo.PNG"));
        assert!(is_binary_name("archive.tar"));
        assert!(!is_binary_name("notes.md"));
        assert!(!is_binary_name("README"));
        assert!(!is_binary_name("script.unknownext"));
    }

    #[test]
    fn text_types() {
        assert_eq!(content_type_for("a.md"), "text/markdown");
        assert_eq!(content_type_for("a.yml"), "application/yaml");
        assert_eq!(content_type_for("a.ts"), "text/typescript");
    }

    #[test]
    fn binary_types() {
        assert_eq!(content_type_for("a.pdf"), "application/pdf");
        assert_eq!(content_type_for("a.woff2"), "font/woff2");
    }

    #[test]
    fn fallbacks() {
        assert_eq!(content_type_for("noext"), "application/octet-stream");
        // mime_guess knows csv even though the contract tables do not
        assert_eq!(content_type_for("data.csv"), "text/csv");
    }

    #[test]
    fn dotfile_extension() {
        // ".TAGS.md" has extension "md", not "TAGS.md"
        assert_eq!(content_type_for(".TAGS.md"), "text/markdown");
        // a bare dotfile has no extension
        assert_eq!(content_type_for(".gitignore"), "application/octet-stream");
    }
}
