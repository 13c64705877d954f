//! MIME type detection based on file extensions.

use std::path::Path;

/// Served when the extension is unknown or missing.
pub const FALLBACK: &str = "application/octet-stream";

/// MIME type for a file extension, without the dot. Case-insensitive.
pub fn for_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "xml" => "application/xml",
        "json" => "application/json",

        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",

        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",

        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",

        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "dmg" => "application/x-apple-diskimage",
        "wasm" => "application/wasm",
        _ => return None,
    };
    Some(mime)
}

/// MIME type for `path`, falling back to [`FALLBACK`].
pub fn for_path(path: &Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(for_extension)
        .unwrap_or(FALLBACK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions_ignore_case() {
        assert_eq!(for_extension("PNG"), Some("image/png"));
        assert_eq!(for_path(Path::new("notes/Readme.TXT")), "text/plain");
    }

    #[test]
    fn unknown_or_missing_extension_falls_back() {
        assert_eq!(for_path(Path::new("archive.xyz")), FALLBACK);
        assert_eq!(for_path(Path::new("Makefile")), FALLBACK);
    }
}
