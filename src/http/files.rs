//! Static file tree served under a URL prefix.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::http::mime;
use crate::http::request::Request;
use crate::http::response::Response;

const CHUNK: usize = 64 * 1024;

/// Serves `local_path` at `web_path/...`.
///
/// Missing files and paths that try to climb out of the root get no response:
/// the connection is closed.
#[derive(Debug, Clone)]
pub struct FileModule {
    root: PathBuf,
    web_path: String,
}

impl FileModule {
    pub fn new(local_path: impl Into<PathBuf>, web_path: &str) -> Self {
        Self {
            root: local_path.into(),
            web_path: web_path.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Route pattern; capture group 1 is the path below the prefix.
    pub fn pattern(&self) -> String {
        format!("^{}/(.*)$", regex::escape(&self.web_path))
    }

    /// Maps the part of the URL below the prefix to a path under the root.
    ///
    /// `None` for anything containing `..`, and for anything that would not
    /// stay below the root once joined. Symlinks are not followed here;
    /// `serve` checks where they lead.
    pub fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode(relative).ok()?;
        if decoded.contains("..") || decoded.contains('\0') {
            return None;
        }

        let relative = Path::new(decoded.trim_start_matches('/'));
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

        contained.then(|| self.root.join(relative))
    }

    /// Whether canonical `path` lies under the canonical root.
    fn contains(&self, path: &Path) -> bool {
        self.root
            .canonicalize()
            .is_ok_and(|root| path.starts_with(root))
    }

    /// Route callback. Blocks on each chunk so a large file is never queued in
    /// full; must run on a blocking thread.
    pub fn serve(&self, values: Vec<String>, request: Request, mut response: Response) {
        let relative = values.get(1).map(String::as_str).unwrap_or_default();

        let Some(path) = self.resolve(relative) else {
            warn!(path = %request.path, "rejected file request outside the root");
            response.close();
            return;
        };

        let path = match path.canonicalize() {
            Ok(path) => path,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "file not found");
                response.close();
                return;
            }
        };

        if !self.contains(&path) {
            warn!(
                path = %request.path,
                target = %path.display(),
                "rejected link leading outside the root"
            );
            response.close();
            return;
        }

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "file not found");
                response.close();
                return;
            }
        };

        let sent = if metadata.is_dir() {
            self.send_listing(&path, relative, &mut response)
        } else {
            send_file(&path, metadata.len(), &mut response)
        };

        match sent {
            Ok(true) => response.finish(),
            Ok(false) => response.close(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to serve file");
                response.close();
            }
        }
    }

    fn send_listing(
        &self,
        dir: &Path,
        relative: &str,
        response: &mut Response,
    ) -> anyhow::Result<bool> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            entries.push((name, entry.file_type()?.is_dir()));
        }
        entries.sort();

        let base = format!("{}/{}", self.web_path, relative.trim_matches('/'));
        let base = base.trim_end_matches('/');

        let mut page = String::from("<html><body>\n");
        for (name, is_dir) in &entries {
            let slash = if *is_dir { "/" } else { "" };
            page.push_str(&format!(
                "<a href=\"{}/{}{slash}\">{}{slash}</a><br>\n",
                base,
                urlencoding::encode(name),
                escape_html(name),
            ));
        }
        page.push_str("</body></html>\n");

        response.add_header("Content-Type", "text/html");
        response.add_header("Content-Length", page.len());
        response.add_header("Connection", "keep-alive");
        Ok(send(response, Bytes::from(page)))
    }
}

fn send_file(path: &Path, len: u64, response: &mut Response) -> anyhow::Result<bool> {
    let mut file = File::open(path)?;

    response.add_header("Content-Type", mime::for_path(path));
    response.add_header("Content-Length", len);
    response.add_header("Connection", "keep-alive");

    if !send(response, Bytes::new()) {
        return Ok(false);
    }

    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(true);
        }
        if !send(response, Bytes::copy_from_slice(&buf[..n])) {
            return Ok(false);
        }
    }
}

/// Writes and waits for the bytes to reach the socket, when there is a
/// runtime to wait on.
fn send(response: &mut Response, bytes: Bytes) -> bool {
    let done = response.write(bytes);
    match Handle::try_current() {
        Ok(handle) => handle.block_on(done),
        Err(_) => true,
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
