//! POST: request-body uploads into a configured directory.

use crate::handlers::error_response;
use crate::http::request::Request;
use crate::http::response::Response;
use crate::mime;
use crate::router::Policy;
use crate::vhost::VirtualServer;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Names generated uploads when the client supplies no filename.
static UPLOAD_COUNTER: AtomicU64 = AtomicU64::new(1);

pub fn handle(request: &mut Request, policy: &Policy<'_>, server: &VirtualServer) -> Response {
    if request.body.len() > server.client_max_body_size {
        return error_response(413, server);
    }

    let upload_dir = match policy.upload_path {
        Some(dir) => dir,
        // No upload directory: the CGI hook point is reserved but not
        // wired to an executor, so either way this is unimplemented.
        None => return error_response(501, server),
    };

    match fs::metadata(upload_dir) {
        Ok(meta) if meta.is_dir() => {}
        _ => {
            warn!(dir = %upload_dir.display(), "upload directory not usable");
            return error_response(500, server);
        }
    }

    let filename = choose_filename(request);
    let created = match create_upload_file(upload_dir, &filename) {
        Some(created) => created,
        None => {
            warn!(dir = %upload_dir.display(), file = %filename, "could not create upload file");
            return error_response(500, server);
        }
    };

    let mut file = created.file;
    let written = match request.body.copy_to(&mut file) {
        Ok(written) => written,
        Err(err) => {
            warn!(path = %created.path.display(), error = %err, "upload write failed");
            return error_response(500, server);
        }
    };

    info!(path = %created.path.display(), bytes = written, "upload stored");

    let location = format!(
        "{}/{}",
        request.path.trim_end_matches('/'),
        created.final_name
    );

    let mut html = String::with_capacity(256);
    html.push_str("<!DOCTYPE html>\n<html>\n<head><title>Upload Successful</title></head>\n<body>\n");
    html.push_str("<h1>File Uploaded Successfully</h1>\n");
    let _ = write!(html, "<p>Filename: {}</p>\n", created.final_name);
    let _ = write!(html, "<p>Size: {written} bytes</p>\n");
    html.push_str("</body>\n</html>\n");

    let mut response = Response::new(201);
    response.set_header("Location", location);
    response.set_body(html, "text/html");
    response
}

/// Pick the stored filename: `Content-Disposition`'s `filename=` when
/// present, otherwise a counter plus a suffix inferred from the
/// `Content-Type`.
fn choose_filename(request: &Request) -> String {
    if let Some(disposition) = request.headers.get("content-disposition") {
        if let Some(name) = disposition_filename(disposition) {
            return name;
        }
    }
    let counter = UPLOAD_COUNTER.fetch_add(1, Ordering::Relaxed);
    let suffix = mime::upload_suffix(request.headers.get("content-type"));
    format!("upload_{counter}{suffix}")
}

/// Extract `filename="..."` from a Content-Disposition value,
/// stripping any path components the client smuggled in.
fn disposition_filename(disposition: &str) -> Option<String> {
    let start = disposition.find("filename=\"")? + "filename=\"".len();
    let end = disposition[start..].find('"')? + start;
    let raw = &disposition[start..end];
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

struct CreatedUpload {
    file: fs::File,
    path: PathBuf,
    final_name: String,
}

/// Exclusively create the upload file, appending `_1`..`_99` before
/// the extension on collisions.
fn create_upload_file(dir: &Path, filename: &str) -> Option<CreatedUpload> {
    for attempt in 0..100u32 {
        let candidate = if attempt == 0 {
            filename.to_string()
        } else {
            match filename.rfind('.') {
                Some(dot) if dot > 0 => {
                    format!("{}_{attempt}{}", &filename[..dot], &filename[dot..])
                }
                _ => format!("{filename}_{attempt}"),
            }
        };
        let path = dir.join(&candidate);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&path)
        {
            Ok(file) => {
                return Some(CreatedUpload {
                    file,
                    path,
                    final_name: candidate,
                })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(_) => return None,
        }
    }
    None
}
