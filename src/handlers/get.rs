//! GET and HEAD: static files, index resolution, autoindex pages.

use crate::handlers::{error_response, resolve_fs_path, MAX_FILE_SIZE};
use crate::http::request::Request;
use crate::http::response::{http_date, Response, SERVER_TOKEN};
use crate::http::Method;
use crate::mime;
use crate::router::Policy;
use crate::vhost::VirtualServer;
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

pub fn handle(request: &Request, policy: &Policy<'_>, server: &VirtualServer) -> Response {
    let fs_path = match resolve_fs_path(policy, &request.path) {
        Some(path) => path,
        None => return error_response(403, server),
    };

    let mut response = match fs::metadata(&fs_path) {
        Ok(meta) if meta.is_dir() => handle_directory(request, policy, server, &fs_path),
        Ok(meta) if meta.is_file() => serve_file(&fs_path, server),
        Ok(_) => error_response(403, server),
        Err(err) => {
            debug!(path = %fs_path.display(), error = %err, "stat failed");
            error_response(status_for_io(&err), server)
        }
    };

    if request.method == Method::Head {
        response.set_head_only();
    }
    response
}

fn handle_directory(
    request: &Request,
    policy: &Policy<'_>,
    server: &VirtualServer,
    fs_path: &Path,
) -> Response {
    // Directories are only addressable with a trailing slash.
    if !request.path.ends_with('/') {
        let mut response = Response::new(301);
        response.set_header("Location", format!("{}/", request.path));
        response.set_empty_body();
        return response;
    }

    for index in policy.indexes {
        let candidate = fs_path.join(index);
        if candidate.is_file() {
            return serve_file(&candidate, server);
        }
    }

    if policy.autoindex {
        match directory_listing(fs_path, &request.path) {
            Ok(html) => {
                let mut response = Response::new(200);
                response.set_body(html, "text/html");
                response
            }
            Err(err) => {
                warn!(path = %fs_path.display(), error = %err, "directory listing failed");
                error_response(status_for_io(&err), server)
            }
        }
    } else {
        error_response(403, server)
    }
}

/// Read a regular file into a buffered 200 response.
fn serve_file(fs_path: &Path, server: &VirtualServer) -> Response {
    let meta = match fs::metadata(fs_path) {
        Ok(meta) => meta,
        Err(err) => return error_response(status_for_io(&err), server),
    };
    if meta.len() > MAX_FILE_SIZE {
        warn!(path = %fs_path.display(), size = meta.len(), "file exceeds serve ceiling");
        return error_response(413, server);
    }

    let content = match fs::read(fs_path) {
        Ok(content) => content,
        Err(err) => {
            warn!(path = %fs_path.display(), error = %err, "read failed");
            return error_response(status_for_io(&err), server);
        }
    };

    let mut response = Response::new(200);
    response.set_body(content, mime::content_type_for(fs_path));
    if let Ok(modified) = meta.modified() {
        response.set_header("Last-Modified", http_date(modified));
    }
    response
}

/// Synthesize the autoindex HTML page for a directory.
fn directory_listing(fs_path: &Path, uri: &str) -> io::Result<String> {
    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(fs_path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();

    let mut html = String::with_capacity(1024);
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
    let _ = write!(html, "<title>Index of {uri}</title>\n");
    html.push_str(
        "<style>\n\
         body { font-family: monospace; margin: 20px; }\n\
         table { border-collapse: collapse; }\n\
         th, td { padding: 5px 15px; text-align: left; }\n\
         th { border-bottom: 1px solid #000; }\n\
         .size { text-align: right; }\n\
         </style>\n",
    );
    html.push_str("</head>\n<body>\n");
    let _ = write!(html, "<h1>Index of {uri}</h1>\n");
    html.push_str("<table>\n<tr><th>Name</th><th>Last Modified</th><th class=\"size\">Size</th></tr>\n");

    if uri != "/" {
        html.push_str("<tr><td colspan=\"3\"><a href=\"../\">../</a></td></tr>\n");
    }

    for name in &names {
        let entry_path = fs_path.join(name);
        let meta = match fs::metadata(&entry_path) {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let slash = if meta.is_dir() { "/" } else { "" };
        let modified = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|_| "-".to_string());
        let size = if meta.is_dir() {
            "-".to_string()
        } else {
            meta.len().to_string()
        };

        let _ = write!(
            html,
            "<tr><td><a href=\"{href}{slash}\">{name}{slash}</a></td>\
             <td>{modified}</td><td class=\"size\">{size}</td></tr>\n",
            href = percent_encode(name),
        );
    }

    html.push_str("</table>\n<hr>\n");
    let _ = write!(html, "<address>{SERVER_TOKEN}</address>\n");
    html.push_str("</body>\n</html>\n");
    Ok(html)
}

/// Percent-encode a directory entry name for use in an href.
fn percent_encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for &b in name.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => {
                let _ = write!(out, "%{b:02X}");
            }
        }
    }
    out
}

fn status_for_io(err: &io::Error) -> u16 {
    match err.kind() {
        io::ErrorKind::NotFound => 404,
        io::ErrorKind::PermissionDenied => 403,
        _ => 500,
    }
}
