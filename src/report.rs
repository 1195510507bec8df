//! NEL / CSP violation report ingestion
//!
//! Small JSON documents arrive over HTTP and are appended, one wrapped JSON
//! line each, to a log file that an external shipper rotates out from under
//! us. The append side therefore re-checks the file's identity before every
//! write, the same (dev, ino) trick the tail side uses, just pointed the
//! other way.

use crate::config::ReportConfig;
use crate::constants;
use crate::http::{self, Handler, Request};
use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io;
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Mutex;
use url::form_urlencoded;

/// Append-only JSONL log with reopen-on-rotation semantics.
pub struct ReportLog {
    path: PathBuf,
    file: Option<fs::File>,
    file_id: Option<(u64, u64)>,
}

impl ReportLog {
    /// Create a log writer for `path`. The file is not opened until the
    /// first append needs it.
    pub fn new<P>(path: P) -> ReportLog
    where
        P: Into<PathBuf>,
    {
        ReportLog {
            path: path.into(),
            file: None,
            file_id: None,
        }
    }

    fn current_file_id(&self) -> Option<(u64, u64)> {
        fs::metadata(&self.path)
            .ok()
            .map(|m| (m.dev(), m.ino()))
    }

    fn reopen(&mut self) -> io::Result<()> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.file = Some(file);
        self.file_id = self.current_file_id();
        Ok(())
    }

    /// Append one line. If the path has been rotated away -- missing, or a
    /// different inode than the handle we hold -- a fresh file is opened
    /// first. An I/O failure drops this line; the next append starts over
    /// from the identity check.
    pub fn append(&mut self, line: &str) -> io::Result<()> {
        if self.file.is_none() || self.current_file_id() != self.file_id {
            self.reopen()?;
        }
        let file = self.file.as_mut().expect("reopen just set the file");
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

/// Wrap an uploaded report into the line format the log carries.
pub fn wrap_report(kind: &str, report: Value, context: &str, x_forwarded_for: &str) -> Value {
    json!({
        "type": kind,
        "@timestamp": Utc::now().to_rfc3339(),
        "report": report,
        "context": context,
        "x_forwarded_for": x_forwarded_for,
    })
}

/// The report mode surface: two slug-guarded upload endpoints and a
/// liveness probe.
pub struct ReportHandler {
    nel: Mutex<ReportLog>,
    csp: Mutex<ReportLog>,
    nel_path: String,
    csp_path: String,
}

impl ReportHandler {
    /// Build the handler from the `nel` configuration section.
    pub fn new(config: &ReportConfig) -> ReportHandler {
        ReportHandler {
            nel: Mutex::new(ReportLog::new(config.nel_report_log.clone())),
            csp: Mutex::new(ReportLog::new(config.csp_report_log.clone())),
            nel_path: format!("/nel/{}", config.uuid),
            csp_path: format!("/csp/{}", config.uuid),
        }
    }

    fn ingest(&self, mut request: Request, kind: &str, log: &Mutex<ReportLog>) {
        let url = request.url().to_string();

        let mut body = Vec::with_capacity(1024);
        let limit = (constants::MAX_REPORT_BYTES + 1) as u64;
        if let Err(e) = request.as_reader().take(limit).read_to_end(&mut body) {
            warn!("could not read {} report body: {}", kind, e);
            http::respond_error(request, 400, "unreadable body\n");
            return;
        }
        if body.len() > constants::MAX_REPORT_BYTES {
            warn!("over-length {} report rejected", kind);
            http::respond_error(request, 413, "report too large\n");
            return;
        }
        let report: Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => {
                warn!("malformed {} report rejected: {}", kind, e);
                http::respond_error(request, 400, "malformed report\n");
                return;
            }
        };

        let context = query_param(&url, "context").unwrap_or_default();
        if context.chars().count() > constants::MAX_CONTEXT_CHARS {
            warn!("over-long context on {} report rejected", kind);
            http::respond_error(request, 400, "context too long\n");
            return;
        }
        let x_forwarded_for = header_value(&request, "X-Forwarded-For");

        let line = wrap_report(kind, report, &context, &x_forwarded_for).to_string();
        if let Err(e) = log.lock().unwrap().append(&line) {
            // dropped sample; the next append re-checks and reopens
            error!("could not append {} report: {}", kind, e);
        }
        http::respond(request, "text/plain", "ok\n".to_string());
    }
}

fn query_param(url: &str, name: &str) -> Option<String> {
    let query = url.splitn(2, '?').nth(1)?;
    form_urlencoded::parse(query.as_bytes())
        .find(|&(ref k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

fn header_value(request: &Request, field: &'static str) -> String {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(field))
        .map(|h| h.value.as_str().to_string())
        .unwrap_or_default()
}

impl Handler for ReportHandler {
    fn handle(&self, request: Request) {
        let url = request.url().to_string();
        let method = request.method().clone();
        let path = http::path_of(&url);
        if method == tiny_http::Method::Get && path == "/nop" {
            http::respond(request, "text/plain", "nop\n".to_string());
        } else if method == tiny_http::Method::Post && path == self.nel_path {
            self.ingest(request, "nel", &self.nel);
        } else if method == tiny_http::Method::Post && path == self.csp_path {
            self.ingest(request, "csp", &self.csp);
        } else {
            http::respond_error(request, 404, "not found\n");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ReportConfig;
    use crate::http::Server;
    use std::fs;
    use std::io::Read as _;
    use std::io::Write as _;
    use std::net::TcpStream;
    use std::sync::Arc;
    use tempdir::TempDir;

    #[test]
    fn append_reopens_after_rotation() {
        let dir = TempDir::new("report-log").expect("tempdir");
        let path = dir.path().join("nel.jsonl");
        let mut log = ReportLog::new(path.clone());

        log.append("one").expect("append should succeed");
        // simulate logrotate: move the live file aside
        let rotated = dir.path().join("nel.jsonl.1");
        fs::rename(&path, &rotated).expect("rename should succeed");
        log.append("two").expect("append should succeed");

        assert_eq!(fs::read_to_string(&rotated).unwrap(), "one\n");
        assert_eq!(fs::read_to_string(&path).unwrap(), "two\n");
    }

    #[test]
    fn wrap_report_shape() {
        let wrapped = wrap_report("nel", json!({"age": 0}), "checkout", "1.2.3.4");
        assert_eq!(wrapped["type"], "nel");
        assert_eq!(wrapped["report"]["age"], 0);
        assert_eq!(wrapped["context"], "checkout");
        assert_eq!(wrapped["x_forwarded_for"], "1.2.3.4");
        let stamp = wrapped["@timestamp"].as_str().expect("timestamp should exist");
        assert!(stamp.contains('T'));
    }

    fn request(addr: std::net::SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).expect("connect should succeed");
        stream.write_all(raw.as_bytes()).expect("write should succeed");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .expect("read should succeed");
        response
    }

    fn post(addr: std::net::SocketAddr, path: &str, body: &str) -> String {
        request(
            addr,
            &format!(
                "POST {} HTTP/1.0\r\nHost: localhost\r\nX-Forwarded-For: 9.9.9.9\r\nContent-Length: {}\r\n\r\n{}",
                path,
                body.len(),
                body
            ),
        )
    }

    #[test]
    fn upload_appends_wrapped_line() {
        let dir = TempDir::new("report-srv").expect("tempdir");
        let config = ReportConfig {
            nel_report_log: dir.path().join("nel.jsonl"),
            csp_report_log: dir.path().join("csp.jsonl"),
            uuid: "f00f".to_string(),
        };
        let handler = Arc::new(ReportHandler::new(&config));
        let server = Server::bind("127.0.0.1:0", handler, 2).expect("bind should succeed");
        let addr = server.local_addr();

        let nop = request(addr, "GET /nop HTTP/1.0\r\nHost: localhost\r\n\r\n");
        assert!(nop.contains("nop"));

        let ok = post(addr, "/nel/f00f?context=checkout", r#"{"age":0}"#);
        assert!(ok.contains("200"));
        let line = fs::read_to_string(dir.path().join("nel.jsonl")).unwrap();
        let parsed: Value = serde_json::from_str(line.trim()).expect("line should be JSON");
        assert_eq!(parsed["type"], "nel");
        assert_eq!(parsed["context"], "checkout");
        assert_eq!(parsed["x_forwarded_for"], "9.9.9.9");
        assert_eq!(parsed["report"]["age"], 0);

        // wrong slug is a 404, malformed body a 400
        assert!(post(addr, "/nel/wrong", r#"{}"#).contains("404"));
        assert!(post(addr, "/nel/f00f", "{not json").contains("400"));
        let long_context = format!("/nel/f00f?context={}", "x".repeat(65));
        assert!(post(addr, &long_context, r#"{}"#).contains("400"));
    }
}
