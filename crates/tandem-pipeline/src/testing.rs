//! Test doubles shared by the unit tests of this crate.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::engine::{GenerationEngine, GenerationRequest};
use crate::process::ExternalError;
use crate::profile::TargetKind;

/// A contract with a single `GET /health` endpoint.
pub const HEALTH_CONTRACT: &str = r##"openapi: 3.0.3
info:
  title: Health API
  version: 1.0.0
paths:
  /health:
    get:
      operationId: getHealth
      tags: [health]
      responses:
        "200":
          description: Service is healthy
          content:
            application/json:
              schema:
                $ref: "#/components/schemas/HealthStatus"
components:
  schemas:
    HealthStatus:
      type: object
      required: [status]
      properties:
        status:
          type: string
"##;

/// Deterministic in-process generator.
///
/// Parses the contract and writes one api file per tag and one model file
/// per schema under the requested packages. Rejects documents without an
/// `openapi` field, like a real generator would.
pub struct ScaffoldEngine {
    calls: Arc<AtomicUsize>,
    fail_for: Option<TargetKind>,
}

impl ScaffoldEngine {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_for: None,
        }
    }

    /// Engine that rejects every request for `target`.
    pub fn failing_for(target: TargetKind) -> Self {
        Self {
            fail_for: Some(target),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Default for ScaffoldEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn package_dir(package: &str) -> PathBuf {
    package.split('.').collect()
}

fn pascal_case(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

impl GenerationEngine for ScaffoldEngine {
    fn identity(&self) -> String {
        "scaffold-engine/1".to_string()
    }

    fn generate(&self, request: &GenerationRequest) -> Result<(), ExternalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_for == Some(request.target) {
            return Err(ExternalError::Rejected(format!(
                "generator '{}' is not installed",
                request.generator
            )));
        }

        let content = fs::read_to_string(&request.contract)?;
        let doc: serde_json::Value = serde_yaml::from_str(&content)
            .map_err(|e| ExternalError::Rejected(format!("cannot parse contract: {}", e)))?;
        if doc.get("openapi").and_then(|v| v.as_str()).is_none() {
            return Err(ExternalError::Rejected(
                "contract is not an OpenAPI document".into(),
            ));
        }

        let root = request.output_dir.join("src/main/kotlin");
        let api_dir = root.join(package_dir(&request.packages.api));
        let model_dir = root.join(package_dir(&request.packages.model));
        fs::create_dir_all(&api_dir)?;
        fs::create_dir_all(&model_dir)?;

        let mut operations: Vec<(String, String, String)> = Vec::new();
        if let Some(paths) = doc.get("paths").and_then(|p| p.as_object()) {
            for (path, item) in paths {
                for (method, op) in item.as_object().into_iter().flatten() {
                    let tag = op
                        .get("tags")
                        .and_then(|t| t.get(0))
                        .and_then(|t| t.as_str())
                        .unwrap_or("default")
                        .to_string();
                    let id = op
                        .get("operationId")
                        .and_then(|i| i.as_str())
                        .unwrap_or(method)
                        .to_string();
                    operations.push((tag, id, format!("{} {}", method.to_uppercase(), path)));
                }
            }
        }
        operations.sort();

        let mut tags: Vec<&str> = operations.iter().map(|(t, _, _)| t.as_str()).collect();
        tags.dedup();
        for tag in tags {
            let name = format!("{}Api", pascal_case(tag));
            let mut body = format!("package {}\n\ninterface {} {{\n", request.packages.api, name);
            for (_, id, route) in operations.iter().filter(|(t, _, _)| t == tag) {
                body.push_str(&format!("    // {}\n    fun {}()\n", route, id));
            }
            body.push_str("}\n");
            fs::write(api_dir.join(format!("{}.kt", name)), body)?;
        }

        if let Some(schemas) = doc
            .pointer("/components/schemas")
            .and_then(|s| s.as_object())
        {
            for name in schemas.keys() {
                let body = format!(
                    "package {}\n\ndata class {}(val status: String)\n",
                    request.packages.model, name
                );
                fs::write(model_dir.join(format!("{}.kt", name)), body)?;
            }
        }

        let mut options = String::new();
        for (key, value) in request.options.iter().chain(&request.global_properties) {
            options.push_str(&format!("{}={}\n", key, value));
        }
        fs::write(
            request.output_dir.join(".generator-options"),
            format!("generator={}\n{}", request.generator, options),
        )?;
        Ok(())
    }
}

/// Engine that always fails with the given message.
pub struct FailingEngine {
    message: String,
}

impl FailingEngine {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl GenerationEngine for FailingEngine {
    fn identity(&self) -> String {
        "failing-engine".to_string()
    }

    fn generate(&self, _request: &GenerationRequest) -> Result<(), ExternalError> {
        Err(ExternalError::Rejected(self.message.clone()))
    }
}

/// Write a project (config, contract, file registry) into `dir`; returns
/// the config path.
pub fn write_project(dir: &Path) -> PathBuf {
    fs::create_dir_all(dir.join("api")).unwrap();
    fs::write(dir.join("api/openapi.yaml"), HEALTH_CONTRACT).unwrap();
    let config = format!(
        r#"product: health
group: com.example.health
contract: api/openapi.yaml
registry:
  url: "file://{}"
"#,
        dir.join("registry").display()
    );
    let path = dir.join("tandem.yaml");
    fs::write(&path, config).unwrap();
    path
}

/// Run `git` in `dir` with a throwaway identity; panics on failure.
pub fn run_git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args([
            "-c",
            "user.name=tandem",
            "-c",
            "user.email=tandem@example.com",
            "-c",
            "commit.gpgsign=false",
            "-c",
            "tag.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(output.status.success(), "git {:?} failed", args);
}

/// Environment lookup that provides registry credentials.
pub fn env_with_credentials() -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
    |key| match key {
        "TANDEM_REGISTRY_USER" => Some("ci".to_string()),
        "TANDEM_REGISTRY_TOKEN" => Some("token".to_string()),
        _ => None,
    }
}

/// A request seen by [`RecordingServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: Vec<u8>,
}

/// Minimal HTTP/1.1 server answering a fixed number of requests with one
/// status code.
pub struct RecordingServer {
    addr: std::net::SocketAddr,
    handle: JoinHandle<Vec<RecordedRequest>>,
}

impl RecordingServer {
    pub fn start(status: u16, expected: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for _ in 0..expected {
                let Ok((mut stream, _)) = listener.accept() else {
                    break;
                };
                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();
                if let Some(request) = read_request(&mut stream) {
                    requests.push(request);
                }
                let response = format!(
                    "HTTP/1.1 {} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
            requests
        });

        Self { addr, handle }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Wait for the expected requests and return them.
    pub fn finish(self) -> Vec<RecordedRequest> {
        self.handle.join().unwrap()
    }
}

fn read_request(stream: &mut impl Read) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let mut content_length = 0usize;
    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.parse().unwrap_or(0);
            } else if name.eq_ignore_ascii_case("authorization") {
                authorization = Some(value.to_string());
            }
        }
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(RecordedRequest {
        method,
        path,
        authorization,
        body,
    })
}
