//! Booters: where boot specs and file bytes come from.
//!
//! Boot protocols are stateless, so [`Booter::boot_spec`] gets called
//! several times over the course of a single boot attempt and must answer
//! consistently.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Url;

use crate::cmdline::expand_cmdline;
use crate::error::Error;
use crate::types::{BootSpec, Id, Machine};
use crate::urlsign;

/// An open boot file and, when known, its total size.
///
/// An unknown size forces the HTTP proxy to stream without a
/// `Content-Length`, which old iPXE builds handle orders of magnitude
/// slower; booters supply the size whenever they can.
pub struct BootFile {
    pub stream: Box<dyn AsyncRead + Send + Unpin>,
    pub size: Option<u64>,
}

impl BootFile {
    pub fn new(stream: impl AsyncRead + Send + Unpin + 'static, size: Option<u64>) -> Self {
        BootFile {
            stream: Box::new(stream),
            size,
        }
    }
}

/// Provides boot instructions and files for machines.
#[async_trait]
pub trait Booter: Send + Sync {
    /// What should the given machine boot? `Ok(None)` makes the server
    /// ignore the machine entirely.
    async fn boot_spec(&self, machine: &Machine) -> Result<Option<BootSpec>, Error>;

    /// Opens the file behind an ID previously published in a [`BootSpec`].
    async fn read_boot_file(&self, id: &Id) -> Result<BootFile, Error>;
}

/// Opens a path that may be an HTTP(S) URL, a `file://` URL, or a bare
/// filesystem path.
async fn serve_file(path: &str) -> Result<BootFile, Error> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return serve_http(path).await;
    }
    let path = path.strip_prefix("file://").unwrap_or(path);
    let file = tokio::fs::File::open(path).await?;
    let size = file.metadata().await?.len();
    Ok(BootFile::new(file, Some(size)))
}

async fn serve_http(url: &str) -> Result<BootFile, Error> {
    let resp = reqwest::get(url).await?;
    if !resp.status().is_success() {
        return Err(Error::Upstream(format!("GET {:?} failed: {}", url, resp.status())));
    }
    let size = resp.content_length();
    let stream = resp
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    Ok(BootFile {
        stream: Box::new(StreamReader::new(Box::pin(stream))),
        size,
    })
}

/// Boots every machine with the same spec.
///
/// The operator-supplied paths and URLs stay local; machines only ever
/// see the surrogate tags `kernel`, `initrd-N` and `other-N`.
pub struct StaticBooter {
    kernel: String,
    initrd: Vec<String>,
    other_ids: Vec<String>,
    spec: BootSpec,
}

impl StaticBooter {
    pub fn new(spec: BootSpec) -> Result<Self, Error> {
        let mut other_ids: Vec<String> = Vec::new();
        let cmdline = expand_cmdline(&spec.cmdline, "ID", |id| {
            other_ids.push(id.to_string());
            Ok(format!("{{{{ ID \"other-{}\" }}}}", other_ids.len() - 1))
        })?;

        let published = BootSpec {
            kernel: Id::from("kernel"),
            initrd: (0..spec.initrd.len())
                .map(|i| Id::new(format!("initrd-{}", i)))
                .collect(),
            cmdline,
            message: spec.message.clone(),
            ipxe_script: spec.ipxe_script.clone(),
        };

        Ok(StaticBooter {
            kernel: spec.kernel.to_string(),
            initrd: spec.initrd.iter().map(|id| id.to_string()).collect(),
            other_ids,
            spec: published,
        })
    }

    fn lookup(&self, id: &Id) -> Option<&str> {
        let name = id.as_str();
        if name == "kernel" {
            return Some(&self.kernel);
        }
        if let Some(i) = name.strip_prefix("initrd-") {
            return i.parse::<usize>().ok().and_then(|i| self.initrd.get(i)).map(String::as_str);
        }
        if let Some(i) = name.strip_prefix("other-") {
            return i
                .parse::<usize>()
                .ok()
                .and_then(|i| self.other_ids.get(i))
                .map(String::as_str);
        }
        None
    }
}

#[async_trait]
impl Booter for StaticBooter {
    async fn boot_spec(&self, _machine: &Machine) -> Result<Option<BootSpec>, Error> {
        Ok(Some(self.spec.clone()))
    }

    async fn read_boot_file(&self, id: &Id) -> Result<BootFile, Error> {
        match self.lookup(id) {
            Some(path) => serve_file(path).await,
            None => Err(Error::UnknownId(id.to_string())),
        }
    }
}

/// The shape of a boot API response.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    kernel: String,
    #[serde(default)]
    initrd: Vec<String>,
    #[serde(default)]
    cmdline: Option<CmdlineField>,
    #[serde(default)]
    message: String,
    #[serde(rename = "ipxe-script", default)]
    ipxe_script: String,
}

/// The cmdline is either the template string, or the deprecated
/// key/value object form.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CmdlineField {
    Text(String),
    Pairs(serde_json::Map<String, Value>),
}

/// Gets boot specs from a remote API server over HTTP.
///
/// Every URL the API hands back is sealed into an opaque ID before a
/// machine sees it, so the file proxy only serves locations this booter
/// vouched for.
pub struct ApiBooter {
    client: reqwest::Client,
    url_prefix: String,
    key: [u8; 32],
}

impl ApiBooter {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, Error> {
        let mut url = api_url.to_string();
        if !url.ends_with('/') {
            url.push('/');
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(ApiBooter {
            client,
            url_prefix: url + "v1",
            key: urlsign::generate_key(),
        })
    }

    fn make_url_absolute(&self, url_str: &str) -> Result<String, Error> {
        match Url::parse(url_str) {
            Ok(u) => Ok(u.to_string()),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = Url::parse(&self.url_prefix)?;
                Ok(base.join(url_str)?.to_string())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn sign(&self, url_str: &str) -> Result<Id, Error> {
        urlsign::sign_url(url_str, &self.key)
    }
}

#[async_trait]
impl Booter for ApiBooter {
    async fn boot_spec(&self, machine: &Machine) -> Result<Option<BootSpec>, Error> {
        let req_url = format!("{}/boot/{}", self.url_prefix, machine.mac);
        let resp = self.client.get(&req_url).send().await?;
        if !resp.status().is_success() {
            debug!("API server refused to boot {}: {}", machine.mac, resp.status());
            return Ok(None);
        }
        let body = resp.text().await?;
        let parsed: ApiResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("malformed API response for {}: {}", machine.mac, e);
                return Ok(None);
            }
        };

        if !parsed.ipxe_script.is_empty() {
            return Ok(Some(BootSpec {
                ipxe_script: Some(parsed.ipxe_script),
                ..BootSpec::default()
            }));
        }

        let kernel = self.sign(&self.make_url_absolute(&parsed.kernel)?)?;
        let mut initrd = Vec::with_capacity(parsed.initrd.len());
        for img in &parsed.initrd {
            initrd.push(self.sign(&self.make_url_absolute(img)?)?);
        }

        let cmdline = match parsed.cmdline {
            None => String::new(),
            Some(CmdlineField::Text(s)) => s,
            Some(CmdlineField::Pairs(pairs)) => construct_cmdline(&pairs)?,
        };
        let cmdline = expand_cmdline(&cmdline, "URL", |u| {
            let abs = self.make_url_absolute(u)?;
            Ok(format!("{{{{ ID \"{}\" }}}}", self.sign(&abs)?))
        })?;

        Ok(Some(BootSpec {
            kernel,
            initrd,
            cmdline,
            message: (!parsed.message.is_empty()).then_some(parsed.message),
            ipxe_script: None,
        }))
    }

    async fn read_boot_file(&self, id: &Id) -> Result<BootFile, Error> {
        let url_str = urlsign::get_url(id, &self.key)?;
        let parsed = Url::parse(&url_str)?;
        if parsed.scheme() == "file" {
            let file = tokio::fs::File::open(parsed.path()).await?;
            let size = file.metadata().await?.len();
            return Ok(BootFile::new(file, Some(size)));
        }
        serve_http(&url_str).await
    }
}

/// Renders the deprecated object form of a cmdline: keys sorted, booleans
/// as bare flags, strings quoted, `{url}` objects as `URL` invocations.
fn construct_cmdline(pairs: &serde_json::Map<String, Value>) -> Result<String, Error> {
    let mut keys: Vec<&String> = pairs.keys().collect();
    keys.sort();

    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        match &pairs[key] {
            Value::Bool(_) => parts.push(key.clone()),
            Value::String(s) => parts.push(format!("{}=\"{}\"", key, s)),
            Value::Object(o) => {
                let url = o.get("url").and_then(Value::as_str).ok_or_else(|| {
                    Error::Template(format!(
                        "cmdline key {:?} has object value with no 'url' attribute",
                        key
                    ))
                })?;
                parts.push(format!("{}={{{{ URL \"{}\" }}}}", key, url));
            }
            _ => {
                return Err(Error::Template(format!(
                    "unsupported value kind for cmdline key {:?}",
                    key
                )))
            }
        }
    }
    Ok(parts.join(" "))
}
