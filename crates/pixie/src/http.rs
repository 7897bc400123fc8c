//! HTTP endpoints: boot script synthesis, file proxy, boot ping.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Host, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dhcp4::Mac;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::cmdline::expand_cmdline;
use crate::error::Error;
use crate::events::MachineState;
use crate::server::ServerInner;
use crate::types::{Architecture, BootSpec, Id, Machine};

pub(crate) fn router(inner: Arc<ServerInner>) -> Router {
    Router::new()
        .route("/_/ipxe", get(handle_ipxe))
        .route("/_/file", get(handle_file))
        .route("/_/booting", get(handle_booting))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(inner)
}

#[derive(Deserialize)]
struct IpxeQuery {
    mac: Option<String>,
    arch: Option<String>,
}

async fn handle_ipxe(
    State(inner): State<Arc<ServerInner>>,
    Host(host): Host,
    Query(query): Query<IpxeQuery>,
) -> Response {
    let Some(mac_str) = query.mac else {
        return (StatusCode::BAD_REQUEST, "missing MAC address parameter").into_response();
    };
    let Some(arch_str) = query.arch else {
        return (StatusCode::BAD_REQUEST, "missing architecture parameter").into_response();
    };
    let Ok(mac) = mac_str.parse::<Mac>() else {
        debug!("bad request, invalid MAC address {:?}", mac_str);
        return (StatusCode::BAD_REQUEST, "invalid MAC address").into_response();
    };
    let Ok(arch_num) = arch_str.parse::<i32>() else {
        debug!("bad request, invalid architecture {:?}", arch_str);
        return (StatusCode::BAD_REQUEST, "invalid architecture").into_response();
    };
    let Some(arch) = Architecture::from_i32(arch_num) else {
        debug!("bad request, unknown architecture {}", arch_num);
        return (StatusCode::BAD_REQUEST, "unknown architecture").into_response();
    };

    let machine = Machine { mac, arch };
    let spec = match inner.booter.boot_spec(&machine).await {
        Err(e) => {
            warn!("couldn't get a bootspec for {}: {}", mac, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "couldn't get a bootspec")
                .into_response();
        }
        Ok(None) => {
            debug!("no boot spec for {}, ignoring boot request", mac);
            return (StatusCode::NOT_FOUND, "you don't netboot").into_response();
        }
        Ok(Some(spec)) => spec,
    };

    let script = match ipxe_script(&machine, &spec, &host) {
        Ok(script) => script,
        Err(e) => {
            warn!("failed to assemble iPXE script for {}: {}", mac, e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "couldn't get a boot script",
            )
                .into_response();
        }
    };
    inner
        .events
        .record(mac, MachineState::IpxeScript, "Sent iPXE boot script");
    ([(header::CONTENT_TYPE, "text/plain")], script).into_response()
}

#[derive(Deserialize)]
struct FileQuery {
    name: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    mac: Option<String>,
}

async fn handle_file(
    State(inner): State<Arc<ServerInner>>,
    Query(query): Query<FileQuery>,
) -> Response {
    let Some(name) = query.name else {
        return (StatusCode::BAD_REQUEST, "missing filename").into_response();
    };

    let file = match inner.booter.read_boot_file(&Id::from(name.clone())).await {
        Ok(file) => file,
        Err(e) => {
            // The error may name the upstream URL; the client only ever
            // learns that the fetch failed.
            warn!("error getting file {:?}: {}", name, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "couldn't get file").into_response();
        }
    };

    let mut builder = Response::builder().status(StatusCode::OK);
    match file.size {
        Some(size) => {
            builder = builder.header(header::CONTENT_LENGTH, size);
        }
        None => warn!(
            "unknown file size for {:?}, boot will be VERY slow (can your booter provide file sizes?)",
            name
        ),
    }
    let resp = match builder.body(Body::from_stream(ReaderStream::new(file.stream))) {
        Ok(resp) => resp,
        Err(e) => {
            warn!("failed to build file response for {:?}: {}", name, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "couldn't get file").into_response();
        }
    };

    match query.kind.as_deref() {
        Some("kernel") => record_file_event(&inner, query.mac, MachineState::Kernel, &name),
        Some("initrd") => record_file_event(&inner, query.mac, MachineState::Initrd, &name),
        _ => {}
    }
    resp
}

fn record_file_event(
    inner: &ServerInner,
    mac: Option<String>,
    state: MachineState,
    name: &str,
) {
    match mac.as_deref().map(str::parse::<Mac>) {
        Some(Ok(mac)) => {
            inner
                .events
                .record(mac, state, format!("Sent {} {:?}", state, name));
        }
        _ => warn!("file fetch provided no valid MAC address"),
    }
}

async fn handle_booting(
    State(inner): State<Arc<ServerInner>>,
    Query(query): Query<IpxeQuery>,
) -> Response {
    // The body is a no-op boot script to satisfy iPXE; the generated
    // script discards the image right after downloading it.
    if let Some(Ok(mac)) = query.mac.as_deref().map(str::parse::<Mac>) {
        inner
            .events
            .record(mac, MachineState::Booted, "Booting into OS");
    }
    "# Booting".into_response()
}

/// Assembles the iPXE script for a machine, or hands back the raw
/// operator-supplied script if the spec carries one.
fn ipxe_script(machine: &Machine, spec: &BootSpec, server_host: &str) -> Result<String, Error> {
    if let Some(script) = &spec.ipxe_script {
        return Ok(script.clone());
    }
    if spec.kernel.is_empty() {
        return Err(Error::Template("spec is missing kernel".to_string()));
    }

    let mac = escape(&machine.mac.to_string());
    let mut script = String::with_capacity(512);
    script.push_str("#!ipxe\n");
    script.push_str(&format!(
        "kernel --name kernel http://{}/_/file?name={}&type=kernel&mac={}\n",
        server_host,
        escape(spec.kernel.as_str()),
        mac
    ));
    for (i, initrd) in spec.initrd.iter().enumerate() {
        script.push_str(&format!(
            "initrd --name initrd{} http://{}/_/file?name={}&type=initrd&mac={}\n",
            i,
            server_host,
            escape(initrd.as_str()),
            mac
        ));
    }
    // The boot ping is best-effort: "||" swallows failures of both the
    // fetch and the free.
    script.push_str(&format!(
        "imgfetch --name ready http://{}/_/booting?mac={} ||\n",
        server_host, mac
    ));
    script.push_str("imgfree ready ||\n");

    script.push_str("boot kernel ");
    for i in 0..spec.initrd.len() {
        script.push_str(&format!("initrd=initrd{} ", i));
    }
    let cmdline = expand_cmdline(&spec.cmdline, "ID", |id| {
        Ok(format!(
            "http://{}/_/file?name={}",
            server_host,
            escape(id)
        ))
    })?;
    script.push_str(&cmdline);
    script.push('\n');
    Ok(script)
}

fn escape(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}
