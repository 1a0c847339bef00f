use clap::{crate_version, App, Arg};
use http2core::{Request, Response, Server, ServerConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = App::new("httpcored")
        .version(crate_version!())
        .about("HTTP/1.0, HTTP/1.1 and HTTP/2 server core")
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .help("TCP port to listen on (default: 8080)"),
        )
        .arg(
            Arg::with_name("webroot")
                .long("webroot")
                .takes_value(true)
                .help("directory to serve static files from"),
        )
        .get_matches();

    let mut config = ServerConfig::default();
    if let Some(port) = matches.value_of("port") {
        config.port = port.parse().expect("--port must be a valid u16");
    }
    let webroot = matches
        .value_of("webroot")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let port = config.port;

    let static_handler: Arc<dyn http2core::Handler> = Arc::new(move |request: Request| {
        let webroot = webroot.clone();
        async move { serve_static(&webroot, &request).await }
    });

    let metrics = http2core::Metrics::new();
    let handler = http2core::server::with_health_endpoints(metrics.clone(), static_handler);
    let server = Arc::new(Server::with_metrics(config, handler, metrics));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind port {port}: {err}"));
    log::info!("httpcored listening on port {port}");
    if let Err(err) = server.run(listener).await {
        log::error!("accept loop terminated: {err}");
    }
}

/// Minimal static-file handler wired into the binary by default; a real
/// deployment supplies its own `Handler` to `http2core::Server` instead
/// (config-file loading, TLS provisioning and routing tables are out of
/// scope for the library per SPEC_FULL.md §1).
async fn serve_static(webroot: &std::path::Path, request: &Request) -> Response {
    if request.method != "GET" && request.method != "HEAD" {
        return Response::text(405, "Method Not Allowed");
    }
    let relative = request.path.trim_start_matches('/');
    let path = webroot.join(if relative.is_empty() { "index.html" } else { relative });
    match tokio::fs::read(&path).await {
        Ok(body) => {
            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            Response::new(200)
                .with_header("content-type", mime.essence_str().to_string())
                .with_body(body)
        }
        Err(_) => Response::text(404, "Not Found"),
    }
}
