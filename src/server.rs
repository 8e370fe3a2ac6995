//! The standalone HTTP(S) server: listeners for every configured host,
//! one task per connection, optional TLS with a configurable protocol
//! floor, bounded parallelism and graceful shutdown.

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use hyper::rt::{Read, Write};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, error, info, warn};
use rustls_pemfile::{certs, private_key};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio_rustls::TlsAcceptor;

use crate::config::Config;
use crate::handler::DavHandler;

pub struct Server {
    config: Arc<Config>,
    handler: DavHandler,
    tls: Option<TlsAcceptor>,
}

trait Io: Read + Write + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for TokioIo<T> {}

impl Server {
    pub fn new(config: Arc<Config>) -> Result<Server> {
        let handler = DavHandler::new(config.clone()).context("initializing handler")?;
        let tls = if config.server.ssl {
            Some(build_tls_acceptor(&config)?)
        } else {
            None
        };
        Ok(Server {
            config,
            handler,
            tls,
        })
    }

    /// Run until ctrl-c (or `must_exit` flips, when embedded).
    pub async fn run(self) -> Result<()> {
        let (exit_tx, must_exit) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                let _ = exit_tx.send(true);
            }
        });
        self.run_until(must_exit).await
    }

    pub async fn run_until(self, must_exit: watch::Receiver<bool>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.server.max_connections.max(1)));
        let timeout = Duration::from_secs_f64(self.config.server.timeout);

        let mut accept_tasks = Vec::new();
        for host in &self.config.server.hosts {
            let listener = TcpListener::bind(host)
                .await
                .with_context(|| format!("binding {host}"))?;
            info!(
                "listening on {}{}",
                host,
                if self.tls.is_some() { " (tls)" } else { "" }
            );
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                self.handler.clone(),
                self.tls.clone(),
                timeout,
                semaphore.clone(),
                must_exit.clone(),
            )));
        }

        for task in accept_tasks {
            let _ = task.await;
        }

        // in-flight connections get a short grace period, then the
        // hook process groups are taken down with us.
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Some(hook) = self.handler.hook() {
            hook.kill_all();
        }
        info!("server stopped");
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: DavHandler,
    tls: Option<TlsAcceptor>,
    timeout: Duration,
    semaphore: Arc<Semaphore>,
    mut must_exit: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = must_exit.changed() => break,
        };
        let (socket, peer) = match accepted {
            Ok(x) => x,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        debug!("connection from {}", peer);
        let handler = handler.clone();
        let tls = tls.clone();
        let must_exit = must_exit.clone();
        tokio::spawn(async move {
            let _permit = permit;
            serve_connection(socket, peer.to_string(), handler, tls, timeout, must_exit).await;
        });
    }
}

async fn serve_connection(
    socket: TcpStream,
    peer: String,
    handler: DavHandler,
    tls: Option<TlsAcceptor>,
    timeout: Duration,
    mut must_exit: watch::Receiver<bool>,
) {
    socket.set_nodelay(true).ok();

    // the TLS handshake is bounded by the socket timeout and happens
    // here, off the accept path.
    let stream: Box<dyn Io> = match tls {
        Some(acceptor) => {
            match tokio::time::timeout(timeout, acceptor.accept(socket)).await {
                Ok(Ok(stream)) => Box::new(TokioIo::new(stream)),
                Ok(Err(e)) => {
                    warn!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
                Err(_) => {
                    warn!("TLS handshake with {} timed out", peer);
                    return;
                }
            }
        }
        None => Box::new(TokioIo::new(socket)),
    };

    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
        let handler = handler.clone();
        let peer = peer.clone();
        async move {
            Ok::<_, std::convert::Infallible>(handler.handle(req, &peer).await)
        }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(timeout)
        .serve_connection(stream, service);
    let mut conn = std::pin::pin!(conn);
    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                debug!("connection closed: {}", e);
            }
        }
        _ = must_exit.changed() => {
            conn.as_mut().graceful_shutdown();
            let _ = conn.as_mut().await;
        }
    }
}

fn build_tls_acceptor(config: &Config) -> Result<TlsAcceptor> {
    let server = &config.server;
    let loaded_certs = certs(&mut BufReader::new(
        std::fs::File::open(&server.certificate)
            .with_context(|| format!("opening certificate {}", server.certificate))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()?;
    let loaded_key = private_key(&mut BufReader::new(
        std::fs::File::open(&server.key).with_context(|| format!("opening key {}", server.key))?,
    ))?
    .context("no private key found")?;

    let versions: &[&'static rustls::SupportedProtocolVersion] = match server.protocol.as_str() {
        "TLSv1.3" => &[&rustls::version::TLS13],
        _ => &[&rustls::version::TLS12, &rustls::version::TLS13],
    };

    let provider = filtered_provider(&server.ciphersuite)?;
    let builder = rustls::ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(versions)
        .context("selecting TLS protocol versions")?;

    let tls_config = if server.certificate_authority.is_empty() {
        builder
            .with_no_client_auth()
            .with_single_cert(loaded_certs, loaded_key)?
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for cert in certs(&mut BufReader::new(
            std::fs::File::open(&server.certificate_authority).with_context(|| {
                format!("opening CA bundle {}", server.certificate_authority)
            })?,
        )) {
            roots.add(cert?)?;
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("building client certificate verifier")?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(loaded_certs, loaded_key)?
    };
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

// restrict the cipher suites by name substring when configured.
fn filtered_provider(ciphersuite: &str) -> Result<rustls::crypto::CryptoProvider> {
    let mut provider = rustls::crypto::ring::default_provider();
    if ciphersuite.is_empty() {
        return Ok(provider);
    }
    let wanted: Vec<String> = ciphersuite
        .split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    provider.cipher_suites.retain(|suite| {
        let name = format!("{:?}", suite.suite()).to_ascii_uppercase();
        wanted.iter().any(|w| name.contains(w))
    });
    if provider.cipher_suites.is_empty() {
        bail!("ciphersuite {:?} matches no supported cipher suite", ciphersuite);
    }
    Ok(provider)
}

/// Run a server with the given configuration until shutdown.
pub async fn run(config: Config) -> Result<()> {
    let server = Server::new(Arc::new(config))?;
    server.run().await.map_err(|e| {
        error!("server error: {:#}", e);
        e
    })
}
