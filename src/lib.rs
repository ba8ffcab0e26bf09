//! Gantry is a multi-tenant HTTP/HTTPS daemon whose request handling is
//! externalized into **hook modules**: dynamically loaded content
//! generators, organized by site and category, discovered under a
//! directory and hot-reloaded when it changes.
//!
//! Each request resolves to a [`host::Site`] via its `Host` header, then to
//! a chain of [`hooks`] functions via the name
//! `<canonical-host>$<path>`. The chain's [`Descriptor`] is rendered into
//! the response, and eligible responses are kept in a size-bounded LRU
//! [`cache`] keyed by `<canonical-host>$<request-target>`.
//!
//! ```no_run
//! use gantry::host::{ServerOptions, Site};
//! use gantry::Server;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ServerOptions::new("hooks")
//!     .add_site("localhost", Site::new(vec!["localhost".into()], 'A', "dev")?);
//! Server::new(options)?.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod cache;
pub mod dispatch;
pub mod encryption;
pub mod hooks;
pub mod host;
pub mod lists;
pub mod loader;
pub mod prelude;
pub mod reply;
pub mod utility;

use crate::cache::ResponseCache;
use crate::encryption::Encryption;
use crate::hooks::Registry;
use crate::host::ConfigError;
use crate::loader::Loader;
use prelude::*;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

// When users only import crate::* and not crate::prelude::*
pub use host::{PlaintextPolicy, ServerOptions, Site, TlsMaterial};
pub use loader::{HookExport, ModuleManifest};
pub use reply::{Descriptor, Payload};

pub const SERVER_NAME: &str = "Gantry";
pub const SERVER_HEADER: &[u8] = b"server: Gantry\r\n";

/// One running daemon: configuration, hook registry, module loader,
/// response cache, and the process-wide upload accounting.
pub struct Server {
    options: ServerOptions,
    registry: Arc<Registry>,
    loader: Arc<Loader>,
    cache: tokio::sync::Mutex<ResponseCache>,
    pending_uploads: AtomicUsize,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Validates `options` and assembles the server.
    ///
    /// Unusable TLS material is not fatal: a diagnostic is logged and the
    /// HTTPS endpoints stay unbound, while plaintext endpoints still start.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`]; the server must not start.
    pub fn new(options: ServerOptions) -> Result<Arc<Self>, ConfigError> {
        options.validate()?;
        let registry = Arc::new(Registry::new(options.safe_hooks));
        let loader = Arc::new(Loader::new(
            options.basedir.clone(),
            options.recursive_watch,
            Arc::clone(&registry),
        ));
        let tls = match &options.secure {
            Some(material) => match encryption::server_config(material) {
                Ok(config) => Some(TlsAcceptor::from(Arc::new(config))),
                Err(err) => {
                    error!("TLS material unusable, HTTPS endpoints disabled: {err}");
                    None
                }
            },
            None => None,
        };
        let cache = tokio::sync::Mutex::new(ResponseCache::new(options.cache_size));
        Ok(Arc::new(Self {
            options,
            registry,
            loader,
            cache,
            pending_uploads: AtomicUsize::new(0),
            tls,
        }))
    }

    #[inline]
    #[must_use]
    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// The hook registry; also the place to register built-in hooks
    /// without going through a module file.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[inline]
    #[must_use]
    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    #[inline]
    #[must_use]
    pub fn cache(&self) -> &tokio::sync::Mutex<ResponseCache> {
        &self.cache
    }

    /// Bytes of request bodies currently buffered, process-wide.
    #[inline]
    #[must_use]
    pub fn pending_uploads(&self) -> &AtomicUsize {
        &self.pending_uploads
    }

    /// Whether HTTPS endpoints are live; governs the plaintext policy.
    #[inline]
    #[must_use]
    pub fn tls_active(&self) -> bool {
        self.tls.is_some()
    }

    /// Loads the hook modules, starts the watcher, binds every endpoint,
    /// and spawns the accept loops.
    ///
    /// Returns the bound addresses, useful with port `0`.
    ///
    /// # Errors
    ///
    /// Returns the first bind error.
    pub async fn launch(self: &Arc<Self>) -> io::Result<Vec<SocketAddr>> {
        self.loader.load_all();
        if let Err(err) = self.loader.watch() {
            warn!("module watcher unavailable, hot reload disabled: {err}");
        }

        let mut bound = Vec::with_capacity(
            self.options.addrs.len() * (self.options.ports.len() + self.options.secure_ports.len()),
        );
        for addr in &self.options.addrs {
            for port in &self.options.ports {
                bound.push(self.bind(SocketAddr::new(*addr, *port), false).await?);
            }
            if self.tls.is_some() {
                for port in &self.options.secure_ports {
                    bound.push(self.bind(SocketAddr::new(*addr, *port), true).await?);
                }
            }
        }
        Ok(bound)
    }

    /// [`launch`](Self::launch), then serve until the process ends.
    ///
    /// # Errors
    ///
    /// Returns the first bind error.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        self.launch().await?;
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn bind(self: &Arc<Self>, addr: SocketAddr, secure: bool) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(
            "listening on {local} ({})",
            if secure { "https" } else { "http" }
        );
        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.accept_on(listener, secure).await;
        });
        Ok(local)
    }

    async fn accept_on(self: Arc<Self>, listener: TcpListener, secure: bool) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(server, socket, peer, secure).await {
                            debug!("connection from {peer} ended: {err}");
                        }
                    });
                }
                Err(err) => {
                    error!("failed to accept(): {err}");
                }
            }
        }
    }
}

impl Debug for Server {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("options", &self.options)
            .field("registry", &self.registry)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Serves one connection: TLS handshake when on a secure port, then
/// requests until the peer leaves or the dispatcher closes the stream.
pub(crate) async fn handle_connection(
    server: Arc<Server>,
    socket: TcpStream,
    peer: SocketAddr,
    secure: bool,
) -> io::Result<()> {
    let acceptor = if secure { server.tls.as_ref() } else { None };
    let encryption = Encryption::new_tcp(socket, acceptor).await?;
    let mut connection = application::HttpConnection::new(encryption, peer);

    loop {
        match connection.accept().await {
            Ok((request, pipe)) => {
                match dispatch::handle(&server, request, pipe, secure).await {
                    dispatch::Flow::Continue => {}
                    dispatch::Flow::Close => break,
                }
            }
            Err(application::Error::Done) => break,
            Err(err) => {
                debug!("request from {peer} failed to parse: {err}");
                break;
            }
        }
    }
    Ok(())
}
