//! Sites and server configuration.
//!
//! A [`Site`] is a logical server identity: an ordered list of hostnames
//! (the first is canonical and prefixes the site's cache keys and hook
//! names) and a single category letter selecting which hook functions serve
//! it. [`ServerOptions`] collects everything a [`Server`](crate::Server)
//! needs; validation happens at construction and failures are fatal, the
//! server never starts half-configured.
//!
//! The sites map recognizes two sentinel keys: `"!"` matches a request
//! whose `Host` header is missing or empty, `"*"` any host not otherwise
//! matched.

use crate::hooks::CategoryMask;
use crate::prelude::*;
use std::net::IpAddr;

/// Matches an empty or missing `Host` header.
pub const EMPTY_HOST_KEY: &str = "!";
/// Matches any host without a dedicated entry.
pub const CATCH_ALL_KEY: &str = "*";

/// A configuration error; fatal at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No bind addresses were configured.
    NoBindAddresses,
    /// A site was configured without hostnames.
    NoHosts,
    /// A hostname is the empty string.
    EmptyHostname,
    /// The category is not a single letter `A`–`Z`.
    IllegalCategory(char),
    /// A TLS key passphrase was supplied; encrypted keys are not readable.
    EncryptedKeyUnsupported,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoBindAddresses => f.write_str("no bind addresses configured"),
            Self::NoHosts => f.write_str("site has no hostnames"),
            Self::EmptyHostname => f.write_str("site has an empty hostname"),
            Self::IllegalCategory(c) => write!(f, "illegal site category {c:?}"),
            Self::EncryptedKeyUnsupported => {
                f.write_str("TLS key passphrases are not supported; provide an unencrypted key")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A logical server identity bound to one or more hostnames.
#[derive(Debug, Clone)]
pub struct Site {
    hosts: Vec<String>,
    category: char,
    description: String,
}

impl Site {
    /// Creates a site.
    ///
    /// `category` accepts any ASCII letter and is canonicalized to
    /// uppercase.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoHosts`], [`ConfigError::EmptyHostname`], or
    /// [`ConfigError::IllegalCategory`].
    pub fn new(
        hosts: Vec<String>,
        category: char,
        description: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        if hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        if hosts.iter().any(String::is_empty) {
            return Err(ConfigError::EmptyHostname);
        }
        if !category.is_ascii_alphabetic() {
            return Err(ConfigError::IllegalCategory(category));
        }
        Ok(Self {
            hosts,
            category: category.to_ascii_uppercase(),
            description: description.into(),
        })
    }

    /// The canonical hostname: the first of the host list.
    #[inline]
    #[must_use]
    pub fn canonical(&self) -> &str {
        &self.hosts[0]
    }

    #[inline]
    #[must_use]
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    #[inline]
    #[must_use]
    pub fn category(&self) -> char {
        self.category
    }

    /// The single-bit category mask of this site.
    #[must_use]
    pub fn mask(&self) -> CategoryMask {
        CategoryMask::from_letter(self.category).expect("category validated at construction")
    }

    #[inline]
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Filesystem locations of the TLS material.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    /// PEM certificate chain.
    pub certificate: PathBuf,
    /// PEM private key, unencrypted.
    pub private_key: PathBuf,
    /// Optional PEM CA bundle enabling client-certificate validation.
    pub client_ca: Option<PathBuf>,
    /// Unsupported; rejected at validation.
    pub passphrase: Option<String>,
}

impl TlsMaterial {
    #[must_use]
    pub fn new(certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self {
            certificate: certificate.into(),
            private_key: private_key.into(),
            client_ca: None,
            passphrase: None,
        }
    }

    #[must_use]
    pub fn with_client_ca(mut self, ca: impl Into<PathBuf>) -> Self {
        self.client_ca = Some(ca.into());
        self
    }
}

/// What to do with plaintext connections while TLS is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaintextPolicy {
    /// Serve plaintext normally.
    #[default]
    None,
    /// Redirect to HTTPS if the client advertised
    /// `Upgrade-Insecure-Requests: 1`.
    Upgrade,
    /// Always redirect to HTTPS.
    Reject,
}

/// Everything a server needs, with sensible defaults filled in.
#[derive(Debug)]
#[must_use]
pub struct ServerOptions {
    /// Addresses to bind. Every address is bound on every port.
    pub addrs: Vec<IpAddr>,
    /// Plaintext HTTP ports.
    pub ports: Vec<u16>,
    /// HTTPS ports; only bound when TLS material is usable.
    pub secure_ports: Vec<u16>,
    /// Hostname (or sentinel key) to site.
    pub sites: HashMap<String, Arc<Site>>,
    /// TLS material; [`None`] disables HTTPS.
    pub secure: Option<TlsMaterial>,
    pub plaintext_policy: PlaintextPolicy,
    /// Response-cache budget in bytes.
    pub cache_size: usize,
    /// Largest accepted request body, per request.
    pub upload_max_unit_size: usize,
    /// Largest total of in-flight request bodies, process-wide.
    pub upload_max_storage: usize,
    /// Directory hook modules are discovered in.
    pub basedir: PathBuf,
    /// Watch the module directory recursively.
    pub recursive_watch: bool,
    /// Convert failing hook bodies into error responses instead of failing
    /// the chain.
    pub safe_hooks: bool,
}

impl ServerOptions {
    pub fn new(basedir: impl Into<PathBuf>) -> Self {
        Self {
            addrs: vec![IpAddr::from([0, 0, 0, 0])],
            ports: vec![80],
            secure_ports: vec![443],
            sites: HashMap::new(),
            secure: None,
            plaintext_policy: PlaintextPolicy::default(),
            cache_size: 4 * 1024 * 1024,
            upload_max_unit_size: 1024 * 1024,
            upload_max_storage: 16 * 1024 * 1024,
            basedir: basedir.into(),
            recursive_watch: false,
            safe_hooks: false,
        }
    }

    /// Registers `site` under `key`: a hostname, [`EMPTY_HOST_KEY`], or
    /// [`CATCH_ALL_KEY`].
    pub fn add_site(mut self, key: impl Into<String>, site: Site) -> Self {
        self.sites.insert(key.into(), Arc::new(site));
        self
    }

    pub fn with_tls(mut self, material: TlsMaterial) -> Self {
        self.secure = Some(material);
        self
    }

    pub fn plaintext_policy(mut self, policy: PlaintextPolicy) -> Self {
        self.plaintext_policy = policy;
        self
    }

    pub fn safe_hooks(mut self, enabled: bool) -> Self {
        self.safe_hooks = enabled;
        self
    }

    /// Checks the invariants a running server relies on.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`]; the caller must not start the server.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addrs.is_empty() {
            return Err(ConfigError::NoBindAddresses);
        }
        for site in self.sites.values() {
            // Re-checked so options assembled without Site::new still hold
            // the construction invariants.
            if site.hosts().is_empty() {
                return Err(ConfigError::NoHosts);
            }
            if site.hosts().iter().any(String::is_empty) {
                return Err(ConfigError::EmptyHostname);
            }
            if !site.category().is_ascii_uppercase() {
                return Err(ConfigError::IllegalCategory(site.category()));
            }
        }
        if let Some(material) = &self.secure {
            if material.passphrase.is_some() {
                return Err(ConfigError::EncryptedKeyUnsupported);
            }
        }
        Ok(())
    }

    /// Resolves the site serving `host`.
    ///
    /// The header value is looked up verbatim; a missing or empty host only
    /// matches [`EMPTY_HOST_KEY`], any other miss falls back to
    /// [`CATCH_ALL_KEY`].
    #[must_use]
    pub fn resolve_site(&self, host: Option<&str>) -> Option<&Arc<Site>> {
        match host {
            None | Some("") => self.sites.get(EMPTY_HOST_KEY),
            Some(host) => self
                .sites
                .get(host)
                .or_else(|| self.sites.get(CATCH_ALL_KEY)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(canonical: &str, category: char) -> Site {
        Site::new(vec![canonical.to_owned()], category, "").unwrap()
    }

    #[test]
    fn site_canonicalizes_category() {
        let site = Site::new(vec!["a.example".into()], 'q', "test").unwrap();
        assert_eq!(site.category(), 'Q');
        assert_eq!(site.mask(), CategoryMask::from_letter('Q').unwrap());
        assert_eq!(site.canonical(), "a.example");
    }

    #[test]
    fn site_rejects_bad_input() {
        assert_eq!(Site::new(vec![], 'A', "").unwrap_err(), ConfigError::NoHosts);
        assert_eq!(
            Site::new(vec!["".into()], 'A', "").unwrap_err(),
            ConfigError::EmptyHostname
        );
        assert_eq!(
            Site::new(vec!["a".into()], '7', "").unwrap_err(),
            ConfigError::IllegalCategory('7')
        );
    }

    #[test]
    fn validation_requires_bind_addresses() {
        let mut options = ServerOptions::new("/tmp/hooks");
        options.addrs.clear();
        assert_eq!(options.validate(), Err(ConfigError::NoBindAddresses));
    }

    #[test]
    fn validation_rejects_passphrases() {
        let mut material = TlsMaterial::new("cert.pem", "key.pem");
        material.passphrase = Some("secret".into());
        let options = ServerOptions::new("/tmp/hooks").with_tls(material);
        assert_eq!(options.validate(), Err(ConfigError::EncryptedKeyUnsupported));
    }

    #[test]
    fn resolution_fallback_chain() {
        let options = ServerOptions::new("/tmp/hooks")
            .add_site(EMPTY_HOST_KEY, site("bare.example", 'A'))
            .add_site(CATCH_ALL_KEY, site("any.example", 'B'));

        let empty = options.resolve_site(None).unwrap();
        assert_eq!(empty.canonical(), "bare.example");
        let empty = options.resolve_site(Some("")).unwrap();
        assert_eq!(empty.canonical(), "bare.example");

        let other = options.resolve_site(Some("x.example")).unwrap();
        assert_eq!(other.canonical(), "any.example");
    }

    #[test]
    fn resolution_without_catch_all() {
        let options = ServerOptions::new("/tmp/hooks").add_site("known.example", site("known.example", 'A'));
        assert!(options.resolve_site(Some("known.example")).is_some());
        assert!(options.resolve_site(Some("x.example")).is_none());
        assert!(options.resolve_site(None).is_none());
    }

    #[test]
    fn verbatim_match_wins_over_catch_all() {
        let options = ServerOptions::new("/tmp/hooks")
            .add_site("a.example", site("a.example", 'A'))
            .add_site(CATCH_ALL_KEY, site("fallback.example", 'B'));
        let resolved = options.resolve_site(Some("a.example")).unwrap();
        assert_eq!(resolved.canonical(), "a.example");
    }
}
