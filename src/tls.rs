use crate::channel::engine::{EngineConfig, TlsEngine};
use crate::error::{Error, Result};
use log::warn;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

/// Protocol-version and cipher-suite restrictions.
///
/// Names follow rustls: "TLSv1.2"/"TLSv1.3" for versions, suite identifiers
/// like TLS13_AES_128_GCM_SHA256 or TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 for
/// suites. Empty lists keep the provider defaults; unknown names are skipped
/// with a warning, and a selection that ends up empty is a startup error.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub protocols: Vec<String>,
    pub cipher_suites: Vec<String>,
}

#[derive(Debug)]
enum ContextKind {
    Server(Arc<ServerConfig>),
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
}

/// Certificate material and negotiated-parameter policy for one role.
///
/// Built once at startup from PEM files; every accepted or initiated
/// connection derives its engine from this context, and session invalidation
/// rebuilds engines from it.
#[derive(Debug)]
pub struct TlsContext {
    kind: ContextKind,
}

impl TlsContext {
    /// Server context from a PEM certificate chain and private key. Client
    /// authentication is required when trust anchors are supplied.
    pub fn server(
        cert_chain: &Path,
        key: &Path,
        client_auth_roots: Option<&Path>,
        settings: &TlsSettings,
    ) -> Result<Self> {
        let provider = Arc::new(build_provider(settings)?);
        let versions = select_versions(settings)?;
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&versions)
            .map_err(Error::Tls)?;
        let builder = match client_auth_roots {
            Some(path) => {
                let roots = Arc::new(load_roots(path)?);
                let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider)
                    .build()
                    .map_err(|e| Error::Certificate(e.to_string()))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };
        let config = builder
            .with_single_cert(load_certs(cert_chain)?, load_key(key)?)
            .map_err(Error::Tls)?;
        Ok(TlsContext {
            kind: ContextKind::Server(Arc::new(config)),
        })
    }

    /// Client context trusting the given anchors. An identity is required
    /// only when the server demands mutual authentication. server_name is
    /// the SNI/verification name, a DNS name or IP address.
    pub fn client(
        trust_roots: &Path,
        identity: Option<(&Path, &Path)>,
        server_name: &str,
        settings: &TlsSettings,
    ) -> Result<Self> {
        let provider = Arc::new(build_provider(settings)?);
        let versions = select_versions(settings)?;
        let builder = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&versions)
            .map_err(Error::Tls)?
            .with_root_certificates(load_roots(trust_roots)?);
        let config = match identity {
            Some((cert_chain, key)) => builder
                .with_client_auth_cert(load_certs(cert_chain)?, load_key(key)?)
                .map_err(Error::Tls)?,
            None => builder.with_no_client_auth(),
        };
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::InvalidServerName(server_name.to_string()))?;
        Ok(TlsContext {
            kind: ContextKind::Client {
                config: Arc::new(config),
                server_name,
            },
        })
    }

    pub fn is_server(&self) -> bool {
        matches!(self.kind, ContextKind::Server(_))
    }

    pub(crate) fn engine(&self, defer_tasks: bool) -> Result<TlsEngine> {
        let config = match &self.kind {
            ContextKind::Server(config) => EngineConfig::Server {
                config: config.clone(),
            },
            ContextKind::Client {
                config,
                server_name,
            } => EngineConfig::Client {
                config: config.clone(),
                server_name: server_name.clone(),
            },
        };
        TlsEngine::new(config, defer_tasks)
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| Error::Certificate(format!("cannot open {}: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::Certificate(format!("bad PEM in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Certificate(format!("bad PEM in {}: {}", path.display(), e)))?
        .ok_or_else(|| Error::Certificate(format!("no private key found in {}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| Error::Certificate(format!("bad trust anchor in {}: {}", path.display(), e)))?;
    }
    Ok(roots)
}

fn select_versions(settings: &TlsSettings) -> Result<Vec<&'static SupportedProtocolVersion>> {
    if settings.protocols.is_empty() {
        return Ok(rustls::ALL_VERSIONS.to_vec());
    }
    let mut versions = Vec::new();
    for name in &settings.protocols {
        match name.as_str() {
            "TLSv1.2" | "TLSv1_2" => versions.push(&rustls::version::TLS12),
            "TLSv1.3" | "TLSv1_3" => versions.push(&rustls::version::TLS13),
            other => warn!("unsupported protocol version {:?}, skipping", other),
        }
    }
    if versions.is_empty() {
        return Err(Error::Configuration(
            "none of the configured TLS protocol versions are supported".into(),
        ));
    }
    Ok(versions)
}

fn build_provider(settings: &TlsSettings) -> Result<CryptoProvider> {
    let base = ring::default_provider();
    if settings.cipher_suites.is_empty() {
        return Ok(base);
    }
    let selected: Vec<_> = base
        .cipher_suites
        .iter()
        .copied()
        .filter(|suite| {
            let name = format!("{:?}", suite.suite());
            settings
                .cipher_suites
                .iter()
                .any(|wanted| wanted.eq_ignore_ascii_case(&name))
        })
        .collect();
    if selected.is_empty() {
        return Err(Error::Configuration(
            "none of the configured cipher suites are supported".into(),
        ));
    }
    for wanted in &settings.cipher_suites {
        let known = base
            .cipher_suites
            .iter()
            .any(|s| format!("{:?}", s.suite()).eq_ignore_ascii_case(wanted));
        if !known {
            warn!("unsupported cipher suite {:?}, skipping", wanted);
        }
    }
    Ok(CryptoProvider {
        cipher_suites: selected,
        ..base
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::engine::{EngineStatus, HandshakeStatus};
    use bytes::BytesMut;
    use std::path::PathBuf;

    fn certs_dir() -> PathBuf {
        PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/certs"))
    }

    fn server_context() -> TlsContext {
        let dir = certs_dir();
        TlsContext::server(
            &dir.join("server.pem"),
            &dir.join("server.key"),
            None,
            &TlsSettings::default(),
        )
        .unwrap()
    }

    fn client_context() -> TlsContext {
        let dir = certs_dir();
        TlsContext::client(
            &dir.join("ca.pem"),
            None,
            "localhost",
            &TlsSettings::default(),
        )
        .unwrap()
    }

    struct Pair {
        client: TlsEngine,
        server: TlsEngine,
        client_in: BytesMut,
        server_in: BytesMut,
        client_plain: BytesMut,
        server_plain: BytesMut,
    }

    impl Pair {
        fn new(defer: bool) -> Self {
            Pair {
                client: client_context().engine(false).unwrap(),
                server: server_context().engine(defer).unwrap(),
                client_in: BytesMut::new(),
                server_in: BytesMut::new(),
                client_plain: BytesMut::new(),
                server_plain: BytesMut::new(),
            }
        }

        /// Shuttle records between both engines until neither side has
        /// anything left to say.
        fn pump(&mut self) -> (bool, bool) {
            let mut client_finished = false;
            let mut server_finished = false;
            let mut empty = BytesMut::new();
            for _ in 0..32 {
                let mut progress = false;

                let r = self.client.wrap(&mut empty, &mut self.server_in).unwrap();
                progress |= !self.server_in.is_empty();
                if r.handshake == HandshakeStatus::Finished {
                    client_finished = true;
                    self.client.acknowledge_finished();
                }

                if !self.server_in.is_empty() {
                    let r = self
                        .server
                        .unwrap(&mut self.server_in, &mut self.server_plain)
                        .unwrap();
                    if r.handshake == HandshakeStatus::NeedTask {
                        self.server.run_delegated_tasks();
                    }
                    if self.server.handshake_status() == HandshakeStatus::Finished {
                        server_finished = true;
                        self.server.acknowledge_finished();
                    }
                    progress = true;
                }

                let r = self.server.wrap(&mut empty, &mut self.client_in).unwrap();
                progress |= !self.client_in.is_empty();
                if r.handshake == HandshakeStatus::Finished {
                    server_finished = true;
                    self.server.acknowledge_finished();
                }

                if !self.client_in.is_empty() {
                    self.client
                        .unwrap(&mut self.client_in, &mut self.client_plain)
                        .unwrap();
                    if self.client.handshake_status() == HandshakeStatus::Finished {
                        client_finished = true;
                        self.client.acknowledge_finished();
                    }
                    progress = true;
                }

                if !progress {
                    break;
                }
            }
            (client_finished, server_finished)
        }
    }

    #[test]
    fn test_engines_complete_handshake_in_memory() {
        let mut pair = Pair::new(false);
        let (client_finished, server_finished) = pair.pump();
        assert!(client_finished, "client never observed FINISHED");
        assert!(server_finished, "server never observed FINISHED");
        assert_eq!(
            pair.client.handshake_status(),
            HandshakeStatus::NotHandshaking
        );
        assert_eq!(
            pair.server.handshake_status(),
            HandshakeStatus::NotHandshaking
        );
    }

    #[test]
    fn test_application_data_roundtrip() {
        let mut pair = Pair::new(false);
        pair.pump();

        let mut plaintext = BytesMut::from(&b"attack at dawn"[..]);
        let mut wire = BytesMut::new();
        let r = pair.client.wrap(&mut plaintext, &mut wire).unwrap();
        assert_eq!(r.status, EngineStatus::Ok);
        assert!(plaintext.is_empty());

        let mut received = BytesMut::new();
        let r = pair.server.unwrap(&mut wire, &mut received).unwrap();
        assert_eq!(r.status, EngineStatus::Ok);
        assert_eq!(&received[..], b"attack at dawn");
    }

    #[test]
    fn test_deferred_mode_stages_task() {
        let mut pair = Pair::new(true);
        // first client flight
        let mut empty = BytesMut::new();
        pair.client.wrap(&mut empty, &mut pair.server_in).unwrap();
        assert!(!pair.server_in.is_empty());

        let mut plain = BytesMut::new();
        let r = pair
            .server
            .unwrap(&mut pair.server_in, &mut plain)
            .unwrap();
        assert_eq!(r.handshake, HandshakeStatus::NeedTask);
        assert_eq!(pair.server.handshake_status(), HandshakeStatus::NeedTask);

        pair.server.run_delegated_tasks();
        assert_eq!(pair.server.handshake_status(), HandshakeStatus::NeedWrap);
    }

    #[test]
    fn test_close_notify_reports_closed() {
        let mut pair = Pair::new(false);
        pair.pump();

        pair.client.close_outbound();
        let mut empty = BytesMut::new();
        let mut wire = BytesMut::new();
        let r = pair.client.wrap(&mut empty, &mut wire).unwrap();
        assert_eq!(r.status, EngineStatus::Closed);
        assert!(pair.client.is_outbound_done());

        let mut plain = BytesMut::new();
        let r = pair.server.unwrap(&mut wire, &mut plain).unwrap();
        assert_eq!(r.status, EngineStatus::Closed);
        assert!(pair.server.is_inbound_done());
        assert!(pair.server.close_inbound().is_ok());
    }

    #[test]
    fn test_session_reset_restarts_handshake() {
        let mut pair = Pair::new(false);
        pair.pump();
        assert_eq!(
            pair.client.handshake_status(),
            HandshakeStatus::NotHandshaking
        );

        pair.client.reset().unwrap();
        assert_eq!(pair.client.handshake_status(), HandshakeStatus::NeedWrap);
    }

    #[test]
    fn test_missing_cert_file_is_an_error() {
        let dir = certs_dir();
        let err = TlsContext::server(
            &dir.join("nope.pem"),
            &dir.join("server.key"),
            None,
            &TlsSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }

    #[test]
    fn test_unknown_cipher_suites_are_fatal_when_none_match() {
        let settings = TlsSettings {
            protocols: Vec::new(),
            cipher_suites: vec!["TLS_MAGIC_NULL_WITH_NULL".into()],
        };
        let err = build_provider(&settings).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_suite_filtering_keeps_named_suite() {
        let settings = TlsSettings {
            protocols: vec!["TLSv1.3".into()],
            cipher_suites: vec!["TLS13_AES_128_GCM_SHA256".into()],
        };
        let provider = build_provider(&settings).unwrap();
        assert_eq!(provider.cipher_suites.len(), 1);
        assert!(select_versions(&settings).unwrap().len() == 1);
    }

    #[test]
    fn test_invalid_server_name_rejected() {
        let dir = certs_dir();
        let err = TlsContext::client(
            &dir.join("ca.pem"),
            None,
            "bad name with spaces",
            &TlsSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidServerName(_)));
    }
}
