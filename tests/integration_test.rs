use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, string::Ia5String,
};
use rustls::{
    RootCertStore, ServerConfig,
    crypto::aws_lc_rs,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::WebPkiClientVerifier,
};
use spiffe::SpiffeId;
use spiffe_mesh::{
    CaBundleManager, CertManager, InMemorySecureConfig, SecurableConfig, TaskQueue, TrustBundle,
    WatchClient, X509CertFetcher, X509Context, X509ContextStream, X509Identity,
    error::{BoxError, WatchError},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::server::TlsStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use x509_parser::prelude::GeneralName;

const WORKLOAD_ID: &str = "spiffe://example.org/testservice";
const BROKER_NAME: &str = "nats.internal";

struct Authority {
    issuer: Issuer<'static, KeyPair>,
    cert: rcgen::Certificate,
}

impl Authority {
    fn new(common_name: &str) -> Self {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self {
            issuer: Issuer::new(params, key),
            cert,
        }
    }

    fn issue(&self, san: SanType) -> (CertificateDer<'static>, PrivatePkcs8KeyDer<'static>) {
        let mut params = CertificateParams::default();
        params.subject_alt_names = vec![san];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.issuer).unwrap();
        (
            cert.der().clone(),
            PrivatePkcs8KeyDer::from(key.serialize_der()),
        )
    }
}

fn workload_context(authority: &Authority) -> X509Context {
    let id = SpiffeId::try_from(WORKLOAD_ID).unwrap();
    let (cert, key) = authority.issue(SanType::URI(Ia5String::try_from(WORKLOAD_ID).unwrap()));
    let bundle = TrustBundle::new(id.trust_domain().clone(), vec![authority.cert.der().clone()]);
    X509Context::new(vec![X509Identity::new(id, vec![cert], &key)], [bundle])
}

/// Yields the given contexts, then stays open.
struct StubAgent(Mutex<Vec<X509Context>>);

impl WatchClient for StubAgent {
    async fn watch_x509_contexts(&self) -> Result<X509ContextStream, WatchError> {
        let updates: Vec<Result<X509Context, WatchError>> =
            self.0.lock().unwrap().drain(..).map(Ok).collect();
        Ok(Box::pin(
            tokio_stream::iter(updates).chain(tokio_stream::pending()),
        ))
    }

    fn close(&self) -> Result<(), WatchError> {
        Ok(())
    }
}

fn extract_spiffe_id(stream: &TlsStream<TcpStream>) -> Option<SpiffeId> {
    let (_, state) = stream.get_ref();
    let leaf = state.peer_certificates()?.first()?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf).ok()?;
    let san = cert.subject_alternative_name().ok()??;
    let uri = san.value.general_names.iter().find_map(|gn| match gn {
        GeneralName::URI(uri) => Some(*uri),
        _ => None,
    })?;
    SpiffeId::try_from(uri).ok()
}

struct Request {
    data: String,
    svid: SpiffeId,
}

/// Broker side of the handshake: presents a certificate for [`BROKER_NAME`]
/// and requires a client certificate issued by `workload_authority`.
fn broker_config(
    server_authority: &Authority,
    workload_authority: &Authority,
) -> Result<Arc<ServerConfig>, Box<dyn std::error::Error + Send + Sync>> {
    let provider = Arc::new(aws_lc_rs::default_provider());
    let mut client_roots = RootCertStore::empty();
    client_roots.add(workload_authority.cert.der().clone())?;
    let client_verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(client_roots), provider.clone())
            .build()?;
    let (cert, key) =
        server_authority.issue(SanType::DnsName(Ia5String::try_from(BROKER_NAME).unwrap()));
    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(vec![cert], PrivateKeyDer::Pkcs8(key))?;
    Ok(Arc::new(config))
}

async fn oneshot_server(
    listener: TcpListener,
    server_authority: &Authority,
    workload_authority: &Authority,
) -> Result<Request, Box<dyn std::error::Error + Send + Sync>> {
    let acceptor =
        tokio_rustls::TlsAcceptor::from(broker_config(server_authority, workload_authority)?);

    let (stream, _) = listener.accept().await?;
    let mut stream = acceptor.accept(stream).await?;
    let svid = extract_spiffe_id(&stream).ok_or("client presented no SPIFFE ID")?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    stream.write_all(b"PONG").await?;
    stream.shutdown().await?;
    Ok(Request {
        data: String::from_utf8_lossy(&buf).to_string(),
        svid,
    })
}

async fn client(
    port: u16,
    config: &dyn SecurableConfig,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config.create_tls_config()?));
    // The broker is verified against the configured name, not the SNI name.
    let tstream = connector
        .connect("localhost".try_into()?, stream)
        .await?;
    let (mut rx, mut tx) = tokio::io::split(tstream);
    tx.write_all(b"PING").await?;
    tx.shutdown().await?;
    let mut buf = Vec::new();
    rx.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

/// Runs a [`CertManager`] feeding a [`CaBundleManager`] and returns the bundle
/// manager once the first identity has been applied.
async fn started_bundle_manager(
    dir: &tempfile::TempDir,
    context: X509Context,
) -> Arc<CaBundleManager> {
    let queue = TaskQueue::new(|_, _| async { Ok::<(), BoxError>(()) });
    let bundles = Arc::new(CaBundleManager::with_bundle_path(
        queue,
        dir.path().join("bundle.pem"),
    ));
    let fetcher = X509CertFetcher::new(StubAgent(Mutex::new(vec![context])));
    let manager = CertManager::new(bundles.clone(), Arc::new(fetcher), Duration::from_secs(3));
    manager.run(CancellationToken::new()).await.unwrap();
    bundles
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let workload_authority = Authority::new("workload root");
    let broker_authority = Authority::new("broker root");
    let ca_file = dir.path().join("broker-ca.pem");
    std::fs::write(&ca_file, broker_authority.cert.pem()).unwrap();

    let context = workload_context(&workload_authority);
    let bundles = started_bundle_manager(&dir, context.clone()).await;
    assert_eq!(
        std::fs::read(bundles.bundle_path()).unwrap(),
        context.bundle_for_default().unwrap().marshal().unwrap()
    );

    let config = InMemorySecureConfig::new(BROKER_NAME, &ca_file, bundles.new_certificate_getter());
    config.validate().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (req, res) = tokio::join!(
        oneshot_server(listener, &broker_authority, &workload_authority),
        client(port, &config)
    );
    let req = req.unwrap();
    assert_eq!(req.data, "PING");
    assert_eq!(req.svid, SpiffeId::try_from(WORKLOAD_ID).unwrap());
    assert_eq!(res.unwrap(), "PONG");
}

#[tokio::test(flavor = "multi_thread")]
async fn untrusted_broker_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let workload_authority = Authority::new("workload root");
    let trusted = Authority::new("broker root");
    let impostor = Authority::new("impostor root");
    let ca_file = dir.path().join("broker-ca.pem");
    std::fs::write(&ca_file, trusted.cert.pem()).unwrap();

    let bundles = started_bundle_manager(&dir, workload_context(&workload_authority)).await;
    let config = InMemorySecureConfig::new(BROKER_NAME, &ca_file, bundles.new_certificate_getter());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (req, res) = tokio::join!(
        oneshot_server(listener, &impostor, &workload_authority),
        client(port, &config)
    );
    assert!(res.is_err());
    assert!(req.is_err());
}

#[cfg(feature = "message-bus")]
mod message_bus {
    use std::collections::HashMap;

    use spiffe_mesh::{BusOption, SecureMessageBus, error::BusError};
    use tokio::io::{AsyncBufReadExt, BufReader};

    use super::*;

    /// Speaks just enough of the NATS protocol over TLS to accept a client,
    /// answer pings and echo published messages back to matching subscriptions.
    async fn fake_broker(
        listener: TcpListener,
        config: Arc<ServerConfig>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut stream, _) = listener.accept().await?;
        stream
            .write_all(
                b"INFO {\"server_id\":\"fake\",\"tls_required\":true,\"headers\":true,\"max_payload\":1048576}\r\n",
            )
            .await?;
        let stream = tokio_rustls::TlsAcceptor::from(config)
            .accept(stream)
            .await?;
        let (rx, mut tx) = tokio::io::split(stream);
        let mut rx = BufReader::new(rx);
        let mut subscriptions: HashMap<String, String> = HashMap::new();
        let mut line = String::new();
        loop {
            line.clear();
            if rx.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                ["PING"] => tx.write_all(b"PONG\r\n").await?,
                ["SUB", subject, .., sid] => {
                    subscriptions.insert((*subject).to_owned(), (*sid).to_owned());
                }
                ["PUB", subject, .., len] => {
                    let len: usize = len.parse()?;
                    let mut payload = vec![0; len + 2];
                    rx.read_exact(&mut payload).await?;
                    payload.truncate(len);
                    if let Some(sid) = subscriptions.get(*subject) {
                        tx.write_all(format!("MSG {subject} {sid} {len}\r\n").as_bytes())
                            .await?;
                        tx.write_all(&payload).await?;
                        tx.write_all(b"\r\n").await?;
                    }
                }
                _ => {}
            }
            tx.flush().await?;
        }
    }

    /// A bus presenting an SVID from `workload_authority` and trusting `broker_root`.
    async fn bus_for(
        dir: &tempfile::TempDir,
        broker_root: &Authority,
        workload_authority: &Authority,
    ) -> SecureMessageBus {
        let ca_file = dir.path().join("broker-ca.pem");
        std::fs::write(&ca_file, broker_root.cert.pem()).unwrap();
        let bundles = started_bundle_manager(dir, workload_context(workload_authority)).await;
        let config =
            InMemorySecureConfig::new(BROKER_NAME, &ca_file, bundles.new_certificate_getter());
        SecureMessageBus::new(&config).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_rejects_untrusted_broker() {
        let dir = tempfile::tempdir().unwrap();
        let trusted = Authority::new("broker root");
        let impostor = Authority::new("impostor root");
        let workload_authority = Authority::new("workload root");
        let bus = bus_for(&dir, &trusted, &workload_authority).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(fake_broker(
            listener,
            broker_config(&impostor, &workload_authority).unwrap(),
        ));

        let result = bus
            .connect(
                &format!("nats://127.0.0.1:{port}"),
                [BusOption::ConnectionTimeout(Duration::from_secs(2))],
            )
            .await;
        assert!(matches!(result, Err(BusError::Connect(_))));
        assert!(!bus.is_connected());
        broker.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_publish_and_subscribe_through_trusted_broker() {
        let dir = tempfile::tempdir().unwrap();
        let broker_root = Authority::new("broker root");
        let workload_authority = Authority::new("workload root");
        let bus = bus_for(&dir, &broker_root, &workload_authority).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(fake_broker(
            listener,
            broker_config(&broker_root, &workload_authority).unwrap(),
        ));

        bus.connect(
            &format!("nats://127.0.0.1:{port}"),
            [BusOption::Name("spiffe-mesh-test".into())],
        )
        .await
        .unwrap();
        assert!(bus.is_connected());

        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        bus.subscribe("mesh.events", tx).await.unwrap();
        let payload: &[u8] = b"\x00binary\r\npayload\xff";
        bus.publish("mesh.events", payload).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received[..], payload);

        bus.close().await.unwrap();
        assert!(!bus.is_connected());
        broker.abort();
    }
}

/// Needs a TLS-enabled NATS server requiring client certificates:
/// `NATS_URL`, `NATS_SERVER_NAME`, `NATS_CA_FILE`, `NATS_CERT_FILE`, `NATS_KEY_FILE`.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a live NATS server"]
async fn publish_subscribe_round_trip() {
    use spiffe_mesh::{BusOption, OnDiskSecureConfig, SecureMessageBus};

    let env = |name: &str| std::env::var(name).unwrap();
    let config = OnDiskSecureConfig::new(
        env("NATS_SERVER_NAME"),
        env("NATS_CERT_FILE"),
        env("NATS_KEY_FILE"),
        env("NATS_CA_FILE"),
    );
    let bus = SecureMessageBus::new(&config).unwrap();
    bus.connect(
        &env("NATS_URL"),
        [BusOption::Name("spiffe-mesh-test".into())],
    )
    .await
    .unwrap();
    assert!(bus.is_connected());

    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    bus.subscribe("spiffe-mesh.test", tx.clone()).await.unwrap();
    assert!(bus.subscribe("spiffe-mesh.test", tx).await.is_err());
    bus.publish("spiffe-mesh.test", "hello").await.unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&payload[..], b"hello");
    bus.close().await.unwrap();
    assert!(!bus.is_connected());
}
