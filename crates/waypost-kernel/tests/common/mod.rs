//! Shared harness for the integration tests.
//!
//! Starts a real node on ephemeral loopback ports with a self-signed TLS
//! certificate, and provides a minimal wire client that trusts it.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use waypost_kernel::tls::tls_acceptor_from_der;
use waypost_kernel::Node;
use waypost_types::config::{ListenerConfig, NodeConfig, ServerRole};
use waypost_types::identity::{random_challenge, NodeKeys};
use waypost_wire::frame::DEFAULT_MAX_FRAME_SIZE;
use waypost_wire::message::{
    read_message, write_message, ResponseBody, Status, WireError, WireMessage, WireMessageKind,
    WireRequest, WireResponse, SUPPORTED_VERSIONS,
};

/// How long a test waits for any single frame.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub struct TestNode {
    pub node: Node,
    connector: TlsConnector,
}

impl TestNode {
    /// Start a node with a primary listener and one listener for all client roles.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Like [`TestNode::start`], letting the test adjust the config first.
    pub async fn start_with(adjust: impl FnOnce(&mut NodeConfig)) -> Self {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert: CertificateDer<'static> = generated.cert.der().clone();
        let key = PrivatePkcs8KeyDer::from(generated.key_pair.serialize_der());
        let acceptor = tls_acceptor_from_der(vec![cert.clone()], key.into()).unwrap();

        let mut config = NodeConfig {
            listen_host: "127.0.0.1".into(),
            listeners: vec![
                ListenerConfig {
                    port: 0,
                    roles: vec![ServerRole::Primary],
                },
                ListenerConfig {
                    port: 0,
                    roles: vec![
                        ServerRole::ClientNonCustomer,
                        ServerRole::ClientCustomer,
                        ServerRole::ClientAppService,
                    ],
                },
            ],
            ..Default::default()
        };
        config.limits.incoming_call_timeout_secs = 2;
        adjust(&mut config);

        let node = Node::start(config, NodeKeys::generate(), Some(acceptor))
            .await
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(cert).unwrap();
        let client_config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            node,
            connector: TlsConnector::from(Arc::new(client_config)),
        }
    }

    /// Plain connection to the primary port.
    pub async fn primary(&self) -> Client<TcpStream> {
        let addr = self.node.local_addr(ServerRole::Primary).unwrap();
        Client::new(TcpStream::connect(addr).await.unwrap())
    }

    /// TLS connection to the listener serving `role`.
    pub async fn client(&self, role: ServerRole) -> Client<TlsStream<TcpStream>> {
        let addr = self.node.local_addr(role).unwrap();
        let tcp = TcpStream::connect(addr).await.unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        Client::new(self.connector.connect(name, tcp).await.unwrap())
    }

    /// A customer connection whose identity is hosted and checked in.
    pub async fn checked_in(&self, keys: &NodeKeys) -> Client<TlsStream<TcpStream>> {
        let mut client = self.client(ServerRole::ClientCustomer).await;
        let challenge = client.start_conversation(keys).await;
        let signature = keys.sign(&challenge);

        let verified = client
            .request(WireRequest::VerifyIdentity {
                challenge: challenge.clone(),
                signature: signature.clone(),
            })
            .await;
        assert_eq!(verified.status, Status::Ok, "{verified:?}");

        let hosted = client
            .request(WireRequest::RegisterHosting {
                identity_type: "Person".into(),
            })
            .await;
        assert_eq!(hosted.status, Status::Ok, "{hosted:?}");

        let checked_in = client
            .request(WireRequest::CheckIn {
                challenge,
                signature,
            })
            .await;
        assert_eq!(checked_in.status, Status::Ok, "{checked_in:?}");
        client
    }

    /// A non-customer connection whose identity is verified.
    pub async fn verified(&self, keys: &NodeKeys) -> Client<TlsStream<TcpStream>> {
        let mut client = self.client(ServerRole::ClientNonCustomer).await;
        let challenge = client.start_conversation(keys).await;
        let response = client
            .request(WireRequest::VerifyIdentity {
                signature: keys.sign(&challenge),
                challenge,
            })
            .await;
        assert_eq!(response.status, Status::Ok, "{response:?}");
        client
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.node.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct Client<S> {
    stream: S,
    next_id: u32,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream, next_id: 0 }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Send a request and return its id.
    pub async fn send(&mut self, request: WireRequest) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        write_message(
            &mut self.stream,
            &WireMessage::request(id, request),
            DEFAULT_MAX_FRAME_SIZE,
        )
        .await
        .unwrap();
        id
    }

    /// Answer a node-originated request.
    pub async fn answer(&mut self, id: u32, response: WireResponse) {
        write_message(
            &mut self.stream,
            &WireMessage::response(id, response),
            DEFAULT_MAX_FRAME_SIZE,
        )
        .await
        .unwrap();
    }

    /// Read the next message, failing the test after [`RECV_TIMEOUT`].
    pub async fn recv(&mut self) -> WireMessage {
        self.try_recv().await.unwrap()
    }

    /// Read the next message, or the error that ended the stream.
    pub async fn try_recv(&mut self) -> Result<WireMessage, WireError> {
        tokio::time::timeout(
            RECV_TIMEOUT,
            read_message(&mut self.stream, DEFAULT_MAX_FRAME_SIZE),
        )
        .await
        .expect("timed out waiting for a frame")
    }

    /// Read the next message, which must be the response to `id`.
    pub async fn response_to(&mut self, id: u32) -> WireResponse {
        let msg = self.recv().await;
        assert_eq!(msg.id, id, "unexpected message {msg:?}");
        match msg.kind {
            WireMessageKind::Response(response) => response,
            other => panic!("Expected response, got {other:?}"),
        }
    }

    /// Read the next message, which must be a node-originated request.
    pub async fn node_request(&mut self) -> (u32, WireRequest) {
        let msg = self.recv().await;
        match msg.kind {
            WireMessageKind::Request(request) => (msg.id, request),
            other => panic!("Expected request, got {other:?}"),
        }
    }

    /// Send a request and wait for its response.
    pub async fn request(&mut self, request: WireRequest) -> WireResponse {
        let id = self.send(request).await;
        self.response_to(id).await
    }

    /// Start a conversation as `keys` and return the node's challenge.
    pub async fn start_conversation(&mut self, keys: &NodeKeys) -> Vec<u8> {
        let response = self
            .request(WireRequest::StartConversation {
                public_key: keys.public_key().to_vec(),
                client_challenge: random_challenge().to_vec(),
                supported_versions: SUPPORTED_VERSIONS.to_vec(),
            })
            .await;
        match response.body {
            Some(ResponseBody::StartConversation { challenge, .. }) => challenge,
            _ => panic!("Expected start conversation body, got {response:?}"),
        }
    }
}
