//! Integration tests for the conversation layer: framing violations, role
//! gating, version negotiation, hosting agreements and check-in.

mod common;

use common::TestNode;
use tokio::io::AsyncWriteExt;
use waypost_types::config::ServerRole;
use waypost_types::identity::{random_challenge, NodeKeys};
use waypost_wire::frame::{FRAME_MARKER, HEADER_LEN};
use waypost_wire::message::{
    ResponseBody, Status, WireMessage, WireRequest, UNKNOWN_MESSAGE_ID,
};

#[tokio::test]
async fn test_ping_echoes_payload_with_clock() {
    let test = TestNode::start().await;
    let mut client = test.primary().await;

    let response = client
        .request(WireRequest::Ping {
            payload: b"Hello".to_vec(),
        })
        .await;
    assert_eq!(response.status, Status::Ok);
    match response.body {
        Some(ResponseBody::Pong { payload, clock }) => {
            assert_eq!(payload, b"Hello");
            let skew = (chrono::Utc::now().timestamp_millis() - clock).abs();
            assert!(skew < 5 * 60 * 1000, "clock skew {skew} ms");
        }
        other => panic!("Expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_list_roles_reports_bound_ports() {
    let test = TestNode::start().await;
    let mut client = test.primary().await;

    let response = client.request(WireRequest::ListRoles).await;
    let Some(ResponseBody::ListRoles { roles }) = response.body else {
        panic!("Expected roles, got {response:?}");
    };
    assert_eq!(roles.len(), 4);
    for info in &roles {
        let addr = test.node.local_addr(info.role).unwrap();
        assert_eq!(info.port, addr.port());
        assert!(info.is_tcp);
        assert_eq!(info.is_tls, info.role != ServerRole::Primary);
    }
}

#[tokio::test]
async fn test_start_conversation_without_common_version_is_unsupported() {
    let test = TestNode::start().await;
    let mut client = test.client(ServerRole::ClientNonCustomer).await;
    let keys = NodeKeys::generate();

    let response = client
        .request(WireRequest::StartConversation {
            public_key: keys.public_key().to_vec(),
            client_challenge: random_challenge().to_vec(),
            supported_versions: vec![],
        })
        .await;
    assert_eq!(response.status, Status::ErrorUnsupported);

    // The conversation did not start, so a retry with a valid version set works.
    client.start_conversation(&keys).await;
}

#[tokio::test]
async fn test_oversize_ping_is_a_protocol_violation() {
    let test = TestNode::start().await;
    let mut client = test.primary().await;

    let ping = WireMessage::request(
        1,
        WireRequest::Ping {
            payload: vec![0u8; 1024 * 1024],
        },
    );
    let body = serde_json::to_vec(&ping).unwrap();
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.push(FRAME_MARKER);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    client.stream_mut().write_all(&frame).await.unwrap();

    let response = client.response_to(UNKNOWN_MESSAGE_ID).await;
    assert_eq!(response.status, Status::ErrorProtocolViolation);
    assert!(client.try_recv().await.is_err());
    assert_eq!(test.node.state().supervisor.health().protocol_violations, 1);
}

#[tokio::test]
async fn test_malformed_body_is_answered_with_its_id() {
    let test = TestNode::start().await;
    let mut client = test.primary().await;

    let body = br#"{"id":7,"type":"request","method":"teleport"}"#;
    let mut frame = vec![FRAME_MARKER];
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(body);
    client.stream_mut().write_all(&frame).await.unwrap();

    let response = client.response_to(7).await;
    assert_eq!(response.status, Status::ErrorProtocolViolation);
    assert!(client.try_recv().await.is_err());
}

#[tokio::test]
async fn test_role_and_status_gating() {
    let test = TestNode::start().await;

    let mut primary = test.primary().await;
    let response = primary
        .request(WireRequest::SearchPart {
            record_index: 0,
            record_count: 1,
        })
        .await;
    assert_eq!(response.status, Status::ErrorBadRole);

    let mut client = test.client(ServerRole::ClientNonCustomer).await;
    assert_eq!(
        client.request(WireRequest::ListRoles).await.status,
        Status::ErrorBadRole
    );
    let ping = client
        .request(WireRequest::Ping {
            payload: vec![1, 2, 3],
        })
        .await;
    assert_eq!(ping.status, Status::ErrorBadConversationStatus);
    let search = client
        .request(WireRequest::SearchPart {
            record_index: 0,
            record_count: 1,
        })
        .await;
    assert_eq!(search.status, Status::ErrorBadConversationStatus);

    client.start_conversation(&NodeKeys::generate()).await;
    let ping = client.request(WireRequest::Ping { payload: vec![] }).await;
    assert_eq!(ping.status, Status::Ok);
    // Started but not identified.
    let search = client
        .request(WireRequest::SearchPart {
            record_index: 0,
            record_count: 1,
        })
        .await;
    assert_eq!(search.status, Status::ErrorBadConversationStatus);

    let notification = client
        .request(WireRequest::ApplicationServiceReceiveMessageNotification { message: vec![] })
        .await;
    assert_eq!(notification.status, Status::ErrorUnsupported);
}

#[tokio::test]
async fn test_bad_signature_does_not_advance() {
    let test = TestNode::start().await;
    let keys = NodeKeys::generate();
    let mut client = test.client(ServerRole::ClientCustomer).await;
    let challenge = client.start_conversation(&keys).await;

    let forged = client
        .request(WireRequest::VerifyIdentity {
            signature: NodeKeys::generate().sign(&challenge),
            challenge: challenge.clone(),
        })
        .await;
    assert_eq!(forged.status, Status::ErrorInvalidSignature);

    let wrong_challenge = client
        .request(WireRequest::VerifyIdentity {
            signature: keys.sign(&[9u8; 32]),
            challenge: vec![9u8; 32],
        })
        .await;
    assert_eq!(wrong_challenge.status, Status::ErrorInvalidValue);
    assert_eq!(wrong_challenge.details, "challenge");

    let ok = client
        .request(WireRequest::VerifyIdentity {
            signature: keys.sign(&challenge),
            challenge,
        })
        .await;
    assert_eq!(ok.status, Status::Ok);
}

#[tokio::test]
async fn test_hosting_agreement_lifecycle() {
    let test = TestNode::start().await;
    let keys = NodeKeys::generate();
    let identity_id = keys.identity_id().as_bytes().to_vec();

    // Not hosted yet.
    let mut client = test.client(ServerRole::ClientCustomer).await;
    let challenge = client.start_conversation(&keys).await;
    let response = client
        .request(WireRequest::CheckIn {
            signature: keys.sign(&challenge),
            challenge,
        })
        .await;
    assert_eq!(response.status, Status::ErrorNotFound);
    drop(client);

    let mut customer = test.checked_in(&keys).await;
    let update = customer
        .request(WireRequest::UpdateProfile {
            name: Some("Ada".into()),
            location: None,
            extra_data: Some("x".repeat(257)),
            thumbnail: None,
        })
        .await;
    assert_eq!(update.status, Status::ErrorInvalidValue);
    assert_eq!(update.details, "extraData");

    let bad_redirect = customer
        .request(WireRequest::CancelHostingAgreement {
            redirect_identity_id: Some(vec![1u8; 31]),
        })
        .await;
    assert_eq!(bad_redirect.status, Status::ErrorInvalidValue);
    assert_eq!(bad_redirect.details, "redirectIdentityId");

    let target = vec![7u8; 32];
    let cancelled = customer
        .request(WireRequest::CancelHostingAgreement {
            redirect_identity_id: Some(target.clone()),
        })
        .await;
    assert_eq!(cancelled.status, Status::Ok);

    let mut observer = test.verified(&NodeKeys::generate()).await;
    let info = observer
        .request(WireRequest::GetIdentityInformation {
            identity_id: identity_id.clone(),
            include_thumbnail: false,
            include_application_services: false,
        })
        .await;
    match info.body {
        Some(ResponseBody::GetIdentityInformation {
            is_hosted,
            redirect_identity_id,
            ..
        }) => {
            assert!(!is_hosted);
            assert_eq!(redirect_identity_id, Some(target));
        }
        other => panic!("Expected identity information, got {other:?}"),
    }

    // Check-in fails until hosting is registered again.
    let mut again = test.client(ServerRole::ClientCustomer).await;
    let challenge = again.start_conversation(&keys).await;
    let response = again
        .request(WireRequest::CheckIn {
            signature: keys.sign(&challenge),
            challenge,
        })
        .await;
    assert_eq!(response.status, Status::ErrorNotFound);
}

#[tokio::test]
async fn test_application_services_are_an_idempotent_union() {
    let test = TestNode::start().await;
    let keys = NodeKeys::generate();
    let mut customer = test.checked_in(&keys).await;

    let names = ["a", "b", "c", "d", "a"].map(String::from).to_vec();
    let added = customer
        .request(WireRequest::ApplicationServiceAdd {
            service_names: names,
        })
        .await;
    assert_eq!(added.status, Status::Ok);

    let too_long = customer
        .request(WireRequest::ApplicationServiceAdd {
            service_names: vec!["s".repeat(33)],
        })
        .await;
    assert_eq!(too_long.details, "serviceNames");

    let missing = customer
        .request(WireRequest::ApplicationServiceRemove {
            service_name: "z".into(),
        })
        .await;
    assert_eq!(missing.status, Status::ErrorNotFound);

    let mut observer = test.verified(&NodeKeys::generate()).await;
    let info = observer
        .request(WireRequest::GetIdentityInformation {
            identity_id: keys.identity_id().as_bytes().to_vec(),
            include_thumbnail: false,
            include_application_services: true,
        })
        .await;
    match info.body {
        Some(ResponseBody::GetIdentityInformation {
            is_hosted,
            is_online,
            application_services,
            ..
        }) => {
            assert!(is_hosted);
            assert!(is_online);
            assert_eq!(application_services, ["a", "b", "c", "d"]);
        }
        other => panic!("Expected identity information, got {other:?}"),
    }
}

#[tokio::test]
async fn test_newer_check_in_supersedes_older() {
    let test = TestNode::start().await;
    let keys = NodeKeys::generate();
    let mut first = test.checked_in(&keys).await;

    let mut second = test.client(ServerRole::ClientCustomer).await;
    let challenge = second.start_conversation(&keys).await;
    let response = second
        .request(WireRequest::CheckIn {
            signature: keys.sign(&challenge),
            challenge,
        })
        .await;
    assert_eq!(response.status, Status::Ok);

    assert!(first.try_recv().await.is_err());
    let ping = second.request(WireRequest::Ping { payload: vec![] }).await;
    assert_eq!(ping.status, Status::Ok);
}
