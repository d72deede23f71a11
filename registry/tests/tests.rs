// Copyright (c) 2022 Espresso Systems (espressosys.com)
// This file is part of the ONIX registry and gateway library.

// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use async_std::sync::Arc;
use chrono::{TimeZone, Utc};
use rand_chacha::{rand_core::SeedableRng, ChaChaRng};
use serde_json::json;
use std::time::Duration;

use onix_core::events::{ChannelPublisher, EventType, Publisher};
use onix_core::model::{
    LookupRequest, SubscriberRole, SubscriptionRequest, SubscriptionStatus,
};
use onix_core::server::ErrorBody;
use onix_core::signature;
use onix_keys::encryption::generate_encryption_keypair;
use onix_keys::{
    ensure_service_keys, EncryptionService, KeyManager, MemoryCache, MemorySecretStore,
    SecretStore,
};
use registry::admin::{AdminService, OnSubscribeRequest, OnSubscribeResponse};
use registry::auth::Authenticator;
use registry::lro::{Lro, LroStatus};
use registry::service::SubscriptionService;
use registry::store::{
    LocalLookup, LroStore, MemoryLroStore, MemorySubscriptionRepository, SubscriptionRepository,
};
use registry::{init_web_server, wait_for_server, ShutdownGauge, SubscribeResponse, WebState};

struct TestRegistry {
    base: String,
    publisher: ChannelPublisher,
    registry_encr_public: Vec<u8>,
}

/// Spin up a registry with in-memory backends on `port`.
async fn start_registry(port: u16) -> TestRegistry {
    let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
    let identity = ensure_service_keys(&*secrets, "registry.onix", "rk1")
        .await
        .unwrap();

    let repo: Arc<dyn SubscriptionRepository> = Arc::new(MemorySubscriptionRepository::new());
    let lros: Arc<dyn LroStore> = Arc::new(MemoryLroStore::new());
    let publisher = ChannelPublisher::new();
    let publisher_dyn: Arc<dyn Publisher> = Arc::new(publisher.clone());
    let keys = KeyManager::new(
        Arc::new(MemoryCache::new()),
        secrets,
        Arc::new(LocalLookup::new(repo.clone())),
        Duration::from_secs(5),
        Duration::from_secs(60),
    );

    let state = WebState {
        service: SubscriptionService::new(lros.clone(), repo.clone(), publisher_dyn.clone()),
        admin: AdminService::new(
            lros,
            repo.clone(),
            publisher_dyn,
            keys,
            "registry.onix".into(),
            "rk1".into(),
            3,
            Duration::from_millis(50),
            Duration::from_millis(2000),
        ),
        authenticator: Authenticator::new(repo),
        shutdown: ShutdownGauge::new(),
    };

    init_web_server(state, format!("127.0.0.1:{}", port));
    let base = format!("http://127.0.0.1:{}", port);
    wait_for_server(&base).await;

    TestRegistry {
        base,
        publisher,
        registry_encr_public: base64::decode(&identity.encr_public_key).unwrap(),
    }
}

/// Stub subscriber: decrypts the challenge with its own encryption key and
/// answers with `answer_override` when set, the true plaintext otherwise.
#[derive(Clone)]
struct StubSubscriber {
    encr_private: Vec<u8>,
    registry_public: Vec<u8>,
    answer_override: Option<String>,
}

async fn on_subscribe(
    mut req: tide::Request<StubSubscriber>,
) -> Result<tide::Response, tide::Error> {
    let body: OnSubscribeRequest = req.body_json().await?;
    let state = req.state();
    let plaintext = EncryptionService::decrypt(
        &body.challenge,
        &state.encr_private,
        &state.registry_public,
    )
    .map_err(|err| tide::Error::from_str(tide::StatusCode::BadRequest, err.to_string()))?;
    let answer = state.answer_override.clone().unwrap_or(plaintext);
    Ok(tide::Response::builder(200)
        .body(tide::Body::from_json(&OnSubscribeResponse { answer })?)
        .build())
}

async fn start_subscriber(port: u16, state: StubSubscriber) {
    let mut app = tide::with_state(state);
    app.at("/on_subscribe").post(on_subscribe);
    async_std::task::spawn(app.listen(format!("127.0.0.1:{}", port)));
    wait_for_server(&format!("http://127.0.0.1:{}", port)).await;
}

fn subscription_request(
    message_id: &str,
    subscriber_id: &str,
    url: &str,
    signing_public_key: &str,
    encr_public_key: &str,
) -> SubscriptionRequest {
    SubscriptionRequest {
        message_id: message_id.into(),
        subscriber_id: subscriber_id.into(),
        url: url.into(),
        role: SubscriberRole::Bap,
        domain: "retail".into(),
        signing_public_key: signing_public_key.into(),
        encr_public_key: encr_public_key.into(),
        key_id: "k1".into(),
        valid_from: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        valid_until: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        location: None,
        nonce: None,
        extended_attributes: None,
    }
}

async fn approve(base: &str, operation_id: &str) -> Lro {
    let mut res = surf::post(format!("{}/operations/action", base))
        .body_json(&json!({"operation_id": operation_id, "action": "APPROVE"}))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(res.status(), surf::StatusCode::Ok);
    res.body_json().await.unwrap()
}

#[async_std::test]
async fn test_create_and_approve() {
    let registry = start_registry(50261).await;
    let inbox = registry.publisher.subscribe();

    let mut rng = ChaChaRng::from_seed([21u8; 32]);
    let (_sign_seed, sign_public) = signature::generate_signing_keypair(&mut rng);
    let (encr_private, encr_public) = generate_encryption_keypair(&mut rng);
    start_subscriber(
        50262,
        StubSubscriber {
            encr_private,
            registry_public: registry.registry_encr_public.clone(),
            answer_override: None,
        },
    )
    .await;

    // Create.
    let request = subscription_request(
        "m1",
        "bap.x",
        "http://127.0.0.1:50262",
        &sign_public,
        &encr_public,
    );
    let mut res = surf::post(format!("{}/subscribe", registry.base))
        .body_json(&request)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(res.status(), surf::StatusCode::Ok);
    let created: SubscribeResponse = res.body_json().await.unwrap();
    assert_eq!(created.status, SubscriptionStatus::UnderSubscription);
    assert_eq!(created.message_id, "m1");

    let event = inbox.recv().await.unwrap();
    assert_eq!(event.event_type, EventType::NewSubscriptionRequest);
    assert_eq!(event.payload["message_id"], "m1");

    // Approve: the stub answers the challenge correctly.
    let lro = approve(&registry.base, "m1").await;
    assert_eq!(lro.status, LroStatus::Approved);
    assert_eq!(lro.result_json.as_ref().unwrap()["status"], "SUBSCRIBED");

    // The subscription row exists with status SUBSCRIBED.
    let mut res = surf::post(format!("{}/lookup", registry.base))
        .body_json(&LookupRequest {
            subscriber_id: Some("bap.x".into()),
            ..LookupRequest::default()
        })
        .unwrap()
        .await
        .unwrap();
    let rows: Vec<onix_core::model::Subscription> = res.body_json().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SubscriptionStatus::Subscribed);

    // Events: ON_SUBSCRIBE_RECEIVED then SUBSCRIPTION_REQUEST_APPROVED.
    let event = inbox.recv().await.unwrap();
    assert_eq!(event.event_type, EventType::OnSubscribeReceived);
    assert_eq!(event.payload["operation_id"], "m1");
    let event = inbox.recv().await.unwrap();
    assert_eq!(event.event_type, EventType::SubscriptionRequestApproved);

    // Approving again is a no-op returning the terminal state.
    let lro = approve(&registry.base, "m1").await;
    assert_eq!(lro.status, LroStatus::Approved);
}

#[async_std::test]
async fn test_challenge_mismatch_fails_the_operation() {
    let registry = start_registry(50263).await;

    let mut rng = ChaChaRng::from_seed([22u8; 32]);
    let (_sign_seed, sign_public) = signature::generate_signing_keypair(&mut rng);
    let (encr_private, encr_public) = generate_encryption_keypair(&mut rng);
    start_subscriber(
        50264,
        StubSubscriber {
            encr_private,
            registry_public: registry.registry_encr_public.clone(),
            answer_override: Some("wrong".into()),
        },
    )
    .await;

    let request = subscription_request(
        "m2",
        "bap.y",
        "http://127.0.0.1:50264",
        &sign_public,
        &encr_public,
    );
    surf::post(format!("{}/subscribe", registry.base))
        .body_json(&request)
        .unwrap()
        .await
        .unwrap();

    let lro = approve(&registry.base, "m2").await;
    assert_eq!(lro.status, LroStatus::Failure);
    assert_eq!(
        lro.error_json.as_ref().unwrap()["code"],
        "CHALLENGE_VERIFICATION_FAILED"
    );

    // No subscription row was persisted.
    let mut res = surf::post(format!("{}/lookup", registry.base))
        .body_json(&LookupRequest {
            subscriber_id: Some("bap.y".into()),
            ..LookupRequest::default()
        })
        .unwrap()
        .await
        .unwrap();
    let rows: Vec<onix_core::model::Subscription> = res.body_json().await.unwrap();
    assert!(rows.is_empty());
}

#[async_std::test]
async fn test_duplicate_create() {
    let registry = start_registry(50265).await;

    let request = subscription_request("m3", "bap.z", "http://127.0.0.1:1", "U0lHTg==", "RU5DUg==");
    let base = registry.base.clone();
    let first = {
        let request = request.clone();
        let base = base.clone();
        async_std::task::spawn(async move {
            let res = surf::post(format!("{}/subscribe", base))
                .body_json(&request)
                .unwrap()
                .await
                .unwrap();
            u16::from(res.status())
        })
    };
    let second = async_std::task::spawn(async move {
        let res = surf::post(format!("{}/subscribe", base))
            .body_json(&request)
            .unwrap()
            .await
            .unwrap();
        u16::from(res.status())
    });

    let mut statuses = vec![first.await, second.await];
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 409]);

    // Exactly one operation exists afterwards.
    let mut res = surf::get(format!("{}/operations/m3", registry.base))
        .await
        .unwrap();
    assert_eq!(res.status(), surf::StatusCode::Ok);
    let lro: Lro = res.body_json().await.unwrap();
    assert_eq!(lro.operation_id, "m3");
    assert_eq!(lro.status, LroStatus::Pending);

    // The loser's body carries the taxonomy code.
    let mut res = surf::post(format!("{}/subscribe", registry.base))
        .body_json(&subscription_request(
            "m3",
            "bap.z",
            "http://127.0.0.1:1",
            "U0lHTg==",
            "RU5DUg==",
        ))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(res.status(), surf::StatusCode::Conflict);
    let body: ErrorBody = res.body_json().await.unwrap();
    assert_eq!(body.code, "DUPLICATE_REQUEST");
}

#[async_std::test]
async fn test_reject_and_unknown_operation() {
    let registry = start_registry(50266).await;
    let inbox = registry.publisher.subscribe();

    let request =
        subscription_request("m4", "bap.w", "http://127.0.0.1:1", "U0lHTg==", "RU5DUg==");
    surf::post(format!("{}/subscribe", registry.base))
        .body_json(&request)
        .unwrap()
        .await
        .unwrap();
    // Drain the intake event.
    inbox.recv().await.unwrap();

    let mut res = surf::post(format!("{}/operations/action", registry.base))
        .body_json(&json!({"operation_id": "m4", "action": "REJECT"}))
        .unwrap()
        .await
        .unwrap();
    let lro: Lro = res.body_json().await.unwrap();
    assert_eq!(lro.status, LroStatus::Rejected);
    assert_eq!(
        inbox.recv().await.unwrap().event_type,
        EventType::SubscriptionRequestRejected
    );

    // Rejection is sticky; a later approve returns the terminal record.
    let lro = approve(&registry.base, "m4").await;
    assert_eq!(lro.status, LroStatus::Rejected);

    let res = surf::get(format!("{}/operations/missing", registry.base))
        .await
        .unwrap();
    assert_eq!(res.status(), surf::StatusCode::NotFound);
}

#[async_std::test]
async fn test_signed_update() {
    let registry = start_registry(50267).await;

    let mut rng = ChaChaRng::from_seed([23u8; 32]);
    let (sign_seed, sign_public) = signature::generate_signing_keypair(&mut rng);
    let (encr_private, encr_public) = generate_encryption_keypair(&mut rng);
    start_subscriber(
        50268,
        StubSubscriber {
            encr_private,
            registry_public: registry.registry_encr_public.clone(),
            answer_override: None,
        },
    )
    .await;

    // Register and approve the subscriber first.
    let request = subscription_request(
        "m5",
        "bap.v",
        "http://127.0.0.1:50268",
        &sign_public,
        &encr_public,
    );
    surf::post(format!("{}/subscribe", registry.base))
        .body_json(&request)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(approve(&registry.base, "m5").await.status, LroStatus::Approved);

    // A properly signed PATCH is accepted.
    let mut update = request.clone();
    update.message_id = "m6".into();
    update.url = "http://127.0.0.1:50268/v2".into();
    let body = serde_json::to_vec(&update).unwrap();
    let now = Utc::now().timestamp();
    let authorization =
        signature::authorization_header("bap.v", "k1", &sign_seed, &body, now, now + 60).unwrap();

    let mut res = surf::patch(format!("{}/subscribe", registry.base))
        .header("Authorization", authorization)
        .content_type(surf::http::mime::JSON)
        .body(body.clone())
        .await
        .unwrap();
    assert_eq!(res.status(), surf::StatusCode::Ok);
    let accepted: SubscribeResponse = res.body_json().await.unwrap();
    assert_eq!(accepted.message_id, "m6");

    // A tampered body is rejected with a challenge header.
    let mut tampered = body.clone();
    let last = tampered.len() - 2;
    tampered[last] ^= 1;
    let now = Utc::now().timestamp();
    let authorization =
        signature::authorization_header("bap.v", "k1", &sign_seed, &body, now, now + 60).unwrap();
    let mut res = surf::patch(format!("{}/subscribe", registry.base))
        .header("Authorization", authorization)
        .content_type(surf::http::mime::JSON)
        .body(tampered)
        .await
        .unwrap();
    assert_eq!(res.status(), surf::StatusCode::Unauthorized);
    assert!(res.header("WWW-Authenticate").is_some());
    let body: ErrorBody = res.body_json().await.unwrap();
    assert_eq!(body.code, "INVALID_SIGNATURE");

    // An unregistered signer is told to register first.
    let (ghost_seed, _) = signature::generate_signing_keypair(&mut rng);
    let mut ghost = update.clone();
    ghost.message_id = "m7".into();
    ghost.subscriber_id = "ghost.x".into();
    let body = serde_json::to_vec(&ghost).unwrap();
    let now = Utc::now().timestamp();
    let authorization =
        signature::authorization_header("ghost.x", "k1", &ghost_seed, &body, now, now + 60)
            .unwrap();
    let mut res = surf::patch(format!("{}/subscribe", registry.base))
        .header("Authorization", authorization)
        .content_type(surf::http::mime::JSON)
        .body(body)
        .await
        .unwrap();
    assert_eq!(res.status(), surf::StatusCode::Unauthorized);
    let body: ErrorBody = res.body_json().await.unwrap();
    assert_eq!(body.code, "SUBSCRIBER_NOT_FOUND");
}

#[async_std::test]
async fn test_unreachable_subscriber_exhausts_retries() {
    let registry = start_registry(50269).await;

    // Nothing listens on the callback port.
    let request =
        subscription_request("m8", "bap.u", "http://127.0.0.1:50299", "U0lHTg==", "RU5DUg==");
    surf::post(format!("{}/subscribe", registry.base))
        .body_json(&request)
        .unwrap()
        .await
        .unwrap();

    let lro = approve(&registry.base, "m8").await;
    assert_eq!(lro.status, LroStatus::Failure);
    assert_eq!(
        lro.error_json.as_ref().unwrap()["code"],
        "RETRIES_EXHAUSTED"
    );
    // Two recorded retries before the third, final attempt.
    assert_eq!(lro.retry_count, 2);
}
