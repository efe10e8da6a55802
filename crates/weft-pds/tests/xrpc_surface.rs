//! End-to-end tests over the XRPC surface.

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::{json, Value as Json};
use url::Url;
use weft_common::RecordKey;
use weft_pds::{xrpc, AllowAll, MemoryContentSource, Pds, PdsConfig};
use weft_repo::car::parse_car;
use weft_repo::commit::Commit;
use weft_repo::MemoryStateStore;

struct Node {
    server: TestServer,
    pds: Arc<Pds<MemoryStateStore>>,
    content: Arc<MemoryContentSource>,
}

async fn node() -> Node {
    let config = PdsConfig::for_origin(Url::parse("https://blog.example").unwrap()).unwrap();
    let content = Arc::new(MemoryContentSource::new());
    let pds = Pds::open(
        config,
        MemoryStateStore::new(),
        content.clone(),
        Arc::new(AllowAll),
    )
    .await
    .unwrap();
    let server = TestServer::new(xrpc::router(pds.clone())).unwrap();
    Node {
        server,
        pds,
        content,
    }
}

fn post_body(text: &str) -> Json {
    json!({
        "$type": "app.bsky.feed.post",
        "text": text,
        "createdAt": "2024-01-01T00:00:00.000Z",
    })
}

async fn create_post(node: &Node, text: &str) -> (String, String) {
    let response = node
        .server
        .post("/xrpc/com.atproto.repo.createRecord")
        .json(&json!({
            "repo": "did:web:blog.example",
            "collection": "app.bsky.feed.post",
            "record": post_body(text),
        }))
        .await;
    response.assert_status_ok();
    let body: Json = response.json();
    (
        body["uri"].as_str().unwrap().to_owned(),
        body["cid"].as_str().unwrap().to_owned(),
    )
}

#[tokio::test]
async fn genesis_write_roundtrips() {
    let node = node().await;
    let (_, mut events) = node.pds.firehose.subscribe(None).await;

    let (uri, cid) = create_post(&node, "hi").await;
    assert!(uri.starts_with("at://did:web:blog.example/app.bsky.feed.post/"));
    assert!(cid.starts_with('b'));
    let rkey = uri.rsplit('/').next().unwrap().to_owned();

    // read it back
    let response = node
        .server
        .get("/xrpc/com.atproto.repo.getRecord")
        .add_query_param("repo", "did:web:blog.example")
        .add_query_param("collection", "app.bsky.feed.post")
        .add_query_param("rkey", &rkey)
        .await;
    response.assert_status_ok();
    let body: Json = response.json();
    assert_eq!(body["uri"], uri);
    assert_eq!(body["cid"], cid);
    assert_eq!(body["value"]["text"], "hi");
    assert_eq!(body["value"]["$type"], "app.bsky.feed.post");

    // the firehose carried one #commit with seq 1 and a create op
    let (seq, frame) = events.recv().await.unwrap();
    assert_eq!(seq, 1);
    let (header, event) = weft_pds::firehose::parse_frame(&frame).unwrap();
    assert_eq!(header.as_map().unwrap().get_str("t"), Some("#commit"));
    let event = event.as_map().unwrap();
    assert_eq!(
        event.get("seq"),
        Some(&weft_common::codec::Value::Integer(1))
    );
    let ops = match event.get("ops") {
        Some(weft_common::codec::Value::Array(ops)) => ops,
        other => panic!("ops: {other:?}"),
    };
    let op = ops[0].as_map().unwrap();
    assert_eq!(op.get_str("action"), Some("create"));
    assert_eq!(
        op.get_str("path"),
        Some(format!("app.bsky.feed.post/{rkey}").as_str())
    );
}

#[tokio::test]
async fn get_by_handle_works_too() {
    let node = node().await;
    let (uri, _) = create_post(&node, "by handle").await;
    let rkey = uri.rsplit('/').next().unwrap().to_owned();
    let response = node
        .server
        .get("/xrpc/com.atproto.repo.getRecord")
        .add_query_param("repo", "blog.example")
        .add_query_param("collection", "app.bsky.feed.post")
        .add_query_param("rkey", &rkey)
        .await;
    response.assert_status_ok();
}

#[tokio::test]
async fn swap_conflict_exactly_one_wins() {
    let node = node().await;
    let response = node
        .server
        .post("/xrpc/com.atproto.repo.createRecord")
        .json(&json!({
            "repo": "did:web:blog.example",
            "collection": "app.bsky.feed.post",
            "rkey": "3l4qpz7ajrc2a",
            "record": post_body("v1"),
        }))
        .await;
    response.assert_status_ok();
    let c1 = response.json::<Json>()["cid"].as_str().unwrap().to_owned();

    // client A succeeds against c1
    let a = node
        .server
        .post("/xrpc/com.atproto.repo.putRecord")
        .json(&json!({
            "repo": "did:web:blog.example",
            "collection": "app.bsky.feed.post",
            "rkey": "3l4qpz7ajrc2a",
            "record": post_body("v2"),
            "swapRecord": c1,
        }))
        .await;
    a.assert_status_ok();
    let c2 = a.json::<Json>()["cid"].as_str().unwrap().to_owned();

    // client B holds the stale c1 and must fail
    let b = node
        .server
        .post("/xrpc/com.atproto.repo.putRecord")
        .json(&json!({
            "repo": "did:web:blog.example",
            "collection": "app.bsky.feed.post",
            "rkey": "3l4qpz7ajrc2a",
            "record": post_body("v3"),
            "swapRecord": c1,
        }))
        .await;
    assert_eq!(b.status_code(), 400);
    let body: Json = b.json();
    assert_eq!(body["error"], "InvalidSwap");
    assert!(body["message"].is_string());

    // repository reflects only the winner
    let current = node
        .server
        .get("/xrpc/com.atproto.repo.getRecord")
        .add_query_param("repo", "did:web:blog.example")
        .add_query_param("collection", "app.bsky.feed.post")
        .add_query_param("rkey", "3l4qpz7ajrc2a")
        .await;
    let body: Json = current.json();
    assert_eq!(body["cid"], c2);
    assert_eq!(body["value"]["text"], "v2");
}

#[tokio::test]
async fn swap_record_on_create_is_rejected() {
    let node = node().await;
    let response = node
        .server
        .post("/xrpc/com.atproto.repo.createRecord")
        .json(&json!({
            "repo": "did:web:blog.example",
            "collection": "app.bsky.feed.post",
            "record": post_body("x"),
            "swapRecord": "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy",
        }))
        .await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Json>()["error"], "InvalidSwap");
}

#[tokio::test]
async fn delete_then_list() {
    let node = node().await;
    for rkey in ["3l4qpz7ajrc2a", "3l4qpz7bjrc2b", "3l4qpz7cjrc2c"] {
        let response = node
            .server
            .post("/xrpc/com.atproto.repo.createRecord")
            .json(&json!({
                "repo": "did:web:blog.example",
                "collection": "app.bsky.feed.post",
                "rkey": rkey,
                "record": post_body(rkey),
            }))
            .await;
        response.assert_status_ok();
    }

    let response = node
        .server
        .post("/xrpc/com.atproto.repo.deleteRecord")
        .json(&json!({
            "repo": "did:web:blog.example",
            "collection": "app.bsky.feed.post",
            "rkey": "3l4qpz7bjrc2b",
        }))
        .await;
    response.assert_status_ok();
    assert!(response.json::<Json>()["commit"]["cid"].is_string());

    let response = node
        .server
        .get("/xrpc/com.atproto.repo.listRecords")
        .add_query_param("repo", "did:web:blog.example")
        .add_query_param("collection", "app.bsky.feed.post")
        .add_query_param("limit", "100")
        .await;
    response.assert_status_ok();
    let body: Json = response.json();
    let uris: Vec<&str> = body["records"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["uri"].as_str().unwrap())
        .collect();
    assert_eq!(
        uris,
        vec![
            "at://did:web:blog.example/app.bsky.feed.post/3l4qpz7ajrc2a",
            "at://did:web:blog.example/app.bsky.feed.post/3l4qpz7cjrc2c",
        ]
    );

    let response = node
        .server
        .get("/xrpc/com.atproto.repo.getRecord")
        .add_query_param("repo", "did:web:blog.example")
        .add_query_param("collection", "app.bsky.feed.post")
        .add_query_param("rkey", "3l4qpz7bjrc2b")
        .await;
    assert_eq!(response.status_code(), 404);
    assert_eq!(response.json::<Json>()["error"], "RecordNotFound");
}

#[tokio::test]
async fn list_records_rejects_oversize_limit() {
    let node = node().await;
    let response = node
        .server
        .get("/xrpc/com.atproto.repo.listRecords")
        .add_query_param("repo", "did:web:blog.example")
        .add_query_param("collection", "app.bsky.feed.post")
        .add_query_param("limit", "101")
        .await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Json>()["error"], "InvalidRequest");
}

#[tokio::test]
async fn car_export_covers_live_records() {
    let node = node().await;
    let mut cids = Vec::new();
    for rkey in ["3l4qpz7ajrc2a", "3l4qpz7bjrc2b", "3l4qpz7cjrc2c"] {
        let response = node
            .server
            .post("/xrpc/com.atproto.repo.createRecord")
            .json(&json!({
                "repo": "did:web:blog.example",
                "collection": "app.bsky.feed.post",
                "rkey": rkey,
                "record": post_body(rkey),
            }))
            .await;
        cids.push(response.json::<Json>()["cid"].as_str().unwrap().to_owned());
    }
    node.server
        .post("/xrpc/com.atproto.repo.deleteRecord")
        .json(&json!({
            "repo": "did:web:blog.example",
            "collection": "app.bsky.feed.post",
            "rkey": "3l4qpz7bjrc2b",
        }))
        .await
        .assert_status_ok();

    let response = node
        .server
        .get("/xrpc/com.atproto.sync.getRepo")
        .add_query_param("did", "did:web:blog.example")
        .await;
    response.assert_status_ok();
    assert_eq!(
        response.header("content-type"),
        "application/vnd.ipld.car"
    );
    let car = parse_car(&response.as_bytes()).unwrap();

    // declared root is the current commit, and it anchors the MST root
    let state = node.pds.repo_state().await;
    assert_eq!(car.roots, vec![state.commit]);
    let commit = Commit::from_bytes(car.get(&state.commit).unwrap()).unwrap();
    assert_eq!(commit.data, state.root);
    assert_eq!(commit.rev, state.rev);

    // surviving records present, deleted one absent
    let has = |cid: &str| car.get(&cid.parse().unwrap()).is_some();
    assert!(has(&cids[0]));
    assert!(!has(&cids[1]));
    assert!(has(&cids[2]));
}

#[tokio::test]
async fn blob_upload_and_fetch() {
    let node = node().await;
    let payload = b"\x89PNG not really a png";
    let response = node
        .server
        .post("/xrpc/com.atproto.repo.uploadBlob")
        .bytes(payload.as_slice().into())
        .content_type("image/png")
        .await;
    response.assert_status_ok();
    let blob: Json = response.json();
    assert_eq!(blob["blob"]["$type"], "blob");
    assert_eq!(blob["blob"]["mimeType"], "image/png");
    assert_eq!(blob["blob"]["size"], payload.len());
    let cid = blob["blob"]["ref"]["$link"].as_str().unwrap().to_owned();

    let response = node
        .server
        .get("/xrpc/com.atproto.sync.getBlob")
        .add_query_param("did", "did:web:blog.example")
        .add_query_param("cid", &cid)
        .await;
    response.assert_status_ok();
    assert_eq!(response.header("content-type"), "image/png");
    assert_eq!(response.as_bytes().as_ref(), payload);

    let response = node
        .server
        .get("/xrpc/com.atproto.sync.getBlob")
        .add_query_param("did", "did:web:blog.example")
        .add_query_param(
            "cid",
            "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy",
        )
        .await;
    assert_eq!(response.status_code(), 404);
    assert_eq!(response.json::<Json>()["error"], "BlobNotFound");
}

#[tokio::test]
async fn oversized_blob_is_rejected() {
    let config = PdsConfig {
        max_blob_size: 64,
        ..PdsConfig::for_origin(Url::parse("https://blog.example").unwrap()).unwrap()
    };
    let pds = Pds::open(
        config,
        MemoryStateStore::new(),
        Arc::new(MemoryContentSource::new()),
        Arc::new(AllowAll),
    )
    .await
    .unwrap();
    let server = TestServer::new(xrpc::router(pds)).unwrap();

    let response = server
        .post("/xrpc/com.atproto.repo.uploadBlob")
        .bytes(vec![0u8; 65].into())
        .content_type("application/octet-stream")
        .await;
    assert_eq!(response.status_code(), 413);
    assert_eq!(response.json::<Json>()["error"], "BlobTooLarge");
}

#[tokio::test]
async fn identity_surface() {
    let node = node().await;

    let response = node.server.get("/.well-known/did.json").await;
    response.assert_status_ok();
    assert_eq!(response.header("content-type"), "application/did+json");
    let doc: Json = response.json();
    assert_eq!(doc["id"], "did:web:blog.example");
    assert_eq!(doc["alsoKnownAs"][0], "at://blog.example");
    assert_eq!(doc["verificationMethod"][0]["type"], "Multikey");
    assert!(doc["verificationMethod"][0]["publicKeyMultibase"]
        .as_str()
        .unwrap()
        .starts_with('z'));
    assert_eq!(doc["service"][0]["id"], "#atproto_pds");
    assert_eq!(doc["service"][0]["serviceEndpoint"], "https://blog.example");

    let response = node.server.get("/.well-known/atproto-did").await;
    response.assert_status_ok();
    assert_eq!(response.text(), "did:web:blog.example");

    let response = node
        .server
        .get("/xrpc/com.atproto.identity.resolveHandle")
        .add_query_param("handle", "blog.example")
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Json>()["did"], "did:web:blog.example");

    let response = node
        .server
        .get("/xrpc/com.atproto.identity.resolveHandle")
        .add_query_param("handle", "someone-else.example")
        .await;
    assert_eq!(response.status_code(), 404);
    assert_eq!(response.json::<Json>()["error"], "HandleNotFound");

    let response = node
        .server
        .get("/xrpc/com.atproto.identity.resolveHandle")
        .add_query_param("handle", "not a handle")
        .await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Json>()["error"], "InvalidHandle");
}

#[tokio::test]
async fn describe_repo_and_server() {
    let node = node().await;
    create_post(&node, "something").await;

    let response = node
        .server
        .get("/xrpc/com.atproto.repo.describeRepo")
        .add_query_param("repo", "did:web:blog.example")
        .await;
    response.assert_status_ok();
    let body: Json = response.json();
    assert_eq!(body["did"], "did:web:blog.example");
    assert_eq!(body["handle"], "blog.example");
    assert_eq!(body["handleIsCorrect"], true);
    assert_eq!(body["collections"][0], "app.bsky.feed.post");
    assert_eq!(body["didDoc"]["id"], "did:web:blog.example");

    let response = node
        .server
        .get("/xrpc/com.atproto.repo.describeRepo")
        .add_query_param("repo", "did:web:elsewhere.example")
        .await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Json>()["error"], "RepoNotFound");

    let response = node
        .server
        .get("/xrpc/com.atproto.server.describeServer")
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Json>()["did"], "did:web:blog.example");
}

#[tokio::test]
async fn writes_to_foreign_repos() {
    let node = node().await;

    // put/delete against another repo reads as repo-not-found, not forbidden
    for method in ["putRecord", "deleteRecord"] {
        let response = node
            .server
            .post(&format!("/xrpc/com.atproto.repo.{method}"))
            .json(&json!({
                "repo": "did:web:alice.example",
                "collection": "app.bsky.feed.post",
                "rkey": "3l4qpz7ajrc2a",
                "record": post_body("x"),
            }))
            .await;
        assert_eq!(response.status_code(), 400, "{method}");
        assert_eq!(response.json::<Json>()["error"], "RepoNotFound", "{method}");
    }
}

#[tokio::test]
async fn incoming_like_reaches_interaction_sink() {
    let node = node().await;
    // a local post the remote actor will like
    let rkey = RecordKey::new("3l4qpz7ajrc2a").unwrap();
    node.content.add_item(rkey.clone());

    let like = json!({
        "repo": "did:web:alice.example",
        "collection": "app.bsky.feed.like",
        "record": {
            "$type": "app.bsky.feed.like",
            "subject": {
                "uri": format!("at://did:web:blog.example/app.bsky.feed.post/{rkey}"),
                "cid": "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy",
            },
            "createdAt": "2024-03-03T03:03:03.000Z",
        },
    });

    let response = node
        .server
        .post("/xrpc/com.atproto.repo.createRecord")
        .json(&like)
        .await;
    response.assert_status_ok();
    assert_eq!(node.content.like_count(&rkey), 1);

    // repeat delivery is a no-op
    node.server
        .post("/xrpc/com.atproto.repo.createRecord")
        .json(&like)
        .await
        .assert_status_ok();
    assert_eq!(node.content.like_count(&rkey), 1);

    // nothing was stored in the local repository
    assert_eq!(node.pds.with_repo(|r| r.record_count()).await, 0);
}

#[tokio::test]
async fn malformed_record_is_rejected() {
    let node = node().await;
    let response = node
        .server
        .post("/xrpc/com.atproto.repo.createRecord")
        .json(&json!({
            "repo": "did:web:blog.example",
            "collection": "app.bsky.feed.post",
            "record": {"$type": "app.bsky.feed.post", "score": 1.5},
        }))
        .await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Json>()["error"], "MalformedEncoding");
}
