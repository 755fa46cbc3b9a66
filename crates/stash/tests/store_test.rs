//! End-to-end tests for the entity server: full stack over an
//! in-memory SQLite database through the production migrator, dialect
//! and server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ConnectOptions, ConnectionTrait, Database};
use serde_json::json;
use tokio::time::sleep;

use db::EntityDb;
use db::config::{Environment, FeatureToggles};
use db::migrator;
use grn::Grn;

use stash::EntityStore;
use stash::api::{
    AdminWriteEntityRequest, BatchReadEntityRequest, DeleteEntityRequest, EntityHistoryRequest,
    EntitySearchRequest, ReadEntityRequest, ReferenceRequest, WriteEntityRequest, WriteStatus,
};
use stash::ctx::RequestContext;
use stash::error::EntityError;
use stash::kind::{
    EntityExternalReference, EntitySummary, KindRegistry, STANDARD_KIND_FOLDER, SummaryBuilder,
};
use stash::resolver::NoopReferenceResolver;
use stash::server::SqlEntityServer;

/// Playlist bodies are JSON documents with an optional title, labels
/// map, references list and nested children.
struct PlaylistSummaryBuilder;

#[async_trait::async_trait]
impl SummaryBuilder for PlaylistSummaryBuilder {
    async fn build(&self, uid: &str, body: &[u8]) -> stash::Result<(EntitySummary, Vec<u8>)> {
        let doc: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| EntityError::InvalidInput(format!("invalid playlist body: {}", e)))?;

        let mut summary = EntitySummary {
            uid: uid.to_string(),
            kind: "playlist".to_string(),
            name: doc
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or(uid)
                .to_string(),
            ..Default::default()
        };

        if let Some(labels) = doc.get("labels").and_then(|v| v.as_object()) {
            for (k, v) in labels {
                if let Some(v) = v.as_str() {
                    summary.labels.insert(k.clone(), v.to_string());
                }
            }
        }

        if let Some(refs) = doc.get("references").and_then(|v| v.as_array()) {
            for r in refs {
                summary.references.push(EntityExternalReference {
                    family: field(r, "family"),
                    ref_type: field(r, "type"),
                    identifier: field(r, "id"),
                });
            }
        }

        if let Some(nested) = doc.get("nested").and_then(|v| v.as_array()) {
            for child in nested {
                let mut child_summary = EntitySummary {
                    kind: field(child, "kind"),
                    uid: field(child, "uid"),
                    name: field(child, "name"),
                    ..Default::default()
                };
                if let Some(labels) = child.get("labels").and_then(|v| v.as_object()) {
                    for (k, v) in labels {
                        if let Some(v) = v.as_str() {
                            child_summary.labels.insert(k.clone(), v.to_string());
                        }
                    }
                }
                summary.nested.push(child_summary);
            }
        }

        Ok((summary, body.to_vec()))
    }
}

struct FolderSummaryBuilder;

#[async_trait::async_trait]
impl SummaryBuilder for FolderSummaryBuilder {
    async fn build(&self, uid: &str, body: &[u8]) -> stash::Result<(EntitySummary, Vec<u8>)> {
        let doc: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| EntityError::InvalidInput(format!("invalid folder body: {}", e)))?;
        let summary = EntitySummary {
            uid: uid.to_string(),
            kind: STANDARD_KIND_FOLDER.to_string(),
            name: doc
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or(uid)
                .to_string(),
            ..Default::default()
        };
        Ok((summary, body.to_vec()))
    }
}

fn field(value: &serde_json::Value, name: &str) -> String {
    value
        .get(name)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

async fn setup() -> (SqlEntityServer, EntityDb) {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1);
    let conn = Database::connect(opt).await.expect("connect sqlite");

    let entity_db = EntityDb::from_connection(conn);
    migrator::migrate_entity_store(
        &entity_db,
        Environment::Development,
        FeatureToggles {
            entity_store: true,
            migration_locking: false,
        },
    )
    .await
    .expect("migrate");

    let mut kinds = KindRegistry::new();
    kinds.register("playlist", Arc::new(PlaylistSummaryBuilder));
    kinds.register(STANDARD_KIND_FOLDER, Arc::new(FolderSummaryBuilder));

    let server = SqlEntityServer::new(
        &entity_db,
        Arc::new(kinds),
        Arc::new(NoopReferenceResolver),
    );
    (server, entity_db)
}

fn ctx() -> RequestContext {
    RequestContext::with_user(1, "user:1:admin")
}

fn playlist_grn(name: &str) -> Grn {
    // Tenant 0 adopts the caller's tenant.
    Grn::new(0, "playlist", name)
}

fn write_req(name: &str, body: serde_json::Value) -> WriteEntityRequest {
    WriteEntityRequest {
        grn: Some(playlist_grn(name)),
        body: serde_json::to_vec(&body).unwrap(),
        ..Default::default()
    }
}

fn read_req(name: &str) -> ReadEntityRequest {
    ReadEntityRequest {
        grn: Some(playlist_grn(name)),
        with_body: true,
        with_meta: true,
        with_summary: true,
        ..Default::default()
    }
}

async fn count_rows(db: &EntityDb, table: &str, guid: &str) -> i64 {
    let stmt = db.dialect().statement(
        format!("SELECT COUNT(*) FROM {} WHERE guid=?", table),
        vec![guid.into()],
    );
    let row = db
        .connection()
        .query_one(stmt)
        .await
        .expect("count query")
        .expect("count row");
    row.try_get_by_index::<i64>(0).expect("count value")
}

#[tokio::test]
async fn test_create_read_round_trip() {
    let (server, _db) = setup().await;
    let body = json!({"title": "t"});

    let rsp = server.write(&ctx(), write_req("p1", body.clone())).await.unwrap();
    assert_eq!(rsp.status, WriteStatus::Created);
    assert!(!rsp.guid.is_empty());
    let version = rsp.entity.as_ref().unwrap().version.clone();
    assert!(!version.is_empty());

    let entity = server.read(&ctx(), read_req("p1")).await.unwrap();
    assert_eq!(entity.guid, rsp.guid);
    assert_eq!(entity.version, version);
    assert_eq!(entity.body.as_deref(), Some(&serde_json::to_vec(&body).unwrap()[..]));
    assert_eq!(entity.folder, "");
    let grn = entity.grn.unwrap();
    assert_eq!(grn.tenant_id, 1);
    assert_eq!(grn.resource_kind, "playlist");
    assert!(entity.summary_json.is_some());
}

#[tokio::test]
async fn test_idempotent_rewrite() {
    let (server, db) = setup().await;
    let body = json!({"title": "t"});

    let first = server.write(&ctx(), write_req("p1", body.clone())).await.unwrap();
    let before = server.read(&ctx(), read_req("p1")).await.unwrap();

    let second = server.write(&ctx(), write_req("p1", body)).await.unwrap();
    assert_eq!(second.status, WriteStatus::Unchanged);
    assert_eq!(
        second.entity.as_ref().unwrap().version,
        first.entity.as_ref().unwrap().version
    );

    let after = server.read(&ctx(), read_req("p1")).await.unwrap();
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(count_rows(&db, "entity_history", &first.guid).await, 1);
}

#[tokio::test]
async fn test_optimistic_lock_failure() {
    let (server, db) = setup().await;

    let first = server
        .write(&ctx(), write_req("p1", json!({"title": "t"})))
        .await
        .unwrap();

    let mut stale = write_req("p1", json!({"title": "changed"}));
    stale.previous_version = "00000000000000000000000000".to_string();
    let err = server.write(&ctx(), stale).await.unwrap_err();
    assert!(matches!(err, EntityError::OptimisticLock));

    // Nothing changed.
    let entity = server.read(&ctx(), read_req("p1")).await.unwrap();
    assert_eq!(entity.version, first.entity.unwrap().version);
    assert_eq!(
        entity.body.as_deref(),
        Some(&serde_json::to_vec(&json!({"title": "t"})).unwrap()[..])
    );
    assert_eq!(count_rows(&db, "entity_history", &first.guid).await, 1);
}

#[tokio::test]
async fn test_optimistic_lock_success() {
    let (server, _db) = setup().await;

    let first = server
        .write(&ctx(), write_req("p1", json!({"title": "t"})))
        .await
        .unwrap();

    let mut update = write_req("p1", json!({"title": "t2"}));
    update.previous_version = first.entity.unwrap().version;
    let rsp = server.write(&ctx(), update).await.unwrap();
    assert_eq!(rsp.status, WriteStatus::Updated);
}

#[tokio::test]
async fn test_label_search_conjunction() {
    let (server, _db) = setup().await;

    let p1 = server
        .write(
            &ctx(),
            write_req("p1", json!({"title": "one", "labels": {"env": "prod", "team": "a"}})),
        )
        .await
        .unwrap();
    server
        .write(
            &ctx(),
            write_req("p2", json!({"title": "two", "labels": {"env": "prod", "team": "b"}})),
        )
        .await
        .unwrap();
    server
        .write(
            &ctx(),
            write_req("p3", json!({"title": "three", "labels": {"env": "dev", "team": "a"}})),
        )
        .await
        .unwrap();

    let mut labels = HashMap::new();
    labels.insert("env".to_string(), "prod".to_string());
    labels.insert("team".to_string(), "a".to_string());

    let rsp = server
        .search(
            &ctx(),
            EntitySearchRequest {
                labels,
                with_labels: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(rsp.results.len(), 1);
    assert_eq!(rsp.results[0].guid, p1.guid);
    assert_eq!(rsp.results[0].labels.get("env").map(String::as_str), Some("prod"));

    // A single label matches the superset holders.
    let mut labels = HashMap::new();
    labels.insert("env".to_string(), "prod".to_string());
    let rsp = server
        .search(
            &ctx(),
            EntitySearchRequest {
                labels,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rsp.results.len(), 2);
}

#[tokio::test]
async fn test_delete_cascades() {
    let (server, db) = setup().await;

    let body = json!({
        "title": "t",
        "labels": {"env": "prod"},
        "references": [{"family": "playlist", "type": "item", "id": "target-1"}],
        "nested": [{"kind": "playlist-item", "uid": "i1", "name": "First", "labels": {"pos": "0"}}],
    });
    let rsp = server.write(&ctx(), write_req("p1", body)).await.unwrap();
    let guid = rsp.guid.clone();

    assert_eq!(count_rows(&db, "entity", &guid).await, 1);
    assert_eq!(count_rows(&db, "entity_labels", &guid).await, 1);
    assert_eq!(count_rows(&db, "entity_ref", &guid).await, 1);
    assert_eq!(count_rows(&db, "entity_nested", &guid).await, 1);

    let deleted = server
        .delete(
            &ctx(),
            DeleteEntityRequest {
                grn: Some(playlist_grn("p1")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(deleted.ok);

    let entity = server.read(&ctx(), read_req("p1")).await.unwrap();
    assert!(entity.is_empty());

    for table in [
        "entity",
        "entity_history",
        "entity_labels",
        "entity_ref",
        "entity_nested",
    ] {
        assert_eq!(count_rows(&db, table, &guid).await, 0, "{} not empty", table);
    }

    // Deleting a missing identity reports ok = false.
    let missing = server
        .delete(
            &ctx(),
            DeleteEntityRequest {
                grn: Some(playlist_grn("p1")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!missing.ok);
}

#[tokio::test]
async fn test_history_descends() {
    let (server, _db) = setup().await;

    let mut versions = Vec::new();
    for title in ["a", "b", "c"] {
        let rsp = server
            .write(&ctx(), write_req("p1", json!({"title": title})))
            .await
            .unwrap();
        versions.push(rsp.entity.unwrap().version);
        sleep(Duration::from_millis(5)).await;
    }

    let rsp = server
        .history(
            &ctx(),
            EntityHistoryRequest {
                grn: Some(playlist_grn("p1")),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(rsp.versions.len(), 3);
    let returned: Vec<&str> = rsp.versions.iter().map(|v| v.version.as_str()).collect();
    let mut expected: Vec<&str> = versions.iter().map(String::as_str).collect();
    expected.reverse();
    assert_eq!(returned, expected);
    assert!(rsp.versions[0].updated_at > rsp.versions[1].updated_at);
    assert!(rsp.versions[1].updated_at > rsp.versions[2].updated_at);
}

#[tokio::test]
async fn test_read_by_version() {
    let (server, _db) = setup().await;

    let first = server
        .write(&ctx(), write_req("p1", json!({"title": "a"})))
        .await
        .unwrap();
    server
        .write(&ctx(), write_req("p1", json!({"title": "b"})))
        .await
        .unwrap();

    let mut req = read_req("p1");
    req.version = first.entity.unwrap().version;
    let entity = server.read(&ctx(), req).await.unwrap();
    assert_eq!(
        entity.body.as_deref(),
        Some(&serde_json::to_vec(&json!({"title": "a"})).unwrap()[..])
    );
    assert!(entity.summary_json.is_some());

    // Unknown versions read as empty.
    let mut req = read_req("p1");
    req.version = "00000000000000000000000000".to_string();
    let entity = server.read(&ctx(), req).await.unwrap();
    assert!(entity.is_empty());
}

#[tokio::test]
async fn test_cross_tenant_isolation() {
    let (server, _db) = setup().await;

    server
        .write(&ctx(), write_req("p1", json!({"title": "t"})))
        .await
        .unwrap();

    // Another tenant reads through its own scope: same empty entity as
    // a nonexistent identity.
    let other = RequestContext::with_user(2, "user:2:admin");
    let entity = server.read(&other, read_req("p1")).await.unwrap();
    assert!(entity.is_empty());

    // Naming the foreign tenant explicitly is rejected outright.
    let mut req = read_req("p1");
    req.grn = Some(Grn::new(1, "playlist", "p1"));
    let err = server.read(&other, req).await.unwrap_err();
    assert!(matches!(err, EntityError::InvalidInput(_)));

    // And the foreign tenant's search sees nothing.
    let rsp = server
        .search(&other, EntitySearchRequest::default())
        .await
        .unwrap();
    assert!(rsp.results.is_empty());

    // No user in context at all.
    let err = server
        .read(&RequestContext::anonymous(), read_req("p1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EntityError::Unauthenticated));
}

#[tokio::test]
async fn test_batch_read_in_request_order() {
    let (server, _db) = setup().await;

    let p1 = server
        .write(&ctx(), write_req("p1", json!({"title": "one"})))
        .await
        .unwrap();
    let p2 = server
        .write(&ctx(), write_req("p2", json!({"title": "two"})))
        .await
        .unwrap();

    let rsp = server
        .batch_read(
            &ctx(),
            BatchReadEntityRequest {
                batch: vec![read_req("p2"), read_req("missing"), read_req("p1")],
            },
        )
        .await
        .unwrap();

    assert_eq!(rsp.results.len(), 3);
    assert_eq!(rsp.results[0].guid, p2.guid);
    assert!(rsp.results[1].is_empty());
    assert_eq!(rsp.results[2].guid, p1.guid);

    // Mismatched projection flags are rejected.
    let mut other = read_req("p1");
    other.with_body = false;
    let err = server
        .batch_read(
            &ctx(),
            BatchReadEntityRequest {
                batch: vec![read_req("p1"), other],
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EntityError::InvalidInput(_)));
}

#[tokio::test]
async fn test_find_references() {
    let (server, _db) = setup().await;

    let referrer = server
        .write(
            &ctx(),
            write_req(
                "p1",
                json!({
                    "title": "t",
                    "references": [{"family": "playlist", "type": "item", "id": "target-1"}],
                }),
            ),
        )
        .await
        .unwrap();
    server
        .write(&ctx(), write_req("p2", json!({"title": "unrelated"})))
        .await
        .unwrap();

    let rsp = server
        .find_references(
            &ctx(),
            ReferenceRequest {
                kind: "playlist".to_string(),
                uid: "target-1".to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(rsp.results.len(), 1);
    assert_eq!(rsp.results[0].guid, referrer.guid);
}

#[tokio::test]
async fn test_search_pagination() {
    let (server, _db) = setup().await;

    for i in 0..5 {
        server
            .write(&ctx(), write_req(&format!("p{}", i), json!({"title": "t"})))
            .await
            .unwrap();
    }

    let mut collected = Vec::new();
    let mut token = String::new();
    loop {
        let rsp = server
            .search(
                &ctx(),
                EntitySearchRequest {
                    limit: 2,
                    next_page_token: token.clone(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        for result in &rsp.results {
            collected.push(result.guid.clone());
        }
        if rsp.next_page_token.is_empty() {
            break;
        }
        token = rsp.next_page_token;
    }

    assert_eq!(collected.len(), 5);
    let mut sorted = collected.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted, collected, "pages must be guid-ascending and disjoint");
}

#[tokio::test]
async fn test_search_filters() {
    let (server, _db) = setup().await;

    server
        .write(&ctx(), write_req("p1", json!({"title": "t"})))
        .await
        .unwrap();
    let mut in_folder = write_req("p2", json!({"title": "t"}));
    in_folder.folder = "f1".to_string();
    let p2 = server.write(&ctx(), in_folder).await.unwrap();

    let rsp = server
        .search(
            &ctx(),
            EntitySearchRequest {
                folder: "f1".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rsp.results.len(), 1);
    assert_eq!(rsp.results[0].guid, p2.guid);

    let rsp = server
        .search(
            &ctx(),
            EntitySearchRequest {
                kind: vec!["playlist".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rsp.results.len(), 2);

    let rsp = server
        .search(
            &ctx(),
            EntitySearchRequest {
                kind: vec!["dashboard".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(rsp.results.is_empty());
}

#[tokio::test]
async fn test_meta_labels_merge_into_summary() {
    let (server, db) = setup().await;

    let mut req = write_req("p1", json!({"title": "t", "labels": {"env": "prod"}}));
    req.meta = serde_json::to_vec(&json!({"labels": {"team": "a"}})).unwrap();
    let rsp = server.write(&ctx(), req).await.unwrap();

    assert_eq!(count_rows(&db, "entity_labels", &rsp.guid).await, 2);

    let mut labels = HashMap::new();
    labels.insert("env".to_string(), "prod".to_string());
    labels.insert("team".to_string(), "a".to_string());
    let found = server
        .search(
            &ctx(),
            EntitySearchRequest {
                labels,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(found.results.len(), 1);
}

#[tokio::test]
async fn test_clear_history() {
    let (server, db) = setup().await;

    let first = server
        .write(&ctx(), write_req("p1", json!({"title": "a"})))
        .await
        .unwrap();
    sleep(Duration::from_millis(5)).await;
    server
        .write(&ctx(), write_req("p1", json!({"title": "b"})))
        .await
        .unwrap();

    let created_at = server.read(&ctx(), read_req("p1")).await.unwrap().created_at;

    let rsp = server
        .admin_write(
            &ctx(),
            AdminWriteEntityRequest {
                grn: Some(playlist_grn("p1")),
                body: serde_json::to_vec(&json!({"title": "c"})).unwrap(),
                clear_history: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rsp.status, WriteStatus::Created);
    assert_ne!(rsp.guid, first.guid);

    assert_eq!(count_rows(&db, "entity_history", &rsp.guid).await, 1);
    assert_eq!(count_rows(&db, "entity_history", &first.guid).await, 0);

    // Original creation metadata survives the rewrite.
    let entity = server.read(&ctx(), read_req("p1")).await.unwrap();
    assert_eq!(entity.created_at, created_at);
}

#[tokio::test]
async fn test_nested_children_indexed() {
    let (server, db) = setup().await;

    let body = json!({
        "title": "t",
        "nested": [
            {"kind": "playlist-item", "uid": "i1", "name": "First", "labels": {"pos": "0"}},
            {"kind": "playlist-item", "uid": "i2", "name": "Second", "labels": {"pos": "1"}},
        ],
    });
    let rsp = server.write(&ctx(), write_req("p1", body)).await.unwrap();

    assert_eq!(count_rows(&db, "entity_nested", &rsp.guid).await, 2);

    // Child labels are keyed by the child GRN, so they never leak into
    // the top-level conjunction count.
    let stmt = db.dialect().statement(
        "SELECT COUNT(*) FROM entity_labels WHERE parent_grn=?".to_string(),
        vec!["1..playlist.p1".into()],
    );
    let row = db
        .connection()
        .query_one(stmt)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.try_get_by_index::<i64>(0).unwrap(), 2);

    let mut labels = HashMap::new();
    labels.insert("pos".to_string(), "0".to_string());
    let found = server
        .search(
            &ctx(),
            EntitySearchRequest {
                labels,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(found.results.is_empty());
}

#[tokio::test]
async fn test_folder_tree() {
    let (server, db) = setup().await;

    let root = WriteEntityRequest {
        grn: Some(Grn::new(0, STANDARD_KIND_FOLDER, "a")),
        body: serde_json::to_vec(&json!({"title": "A"})).unwrap(),
        ..Default::default()
    };
    server.write(&ctx(), root).await.unwrap();

    let child = WriteEntityRequest {
        grn: Some(Grn::new(0, STANDARD_KIND_FOLDER, "b")),
        folder: "a".to_string(),
        body: serde_json::to_vec(&json!({"title": "B"})).unwrap(),
        ..Default::default()
    };
    server.write(&ctx(), child).await.unwrap();

    let stmt = db.dialect().statement(
        "SELECT slug_path,tree,depth,detached FROM entity_folder_tree WHERE (tenant_id=? AND uid=?)"
            .to_string(),
        vec![1i64.into(), "b".into()],
    );
    let row = db
        .connection()
        .query_one(stmt)
        .await
        .unwrap()
        .expect("tree row for b");
    assert_eq!(row.try_get_by_index::<String>(0).unwrap(), "/a/b/");
    assert_eq!(row.try_get_by_index::<String>(1).unwrap(), r#"["a","b"]"#);
    assert_eq!(row.try_get_by_index::<i64>(2).unwrap(), 2);
    assert!(!row.try_get_by_index::<bool>(3).unwrap());

    // Deleting the parent leaves the child detached.
    server
        .delete(
            &ctx(),
            DeleteEntityRequest {
                grn: Some(Grn::new(0, STANDARD_KIND_FOLDER, "a")),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let stmt = db.dialect().statement(
        "SELECT detached FROM entity_folder_tree WHERE (tenant_id=? AND uid=?)".to_string(),
        vec![1i64.into(), "b".into()],
    );
    let row = db
        .connection()
        .query_one(stmt)
        .await
        .unwrap()
        .expect("tree row for b after delete");
    assert!(row.try_get_by_index::<bool>(0).unwrap());
}

#[tokio::test]
async fn test_unsupported_kind() {
    let (server, _db) = setup().await;

    let req = WriteEntityRequest {
        grn: Some(Grn::new(0, "dashboard", "d1")),
        body: serde_json::to_vec(&json!({"title": "t"})).unwrap(),
        ..Default::default()
    };
    let err = server.write(&ctx(), req).await.unwrap_err();
    assert!(matches!(err, EntityError::UnsupportedKind(_)));
}

#[tokio::test]
async fn test_invalid_identifiers_rejected() {
    let (server, _db) = setup().await;

    for name in ["bad#name", "bad?name", "bad@name", "bad$name"] {
        let err = server
            .write(&ctx(), write_req(name, json!({"title": "t"})))
            .await
            .unwrap_err();
        assert!(matches!(err, EntityError::InvalidInput(_)), "{}", name);
    }

    let err = server
        .write(&ctx(), write_req(&"x".repeat(65), json!({"title": "t"})))
        .await
        .unwrap_err();
    assert!(matches!(err, EntityError::InvalidInput(_)));
}

#[tokio::test]
async fn test_unimplemented_surfaces() {
    let (server, _db) = setup().await;

    let err = server.watch(&ctx()).await.unwrap_err();
    assert!(matches!(err, EntityError::Unimplemented(_)));

    let err = server
        .search(
            &ctx(),
            EntitySearchRequest {
                sort: vec!["name".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EntityError::Unimplemented(_)));

    let err = server
        .history(
            &ctx(),
            EntityHistoryRequest {
                grn: Some(playlist_grn("p1")),
                next_page_token: "token".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EntityError::Unimplemented(_)));
}

#[tokio::test]
async fn test_version_tracks_latest_history() {
    let (server, db) = setup().await;

    for title in ["a", "b", "c"] {
        server
            .write(&ctx(), write_req("p1", json!({"title": title})))
            .await
            .unwrap();
    }

    let entity = server.read(&ctx(), read_req("p1")).await.unwrap();
    let stmt = db.dialect().statement(
        "SELECT MAX(version) FROM entity_history WHERE guid=?".to_string(),
        vec![entity.guid.as_str().into()],
    );
    let row = db
        .connection()
        .query_one(stmt)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.try_get_by_index::<String>(0).unwrap(), entity.version);
}
