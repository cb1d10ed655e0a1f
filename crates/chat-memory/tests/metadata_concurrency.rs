mod common;

use chat_memory::memory_db::{CreateSessionRequest, MessageUpdate, MetadataDocument, UpdateSessionRequest};
use chat_memory::MemoryError;
use common::{conversation, file_db};
use serde_json::json;
use std::sync::Arc;

const WRITERS: usize = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_message_merges_keep_every_key() {
    let (_dir, db, scope) = file_db();
    db.sessions
        .create(&scope, &CreateSessionRequest { session_id: "s1".into(), ..Default::default() })
        .unwrap();
    let message = db.messages.create_many(&scope, "s1", &conversation(1)).unwrap().remove(0);

    let mut handles = Vec::new();
    for i in 0..WRITERS {
        let db = Arc::clone(&db);
        let scope = scope.clone();
        handles.push(tokio::spawn(async move {
            let update = MessageUpdate {
                uuid: message.uuid,
                metadata: Some(MetadataDocument::new().with(format!("writer_{}", i), json!(i))),
                ..Default::default()
            };
            db.messages.update(&scope, update, false).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let merged = db.messages.get(&scope, &message.uuid).unwrap();
    for i in 0..WRITERS {
        assert_eq!(merged.metadata.get(&format!("writer_{}", i)), Some(&json!(i)));
    }
    assert_eq!(merged.metadata_version, WRITERS as i64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_session_merges_keep_every_key() {
    let (_dir, db, scope) = file_db();
    db.sessions
        .create(&scope, &CreateSessionRequest { session_id: "s1".into(), ..Default::default() })
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..WRITERS {
        let db = Arc::clone(&db);
        let scope = scope.clone();
        handles.push(tokio::spawn(async move {
            let request = UpdateSessionRequest {
                session_id: "s1".into(),
                metadata: Some(MetadataDocument::new().with(format!("k{}", i), json!(true))),
                ..Default::default()
            };
            db.sessions.update(&scope, &request, false).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let session = db.sessions.get(&scope, "s1").unwrap();
    assert_eq!(session.metadata.len(), WRITERS);
    assert_eq!(session.metadata_version, WRITERS as i64);
}

#[tokio::test]
async fn protected_namespace_needs_privilege() {
    let (_dir, db, scope) = file_db();
    db.sessions
        .create(&scope, &CreateSessionRequest { session_id: "s1".into(), ..Default::default() })
        .unwrap();
    let message = db.messages.create_many(&scope, "s1", &conversation(1)).unwrap().remove(0);
    let update = MessageUpdate {
        uuid: message.uuid,
        metadata: Some(MetadataDocument::new().with("system", json!({"pinned": true}))),
        ..Default::default()
    };

    let err = db.messages.update(&scope, update.clone(), false).await.unwrap_err();
    assert!(matches!(err, MemoryError::Unauthorized(_)));

    let updated = db.messages.update(&scope, update, true).await.unwrap();
    assert_eq!(updated.metadata.get("system"), Some(&json!({"pinned": true})));
}
