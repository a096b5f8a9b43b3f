//! Upload, retrieval and embedding-outage behaviour through the REST
//! surface.

mod helpers;

use helpers::{client, daemon_state, spawn_daemon, spawn_embed_stub, TEST_TOKEN};
use serde_json::json;

#[tokio::test]
async fn upload_chunks_and_retrieves() {
    let embed_url = spawn_embed_stub().await;
    let state = daemon_state(&embed_url);
    let base = spawn_daemon(state).await;
    let http = client();

    let text = "alpha beta gamma delta ".repeat(200);
    let form = reqwest::multipart::Form::new().part(
        "files",
        reqwest::multipart::Part::bytes(text.clone().into_bytes()).file_name("corpus.txt"),
    );
    let response = http
        .post(format!("{}/api/rag/upload", base))
        .header("x-daemon-token", TEST_TOKEN)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    let report = &body["results"][0];
    assert_eq!(report["title"], "corpus.txt");
    assert!(report["chunkCount"].as_u64().unwrap() > 1);
    assert_eq!(report["skipped"], false);

    // Every stored chunk respects the window size.
    let documents: serde_json::Value = http
        .get(format!("{}/api/rag/documents", base))
        .header("x-daemon-token", TEST_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let doc_id = documents["documents"][0]["id"].as_str().unwrap();
    let chunks: serde_json::Value = http
        .get(format!("{}/api/rag/documents/{}/chunks", base, doc_id))
        .header("x-daemon-token", TEST_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    for chunk in chunks["chunks"].as_array().unwrap() {
        assert!(chunk["content"].as_str().unwrap().chars().count() <= 1000);
    }

    // Retrieval: top hit contains the query words, context has the header.
    let response = http
        .post(format!("{}/api/rag/search", base))
        .header("x-daemon-token", TEST_TOKEN)
        .json(&json!({"query": "beta gamma", "topK": 2, "minScore": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    let hits = body["hits"].as_array().unwrap();
    assert!(!hits.is_empty());
    assert!(hits.len() <= 2);
    assert!(hits[0]["snippet"].as_str().unwrap().contains("beta gamma"));
    assert!(body["contextPreview"]
        .as_str()
        .unwrap()
        .starts_with("Relevant Context (RAG):"));
}

#[tokio::test]
async fn duplicate_titles_follow_the_if_exists_policy() {
    let embed_url = spawn_embed_stub().await;
    let state = daemon_state(&embed_url);
    let store = state.store.clone();
    let base = spawn_daemon(state).await;
    let http = client();

    let upload = |mode: &'static str| {
        let base = base.clone();
        let http = http.clone();
        async move {
            let form = reqwest::multipart::Form::new()
                .part(
                    "files",
                    reqwest::multipart::Part::bytes(b"alpha beta gamma".to_vec())
                        .file_name("Notes.txt"),
                )
                .text("ifExists", mode);
            http.post(format!("{}/api/rag/upload", base))
                .header("x-daemon-token", TEST_TOKEN)
                .multipart(form)
                .send()
                .await
                .unwrap()
                .json::<serde_json::Value>()
                .await
                .unwrap()
        }
    };

    let first = upload("skip").await;
    assert_eq!(first["results"][0]["skipped"], false);

    // skip: case-insensitive title match drops the re-upload.
    let second = upload("skip").await;
    assert_eq!(second["results"][0]["skipped"], true);
    assert_eq!(store.documents.list_documents(None).unwrap().len(), 1);

    // allow: inserts a second document with the same title.
    let third = upload("allow").await;
    assert_eq!(third["results"][0]["skipped"], false);
    assert_eq!(store.documents.list_documents(None).unwrap().len(), 2);

    // replace: deletes both and inserts one.
    let fourth = upload("replace").await;
    assert_eq!(fourth["results"][0]["skipped"], false);
    assert_eq!(store.documents.list_documents(None).unwrap().len(), 1);
}

#[tokio::test]
async fn embedding_outage_is_503_and_leaves_corpus_queryable() {
    // A live stub first, so something is in the corpus.
    let embed_url = spawn_embed_stub().await;
    let state = daemon_state(&embed_url);
    let store = state.store.clone();
    let rag = state.rag.clone();
    rag.ingest_text(
        "seeded.txt",
        "alpha beta gamma",
        consultd::store::schema::SourceType::Upload,
        None,
        Some("text/plain"),
        None,
    )
    .await
    .unwrap();
    assert_eq!(store.documents.embedding_count().unwrap(), 1);

    // Now a daemon pointed at a dead embed port.
    let dead_state = daemon_state("http://127.0.0.1:9/embed");
    let dead_store = dead_state.store.clone();
    let base = spawn_daemon(dead_state).await;
    let http = client();

    let form = reqwest::multipart::Form::new().part(
        "files",
        reqwest::multipart::Part::bytes(b"some text".to_vec()).file_name("x.txt"),
    );
    let response = http
        .post(format!("{}/api/rag/upload", base))
        .header("x-daemon-token", TEST_TOKEN)
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    // Nothing half-written.
    assert!(dead_store.documents.list_documents(None).unwrap().is_empty());

    // Search against the dead service surfaces the outage too.
    let response = http
        .post(format!("{}/api/rag/search", base))
        .header("x-daemon-token", TEST_TOKEN)
        .json(&json!({"query": "beta"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    // The previously embedded corpus is still queryable once the service
    // is back (same store, live client).
    let retrieval = rag
        .retrieve(
            "beta gamma",
            &consultd::rag::RetrieveFilters {
                min_score: Some(0.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(!retrieval.hits.is_empty());
}

#[tokio::test]
async fn memory_notes_are_retrievable_documents() {
    let embed_url = spawn_embed_stub().await;
    let state = daemon_state(&embed_url);
    let store = state.store.clone();
    let base = spawn_daemon(state).await;
    let http = client();

    let response = http
        .post(format!("{}/api/rag/memory", base))
        .header("x-daemon-token", TEST_TOKEN)
        .json(&json!({
            "category": "db",
            "title": "wal mode",
            "content": "the store keeps its journal in wal mode",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Memory row plus mirror document with the Memory: prefix.
    assert_eq!(store.memories.list(None).unwrap().len(), 1);
    let docs = store.documents.list_documents(None).unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].title, "Memory: wal mode");
    assert_eq!(docs[0].source_type, consultd::store::schema::SourceType::Manual);

    // And it comes back through retrieval.
    let response = http
        .post(format!("{}/api/rag/search", base))
        .header("x-daemon-token", TEST_TOKEN)
        .json(&json!({"query": "journal wal", "minScore": 0}))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(!body["hits"].as_array().unwrap().is_empty());
    assert_eq!(body["hits"][0]["sourceType"], "manual");
}

#[tokio::test]
async fn min_score_above_best_hit_returns_empty_context() {
    let embed_url = spawn_embed_stub().await;
    let state = daemon_state(&embed_url);
    let rag = state.rag.clone();
    rag.ingest_text(
        "doc.txt",
        "alpha beta gamma",
        consultd::store::schema::SourceType::Upload,
        None,
        None,
        None,
    )
    .await
    .unwrap();

    let retrieval = rag
        .retrieve(
            "alpha beta gamma",
            &consultd::rag::RetrieveFilters {
                min_score: Some(1.5),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(retrieval.hits.is_empty());
    assert!(retrieval.context.is_none());
}

#[tokio::test]
async fn folders_scope_listing_and_retrieval() {
    let embed_url = spawn_embed_stub().await;
    let state = daemon_state(&embed_url);
    let rag = state.rag.clone();
    let base = spawn_daemon(state).await;
    let http = client();

    rag.ingest_text(
        "a.txt",
        "alpha beta",
        consultd::store::schema::SourceType::Upload,
        None,
        None,
        Some("specs"),
    )
    .await
    .unwrap();
    rag.ingest_text(
        "b.txt",
        "gamma delta",
        consultd::store::schema::SourceType::Upload,
        None,
        None,
        None,
    )
    .await
    .unwrap();

    let folders: serde_json::Value = http
        .get(format!("{}/api/rag/folders", base))
        .header("x-daemon-token", TEST_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(folders["folders"], json!(["specs"]));

    let scoped: serde_json::Value = http
        .get(format!("{}/api/rag/documents?folder=specs", base))
        .header("x-daemon-token", TEST_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(scoped["documents"].as_array().unwrap().len(), 1);

    // Deleting the folder unfiles its documents but keeps them.
    let response = http
        .delete(format!("{}/api/rag/folders/specs", base))
        .header("x-daemon-token", TEST_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let all: serde_json::Value = http
        .get(format!("{}/api/rag/documents", base))
        .header("x-daemon-token", TEST_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all["documents"].as_array().unwrap().len(), 2);
}
