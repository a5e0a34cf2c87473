use chrono::{TimeZone, Utc};
use easel_core::{HistoryStore, NewRecord, NormalizedRequest, OutputFormat, RecordId};

fn request(prompt: &str, seed: u64) -> NormalizedRequest {
    NormalizedRequest {
        prompt: prompt.to_string(),
        negative_prompt: None,
        steps: 4,
        guidance_scale: 3.5,
        width: 512,
        height: 384,
        seed,
        output_format: OutputFormat::Png,
        model_id: "flux.1-schnell".to_string(),
    }
}

fn record_at(prompt: &str, seed: u64, secs: i64) -> NewRecord {
    NewRecord {
        request: request(prompt, seed),
        image: prompt.as_bytes().to_vec(),
        created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
    }
}

#[tokio::test]
async fn test_append_then_get_round_trips_fields() {
    let store = HistoryStore::open_in_memory().await.unwrap();
    let mut req = request("a lighthouse at dusk", u64::MAX - 3);
    req.negative_prompt = Some("fog".to_string());
    req.output_format = OutputFormat::Jpeg;

    let id = store
        .append(NewRecord::new(req.clone(), vec![1, 2, 3, 4]))
        .await
        .unwrap();
    let record = store.get(id).await.unwrap().unwrap();

    assert_eq!(record.id, id);
    assert_eq!(record.request, req);
    assert_eq!(record.image, vec![1, 2, 3, 4]);

    let summary = store.summary(id).await.unwrap().unwrap();
    assert_eq!(summary.image_size, 4);
    assert_eq!(summary.created_at, record.created_at);
}

#[tokio::test]
async fn test_list_is_newest_first() {
    let store = HistoryStore::open_in_memory().await.unwrap();
    let middle = store.append(record_at("middle", 2, 10)).await.unwrap();
    let oldest = store.append(record_at("oldest", 1, 0)).await.unwrap();
    let newest = store.append(record_at("newest", 3, 20)).await.unwrap();

    assert_eq!(store.list().await.unwrap(), vec![newest, middle, oldest]);
    let prompts: Vec<String> = store
        .list_summaries()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.request.prompt)
        .collect();
    assert_eq!(prompts, vec!["newest", "middle", "oldest"]);
}

#[tokio::test]
async fn test_equal_timestamps_list_later_insert_first() {
    let store = HistoryStore::open_in_memory().await.unwrap();
    let first = store.append(record_at("first", 1, 5)).await.unwrap();
    let second = store.append(record_at("second", 2, 5)).await.unwrap();

    assert_eq!(store.list().await.unwrap(), vec![second, first]);
}

#[tokio::test]
async fn test_delete_removes_record_and_blob() {
    let store = HistoryStore::open_in_memory().await.unwrap();
    let keep = store.append(record_at("keep", 1, 0)).await.unwrap();
    let gone = store.append(record_at("drop", 2, 1)).await.unwrap();
    assert_eq!(store.blob_count().await.unwrap(), 2);

    assert!(store.delete(gone).await.unwrap());
    assert!(store.get(gone).await.unwrap().is_none());
    assert!(store.load_image(gone).await.unwrap().is_none());
    assert_eq!(store.list().await.unwrap(), vec![keep]);
    assert_eq!(store.blob_count().await.unwrap(), 1);

    // Deleting twice or an unknown id is not an error.
    assert!(!store.delete(gone).await.unwrap());
    assert!(!store.delete(RecordId::new()).await.unwrap());
}

#[tokio::test]
async fn test_delete_all_empties_the_store() {
    let store = HistoryStore::open_in_memory().await.unwrap();
    for i in 0..5 {
        store.append(record_at("item", i, i as i64)).await.unwrap();
    }

    assert_eq!(store.delete_all().await.unwrap(), 5);
    assert!(store.list().await.unwrap().is_empty());
    assert_eq!(store.count().await.unwrap(), 0);
    assert_eq!(store.blob_count().await.unwrap(), 0);
    assert_eq!(store.delete_all().await.unwrap(), 0);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.sqlite");

    let id = {
        let store = HistoryStore::open(&path).await.unwrap();
        let id = store.append(record_at("persisted", 7, 0)).await.unwrap();
        store.close().await;
        id
    };

    let store = HistoryStore::open(&path).await.unwrap();
    let record = store.get(id).await.unwrap().unwrap();
    assert_eq!(record.request.prompt, "persisted");
    assert_eq!(record.request.seed, 7);
    assert_eq!(record.image, b"persisted".to_vec());
}

#[tokio::test]
async fn test_closed_store_reports_errors() {
    let store = HistoryStore::open_in_memory().await.unwrap();
    store.close().await;

    assert!(store.append(record_at("late", 1, 0)).await.is_err());
    assert!(store.list().await.is_err());
}
