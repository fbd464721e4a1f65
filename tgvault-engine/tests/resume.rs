use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tempfile::tempdir;
use tgvault_engine::pipeline::{NamePolicy, Pipeline, PipelineError};
use tgvault_engine::storage::Cipher;
use tgvault_engine::transport::{MemoryTransport, TransportError};
use tgvault_engine::{IndexStore, ResumeOutcome};

const KIB: usize = 1024;

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

fn make_pipeline(index: IndexStore, transport: &MemoryTransport, spill: &Path) -> Pipeline {
    Pipeline::new(
        index,
        Arc::new(transport.clone()),
        Cipher::with_rounds("pw", 1_000),
        spill,
    )
}

#[tokio::test]
async fn interrupted_upload_resumes_after_restart() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("index.db");
    let spill = dir.path().join("spill");
    let transport = MemoryTransport::new(49 * KIB);
    let data = random_bytes(120 * KIB, 21);

    // first process: dies after the second chunk is committed
    {
        let index = IndexStore::open(&db).await.unwrap();
        transport.fail_sends_after(2);
        let err = make_pipeline(index.clone(), &transport, &spill)
            .upload_bytes("big.bin", data.clone(), NamePolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Transport(TransportError::Unavailable(_))
        ));
        assert!(index.list_files().await.unwrap().is_empty());
        index.close().await;
    }
    transport.heal();
    assert_eq!(transport.sent_count(), 2);

    // second process
    let index = IndexStore::open(&db).await.unwrap();
    let pipeline = make_pipeline(index.clone(), &transport, &spill);
    let resume = pipeline.resume_manager();
    let pending = resume.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!((pending[0].uploaded_chunks, pending[0].total_chunks), (2, 3));
    assert_eq!(transport.sent_count(), 2, "listing must not touch the network");

    let file = match resume.resume(pending[0].id).await.unwrap() {
        ResumeOutcome::Completed(file) => file,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(transport.sent_count(), 3);
    assert_eq!(file.chunk_count, 3);
    assert_eq!(index.list_chunks(file.id).await.unwrap().len(), 3);
    assert!(resume.list_pending().await.unwrap().is_empty());
    assert!(!Path::new(&pending[0].spill_dir).exists());
    assert_eq!(pipeline.download_bytes(&file).await.unwrap(), data);
}

#[tokio::test]
async fn reuploading_the_same_content_continues_the_pending_entry() {
    let dir = tempdir().unwrap();
    let transport = MemoryTransport::new(4 * KIB);
    let index = IndexStore::in_memory().await.unwrap();
    let pipeline = make_pipeline(index, &transport, dir.path());
    let data = random_bytes(10 * KIB, 22);

    transport.fail_sends_after(1);
    assert!(
        pipeline
            .upload_bytes("a.bin", data.clone(), NamePolicy::Reject)
            .await
            .is_err()
    );
    transport.heal();

    let file = pipeline
        .upload_bytes("a.bin", data.clone(), NamePolicy::Reject)
        .await
        .unwrap();
    assert_eq!(transport.sent_count() as i64, file.chunk_count);
    assert_eq!(pipeline.download_bytes(&file).await.unwrap(), data);
}

#[tokio::test]
async fn missing_spill_file_is_skipped_and_entry_stays_pending() {
    let dir = tempdir().unwrap();
    let transport = MemoryTransport::new(4 * KIB);
    let index = IndexStore::in_memory().await.unwrap();
    let pipeline = make_pipeline(index.clone(), &transport, dir.path());

    transport.fail_sends_after(1);
    let _ = pipeline
        .upload_bytes("a.bin", random_bytes(10 * KIB, 23), NamePolicy::Reject)
        .await;
    transport.heal();

    let pending = index.list_pending().await.unwrap().remove(0);
    let chunks = index.list_pending_chunks(pending.id).await.unwrap();
    std::fs::remove_file(&chunks[1].spill_path).unwrap();

    let outcome = pipeline.resume_manager().resume(pending.id).await.unwrap();
    assert_eq!(
        outcome,
        ResumeOutcome::Incomplete {
            id: pending.id,
            uploaded: 2,
            total: 3,
            missing_spill: vec![1],
        }
    );
    assert!(index.list_files().await.unwrap().is_empty());
    assert_eq!(index.list_pending().await.unwrap().len(), 1);

    // uploading the same content again reports the same dead end
    let err = pipeline
        .upload_bytes("a.bin", random_bytes(10 * KIB, 23), NamePolicy::Reject)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Incomplete {
            uploaded: 2,
            total: 3,
            missing_spill: 1,
            ..
        }
    ));
    assert!(err.to_string().contains(&format!("clear pending upload {}", pending.id)));
}

#[tokio::test]
async fn clear_drops_ledger_and_spill_files() {
    let dir = tempdir().unwrap();
    let transport = MemoryTransport::new(4 * KIB);
    let index = IndexStore::in_memory().await.unwrap();
    let pipeline = make_pipeline(index.clone(), &transport, dir.path());

    transport.fail_sends_after(0);
    let _ = pipeline
        .upload_bytes("a.bin", random_bytes(10 * KIB, 24), NamePolicy::Reject)
        .await;
    let pending = index.list_pending().await.unwrap().remove(0);
    assert!(Path::new(&pending.spill_dir).exists());

    let resume = pipeline.resume_manager();
    assert!(resume.clear(pending.id).await.unwrap());
    assert!(!resume.clear(pending.id).await.unwrap());
    assert!(resume.list_pending().await.unwrap().is_empty());
    assert!(!Path::new(&pending.spill_dir).exists());
}

#[tokio::test]
async fn resume_all_completes_entries_in_order() {
    let dir = tempdir().unwrap();
    let transport = MemoryTransport::new(4 * KIB);
    let index = IndexStore::in_memory().await.unwrap();
    let pipeline = make_pipeline(index.clone(), &transport, dir.path());

    for (name, seed) in [("first.bin", 25), ("second.bin", 26)] {
        transport.fail_sends_after(0);
        let _ = pipeline
            .upload_bytes(name, random_bytes(6 * KIB, seed), NamePolicy::Reject)
            .await;
    }
    transport.heal();

    let results = pipeline.resume_manager().resume_all().await.unwrap();
    let names: Vec<_> = results.iter().map(|(p, _)| p.filename.as_str()).collect();
    assert_eq!(names, vec!["first.bin", "second.bin"]);
    assert!(
        results
            .iter()
            .all(|(_, r)| matches!(r, Ok(ResumeOutcome::Completed(_))))
    );
    assert_eq!(index.list_files().await.unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_pending_id_is_not_found() {
    let dir = tempdir().unwrap();
    let transport = MemoryTransport::new(4 * KIB);
    let pipeline = make_pipeline(IndexStore::in_memory().await.unwrap(), &transport, dir.path());
    assert!(pipeline.resume_manager().resume(42).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn pending_upload_under_another_name_is_replanned() {
    let dir = tempdir().unwrap();
    let transport = MemoryTransport::new(4 * KIB);
    let index = IndexStore::in_memory().await.unwrap();
    let pipeline = make_pipeline(index.clone(), &transport, dir.path());
    let data = random_bytes(10 * KIB, 25);

    transport.fail_sends_after(1);
    let _ = pipeline
        .upload_bytes("draft.bin", data.clone(), NamePolicy::Reject)
        .await;
    transport.heal();
    assert_eq!(index.list_pending().await.unwrap()[0].filename, "draft.bin");

    let file = pipeline
        .upload_bytes("final.bin", data.clone(), NamePolicy::Reject)
        .await
        .unwrap();
    assert_eq!(file.filename, "final.bin");
    assert!(index.list_pending().await.unwrap().is_empty());
    assert_eq!(pipeline.download_bytes(&file).await.unwrap(), data);
    assert!(pipeline.resolve("draft.bin").await.is_err());
}
