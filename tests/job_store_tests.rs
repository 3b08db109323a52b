//! Job store behaviour against a migrated SQLite database.

mod test_utils;

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use media_downloads::models::download_job::{FailureClass, JobKind, JobStatus};
use media_downloads::repositories::{JobStore, JobStoreError, JobUpdate, NewJob};
use test_utils::setup_test_db;
use uuid::Uuid;

fn scene(user: &str, scene_id: &str) -> NewJob {
    NewJob {
        user_id: user.to_string(),
        kind: JobKind::Scene,
        source_entity_id: scene_id.to_string(),
        source_entity_ids: None,
        max_attempts: 3,
    }
}

async fn store() -> Result<JobStore> {
    Ok(JobStore::new(setup_test_db().await?))
}

#[tokio::test]
async fn create_starts_pending_with_zero_attempts() -> Result<()> {
    let store = store().await?;
    let job = store.create(scene("alice", "42")).await?;

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.progress_bytes, 0);
    assert_eq!(job.items_total, 1);
    assert!(job.file_path.is_none());
    assert!(job.started_at.is_none());
    Ok(())
}

#[tokio::test]
async fn playlist_rows_count_their_items() -> Result<()> {
    let store = store().await?;
    let job = store
        .create(NewJob {
            user_id: "alice".into(),
            kind: JobKind::Playlist,
            source_entity_id: "p1".into(),
            source_entity_ids: Some(vec!["a".into(), "b".into(), "c".into()]),
            max_attempts: 3,
        })
        .await?;

    assert_eq!(job.items_total, 3);
    assert_eq!(job.fetch_targets(), vec!["a", "b", "c"]);
    Ok(())
}

#[tokio::test]
async fn active_duplicate_is_rejected_until_terminal() -> Result<()> {
    let store = store().await?;
    let first = store.create(scene("alice", "42")).await?;

    let duplicate = store.create(scene("alice", "42")).await;
    assert!(matches!(duplicate, Err(JobStoreError::Duplicate)));

    // Other users and other items are unaffected.
    store.create(scene("bob", "42")).await?;
    store.create(scene("alice", "43")).await?;

    store
        .transition(first.id, JobStatus::Pending, JobUpdate::admit(Utc::now()))
        .await?;
    let duplicate = store.create(scene("alice", "42")).await;
    assert!(matches!(duplicate, Err(JobStoreError::Duplicate)));

    store
        .transition(
            first.id,
            JobStatus::Downloading,
            JobUpdate::fail(1, "gone".into(), FailureClass::PermanentRemote),
        )
        .await?;

    let again = store.create(scene("alice", "42")).await?;
    assert_ne!(again.id, first.id);
    Ok(())
}

#[tokio::test]
async fn transition_is_compare_and_swap() -> Result<()> {
    let store = store().await?;
    let job = store.create(scene("alice", "42")).await?;

    let admitted = store
        .transition(job.id, JobStatus::Pending, JobUpdate::admit(Utc::now()))
        .await?;
    assert_eq!(admitted.status, JobStatus::Downloading);
    assert!(admitted.started_at.is_some());

    // A second admitter loses the race.
    let lost = store
        .transition(job.id, JobStatus::Pending, JobUpdate::admit(Utc::now()))
        .await;
    match lost {
        Err(JobStoreError::Conflict { expected, actual }) => {
            assert_eq!(expected, JobStatus::Pending);
            assert_eq!(actual, JobStatus::Downloading);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let missing = store
        .transition(Uuid::new_v4(), JobStatus::Pending, JobUpdate::admit(Utc::now()))
        .await;
    assert!(matches!(missing, Err(JobStoreError::NotFound(_))));
    Ok(())
}

#[tokio::test]
async fn illegal_edges_are_refused_without_touching_the_row() -> Result<()> {
    let store = store().await?;
    let job = store.create(scene("alice", "42")).await?;

    let result = store
        .transition(
            job.id,
            JobStatus::Pending,
            JobUpdate::complete("/tmp/x".into(), 10, 1, Utc::now()),
        )
        .await;
    assert!(matches!(
        result,
        Err(JobStoreError::IllegalTransition {
            from: JobStatus::Pending,
            to: JobStatus::Completed
        })
    ));

    let unchanged = store.get(job.id, "alice").await?;
    assert_eq!(unchanged.status, JobStatus::Pending);
    assert!(unchanged.file_path.is_none());
    Ok(())
}

#[tokio::test]
async fn completion_records_path_and_clears_errors() -> Result<()> {
    let store = store().await?;
    let job = store.create(scene("alice", "42")).await?;
    store
        .transition(job.id, JobStatus::Pending, JobUpdate::admit(Utc::now()))
        .await?;
    store
        .transition(
            job.id,
            JobStatus::Downloading,
            JobUpdate::progress(512, Some(2_048), 0),
        )
        .await?;

    let done = store
        .transition(
            job.id,
            JobStatus::Downloading,
            JobUpdate::complete("/data/x/scene-42.mp4".into(), 2_048, 1, Utc::now()),
        )
        .await?;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress_bytes, 2_048);
    assert_eq!(done.total_bytes, Some(2_048));
    assert_eq!(done.file_path.as_deref(), Some("/data/x/scene-42.mp4"));
    assert!(done.completed_at.is_some());
    assert!(done.error_message.is_none());
    Ok(())
}

#[tokio::test]
async fn reads_and_deletes_are_scoped_to_the_owner() -> Result<()> {
    let store = store().await?;
    let job = store.create(scene("alice", "42")).await?;

    assert!(matches!(
        store.get(job.id, "bob").await,
        Err(JobStoreError::NotFound(_))
    ));
    assert!(matches!(
        store.delete(job.id, "bob").await,
        Err(JobStoreError::NotFound(_))
    ));
    assert!(store.list_for_user("bob").await?.is_empty());

    store.delete(job.id, "alice").await?;
    assert!(store.find(job.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn list_is_newest_first() -> Result<()> {
    let store = store().await?;
    let mut ids = Vec::new();
    for scene_id in ["1", "2", "3"] {
        ids.push(store.create(scene("alice", scene_id)).await?.id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let listed: Vec<Uuid> = store
        .list_for_user("alice")
        .await?
        .into_iter()
        .map(|job| job.id)
        .collect();
    ids.reverse();
    assert_eq!(listed, ids);
    Ok(())
}

#[tokio::test]
async fn eligible_pending_waits_out_backoff() -> Result<()> {
    let store = store().await?;
    let ready = store.create(scene("alice", "ready")).await?;
    let backing_off = store.create(scene("alice", "later")).await?;

    store
        .transition(
            backing_off.id,
            JobStatus::Pending,
            JobUpdate::admit(Utc::now()),
        )
        .await?;
    let retry_at = Utc::now() + chrono::Duration::seconds(60);
    store
        .transition(
            backing_off.id,
            JobStatus::Downloading,
            JobUpdate::requeue(1, retry_at, "reset".into(), FailureClass::Transient),
        )
        .await?;

    let now_ids: Vec<Uuid> = store
        .eligible_pending_for_user("alice", Utc::now(), 10)
        .await?
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(now_ids, vec![ready.id]);

    let later = store
        .eligible_pending_for_user("alice", retry_at + chrono::Duration::seconds(1), 10)
        .await?;
    assert_eq!(later.len(), 2);
    assert!(
        store
            .eligible_pending_for_user("bob", Utc::now(), 10)
            .await?
            .is_empty()
    );

    let next = store.next_retry_at().await?.expect("a pending deadline");
    assert_eq!(next.timestamp(), retry_at.timestamp());
    Ok(())
}

#[tokio::test]
async fn waiting_users_follow_their_oldest_eligible_job() -> Result<()> {
    let store = store().await?;
    for scene_id in 0..5 {
        store.create(scene("alice", &scene_id.to_string())).await?;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    store.create(scene("bob", "1")).await?;
    tokio::time::sleep(Duration::from_millis(2)).await;
    let carol = store.create(scene("carol", "1")).await?;

    // Carol's only job is backing off.
    store
        .transition(carol.id, JobStatus::Pending, JobUpdate::admit(Utc::now()))
        .await?;
    store
        .transition(
            carol.id,
            JobStatus::Downloading,
            JobUpdate::requeue(
                1,
                Utc::now() + chrono::Duration::seconds(60),
                "reset".into(),
                FailureClass::Transient,
            ),
        )
        .await?;

    let users = store.waiting_users(Utc::now(), &[], 10).await?;
    assert_eq!(users, vec!["alice", "bob"]);

    // However long a user's backlog, excluding it exposes the others.
    let users = store
        .waiting_users(Utc::now(), &["alice".to_string()], 1)
        .await?;
    assert_eq!(users, vec!["bob"]);

    assert_eq!(store.waiting_users(Utc::now(), &[], 1).await?, vec!["alice"]);
    Ok(())
}

#[tokio::test]
async fn downloading_counts_group_by_user() -> Result<()> {
    let store = store().await?;
    for (user, scene_id) in [("alice", "1"), ("alice", "2"), ("bob", "1"), ("bob", "2")] {
        let job = store.create(scene(user, scene_id)).await?;
        if scene_id == "1" || user == "alice" {
            store
                .transition(job.id, JobStatus::Pending, JobUpdate::admit(Utc::now()))
                .await?;
        }
    }

    let counts = store.downloading_counts().await?;
    assert_eq!(counts.get("alice"), Some(&2));
    assert_eq!(counts.get("bob"), Some(&1));
    assert_eq!(store.count_by_status(JobStatus::Pending).await?, 1);
    Ok(())
}

#[tokio::test]
async fn statuses_and_conditional_delete() -> Result<()> {
    let store = store().await?;
    let job = store.create(scene("alice", "42")).await?;
    let gone = Uuid::new_v4();

    let statuses = store.statuses(&[job.id, gone]).await?;
    assert_eq!(statuses.get(&job.id), Some(&JobStatus::Pending));
    assert!(!statuses.contains_key(&gone));

    assert!(!store.delete_if_status(job.id, JobStatus::Completed).await?);
    assert!(store.delete_if_status(job.id, JobStatus::Pending).await?);
    assert!(store.statuses(&[job.id]).await?.is_empty());
    Ok(())
}
