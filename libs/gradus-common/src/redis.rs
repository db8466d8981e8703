use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

use crate::types::{Submission, SubmissionResult, SubmissionStatus, TestResult};

/// Redis key semantics - defines only semantics, not runtime logic.
/// Ensures every engine process derives identical keys, so the shared
/// submission queue, stored results, and the per-language sandbox slots
/// never drift between instances.

pub const QUEUE_KEY: &str = "gradus:queue";
pub const RESULT_PREFIX: &str = "gradus:result";
pub const TEST_RESULTS_PREFIX: &str = "gradus:tests";
pub const STATUS_PREFIX: &str = "gradus:status";
pub const SLOT_PREFIX: &str = "gradus:slot";
pub const RELEASE_PREFIX: &str = "gradus:release";

/// TTL applied to stored results and statuses. SETEX takes its seconds
/// as u64 while EXPIRE takes i64, so the EXPIRE call site casts.
pub const RESULT_TTL_SECONDS: u64 = 86400;

/// Key holding the aggregate result of a submission.
pub fn result_key(submission_id: &Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, submission_id)
}

/// Key of the list receiving per-test results as they are produced.
pub fn test_results_key(submission_id: &Uuid) -> String {
    format!("{}:{}", TEST_RESULTS_PREFIX, submission_id)
}

/// Key holding the queue-level status of a submission.
pub fn status_key(submission_id: &Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, submission_id)
}

/// Key of the per-language sandbox slot record.
pub fn slot_key(language: &str) -> String {
    format!("{}:{}", SLOT_PREFIX, language)
}

/// Channel carrying release notifications for a language's slot.
pub fn release_channel(language: &str) -> String {
    format!("{}:{}", RELEASE_PREFIX, language)
}

/// Enqueue a submission for the engine fleet.
/// Uses RPUSH for FIFO semantics.
pub async fn push_submission(
    conn: &mut redis::aio::ConnectionManager,
    submission: &Submission,
) -> RedisResult<()> {
    let payload = serde_json::to_string(submission)
        .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string())))?;

    conn.rpush(QUEUE_KEY, payload).await
}

/// Pop the next submission off the shared queue.
/// Uses BLPOP with timeout for graceful shutdown.
pub async fn pop_submission(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<Submission>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let submission: Submission = serde_json::from_str(&payload)
                .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string())))?;
            Ok(Some(submission))
        }
        None => Ok(None),
    }
}

/// Record the queue-level status of a submission.
pub async fn store_status(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &Uuid,
    status: &SubmissionStatus,
) -> RedisResult<()> {
    let key = status_key(submission_id);
    let payload = serde_json::to_string(status)
        .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string())))?;

    let _: () = conn.set_ex(&key, payload, RESULT_TTL_SECONDS).await?;
    Ok(())
}

/// Append one test result to the submission's result list the moment it
/// is produced, so partial progress survives a later crash.
pub async fn push_test_result(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &Uuid,
    result: &TestResult,
) -> RedisResult<()> {
    let key = test_results_key(submission_id);
    let payload = serde_json::to_string(result)
        .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string())))?;

    let _: () = conn.rpush(&key, payload).await?;
    let _: () = conn.expire(&key, RESULT_TTL_SECONDS as i64).await?;
    Ok(())
}

/// Store the aggregate result with a 24-hour TTL, plus the status
/// separately for quick lookup.
pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    result: &SubmissionResult,
) -> RedisResult<()> {
    let key = result_key(&result.submission_id);
    let payload = serde_json::to_string(result)
        .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string())))?;

    let _: () = conn.set_ex(&key, payload, RESULT_TTL_SECONDS).await?;

    store_status(conn, &result.submission_id, &result.status).await
}

/// Retrieve the aggregate result of a submission.
pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    submission_id: &Uuid,
) -> RedisResult<Option<SubmissionResult>> {
    let key = result_key(submission_id);
    let payload: Option<String> = conn.get(&key).await?;

    match payload {
        Some(data) => {
            let result: SubmissionResult = serde_json::from_str(&data)
                .map_err(|e| redis::RedisError::from((redis::ErrorKind::TypeError, "deserialization error", e.to_string())))?;
            Ok(Some(result))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SubmissionMetadata, SubmissionStatus};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_slot_and_release_naming() {
        assert_eq!(slot_key("c"), "gradus:slot:c");
        assert_eq!(slot_key("python"), "gradus:slot:python");
        assert_eq!(release_channel("java"), "gradus:release:java");
    }

    #[test]
    fn test_result_ttl_fits_expiry_arguments() {
        // Pinned as u64 for SETEX; the EXPIRE cast must stay lossless.
        let seconds: u64 = RESULT_TTL_SECONDS;
        assert_eq!(seconds, 86_400);
        assert_eq!(i64::try_from(RESULT_TTL_SECONDS).unwrap(), 86_400);
    }

    #[test]
    fn test_result_key_deterministic() {
        let id = Uuid::new_v4();
        let key1 = result_key(&id);
        let key2 = result_key(&id);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("gradus:result:"));
    }

    #[test]
    fn test_status_and_test_results_key_format() {
        let id = Uuid::new_v4();
        assert!(status_key(&id).starts_with("gradus:status:"));
        assert!(test_results_key(&id).contains(&id.to_string()));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_result_round_trip() {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let mut conn = redis::aio::ConnectionManager::new(client).await.unwrap();

        let result = SubmissionResult {
            submission_id: Uuid::new_v4(),
            language: "c".to_string(),
            status: SubmissionStatus::Completed,
            metadata: SubmissionMetadata::default(),
            results: vec![crate::types::TestResult::passed("t1")],
            finished_at: Utc::now(),
        };

        store_result(&mut conn, &result).await.unwrap();
        let fetched = get_result(&mut conn, &result.submission_id)
            .await
            .unwrap()
            .expect("stored result should be readable");
        assert_eq!(fetched.submission_id, result.submission_id);
        assert_eq!(fetched.results.len(), 1);
    }
}
