//! Streams per-test results into Redis as the pipeline produces them,
//! so clients can poll progress before the aggregate result lands.

use async_trait::async_trait;
use uuid::Uuid;

use gradus_common::redis::push_test_result;
use gradus_common::types::TestResult;
use gradus_engine::ResultSink;

pub struct RedisResultSink {
    conn: redis::aio::ConnectionManager,
}

impl RedisResultSink {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ResultSink for RedisResultSink {
    async fn record(&self, submission_id: Uuid, result: &TestResult) -> anyhow::Result<()> {
        // The manager is a cheap handle; clone per record so the sink
        // works behind a shared reference.
        let mut conn = self.conn.clone();
        push_test_result(&mut conn, &submission_id, result).await?;
        Ok(())
    }
}
