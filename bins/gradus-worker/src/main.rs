mod config;
mod sink;

use std::sync::Arc;

use chrono::Utc;
use gradus_common::redis;
use gradus_common::types::{SubmissionResult, SubmissionStatus};
use gradus_engine::backend::BackendRegistry;
use gradus_engine::store::{CoordinationStore, RedisStore};
use gradus_engine::{EngineContext, EngineError, ExecutionPipeline};
use sink::RedisResultSink;
use tokio::signal;
use tracing::{error, info, instrument, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Gradus worker booting...");

    let engine_config = config::load().map_err(|e| {
        error!("Failed to load engine configuration: {}", e);
        e
    })?;

    let redis_url = std::env::var("REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    let client = ::redis::Client::open(redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;

    info!("Connected to Redis: {}", redis_url);

    let store: Arc<dyn CoordinationStore> = Arc::new(RedisStore::connect(&redis_url).await?);
    let registry = BackendRegistry::with_defaults(&engine_config);
    info!("Language backends: {:?}", registry.languages());

    let context = EngineContext::new(engine_config, store, registry);
    let pipeline = ExecutionPipeline::new(Arc::new(context));

    // Setup graceful shutdown
    let shutdown = async {
        signal::ctrl_c().await.expect("failed to install CTRL+C signal handler");
        warn!("Received shutdown signal, draining queue...");
    };

    tokio::select! {
        _ = worker_loop(&mut redis_conn, &pipeline) => {},
        _ = shutdown => {},
    }

    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip(redis_conn, pipeline))]
async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    pipeline: &ExecutionPipeline,
) -> anyhow::Result<()> {
    loop {
        // BLPOP with 5 second timeout for graceful shutdown
        match redis::pop_submission(redis_conn, 5.0).await {
            Ok(Some(submission)) => {
                let submission_id = submission.id;
                info!(
                    submission_id = %submission_id,
                    test_cases = submission.tests.len(),
                    source = %submission.source_path.display(),
                    "Received submission"
                );

                if let Err(e) =
                    redis::store_status(redis_conn, &submission_id, &SubmissionStatus::Running)
                        .await
                {
                    warn!(
                        submission_id = %submission_id,
                        error = %e,
                        "Failed to mark submission running"
                    );
                }

                let language = pipeline
                    .resolve_language(&submission.source_path)
                    .unwrap_or_else(|| "unknown".to_string());

                let sink = RedisResultSink::new(redis_conn.clone());
                let start = std::time::Instant::now();
                let (status, results) = match pipeline.run_with_sink(&submission, &sink).await {
                    Ok(results) => (SubmissionStatus::Completed, results),
                    Err(EngineError::UnsupportedLanguage(path)) => {
                        warn!(
                            submission_id = %submission_id,
                            source = %path.display(),
                            "No language backend for submission"
                        );
                        (SubmissionStatus::InvalidSource, Vec::new())
                    }
                    Err(e) => {
                        error!(
                            submission_id = %submission_id,
                            error = %e,
                            "Submission execution failed"
                        );
                        (SubmissionStatus::Error, Vec::new())
                    }
                };
                let execution_time = start.elapsed();

                let passed = results.iter().filter(|r| r.success).count();
                info!(
                    submission_id = %submission_id,
                    status = ?status,
                    passed,
                    total = results.len(),
                    execution_ms = execution_time.as_millis(),
                    "Execution completed"
                );

                let result = SubmissionResult {
                    submission_id,
                    language,
                    status,
                    metadata: submission.metadata.clone(),
                    results,
                    finished_at: Utc::now(),
                };

                match redis::store_result(redis_conn, &result).await {
                    Ok(_) => {
                        info!(submission_id = %submission_id, "Result persisted to Redis");
                    }
                    Err(e) => {
                        error!(submission_id = %submission_id, error = %e, "Failed to persist result");
                        // Non-fatal - worker continues
                    }
                }
            }
            Ok(None) => {
                // Timeout - check for shutdown
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}
