//! The worker pool for CPU-bound leaves.
//!
//! An optimization, not a correctness layer: a leaf produces the same result
//! whether it runs here or on the main path. A worker that dies without a
//! command-level error is retried on the caller's task with a warning.

use std::sync::Arc;

use camino::Utf8Path;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::{exec::run_command, ExecOutcome};

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
        }
    }

    /// Runs the command on a pool worker, falling back to the caller's own
    /// task when the worker dies without producing a result.
    pub async fn run(
        &self,
        command: &str,
        package_dir: &Utf8Path,
    ) -> Result<ExecOutcome, crate::Error> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed");

        let worker = {
            let command = command.to_owned();
            let package_dir = package_dir.to_owned();
            tokio::spawn(async move { run_command(&command, &package_dir).await })
        };

        match worker.await {
            Ok(result) => result,
            Err(join_error) => {
                warn!(target: "sail::task", %command, %join_error, "worker died, retrying on the main task");
                run_command(command, package_dir).await
            }
        }
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use camino::Utf8PathBuf;

    use super::*;

    #[tokio::test]
    async fn test_pool_result_matches_direct_execution() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        let pool = WorkerPool::new(2);
        let pooled = pool.run("echo from-worker", &path).await?;
        let direct = run_command("echo from-worker", &path).await?;
        assert_eq!(pooled.exit_code, direct.exit_code);
        assert_eq!(pooled.stdout, direct.stdout);
        Ok(())
    }

    #[tokio::test]
    async fn test_pool_bounds_concurrency() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();

        // Two tasks on a one-worker pool serialize: total wall time is at
        // least the sum of both sleeps.
        let pool = WorkerPool::new(1);
        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(
            pool.run("sleep 0.2", &path),
            pool.run("sleep 0.2", &path)
        );
        a?;
        b?;
        assert!(started.elapsed() >= std::time::Duration::from_millis(400));
        Ok(())
    }
}
