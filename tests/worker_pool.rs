use neurochat_bot::queue::{PoolError, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_jobs_survive_failing_neighbours() {
    let pool = WorkerPool::start("test", 2);
    let done = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    for i in 0..6usize {
        let done = done.clone();
        let tx = tx.clone();
        pool.submit(async move {
            let _ = tx.send(i);
            if i % 3 == 0 {
                return Err(anyhow::anyhow!("job {i} failed"));
            }
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .expect("pool accepts jobs");
    }
    drop(tx);

    let mut seen = Vec::new();
    while let Ok(Some(i)) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        seen.push(i);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);

    pool.shutdown().await;
    assert_eq!(done.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_jobs_run_concurrently() {
    let pool = WorkerPool::start("parallel", 3);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let gate = Arc::new(tokio::sync::Barrier::new(3));

    for _ in 0..3 {
        let gate = gate.clone();
        let tx = tx.clone();
        pool.submit(async move {
            gate.wait().await;
            let _ = tx.send(());
            Ok(())
        })
        .expect("pool accepts jobs");
    }

    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("all three workers passed the barrier")
            .expect("sender alive");
    }
    pool.shutdown().await;
}

#[tokio::test]
async fn test_submit_after_shutdown_fails() {
    let pool = WorkerPool::start("closed", 1);
    pool.shutdown().await;

    let err = pool.submit(async { Ok(()) }).expect_err("pool is stopped");
    assert_eq!(err, PoolError::Stopped("closed".to_string()));
}
