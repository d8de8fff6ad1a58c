use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::Semaphore;

use flightcache::caching::Cache;
use flightcache::config::Config;

use crate::workloads::{WorkloadsConfig, prepare_workload};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = Cache::new(config.cache);

    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| -> Result<_> {
            let concurrency = workload.concurrency.max(1);
            let prepared = prepare_workload(cache.clone(), workload)
                .with_context(|| format!("failed to prepare workload {i}"))?;
            Ok((concurrency, Arc::new(prepared)))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move { workload.process().await })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(Vec::new()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            workload.process().await;

                            task_durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(task_start.elapsed());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: Vec<Duration> = std::mem::take(
                &mut task_durations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );

            (concurrency, task_durations, workload.stats())
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, mut task_durations, stats) =
            task.context("workload task failed")?;

        let ops = task_durations.len();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!(
            "  producer invocations: {}; failed operations: {}",
            stats.invocations, stats.failures
        );

        if ops == 0 {
            continue;
        }
        task_durations.sort_unstable();
        let avg = task_durations.iter().sum::<Duration>() / ops as u32;
        let p50 = quantile(&task_durations, 0.5);
        let p90 = quantile(&task_durations, 0.9);
        let p99 = quantile(&task_durations, 0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    cache.shutdown();

    Ok(())
}

/// Picks the `q`-quantile from non-empty, sorted `durations`.
fn quantile(durations: &[Duration], q: f64) -> Duration {
    let index = ((durations.len() - 1) as f64 * q).round() as usize;
    durations[index]
}
