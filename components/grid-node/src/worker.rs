use std::time::Duration;

use anyhow::Result;
use lattice::Board;
use oracle::{BacktrackSolver, BlockSolver, SolveError};
use reqwest::StatusCode;

use crate::types::{HeartbeatRequest, PullResponse, ResultSubmission};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub master_url: String,
    pub worker_id: String,
    pub poll_interval: Duration,
    pub heartbeat_every: Duration,
}

/// Pull, solve, post, repeat. A failed request never kills the loop; the
/// master's heartbeat expiry covers us if we die for real.
pub async fn run_worker(cfg: WorkerConfig) -> Result<()> {
    let client = reqwest::Client::new();
    println!("=== Worker Live ({}) -> {} ===", cfg.worker_id, cfg.master_url);

    let hb_client = client.clone();
    let hb_url = format!("{}/heartbeat", cfg.master_url);
    let hb_id = cfg.worker_id.clone();
    let hb_every = cfg.heartbeat_every;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(hb_every);
        loop {
            interval.tick().await;
            let beat = HeartbeatRequest { worker_id: Some(hb_id.clone()) };
            if let Err(e) = hb_client.post(&hb_url).json(&beat).send().await {
                println!("⚠️ Heartbeat failed: {}", e);
            }
        }
    });

    let queue_url = format!("{}/queue", cfg.master_url);
    let result_url = format!("{}/result", cfg.master_url);
    loop {
        match client
            .get(&queue_url)
            .query(&[("workerId", cfg.worker_id.as_str())])
            .send()
            .await
        {
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                tokio::time::sleep(cfg.poll_interval).await;
            }
            Ok(resp) if resp.status().is_success() => match resp.json::<PullResponse>().await {
                Ok(sub) => {
                    let submission = solve_sub_job(&sub);
                    if let Err(e) = client.post(&result_url).json(&submission).send().await {
                        println!("⚠️ Result submission failed: {}", e);
                    }
                }
                Err(e) => {
                    println!("⚠️ Bad sub-job payload: {}", e);
                    tokio::time::sleep(cfg.poll_interval).await;
                }
            },
            Ok(resp) => {
                println!("⚠️ Master answered {}. Retrying...", resp.status());
                tokio::time::sleep(cfg.poll_interval).await;
            }
            Err(e) => {
                println!("⚠️ Poll failed: {}. Backing off...", e);
                tokio::time::sleep(cfg.poll_interval * 2).await;
            }
        }
    }
}

fn solve_sub_job(sub: &PullResponse) -> ResultSubmission {
    println!(
        "🧩 Claiming SubJob {} (partition {}, iteration {})",
        sub.id, sub.partition_index, sub.iteration
    );
    let context = match Board::from_rows(&sub.context_board) {
        Ok(board) => board,
        Err(e) => {
            println!("⚠️ Unusable context board: {}", e);
            return unsolvable(sub);
        }
    };
    match BacktrackSolver.solve(&sub.board, &context, sub.strategy, sub.partition_index) {
        Ok(outcome) => {
            let sure_count = outcome.sure.iter().filter(|&&s| s).count();
            println!(
                "✅ Result: partition {} filled ({} sure cells)",
                sub.partition_index, sure_count
            );
            ResultSubmission {
                id: sub.id.clone(),
                values: Some(outcome.values),
                sure_mask: Some(outcome.sure),
                partition_index: Some(sub.partition_index),
                iteration: Some(sub.iteration),
                unsolvable: None,
            }
        }
        Err(SolveError::Infeasible) => {
            println!(
                "❌ Partition {} is infeasible under its context. Reporting unsolvable.",
                sub.partition_index
            );
            unsolvable(sub)
        }
        Err(e) => {
            println!("⚠️ Solver rejected the sub-job: {}", e);
            unsolvable(sub)
        }
    }
}

fn unsolvable(sub: &PullResponse) -> ResultSubmission {
    ResultSubmission {
        id: sub.id.clone(),
        values: None,
        sure_mask: None,
        partition_index: None,
        iteration: None,
        unsolvable: Some(true),
    }
}
