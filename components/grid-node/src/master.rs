use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use lattice::{seed_if_blank, Board, LatticeError, Strategy};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::dispatch::Dispatcher;
use crate::job::{Accepted, JobState, PartitionResult, Verdict, BARREN_ROUND_LIMIT};
use crate::types::*;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub port: u16,
    pub strategy: Strategy,
    pub dead_after: Duration,
    pub sweep_every: Duration,
    pub result_ttl: Duration,
}

/// Where finished boards go. The master only ever calls `save`; what
/// happens behind it (disk, nothing, a test probe) is not its concern.
#[async_trait]
pub trait SolutionSink: Send + Sync {
    async fn save(&self, job_id: Uuid, board: &Board);
}

pub struct LogSink;

#[async_trait]
impl SolutionSink for LogSink {
    async fn save(&self, job_id: Uuid, board: &Board) {
        let rows = serde_json::to_string(&board.to_rows()).unwrap_or_default();
        println!("💾 SINK: Solution for job {}: {}", job_id, rows);
    }
}

pub struct SolvedEntry {
    pub board: Board,
    pub solved: bool,
    pub at: Instant,
}

pub struct AppState {
    pub cfg: MasterConfig,
    pub jobs: Arc<DashMap<Uuid, Arc<Mutex<JobState>>>>,
    pub solved: Arc<DashMap<Uuid, SolvedEntry>>,
    pub dispatcher: Arc<Dispatcher>,
    pub sink: Arc<dyn SolutionSink>,
}

pub async fn run_master(cfg: MasterConfig, sink: Arc<dyn SolutionSink>) -> Result<()> {
    let port = cfg.port;
    let state = Arc::new(AppState {
        cfg,
        jobs: Arc::new(DashMap::new()),
        solved: Arc::new(DashMap::new()),
        dispatcher: Arc::new(Dispatcher::new()),
        sink,
    });

    spawn_sweeper(state.clone());

    let app = Router::new()
        .route("/solve", post(solve))
        .route("/queue", get(pull_sub_job))
        .route("/result", post(submit_result))
        .route("/heartbeat", post(heartbeat))
        .route("/grid/:job_id", get(grid))
        .route("/result/:job_id", get(job_status))
        .route("/FinalsolvedResults", get(final_results))
        .route("/totalJobs", get(total_jobs))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    println!("Master Active: http://localhost:{}", port);
    axum::Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}

/// The 1 Hz loop: combine checks and stall detection per job, plus the
/// slower dead-worker and result-cache sweeps. Job locks are taken one
/// at a time; verdicts are applied after each lock is released.
fn spawn_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut last_worker_sweep = Instant::now();
        loop {
            tick.tick().await;

            let jobs: Vec<(Uuid, Arc<Mutex<JobState>>)> = state
                .jobs
                .iter()
                .map(|entry| (*entry.key(), entry.value().clone()))
                .collect();
            let queue_empty = state.dispatcher.queue_len().await == 0;
            for (job_id, job_ref) in jobs {
                let mut job = job_ref.lock().await;
                let verdict = match job.completion_check() {
                    Verdict::Pending if job.stalled(queue_empty) => {
                        println!(
                            "⏰ STALL: Job {} made no progress in iteration {}. Full re-queue...",
                            job_id, job.iteration
                        );
                        let subs = job.full_requeue();
                        if job.barren_rounds >= BARREN_ROUND_LIMIT {
                            Verdict::Abandoned
                        } else {
                            Verdict::Requeue(subs)
                        }
                    }
                    verdict => verdict,
                };
                drop(job);
                apply_verdict(&state, job_id, verdict).await;
            }

            if last_worker_sweep.elapsed() >= state.cfg.sweep_every {
                last_worker_sweep = Instant::now();
                for (worker, count) in state.dispatcher.sweep_dead(state.cfg.dead_after).await {
                    println!(
                        "⏰ Heartbeat Timeout: Worker {} dropped {} sub-jobs. Re-queuing...",
                        worker, count
                    );
                }
                let before = state.solved.len();
                state
                    .solved
                    .retain(|_, entry| entry.at.elapsed() < state.cfg.result_ttl);
                let pruned = before - state.solved.len();
                if pruned > 0 {
                    println!("🧹 GC: Pruned {} cached results.", pruned);
                }
            }
        }
    });
}

async fn apply_verdict(state: &Arc<AppState>, job_id: Uuid, verdict: Verdict) {
    match verdict {
        Verdict::Pending => {}
        Verdict::Requeue(subs) => {
            if let Some(first) = subs.first() {
                println!(
                    "🔁 RE-QUEUE: Job {} opens iteration {} with {} sub-jobs.",
                    job_id,
                    first.iteration,
                    subs.len()
                );
            }
            state.dispatcher.enqueue_all(subs).await;
        }
        Verdict::Solved(board) => finalize(state, job_id, board, true).await,
        Verdict::Abandoned => {
            let board = match state.jobs.get(&job_id).map(|e| e.value().clone()) {
                Some(job_ref) => job_ref.lock().await.current.clone(),
                None => return,
            };
            finalize(state, job_id, board, false).await;
        }
    }
}

async fn finalize(state: &Arc<AppState>, job_id: Uuid, board: Board, solved: bool) {
    if solved {
        println!("✅ SOLVED: Job {} completed.", job_id);
        state.sink.save(job_id, &board).await;
    } else {
        println!(
            "🛑 ABANDONED: Job {} made no headway across {} requeue rounds.",
            job_id, BARREN_ROUND_LIMIT
        );
    }
    state.solved.insert(
        job_id,
        SolvedEntry {
            board,
            solved,
            at: Instant::now(),
        },
    );
    state.jobs.remove(&job_id);
    state.dispatcher.drop_job(job_id).await;
}

fn bad_request(err: LatticeError) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error: err.to_string() }),
    )
}

fn bad_request_msg(msg: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error: msg.to_string() }),
    )
}

fn ack(
    id: &str,
    status: &str,
) -> Result<(StatusCode, Json<ResultAck>), (StatusCode, Json<ErrorResponse>)> {
    Ok((
        StatusCode::OK,
        Json(ResultAck { id: id.to_string(), status: status.to_string() }),
    ))
}

fn not_found(msg: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse { error: msg.to_string() }),
    )
}

async fn solve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SolveRequest>,
) -> Result<(StatusCode, Json<SolveResponse>), (StatusCode, Json<ErrorResponse>)> {
    let rows = req.board.ok_or_else(|| bad_request_msg("board is required"))?;
    let mut board = Board::from_rows(&rows).map_err(bad_request)?;
    if !board.is_well_formed() {
        return Err(bad_request(LatticeError::IllFormed));
    }
    seed_if_blank(&mut board, state.cfg.strategy);
    let clues = board.filled_count();

    let job_id = Uuid::new_v4();
    let mut job = JobState::new(job_id, board, state.cfg.strategy)
        .map_err(|_| bad_request_msg("unsolvable clues"))?;

    if job.current.is_solved() {
        println!("✅ SOLVED: Job {} closed by propagation alone.", job_id);
        let solved_board = job.current.to_rows();
        state.sink.save(job_id, &job.current).await;
        state.solved.insert(
            job_id,
            SolvedEntry {
                board: job.current,
                solved: true,
                at: Instant::now(),
            },
        );
        return Ok((
            StatusCode::OK,
            Json(SolveResponse {
                job_id: job_id.to_string(),
                status: "completed".to_string(),
                partial_board: None,
                solved_board: Some(solved_board),
            }),
        ));
    }

    let sub_jobs = job.first_round();
    let partial_board = job.current.to_rows();
    let count = sub_jobs.len();
    state.jobs.insert(job_id, Arc::new(Mutex::new(job)));
    state.dispatcher.enqueue_all(sub_jobs).await;
    println!("📥 Job Queued: {} ({} clues, {} sub-jobs)", job_id, clues, count);

    Ok((
        StatusCode::ACCEPTED,
        Json(SolveResponse {
            job_id: job_id.to_string(),
            status: "processing".to_string(),
            partial_board: Some(partial_board),
            solved_board: None,
        }),
    ))
}

async fn pull_sub_job(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueueParams>,
) -> Result<(StatusCode, Json<PullResponse>), (StatusCode, Json<ErrorResponse>)> {
    let worker_id = params
        .worker_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| bad_request_msg("workerId is required"))?;
    match state.dispatcher.pull(&worker_id).await {
        Some(sub) => Ok((
            StatusCode::OK,
            Json(PullResponse {
                id: sub.id,
                board: sub.values,
                partition_index: sub.partition_index,
                iteration: sub.iteration,
                strategy: state.cfg.strategy,
                context_board: sub.context.to_rows(),
                is_requeue: sub.is_requeue,
            }),
        )),
        None => Err(not_found("no sub-jobs queued")),
    }
}

async fn submit_result(
    State(state): State<Arc<AppState>>,
    Json(sub): Json<ResultSubmission>,
) -> Result<(StatusCode, Json<ResultAck>), (StatusCode, Json<ErrorResponse>)> {
    let job_id = sub
        .id
        .split_once('.')
        .and_then(|(prefix, _)| Uuid::parse_str(prefix).ok())
        .ok_or_else(|| bad_request_msg("malformed sub-job id"))?;

    // Clears the pending assignment whether or not the payload is usable.
    let assignment = state.dispatcher.complete(&sub.id).await;

    if sub.unsolvable == Some(true) {
        let Some(assignment) = assignment else {
            return ack(&sub.id, "received");
        };
        let Some(job_ref) = state.jobs.get(&job_id).map(|e| e.value().clone()) else {
            return ack(&sub.id, "received");
        };
        let mut job = job_ref.lock().await;
        if assignment.sub_job.iteration != job.iteration {
            return ack(&sub.id, "received");
        }
        println!(
            "🚨 Worker reports partition {} of job {} unsolvable. Opening iteration {}...",
            assignment.sub_job.partition_index,
            job_id,
            job.iteration + 1
        );
        let conflicts = HashSet::from([assignment.sub_job.partition_index]);
        let subs = job.selective_requeue(&conflicts);
        let verdict = if job.barren_rounds >= BARREN_ROUND_LIMIT {
            Verdict::Abandoned
        } else {
            Verdict::Requeue(subs)
        };
        drop(job);
        apply_verdict(&state, job_id, verdict).await;
        return ack(&sub.id, "queued");
    }

    let (Some(values), Some(sure), Some(partition_index), Some(iteration)) =
        (sub.values, sub.sure_mask, sub.partition_index, sub.iteration)
    else {
        return Err(bad_request_msg(
            "values, sureMask, partitionIndex and iteration are required",
        ));
    };

    let Some(job_ref) = state.jobs.get(&job_id).map(|e| e.value().clone()) else {
        // The job already reached a terminal state; nothing left to do.
        return ack(&sub.id, "received");
    };
    let mut job = job_ref.lock().await;
    let result = PartitionResult { partition_index, values, sure, iteration };
    match job.accept(result) {
        Accepted::Stale | Accepted::Duplicate => {
            drop(job);
            ack(&sub.id, "received")
        }
        Accepted::Invalid => {
            println!(
                "🚨 Invalid partition {} in result {}. Opening iteration {}...",
                partition_index,
                sub.id,
                job.iteration + 1
            );
            let conflicts = HashSet::from([partition_index]);
            let subs = job.selective_requeue(&conflicts);
            let verdict = if job.barren_rounds >= BARREN_ROUND_LIMIT {
                Verdict::Abandoned
            } else {
                Verdict::Requeue(subs)
            };
            drop(job);
            apply_verdict(&state, job_id, verdict).await;
            ack(&sub.id, "queued")
        }
        Accepted::Aggregated => {
            let verdict = job.completion_check();
            drop(job);
            apply_verdict(&state, job_id, verdict).await;
            ack(&sub.id, "received")
        }
    }
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    let worker_id = req
        .worker_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| bad_request_msg("workerId is required"))?;
    state.dispatcher.heartbeat(&worker_id);
    Ok(StatusCode::OK)
}

async fn grid(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<GridResponse>), (StatusCode, Json<ErrorResponse>)> {
    let id = Uuid::parse_str(&job_id).map_err(|_| not_found("unknown job"))?;
    if let Some(job_ref) = state.jobs.get(&id).map(|e| e.value().clone()) {
        let job = job_ref.lock().await;
        return Ok((
            StatusCode::OK,
            Json(GridResponse {
                job_id: id.to_string(),
                partial_board: job.current.to_rows(),
            }),
        ));
    }
    if let Some(entry) = state.solved.get(&id) {
        return Ok((
            StatusCode::OK,
            Json(GridResponse {
                job_id: id.to_string(),
                partial_board: entry.board.to_rows(),
            }),
        ));
    }
    Err(not_found("unknown job"))
}

async fn status_payload(
    state: &AppState,
    id: Uuid,
) -> Option<StatusResponse> {
    if let Some(entry) = state.solved.get(&id) {
        return Some(if entry.solved {
            StatusResponse {
                job_id: Some(id.to_string()),
                status: "completed".to_string(),
                progress: None,
                solved_board: Some(entry.board.to_rows()),
            }
        } else {
            StatusResponse {
                job_id: Some(id.to_string()),
                status: "unsolvable".to_string(),
                progress: None,
                solved_board: None,
            }
        });
    }
    let job_ref = state.jobs.get(&id).map(|e| e.value().clone())?;
    let job = job_ref.lock().await;
    Some(StatusResponse {
        job_id: Some(id.to_string()),
        status: "processing".to_string(),
        progress: Some(job.progress()),
        solved_board: None,
    })
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<StatusResponse>), (StatusCode, Json<ErrorResponse>)> {
    let id = Uuid::parse_str(&job_id).map_err(|_| not_found("unknown job"))?;
    match status_payload(&state, id).await {
        Some(payload) => Ok((StatusCode::OK, Json(payload))),
        None => Err(not_found("unknown job")),
    }
}

async fn final_results(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FinalsParams>,
) -> Result<(StatusCode, Json<StatusResponse>), (StatusCode, Json<ErrorResponse>)> {
    let id = params
        .job_id
        .as_deref()
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or_else(|| bad_request_msg("jobId is required"))?;
    match status_payload(&state, id).await {
        Some(payload) => Ok((StatusCode::OK, Json(payload))),
        None => Err(not_found("unknown job")),
    }
}

async fn total_jobs(State(state): State<Arc<AppState>>) -> Json<TotalJobsResponse> {
    Json(TotalJobsResponse {
        total_jobs: state.jobs.len() + state.solved.len(),
    })
}
