use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use super::{
    engine::{Action, Engine},
    packet::keepalive_report,
    types::*,
};
use crate::config::{HEALTH_CHECK_INTERVAL_SECS, KEEPALIVE_INTERVAL_MS, MAX_CHANNELS};
use crate::ctap2::{self, types::CTAP2_OK, Authenticator, CommandContext};

/// The one command currently running on a worker thread.
struct Inflight {
    cid: u32,
    cmd: u8,
    ctx: CommandContext,
    done: oneshot::Receiver<Vec<u8>>,
}

pub async fn run_ctaphid_loop(
    mut incoming_rx: mpsc::Receiver<Report>,
    outgoing_tx: mpsc::Sender<Report>,
    auth: Arc<Authenticator>,
) {
    let mut engine = Engine::new(MAX_CHANNELS);
    let mut inflight: Option<Inflight> = None;

    let mut keepalive = tokio::time::interval(Duration::from_millis(KEEPALIVE_INTERVAL_MS));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut health = tokio::time::interval(Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS));
    health.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!("CTAPHID loop running");

    loop {
        tokio::select! {
            report = incoming_rx.recv() => {
                let Some(report) = report else { break };
                let reports = match engine.on_report(&report, Instant::now()) {
                    Action::Reply(reports) => reports,
                    Action::Dispatch(msg) => {
                        inflight = Some(spawn_worker(&auth, msg.cid, msg.cmd, msg.payload));
                        Vec::new()
                    }
                    Action::Cancel { cid, reply } => {
                        if let Some(job) = inflight.as_ref().filter(|job| job.cid == cid) {
                            job.ctx.cancel.store(true, Ordering::Relaxed);
                        }
                        reply
                    }
                    Action::None => Vec::new(),
                };
                if !send_all(&outgoing_tx, reports).await {
                    return;
                }
            }
            result = completion(&mut inflight), if inflight.is_some() => {
                let Some(job) = inflight.take() else { continue };
                let response = result.unwrap_or_else(|_| {
                    tracing::error!(cid = format!("{:#010x}", job.cid), "Worker ended without a result");
                    vec![ERR_OTHER]
                });
                let reports = engine.finish(job.cid, job.cmd, &response);
                if !send_all(&outgoing_tx, reports).await {
                    return;
                }
                engine.sent();
            }
            _ = keepalive.tick() => {
                if let (Some(cid), Some(job)) = (engine.keepalive_cid(), inflight.as_ref()) {
                    let status = job.ctx.keepalive.load(Ordering::Relaxed);
                    if !send_all(&outgoing_tx, vec![keepalive_report(cid, status)]).await {
                        return;
                    }
                }
                if let Some(report) = engine.expire(Instant::now()) {
                    if !send_all(&outgoing_tx, vec![report]).await {
                        return;
                    }
                }
            }
            _ = health.tick() => {
                if engine.is_idle() && inflight.is_none() {
                    let backend = auth.backend().clone();
                    match tokio::task::spawn_blocking(move || backend.supervise()).await {
                        Ok(state) => tracing::trace!(?state, "Backend health checked"),
                        Err(e) => tracing::error!("Health check task failed: {e}"),
                    }
                }
            }
        }
    }
    tracing::info!("CTAPHID loop exiting (incoming channel closed)");
}

fn spawn_worker(auth: &Arc<Authenticator>, cid: u32, cmd: u8, payload: Vec<u8>) -> Inflight {
    let ctx = CommandContext::new();
    let (tx, done) = oneshot::channel();
    let worker_auth = auth.clone();
    let worker_ctx = ctx.clone();
    tracing::debug!(cid = format!("{cid:#010x}"), cmd = format!("{cmd:#04x}"), len = payload.len(), "Dispatching");
    tokio::task::spawn_blocking(move || {
        let response = match cmd {
            CMD_STATUS => status_response(&worker_auth),
            _ => ctap2::process(&worker_auth, &payload, &worker_ctx),
        };
        // The loop may have stopped listening; nothing to do then.
        let _ = tx.send(response);
    });
    Inflight { cid, cmd, ctx, done }
}

fn status_response(auth: &Authenticator) -> Vec<u8> {
    match auth.status_report() {
        Ok(body) => {
            let mut out = vec![CTAP2_OK];
            out.extend_from_slice(&body);
            out
        }
        Err(e) => {
            tracing::error!(error = %e, "STATUS failed");
            vec![e.status_byte()]
        }
    }
}

async fn completion(inflight: &mut Option<Inflight>) -> Result<Vec<u8>, oneshot::error::RecvError> {
    match inflight {
        Some(job) => (&mut job.done).await,
        None => std::future::pending().await,
    }
}

async fn send_all(tx: &mpsc::Sender<Report>, reports: Vec<Report>) -> bool {
    for report in reports {
        if tx.send(report).await.is_err() {
            tracing::error!("Outgoing channel closed");
            return false;
        }
    }
    true
}
