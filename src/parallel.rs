// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Dispatch unit jobs across a pool of protocol clients.
//!
//! The executor pulls jobs from a generator callback, keeps every idle
//! client busy, and surfaces completions in completion order (not
//! submission order); a caller that needs submission order reorders by job
//! key. Worker-reported errors are retried per the job's policy before the
//! error is surfaced with the worker's stack.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::ProtocolClient;
use crate::{Error, Result};

/// Poll slice per busy client while waiting for completions.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One unit of work for a worker.
#[derive(Debug, Clone)]
pub struct Job {
    /// Identifier returned with the completion.
    pub key: String,
    pub cmd: String,
    pub parameter: Vec<Value>,
}

/// Per-job retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetrySpec {
    pub retries: u32,
    pub interval: Duration,
}

/// A finished job, in completion order.
#[derive(Debug)]
pub struct Completion {
    pub key: String,
    pub result: Result<Value>,
    /// How many retries were spent before this result.
    pub retries_used: u32,
    /// Worker process id, for log correlation.
    pub pid: u32,
}

struct Slot {
    client: ProtocolClient,
    running: Option<Running>,
}

struct Running {
    job: Job,
    retries_left: u32,
    retries_used: u32,
}

/// Run jobs from `generator` over `clients` until the generator is drained
/// and every client is idle. Completions are passed to `on_complete` as
/// they happen; the total completed count is returned.
///
/// `timeout` bounds the whole run: on expiry all clients are closed and a
/// protocol error is raised.
pub fn execute<G, C>(
    clients: Vec<ProtocolClient>,
    retry: RetrySpec,
    timeout: Option<Duration>,
    mut generator: G,
    mut on_complete: C,
) -> Result<u64>
where
    G: FnMut() -> Option<Job>,
    C: FnMut(Completion) -> Result<()>,
{
    assert!(!clients.is_empty(), "executor needs at least one client");
    let started = Instant::now();
    let mut slots: Vec<Slot> = clients
        .into_iter()
        .map(|client| Slot {
            client,
            running: None,
        })
        .collect();
    let mut drained = false;
    let mut completed = 0u64;

    loop {
        // Keep every idle client busy.
        for slot in slots.iter_mut().filter(|slot| slot.running.is_none()) {
            if drained {
                break;
            }
            match generator() {
                None => {
                    drained = true;
                    break;
                }
                Some(job) => {
                    debug!(key = %job.key, pid = slot.client.pid(), "dispatch job");
                    slot.client.send(&job.cmd, job.parameter.clone())?;
                    slot.running = Some(Running {
                        job,
                        retries_left: retry.retries,
                        retries_used: 0,
                    });
                }
            }
        }

        if drained && slots.iter().all(|slot| slot.running.is_none()) {
            break;
        }

        if let Some(timeout) = timeout {
            if started.elapsed() > timeout {
                for slot in slots {
                    slot.client.close();
                }
                return Err(Error::Protocol(format!(
                    "parallel command timed out after {timeout:?}"
                )));
            }
        }

        // Poll the busy clients; completions surface as they are observed.
        for slot in slots.iter_mut().filter(|slot| slot.running.is_some()) {
            let response = match slot.client.recv_timeout(POLL_INTERVAL)? {
                None => continue,
                Some(response) => response,
            };
            let mut running = slot.running.take().expect("slot is busy");
            match response.into_result() {
                Ok(out) => {
                    completed += 1;
                    on_complete(Completion {
                        key: running.job.key.clone(),
                        result: Ok(out),
                        retries_used: running.retries_used,
                        pid: slot.client.pid(),
                    })?;
                }
                Err(err) if running.retries_left > 0 => {
                    warn!(
                        key = %running.job.key,
                        retries_left = running.retries_left,
                        "job failed, retrying: {err}"
                    );
                    std::thread::sleep(retry.interval);
                    running.retries_left -= 1;
                    running.retries_used += 1;
                    slot.client
                        .send(&running.job.cmd, running.job.parameter.clone())?;
                    slot.running = Some(running);
                }
                Err(err) => {
                    completed += 1;
                    on_complete(Completion {
                        key: running.job.key.clone(),
                        result: Err(err),
                        retries_used: running.retries_used,
                        pid: slot.client.pid(),
                    })?;
                }
            }
        }
    }

    for slot in slots {
        slot.client.close();
    }
    Ok(completed)
}

#[cfg(test)]
mod test {
    use super::*;

    // Executor behavior over real worker processes is covered by the
    // integration tests, which spawn the binary with local roles; the unit
    // layer checks job bookkeeping that needs no processes.

    #[test]
    fn jobs_from_a_vec_generator_drain_in_order() {
        let mut jobs = vec![
            Job {
                key: "S1".into(),
                cmd: "x".into(),
                parameter: vec![],
            },
            Job {
                key: "S2".into(),
                cmd: "x".into(),
                parameter: vec![],
            },
        ]
        .into_iter();
        let mut generator = move || jobs.next();
        assert_eq!(generator().unwrap().key, "S1");
        assert_eq!(generator().unwrap().key, "S2");
        assert!(generator().is_none());
    }
}
