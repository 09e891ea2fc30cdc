// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use hashing::Fingerprint;
use log::debug;
use parking_lot::Mutex;
use store::Store;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{ManagedChild, NamedCaches, Process, ProcessError};
use store::ImmutableInputs;

///
/// A pool of running nailgun servers, keyed by the fingerprint of the server launch request
/// (which includes the JVM args and the input/classpath digest).
///
/// The pool is bounded: when full, the least recently used idle server is killed to make room.
///
#[derive(Clone)]
pub struct NailgunPool {
    workdir_base: PathBuf,
    size: usize,
    store: Store,
    sema: Arc<Semaphore>,
    processes: Arc<Mutex<Vec<PoolEntry>>>,
}

struct PoolEntry {
    fingerprint: Fingerprint,
    process: Option<NailgunProcess>,
}

impl NailgunPool {
    pub fn new(workdir_base: PathBuf, size: usize, store: Store) -> Self {
        NailgunPool {
            workdir_base,
            size,
            store,
            sema: Arc::new(Semaphore::new(size)),
            processes: Arc::default(),
        }
    }

    #[allow(dead_code)]
    pub fn workdir_base(&self) -> &Path {
        &self.workdir_base
    }

    ///
    /// Given a name and a `Process` configuration, return a running nailgun server matching
    /// it, starting one if none is available.
    ///
    pub async fn acquire(
        &self,
        server_process: Process,
        named_caches: &NamedCaches,
        immutable_inputs: &ImmutableInputs,
    ) -> Result<BorrowedNailgunProcess, ProcessError> {
        let permit = self
            .sema
            .clone()
            .acquire_owned()
            .await
            .expect("Semaphore should not have been closed.");

        let fingerprint = crate::get_digest(&server_process, None, None).await?.hash;

        // Try to find an idle, live server with a matching fingerprint.
        let checked_out = {
            let mut processes = self.processes.lock();
            let matching_idx = processes.iter().position(|entry| {
                entry.fingerprint == fingerprint && entry.process.is_some()
            });
            match matching_idx {
                Some(idx) => {
                    let entry = processes.swap_remove(idx);
                    entry.process
                }
                None => None,
            }
        };

        let process = match checked_out {
            Some(mut process) => {
                if process.is_alive() {
                    debug!(
                        "Reusing nailgun server {} at port {}",
                        process.name, process.port
                    );
                    Some(process)
                } else {
                    debug!("Discarding dead nailgun server {}", process.name);
                    std::mem::drop(process);
                    None
                }
            }
            None => None,
        };

        let process = match process {
            Some(process) => process,
            None => {
                // If the pool is full of idle servers, evict the least recently returned to
                // make room for the one we are about to start.
                {
                    let mut processes = self.processes.lock();
                    while processes.len() >= self.size {
                        let evicted = processes.remove(0);
                        debug!("Evicting idle nailgun server to make room.");
                        std::mem::drop(evicted);
                    }
                }
                NailgunProcess::start_new(
                    server_process,
                    &self.workdir_base,
                    &self.store,
                    named_caches,
                    immutable_inputs,
                    fingerprint,
                )
                .await?
            }
        };

        Ok(BorrowedNailgunProcess {
            process: Some(process),
            pool: self.processes.clone(),
            _permit: permit,
        })
    }
}

///
/// A running nailgun server and the sandbox it runs in.
///
pub struct NailgunProcess {
    name: String,
    fingerprint: Fingerprint,
    workdir: tempfile::TempDir,
    port: u16,
    child: ManagedChild,
}

impl NailgunProcess {
    async fn start_new(
        startup_options: Process,
        workdir_base: &Path,
        store: &Store,
        named_caches: &NamedCaches,
        immutable_inputs: &ImmutableInputs,
        fingerprint: Fingerprint,
    ) -> Result<NailgunProcess, ProcessError> {
        let workdir = tempfile::Builder::new()
            .prefix("nailgun")
            .tempdir_in(workdir_base)
            .map_err(|err| format!("Error making tempdir for nailgun server: {err:?}"))?;

        // Prepare the server's workdir (materializing its classpath inputs).
        crate::local::prepare_workdir(
            workdir.path().to_owned(),
            &startup_options,
            startup_options.input_digests.inputs.clone(),
            store,
            named_caches,
            immutable_inputs,
        )
        .await?;

        let mut command = Command::new(&startup_options.argv[0]);
        command
            .args(&startup_options.argv[1..])
            .env_clear()
            .envs(&startup_options.env)
            .current_dir(workdir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = ManagedChild::spawn(&mut command, None)
            .map_err(|e| format!("Failed to spawn nailgun server: {e}"))?;
        debug!(
            "Started nailgun server {:?} as {:?}",
            startup_options.description,
            child.id()
        );

        // The server prints its chosen port on stdout once it is ready to accept connections.
        let port = {
            let stdout = child
                .stdout
                .take()
                .expect("The stdout of the nailgun server was captured above.");
            let mut reader = BufReader::new(stdout).lines();
            let line = tokio::time::timeout(std::time::Duration::from_secs(30), reader.next_line())
                .await
                .map_err(|_| "Timed out waiting for the nailgun server to start.".to_owned())?
                .map_err(|e| format!("Failed to read from the nailgun server: {e}"))?
                .ok_or_else(|| "The nailgun server exited before printing a port.".to_owned())?;
            parse_port(&line)?
        };

        Ok(NailgunProcess {
            name: startup_options.description,
            fingerprint,
            workdir,
            port,
            child,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workdir_path(&self) -> &Path {
        self.workdir.path()
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port)
    }

    fn is_alive(&mut self) -> bool {
        self.child
            .try_wait()
            .map(|status| status.is_none())
            .unwrap_or(false)
    }
}

///
/// Parse the port from a nailgun server startup line such as:
///   `NGServer 0.9.1 started on address 127.0.0.1, port 53415.`
///
fn parse_port(line: &str) -> Result<u16, String> {
    let port_str = line
        .rsplit("port ")
        .next()
        .map(|suffix| suffix.trim_end_matches(['.', ' ']))
        .ok_or_else(|| format!("Output for nailgun server was unexpected:\n{line:?}"))?;
    port_str
        .parse::<u16>()
        .map_err(|e| format!("Failed to parse port from {line:?}: {e}"))
}

///
/// A NailgunProcess checked out of the pool. If `release` is not called, the server is killed
/// when dropped (because the work running on it may have been canceled partway through).
///
pub struct BorrowedNailgunProcess {
    process: Option<NailgunProcess>,
    pool: Arc<Mutex<Vec<PoolEntry>>>,
    _permit: OwnedSemaphorePermit,
}

impl BorrowedNailgunProcess {
    pub fn name(&self) -> &str {
        self.process.as_ref().unwrap().name()
    }

    pub fn workdir_path(&self) -> &Path {
        self.process.as_ref().unwrap().workdir_path()
    }

    pub fn address(&self) -> SocketAddr {
        self.process.as_ref().unwrap().address()
    }

    ///
    /// Return the process to the pool for reuse.
    ///
    pub async fn release(&mut self) -> Result<(), String> {
        let process = self
            .process
            .take()
            .expect("release may only be called once.");
        let fingerprint = process.fingerprint;
        self.pool.lock().push(PoolEntry {
            fingerprint,
            process: Some(process),
        });
        Ok(())
    }
}

impl Drop for BorrowedNailgunProcess {
    fn drop(&mut self) {
        if let Some(mut process) = self.process.take() {
            // The process was not released: kill the server, since the client run may have
            // been canceled with the connection in an unknown state.
            let _ = process.child.attempt_shutdown_sync();
        }
    }
}
