//! Request/response client for one resource manager.
//!
//! Each exchange walks `Idle → Connecting → Sending → AwaitingResponse →
//! ParsingStatus → Done | Failed` on a fresh TCP connection, bounded by the
//! RM's timeout. A transport failure against the primary endpoint is
//! retried once against the backup. When every endpoint fails the RM is
//! marked failed for the rest of the iteration and further requests are
//! refused until the next [`WikiClient::begin_iteration`].

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use hpc_core::RmConfig;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::command::WikiCommand;
use crate::error::{WikiError, WikiResult};
use crate::frame::{WikiResponse, open, parse_response, read_frame, seal, write_frame};

const NEVER_FAILED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Idle,
    Connecting,
    Sending,
    AwaitingResponse,
    ParsingStatus,
    Done,
    Failed,
}

impl ClientState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ClientState::Connecting,
            2 => ClientState::Sending,
            3 => ClientState::AwaitingResponse,
            4 => ClientState::ParsingStatus,
            5 => ClientState::Done,
            6 => ClientState::Failed,
            _ => ClientState::Idle,
        }
    }
}

pub struct WikiClient {
    config: RmConfig,
    allow_retry: bool,
    state: AtomicU8,
    iteration: AtomicU64,
    failed_iteration: AtomicU64,
}

impl WikiClient {
    pub fn new(config: RmConfig) -> Self {
        Self {
            config,
            allow_retry: true,
            state: AtomicU8::new(ClientState::Idle as u8),
            iteration: AtomicU64::new(0),
            failed_iteration: AtomicU64::new(NEVER_FAILED),
        }
    }

    /// Disable fallback to the backup endpoint.
    pub fn without_retry(mut self) -> Self {
        self.allow_retry = false;
        self
    }

    pub fn config(&self) -> &RmConfig {
        &self.config
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn begin_iteration(&self, iteration: u64) {
        self.iteration.store(iteration, Ordering::SeqCst);
        self.set_state(ClientState::Idle);
    }

    pub fn failed_this_iteration(&self) -> bool {
        self.failed_iteration.load(Ordering::SeqCst) == self.iteration.load(Ordering::SeqCst)
    }

    /// Send `cmd` and return the parsed reply.
    pub async fn execute(&self, cmd: &WikiCommand) -> WikiResult<WikiResponse> {
        if self.failed_this_iteration() {
            return Err(WikiError::FailedThisIteration(self.config.name.clone()));
        }
        let payload = cmd.encode()?;

        let mut endpoints = vec![(self.config.host.clone(), self.config.port)];
        if self.allow_retry {
            endpoints.extend(self.config.backup_endpoint());
        }

        let mut last_err = None;
        for (attempt, (host, port)) in endpoints.iter().enumerate() {
            if attempt > 0 {
                warn!(rm = %self.config.name, host = %host, port, "falling back to backup rm");
            }
            match self.exchange(host, *port, &payload).await {
                Ok(resp) => {
                    self.set_state(ClientState::Done);
                    return Ok(resp);
                }
                Err(e) if e.is_transport() => last_err = Some(e),
                Err(e) => {
                    self.set_state(ClientState::Failed);
                    debug!(rm = %self.config.name, command = %cmd.verb, error = %e, "rm rejected command");
                    return Err(e);
                }
            }
        }

        self.set_state(ClientState::Failed);
        self.failed_iteration
            .store(self.iteration.load(Ordering::SeqCst), Ordering::SeqCst);
        let err = last_err.unwrap_or_else(|| WikiError::Connect {
            endpoint: self.config.host.clone(),
            message: "no endpoint configured".to_string(),
        });
        error!(rm = %self.config.name, command = %cmd.verb, error = %err, "rm unreachable");
        Err(err)
    }

    async fn exchange(&self, host: &str, port: u16, payload: &str) -> WikiResult<WikiResponse> {
        let endpoint = format!("{host}:{port}");
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let body = seal(&self.config, payload, now)?;

        let round_trip = async {
            self.set_state(ClientState::Connecting);
            let mut stream = TcpStream::connect(&endpoint)
                .await
                .map_err(|e| WikiError::Connect {
                    endpoint: endpoint.clone(),
                    message: e.to_string(),
                })?;
            self.set_state(ClientState::Sending);
            write_frame(&mut stream, &body).await?;
            self.set_state(ClientState::AwaitingResponse);
            read_frame(&mut stream).await
        };
        let reply = tokio::time::timeout(self.config.timeout(), round_trip)
            .await
            .map_err(|_| WikiError::Timeout(endpoint.clone()))??;

        self.set_state(ClientState::ParsingStatus);
        debug!(rm = %self.config.name, %endpoint, bytes = reply.len(), "rm replied");
        let payload = open(&self.config, &reply)?;
        parse_response(self.config.subtype, payload)
    }
}
