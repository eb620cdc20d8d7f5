use crate::cellular::CellularSession;
use crate::config::UplinkConfig;
use crate::connection::Transport;
use crate::error::{Failure, FailureCause, Stage, TransferError};
use crate::executor::CommandExecutor;
use crate::gps::GpsSession;
use crate::https::HttpsTransfer;
use crate::models::{Command, RadioState, TransferResult};
use crate::payload;
use log::{debug, error, info};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

// Quiet period used to pick up boot-time notices before the first command
const DRAIN_WINDOW: Duration = Duration::from_millis(200);

pub type RunResult = Result<TransferResult, Failure>;

/// Runs fix -> payload -> activate -> POST -> deactivate over one modem link.
pub struct Orchestrator {
    exec: CommandExecutor,
    radios: RadioState,
    config: UplinkConfig,
}

impl Orchestrator {
    pub fn new(transport: Box<dyn Transport>, config: UplinkConfig) -> Self {
        Self {
            exec: CommandExecutor::new(transport),
            radios: RadioState::default(),
            config,
        }
    }

    pub fn radios(&self) -> RadioState {
        self.radios
    }

    /// One complete run. Produces exactly one terminal result; radios that
    /// were powered during the run have been asked to power down by then.
    pub async fn run(&mut self, cancel: &CancellationToken) -> RunResult {
        let result = self.sequence(cancel).await;

        if !self.radios.is_idle() {
            error!("Radios still powered after run: {:?}", self.radios);
        }
        match &result {
            Ok(transfer) => info!("Upload complete: HTTP {}", transfer.http_status),
            Err(failure) => error!("Run failed: {}", failure),
        }
        result
    }

    async fn sequence(&mut self, cancel: &CancellationToken) -> RunResult {
        self.check_modem(cancel).await?;

        let fix = GpsSession::new(&mut self.exec, &mut self.radios, &self.config, cancel)
            .acquire()
            .await
            .map_err(|e| Failure::new(Stage::GpsAcquisition, FailureCause::from(&e), &e))?;

        let body = payload::encode(&fix).map_err(|e| {
            Failure::new(Stage::PayloadEncoding, FailureCause::ProtocolViolation, e)
        })?;
        debug!("Payload: {}", body);

        if cancel.is_cancelled() {
            return Err(Failure::cancelled(Stage::CellularActivation));
        }
        let ctx = CellularSession::new(&mut self.exec, &mut self.radios, &self.config, cancel)
            .activate()
            .await
            .map_err(|e| Failure::new(Stage::CellularActivation, FailureCause::from(&e), &e))?;
        info!("Data context up ({}), starting transfer", ctx.ip);

        // The context is active: every path below goes through deactivation
        let transfer = HttpsTransfer::new(&mut self.exec, &self.radios, &self.config, cancel)
            .post(&self.config.url, &body)
            .await
            .and_then(|result| {
                if result.is_success() {
                    Ok(result)
                } else {
                    if let Some(text) = &result.body {
                        error!("Server error body: {}", text);
                    }
                    Err(TransferError::HttpStatus(result.http_status))
                }
            });

        let released = CellularSession::new(&mut self.exec, &mut self.radios, &self.config, cancel)
            .deactivate()
            .await;

        match (transfer, released) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(_), Err(e)) => Err(Failure::new(
                Stage::CellularDeactivation,
                FailureCause::from(&e),
                &e,
            )),
            (Err(e), Ok(())) => Err(Failure::new(Stage::Transfer, FailureCause::from(&e), &e)),
            (Err(e), Err(off)) => {
                error!("Deactivation after failed transfer also failed: {}", off);
                Err(Failure::new(Stage::Transfer, FailureCause::from(&e), &e))
            }
        }
    }

    async fn check_modem(&mut self, cancel: &CancellationToken) -> Result<(), Failure> {
        let pending = self
            .exec
            .collect(DRAIN_WINDOW, None)
            .await
            .map_err(|e| Failure::new(Stage::ModemCheck, FailureCause::LinkFailure, e))?;
        if !pending.lines.is_empty() {
            debug!("Discarded {} pending lines", pending.lines.len());
        }

        if cancel.is_cancelled() {
            return Err(Failure::cancelled(Stage::ModemCheck));
        }
        info!("Checking if modem is ready...");
        self.exec
            .execute_checked(&Command::at("AT", self.config.cmd_timeout))
            .await
            .map_err(|e| Failure::new(Stage::ModemCheck, FailureCause::from(&e), &e))?;
        info!("Modem is ready and responsive");
        Ok(())
    }
}

/// Run while holding the orchestrator's lock, so command/response pairs of
/// concurrent callers never interleave on the link.
pub async fn run_exclusive(shared: &Mutex<Orchestrator>, cancel: &CancellationToken) -> RunResult {
    let mut orchestrator = shared.lock().await;
    orchestrator.run(cancel).await
}
