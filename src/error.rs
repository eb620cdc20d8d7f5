use std::fmt;
use thiserror::Error;

/// Failure reported by a `Transport`.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("timed out waiting for a line")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a single command that did not complete with `OK`.
#[derive(Error, Debug)]
pub enum ModemError {
    #[error("no response to {command}")]
    TransportTimeout { command: String },

    #[error("modem rejected {command}: {reason}")]
    ModemRejected { command: String, reason: String },

    #[error("unexpected response: {0}")]
    ProtocolViolation(String),

    #[error("link failure: {0}")]
    Link(#[from] TransportError),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum GpsAcquisitionError {
    #[error("no fix after {polls} polls")]
    NoFixTimeout { polls: u32 },

    #[error("modem rejected GPS power on: {0}")]
    ModemRejected(String),

    #[error("GPS power off failed: {0}")]
    PowerOffFailed(ModemError),

    #[error(transparent)]
    Modem(ModemError),

    #[error("cancelled")]
    Cancelled,
}

impl From<ModemError> for GpsAcquisitionError {
    fn from(e: ModemError) -> Self {
        match e {
            ModemError::ModemRejected { reason, .. } => GpsAcquisitionError::ModemRejected(reason),
            ModemError::Cancelled => GpsAcquisitionError::Cancelled,
            other => GpsAcquisitionError::Modem(other),
        }
    }
}

#[derive(Error, Debug)]
#[error("packet data context activation failed: {0}")]
pub struct CellularActivationError(#[source] pub ModemError);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpsStep {
    ConfigureTls,
    Configure,
    Connect,
    SetHeaders,
    WriteBody,
    Request,
    ReadBody,
}

impl fmt::Display for HttpsStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpsStep::ConfigureTls => "configure TLS",
            HttpsStep::Configure => "configure session",
            HttpsStep::Connect => "connect",
            HttpsStep::SetHeaders => "set headers",
            HttpsStep::WriteBody => "write body",
            HttpsStep::Request => "request",
            HttpsStep::ReadBody => "read body",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("HTTPS {step} failed: {source}")]
    Step {
        step: HttpsStep,
        #[source]
        source: ModemError,
    },

    #[error("no active packet data context")]
    NoDataContext,

    #[error("invalid URL {0}: only https:// is supported")]
    InvalidUrl(String),

    #[error("payload of {len} bytes exceeds the {limit} byte body limit")]
    PayloadTooLarge { len: usize, limit: usize },

    #[error("server answered HTTP {0}")]
    HttpStatus(u16),

    #[error("cancelled")]
    Cancelled,
}

/// Where in the orchestrated run a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ModemCheck,
    GpsAcquisition,
    PayloadEncoding,
    CellularActivation,
    Transfer,
    CellularDeactivation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ModemCheck => "modem check",
            Stage::GpsAcquisition => "GPS acquisition",
            Stage::PayloadEncoding => "payload encoding",
            Stage::CellularActivation => "cellular activation",
            Stage::Transfer => "transfer",
            Stage::CellularDeactivation => "cellular deactivation",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    #[error("transport timeout")]
    TransportTimeout,
    #[error("modem rejected")]
    ModemRejected,
    #[error("no GPS fix")]
    GpsNoFix,
    #[error("cellular activation error")]
    CellularActivationError,
    #[error("transfer error")]
    TransferError,
    #[error("protocol violation")]
    ProtocolViolation,
    #[error("link failure")]
    LinkFailure,
    #[error("cancelled")]
    Cancelled,
}

impl From<&ModemError> for FailureCause {
    fn from(e: &ModemError) -> Self {
        match e {
            ModemError::TransportTimeout { .. } => FailureCause::TransportTimeout,
            ModemError::ModemRejected { .. } => FailureCause::ModemRejected,
            ModemError::ProtocolViolation(_) => FailureCause::ProtocolViolation,
            ModemError::Link(_) => FailureCause::LinkFailure,
            ModemError::Cancelled => FailureCause::Cancelled,
        }
    }
}

impl From<&GpsAcquisitionError> for FailureCause {
    fn from(e: &GpsAcquisitionError) -> Self {
        match e {
            GpsAcquisitionError::NoFixTimeout { .. } => FailureCause::GpsNoFix,
            GpsAcquisitionError::ModemRejected(_) => FailureCause::ModemRejected,
            GpsAcquisitionError::PowerOffFailed(inner) | GpsAcquisitionError::Modem(inner) => {
                FailureCause::from(inner)
            }
            GpsAcquisitionError::Cancelled => FailureCause::Cancelled,
        }
    }
}

impl From<&CellularActivationError> for FailureCause {
    fn from(e: &CellularActivationError) -> Self {
        match &e.0 {
            ModemError::ProtocolViolation(_) => FailureCause::CellularActivationError,
            other => FailureCause::from(other),
        }
    }
}

impl From<&TransferError> for FailureCause {
    fn from(e: &TransferError) -> Self {
        match e {
            TransferError::Step { source, .. } => FailureCause::from(source),
            TransferError::Cancelled => FailureCause::Cancelled,
            TransferError::NoDataContext
            | TransferError::InvalidUrl(_)
            | TransferError::PayloadTooLarge { .. }
            | TransferError::HttpStatus(_) => FailureCause::TransferError,
        }
    }
}

/// Terminal failure of an orchestrated run.
#[derive(Error, Debug)]
#[error("{stage} failed ({cause}): {detail}")]
pub struct Failure {
    pub stage: Stage,
    pub cause: FailureCause,
    pub detail: String,
}

impl Failure {
    pub fn new(stage: Stage, cause: FailureCause, detail: impl fmt::Display) -> Self {
        Self {
            stage,
            cause,
            detail: detail.to_string(),
        }
    }

    pub fn cancelled(stage: Stage) -> Self {
        Self::new(stage, FailureCause::Cancelled, "cancelled before stage started")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gps_rejection_maps_to_modem_rejected() {
        let e: GpsAcquisitionError = ModemError::ModemRejected {
            command: "AT+CGNSPWR=1".to_string(),
            reason: "ERROR".to_string(),
        }
        .into();
        assert!(matches!(e, GpsAcquisitionError::ModemRejected(_)));
        assert_eq!(FailureCause::from(&e), FailureCause::ModemRejected);
    }

    #[test]
    fn activation_cause_follows_inner_error() {
        let timeout = CellularActivationError(ModemError::TransportTimeout {
            command: "AT+CNACT=0,1".to_string(),
        });
        assert_eq!(FailureCause::from(&timeout), FailureCause::TransportTimeout);

        let unverified = CellularActivationError(ModemError::ProtocolViolation("no IP".into()));
        assert_eq!(
            FailureCause::from(&unverified),
            FailureCause::CellularActivationError
        );
    }

    #[test]
    fn failure_display_names_stage_and_cause() {
        let f = Failure::new(Stage::Transfer, FailureCause::TransferError, "server answered HTTP 500");
        assert_eq!(
            f.to_string(),
            "transfer failed (transfer error): server answered HTTP 500"
        );
    }
}
