use crate::error::ModemError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `AT...` line, terminated with CRLF on the wire.
    At,
    /// Raw bytes answering a `>` prompt, written without a line ending.
    Data,
}

/// A single request to the modem. Built per call and dropped once the
/// response has been classified.
#[derive(Debug, Clone)]
pub struct Command {
    text: String,
    terminators: Vec<String>,
    timeout: Duration,
    kind: CommandKind,
}

impl Command {
    pub fn at(text: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            terminators: vec!["OK".to_string()],
            timeout,
            kind: CommandKind::At,
        }
    }

    pub fn data(body: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: body.into(),
            terminators: vec!["OK".to_string()],
            timeout,
            kind: CommandKind::Data,
        }
    }

    /// Replace the terminator set. A received line terminates the command
    /// when it equals a terminator or starts with one.
    pub fn terminated_by(mut self, terminators: &[&str]) -> Self {
        self.terminators = terminators.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn is_terminator(&self, line: &str) -> bool {
        self.terminators
            .iter()
            .any(|t| line == t || line.starts_with(t.as_str()))
    }

    /// Text used in logs and error messages. Payload bodies are not echoed.
    pub fn label(&self) -> String {
        match self.kind {
            CommandKind::At => self.text.clone(),
            CommandKind::Data => format!("<{} bytes of data>", self.text.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Error,
    Timeout,
    /// Lines collected while no command was outstanding.
    Unsolicited,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub command: String,
    pub lines: Vec<String>,
    pub status: ResponseStatus,
}

impl Response {
    pub fn new(command: String, lines: Vec<String>, status: ResponseStatus) -> Self {
        Self {
            command,
            lines,
            status,
        }
    }

    /// The line that resolved the command (terminator or error line).
    pub fn terminal_line(&self) -> Option<&str> {
        match self.status {
            ResponseStatus::Ok | ResponseStatus::Error => self.lines.last().map(|s| s.as_str()),
            _ => None,
        }
    }

    pub fn line_with_prefix(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .map(|s| s.as_str())
            .find(|line| line.starts_with(prefix))
    }

    /// Lines recognised as unsolicited result codes, in arrival order.
    pub fn unsolicited(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .map(|s| s.as_str())
            .filter(|line| crate::urc::is_unsolicited(line))
    }

    pub fn into_result(self) -> Result<Response, ModemError> {
        match self.status {
            ResponseStatus::Ok | ResponseStatus::Unsolicited => Ok(self),
            ResponseStatus::Error => Err(ModemError::ModemRejected {
                reason: self.lines.last().cloned().unwrap_or_else(|| "ERROR".to_string()),
                command: self.command,
            }),
            ResponseStatus::Timeout => Err(ModemError::TransportTimeout {
                command: self.command,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixQuality {
    NoFix,
    #[serde(rename = "2d")]
    Fix2D,
    #[serde(rename = "3d")]
    Fix3D,
}

/// A position with a usable fix. Never constructed with `FixQuality::NoFix`.
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub quality: FixQuality,
    pub timestamp: Option<DateTime<Utc>>,
}

impl GpsFix {
    pub fn new(
        latitude: f64,
        longitude: f64,
        quality: FixQuality,
        timestamp: Option<DateTime<Utc>>,
    ) -> Option<Self> {
        if quality == FixQuality::NoFix {
            return None;
        }
        Some(Self {
            latitude,
            longitude,
            quality,
            timestamp,
        })
    }

    pub fn map_link(&self) -> String {
        format!(
            "https://www.google.com/maps/search/?api=1&query={},{}",
            self.latitude, self.longitude
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpsPower {
    #[default]
    Off,
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CellularState {
    #[default]
    Inactive,
    Activating,
    Active,
    Deactivating,
}

/// Power state of every radio on the modem. Owned by the orchestrator and
/// only changed by the GPS and cellular session managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RadioState {
    pub(crate) gps: GpsPower,
    pub(crate) cellular: CellularState,
}

impl RadioState {
    pub fn gps(&self) -> GpsPower {
        self.gps
    }

    pub fn cellular(&self) -> CellularState {
        self.cellular
    }

    pub fn is_idle(&self) -> bool {
        self.gps == GpsPower::Off && self.cellular == CellularState::Inactive
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub http_status: u16,
    pub body: Option<String>,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.http_status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionType {
    Network,
    Serial,
}
