//! HTTPS POST through the modem's built-in HTTP(S) client (`AT+SH*`).
//!
//! Certificate validation is NOT performed: SSL context 1 is bound with an
//! empty CA name, so any server certificate is accepted. This is a known gap
//! of the current transfer path, announced with a warning on every session.

use crate::config::UplinkConfig;
use crate::error::{HttpsStep, ModemError, TransferError};
use crate::executor::CommandExecutor;
use crate::models::{CellularState, Command, RadioState, Response, TransferResult};
use log::{error, info, warn};
use regex::Regex;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

static RE_SHREQ: OnceLock<Regex> = OnceLock::new();

const SSL_CONTEXT: u8 = 1;
const HEADER_LEN: usize = 350;
// Milliseconds the modem waits for body bytes after the prompt
const BODY_INPUT_TIMEOUT_MS: u32 = 10000;

/// Split `https://host[:port]/path` into the base URL the session connects to
/// and the request path.
pub fn split_url(url: &str) -> Result<(String, String), TransferError> {
    let rest = url
        .strip_prefix("https://")
        .ok_or_else(|| TransferError::InvalidUrl(url.to_string()))?;
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    if host.is_empty() {
        return Err(TransferError::InvalidUrl(url.to_string()));
    }
    Ok((format!("https://{}", host), path.to_string()))
}

/// `+SHREQ: "POST",200,15` -> (200, 15)
pub fn parse_request_result(line: &str) -> Option<(u16, usize)> {
    let re = RE_SHREQ.get_or_init(|| Regex::new(r#"^\+SHREQ:\s*"(\w+)",\s*(\d+),\s*(\d+)"#).unwrap());
    let caps = re.captures(line)?;
    let status = caps.get(2)?.as_str().parse().ok()?;
    let len = caps.get(3)?.as_str().parse().ok()?;
    Some((status, len))
}

pub struct HttpsTransfer<'a> {
    exec: &'a mut CommandExecutor,
    radios: &'a RadioState,
    config: &'a UplinkConfig,
    cancel: &'a CancellationToken,
    session_touched: bool,
}

impl<'a> HttpsTransfer<'a> {
    pub fn new(
        exec: &'a mut CommandExecutor,
        radios: &'a RadioState,
        config: &'a UplinkConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            exec,
            radios,
            config,
            cancel,
            session_touched: false,
        }
    }

    /// POST `payload` as JSON to `url`. Once any session command has been
    /// issued, `AT+SHDISC` is sent before returning, whatever the outcome.
    pub async fn post(&mut self, url: &str, payload: &str) -> Result<TransferResult, TransferError> {
        if self.radios.cellular() != CellularState::Active {
            return Err(TransferError::NoDataContext);
        }
        let (base, path) = split_url(url)?;
        if payload.len() > self.config.body_limit {
            return Err(TransferError::PayloadTooLarge {
                len: payload.len(),
                limit: self.config.body_limit,
            });
        }

        let result = self.exchange(&base, &path, payload).await;
        if self.session_touched {
            self.close().await;
        }
        result
    }

    async fn step(&mut self, step: HttpsStep, cmd: Command) -> Result<Response, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.session_touched = true;
        self.exec
            .execute_checked(&cmd)
            .await
            .map_err(|source| TransferError::Step { step, source })
    }

    async fn exchange(
        &mut self,
        base: &str,
        path: &str,
        payload: &str,
    ) -> Result<TransferResult, TransferError> {
        let t = self.config.cmd_timeout;
        let slow = self.config.https_timeout;

        warn!("TLS certificate validation is disabled for {}", base);
        self.step(
            HttpsStep::ConfigureTls,
            Command::at(
                format!("AT+CSSLCFG=\"sslversion\",{},{}", SSL_CONTEXT, self.config.tls_version),
                t,
            ),
        )
        .await?;
        self.step(
            HttpsStep::ConfigureTls,
            Command::at(format!("AT+SHSSL={},\"\"", SSL_CONTEXT), t),
        )
        .await?;

        self.step(
            HttpsStep::Configure,
            Command::at(format!("AT+SHCONF=\"URL\",\"{}\"", base), t),
        )
        .await?;
        self.step(
            HttpsStep::Configure,
            Command::at(format!("AT+SHCONF=\"BODYLEN\",{}", self.config.body_limit), t),
        )
        .await?;
        self.step(
            HttpsStep::Configure,
            Command::at(format!("AT+SHCONF=\"HEADERLEN\",{}", HEADER_LEN), t),
        )
        .await?;

        info!("Opening HTTPS session to {}", base);
        self.step(HttpsStep::Connect, Command::at("AT+SHCONN", slow)).await?;

        self.step(HttpsStep::SetHeaders, Command::at("AT+SHCHEAD", t)).await?;
        self.step(
            HttpsStep::SetHeaders,
            Command::at("AT+SHAHEAD=\"Content-Type\",\"application/json\"", t),
        )
        .await?;

        self.step(
            HttpsStep::WriteBody,
            Command::at(
                format!("AT+SHBOD={},{}", payload.len(), BODY_INPUT_TIMEOUT_MS),
                t,
            )
            .terminated_by(&[">"]),
        )
        .await?;
        self.step(HttpsStep::WriteBody, Command::data(payload, t)).await?;

        info!("POST {}{} ({} bytes)", base, path, payload.len());
        let resp = self
            .step(
                HttpsStep::Request,
                Command::at(format!("AT+SHREQ=\"{}\",3", path), slow).terminated_by(&["+SHREQ:"]),
            )
            .await?;
        let line = resp.terminal_line().unwrap_or_default();
        let (http_status, len) = parse_request_result(line).ok_or_else(|| TransferError::Step {
            step: HttpsStep::Request,
            source: ModemError::ProtocolViolation(format!("unreadable request result: {}", line)),
        })?;
        info!("Server answered HTTP {} with {} bytes", http_status, len);

        let body = if len > 0 {
            self.read_body(len).await?
        } else {
            None
        };

        Ok(TransferResult { http_status, body })
    }

    async fn read_body(&mut self, len: usize) -> Result<Option<String>, TransferError> {
        let len = len.min(self.config.body_limit);
        self.step(
            HttpsStep::ReadBody,
            Command::at(format!("AT+SHREAD=0,{}", len), self.config.cmd_timeout)
                .terminated_by(&["+SHREAD:"]),
        )
        .await?;
        let collected = self
            .exec
            .collect(self.config.cmd_timeout, Some(len))
            .await
            .map_err(|e| TransferError::Step {
                step: HttpsStep::ReadBody,
                source: e.into(),
            })?;
        let body = collected.lines.join("\n");
        Ok(if body.is_empty() { None } else { Some(body) })
    }

    async fn close(&mut self) {
        let cmd = Command::at("AT+SHDISC", self.config.cmd_timeout);
        match self.exec.execute_checked(&cmd).await {
            Ok(_) => info!("HTTPS session closed"),
            Err(e) => error!("Failed to close HTTPS session: {}", e),
        }
    }
}
