use crate::connection::Transport;
use crate::error::{ModemError, TransportError};
use crate::models::{Command, CommandKind, Response, ResponseStatus};
use crate::urc;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::time::Instant;

/// Issues one command at a time and classifies what comes back.
///
/// Holding `&mut self` for the whole exchange is what keeps a single command
/// outstanding on the half-duplex link. No retries happen here.
pub struct CommandExecutor {
    transport: Box<dyn Transport>,
}

impl CommandExecutor {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send `command` and read lines until a terminator, an error line or the
    /// command's timeout.
    ///
    /// A read timeout is reported as `ResponseStatus::Timeout`; `Err` is only
    /// returned when the link itself is broken.
    pub async fn execute(&mut self, command: &Command) -> Result<Response, TransportError> {
        let label = command.label();
        debug!("SND: {}", label);
        match command.kind() {
            CommandKind::At => self.transport.write(&format!("{}\r\n", command.text())).await?,
            CommandKind::Data => self.transport.write(command.text()).await?,
        }

        let deadline = Instant::now() + command.timeout();
        let mut lines = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("No terminator for {} within {:?}", label, command.timeout());
                return Ok(Response::new(label, lines, ResponseStatus::Timeout));
            }

            let line = match self.transport.read_line(remaining).await {
                Ok(line) => line,
                Err(TransportError::Timeout) => {
                    warn!("No terminator for {} within {:?}", label, command.timeout());
                    return Ok(Response::new(label, lines, ResponseStatus::Timeout));
                }
                Err(e) => return Err(e),
            };
            debug!("RCV: {}", line);

            // echo
            if line == command.text() {
                continue;
            }

            if command.is_terminator(&line) {
                lines.push(line);
                return Ok(Response::new(label, lines, ResponseStatus::Ok));
            }
            if is_error_line(&line) {
                warn!("{} answered {}", label, line);
                lines.push(line);
                return Ok(Response::new(label, lines, ResponseStatus::Error));
            }
            if let Some(urc) = urc::parse(&line) {
                info!("Unsolicited: {:?}", urc);
            }
            lines.push(line);
        }
    }

    /// `execute`, with anything but `OK` turned into a `ModemError`.
    pub async fn execute_checked(&mut self, command: &Command) -> Result<Response, ModemError> {
        self.execute(command).await?.into_result()
    }

    /// Read lines with no command outstanding, until `wait` elapses or at
    /// least `expected_bytes` of text have arrived.
    pub async fn collect(
        &mut self,
        wait: Duration,
        expected_bytes: Option<usize>,
    ) -> Result<Response, TransportError> {
        let deadline = Instant::now() + wait;
        let mut lines: Vec<String> = Vec::new();

        loop {
            if let Some(expected) = expected_bytes {
                if joined_len(&lines) >= expected {
                    break;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.transport.read_line(remaining).await {
                Ok(line) => {
                    debug!("RCV: {}", line);
                    if let Some(urc) = urc::parse(&line) {
                        info!("Unsolicited: {:?}", urc);
                    }
                    lines.push(line);
                }
                Err(TransportError::Timeout) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(Response::new(
            "<unsolicited>".to_string(),
            lines,
            ResponseStatus::Unsolicited,
        ))
    }
}

fn is_error_line(line: &str) -> bool {
    line == "ERROR" || line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR")
}

fn joined_len(lines: &[String]) -> usize {
    let text: usize = lines.iter().map(|l| l.len()).sum();
    text + lines.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeModem;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[tokio::test]
    async fn ok_terminates_and_keeps_intermediate_lines() {
        let modem = FakeModem::new().on("AT+CNACT?", &["+CNACT: 0,1,\"10.0.0.1\"", "OK"]);
        let mut exec = CommandExecutor::new(Box::new(modem));

        let resp = exec.execute(&Command::at("AT+CNACT?", secs(1))).await.unwrap();
        assert_eq!(resp.status, ResponseStatus::Ok);
        assert_eq!(resp.lines, vec!["+CNACT: 0,1,\"10.0.0.1\"", "OK"]);
        assert_eq!(resp.terminal_line(), Some("OK"));
    }

    #[tokio::test]
    async fn echo_is_dropped() {
        let modem = FakeModem::new().on("AT", &["AT", "OK"]);
        let mut exec = CommandExecutor::new(Box::new(modem));

        let resp = exec.execute(&Command::at("AT", secs(1))).await.unwrap();
        assert_eq!(resp.lines, vec!["OK"]);
    }

    #[tokio::test]
    async fn cme_error_is_classified_as_error() {
        let modem = FakeModem::new().on("AT+CGNSPWR=1", &["+CME ERROR: 50"]);
        let mut exec = CommandExecutor::new(Box::new(modem));

        let resp = exec
            .execute(&Command::at("AT+CGNSPWR=1", secs(1)))
            .await
            .unwrap();
        assert_eq!(resp.status, ResponseStatus::Error);
        assert!(matches!(
            resp.into_result(),
            Err(ModemError::ModemRejected { .. })
        ));
    }

    #[tokio::test]
    async fn silence_is_a_timeout_status_not_an_error() {
        let modem = FakeModem::new().on("AT+SHCONN", &[]);
        let mut exec = CommandExecutor::new(Box::new(modem));

        let resp = exec.execute(&Command::at("AT+SHCONN", secs(1))).await.unwrap();
        assert_eq!(resp.status, ResponseStatus::Timeout);
        assert!(matches!(
            resp.into_result(),
            Err(ModemError::TransportTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn unsolicited_lines_are_retained_in_order() {
        let modem = FakeModem::new().on(
            "AT+CGNSINF",
            &["+APP PDP: 0,DEACTIVE", "+CGNSINF: 1,0,,,,,,,,,,,,,,,,,,,", "OK"],
        );
        let mut exec = CommandExecutor::new(Box::new(modem));

        let resp = exec.execute(&Command::at("AT+CGNSINF", secs(1))).await.unwrap();
        assert_eq!(resp.lines.len(), 3);
        assert_eq!(
            resp.unsolicited().collect::<Vec<_>>(),
            vec!["+APP PDP: 0,DEACTIVE"]
        );
        assert!(resp.line_with_prefix("+CGNSINF:").is_some());
    }

    #[tokio::test]
    async fn custom_terminator_skips_past_ok() {
        let modem = FakeModem::new().on(
            "AT+SHREQ=\"/ingest\",3",
            &["OK", "+SHREQ: \"POST\",200,2"],
        );
        let mut exec = CommandExecutor::new(Box::new(modem));

        let cmd = Command::at("AT+SHREQ=\"/ingest\",3", secs(1)).terminated_by(&["+SHREQ:"]);
        let resp = exec.execute(&cmd).await.unwrap();
        assert_eq!(resp.status, ResponseStatus::Ok);
        assert_eq!(resp.terminal_line(), Some("+SHREQ: \"POST\",200,2"));
    }

    #[tokio::test]
    async fn closed_link_is_an_error() {
        let modem = FakeModem::new().on("AT", &["OK"]);
        let handle = modem.handle();
        handle.close();
        let mut exec = CommandExecutor::new(Box::new(modem));

        let err = exec.execute(&Command::at("AT", secs(1))).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn collect_stops_at_expected_length() {
        let modem = FakeModem::new().on("AT+SHREAD=0,11", &["OK", "+SHREAD: 11", "{\"ok\":true}"]);
        let mut exec = CommandExecutor::new(Box::new(modem));

        let cmd = Command::at("AT+SHREAD=0,11", secs(1)).terminated_by(&["+SHREAD:"]);
        exec.execute(&cmd).await.unwrap();
        let body = exec.collect(secs(1), Some(11)).await.unwrap();
        assert_eq!(body.status, ResponseStatus::Unsolicited);
        assert_eq!(body.lines, vec!["{\"ok\":true}"]);
    }
}
