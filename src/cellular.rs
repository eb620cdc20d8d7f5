use crate::config::UplinkConfig;
use crate::error::{CellularActivationError, ModemError};
use crate::executor::CommandExecutor;
use crate::models::{CellularState, Command, RadioState, Response};
use log::{info, warn};
use regex::Regex;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

static RE_CNACT: OnceLock<Regex> = OnceLock::new();

const PDP_CONTEXT: u8 = 0;

/// An activated packet data context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveContext {
    pub context: u8,
    pub ip: String,
}

/// Find `context` in an `AT+CNACT?` answer, e.g. `+CNACT: 0,1,"10.52.0.113"`.
pub fn parse_context(resp: &Response, context: u8) -> Option<ActiveContext> {
    let re = RE_CNACT.get_or_init(|| Regex::new(r#"^\+CNACT:\s*(\d+),\s*(\d+),\s*"([^"]*)""#).unwrap());
    resp.lines.iter().find_map(|line| {
        let caps = re.captures(line)?;
        let id: u8 = caps.get(1)?.as_str().parse().ok()?;
        let state = caps.get(2)?.as_str();
        let ip = caps.get(3)?.as_str();
        if id != context || state != "1" || ip.is_empty() || ip == "0.0.0.0" {
            return None;
        }
        Some(ActiveContext {
            context: id,
            ip: ip.to_string(),
        })
    })
}

pub struct CellularSession<'a> {
    exec: &'a mut CommandExecutor,
    radios: &'a mut RadioState,
    config: &'a UplinkConfig,
    cancel: &'a CancellationToken,
}

impl<'a> CellularSession<'a> {
    pub fn new(
        exec: &'a mut CommandExecutor,
        radios: &'a mut RadioState,
        config: &'a UplinkConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            exec,
            radios,
            config,
            cancel,
        }
    }

    fn enter(&mut self, state: CellularState) {
        info!("Cellular: {:?} -> {:?}", self.radios.cellular, state);
        self.radios.cellular = state;
    }

    /// Bring the data context up. On failure the context is `Inactive` again
    /// when this returns.
    pub async fn activate(&mut self) -> Result<ActiveContext, CellularActivationError> {
        if self.cancel.is_cancelled() {
            return Err(CellularActivationError(ModemError::Cancelled));
        }
        self.enter(CellularState::Activating);

        if let Some(apn) = self.config.apn.clone() {
            let cmd = Command::at(
                format!("AT+CNCFG={},1,\"{}\"", PDP_CONTEXT, apn),
                self.config.cmd_timeout,
            );
            if let Err(e) = self.exec.execute_checked(&cmd).await {
                self.enter(CellularState::Inactive);
                return Err(CellularActivationError(e));
            }
            if self.cancel.is_cancelled() {
                self.enter(CellularState::Inactive);
                return Err(CellularActivationError(ModemError::Cancelled));
            }
        }

        // OK arrives first, the context state follows as +APP PDP
        let cmd = Command::at(format!("AT+CNACT={},1", PDP_CONTEXT), self.config.https_timeout)
            .terminated_by(&["+APP PDP:"]);
        if let Err(e) = self.exec.execute_checked(&cmd).await {
            self.enter(CellularState::Inactive);
            return Err(CellularActivationError(e));
        }

        let query = Command::at("AT+CNACT?", self.config.cmd_timeout);
        let verified = match self.exec.execute_checked(&query).await {
            Ok(resp) => parse_context(&resp, PDP_CONTEXT).ok_or_else(|| {
                ModemError::ProtocolViolation(format!(
                    "context {} has no address after activation",
                    PDP_CONTEXT
                ))
            }),
            Err(e) => Err(e),
        };

        match verified {
            Ok(ctx) => {
                self.enter(CellularState::Active);
                info!("Packet data context {} active with IP {}", ctx.context, ctx.ip);
                Ok(ctx)
            }
            Err(e) => {
                // The modem accepted activation, so tear it down before reporting
                self.enter(CellularState::Active);
                if let Err(off) = self.deactivate().await {
                    warn!("Deactivation after failed verification failed: {}", off);
                }
                Err(CellularActivationError(e))
            }
        }
    }

    /// Tear the context down. Not cancellable.
    pub async fn deactivate(&mut self) -> Result<(), ModemError> {
        self.enter(CellularState::Deactivating);
        let cmd = Command::at(format!("AT+CNACT={},0", PDP_CONTEXT), self.config.cmd_timeout);
        match self.exec.execute_checked(&cmd).await {
            Ok(_) => {
                self.enter(CellularState::Inactive);
                Ok(())
            }
            Err(e) => {
                // Still up as far as we know
                self.enter(CellularState::Active);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeModem;
    use crate::models::ResponseStatus;

    const ACTIVATE: &str = "AT+CNACT=0,1";
    const DEACTIVATE: &str = "AT+CNACT=0,0";
    const QUERY: &str = "AT+CNACT?";

    fn session_parts(modem: FakeModem) -> (CommandExecutor, RadioState, UplinkConfig, CancellationToken) {
        (
            CommandExecutor::new(Box::new(modem)),
            RadioState::default(),
            UplinkConfig::default(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn finds_active_context_address() {
        let resp = Response::new(
            QUERY.to_string(),
            vec![
                "+CNACT: 0,1,\"10.52.0.113\"".to_string(),
                "+CNACT: 1,0,\"0.0.0.0\"".to_string(),
                "OK".to_string(),
            ],
            ResponseStatus::Ok,
        );
        assert_eq!(
            parse_context(&resp, 0),
            Some(ActiveContext {
                context: 0,
                ip: "10.52.0.113".to_string()
            })
        );
        assert_eq!(parse_context(&resp, 1), None);
    }

    #[tokio::test]
    async fn activates_and_deactivates() {
        let modem = FakeModem::new()
            .on(ACTIVATE, &["OK", "+APP PDP: 0,ACTIVE"])
            .on(QUERY, &["+CNACT: 0,1,\"10.0.0.7\"", "OK"])
            .on(DEACTIVATE, &["OK"]);
        let handle = modem.handle();
        let (mut exec, mut radios, cfg, cancel) = session_parts(modem);
        let mut session = CellularSession::new(&mut exec, &mut radios, &cfg, &cancel);

        let ctx = session.activate().await.unwrap();
        assert_eq!(ctx.ip, "10.0.0.7");
        session.deactivate().await.unwrap();

        assert_eq!(radios.cellular(), CellularState::Inactive);
        assert_eq!(handle.written(), vec![ACTIVATE, QUERY, DEACTIVATE]);
    }

    #[tokio::test]
    async fn defines_apn_when_configured() {
        let modem = FakeModem::new()
            .on("AT+CNCFG=0,1,\"iot.example\"", &["OK"])
            .on(ACTIVATE, &["OK", "+APP PDP: 0,ACTIVE"])
            .on(QUERY, &["+CNACT: 0,1,\"10.0.0.7\"", "OK"]);
        let handle = modem.handle();
        let (mut exec, mut radios, mut cfg, cancel) = session_parts(modem);
        cfg.apn = Some("iot.example".to_string());

        CellularSession::new(&mut exec, &mut radios, &cfg, &cancel)
            .activate()
            .await
            .unwrap();

        assert_eq!(handle.written()[0], "AT+CNCFG=0,1,\"iot.example\"");
        assert_eq!(radios.cellular(), CellularState::Active);
    }

    #[tokio::test]
    async fn rejected_activation_goes_straight_to_inactive() {
        let modem = FakeModem::new().on(ACTIVATE, &["ERROR"]);
        let handle = modem.handle();
        let (mut exec, mut radios, cfg, cancel) = session_parts(modem);

        let err = CellularSession::new(&mut exec, &mut radios, &cfg, &cancel)
            .activate()
            .await
            .unwrap_err();

        assert!(matches!(err.0, ModemError::ModemRejected { .. }));
        assert_eq!(radios.cellular(), CellularState::Inactive);
        assert_eq!(handle.count(DEACTIVATE), 0);
    }

    #[tokio::test]
    async fn timed_out_activation_goes_straight_to_inactive() {
        let modem = FakeModem::new().on(ACTIVATE, &["OK"]);
        let handle = modem.handle();
        let (mut exec, mut radios, cfg, cancel) = session_parts(modem);

        let err = CellularSession::new(&mut exec, &mut radios, &cfg, &cancel)
            .activate()
            .await
            .unwrap_err();

        assert!(matches!(err.0, ModemError::TransportTimeout { .. }));
        assert_eq!(radios.cellular(), CellularState::Inactive);
        assert_eq!(handle.count(DEACTIVATE), 0);
    }

    #[tokio::test]
    async fn unverified_activation_is_torn_down() {
        let modem = FakeModem::new()
            .on(ACTIVATE, &["OK", "+APP PDP: 0,DEACTIVE"])
            .on(QUERY, &["+CNACT: 0,0,\"0.0.0.0\"", "OK"])
            .on(DEACTIVATE, &["OK"]);
        let handle = modem.handle();
        let (mut exec, mut radios, cfg, cancel) = session_parts(modem);

        let err = CellularSession::new(&mut exec, &mut radios, &cfg, &cancel)
            .activate()
            .await
            .unwrap_err();

        assert!(matches!(err.0, ModemError::ProtocolViolation(_)));
        assert_eq!(handle.count(DEACTIVATE), 1);
        assert_eq!(radios.cellular(), CellularState::Inactive);
    }

    #[tokio::test]
    async fn failed_deactivation_leaves_context_active() {
        let modem = FakeModem::new()
            .on(ACTIVATE, &["OK", "+APP PDP: 0,ACTIVE"])
            .on(QUERY, &["+CNACT: 0,1,\"10.0.0.7\"", "OK"])
            .on(DEACTIVATE, &["+CME ERROR: 4"]);
        let (mut exec, mut radios, cfg, cancel) = session_parts(modem);
        let mut session = CellularSession::new(&mut exec, &mut radios, &cfg, &cancel);

        session.activate().await.unwrap();
        assert!(session.deactivate().await.is_err());
        assert_eq!(radios.cellular(), CellularState::Active);
    }
}
