//! Unsolicited result codes pushed by the modem outside command/response
//! pairing. They are kept in the `Response` line list; this module only
//! classifies them.

use regex::Regex;
use std::sync::OnceLock;

static RE_APP_PDP: OnceLock<Regex> = OnceLock::new();
static RE_SHSTATE: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Urc {
    /// Module finished booting.
    Ready,
    /// Packet data context state change, e.g. `+APP PDP: 0,DEACTIVE`.
    PdpState { context: u8, active: bool },
    /// HTTP(S) session state, `+SHSTATE: 0` means the server closed it.
    HttpsState { connected: bool },
    SimStatus(String),
    Functionality(String),
    PowerDown,
    UnderVoltage,
    Other(String),
}

const PREFIXES: &[&str] = &[
    "RDY",
    "+APP PDP:",
    "+SHSTATE:",
    "+CPIN:",
    "+CFUN:",
    "+CGEV:",
    "SMS Ready",
    "NORMAL POWER DOWN",
    "UNDER-VOLTAGE",
];

pub fn is_unsolicited(line: &str) -> bool {
    PREFIXES.iter().any(|p| line.starts_with(p))
}

pub fn parse(line: &str) -> Option<Urc> {
    if !is_unsolicited(line) {
        return None;
    }

    if line == "RDY" {
        return Some(Urc::Ready);
    }
    if line.starts_with("NORMAL POWER DOWN") {
        return Some(Urc::PowerDown);
    }
    if line.starts_with("UNDER-VOLTAGE") {
        return Some(Urc::UnderVoltage);
    }
    if let Some(rest) = line.strip_prefix("+CPIN:") {
        return Some(Urc::SimStatus(rest.trim().to_string()));
    }
    if let Some(rest) = line.strip_prefix("+CFUN:") {
        return Some(Urc::Functionality(rest.trim().to_string()));
    }

    let re = RE_APP_PDP.get_or_init(|| Regex::new(r"^\+APP PDP:\s*(\d+),\s*(\w+)").unwrap());
    if let Some(caps) = re.captures(line) {
        let context = caps.get(1).map_or("0", |m| m.as_str()).parse().unwrap_or(0);
        let active = caps.get(2).map_or(false, |m| m.as_str() == "ACTIVE");
        return Some(Urc::PdpState { context, active });
    }

    let re = RE_SHSTATE.get_or_init(|| Regex::new(r"^\+SHSTATE:\s*(\d)").unwrap());
    if let Some(caps) = re.captures(line) {
        let connected = caps.get(1).map_or(false, |m| m.as_str() == "1");
        return Some(Urc::HttpsState { connected });
    }

    Some(Urc::Other(line.to_string()))
}
