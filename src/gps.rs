//! GPS session: power the GNSS engine on, poll `AT+CGNSINF` until a fix or
//! the poll budget runs out, then always power it off again.

use crate::config::UplinkConfig;
use crate::error::{GpsAcquisitionError, ModemError};
use crate::executor::CommandExecutor;
use crate::models::{Command, FixQuality, GpsFix, GpsPower, RadioState, ResponseStatus};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use log::{debug, error, info, warn};
use std::fmt;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

const GPS_ON: &str = "AT+CGNSPWR=1";
const GPS_OFF: &str = "AT+CGNSPWR=0";
const GPS_INFO: &str = "AT+CGNSINF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsPhase {
    Idle,
    PoweringOn,
    Polling,
    FixAcquired,
    PollTimeout,
    PoweringOff,
}

impl GpsPhase {
    /// Phase reached once polling has ended, if the outcome has one of its own.
    fn settled_by<T>(outcome: &Result<T, GpsAcquisitionError>) -> Option<Self> {
        match outcome {
            Ok(_) => Some(GpsPhase::FixAcquired),
            Err(GpsAcquisitionError::NoFixTimeout { .. }) => Some(GpsPhase::PollTimeout),
            Err(_) => None,
        }
    }
}

/// One `+CGNSINF` record. Empty fields are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GnssInfo {
    pub run_status: Option<u8>,
    pub fix_status: Option<u8>,
    pub utc: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub msl_altitude: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub course: Option<f64>,
    pub fix_mode: Option<u8>,
    pub hdop: Option<f64>,
    pub pdop: Option<f64>,
    pub vdop: Option<f64>,
    pub satellites_in_view: Option<u32>,
    pub hpa: Option<f64>,
    pub vpa: Option<f64>,
}

impl GnssInfo {
    /// Parse `+CGNSINF: <run>,<fix>,<utc>,<lat>,<lon>,<alt>,...`.
    pub fn parse(line: &str) -> Result<Self, ModemError> {
        let body = line
            .strip_prefix("+CGNSINF:")
            .ok_or_else(|| ModemError::ProtocolViolation(format!("not a CGNSINF line: {}", line)))?;
        let fields: Vec<&str> = body.split(',').map(|f| f.trim()).collect();
        if fields.len() < 2 {
            return Err(ModemError::ProtocolViolation(format!(
                "truncated CGNSINF line: {}",
                line
            )));
        }

        let field = |i: usize| fields.get(i).copied().filter(|f| !f.is_empty());
        let num = |i: usize| -> Result<Option<f64>, ModemError> {
            field(i)
                .map(|f| {
                    f.parse::<f64>().map_err(|_| {
                        ModemError::ProtocolViolation(format!("bad CGNSINF field {}: {}", i, f))
                    })
                })
                .transpose()
        };
        let int = |i: usize| field(i).and_then(|f| f.parse().ok());

        Ok(Self {
            run_status: int(0),
            fix_status: int(1),
            utc: field(2).and_then(parse_utc),
            latitude: num(3)?,
            longitude: num(4)?,
            msl_altitude: num(5)?,
            speed_kmh: num(6)?,
            course: num(7)?,
            fix_mode: int(8),
            hdop: num(10)?,
            pdop: num(11)?,
            vdop: num(12)?,
            satellites_in_view: field(14).and_then(|f| f.parse().ok()),
            hpa: num(16)?,
            vpa: num(17)?,
        })
    }

    pub fn quality(&self) -> FixQuality {
        if self.fix_status != Some(1) || self.latitude.is_none() || self.longitude.is_none() {
            FixQuality::NoFix
        } else if self.msl_altitude.is_some() {
            FixQuality::Fix3D
        } else {
            FixQuality::Fix2D
        }
    }

    pub fn to_fix(&self) -> Option<GpsFix> {
        GpsFix::new(
            self.latitude?,
            self.longitude?,
            self.quality(),
            self.utc,
        )
    }
}

impl fmt::Display for GnssInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn opt<T: fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
        }
        write!(
            f,
            "run={} fix={} utc={} lat={} lon={} alt={} speed={} course={} mode={} \
             hdop={} pdop={} vdop={} sats={} hpa={} vpa={}",
            opt(&self.run_status),
            opt(&self.fix_status),
            opt(&self.utc.map(|t| t.to_rfc3339())),
            opt(&self.latitude),
            opt(&self.longitude),
            opt(&self.msl_altitude),
            opt(&self.speed_kmh),
            opt(&self.course),
            opt(&self.fix_mode),
            opt(&self.hdop),
            opt(&self.pdop),
            opt(&self.vdop),
            opt(&self.satellites_in_view),
            opt(&self.hpa),
            opt(&self.vpa),
        )
    }
}

/// `yyyyMMddhhmmss.sss`
fn parse_utc(s: &str) -> Option<DateTime<Utc>> {
    if s.len() < 14 || !s.is_char_boundary(14) {
        return None;
    }
    let digits = |from: usize, to: usize| s.get(from..to)?.parse::<u32>().ok();
    let year = s.get(0..4)?.parse::<i32>().ok()?;
    let millis = s
        .get(15..)
        .and_then(|frac| format!("{:0<3}", frac).get(0..3)?.parse::<u32>().ok())
        .unwrap_or(0);
    let naive = NaiveDate::from_ymd_opt(year, digits(4, 6)?, digits(6, 8)?)?.and_hms_milli_opt(
        digits(8, 10)?,
        digits(10, 12)?,
        digits(12, 14)?,
        millis,
    )?;
    Some(Utc.from_utc_datetime(&naive))
}

pub struct GpsSession<'a> {
    exec: &'a mut CommandExecutor,
    radios: &'a mut RadioState,
    config: &'a UplinkConfig,
    cancel: &'a CancellationToken,
    phase: GpsPhase,
}

impl<'a> GpsSession<'a> {
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
            phase: GpsPhase::Idle,
        }
    }

    fn enter(&mut self, phase: GpsPhase) {
        info!("GPS: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Number of fix queries allowed by the configured wait and interval.
    pub fn poll_budget(config: &UplinkConfig) -> u32 {
        let interval = config.gps_poll_interval.as_millis().max(1);
        let polls = config.gps_max_wait.as_millis() / interval;
        polls.clamp(1, u32::MAX as u128) as u32
    }

    /// Acquire a fix. Whatever happens after power on, the power off step
    /// runs before this returns.
    pub async fn acquire(mut self) -> Result<GpsFix, GpsAcquisitionError> {
        if self.cancel.is_cancelled() {
            return Err(GpsAcquisitionError::Cancelled);
        }

        self.enter(GpsPhase::PoweringOn);
        let outcome = match self.power_on().await {
            Ok(()) => {
                self.enter(GpsPhase::Polling);
                self.poll().await
            }
            Err(e) => Err(e),
        };
        if let Some(phase) = GpsPhase::settled_by(&outcome) {
            self.enter(phase);
        }

        self.enter(GpsPhase::PoweringOff);
        let released = self.power_off().await;
        self.enter(GpsPhase::Idle);

        match (outcome, released) {
            (Ok(fix), Ok(())) => Ok(fix),
            (Ok(_), Err(e)) => {
                error!("GPS power off failed after a fix: {}", e);
                Err(GpsAcquisitionError::PowerOffFailed(e))
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(off)) => {
                error!("GPS power off failed: {}", off);
                Err(e)
            }
        }
    }

    async fn power_on(&mut self) -> Result<(), GpsAcquisitionError> {
        // Counted as on from here: a timed out enable may still have taken effect.
        self.radios.gps = GpsPower::On;
        let cmd = Command::at(GPS_ON, self.config.cmd_timeout);
        self.exec.execute_checked(&cmd).await?;
        info!("GPS power on success");
        Ok(())
    }

    async fn poll(&mut self) -> Result<GpsFix, GpsAcquisitionError> {
        let budget = Self::poll_budget(self.config);
        let started = Instant::now();
        let cmd = Command::at(GPS_INFO, self.config.cmd_timeout);
        let mut sent = 0;

        for attempt in 1..=budget {
            if self.cancel.is_cancelled() {
                return Err(GpsAcquisitionError::Cancelled);
            }

            debug!("Requesting GPS information ({}/{})", attempt, budget);
            sent = attempt;
            let resp = self
                .exec
                .execute(&cmd)
                .await
                .map_err(|e| GpsAcquisitionError::Modem(e.into()))?;

            match resp.status {
                ResponseStatus::Ok => match resp.line_with_prefix("+CGNSINF:").map(GnssInfo::parse) {
                    Some(Ok(info)) => {
                        if let Some(fix) = info.to_fix() {
                            info!(
                                "GPS fix {:?} at {}, {} ({} satellites)",
                                fix.quality,
                                fix.latitude,
                                fix.longitude,
                                info.satellites_in_view.unwrap_or(0)
                            );
                            debug!("GNSS report: {}", info);
                            info!("{}", fix.map_link());
                            return Ok(fix);
                        }
                        info!("Waiting for GPS lock ({}/{})", attempt, budget);
                    }
                    Some(Err(e)) => warn!("Unreadable GPS report: {}", e),
                    None => warn!("CGNSINF answered without a report"),
                },
                ResponseStatus::Error | ResponseStatus::Timeout | ResponseStatus::Unsolicited => {
                    warn!("Failed reading from GPS: {:?}", resp.status);
                }
            }

            if attempt == budget || started.elapsed() >= self.config.gps_max_wait {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(GpsAcquisitionError::Cancelled),
                _ = sleep(self.config.gps_poll_interval) => {}
            }
        }

        warn!("No GPS fix after {} polls within {:?}", sent, self.config.gps_max_wait);
        Err(GpsAcquisitionError::NoFixTimeout { polls: sent })
    }

    async fn power_off(&mut self) -> Result<(), ModemError> {
        let cmd = Command::at(GPS_OFF, self.config.cmd_timeout);
        self.exec.execute_checked(&cmd).await?;
        self.radios.gps = GpsPower::Off;
        info!("GPS power off success");
        Ok(())
    }
}
