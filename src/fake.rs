//! Scripted modem for tests.

use crate::connection::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DATA_KEY: &str = "<data>";

#[derive(Default)]
struct Script {
    // Each reply set is used once, the last one repeats.
    replies: HashMap<String, (Vec<Vec<String>>, usize)>,
    pending: VecDeque<String>,
    written: Vec<String>,
    closed: bool,
    cancel_on: Option<(String, CancellationToken)>,
    read_delay: Duration,
}

impl Script {
    fn respond(&mut self, key: &str) {
        let lines = match self.replies.get_mut(key) {
            Some((sets, next)) => {
                let idx = (*next).min(sets.len() - 1);
                *next += 1;
                sets[idx].clone()
            }
            None => vec!["ERROR".to_string()],
        };
        self.pending.extend(lines);
    }
}

/// Answers each written command from a per-command script and records every
/// write. Unknown commands get `ERROR`; an empty reply makes reads time out.
#[derive(Clone, Default)]
pub struct FakeModem {
    script: Arc<Mutex<Script>>,
}

/// Shared view of a `FakeModem` that stays usable after the modem is boxed.
#[derive(Clone)]
pub struct FakeHandle {
    script: Arc<Mutex<Script>>,
}

impl FakeModem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply to `command`. Replies are used in order and the last
    /// one repeats.
    pub fn on(self, command: &str, reply: &[&str]) -> Self {
        self.script
            .lock()
            .unwrap()
            .replies
            .entry(command.to_string())
            .or_insert_with(|| (Vec::new(), 0))
            .0
            .push(reply.iter().map(|l| l.to_string()).collect());
        self
    }

    /// Reply to raw data written after a `>` prompt.
    pub fn on_data(self, reply: &[&str]) -> Self {
        self.on(DATA_KEY, reply)
    }

    /// Cancel `token` as soon as `command` is written.
    pub fn cancel_on(self, command: &str, token: &CancellationToken) -> Self {
        self.script.lock().unwrap().cancel_on = Some((command.to_string(), token.clone()));
        self
    }

    /// Let every read take `delay` of (tokio) time.
    pub fn with_read_delay(self, delay: Duration) -> Self {
        self.script.lock().unwrap().read_delay = delay;
        self
    }

    /// Lines the modem has already pushed before any command.
    pub fn with_pending(self, lines: &[&str]) -> Self {
        self.script
            .lock()
            .unwrap()
            .pending
            .extend(lines.iter().map(|l| l.to_string()));
        self
    }

    pub fn handle(&self) -> FakeHandle {
        FakeHandle {
            script: self.script.clone(),
        }
    }
}

impl FakeHandle {
    /// Every command and data write, without line endings.
    pub fn written(&self) -> Vec<String> {
        self.script.lock().unwrap().written.clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.written().iter().filter(|w| w.as_str() == command).count()
    }

    pub fn sent_any(&self, prefix: &str) -> bool {
        self.written().iter().any(|w| w.starts_with(prefix))
    }

    pub fn close(&self) {
        self.script.lock().unwrap().closed = true;
    }
}

#[async_trait]
impl Transport for FakeModem {
    async fn write(&mut self, data: &str) -> Result<(), TransportError> {
        let mut script = self.script.lock().unwrap();
        if script.closed {
            return Err(TransportError::Closed);
        }
        match data.strip_suffix("\r\n") {
            Some(command) => {
                script.written.push(command.to_string());
                script.respond(command);
                if let Some((trigger, token)) = &script.cancel_on {
                    if trigger == command {
                        token.cancel();
                    }
                }
            }
            None => {
                script.written.push(data.to_string());
                script.respond(DATA_KEY);
            }
        }
        Ok(())
    }

    async fn read_line(&mut self, _wait: Duration) -> Result<String, TransportError> {
        let delay = self.script.lock().unwrap().read_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock().unwrap();
        if script.closed {
            return Err(TransportError::Closed);
        }
        script.pending.pop_front().ok_or(TransportError::Timeout)
    }
}
