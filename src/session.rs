use crate::engine::Decision;
use crate::greylister::{Greylister, Request};
use crate::immunity::{ConnectionSignals, is_immune};
use std::net::IpAddr;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageVerdict {
    Continue,
    Defer(String),
}

#[derive(Debug, Clone)]
pub struct Envelope {
    remote_ip: IpAddr,
    sender: String,
    signals: ConnectionSignals,
    recipients: usize,
    allowlisted_recipients: usize,
    pending: Option<String>,
}

impl Envelope {
    pub fn new(remote_ip: IpAddr, sender: &str, signals: ConnectionSignals) -> Self {
        Self {
            remote_ip,
            sender: sender.to_string(),
            signals,
            recipients: 0,
            allowlisted_recipients: 0,
            pending: None,
        }
    }

    pub fn signals(&self) -> &ConnectionSignals {
        &self.signals
    }

    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    fn surface(&mut self, decision: Decision, deny_late: bool) -> StageVerdict {
        match decision {
            Decision::Accept => StageVerdict::Continue,
            Decision::Defer(msg) if deny_late => {
                info!(sender = %self.sender, "deferral noted for end of message");
                self.pending = Some(msg);
                StageVerdict::Continue
            }
            Decision::Defer(msg) => StageVerdict::Defer(msg),
        }
    }

    pub fn on_mail(&mut self, greylister: &Greylister) -> StageVerdict {
        let config = greylister.base_config();
        if config.checks_at_rcpt() {
            return StageVerdict::Continue;
        }
        let deny_late = config.deny_late;
        let decision = greylister.check(&Request {
            remote_ip: self.remote_ip,
            sender: &self.sender,
            recipient: None,
            signals: &self.signals,
        });
        self.surface(decision, deny_late)
    }

    /// `allowlisted` marks a recipient that accepts all mail; it only
    /// matters for the end-of-message verdict.
    pub fn on_rcpt(
        &mut self,
        greylister: &Greylister,
        recipient: &str,
        allowlisted: bool,
    ) -> StageVerdict {
        self.recipients += 1;
        if allowlisted {
            self.allowlisted_recipients += 1;
        }
        if !greylister.base_config().checks_at_rcpt() {
            return StageVerdict::Continue;
        }
        let config = greylister.effective_config(Some(recipient));
        let decision = greylister.check_with(
            &Request {
                remote_ip: self.remote_ip,
                sender: &self.sender,
                recipient: Some(recipient),
                signals: &self.signals,
            },
            &config,
        );
        self.surface(decision, config.deny_late)
    }

    pub fn on_end_of_message(&self, greylister: &Greylister) -> StageVerdict {
        let Some(msg) = &self.pending else {
            return StageVerdict::Continue;
        };
        if is_immune(&self.signals, greylister.base_config()) {
            return StageVerdict::Continue;
        }
        if self.recipients > 0 && self.allowlisted_recipients == self.recipients {
            info!("all recipients allowlisted, dropping noted deferral");
            return StageVerdict::Continue;
        }
        StageVerdict::Defer(msg.clone())
    }
}
