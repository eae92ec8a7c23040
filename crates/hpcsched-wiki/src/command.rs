//! Outbound command strings: `CMD=<verb> ARG=<id> [KEY=VALUE ...]`.

use std::fmt;

use crate::error::{WikiError, WikiResult};

/// Commands understood by Wiki resource managers. Tokens are case-sensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WikiVerb {
    GetNodes,
    GetJobs,
    StartJob,
    CancelJob,
    SuspendJob,
    ResumeJob,
    RequeueJob,
    CheckpointJob,
    ModifyJob,
    SignalJob,
    JobWillRun,
    SubmitJob,
}

impl WikiVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            WikiVerb::GetNodes => "GETNODES",
            WikiVerb::GetJobs => "GETJOBS",
            WikiVerb::StartJob => "STARTJOB",
            WikiVerb::CancelJob => "CANCELJOB",
            WikiVerb::SuspendJob => "SUSPENDJOB",
            WikiVerb::ResumeJob => "RESUMEJOB",
            WikiVerb::RequeueJob => "REQUEUEJOB",
            WikiVerb::CheckpointJob => "CHECKPOINTJOB",
            WikiVerb::ModifyJob => "MODIFYJOB",
            WikiVerb::SignalJob => "SIGNALJOB",
            WikiVerb::JobWillRun => "JOBWILLRUN",
            WikiVerb::SubmitJob => "SUBMITJOB",
        }
    }

    /// Queries return a record set in `ARG=`.
    pub fn returns_data(&self) -> bool {
        matches!(self, WikiVerb::GetNodes | WikiVerb::GetJobs | WikiVerb::JobWillRun)
    }
}

impl fmt::Display for WikiVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiCommand {
    pub verb: WikiVerb,
    pub arg: String,
    params: Vec<(String, String)>,
}

impl WikiCommand {
    pub fn new(verb: WikiVerb, arg: impl Into<String>) -> Self {
        Self {
            verb,
            arg: arg.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.push((key.to_string(), value.into()));
        self
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render the wire string, rejecting tokens that would break framing.
    pub fn encode(&self) -> WikiResult<String> {
        if self.arg.is_empty() || self.arg.contains(|c: char| c == ';' || c.is_whitespace()) {
            return Err(WikiError::invalid("ARG", &self.arg));
        }
        let mut out = format!("CMD={} ARG={}", self.verb, self.arg);
        for (key, value) in &self.params {
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(WikiError::invalid("parameter name", key));
            }
            if value.contains(['\n', '\r', ';']) {
                return Err(WikiError::invalid(key, value));
            }
            out.push(' ');
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        Ok(out)
    }
}
