//! Data types shared with the management dashboard and API.

use std::fmt;

use serde::{Deserialize, Serialize};

//------------ ManagementCode ------------------------------------------------

/// The outcome classification of a credential operation.
///
/// The dashboard keys its handling off the stable wire codes, so the
/// mapping below is part of the external contract. Matching on the
/// enumeration, never on the code strings, keeps the compiler involved
/// when a new classification is added.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementCode {
    Ok,
    UnexpectedError,
    ConfigurationError,
    Locked,
    SignatureInvalid,
    RemoteUnavailable,
    KeyArchival,
}

impl ManagementCode {
    /// The stable code used on the management API.
    pub fn code(&self) -> &'static str {
        match self {
            ManagementCode::Ok => "EC_OK",
            ManagementCode::UnexpectedError => "EC_UNEXPECTED_ERROR",
            ManagementCode::ConfigurationError => "EC_CONFIGURATION_ERROR",
            ManagementCode::Locked => "EC_LOCKED",
            ManagementCode::SignatureInvalid => "EC_SIGNATURE_INVALID",
            ManagementCode::RemoteUnavailable => "EC_REMOTE_UNAVAILABLE",
            ManagementCode::KeyArchival => "EC_KEY_ARCHIVAL",
        }
    }
}

impl fmt::Display for ManagementCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

//------------ ManagementMessage ---------------------------------------------

/// A classified message with free text detail for the dashboard.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ManagementMessage {
    code: ManagementCode,
    detail: String,
}

impl ManagementMessage {
    pub fn new(code: ManagementCode, detail: impl Into<String>) -> Self {
        ManagementMessage {
            code,
            detail: detail.into(),
        }
    }

    pub fn code(&self) -> ManagementCode {
        self.code
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl fmt::Display for ManagementMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.detail)
    }
}

//------------ ReportEntry ---------------------------------------------------

/// One per-subject outcome within a scheduled job run.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReportEntry {
    pub subject: String,
    pub success: bool,
    pub message: ManagementMessage,
}

//------------ JobReport -----------------------------------------------------

/// The aggregated outcome of one scheduled job run.
///
/// Jobs accumulate one entry per service provider or per HSM key instead
/// of propagating errors; callers inspect the aggregate.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct JobReport {
    job: String,
    entries: Vec<ReportEntry>,
}

impl JobReport {
    pub fn new(job: impl Into<String>) -> Self {
        JobReport {
            job: job.into(),
            entries: Vec::new(),
        }
    }

    pub fn add_success(&mut self, subject: impl Into<String>, detail: impl Into<String>) {
        self.entries.push(ReportEntry {
            subject: subject.into(),
            success: true,
            message: ManagementMessage::new(ManagementCode::Ok, detail),
        });
    }

    pub fn add_failure(
        &mut self,
        subject: impl Into<String>,
        code: ManagementCode,
        detail: impl Into<String>,
    ) {
        self.entries.push(ReportEntry {
            subject: subject.into(),
            success: false,
            message: ManagementMessage::new(code, detail),
        });
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// Whether every entry in this run succeeded.
    pub fn success(&self) -> bool {
        self.entries.iter().all(|e| e.success)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:", self.job)?;
        if self.entries.is_empty() {
            write!(f, " nothing to do")?;
        }
        for entry in &self.entries {
            write!(
                f,
                " [{} {}: {}]",
                entry.subject,
                if entry.success { "ok" } else { "FAILED" },
                entry.message
            )?;
        }
        Ok(())
    }
}
