use serde::Serialize;

/// Severity of a single entry in [`DecisionReasons`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasonSeverity {
    /// A diagnostic note about the normal course of resolution.
    Info,
    /// Something was wrong with configuration, a gateway, or the caller's input.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reason {
    pub severity: ReasonSeverity,
    pub message: String,
}

/// Append-only, order-preserving trail of human-readable notes explaining a decision.
///
/// Reasons never influence control flow. Each resolution stage returns its own trail and the
/// caller merges it into the outer one, so the final order matches the order stages ran in.
/// Every recorded message is also emitted through the `log` facade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DecisionReasons {
    entries: Vec<Reason>,
}

impl DecisionReasons {
    pub fn new() -> DecisionReasons {
        DecisionReasons::default()
    }

    /// Record an informational note. Notes are logged at `debug` level.
    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::debug!(target: "flagcore", "{message}");
        self.push(ReasonSeverity::Info, message);
    }

    /// Record a low-level note that is only logged at `trace` level.
    pub fn debug(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::trace!(target: "flagcore", "{message}");
        self.push(ReasonSeverity::Info, message);
    }

    /// Record an informational note that is logged as a warning (e.g., a gateway returned data
    /// that had to be ignored).
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!(target: "flagcore", "{message}");
        self.push(ReasonSeverity::Info, message);
    }

    /// Record an error. Errors are always part of the report, regardless of options.
    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::error!(target: "flagcore", "{message}");
        self.push(ReasonSeverity::Error, message);
    }

    /// Append all entries of `other`, preserving their order.
    pub fn merge(&mut self, other: DecisionReasons) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reason> {
        self.entries.iter()
    }

    pub fn has_errors(&self) -> bool {
        self.entries
            .iter()
            .any(|reason| reason.severity == ReasonSeverity::Error)
    }

    /// Messages as reported to callers: errors always, informational notes only if
    /// `include_infos` is set (the `IncludeReasons` decide option).
    pub fn to_report(&self, include_infos: bool) -> Vec<String> {
        self.entries
            .iter()
            .filter(|reason| include_infos || reason.severity == ReasonSeverity::Error)
            .map(|reason| reason.message.clone())
            .collect()
    }

    /// All messages in order, regardless of severity.
    pub fn messages(&self) -> Vec<&str> {
        self.entries.iter().map(|r| r.message.as_str()).collect()
    }

    fn push(&mut self, severity: ReasonSeverity, message: String) {
        self.entries.push(Reason { severity, message });
    }
}

/// A stage result paired with the reasons collected while computing it.
#[derive(Debug, Clone)]
pub struct DecisionResponse<T> {
    pub result: T,
    pub reasons: DecisionReasons,
}

impl<T> DecisionResponse<T> {
    pub fn new(result: T, reasons: DecisionReasons) -> DecisionResponse<T> {
        DecisionResponse { result, reasons }
    }

    /// Move the reasons into `into` and return the bare result.
    pub fn unpack(self, into: &mut DecisionReasons) -> T {
        into.merge(self.reasons);
        self.result
    }
}
