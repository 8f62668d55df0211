//! Command handler registry (spec §4.3).
//!
//! Rust has no runtime reflection, so `discover` cannot literally scan
//! arbitrary components for methods the way a JVM classpath scan would.
//! Instead a component contributes a list of [`Registration`]s at startup —
//! each naming the marker type it handles via [`DomainCommand::command_type`]
//! — and `discover` performs the same ambiguity resolution spec §4.3
//! describes over that list, rather than over live reflection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Marker trait for command payload types. `command_type` derives the
/// wire command-type string by stripping a trailing `Command` from the
/// type's unqualified name (`CreateAccountCommand` → `CreateAccount`),
/// matching spec §4.3's naming rule exactly.
pub trait DomainCommand: Send + Sync + 'static {
    fn command_type() -> &'static str
    where
        Self: Sized,
    {
        strip_command_suffix(short_type_name::<Self>())
    }
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

fn strip_command_suffix(name: &str) -> &str {
    name.strip_suffix("Command").unwrap_or(name)
}

/// A resolved command handler. Payloads cross this boundary as `Value`
/// (already decoded from the envelope) and handlers return a result map,
/// also JSON — the registry never needs to know the concrete Rust type of
/// either side once a [`Registration`] has been built.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, payload: Value) -> Result<Value, HandlerError>;
}

/// Context passed to every handler invocation. Deliberately minimal — the
/// registry has no opinion on what a handler needs beyond command identity
/// and correlation, unlike the domain-specific contexts the teacher's
/// strategy/execution crates build for their own handlers.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub command_id: uuid::Uuid,
    pub command_name: String,
    pub business_key: Option<String>,
}

/// A handler failure. Whether this is transient or permanent is not the
/// handler's call — the inbox-guarded consumer classifies it from the
/// message text against a configurable pattern set (spec §4.6), so a
/// handler just reports what went wrong.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError(err.to_string())
    }
}

/// Whether a candidate handler is the plain domain handler or the
/// transaction-wrapping variant the teacher's ambiguity rule prefers
/// (spec §4.3 "prefer the transactional wrapper if one exists").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Plain,
    Transactional,
}

/// One discoverable handler candidate, as a component would contribute it
/// to `discover` at startup.
pub struct Registration {
    pub command_type: &'static str,
    pub kind: HandlerKind,
    pub handler: Arc<dyn Handler>,
}

impl Registration {
    pub fn plain<C: DomainCommand>(handler: Arc<dyn Handler>) -> Self {
        Self {
            command_type: C::command_type(),
            kind: HandlerKind::Plain,
            handler,
        }
    }

    pub fn transactional<C: DomainCommand>(handler: Arc<dyn Handler>) -> Self {
        Self {
            command_type: C::command_type(),
            kind: HandlerKind::Transactional,
            handler,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("UNKNOWN_COMMAND: no handler registered for {0:?}")]
    UnknownCommand(String),
    #[error("AMBIGUOUS_HANDLER: {count} candidates for {command_type:?} and no transactional wrapper to prefer")]
    AmbiguousHandler { command_type: String, count: usize },
}

/// Resolves a command-type string to exactly one handler.
#[derive(Default, Clone)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single handler directly under `command_type`. Overwrites
    /// any existing registration for that type — direct `register` calls
    /// are assumed to come from a single authoritative wiring point, unlike
    /// `discover`'s ambiguity resolution over independently-scanned
    /// candidates.
    pub fn register(&mut self, command_type: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(command_type.into(), handler);
    }

    pub fn resolve(&self, command_type: &str) -> Result<Arc<dyn Handler>, RegistryError> {
        self.handlers
            .get(command_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCommand(command_type.to_string()))
    }

    /// Every command type with a registered handler. Used by the daemon and
    /// testkit to know which command-queue topics a consumer must subscribe
    /// to — the registry is the only thing that knows the full set.
    pub fn command_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Build a registry from a list of candidate [`Registration`]s,
    /// resolving ambiguity per spec §4.3: group by `command_type`; if more
    /// than one candidate remains, a registration carries whichever one is
    /// `Transactional` wins; if there is more than one `Transactional`
    /// candidate (or none and more than one `Plain` one) discovery fails.
    pub fn discover(registrations: Vec<Registration>) -> Result<Self, RegistryError> {
        let mut by_type: HashMap<&'static str, Vec<Registration>> = HashMap::new();
        for reg in registrations {
            by_type.entry(reg.command_type).or_default().push(reg);
        }

        let mut registry = Registry::new();
        for (command_type, mut candidates) in by_type {
            let winner = if candidates.len() == 1 {
                candidates.pop().unwrap()
            } else {
                let transactional: Vec<usize> = candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| r.kind == HandlerKind::Transactional)
                    .map(|(i, _)| i)
                    .collect();
                match transactional.as_slice() {
                    [only] => candidates.remove(*only),
                    _ => {
                        return Err(RegistryError::AmbiguousHandler {
                            command_type: command_type.to_string(),
                            count: candidates.len(),
                        })
                    }
                }
            };
            registry.handlers.insert(command_type.to_string(), winner.handler);
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CreateAccountCommand;
    impl DomainCommand for CreateAccountCommand {}

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn handle(&self, _ctx: &HandlerContext, payload: Value) -> Result<Value, HandlerError> {
            Ok(payload)
        }
    }

    #[test]
    fn command_type_strips_command_suffix() {
        assert_eq!(CreateAccountCommand::command_type(), "CreateAccount");
    }

    #[test]
    fn resolve_unregistered_command_is_unknown_command() {
        let registry = Registry::new();
        let err = registry.resolve("CreateAccount").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownCommand(_)));
    }

    #[test]
    fn discover_prefers_transactional_wrapper_on_conflict() {
        let plain = Registration::plain::<CreateAccountCommand>(Arc::new(NoopHandler));
        let txn = Registration::transactional::<CreateAccountCommand>(Arc::new(NoopHandler));
        let registry = Registry::discover(vec![plain, txn]).unwrap();
        assert!(registry.resolve("CreateAccount").is_ok());
    }

    #[test]
    fn discover_fails_on_two_plain_candidates() {
        let a = Registration::plain::<CreateAccountCommand>(Arc::new(NoopHandler));
        let b = Registration::plain::<CreateAccountCommand>(Arc::new(NoopHandler));
        let err = Registry::discover(vec![a, b]).unwrap_err();
        assert!(matches!(err, RegistryError::AmbiguousHandler { .. }));
    }

    #[test]
    fn discover_fails_on_two_transactional_candidates() {
        let a = Registration::transactional::<CreateAccountCommand>(Arc::new(NoopHandler));
        let b = Registration::transactional::<CreateAccountCommand>(Arc::new(NoopHandler));
        let err = Registry::discover(vec![a, b]).unwrap_err();
        assert!(matches!(err, RegistryError::AmbiguousHandler { .. }));
    }

    #[test]
    fn discover_single_candidate_needs_no_tiebreak() {
        let only = Registration::plain::<CreateAccountCommand>(Arc::new(NoopHandler));
        let registry = Registry::discover(vec![only]).unwrap();
        assert!(registry.resolve("CreateAccount").is_ok());
    }
}
