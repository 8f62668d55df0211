//! Fixture command types and handlers standing in for the domain handlers
//! spec §1 places out of scope ("those register through C3 from outside
//! this workspace, e.g. `platform-testkit`'s fixture handlers stand in for
//! them"). Grounded in the teacher's `mqk-testkit::paper_broker` — a small,
//! deterministic, no-IO stand-in good enough to drive a scenario, nothing
//! more.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use platform_handlers::{DomainCommand, Handler, HandlerContext, HandlerError, Registration};
use platform_process::graph::{ProcessGraph, ProcessGraphBuilder};

macro_rules! marker_command {
    ($name:ident) => {
        pub struct $name;
        impl DomainCommand for $name {}
    };
}

marker_command!(CreateUserCommand);
marker_command!(BookLimitsCommand);
marker_command!(BookFxCommand);
marker_command!(ValidateBalanceCommand);
marker_command!(ValidateRiskCommand);
marker_command!(CreateTransactionCommand);
marker_command!(CreatePaymentCommand);
marker_command!(UnwindFxCommand);
marker_command!(ReverseLimitsCommand);
marker_command!(FlakyStepCommand);

/// A single canned outcome for one invocation of a [`ScriptedHandler`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Succeed with this payload. `Value::Null` means "echo the command
    /// payload back unchanged" — the common case for a fixture that only
    /// needs to prove the round trip, not shape a real response.
    Ok(Value),
    Err(String),
}

/// A handler whose outcomes are scripted in advance: pops one
/// [`ScriptedReply`] per invocation off a queue, falling back to `default`
/// once the queue is empty. Used by S4 (permanent failure) and S6
/// (transient failure twice, then success) to drive the process manager's
/// retry/compensation paths deterministically.
pub struct ScriptedHandler {
    queue: Mutex<VecDeque<ScriptedReply>>,
    default: ScriptedReply,
}

impl ScriptedHandler {
    pub fn new(queue: Vec<ScriptedReply>, default: ScriptedReply) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(queue.into()),
            default,
        })
    }

    pub fn always_ok(value: Value) -> Arc<Self> {
        Self::new(Vec::new(), ScriptedReply::Ok(value))
    }

    pub fn always_err(message: impl Into<String>) -> Arc<Self> {
        Self::new(Vec::new(), ScriptedReply::Err(message.into()))
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    async fn handle(&self, _ctx: &HandlerContext, payload: Value) -> Result<Value, HandlerError> {
        let next = {
            let mut queue = self.queue.lock().expect("scripted handler lock poisoned");
            queue.pop_front().unwrap_or_else(|| self.default.clone())
        };
        match next {
            ScriptedReply::Ok(Value::Null) => Ok(payload),
            ScriptedReply::Ok(value) => Ok(value),
            ScriptedReply::Err(message) => Err(HandlerError(message)),
        }
    }
}

/// S1/S2's handler: returns the exact payload shape spec §8 names
/// (`{"userId":"u-123","username": <echoed>}`).
pub struct CreateUserHandler;

#[async_trait]
impl Handler for CreateUserHandler {
    async fn handle(&self, _ctx: &HandlerContext, payload: Value) -> Result<Value, HandlerError> {
        let username = payload
            .get("username")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError("payload missing username".to_string()))?;
        Ok(serde_json::json!({"userId": "u-123", "username": username}))
    }
}

pub fn create_user_registrations() -> Vec<Registration> {
    vec![Registration::plain::<CreateUserCommand>(Arc::new(CreateUserHandler))]
}

/// The `SimplePayment` process graph (spec §8 S3/S4): a sequential
/// `BookLimits`, a three-way parallel validation fan-out, then the
/// sequential `CreateTransaction` -> `CreatePayment` tail. `BookLimits` and
/// `BookFx` each declare a compensation; `ValidateBalance`/`ValidateRisk`
/// don't, matching S4's expectation that only `UnwindFx` then
/// `ReverseLimits` run during compensation.
pub fn simple_payment_graph() -> anyhow::Result<ProcessGraph> {
    Ok(ProcessGraphBuilder::new()
        .start_with("BookLimits")
        .with_compensation("ReverseLimits")
        .then_parallel()
        .branch("BookFx")
        .with_compensation("UnwindFx")
        .branch("ValidateBalance")
        .branch("ValidateRisk")
        .join_at("PaymentJoin")
        .then("CreateTransaction")
        .then("CreatePayment")
        .end()?)
}

pub const SIMPLE_PAYMENT_STEPS: &[&str] = &[
    "BookLimits",
    "BookFx",
    "ValidateBalance",
    "ValidateRisk",
    "CreateTransaction",
    "CreatePayment",
    "UnwindFx",
    "ReverseLimits",
];

/// Registrations for `SimplePayment` where every step succeeds (S3).
pub fn simple_payment_all_succeed_registrations() -> Vec<Registration> {
    vec![
        Registration::plain::<BookLimitsCommand>(ScriptedHandler::always_ok(Value::Null)),
        Registration::plain::<BookFxCommand>(ScriptedHandler::always_ok(Value::Null)),
        Registration::plain::<ValidateBalanceCommand>(ScriptedHandler::always_ok(Value::Null)),
        Registration::plain::<ValidateRiskCommand>(ScriptedHandler::always_ok(Value::Null)),
        Registration::plain::<CreateTransactionCommand>(ScriptedHandler::always_ok(
            serde_json::json!({"transactionId": "txn-1"}),
        )),
        Registration::plain::<CreatePaymentCommand>(ScriptedHandler::always_ok(serde_json::json!({"paymentId": "pay-1"}))),
        Registration::plain::<UnwindFxCommand>(ScriptedHandler::always_ok(Value::Null)),
        Registration::plain::<ReverseLimitsCommand>(ScriptedHandler::always_ok(Value::Null)),
    ]
}

/// Registrations for `SimplePayment` where `CreateTransaction` fails
/// permanently (S4): every step up through the parallel join still
/// succeeds, so compensation has exactly `BookLimits` and `BookFx`'s
/// declared compensations to unwind.
pub fn simple_payment_create_transaction_fails_registrations() -> Vec<Registration> {
    vec![
        Registration::plain::<BookLimitsCommand>(ScriptedHandler::always_ok(Value::Null)),
        Registration::plain::<BookFxCommand>(ScriptedHandler::always_ok(Value::Null)),
        Registration::plain::<ValidateBalanceCommand>(ScriptedHandler::always_ok(Value::Null)),
        Registration::plain::<ValidateRiskCommand>(ScriptedHandler::always_ok(Value::Null)),
        Registration::plain::<CreateTransactionCommand>(ScriptedHandler::always_err("ledger rejected transaction")),
        Registration::plain::<CreatePaymentCommand>(ScriptedHandler::always_ok(Value::Null)),
        Registration::plain::<UnwindFxCommand>(ScriptedHandler::always_ok(Value::Null)),
        Registration::plain::<ReverseLimitsCommand>(ScriptedHandler::always_ok(Value::Null)),
    ]
}

/// A single-step process used by S6: `FlakyStep` fails with a
/// classifier-transient message twice, then succeeds on the third
/// delivery.
pub fn flaky_step_graph() -> anyhow::Result<ProcessGraph> {
    Ok(ProcessGraphBuilder::new().start_with("FlakyStep").end()?)
}

pub fn flaky_step_registrations() -> Vec<Registration> {
    vec![Registration::plain::<FlakyStepCommand>(ScriptedHandler::new(
        vec![
            ScriptedReply::Err("connection timeout".to_string()),
            ScriptedReply::Err("connection timeout".to_string()),
        ],
        ScriptedReply::Ok(serde_json::json!({"done": true})),
    ))]
}
