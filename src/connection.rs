//! Wallet/provider connection state machine
//!
//! Transitions are data: an ordered rule table of `{from, trigger, guard,
//! target}`. For an action, the first rule whose source state, trigger and
//! guard all match fires; when none matches nothing changes.

use crate::error::SerializedError;
use tracing::{debug, trace};

/// Connection phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Errored,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Errored => write!(f, "errored"),
        }
    }
}

/// Data carried alongside the state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionContext {
    pub current_connector: Option<String>,
    pub activating_connector: Option<String>,
    pub error: Option<SerializedError>,
    pub account: Option<String>,
    pub chain_id: Option<u64>,
}

/// Input to the machine
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionAction {
    ActivateStart { connector: String },
    ActivateSuccess {
        account: Option<String>,
        chain_id: Option<u64>,
    },
    ActivateError { error: SerializedError },
    Deactivate,
    SetError { error: Option<SerializedError> },
    ChangeAccount { account: Option<String> },
    ChangeChainId { chain_id: Option<u64> },
}

/// Action kind a rule reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ActivateStart,
    ActivateSuccess,
    ActivateError,
    Deactivate,
    SetError,
    ChangeAccount,
    ChangeChainId,
}

impl ConnectionAction {
    pub fn trigger(&self) -> Trigger {
        match self {
            ConnectionAction::ActivateStart { .. } => Trigger::ActivateStart,
            ConnectionAction::ActivateSuccess { .. } => Trigger::ActivateSuccess,
            ConnectionAction::ActivateError { .. } => Trigger::ActivateError,
            ConnectionAction::Deactivate => Trigger::Deactivate,
            ConnectionAction::SetError { .. } => Trigger::SetError,
            ConnectionAction::ChangeAccount { .. } => Trigger::ChangeAccount,
            ConnectionAction::ChangeChainId { .. } => Trigger::ChangeChainId,
        }
    }

    fn error(&self) -> Option<&SerializedError> {
        match self {
            ConnectionAction::ActivateError { error } => Some(error),
            ConnectionAction::SetError { error } => error.as_ref(),
            _ => None,
        }
    }
}

/// Pure predicate gating a rule
pub type Guard = fn(&ConnectionContext, &ConnectionAction) -> bool;

/// Where a rule leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Move to the state
    State(ConnectionState),
    /// Stay, updating only the context
    Stay,
}

/// One row of the transition table
#[derive(Clone, Copy)]
pub struct Rule {
    pub from: &'static [ConnectionState],
    pub trigger: Trigger,
    pub guard: Option<Guard>,
    pub target: Target,
}

fn has_error(_: &ConnectionContext, action: &ConnectionAction) -> bool {
    action.error().is_some()
}

fn no_error_no_connector(context: &ConnectionContext, action: &ConnectionAction) -> bool {
    action.error().is_none() && context.current_connector.is_none()
}

fn no_error_has_connector(context: &ConnectionContext, action: &ConnectionAction) -> bool {
    action.error().is_none() && context.current_connector.is_some()
}

fn is_cancellation(_: &ConnectionContext, action: &ConnectionAction) -> bool {
    action.error().map_or(false, SerializedError::is_cancellation)
}

use ConnectionState::{Connected, Connecting, Errored, Idle};

const ACTIVE: &[ConnectionState] = &[Connecting, Connected, Errored];

/// Transition table, in evaluation order
#[rustfmt::skip]
pub const RULES: &[Rule] = &[
    Rule { from: &[Idle], trigger: Trigger::ActivateStart, guard: None, target: Target::State(Connecting) },
    Rule { from: &[Connecting], trigger: Trigger::ActivateSuccess, guard: None, target: Target::State(Connected) },
    // A user abort while connecting is not an error.
    Rule { from: &[Connecting], trigger: Trigger::ActivateError, guard: Some(is_cancellation), target: Target::State(Idle) },
    Rule { from: &[Connecting], trigger: Trigger::ActivateError, guard: None, target: Target::State(Errored) },
    Rule { from: ACTIVE, trigger: Trigger::Deactivate, guard: None, target: Target::State(Idle) },
    Rule { from: &[Connected], trigger: Trigger::ActivateStart, guard: None, target: Target::State(Connecting) },
    Rule { from: &[Connected], trigger: Trigger::SetError, guard: Some(has_error), target: Target::State(Errored) },
    Rule { from: &[Errored], trigger: Trigger::ActivateStart, guard: None, target: Target::State(Connecting) },
    Rule { from: &[Errored], trigger: Trigger::SetError, guard: Some(has_error), target: Target::State(Errored) },
    Rule { from: &[Errored], trigger: Trigger::SetError, guard: Some(no_error_no_connector), target: Target::State(Idle) },
    Rule { from: &[Errored], trigger: Trigger::SetError, guard: Some(no_error_has_connector), target: Target::State(Connected) },
    Rule { from: ACTIVE, trigger: Trigger::ChangeAccount, guard: None, target: Target::Stay },
    Rule { from: ACTIVE, trigger: Trigger::ChangeChainId, guard: None, target: Target::Stay },
];

/// First rule of `rules` matching `state`, `action` and `context`
pub fn select_rule<'a>(
    rules: &'a [Rule],
    state: ConnectionState,
    context: &ConnectionContext,
    action: &ConnectionAction,
) -> Option<&'a Rule> {
    let trigger = action.trigger();
    rules.iter().find(|rule| {
        rule.trigger == trigger
            && rule.from.contains(&state)
            && rule.guard.map_or(true, |guard| guard(context, action))
    })
}

/// Pure transition: the next state and context, or `None` when no rule fires
pub fn transition(
    state: ConnectionState,
    context: &ConnectionContext,
    action: &ConnectionAction,
) -> Option<(ConnectionState, ConnectionContext)> {
    let rule = select_rule(RULES, state, context, action)?;
    let next_state = match rule.target {
        Target::State(next) => next,
        Target::Stay => state,
    };
    let next_context = if next_state == Idle {
        ConnectionContext::default()
    } else {
        apply(context, action)
    };
    Some((next_state, next_context))
}

fn apply(context: &ConnectionContext, action: &ConnectionAction) -> ConnectionContext {
    let mut next = context.clone();
    match action {
        ConnectionAction::ActivateStart { connector } => {
            next.activating_connector = Some(connector.clone());
            next.error = None;
        }
        ConnectionAction::ActivateSuccess { account, chain_id } => {
            next.current_connector = next.activating_connector.take();
            next.account = account.clone();
            next.chain_id = *chain_id;
            next.error = None;
        }
        ConnectionAction::ActivateError { error } => {
            next.activating_connector = None;
            next.error = Some(error.clone());
        }
        ConnectionAction::Deactivate => next = ConnectionContext::default(),
        ConnectionAction::SetError { error } => next.error = error.clone(),
        ConnectionAction::ChangeAccount { account } => next.account = account.clone(),
        ConnectionAction::ChangeChainId { chain_id } => next.chain_id = *chain_id,
    }
    next
}

/// Session-long connection tracker
#[derive(Debug, Clone, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
    context: ConnectionContext,
}

impl ConnectionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `action`; returns whether a rule fired
    pub fn send(&mut self, action: ConnectionAction) -> bool {
        match transition(self.state, &self.context, &action) {
            Some((state, context)) => {
                if state != self.state {
                    debug!(
                        from = %self.state,
                        to = %state,
                        trigger = ?action.trigger(),
                        "Connection state changed"
                    );
                }
                self.state = state;
                self.context = context;
                true
            }
            None => {
                trace!(
                    state = %self.state,
                    trigger = ?action.trigger(),
                    "No connection rule matched"
                );
                false
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Connected to a provider
    pub fn is_active(&self) -> bool {
        self.state == Connected
    }

    pub fn error(&self) -> Option<&SerializedError> {
        self.context.error.as_ref()
    }
}
