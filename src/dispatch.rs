//! The hook entry point: read, classify, validate, route, decide, log.
//!
//! One dispatcher invocation handles one event and exits. The failure
//! policy is asymmetric by design: security rules fail closed (an explicit
//! deny halts the tool call), while input and coordination failures fail
//! open — warden is an assistant, not a mandatory gatekeeper, and a
//! coordination bug must never halt the user's workflow.
//!
//! The ≤10 ms hot-path budget is advisory: overruns are measured and
//! logged to the `performance` stream, never enforced by aborting.

use std::io::Read;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::context::Context;
use crate::coordinator::Coordinator;
use crate::event::{Decision, EventKind, HookEvent, ReadLimits, log_excerpt, read_event_from};
use crate::logging::Stream;
use crate::reaper::{Reaper, should_sample};
use crate::security::{Verdict, validate};

/// Advisory end-to-end budget for the hot allow path.
const LATENCY_BUDGET: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// HookDispatcher
// ---------------------------------------------------------------------------

/// Drives one hook invocation from raw input to a decision.
pub struct HookDispatcher {
    ctx: Context,
    coordinator: Coordinator,
}

impl HookDispatcher {
    /// Build a dispatcher from the process context.
    #[must_use]
    pub fn new(ctx: Context) -> Self {
        let coordinator = Coordinator::new(&ctx);
        Self { ctx, coordinator }
    }

    /// Read one event from `reader` and decide.
    ///
    /// Never fails: every error path degrades to a decision per the
    /// fail-open/fail-closed policy.
    pub fn dispatch<R>(&self, reader: R) -> Decision
    where
        R: Read + Send + 'static,
    {
        let started = Instant::now();
        let limits = ReadLimits {
            timeout: self.ctx.config.hook_timeout(),
            max_bytes: self.ctx.config.hook_max_bytes,
            max_depth: self.ctx.config.hook_max_depth,
        };

        let (event, payload_bytes) = match read_event_from(reader, limits) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Unreadable input cannot be attributed or routed: allow.
                self.ctx.log.log(
                    Stream::Security,
                    json!({
                        "event": "unreadable_payload",
                        "severity": "warn",
                        "detail": e.to_string(),
                    }),
                );
                return Decision::Allow;
            }
        };

        let decision = self.decide(&event, payload_bytes);
        self.log_outcome(&event, &decision, started.elapsed());
        self.maybe_reap(&event);
        decision
    }

    /// Validate then route an already-classified event.
    #[must_use]
    pub fn decide(&self, event: &HookEvent, payload_bytes: usize) -> Decision {
        if let Verdict::Deny { reason } = validate(
            event,
            payload_bytes,
            self.ctx.config.hook_max_bytes,
            &self.ctx.config.protected_branches,
        ) {
            self.log_security_deny(event, &reason);
            return Decision::Deny { reason };
        }

        let routed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.coordinator.handle(event)
        }));
        match routed {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) if e.fails_open() => {
                self.ctx.log.log(
                    Stream::Security,
                    json!({
                        "event": "coordination_degraded",
                        "severity": "error",
                        "hook": event.kind.name(),
                        "session": event.session_id,
                        "detail": e.to_string(),
                    }),
                );
                Decision::Allow
            }
            Ok(Err(e)) => {
                let reason = e.deny_reason();
                self.log_security_deny(event, &reason);
                Decision::Deny { reason }
            }
            Err(_) => {
                self.ctx.log.log(
                    Stream::Security,
                    json!({
                        "event": "dispatcher_panic",
                        "severity": "error",
                        "hook": event.kind.name(),
                        "session": event.session_id,
                    }),
                );
                Decision::Allow
            }
        }
    }

    fn log_security_deny(&self, event: &HookEvent, reason: &str) {
        let excerpt = match &event.kind {
            EventKind::PreToolUse { tool_input, .. } => {
                log_excerpt(&serde_json::Value::Object(tool_input.clone()))
            }
            _ => json!(null),
        };
        self.ctx.log.log(
            Stream::Security,
            json!({
                "event": "security_deny",
                "severity": "warn",
                "hook": event.kind.name(),
                "session": event.session_id,
                "reason": reason,
                "input": excerpt,
            }),
        );
    }

    fn log_outcome(&self, event: &HookEvent, decision: &Decision, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.ctx.log.log(
            Stream::Lifecycle,
            json!({
                "event": "hook_decision",
                "hook": event.kind.name(),
                "session": event.session_id,
                "decision": decision.label(),
                "elapsed_us": micros,
            }),
        );
        if elapsed > LATENCY_BUDGET {
            self.ctx.log.log(
                Stream::Performance,
                json!({
                    "event": "latency_budget_overrun",
                    "hook": event.kind.name(),
                    "elapsed_us": micros,
                    "budget_us": u64::try_from(LATENCY_BUDGET.as_micros()).unwrap_or(u64::MAX),
                }),
            );
        }
    }

    /// Stop events always trigger a sweep; everything else samples the
    /// persistent invocation counter.
    fn maybe_reap(&self, event: &HookEvent) {
        let explicit = matches!(event.kind, EventKind::Stop { .. });
        let sampled = should_sample(
            &self.ctx.paths.state_dir(),
            self.ctx.config.reaper_sample_every,
        );
        if explicit || sampled {
            let _ = Reaper::new(&self.ctx).sweep();
        }
    }
}

// ---------------------------------------------------------------------------
// Process entry
// ---------------------------------------------------------------------------

/// Full hook flow for the `warden hook` subcommand: build context, read
/// stdin, decide, emit. Returns the process exit code.
#[must_use]
pub fn run_hook() -> i32 {
    let (ctx, _guard, warnings) = match Context::for_hook() {
        Ok(parts) => parts,
        Err(e) => {
            // Without a usable root there is nothing to coordinate: allow.
            eprintln!("warden: {e}");
            let _ = crate::event::write_decision(std::io::stdout(), &Decision::Allow);
            return 0;
        }
    };
    for warning in warnings {
        ctx.log.log(
            Stream::Security,
            json!({ "event": "config_warning", "severity": "warn", "detail": warning }),
        );
    }

    let dispatcher = HookDispatcher::new(ctx);
    let decision = dispatcher.dispatch(std::io::stdin());

    if let Decision::Deny { reason } = &decision {
        eprintln!("{reason}");
    }
    if crate::event::write_decision(std::io::stdout(), &decision).is_err() {
        return 1;
    }
    decision.exit_code()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
