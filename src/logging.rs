//! # Structured Logging Module
//!
//! Environment-aware structured logging for the agents and the pipeline.
//! Console output is human readable by default and switches to JSON lines when
//! `AS4_RELAY_LOG_FORMAT=json`.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = wants_json_output();

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(filter)
                .boxed()
        };

        // Use try_init to avoid panic if global subscriber already set
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json,
            "Structured logging initialized"
        );
    });
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("AS4_RELAY_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "test" => "debug".to_string(),
        "development" => "debug".to_string(),
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

fn wants_json_output() -> bool {
    std::env::var("AS4_RELAY_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Log structured data for a message or exception record
pub fn log_message_operation(
    operation: &str,
    entity: &str,
    entity_id: Option<i64>,
    ebms_message_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        entity = %entity,
        entity_id = entity_id,
        ebms_message_id = ebms_message_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "MESSAGE_OPERATION"
    );
}

/// Log the retry engine's verdict for one attempt
pub fn log_retry_decision(
    target: &str,
    retry_type: &str,
    outcome: &str,
    retry_count: u32,
    max_retry_count: u32,
    decision: &str,
) {
    tracing::info!(
        target_record = %target,
        retry_type = %retry_type,
        outcome = %outcome,
        retry_count,
        max_retry_count,
        decision = %decision,
        timestamp = %Utc::now().to_rfc3339(),
        "RETRY_DECISION"
    );
}

/// Log the summary of one agent poll
pub fn log_agent_cycle(agent: &str, claimed: usize, succeeded: usize, failed: usize) {
    if claimed == 0 {
        tracing::trace!(agent = %agent, "AGENT_CYCLE idle");
        return;
    }
    tracing::info!(
        agent = %agent,
        claimed,
        succeeded,
        failed,
        timestamp = %Utc::now().to_rfc3339(),
        "AGENT_CYCLE"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
