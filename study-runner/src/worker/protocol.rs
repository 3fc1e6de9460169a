//! Worker stdout line classification
//!
//! Two line classes matter to the coordinator:
//! - prompts (`??next`, `??done <id>`) each needing exactly one stdin reply
//! - status pairs (`##key=value`) feeding progress estimation only
//!
//! Everything else is kept for the transcript and otherwise ignored.

use study_types::ScenarioId;

pub const PROMPT_PREFIX: &str = "??";
pub const STATUS_PREFIX: &str = "##";

/// Reply telling an interactive worker to finish and exit.
pub const NO_MORE_WORK: &str = "none";
/// Reply accepting a completion acknowledgement.
pub const ACK: &str = "ok";
/// Reply to a prompt the coordinator will not honor.
pub const REJECT: &str = "reject";

#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// The worker wants its next scenario
    Next,
    /// The worker finished a scenario; this is the commit point
    Done(ScenarioId),
    /// Any prompt this coordinator does not understand
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Scenario(ScenarioId),
    Percent(f64),
    Message(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerLine {
    Prompt(Prompt),
    Status(StatusUpdate),
    Text,
}

pub fn classify(line: &str) -> WorkerLine {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(rest) = line.strip_prefix(PROMPT_PREFIX) {
        return WorkerLine::Prompt(parse_prompt(rest.trim()));
    }

    if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
        if let Some(update) = parse_status(rest) {
            return WorkerLine::Status(update);
        }
    }

    WorkerLine::Text
}

fn parse_prompt(body: &str) -> Prompt {
    let mut parts = body.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("next"), None, _) => Prompt::Next,
        (Some("done"), Some(id), None) => match id.parse::<ScenarioId>() {
            Ok(id) => Prompt::Done(id),
            Err(_) => Prompt::Unknown(body.to_string()),
        },
        _ => Prompt::Unknown(body.to_string()),
    }
}

fn parse_status(body: &str) -> Option<StatusUpdate> {
    let (key, value) = body.split_once('=')?;
    let value = value.trim();
    match key.trim() {
        "scenario" => value.parse::<ScenarioId>().ok().map(StatusUpdate::Scenario),
        "percent" => value
            .parse::<f64>()
            .ok()
            .filter(|p| p.is_finite())
            .map(|p| StatusUpdate::Percent(p.clamp(0.0, 100.0))),
        "message" => Some(StatusUpdate::Message(value.to_string())),
        _ => None,
    }
}
