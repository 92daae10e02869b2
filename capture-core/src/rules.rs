//! Rule engine
//!
//! Rules match outgoing requests by url, method, headers and body, and
//! either rewrite the request, answer it locally, block it or delay it.
//! Rules run in ascending priority; ties keep their stored order. The first
//! enabled rule whose criteria all match decides the outcome.

use crate::error::CaptureError;
use crate::events::{CaptureEvent, CaptureSender};
use crate::headers::Headers;
use crate::model::{now_millis, HttpMethod, NetworkRequest, NetworkResponse};
use crate::Result;
use dashmap::DashMap;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use wildmatch::WildMatch;

/// Default number of rule applications kept in memory
pub const DEFAULT_HISTORY_CAPACITY: usize = 200;

/// Compiled patterns kept before the cache starts over
const MAX_CACHED_PATTERNS: usize = 256;

/// Compiled regexes keyed by their source, shared by clones
#[derive(Debug, Clone, Default)]
pub struct PatternCache {
    compiled: Arc<DashMap<String, Regex>>,
}

impl PatternCache {
    pub fn is_match(&self, pattern: &str, text: &str) -> std::result::Result<bool, regex::Error> {
        if let Some(re) = self.compiled.get(pattern) {
            return Ok(re.is_match(text));
        }

        let re = Regex::new(pattern)?;
        let matched = re.is_match(text);
        if self.compiled.len() >= MAX_CACHED_PATTERNS {
            debug!("Pattern cache full, starting over");
            self.compiled.clear();
        }
        self.compiled.insert(pattern.to_string(), re);
        Ok(matched)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

/// How a rule matches the request url
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum UrlPattern {
    Exact(String),
    Prefix(String),
    Regex(String),
    /// `*` matches any run of characters, `?` a single one
    Wildcard(String),
}

impl UrlPattern {
    pub fn matches(&self, url: &str) -> std::result::Result<bool, regex::Error> {
        self.matches_with(url, &PatternCache::default())
    }

    pub fn matches_with(
        &self,
        url: &str,
        patterns: &PatternCache,
    ) -> std::result::Result<bool, regex::Error> {
        Ok(match self {
            UrlPattern::Exact(expected) => url == expected,
            UrlPattern::Prefix(prefix) => url.starts_with(prefix.as_str()),
            UrlPattern::Regex(pattern) => patterns.is_match(pattern, url)?,
            UrlPattern::Wildcard(pattern) => WildMatch::new(pattern).matches(url),
        })
    }
}

/// Header criterion: presence when `value` is absent, exact value otherwise.
/// Names compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPredicate {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl HeaderPredicate {
    pub fn present(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn equals(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    fn matches(&self, headers: &Headers) -> bool {
        match (headers.get(&self.name), &self.value) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual == expected,
        }
    }
}

/// What a matching rule does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Fail the call without touching the network
    Block { reason: String },

    /// Answer locally with a synthesized response
    #[serde(rename_all = "camelCase")]
    MockResponse {
        status_code: u16,
        #[serde(default)]
        status_message: Option<String>,
        #[serde(default)]
        headers: Headers,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        content_type: Option<String>,
    },

    /// Remove, then set, request headers
    SetHeaders {
        #[serde(default)]
        set: Headers,
        #[serde(default)]
        remove: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    ReplaceBody {
        body: String,
        #[serde(default)]
        content_type: Option<String>,
    },

    /// Literal find and replace over the request body
    RewriteBody { find: String, replace: String },

    /// Hold the request, then send it unmodified
    Delay { millis: u64 },
}

impl RuleAction {
    /// Outcome of this action for `request`. Modifying actions that leave the
    /// request unchanged yield [`RuleOutcome::Unmodified`].
    pub fn apply(&self, request: &NetworkRequest, now: i64) -> RuleOutcome {
        match self {
            RuleAction::Block { reason } => RuleOutcome::Blocked(reason.clone()),
            RuleAction::MockResponse {
                status_code,
                status_message,
                headers,
                body,
                content_type,
            } => {
                let mut response = NetworkResponse::new(*status_code, now).with_headers(headers.clone());
                if let Some(message) = status_message {
                    response = response.with_status_message(message.clone());
                }
                if let Some(content_type) = content_type {
                    response = response.with_header("Content-Type", content_type.clone());
                }
                if let Some(body) = body {
                    response = response.with_body(body.clone());
                }
                RuleOutcome::ShortCircuitResponse(response)
            }
            RuleAction::SetHeaders { set, remove } => {
                let mut modified = request.clone();
                for name in remove {
                    modified.headers.remove(name);
                }
                for (name, value) in set.iter() {
                    modified.headers.set(name, value);
                }
                modified.content_type = modified.headers.get("content-type").map(str::to_string);
                RuleOutcome::modified(request, modified)
            }
            RuleAction::ReplaceBody { body, content_type } => {
                let mut modified = request.clone().with_body(body.clone());
                if let Some(content_type) = content_type {
                    modified = modified.with_header("Content-Type", content_type.clone());
                }
                RuleOutcome::modified(request, modified)
            }
            RuleAction::RewriteBody { find, replace } => match &request.body {
                Some(body) if !find.is_empty() && body.contains(find.as_str()) => {
                    let rewritten = body.replace(find.as_str(), replace);
                    RuleOutcome::modified(request, request.clone().with_body(rewritten))
                }
                _ => RuleOutcome::Unmodified,
            },
            RuleAction::Delay { millis } => RuleOutcome::Delayed(Duration::from_millis(*millis)),
        }
    }
}

/// A persisted interception rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub match_url: Option<UrlPattern>,
    #[serde(default)]
    pub match_method: Option<HttpMethod>,
    #[serde(default)]
    pub match_headers: Vec<HeaderPredicate>,
    /// Regex over the request body
    #[serde(default)]
    pub match_body: Option<String>,
    pub action: RuleAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Lower runs first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub last_modified: i64,
}

fn default_enabled() -> bool {
    true
}

/// Authoring problem found on a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleIssue {
    /// No criteria at all, so the rule applies to every request
    MatchesEverything,
    InvalidRegex { field: &'static str, message: String },
}

impl fmt::Display for RuleIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleIssue::MatchesEverything => f.write_str("rule has no criteria and matches every request"),
            RuleIssue::InvalidRegex { field, message } => {
                write!(f, "invalid regex in {}: {}", field, message)
            }
        }
    }
}

impl NetworkRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: RuleAction) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            match_url: None,
            match_method: None,
            match_headers: Vec::new(),
            match_body: None,
            action,
            enabled: true,
            priority: 0,
            last_modified: 0,
        }
    }

    pub fn with_url(mut self, pattern: UrlPattern) -> Self {
        self.match_url = Some(pattern);
        self
    }

    pub fn with_method(mut self, method: impl Into<HttpMethod>) -> Self {
        self.match_method = Some(method.into());
        self
    }

    pub fn with_header(mut self, predicate: HeaderPredicate) -> Self {
        self.match_headers.push(predicate);
        self
    }

    pub fn with_body_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.match_body = Some(pattern.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn has_criteria(&self) -> bool {
        self.match_url.is_some()
            || self.match_method.is_some()
            || !self.match_headers.is_empty()
            || self.match_body.is_some()
    }

    pub fn issues(&self) -> Vec<RuleIssue> {
        let mut issues = Vec::new();
        if !self.has_criteria() {
            issues.push(RuleIssue::MatchesEverything);
        }
        if let Some(UrlPattern::Regex(pattern)) = &self.match_url {
            if let Err(e) = Regex::new(pattern) {
                issues.push(RuleIssue::InvalidRegex {
                    field: "matchUrl",
                    message: e.to_string(),
                });
            }
        }
        if let Some(pattern) = &self.match_body {
            if let Err(e) = Regex::new(pattern) {
                issues.push(RuleIssue::InvalidRegex {
                    field: "matchBody",
                    message: e.to_string(),
                });
            }
        }
        issues
    }

    /// Whether every criterion matches. Disabled rules never match.
    pub fn matches(&self, request: &NetworkRequest) -> std::result::Result<bool, regex::Error> {
        self.matches_with(request, &PatternCache::default())
    }

    /// Like [`Self::matches`], reusing regexes compiled by earlier calls
    pub fn matches_with(
        &self,
        request: &NetworkRequest,
        patterns: &PatternCache,
    ) -> std::result::Result<bool, regex::Error> {
        if !self.enabled {
            return Ok(false);
        }

        if let Some(pattern) = &self.match_url {
            if !pattern.matches_with(&request.url, patterns)? {
                return Ok(false);
            }
        }

        if let Some(method) = &self.match_method {
            if &request.method != method {
                return Ok(false);
            }
        }

        if !self.match_headers.iter().all(|p| p.matches(&request.headers)) {
            return Ok(false);
        }

        if let Some(pattern) = &self.match_body {
            return match request.body.as_deref() {
                Some(body) => patterns.is_match(pattern, body),
                None => Ok(false),
            };
        }

        Ok(true)
    }
}

/// Kind of a non-trivial rule outcome, as recorded in history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    ModifiedRequest,
    ShortCircuit,
    Blocked,
    Delayed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::ModifiedRequest => "modified_request",
            OutcomeKind::ShortCircuit => "short_circuit",
            OutcomeKind::Blocked => "blocked",
            OutcomeKind::Delayed => "delayed",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeKind {
    type Err = CaptureError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "modified_request" => Ok(OutcomeKind::ModifiedRequest),
            "short_circuit" => Ok(OutcomeKind::ShortCircuit),
            "blocked" => Ok(OutcomeKind::Blocked),
            "delayed" => Ok(OutcomeKind::Delayed),
            other => Err(CaptureError::UnknownOutcome(other.to_string())),
        }
    }
}

/// Result of evaluating rules against one request
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Unmodified,
    ModifiedRequest(NetworkRequest),
    ShortCircuitResponse(NetworkResponse),
    Blocked(String),
    Delayed(Duration),
}

impl RuleOutcome {
    fn modified(original: &NetworkRequest, modified: NetworkRequest) -> Self {
        if &modified == original {
            RuleOutcome::Unmodified
        } else {
            RuleOutcome::ModifiedRequest(modified)
        }
    }

    pub fn kind(&self) -> Option<OutcomeKind> {
        match self {
            RuleOutcome::Unmodified => None,
            RuleOutcome::ModifiedRequest(_) => Some(OutcomeKind::ModifiedRequest),
            RuleOutcome::ShortCircuitResponse(_) => Some(OutcomeKind::ShortCircuit),
            RuleOutcome::Blocked(_) => Some(OutcomeKind::Blocked),
            RuleOutcome::Delayed(_) => Some(OutcomeKind::Delayed),
        }
    }

    /// Human readable detail for history entries
    pub fn describe(&self) -> String {
        match self {
            RuleOutcome::Unmodified => "unmodified".to_string(),
            RuleOutcome::ModifiedRequest(request) => {
                format!("request rewritten: {} {}", request.method, request.url)
            }
            RuleOutcome::ShortCircuitResponse(response) => {
                format!("mocked {} {}", response.status_code, response.status_message)
            }
            RuleOutcome::Blocked(reason) => format!("blocked: {}", reason),
            RuleOutcome::Delayed(delay) => format!("delayed {} ms", delay.as_millis()),
        }
    }
}

/// One recorded rule application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleApplicationResult {
    pub rule_id: String,
    pub rule_name: String,
    pub transaction_id: String,
    pub outcome: OutcomeKind,
    pub detail: String,
    pub applied_at: i64,
}

/// Evaluates rules and keeps a bounded history of what they did
#[derive(Debug, Clone)]
pub struct RuleEngine {
    history: Arc<RwLock<VecDeque<RuleApplicationResult>>>,
    capacity: usize,
    patterns: PatternCache,
    events: Option<CaptureSender>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl RuleEngine {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            history: Arc::new(RwLock::new(VecDeque::with_capacity(history_capacity.min(1024)))),
            capacity: history_capacity.max(1),
            patterns: PatternCache::default(),
            events: None,
        }
    }

    /// Forward every recorded application as a [`CaptureEvent::RuleApplied`]
    pub fn with_event_sender(mut self, sender: CaptureSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// Find the winning rule and its outcome without recording anything
    pub fn evaluate<'r>(
        &self,
        request: &NetworkRequest,
        rules: &'r [NetworkRule],
    ) -> Option<(&'r NetworkRule, RuleOutcome)> {
        let mut ordered: Vec<&NetworkRule> = rules.iter().collect();
        ordered.sort_by_key(|rule| rule.priority);

        for rule in ordered {
            match rule.matches_with(request, &self.patterns) {
                Ok(true) => {
                    debug!("Rule '{}' matched {} {}", rule.name, request.method, request.url);
                    return Some((rule, rule.action.apply(request, now_millis())));
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Skipping rule '{}' ({}): invalid regex: {}", rule.name, rule.id, e);
                }
            }
        }

        None
    }

    /// Evaluate and record the outcome for `transaction_id`
    pub fn apply(
        &self,
        transaction_id: &str,
        request: &NetworkRequest,
        rules: &[NetworkRule],
    ) -> RuleOutcome {
        let Some((rule, outcome)) = self.evaluate(request, rules) else {
            return RuleOutcome::Unmodified;
        };

        if let Some(kind) = outcome.kind() {
            self.record(RuleApplicationResult {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                transaction_id: transaction_id.to_string(),
                outcome: kind,
                detail: outcome.describe(),
                applied_at: now_millis(),
            });
        }

        outcome
    }

    fn record(&self, result: RuleApplicationResult) {
        {
            let mut history = self.history.write();
            while history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(result.clone());
        }

        if let Some(events) = &self.events {
            if events.send(CaptureEvent::RuleApplied(result)).is_err() {
                debug!("Capture event receiver closed; rule application not forwarded");
            }
        }
    }

    /// Recorded applications, oldest first
    pub fn history(&self) -> Vec<RuleApplicationResult> {
        self.history.read().iter().cloned().collect()
    }
}

/// Live, shared snapshot of the active rules
#[derive(Debug, Clone)]
pub struct RuleSet {
    sender: Arc<watch::Sender<Arc<Vec<NetworkRule>>>>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl RuleSet {
    pub fn new(rules: Vec<NetworkRule>) -> Self {
        let (sender, _) = watch::channel(Arc::new(rules));
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<NetworkRule>> {
        self.sender.borrow().clone()
    }

    pub fn replace(&self, rules: Vec<NetworkRule>) {
        self.sender.send_replace(Arc::new(rules));
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<NetworkRule>>> {
        self.sender.subscribe()
    }

    pub fn len(&self) -> usize {
        self.sender.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pretty JSON array of rules
pub fn export_rules(rules: &[NetworkRule]) -> Result<String> {
    Ok(serde_json::to_string_pretty(rules)?)
}

/// Parse a JSON array of rules. Ids must be present and unique.
pub fn import_rules(json: &str) -> Result<Vec<NetworkRule>> {
    let rules: Vec<NetworkRule> = serde_json::from_str(json)?;

    let mut seen = HashSet::with_capacity(rules.len());
    for rule in &rules {
        if rule.id.trim().is_empty() {
            return Err(CaptureError::InvalidRule {
                id: rule.id.clone(),
                reason: format!("rule '{}' has an empty id", rule.name),
            });
        }
        if !seen.insert(rule.id.as_str()) {
            return Err(CaptureError::InvalidRule {
                id: rule.id.clone(),
                reason: "duplicate id".to_string(),
            });
        }
    }

    Ok(rules)
}
