pub mod action;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use action::IamAction;

/// An IAM-style policy: an ordered list of statements evaluated with
/// deny-overrides semantics. Parsed once, immutable afterwards, safe to share
/// between requests.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Policy {
	#[serde(rename = "Version", default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	#[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(rename = "Statement")]
	pub statement: Vec<Statement>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Statement {
	#[serde(rename = "Sid", default, skip_serializing_if = "Option::is_none")]
	pub sid: Option<String>,
	#[serde(rename = "Effect")]
	pub effect: Effect,
	#[serde(rename = "Action")]
	pub action: ConditionValue,
	#[serde(rename = "Resource")]
	pub resource: ConditionValue,
	#[serde(rename = "Condition", default, skip_serializing_if = "Option::is_none")]
	pub condition: Option<Conditions>,
}

/// operator name -> condition key -> statement values
pub type Conditions = BTreeMap<String, BTreeMap<String, ConditionValue>>;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum Effect {
	Allow,
	Deny,
}

/// One-or-many string values. JSON accepts both `"v"` and `["v1","v2"]`; the
/// singular form is remembered because some condition operators only accept
/// singular request-context values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionValue {
	values: Vec<String>,
	singular: bool,
}

impl ConditionValue {
	pub fn single(value: impl Into<String>) -> Self {
		ConditionValue {
			values: vec![value.into()],
			singular: true,
		}
	}

	pub fn multi<I: IntoIterator<Item = S>, S: Into<String>>(values: I) -> Self {
		ConditionValue {
			values: values.into_iter().map(Into::into).collect(),
			singular: false,
		}
	}

	pub fn values(&self) -> &[String] {
		&self.values
	}

	pub fn is_singular(&self) -> bool {
		self.singular
	}
}

#[derive(Deserialize, Serialize)]
#[serde(untagged)]
enum ConditionValueRepr {
	One(String),
	Many(Vec<String>),
}

impl<'de> Deserialize<'de> for ConditionValue {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		Ok(match ConditionValueRepr::deserialize(deserializer)? {
			ConditionValueRepr::One(v) => ConditionValue::single(v),
			ConditionValueRepr::Many(vs) => ConditionValue::multi(vs),
		})
	}
}

impl Serialize for ConditionValue {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		if self.singular && self.values.len() == 1 {
			ConditionValueRepr::One(self.values[0].clone()).serialize(serializer)
		} else {
			ConditionValueRepr::Many(self.values.clone()).serialize(serializer)
		}
	}
}

/// Strict parse; unknown fields are rejected so a typoed `Conditio` cannot
/// silently widen access.
pub fn parse_policy(content: &str) -> Result<Policy, serde_json::Error> {
	serde_json::from_str(content)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalReason {
	ActionAllowed,
	NoStatementAllows,
	ExplicitDeny,
	ErrorEncountered,
}

impl std::fmt::Display for EvalReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			EvalReason::ActionAllowed => "action is allowed",
			EvalReason::NoStatementAllows => "no statement allows the action",
			EvalReason::ExplicitDeny => "explicit deny",
			EvalReason::ErrorEncountered => "error was encountered",
		};
		write!(f, "{s}")
	}
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EvalError {
	#[error("unsupported condition: '{0}'")]
	UnsupportedOperator(String),
	#[error("operator {operator} got non-singular value for context key {key}")]
	NonSingularContext { operator: String, key: String },
	#[error("at least one action must be evaluated")]
	NoActions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
	pub allowed: bool,
	pub reason: EvalReason,
}

#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
	policy: Arc<Policy>,
}

impl PolicyEvaluator {
	pub fn new(policy: Arc<Policy>) -> Self {
		PolicyEvaluator { policy }
	}

	pub fn from_str(content: &str) -> Result<Self, serde_json::Error> {
		Ok(PolicyEvaluator::new(Arc::new(parse_policy(content)?)))
	}

	/// Deny-overrides evaluation in statement order: a relevant Deny wins
	/// immediately, a relevant Allow is recorded and the scan continues so a
	/// later Deny can still override it.
	pub fn evaluate(&self, action: &IamAction) -> Result<Verdict, EvalError> {
		let mut allowed = false;
		let mut reason = EvalReason::NoStatementAllows;
		for statement in &self.policy.statement {
			match statement.effect {
				Effect::Allow => {
					if is_relevant_for(statement, action)? {
						allowed = true;
						reason = EvalReason::ActionAllowed;
					}
				},
				Effect::Deny => {
					if is_relevant_for(statement, action)? {
						return Ok(Verdict {
							allowed: false,
							reason: EvalReason::ExplicitDeny,
						});
					}
				},
			}
		}
		Ok(Verdict { allowed, reason })
	}

	/// All actions must be allowed; the first non-allow or error ends the scan.
	pub fn evaluate_all(&self, actions: &[IamAction]) -> Result<Verdict, EvalError> {
		if actions.is_empty() {
			return Err(EvalError::NoActions);
		}
		let mut verdict = Verdict {
			allowed: false,
			reason: EvalReason::NoStatementAllows,
		};
		for action in actions {
			verdict = self.evaluate(action)?;
			if !verdict.allowed {
				return Ok(verdict);
			}
		}
		Ok(verdict)
	}
}

/// Source of role policies. The pipeline only ever sees this trait so tests
/// can inject fakes.
pub trait PolicyManager: Send + Sync {
	fn get_policy(&self, role_arn: &str) -> Option<Arc<Policy>>;
}

/// Policies loaded once at startup from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticPolicyManager {
	policies: std::collections::HashMap<String, Arc<Policy>>,
}

impl StaticPolicyManager {
	pub fn new(policies: std::collections::HashMap<String, Arc<Policy>>) -> Self {
		StaticPolicyManager { policies }
	}
}

impl PolicyManager for StaticPolicyManager {
	fn get_policy(&self, role_arn: &str) -> Option<Arc<Policy>> {
		self.policies.get(role_arn).cloned()
	}
}

fn is_relevant_for(statement: &Statement, action: &IamAction) -> Result<bool, EvalError> {
	let action_in_scope = statement
		.action
		.values()
		.iter()
		.any(|a| a == &action.action || iam_string_like(a, &action.action));
	if !action_in_scope {
		return Ok(false);
	}

	let resource_in_scope = statement
		.resource
		.values()
		.iter()
		.any(|r| iam_string_like(r, &action.resource));
	if !resource_in_scope {
		return Ok(false);
	}

	if let Some(conditions) = &statement.condition {
		for (operator, details) in conditions {
			if !is_condition_met_for_operator(operator, details, &action.context)? {
				return Ok(false);
			}
		}
	}

	Ok(true)
}

fn is_condition_met_for_operator(
	operator: &str,
	details: &BTreeMap<String, ConditionValue>,
	context: &BTreeMap<String, ConditionValue>,
) -> Result<bool, EvalError> {
	match operator {
		"StringLike" => eval_string_like(operator, details, context),
		"StringNotLike" => eval_string_like(operator, details, context).map(|met| !met),
		other => Err(EvalError::UnsupportedOperator(other.to_string())),
	}
}

fn eval_string_like(
	operator: &str,
	details: &BTreeMap<String, ConditionValue>,
	context: &BTreeMap<String, ConditionValue>,
) -> Result<bool, EvalError> {
	for (key, value) in context {
		if !value.is_singular() {
			return Err(EvalError::NonSingularContext {
				operator: operator.to_string(),
				key: key.clone(),
			});
		}
	}
	for (condition_key, statement_values) in details {
		let Some(context_value) = context.get(condition_key) else {
			debug!(operator, condition_key, "condition key was not set in request context");
			return Ok(false);
		};
		let Some(literal) = context_value.values().first() else {
			return Ok(false);
		};
		let matched = statement_values
			.values()
			.iter()
			.any(|pattern| iam_string_like(pattern, literal));
		if !matched {
			return Ok(false);
		}
	}
	Ok(true)
}

/// Anchored wildcard match: `*` matches any (possibly empty) sequence, `?`
/// matches exactly one character, everything else is literal.
pub fn iam_string_like(pattern: &str, literal: &str) -> bool {
	let p: Vec<char> = pattern.chars().collect();
	let v: Vec<char> = literal.chars().collect();
	let (mut pi, mut vi) = (0usize, 0usize);
	let mut backtrack: Option<(usize, usize)> = None;
	while vi < v.len() {
		if pi < p.len() && (p[pi] == '?' || p[pi] == v[vi]) {
			pi += 1;
			vi += 1;
		} else if pi < p.len() && p[pi] == '*' {
			backtrack = Some((pi, vi));
			pi += 1;
		} else if let Some((star_pi, star_vi)) = backtrack {
			backtrack = Some((star_pi, star_vi + 1));
			pi = star_pi + 1;
			vi = star_vi + 1;
		} else {
			return false;
		}
	}
	while pi < p.len() && p[pi] == '*' {
		pi += 1;
	}
	pi == p.len()
}
