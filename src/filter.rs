//! Compiles abstract query expressions into LDAP filter strings.

use ldap3::ldap_escape;

use crate::{
	error::Error,
	schema::{FieldName, RecordType, Schema, ValueKind},
};

/// How a match expression compares the attribute against its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
	/// The attribute equals the value.
	Equals,
	/// The attribute starts with the value.
	StartsWith,
	/// The attribute ends with the value.
	EndsWith,
	/// The attribute contains the value.
	Contains,
	/// The attribute is ordered at or below the value.
	LessThanOrEqualTo,
	/// The attribute is ordered at or above the value.
	GreaterThanOrEqualTo,
}

/// Boolean combinator for compound expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
	/// All sub-expressions must match.
	And,
	/// Any sub-expression may match.
	Or,
}

/// An abstract query over directory records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
	/// Compare a field against a value.
	Match {
		/// The field to compare.
		field: FieldName,
		/// The value to compare against.
		value: String,
		/// The comparison to perform.
		match_type: MatchType,
	},
	/// The field has at least one value.
	Exists(FieldName),
	/// The field's boolean value is true.
	Boolean(FieldName),
	/// A boolean combination of sub-expressions.
	Compound {
		/// The sub-expressions to combine.
		expressions: Vec<Expression>,
		/// How to combine them.
		operand: Operand,
	},
}

impl Expression {
	/// An equality match on a field.
	#[must_use]
	pub fn equals(field: FieldName, value: impl Into<String>) -> Self {
		Expression::Match { field, value: value.into(), match_type: MatchType::Equals }
	}
}

/// The result of compiling an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledFilter {
	/// A filter string to send to the server.
	Query(String),
	/// The expression can match nothing; no query should be dispatched.
	Empty,
}

/// Compile an expression into an LDAP filter.
///
/// An empty compound expression compiles to [`CompiledFilter::Empty`]: it
/// has no satisfiable clause, so the caller must short-circuit to an empty
/// result set instead of performing a search. An empty compound nested
/// under `Or` is skipped; nested under `And` it makes the whole filter
/// empty.
///
/// # Errors
/// [`Error::Query`] if an expression references a field with no attribute
/// mapping.
pub fn compile(expression: &Expression, schema: &Schema) -> Result<CompiledFilter, Error> {
	Ok(match compile_inner(expression, schema)? {
		Some(query) => CompiledFilter::Query(query),
		None => CompiledFilter::Empty,
	})
}

/// Recursive compilation; `None` marks an unsatisfiable sub-expression.
fn compile_inner(expression: &Expression, schema: &Schema) -> Result<Option<String>, Error> {
	match expression {
		Expression::Match { field, value, match_type } => {
			let attribute = attribute_for(*field, schema)?;
			let value = ldap_escape(value.as_str());
			Ok(Some(match match_type {
				MatchType::Equals => format!("({attribute}={value})"),
				MatchType::StartsWith => format!("({attribute}={value}*)"),
				MatchType::EndsWith => format!("({attribute}=*{value})"),
				MatchType::Contains => format!("({attribute}=*{value}*)"),
				MatchType::LessThanOrEqualTo => format!("({attribute}<={value})"),
				MatchType::GreaterThanOrEqualTo => format!("({attribute}>={value})"),
			}))
		}
		Expression::Exists(field) => {
			let attribute = attribute_for(*field, schema)?;
			Ok(Some(format!("({attribute}=*)")))
		}
		Expression::Boolean(field) => {
			let rule = schema
				.first_rule(*field)
				.ok_or_else(|| no_mapping(*field))?;
			let true_literal = match &rule.kind {
				ValueKind::Bool { true_literal: Some(literal) } => literal.as_str(),
				_ => "true",
			};
			Ok(Some(format!("({}={})", rule.attribute, ldap_escape(true_literal))))
		}
		Expression::Compound { expressions, operand } => {
			let mut clauses = Vec::with_capacity(expressions.len());
			for sub in expressions {
				match (compile_inner(sub, schema)?, operand) {
					(Some(clause), _) => clauses.push(clause),
					// An unsatisfiable clause poisons a conjunction but
					// merely drops out of a disjunction.
					(None, Operand::And) => return Ok(None),
					(None, Operand::Or) => {}
				}
			}
			if clauses.is_empty() {
				return Ok(None);
			}
			let combinator = match operand {
				Operand::And => '&',
				Operand::Or => '|',
			};
			Ok(Some(format!("({}{})", combinator, clauses.join(""))))
		}
	}
}

/// The attribute used for a field when compiling, i.e. the first mapped
/// one.
fn attribute_for(field: FieldName, schema: &Schema) -> Result<&str, Error> {
	schema
		.first_rule(field)
		.map(|rule| rule.attribute.as_str())
		.ok_or_else(|| no_mapping(field))
}

/// The error for a field that cannot be queried.
fn no_mapping(field: FieldName) -> Error {
	Error::query(format!("no attribute mapping for field {field}"))
}

/// AND a configured per-record-type filter fragment in front of a compiled
/// query.
#[must_use]
pub(crate) fn apply_extra_filter(
	schema: &Schema,
	record_type: RecordType,
	query: &str,
) -> String {
	match schema.extra_filter(record_type) {
		Some(extra) => format!("(&{extra}{query})"),
		None => query.to_owned(),
	}
}
