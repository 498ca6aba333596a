//! Schema describing how directory entries map onto typed records.
//!
//! Two mappings drive the service: field mappings, which bind each domain
//! field to one or more LDAP attributes together with a rule for coercing
//! the raw values, and record type schemas, which describe how an entry is
//! classified as a user, group and so on. Both are configurable; the
//! defaults match a stock `inetOrgPerson`/`groupOfNames` layout.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A domain field of a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
	/// The unique identifier of the record. A mapping for this field is
	/// mandatory; entries without a resolvable uid are discarded.
	Uid,
	/// A globally unique identifier, if the directory provides one.
	Guid,
	/// Short login-style names.
	ShortNames,
	/// Full display names.
	FullNames,
	/// Email addresses.
	EmailAddresses,
	/// The stored credential attribute.
	Password,
	/// Distinguished names of group members.
	MemberDns,
}

impl FieldName {
	/// Whether values for this field accumulate into an ordered list
	/// rather than a single scalar.
	#[must_use]
	pub fn multi_valued(self) -> bool {
		matches!(
			self,
			FieldName::ShortNames
				| FieldName::FullNames
				| FieldName::EmailAddresses
				| FieldName::MemberDns
		)
	}
}

impl std::fmt::Display for FieldName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			FieldName::Uid => "uid",
			FieldName::Guid => "guid",
			FieldName::ShortNames => "short_names",
			FieldName::FullNames => "full_names",
			FieldName::EmailAddresses => "email_addresses",
			FieldName::Password => "password",
			FieldName::MemberDns => "member_dns",
		};
		f.write_str(name)
	}
}

/// A domain classification of a directory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
	/// An individual user.
	User,
	/// A bookable location.
	Location,
	/// A bookable resource.
	Resource,
	/// A group of other records.
	Group,
	/// An address record.
	Address,
}

impl RecordType {
	/// The order in which record types are queried when a caller does not
	/// restrict them. Types most likely to match come first.
	pub const PREFERRED_ORDER: [RecordType; 5] = [
		RecordType::User,
		RecordType::Location,
		RecordType::Resource,
		RecordType::Group,
		RecordType::Address,
	];
}

impl std::fmt::Display for RecordType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			RecordType::User => "user",
			RecordType::Location => "location",
			RecordType::Resource => "resource",
			RecordType::Group => "group",
			RecordType::Address => "address",
		};
		f.write_str(name)
	}
}

/// How the raw values of one attribute are coerced into a field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
	/// Decode the raw value as text.
	#[default]
	Text,
	/// A unique identifier in textual form. Normalized to lowercase so
	/// identifiers compare predictably.
	Uuid,
	/// A boolean, true when any raw value equals the declared literal
	/// (`"true"` when none is declared).
	Bool {
		/// The literal a raw value must equal to count as true.
		#[serde(default)]
		true_literal: Option<String>,
	},
	/// An enumerated constant; raw values are looked up in the mapping
	/// table and the first value with an entry wins.
	Constant {
		/// Pairs of (raw attribute value, named constant).
		mappings: Vec<(String, String)>,
	},
}

/// Binds one LDAP attribute to a field, with the coercion rule to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRule {
	/// The LDAP attribute to read.
	pub attribute: String,
	/// How raw values of the attribute are coerced.
	#[serde(default)]
	pub kind: ValueKind,
}

impl AttributeRule {
	/// A plain text rule for the given attribute.
	#[must_use]
	pub fn text(attribute: &str) -> Self {
		AttributeRule { attribute: attribute.to_owned(), kind: ValueKind::Text }
	}
}

/// The attribute rules bound to one field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
	/// The field being mapped.
	pub field: FieldName,
	/// Rules tried in order; for single-valued fields the first rule that
	/// coerces a value wins.
	pub rules: Vec<AttributeRule>,
}

/// Describes how entries of one record type are recognized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordTypeSchema {
	/// The record type this schema identifies.
	pub record_type: RecordType,
	/// Relative DN prepended to the service base DN when searching for
	/// records of this type, e.g. `ou=people`.
	pub relative_dn: String,
	/// Attribute/value pairs an entry must all carry to be classified as
	/// this type when its DN is not conclusive.
	pub attributes: Vec<(String, String)>,
}

/// The deserializable schema configuration.
///
/// Both tables are ordered lists: classification ties are broken by the
/// first matching entry, which makes the tie-break an explicit part of the
/// configuration rather than an accident of map iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
	/// Field mappings, in reverse-index priority order.
	pub fields: Vec<FieldMapping>,
	/// Record type schemas, in classification priority order.
	pub record_types: Vec<RecordTypeSchema>,
	/// Extra filter fragments ANDed into every query for a record type.
	#[serde(default)]
	pub extra_filters: HashMap<RecordType, String>,
}

impl Default for SchemaConfig {
	fn default() -> Self {
		SchemaConfig {
			fields: default_field_mappings(),
			record_types: default_record_type_schemas(),
			extra_filters: HashMap::new(),
		}
	}
}

/// The default field mappings for an `inetOrgPerson`-style directory.
#[must_use]
pub fn default_field_mappings() -> Vec<FieldMapping> {
	vec![
		// Groups carry no uid attribute, so cn doubles as their uid.
		FieldMapping {
			field: FieldName::Uid,
			rules: vec![AttributeRule::text("uid"), AttributeRule::text("cn")],
		},
		FieldMapping {
			field: FieldName::Guid,
			rules: vec![AttributeRule {
				attribute: "entryUUID".to_owned(),
				kind: ValueKind::Uuid,
			}],
		},
		FieldMapping { field: FieldName::ShortNames, rules: vec![AttributeRule::text("uid")] },
		FieldMapping { field: FieldName::FullNames, rules: vec![AttributeRule::text("cn")] },
		FieldMapping {
			field: FieldName::EmailAddresses,
			rules: vec![AttributeRule::text("mail")],
		},
		FieldMapping {
			field: FieldName::Password,
			rules: vec![AttributeRule::text("userPassword")],
		},
		FieldMapping { field: FieldName::MemberDns, rules: vec![AttributeRule::text("member")] },
	]
}

/// The default record type schemas: people and groups.
#[must_use]
pub fn default_record_type_schemas() -> Vec<RecordTypeSchema> {
	vec![
		RecordTypeSchema {
			record_type: RecordType::User,
			relative_dn: "ou=people".to_owned(),
			attributes: vec![("objectClass".to_owned(), "inetOrgPerson".to_owned())],
		},
		RecordTypeSchema {
			record_type: RecordType::Group,
			relative_dn: "ou=groups".to_owned(),
			attributes: vec![("objectClass".to_owned(), "groupOfNames".to_owned())],
		},
	]
}

/// A validated schema with the lookup structures derived from
/// [`SchemaConfig`].
#[derive(Debug, Clone)]
pub struct Schema {
	/// Field mappings in configured order.
	fields: Vec<FieldMapping>,
	/// Record type schemas in configured (classification) order.
	record_types: Vec<RecordTypeSchema>,
	/// Extra filter fragments per record type.
	extra_filters: HashMap<RecordType, String>,
	/// Reverse index from attribute name to the first field mapped to it.
	attribute_to_field: HashMap<String, FieldName>,
	/// Deduplicated, sorted list of attributes every search requests.
	attributes_to_fetch: Vec<String>,
}

impl Schema {
	/// Validate a schema configuration and derive the lookup indexes.
	///
	/// # Errors
	/// [`Error::Configuration`] if no `uid` mapping is configured, a field
	/// is mapped twice, or a mapping has no rules.
	pub fn new(config: SchemaConfig) -> Result<Self, Error> {
		let mut seen = Vec::new();
		for mapping in &config.fields {
			if seen.contains(&mapping.field) {
				return Err(Error::Configuration(format!(
					"field {} is mapped more than once",
					mapping.field
				)));
			}
			if mapping.rules.is_empty() {
				return Err(Error::Configuration(format!(
					"field {} has no attribute rules",
					mapping.field
				)));
			}
			seen.push(mapping.field);
		}
		if !seen.contains(&FieldName::Uid) {
			return Err(Error::Configuration("a mapping for uid is required".to_owned()));
		}

		let mut attribute_to_field = HashMap::new();
		let mut attributes_to_fetch = Vec::new();
		for mapping in &config.fields {
			for rule in &mapping.rules {
				// First mapped field wins in the reverse index.
				attribute_to_field.entry(rule.attribute.clone()).or_insert(mapping.field);
				if !attributes_to_fetch.contains(&rule.attribute) {
					attributes_to_fetch.push(rule.attribute.clone());
				}
			}
		}
		attributes_to_fetch.sort_unstable();

		Ok(Schema {
			fields: config.fields,
			record_types: config.record_types,
			extra_filters: config.extra_filters,
			attribute_to_field,
			attributes_to_fetch,
		})
	}

	/// The attribute rules bound to a field, if any.
	#[must_use]
	pub fn rules_for(&self, field: FieldName) -> Option<&[AttributeRule]> {
		self.fields
			.iter()
			.find(|mapping| mapping.field == field)
			.map(|mapping| mapping.rules.as_slice())
	}

	/// The first attribute rule for a field. This is the attribute used
	/// when compiling filters.
	#[must_use]
	pub fn first_rule(&self, field: FieldName) -> Option<&AttributeRule> {
		self.rules_for(field).and_then(<[AttributeRule]>::first)
	}

	/// All field mappings in configured order.
	#[must_use]
	pub fn field_mappings(&self) -> &[FieldMapping] {
		&self.fields
	}

	/// All record type schemas in classification order.
	#[must_use]
	pub fn record_type_schemas(&self) -> &[RecordTypeSchema] {
		&self.record_types
	}

	/// The schema for one record type, if configured.
	#[must_use]
	pub fn schema_for(&self, record_type: RecordType) -> Option<&RecordTypeSchema> {
		self.record_types.iter().find(|schema| schema.record_type == record_type)
	}

	/// The extra filter fragment for a record type, if configured.
	#[must_use]
	pub fn extra_filter(&self, record_type: RecordType) -> Option<&str> {
		self.extra_filters.get(&record_type).map(String::as_str).filter(|s| !s.is_empty())
	}

	/// The field an attribute maps back to, if any.
	#[must_use]
	pub fn field_for_attribute(&self, attribute: &str) -> Option<FieldName> {
		self.attribute_to_field.get(attribute).copied()
	}

	/// The attributes every search should request.
	#[must_use]
	pub fn attributes_to_fetch(&self) -> &[String] {
		&self.attributes_to_fetch
	}

	/// The configured record types in preferred query order.
	#[must_use]
	pub fn preferred_record_types(&self) -> Vec<RecordType> {
		RecordType::PREFERRED_ORDER
			.into_iter()
			.filter(|record_type| self.schema_for(*record_type).is_some())
			.collect()
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{
		default_record_type_schemas, AttributeRule, Error, FieldMapping, FieldName, RecordType,
		Schema, SchemaConfig,
	};

	#[test]
	fn uid_mapping_is_required() {
		let config = SchemaConfig {
			fields: vec![FieldMapping {
				field: FieldName::FullNames,
				rules: vec![AttributeRule::text("cn")],
			}],
			record_types: default_record_type_schemas(),
			extra_filters: std::collections::HashMap::new(),
		};
		assert!(matches!(Schema::new(config), Err(Error::Configuration(_))));
	}

	#[test]
	fn reverse_index_prefers_first_field() {
		let schema = Schema::new(SchemaConfig::default()).unwrap();
		// Both uid and short_names map to the "uid" attribute, and both
		// uid and full_names map to "cn"; the uid mapping comes first.
		assert_eq!(schema.field_for_attribute("uid"), Some(FieldName::Uid));
		assert_eq!(schema.field_for_attribute("cn"), Some(FieldName::Uid));
		assert_eq!(schema.field_for_attribute("member"), Some(FieldName::MemberDns));
		assert_eq!(schema.field_for_attribute("unmapped"), None);
	}

	#[test]
	fn fetch_list_is_deduplicated() {
		let schema = Schema::new(SchemaConfig::default()).unwrap();
		let fetch = schema.attributes_to_fetch();
		assert_eq!(fetch.iter().filter(|attr| *attr == "uid").count(), 1);
		let mut sorted = fetch.to_vec();
		sorted.sort_unstable();
		assert_eq!(fetch, sorted.as_slice());
	}

	#[test]
	fn preferred_order_skips_unconfigured_types() {
		let schema = Schema::new(SchemaConfig::default()).unwrap();
		assert_eq!(schema.preferred_record_types(), vec![RecordType::User, RecordType::Group]);
	}
}
