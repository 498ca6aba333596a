//! Classifying raw search entries and mapping them into typed records.

use std::collections::HashMap;

use ldap3::SearchEntry;
use tracing::{debug, warn};

use crate::{
	dn,
	schema::{FieldName, RecordType, RecordTypeSchema, Schema, ValueKind},
};

/// A coerced field value of a directory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
	/// A single textual value.
	Text(String),
	/// An ordered list of textual values.
	TextList(Vec<String>),
	/// A boolean value.
	Bool(bool),
}

impl FieldValue {
	/// The value as text, if it is a single scalar.
	#[must_use]
	pub fn as_text(&self) -> Option<&str> {
		match self {
			FieldValue::Text(value) => Some(value),
			_ => None,
		}
	}

	/// The value as a list of texts, if it is multi-valued.
	#[must_use]
	pub fn as_list(&self) -> Option<&[String]> {
		match self {
			FieldValue::TextList(values) => Some(values),
			_ => None,
		}
	}
}

/// A typed directory record produced by the mapper. Every record carries
/// its resolved type, its original-case DN and a coerced `uid`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
	/// The resolved record type.
	pub record_type: RecordType,
	/// The distinguished name of the underlying entry.
	pub dn: String,
	/// The coerced fields.
	fields: HashMap<FieldName, FieldValue>,
}

impl Record {
	/// The unique identifier of the record. Present by construction; the
	/// mapper discards entries without one.
	#[must_use]
	pub fn uid(&self) -> &str {
		self.fields.get(&FieldName::Uid).and_then(FieldValue::as_text).unwrap_or_default()
	}

	/// A coerced field value, if the entry carried one.
	#[must_use]
	pub fn field(&self, field: FieldName) -> Option<&FieldValue> {
		self.fields.get(&field)
	}

	/// The member DNs of a group record, empty for other records.
	#[must_use]
	pub fn member_dns(&self) -> &[String] {
		self.field(FieldName::MemberDns).and_then(FieldValue::as_list).unwrap_or_default()
	}

	/// The identity used when collapsing duplicate results.
	#[must_use]
	pub fn identity(&self) -> (RecordType, &str) {
		(self.record_type, self.uid())
	}
}

/// Classify an entry by its DN: normalize, then test suffix containment
/// against each schema's relative DN joined to the base DN. The first
/// schema in table order whose suffix matches wins.
pub(crate) fn record_type_for_dn(
	base_dn: &str,
	schemas: &[RecordTypeSchema],
	entry_dn: &str,
) -> Option<RecordType> {
	let entry = dn::explode(&dn::normalize(entry_dn));
	let base = dn::explode(&dn::normalize(base_dn));
	for schema in schemas {
		let mut combined = dn::explode(&dn::normalize(&schema.relative_dn));
		combined.extend(base.iter().cloned());
		if dn::contained_in(&entry, &combined) {
			return Some(schema.record_type);
		}
	}
	None
}

/// Classify an entry by its attributes: the first schema in table order
/// whose required attribute/value pairs are all present wins.
pub(crate) fn record_type_for_attributes(
	schemas: &[RecordTypeSchema],
	attrs: &HashMap<String, Vec<String>>,
) -> Option<RecordType> {
	schemas
		.iter()
		.find(|schema| {
			schema.attributes.iter().all(|(attribute, value)| {
				attrs.get(attribute).is_some_and(|values| values.contains(value))
			})
		})
		.map(|schema| schema.record_type)
}

/// Two-phase classification of an entry: DN-based first, attribute-based
/// as the fallback. `None` means the entry belongs to no known type and
/// is to be dropped.
pub(crate) fn resolve_record_type(
	base_dn: &str,
	schemas: &[RecordTypeSchema],
	entry: &SearchEntry,
) -> Option<RecordType> {
	record_type_for_dn(base_dn, schemas, &entry.dn)
		.or_else(|| record_type_for_attributes(schemas, &entry.attrs))
}

/// Map a raw entry into a typed record, coercing each attribute per its
/// schema rule.
///
/// Multi-valued fields accumulate values across rules in encounter order;
/// single-valued fields keep the first successfully coerced value. A value
/// that fails coercion is logged and skipped without affecting the rest of
/// the record. Entries missing a coerced `uid` yield `None`.
pub(crate) fn record_from_entry(
	entry: &SearchEntry,
	record_type: RecordType,
	schema: &Schema,
) -> Option<Record> {
	let mut fields: HashMap<FieldName, FieldValue> = HashMap::new();

	for mapping in schema.field_mappings() {
		let field = mapping.field;
		for rule in &mapping.rules {
			let Some(values) = raw_values(entry, &rule.attribute) else {
				continue;
			};
			match &rule.kind {
				ValueKind::Text | ValueKind::Uuid => {
					let coerced: Vec<String> = values
						.iter()
						.filter_map(|value| match &rule.kind {
							ValueKind::Uuid => {
								let normalized = normalize_uuid(value);
								if normalized.is_none() {
									warn!(
										field = %field,
										value,
										"Skipping value that does not parse as a UUID"
									);
								}
								normalized
							}
							_ => Some(value.clone()),
						})
						.collect();
					if coerced.is_empty() {
						continue;
					}
					if field.multi_valued() {
						match fields.get_mut(&field) {
							Some(FieldValue::TextList(existing)) => existing.extend(coerced),
							Some(_) => {}
							None => {
								fields.insert(field, FieldValue::TextList(coerced));
							}
						}
					} else if !fields.contains_key(&field) {
						// First successfully coerced value wins.
						fields.insert(
							field,
							FieldValue::Text(coerced.into_iter().next().unwrap_or_default()),
						);
					}
				}
				ValueKind::Bool { true_literal } => {
					let true_literal = true_literal.as_deref().unwrap_or("true");
					let value = values.iter().any(|value| value == true_literal);
					fields.entry(field).or_insert(FieldValue::Bool(value));
				}
				ValueKind::Constant { mappings } => {
					let constant = values.iter().find_map(|value| {
						mappings
							.iter()
							.find(|(raw, _)| raw == value)
							.map(|(_, constant)| constant.clone())
					});
					match constant {
						Some(constant) => {
							fields.entry(field).or_insert(FieldValue::Text(constant));
						}
						None => {
							warn!(
								field = %field,
								attribute = rule.attribute,
								"No constant mapping matched the attribute values"
							);
						}
					}
				}
			}
		}
	}

	if !fields.contains_key(&FieldName::Uid) {
		debug!(dn = entry.dn, "Ignoring entry without a resolvable uid");
		return None;
	}

	Some(Record { record_type, dn: entry.dn.clone(), fields })
}

/// The raw values of an attribute. Textual values are preferred; binary
/// values are decoded as UTF-8, skipping (with a log) any that do not
/// decode.
fn raw_values(entry: &SearchEntry, attribute: &str) -> Option<Vec<String>> {
	if let Some(values) = entry.attrs.get(attribute) {
		return Some(values.clone());
	}
	let values: Vec<String> = entry
		.bin_attrs
		.get(attribute)?
		.iter()
		.filter_map(|raw| match String::from_utf8(raw.clone()) {
			Ok(value) => Some(value),
			Err(_) => {
				warn!(attribute, "Skipping binary attribute value that is not UTF-8");
				None
			}
		})
		.collect();
	if values.is_empty() {
		None
	} else {
		Some(values)
	}
}

/// Normalize a textual UUID to lowercase, checking the 8-4-4-4-12 hex
/// layout.
fn normalize_uuid(value: &str) -> Option<String> {
	let value = value.trim().to_lowercase();
	let groups: Vec<&str> = value.split('-').collect();
	let lengths = [8, 4, 4, 4, 12];
	if groups.len() != lengths.len() {
		return None;
	}
	for (group, length) in groups.iter().zip(lengths) {
		if group.len() != length || !group.chars().all(|c| c.is_ascii_hexdigit()) {
			return None;
		}
	}
	Some(value)
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::HashMap;

	use ldap3::SearchEntry;

	use super::{
		record_from_entry, record_type_for_attributes, record_type_for_dn, resolve_record_type,
		FieldValue,
	};
	use crate::schema::{
		default_record_type_schemas, AttributeRule, FieldMapping, FieldName, RecordType,
		RecordTypeSchema, Schema, SchemaConfig, ValueKind,
	};

	/// A user entry under `ou=people` with the given attributes.
	fn user_entry(dn: &str, attrs: &[(&str, &[&str])]) -> SearchEntry {
		SearchEntry {
			dn: dn.to_owned(),
			attrs: attrs
				.iter()
				.map(|(name, values)| {
					((*name).to_owned(), values.iter().map(|v| (*v).to_owned()).collect())
				})
				.collect(),
			bin_attrs: HashMap::new(),
		}
	}

	/// The default schema used in mapper tests.
	fn schema() -> Schema {
		Schema::new(SchemaConfig::default()).unwrap()
	}

	#[test]
	fn dn_classification_normalizes_case_and_whitespace() {
		let schemas = vec![RecordTypeSchema {
			record_type: RecordType::User,
			relative_dn: "ou=Person".to_owned(),
			attributes: vec![],
		}];
		assert_eq!(
			record_type_for_dn("dc=example", &schemas, "CN=Bob, OU=Person,DC=Example"),
			Some(RecordType::User)
		);
		assert_eq!(
			record_type_for_dn("dc=example", &schemas, "cn=bob,ou=groups,dc=example"),
			None
		);
	}

	#[test]
	fn dn_classification_first_match_wins() {
		// Two schemas matching the same subtree: table order decides.
		let schemas = vec![
			RecordTypeSchema {
				record_type: RecordType::Resource,
				relative_dn: "ou=people".to_owned(),
				attributes: vec![],
			},
			RecordTypeSchema {
				record_type: RecordType::User,
				relative_dn: "ou=people".to_owned(),
				attributes: vec![],
			},
		];
		assert_eq!(
			record_type_for_dn("dc=example", &schemas, "uid=bob,ou=people,dc=example"),
			Some(RecordType::Resource)
		);
	}

	#[test]
	fn attribute_classification_uses_list_membership() {
		let schemas = default_record_type_schemas();
		let entry = user_entry(
			"uid=bob,ou=elsewhere,dc=example",
			&[("objectClass", &["top", "inetOrgPerson"]), ("uid", &["bob"])],
		);
		assert_eq!(record_type_for_attributes(&schemas, &entry.attrs), Some(RecordType::User));
		// DN does not match any subtree, so classification falls back to
		// attributes.
		assert_eq!(
			resolve_record_type("dc=example", &schemas, &entry),
			Some(RecordType::User)
		);

		let unknown = user_entry("cn=printer,ou=devices,dc=example", &[("objectClass", &["device"])]);
		assert_eq!(resolve_record_type("dc=example", &schemas, &unknown), None);
	}

	#[test]
	fn mapper_requires_uid() {
		// Neither uid nor the cn fallback is present.
		let entry =
			user_entry("mail=bob@example.com,ou=people,dc=example", &[("mail", &["bob@example.com"])]);
		assert!(record_from_entry(&entry, RecordType::User, &schema()).is_none());
	}

	#[test]
	fn mapper_round_trip_preserves_identity() {
		let entry = user_entry(
			"uid=Bob,ou=People,dc=Example",
			&[
				("uid", &["bob"]),
				("cn", &["Bob Smith", "Robert Smith"]),
				("mail", &["bob@example.com"]),
			],
		);
		let record = record_from_entry(&entry, RecordType::User, &schema()).unwrap();
		assert_eq!(record.uid(), "bob");
		assert_eq!(record.record_type, RecordType::User);
		// The DN keeps its original case.
		assert_eq!(record.dn, "uid=Bob,ou=People,dc=Example");
		assert_eq!(
			record.field(FieldName::FullNames).and_then(FieldValue::as_list),
			Some(["Bob Smith".to_owned(), "Robert Smith".to_owned()].as_slice())
		);
	}

	#[test]
	fn mapper_coerces_bool_and_constant() {
		let config = SchemaConfig {
			fields: vec![
				FieldMapping { field: FieldName::Uid, rules: vec![AttributeRule::text("uid")] },
				FieldMapping {
					field: FieldName::Password,
					rules: vec![AttributeRule {
						attribute: "loginEnabled".to_owned(),
						kind: ValueKind::Bool { true_literal: Some("yes".to_owned()) },
					}],
				},
				FieldMapping {
					field: FieldName::FullNames,
					rules: vec![AttributeRule {
						attribute: "autoMode".to_owned(),
						kind: ValueKind::Constant {
							mappings: vec![("A".to_owned(), "accept".to_owned())],
						},
					}],
				},
			],
			record_types: default_record_type_schemas(),
			extra_filters: HashMap::new(),
		};
		let schema = Schema::new(config).unwrap();
		let entry = user_entry(
			"uid=bob,ou=people,dc=example",
			&[("uid", &["bob"]), ("loginEnabled", &["yes"]), ("autoMode", &["A"])],
		);
		let record = record_from_entry(&entry, RecordType::User, &schema).unwrap();
		assert_eq!(record.field(FieldName::Password), Some(&FieldValue::Bool(true)));
		assert_eq!(
			record.field(FieldName::FullNames).and_then(FieldValue::as_list),
			None,
			"constants coerce to a scalar"
		);

		let entry = user_entry(
			"uid=bob,ou=people,dc=example",
			&[("uid", &["bob"]), ("loginEnabled", &["no"])],
		);
		let record = record_from_entry(&entry, RecordType::User, &schema).unwrap();
		assert_eq!(record.field(FieldName::Password), Some(&FieldValue::Bool(false)));
	}

	#[test]
	fn coercion_failure_skips_the_value_not_the_record() {
		let entry = user_entry(
			"uid=bob,ou=people,dc=example",
			&[("uid", &["bob"]), ("entryUUID", &["not-a-uuid"])],
		);
		let record = record_from_entry(&entry, RecordType::User, &schema()).unwrap();
		assert_eq!(record.field(FieldName::Guid), None);
		assert_eq!(record.uid(), "bob");

		let entry = user_entry(
			"uid=bob,ou=people,dc=example",
			&[("uid", &["bob"]), ("entryUUID", &["6FB75CFB-F2A9-43C1-A8A7-0C5APBAD5DBC"])],
		);
		// Contains a non-hex character, so it is skipped too.
		let record = record_from_entry(&entry, RecordType::User, &schema()).unwrap();
		assert_eq!(record.field(FieldName::Guid), None);

		let entry = user_entry(
			"uid=bob,ou=people,dc=example",
			&[("uid", &["bob"]), ("entryUUID", &["6FB75CFB-F2A9-43C1-A8A7-0C5A9BAD5DBC"])],
		);
		let record = record_from_entry(&entry, RecordType::User, &schema()).unwrap();
		assert_eq!(
			record.field(FieldName::Guid).and_then(FieldValue::as_text),
			Some("6fb75cfb-f2a9-43c1-a8a7-0c5a9bad5dbc")
		);
	}
}
