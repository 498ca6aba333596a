//! Group membership resolution.
//!
//! A group entry carries its members as DNs. Fetching them one by one
//! costs a round trip per member; instead the member DNs are grouped by
//! the record type their DN classifies under, their head RDN values are
//! turned into equality matches, and each group is fetched with a few
//! OR-compound searches. Only DNs that defy classification fall back to a
//! direct per-DN lookup.

use std::collections::HashMap;

use crate::{
	dn,
	entry::{record_type_for_dn, Record},
	error::Error,
	filter::{Expression, Operand},
	schema::{FieldName, RecordType, Schema},
	service::DirectoryService,
};

/// Maximum number of member matches bundled into one OR-compound search.
const MEMBER_BATCH_SIZE: usize = 500;

/// How a set of member DNs will be fetched.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MemberLookupPlan {
	/// Per record type, the (field, value) matches to batch, in
	/// first-seen order.
	pub(crate) grouped: Vec<(RecordType, Vec<(FieldName, String)>)>,
	/// DNs that could not be grouped and are fetched individually.
	pub(crate) direct: Vec<String>,
}

/// Group member DNs by record type, extracting the head RDN of each as a
/// (field, value) match via the attribute reverse index. A DN whose type
/// or head attribute cannot be resolved goes on the direct list.
pub(crate) fn plan_member_lookup(
	base_dn: &str,
	schema: &Schema,
	member_dns: &[String],
) -> MemberLookupPlan {
	let mut plan = MemberLookupPlan::default();
	for member_dn in member_dns {
		let classified = record_type_for_dn(base_dn, schema.record_type_schemas(), member_dn)
			.and_then(|record_type| {
				let (attribute, value) = dn::first_rdn(&member_dn.to_lowercase())?;
				let field = schema.field_for_attribute(&attribute)?;
				Some((record_type, field, value))
			});
		match classified {
			Some((record_type, field, value)) => {
				match plan.grouped.iter_mut().find(|(existing, _)| *existing == record_type) {
					Some((_, pairs)) => pairs.push((field, value)),
					None => plan.grouped.push((record_type, vec![(field, value)])),
				}
			}
			None => plan.direct.push(member_dn.clone()),
		}
	}
	plan
}

impl DirectoryService {
	/// Resolve the members of a group record.
	///
	/// Non-group records have no members. Duplicate results from the
	/// batched and direct paths collapse by record identity.
	///
	/// # Errors
	/// As for [`DirectoryService::find_records`].
	pub async fn members(&self, group: &Record) -> Result<Vec<Record>, Error> {
		if group.record_type != RecordType::Group {
			return Ok(Vec::new());
		}

		let plan = plan_member_lookup(self.base_dn(), self.schema(), group.member_dns());
		let mut members: HashMap<(RecordType, String), Record> = HashMap::new();

		for (record_type, pairs) in &plan.grouped {
			for batch in pairs.chunks(MEMBER_BATCH_SIZE) {
				let expression = Expression::Compound {
					expressions: batch
						.iter()
						.map(|(field, value)| Expression::equals(*field, value.clone()))
						.collect(),
					operand: Operand::Or,
				};
				for record in
					self.find_records(&expression, Some(&[*record_type]), None, None).await?
				{
					let (record_type, uid) = record.identity();
					members.entry((record_type, uid.to_owned())).or_insert(record);
				}
			}
		}

		for member_dn in &plan.direct {
			// A literal plus would otherwise read as a multi-valued RDN.
			let escaped = member_dn.replace('+', "\\+");
			if let Some(record) = self.record_with_dn(&escaped).await? {
				let (record_type, uid) = record.identity();
				members.entry((record_type, uid.to_owned())).or_insert(record);
			}
		}

		Ok(members.into_values().collect())
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{plan_member_lookup, MEMBER_BATCH_SIZE};
	use crate::schema::{FieldName, RecordType, Schema, SchemaConfig};

	/// The default schema rooted at `dc=example,dc=org`.
	fn schema() -> Schema {
		Schema::new(SchemaConfig::default()).unwrap()
	}

	#[test]
	fn classifiable_members_batch_by_record_type() {
		let member_dns: Vec<String> = (0..1200)
			.map(|i| format!("uid=user{i},ou=people,dc=example,dc=org"))
			.collect();
		let plan = plan_member_lookup("dc=example,dc=org", &schema(), &member_dns);

		assert!(plan.direct.is_empty());
		assert_eq!(plan.grouped.len(), 1);
		let (record_type, pairs) = &plan.grouped[0];
		assert_eq!(*record_type, RecordType::User);
		assert_eq!(pairs.len(), 1200);
		assert_eq!(pairs[0], (FieldName::Uid, "user0".to_owned()));

		// 1200 members resolve in three batched searches: 500, 500, 200.
		let batches: Vec<usize> =
			pairs.chunks(MEMBER_BATCH_SIZE).map(<[(FieldName, String)]>::len).collect();
		assert_eq!(batches, vec![500, 500, 200]);
	}

	#[test]
	fn unclassifiable_members_fall_back_to_direct_lookup() {
		let member_dns = vec![
			// Unknown subtree, so the DN does not classify.
			"uid=printer1,ou=devices,dc=example,dc=org".to_owned(),
			"uid=printer2,ou=devices,dc=example,dc=org".to_owned(),
		];
		let plan = plan_member_lookup("dc=example,dc=org", &schema(), &member_dns);
		assert!(plan.grouped.is_empty());
		assert_eq!(plan.direct, member_dns);
	}

	#[test]
	fn unmapped_head_attribute_falls_back_to_direct_lookup() {
		// Classifies as a user, but "ou" is not a mapped attribute.
		let member_dns = vec!["ou=oddball,ou=people,dc=example,dc=org".to_owned()];
		let plan = plan_member_lookup("dc=example,dc=org", &schema(), &member_dns);
		assert!(plan.grouped.is_empty());
		assert_eq!(plan.direct, member_dns);
	}

	#[test]
	fn mixed_types_group_separately_in_first_seen_order() {
		let member_dns = vec![
			"cn=admins,ou=groups,dc=example,dc=org".to_owned(),
			"uid=alice,ou=people,dc=example,dc=org".to_owned(),
			"uid=bob,ou=people,dc=example,dc=org".to_owned(),
		];
		let plan = plan_member_lookup("dc=example,dc=org", &schema(), &member_dns);
		assert!(plan.direct.is_empty());
		assert_eq!(plan.grouped.len(), 2);
		assert_eq!(plan.grouped[0].0, RecordType::Group);
		// cn reverse-maps to uid, its first mapped field.
		assert_eq!(plan.grouped[0].1, vec![(FieldName::Uid, "admins".to_owned())]);
		assert_eq!(plan.grouped[1].0, RecordType::User);
		assert_eq!(plan.grouped[1].1.len(), 2);
	}

	#[test]
	fn member_values_are_lowercased_and_unescaped() {
		let member_dns = vec![r"cn=Smith\, Bob,ou=groups,dc=example,dc=org".to_owned()];
		let plan = plan_member_lookup("dc=example,dc=org", &schema(), &member_dns);
		assert_eq!(plan.grouped[0].1, vec![(FieldName::Uid, "smith, bob".to_owned())]);
	}
}
