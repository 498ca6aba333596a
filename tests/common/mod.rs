use std::error::Error;

use ldap3::LdapConnAsync;

pub const BASE_DN: &str = "dc=example,dc=org";

pub async fn ldap_connect() -> Result<ldap3::Ldap, Box<dyn Error>> {
	let (conn, mut ldap) = LdapConnAsync::new("ldap://localhost:1389").await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			panic!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind("cn=admin,dc=example,dc=org", "adminpassword").await?;
	Ok(ldap)
}

pub async fn ldap_add_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("ou={ou},{BASE_DN}"),
		vec![("objectClass", ["organizationalUnit"].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("ou={ou},{BASE_DN}")).await?.success()?;
	Ok(())
}

pub async fn ldap_add_user(
	ldap: &mut ldap3::Ldap,
	uid: &str,
	cn: &str,
	password: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("uid={uid},ou=people,{BASE_DN}"),
		vec![
			("objectClass", ["inetOrgPerson"].into()),
			("uid", [uid].into()),
			("cn", [cn].into()),
			("sn", [cn].into()),
			("userPassword", [password].into()),
		],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_user(ldap: &mut ldap3::Ldap, uid: &str) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("uid={uid},ou=people,{BASE_DN}")).await?.success()?;
	Ok(())
}

pub async fn ldap_add_group(
	ldap: &mut ldap3::Ldap,
	cn: &str,
	member_dns: &[String],
) -> Result<(), Box<dyn Error>> {
	let members: std::collections::HashSet<&str> =
		member_dns.iter().map(String::as_str).collect();
	ldap.add(
		&format!("cn={cn},ou=groups,{BASE_DN}"),
		vec![
			("objectClass", ["groupOfNames"].into()),
			("cn", [cn].into()),
			("member", members),
		],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_group(ldap: &mut ldap3::Ldap, cn: &str) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("cn={cn},ou=groups,{BASE_DN}")).await?.success()?;
	Ok(())
}
