//! Small distinguished-name helpers.
//!
//! Only the operations the service needs: splitting a DN into components,
//! normalizing case and whitespace for comparison, suffix containment, and
//! reading the head RDN. Escaped separators (`\,`, `\+`, `\=`) are
//! respected; full RFC 4514 parsing is out of scope.

/// Split a DN into its RDN components, honoring escaped commas. Components
/// are trimmed of surrounding whitespace.
pub(crate) fn explode(dn: &str) -> Vec<String> {
	let mut components = Vec::new();
	let mut current = String::new();
	let mut escaped = false;
	for c in dn.chars() {
		if escaped {
			current.push(c);
			escaped = false;
		} else if c == '\\' {
			current.push(c);
			escaped = true;
		} else if c == ',' {
			components.push(current.trim().to_owned());
			current.clear();
		} else {
			current.push(c);
		}
	}
	if !current.trim().is_empty() || !components.is_empty() {
		components.push(current.trim().to_owned());
	}
	components
}

/// Normalize one RDN component: trim around the `=` separator and collapse
/// runs of whitespace inside attribute and value.
fn normalize_component(component: &str) -> String {
	match split_unescaped(component, '=') {
		Some((attribute, value)) => {
			format!("{}={}", collapse_whitespace(attribute), collapse_whitespace(value))
		}
		None => collapse_whitespace(component),
	}
}

/// Collapse interior whitespace runs to single spaces and trim the ends.
fn collapse_whitespace(s: &str) -> String {
	s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split at the first occurrence of `separator` that is not escaped by a
/// backslash.
fn split_unescaped(s: &str, separator: char) -> Option<(&str, &str)> {
	let mut escaped = false;
	for (i, c) in s.char_indices() {
		if escaped {
			escaped = false;
		} else if c == '\\' {
			escaped = true;
		} else if c == separator {
			return Some((&s[..i], &s[i + c.len_utf8()..]));
		}
	}
	None
}

/// Normalize a DN for comparison: lowercase, single-comma separators, no
/// stray whitespace.
pub(crate) fn normalize(dn: &str) -> String {
	explode(&dn.to_lowercase())
		.iter()
		.map(|component| normalize_component(component))
		.collect::<Vec<_>>()
		.join(",")
}

/// Whether `child` sits at or below `parent`. Both are component lists as
/// produced by [`explode`] on normalized input.
pub(crate) fn contained_in(child: &[String], parent: &[String]) -> bool {
	child.len() >= parent.len() && child[child.len() - parent.len()..] == *parent
}

/// The attribute and value of the head RDN of a DN, with escape sequences
/// removed from the value. Multi-valued RDNs yield their first pair.
pub(crate) fn first_rdn(dn: &str) -> Option<(String, String)> {
	let components = explode(dn);
	let head = components.first()?;
	let head = split_unescaped(head, '+').map_or(head.as_str(), |(first, _)| first);
	let (attribute, value) = split_unescaped(head, '=')?;
	let attribute = collapse_whitespace(attribute);
	let value = unescape(collapse_whitespace(value).as_str());
	if attribute.is_empty() || value.is_empty() {
		return None;
	}
	Some((attribute, value))
}

/// Remove backslash escapes, keeping the escaped character literally.
fn unescape(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	let mut escaped = false;
	for c in s.chars() {
		if escaped {
			out.push(c);
			escaped = false;
		} else if c == '\\' {
			escaped = true;
		} else {
			out.push(c);
		}
	}
	out
}
