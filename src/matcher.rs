use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::RwLock;

use http::Method;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{ApiDefinition, Endpoint};

// `{id}`-style wildcard segments in an endpoint path.
static WILDCARD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{[^/{}]+\}").expect("wildcard pattern"));

// Endpoint paths are static data that rarely changes, so compiled patterns
// are cached for the request hot path.
static PATTERNS: Lazy<RwLock<HashMap<String, Regex>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Compile an endpoint path into its matching regex: literal segments are
/// escaped, each `{id}` wildcard matches one path segment, and the match is
/// anchored at the end of the request path.
fn compile(path: &str) -> Regex {
	let mut pattern = String::new();
	let mut last = 0;
	for m in WILDCARD.find_iter(path) {
		pattern.push_str(&regex::escape(&path[last..m.start()]));
		pattern.push_str("[^/]+");
		last = m.end();
	}
	pattern.push_str(&regex::escape(&path[last..]));
	pattern.push('$');
	Regex::new(&pattern).expect("endpoint path pattern")
}

fn path_matches(endpoint_path: &str, request_path: &str) -> bool {
	if let Some(re) = PATTERNS
		.read()
		.expect("matcher cache poisoned")
		.get(endpoint_path)
	{
		return re.is_match(request_path);
	}
	let re = compile(endpoint_path);
	let matched = re.is_match(request_path);
	PATTERNS
		.write()
		.expect("matcher cache poisoned")
		.insert(endpoint_path.to_string(), re);
	matched
}

/// Find the API definition and endpoint serving `method path`, scanning the
/// snapshot in its lexicographic `api_id` order so ties resolve the same way
/// on every node. `None` means 404.
pub fn match_request(
	apis: &BTreeMap<String, ApiDefinition>,
	method: &Method,
	path: &str,
) -> Option<(ApiDefinition, Endpoint)> {
	for api in apis.values() {
		for endpoint in api.default_endpoints() {
			if endpoint.method == *method && path_matches(&endpoint.path, path) {
				return Some((api.clone(), endpoint.clone()));
			}
		}
	}
	None
}
