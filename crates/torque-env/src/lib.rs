#![deny(clippy::all)]

//! Environment variable selection for hashing.
//!
//! Tasks declare the variables their output depends on as literal names or
//! wildcard patterns. On top of the declared set, two built-in rules always
//! apply to the global hash: a fixed allowlist, and any variable whose name
//! contains the `THASH` magic substring. Both are part of the hashing
//! protocol rather than configuration.

use std::{
    collections::HashMap,
    env,
    ops::{Deref, DerefMut},
};

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Variables that contribute to the global hash whenever they are set.
pub const DEFAULT_ENV_VARS: [&str; 1] = ["VERCEL_ANALYTICS_ID"];

/// Any variable whose name contains this substring contributes to the global
/// hash whenever it is set.
const HASH_MARKER: &str = "THASH";

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Failed to parse regex: {0}")]
    Regex(#[from] regex::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnvironmentVariableMap(HashMap<String, String>);

/// A list of `NAME=value` strings, sorted by name.
pub type EnvironmentVariablePairs = Vec<String>;

// BySource separates out variables by whether they were named explicitly or
// picked up by a built-in matcher. Only used for reporting; the hash input is
// the composite map.
#[derive(Debug, Default, Serialize)]
pub struct BySource {
    pub explicit: EnvironmentVariableMap,
    pub matching: EnvironmentVariableMap,
}

#[derive(Debug, Default, Serialize)]
pub struct DetailedMap {
    pub all: EnvironmentVariableMap,
    pub by_source: BySource,
}

/// The inclusions and exclusions discovered from a set of wildcard patterns.
/// Kept separate so that user exclusions keep primacy over inferred
/// inclusions.
#[derive(Debug)]
pub struct WildcardMaps {
    pub inclusions: EnvironmentVariableMap,
    pub exclusions: EnvironmentVariableMap,
}

impl WildcardMaps {
    fn resolve(self) -> EnvironmentVariableMap {
        let mut output = self.inclusions;
        output.difference(&self.exclusions);
        output
    }
}

impl From<HashMap<String, String>> for EnvironmentVariableMap {
    fn from(map: HashMap<String, String>) -> Self {
        EnvironmentVariableMap(map)
    }
}

impl Deref for EnvironmentVariableMap {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EnvironmentVariableMap {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl EnvironmentVariableMap {
    /// Snapshot of the current process environment.
    pub fn infer() -> Self {
        EnvironmentVariableMap(env::vars().collect())
    }

    pub fn into_inner(self) -> HashMap<String, String> {
        self.0
    }

    /// `NAME=value` pairs sorted by name. Sorting here is what makes the
    /// resulting hash insensitive to map iteration order.
    pub fn to_hashable(&self) -> EnvironmentVariablePairs {
        let mut pairs: Vec<_> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        pairs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.keys().cloned().collect();
        names.sort();
        names
    }

    // Adds another map into `self`, overwriting values that already exist.
    pub fn union(&mut self, another: &EnvironmentVariableMap) {
        for (key, value) in &another.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    // Removes another map's keys from `self`.
    pub fn difference(&mut self, another: &EnvironmentVariableMap) {
        for key in another.0.keys() {
            self.0.remove(key);
        }
    }

    fn wildcard_map_from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<WildcardMaps, regex::Error> {
        let mut output = WildcardMaps {
            inclusions: EnvironmentVariableMap::default(),
            exclusions: EnvironmentVariableMap::default(),
        };

        let mut include_patterns = Vec::new();
        let mut exclude_patterns = Vec::new();

        for wildcard_pattern in wildcard_patterns {
            let wildcard_pattern = wildcard_pattern.as_ref();
            if let Some(rest) = wildcard_pattern.strip_prefix('!') {
                exclude_patterns.push(wildcard_to_regex_pattern(rest));
            } else if wildcard_pattern.starts_with("\\!") {
                include_patterns.push(wildcard_to_regex_pattern(&wildcard_pattern[1..]));
            } else {
                include_patterns.push(wildcard_to_regex_pattern(wildcard_pattern));
            }
        }

        let include_regex = Regex::new(&format!("^({})$", include_patterns.join("|")))?;
        let exclude_regex = Regex::new(&format!("^({})$", exclude_patterns.join("|")))?;
        for (env_var, env_value) in &self.0 {
            if !include_patterns.is_empty() && include_regex.is_match(env_var) {
                output.inclusions.insert(env_var.clone(), env_value.clone());
            }
            if !exclude_patterns.is_empty() && exclude_regex.is_match(env_var) {
                output.exclusions.insert(env_var.clone(), env_value.clone());
            }
        }

        Ok(output)
    }

    /// Returns the subset of the environment matching the wildcard patterns.
    pub fn from_wildcards(
        &self,
        wildcard_patterns: &[impl AsRef<str>],
    ) -> Result<EnvironmentVariableMap, regex::Error> {
        if wildcard_patterns.is_empty() {
            return Ok(EnvironmentVariableMap::default());
        }

        let resolved_set = self.wildcard_map_from_wildcards(wildcard_patterns)?;
        Ok(resolved_set.resolve())
    }

    /// Returns the unresolved inclusion and exclusion sets for the wildcard
    /// patterns, so the caller can apply exclusions after merging in other
    /// sources.
    pub fn wildcard_map_from_wildcards_unresolved(
        &self,
        wildcard_patterns: &[String],
    ) -> Result<WildcardMaps, regex::Error> {
        if wildcard_patterns.is_empty() {
            return Ok(WildcardMaps {
                inclusions: EnvironmentVariableMap::default(),
                exclusions: EnvironmentVariableMap::default(),
            });
        }

        self.wildcard_map_from_wildcards(wildcard_patterns)
    }

    /// Every variable whose name contains the `THASH` marker, keyed off the
    /// actual environment rather than any declaration.
    pub fn hash_marker_vars(&self) -> EnvironmentVariableMap {
        EnvironmentVariableMap(
            self.0
                .iter()
                .filter(|(name, _)| name.contains(HASH_MARKER))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )
    }
}

/// Fills in an empty value for every declared literal (non-wildcard,
/// non-negated) name that is not set in the environment. Declaring a
/// dependency on an unset variable must still pin its absence into the hash.
pub fn ensure_declared_literals(map: &mut EnvironmentVariableMap, declared: &[String]) {
    for pattern in declared {
        if pattern.contains('*') || pattern.starts_with('!') {
            continue;
        }
        let name = pattern.strip_prefix('\\').unwrap_or(pattern);
        map.entry(name.to_string()).or_default();
    }
}

const WILDCARD: char = '*';
const WILDCARD_ESCAPE: char = '\\';
const REGEX_WILDCARD_SEGMENT: &str = ".*";

fn wildcard_to_regex_pattern(pattern: &str) -> String {
    let mut regex_string = Vec::new();
    let mut previous_index = 0;
    let mut previous_char: Option<char> = None;

    for (i, char) in pattern.chars().enumerate() {
        if char == WILDCARD {
            if previous_char == Some(WILDCARD_ESCAPE) {
                // Literal `*`: replace the trailing `\*` with `*` before
                // adding the segment.
                regex_string.push(regex::escape(&format!(
                    "{}*",
                    &pattern[previous_index..(i - 1)]
                )));
            } else {
                // Static segment since the last wildcard, possibly empty.
                regex_string.push(regex::escape(&pattern[previous_index..i]));

                // Collapse adjacent dynamic segments.
                if let Some(last_segment) = regex_string.last() {
                    if last_segment != REGEX_WILDCARD_SEGMENT {
                        regex_string.push(REGEX_WILDCARD_SEGMENT.to_string());
                    }
                }
            }

            previous_index = i + 1;
        }
        previous_char = Some(char);
    }

    regex_string.push(regex::escape(&pattern[previous_index..]));

    regex_string.join("")
}

/// Resolves the environment contribution to the global hash: user-declared
/// globals, the default allowlist, and the `THASH` marker rule, with user
/// exclusions applied over all of it.
pub fn get_global_hashable_env_vars(
    env_at_execution_start: &EnvironmentVariableMap,
    global_env: &[String],
) -> Result<DetailedMap, Error> {
    let default_env_var_map = env_at_execution_start.from_wildcards(&DEFAULT_ENV_VARS[..])?;
    let marker_env_var_map = env_at_execution_start.hash_marker_vars();

    let user_env_var_set =
        env_at_execution_start.wildcard_map_from_wildcards_unresolved(global_env)?;

    let mut all_env_var_map = EnvironmentVariableMap::default();
    all_env_var_map.union(&user_env_var_set.inclusions);
    ensure_declared_literals(&mut all_env_var_map, global_env);
    all_env_var_map.union(&default_env_var_map);
    all_env_var_map.union(&marker_env_var_map);
    all_env_var_map.difference(&user_env_var_set.exclusions);

    let mut explicit_env_var_map = EnvironmentVariableMap::default();
    explicit_env_var_map.union(&user_env_var_set.inclusions);
    ensure_declared_literals(&mut explicit_env_var_map, global_env);
    explicit_env_var_map.difference(&user_env_var_set.exclusions);

    let mut matching_env_var_map = EnvironmentVariableMap::default();
    matching_env_var_map.union(&default_env_var_map);
    matching_env_var_map.union(&marker_env_var_map);
    matching_env_var_map.difference(&explicit_env_var_map);

    Ok(DetailedMap {
        all: all_env_var_map,
        by_source: BySource {
            explicit: explicit_env_var_map,
            matching: matching_env_var_map,
        },
    })
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn test_env() -> EnvironmentVariableMap {
        EnvironmentVariableMap(
            [
                ("SOME_ENV_VAR", "hi"),
                ("SOMETHING_THASH_YES", "hi"),
                ("VERCEL_ANALYTICS_ID", "analytics"),
                ("DECLARED", "declared-value"),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        )
    }

    #[test_case("LITERAL_\\*", "LITERAL_\\*" ; "literal star")]
    #[test_case("\\*LEADING", "\\*LEADING" ; "leading literal star")]
    #[test_case("\\!LEADING", "\\\\!LEADING" ; "leading literal bang")]
    #[test_case("!LEADING", "!LEADING" ; "leading bang")]
    #[test_case("*LEADING", ".*LEADING" ; "leading star")]
    fn test_wildcard_to_regex_pattern(pattern: &str, expected: &str) {
        let actual = super::wildcard_to_regex_pattern(pattern);
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_global_hashable_env_selection() {
        let env = test_env();
        let detailed = get_global_hashable_env_vars(&env, &["DECLARED".to_string()]).unwrap();

        let mut names = detailed.all.names();
        names.sort();
        assert_eq!(
            names,
            vec!["DECLARED", "SOMETHING_THASH_YES", "VERCEL_ANALYTICS_ID"]
        );
        assert!(detailed.by_source.explicit.contains_key("DECLARED"));
        assert!(detailed
            .by_source
            .matching
            .contains_key("SOMETHING_THASH_YES"));
    }

    #[test]
    fn test_marker_var_only_when_set() {
        let mut env = test_env();
        env.remove("SOMETHING_THASH_YES");
        let detailed = get_global_hashable_env_vars(&env, &[]).unwrap();
        assert!(!detailed.all.contains_key("SOMETHING_THASH_YES"));
    }

    #[test]
    fn test_declared_literal_pins_absence() {
        let env = EnvironmentVariableMap::default();
        let detailed = get_global_hashable_env_vars(&env, &["UNSET_VAR".to_string()]).unwrap();
        assert_eq!(detailed.all.get("UNSET_VAR").map(String::as_str), Some(""));
        assert_eq!(detailed.all.to_hashable(), vec!["UNSET_VAR=".to_string()]);
    }

    #[test]
    fn test_exclusion_beats_marker() {
        let env = test_env();
        let detailed =
            get_global_hashable_env_vars(&env, &["!SOMETHING_THASH_YES".to_string()]).unwrap();
        assert!(!detailed.all.contains_key("SOMETHING_THASH_YES"));
    }

    #[test]
    fn test_to_hashable_is_sorted() {
        let env = test_env();
        let pairs = env.to_hashable();
        let mut sorted = pairs.clone();
        sorted.sort();
        assert_eq!(pairs, sorted);
    }
}
